//! Snapshot files.
//!
//! A snapshot is stored as `{term:016x}-{index:016x}.snap`: a 32-bit CRC
//! of the body, a 32-bit length, and the bincode-encoded [`Snapshot`].
//! Loading picks the newest file that passes its checksum; damaged files
//! are renamed aside rather than deleted.

use crate::raft::types::Snapshot;
use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

fn snap_name(term: u64, index: u64) -> String {
    format!("{term:016x}-{index:016x}.snap")
}

fn parse_snap_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(".snap")?;
    let (term, index) = stem.split_at_checked(16)?;
    let index = index.strip_prefix('-')?;
    if index.len() != 16 {
        return None;
    }
    Some((
        u64::from_str_radix(term, 16).ok()?,
        u64::from_str_radix(index, 16).ok()?,
    ))
}

/// Reads and writes snapshot files in one directory.
pub struct Snapshotter {
    dir: PathBuf,
}

impl Snapshotter {
    /// Create a snapshotter over `dir`, creating it if needed.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create snapshot directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Persist a snapshot durably.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let body = bincode::serialize(snapshot).context("failed to encode snapshot")?;
        let path = self
            .dir
            .join(snap_name(snapshot.meta.term, snapshot.meta.index));
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to create snapshot file {}", path.display()))?;
        file.write_all(&crc32fast::hash(&body).to_le_bytes())?;
        file.write_all(&(body.len() as u32).to_le_bytes())?;
        file.write_all(&body)?;
        file.sync_all()
            .with_context(|| format!("failed to sync snapshot file {}", path.display()))?;
        Ok(())
    }

    /// Load the newest intact snapshot (by index), or `None` when the
    /// directory holds none.
    pub fn load(&self) -> Result<Option<Snapshot>> {
        let names = self.snap_names()?;
        for (term, index) in names.into_iter().rev() {
            let path = self.dir.join(snap_name(term, index));
            match read_snapshot(&path) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping damaged snapshot");
                    let aside = path.with_extension("snap.broken");
                    let _ = std::fs::rename(&path, aside);
                }
            }
        }
        Ok(None)
    }

    /// Remove snapshot files older than `keep_index`.
    pub fn cleanup(&self, keep_index: u64) -> Result<usize> {
        let mut removed = 0;
        for (term, index) in self.snap_names()? {
            if index < keep_index {
                std::fs::remove_file(self.dir.join(snap_name(term, index)))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn snap_names(&self) -> Result<Vec<(u64, u64)>> {
        let mut names = Vec::new();
        for dirent in std::fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            if let Some(parsed) = dirent
                .file_name()
                .to_str()
                .and_then(parse_snap_name)
            {
                names.push(parsed);
            }
        }
        // Newest by index, term breaking ties.
        names.sort_unstable_by_key(|(term, index)| (*index, *term));
        Ok(names)
    }
}

/// Decode one snapshot file, verifying its CRC.
pub fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut header = [0u8; 8];
    file.read_exact(&mut header)
        .with_context(|| format!("truncated snapshot header in {}", path.display()))?;
    let crc = u32::from_le_bytes(header[..4].try_into().expect("4-byte slice"));
    let len = u32::from_le_bytes(header[4..].try_into().expect("4-byte slice")) as usize;
    let mut body = vec![0u8; len];
    file.read_exact(&mut body)
        .with_context(|| format!("truncated snapshot body in {}", path.display()))?;
    if crc32fast::hash(&body) != crc {
        bail!("snapshot crc mismatch in {}", path.display());
    }
    bincode::deserialize(&body).context("failed to decode snapshot")
}
