//! Segmented write-ahead log.
//!
//! The WAL is an append-only sequence of length-prefixed, CRC-protected
//! records grouped into segment files named `{seq:016x}-{index:016x}.wal`,
//! where `seq` is the segment sequence number and `index` is the first
//! raft index that may appear in the file. Record CRCs chain across the
//! whole log: each record's CRC is computed over its body seeded with the
//! previous record's CRC, and every segment opens with a `crc` record
//! carrying the running value forward.
//!
//! # Record types
//!
//! - `metadata`: node and cluster identity, written at each segment head
//! - `hard_state`: raft term/vote/commit
//! - `entry`: one raft log entry
//! - `snapshot_pointer`: log position of a completed state snapshot
//! - `crc`: rolling checksum carrier at segment boundaries
//!
//! A torn record at the tail of the last segment is repairable by
//! truncation; a CRC mismatch anywhere is not.

use crate::raft::types::{Entry, HardState};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal io: {0}")]
    Io(#[from] std::io::Error),

    /// The tail record of the last segment is incomplete. Recoverable
    /// via [`Wal::repair`].
    #[error("torn record at tail of {path}")]
    TornTail { path: PathBuf },

    /// A record failed its checksum. Unrecoverable.
    #[error("crc mismatch in {path} at offset {offset}")]
    CrcMismatch { path: PathBuf, offset: u64 },

    /// Segment sequence numbers are not continuous.
    #[error("gap in wal segment sequence after {seq:016x}")]
    GapInSequence { seq: u64 },

    /// No segment covers the requested replay start index.
    #[error("no wal segment covers index {index}")]
    NotFound { index: u64 },

    #[error("wal encode: {0}")]
    Encode(#[from] bincode::Error),
}

/// Result alias for WAL operations.
pub type Result<T> = std::result::Result<T, WalError>;

/// Identity stamped at the head of every segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalMetadata {
    pub node_id: u64,
    pub cluster_id: u64,
}

/// Log position of a completed snapshot, durably recorded in the WAL so
/// replay knows where entries become authoritative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPointer {
    pub index: u64,
    pub term: u64,
}

/// On-disk record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Metadata = 1,
    HardState = 2,
    Entry = 3,
    SnapshotPointer = 4,
    Crc = 5,
}

impl RecordKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Metadata),
            2 => Some(Self::HardState),
            3 => Some(Self::Entry),
            4 => Some(Self::SnapshotPointer),
            5 => Some(Self::Crc),
            _ => None,
        }
    }
}

/// A decoded record.
#[derive(Debug)]
enum Record {
    Metadata(WalMetadata),
    HardState(HardState),
    Entry(Entry),
    SnapshotPointer(SnapshotPointer),
    Crc,
}

fn wal_name(seq: u64, index: u64) -> String {
    format!("{seq:016x}-{index:016x}.wal")
}

fn parse_wal_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(".wal")?;
    let (seq, index) = stem.split_at_checked(16)?;
    let index = index.strip_prefix('-')?;
    if index.len() != 16 {
        return None;
    }
    Some((
        u64::from_str_radix(seq, 16).ok()?,
        u64::from_str_radix(index, 16).ok()?,
    ))
}

/// Sorted `(seq, first_index, path)` triples for every well-formed
/// segment in `dir`.
fn scan_segments(dir: &Path) -> Result<Vec<(u64, u64, PathBuf)>> {
    let mut segments = Vec::new();
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        let path = dirent.path();
        if let Some((seq, index)) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_wal_name)
        {
            segments.push((seq, index, path));
        }
    }
    segments.sort_unstable_by_key(|(seq, _, _)| *seq);
    for pair in segments.windows(2) {
        if pair[1].0 != pair[0].0 + 1 {
            return Err(WalError::GapInSequence { seq: pair[0].0 });
        }
    }
    Ok(segments)
}

/// Streaming record reader with chained CRC verification.
struct RecordReader {
    reader: BufReader<File>,
    path: PathBuf,
    /// Rolling CRC carried in from the previous segment. `None` until the
    /// first record is read: segments released by a snapshot may no longer
    /// exist, so the chain restarts by adopting the `crc` record a segment
    /// head carries.
    crc: Option<u32>,
    /// Byte offset of the last fully decoded record boundary.
    offset: u64,
}

impl RecordReader {
    fn new(path: PathBuf, crc: Option<u32>) -> Result<Self> {
        let file = File::open(&path)?;
        Ok(Self {
            reader: BufReader::new(file),
            path,
            crc,
            offset: 0,
        })
    }

    /// Decode the next record, or `Ok(None)` at a clean end of file.
    fn next(&mut self) -> Result<Option<Record>> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        let mut body = vec![0u8; len];
        let torn = |e: &std::io::Error| e.kind() == ErrorKind::UnexpectedEof;
        match self.reader.read_exact(&mut crc_buf) {
            Ok(()) => {}
            Err(e) if torn(&e) => {
                return Err(WalError::TornTail {
                    path: self.path.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        }
        match self.reader.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if torn(&e) => {
                return Err(WalError::TornTail {
                    path: self.path.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        }

        let expected = u32::from_le_bytes(crc_buf);
        match self.crc {
            Some(crc) => {
                let mut hasher = crc32fast::Hasher::new_with_initial(crc);
                hasher.update(&body);
                if hasher.finalize() != expected {
                    return Err(WalError::CrcMismatch {
                        path: self.path.clone(),
                        offset: self.offset,
                    });
                }
            }
            // First record after a chain break: adopt the stored value.
            None => {}
        }
        self.crc = Some(expected);
        self.offset += 8 + len as u64;

        let kind = body.first().and_then(|b| RecordKind::from_u8(*b));
        let payload = &body[1..];
        let record = match kind {
            Some(RecordKind::Metadata) => Record::Metadata(bincode::deserialize(payload)?),
            Some(RecordKind::HardState) => Record::HardState(bincode::deserialize(payload)?),
            Some(RecordKind::Entry) => Record::Entry(bincode::deserialize(payload)?),
            Some(RecordKind::SnapshotPointer) => {
                Record::SnapshotPointer(bincode::deserialize(payload)?)
            }
            Some(RecordKind::Crc) => Record::Crc,
            None => {
                return Err(WalError::CrcMismatch {
                    path: self.path.clone(),
                    offset: self.offset,
                })
            }
        };
        Ok(Some(record))
    }
}

/// The write-ahead log.
#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    metadata: WalMetadata,
    /// Open segment, buffered.
    writer: BufWriter<File>,
    /// Sequence number of the open segment.
    seq: u64,
    /// Bytes written to the open segment.
    segment_size: u64,
    /// Segment size at which `append` cuts to a new file.
    segment_max_bytes: u64,
    /// Rolling CRC across all records ever written.
    crc: u32,
    /// Index of the last appended entry.
    last_index: u64,
    /// Last hard state written, rewritten at each cut.
    last_hard_state: HardState,
}

impl Wal {
    /// Create a fresh WAL in an empty directory.
    pub fn create(dir: &Path, metadata: WalMetadata, segment_max_bytes: u64) -> Result<Wal> {
        std::fs::create_dir_all(dir)?;
        if !scan_segments(dir)?.is_empty() {
            return Err(WalError::Io(std::io::Error::new(
                ErrorKind::AlreadyExists,
                "wal directory is not empty",
            )));
        }
        let path = dir.join(wal_name(0, 0));
        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        let mut wal = Wal {
            dir: dir.to_path_buf(),
            metadata,
            writer: BufWriter::new(file),
            seq: 0,
            segment_size: 0,
            segment_max_bytes,
            crc: 0,
            last_index: 0,
            last_hard_state: HardState::default(),
        };
        wal.write_segment_head()?;
        wal.sync()?;
        Ok(wal)
    }

    /// Open an existing WAL and replay records for entries after
    /// `snap.index`.
    ///
    /// Returns the WAL positioned for appending, the last hard state, and
    /// the replayed entries with monotonically increasing indices starting
    /// at `snap.index + 1`. Entries overwritten by a later conflicting
    /// append win, as they did in the live log.
    pub fn open(
        dir: &Path,
        snap: SnapshotPointer,
        segment_max_bytes: u64,
    ) -> Result<(Wal, Option<HardState>, Vec<Entry>)> {
        let segments = scan_segments(dir)?;
        if segments.is_empty() {
            return Err(WalError::NotFound { index: snap.index });
        }
        // Last segment whose first index is at or below the replay start.
        let start = segments
            .iter()
            .rposition(|(_, first, _)| *first <= snap.index + 1)
            .ok_or(WalError::NotFound { index: snap.index })?;

        let mut crc: Option<u32> = None;
        let mut hard_state: Option<HardState> = None;
        let mut metadata = WalMetadata::default();
        let mut entries: Vec<Entry> = Vec::new();
        let last = segments.len() - 1;

        for (pos, (_seq, _first, path)) in segments.iter().enumerate() {
            let mut reader = RecordReader::new(path.clone(), crc)?;
            loop {
                match reader.next() {
                    Ok(Some(record)) => match record {
                        Record::Metadata(m) => metadata = m,
                        Record::HardState(hs) => hard_state = Some(hs),
                        Record::SnapshotPointer(_) => {}
                        Record::Crc => {}
                        Record::Entry(e) => {
                            if pos < start || e.index <= snap.index {
                                continue;
                            }
                            // A conflicting re-append truncates the suffix.
                            let offset = e.index - snap.index - 1;
                            entries.truncate(offset as usize);
                            entries.push(e);
                        }
                    },
                    Ok(None) => break,
                    // Torn tails are only tolerable in the last segment,
                    // and only after Repair has run.
                    Err(e) => return Err(e),
                }
            }
            crc = reader.crc;
        }

        let (seq, _first, path) = segments[last].clone();
        let file = OpenOptions::new().append(true).open(&path)?;
        let segment_size = file.metadata()?.len();
        let last_index = entries.last().map(|e| e.index).unwrap_or(snap.index);
        let wal = Wal {
            dir: dir.to_path_buf(),
            metadata,
            writer: BufWriter::new(file),
            seq,
            segment_size,
            segment_max_bytes,
            crc: crc.unwrap_or(0),
            last_index,
            last_hard_state: hard_state.unwrap_or_default(),
        };
        Ok((wal, hard_state, entries))
    }

    /// Truncate a torn record off the tail of the last segment, saving
    /// the damaged bytes to `<name>.broken`. Returns `true` when a
    /// repair was performed.
    ///
    /// Only an unexpected end-of-file is repairable; a CRC mismatch
    /// means the damage is not confined to the tail and is fatal.
    pub fn repair(dir: &Path) -> Result<bool> {
        let segments = scan_segments(dir)?;
        let mut crc: Option<u32> = None;
        for (pos, (_seq, _first, path)) in segments.iter().enumerate() {
            let mut reader = RecordReader::new(path.clone(), crc)?;
            loop {
                match reader.next() {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(WalError::TornTail { .. }) if pos == segments.len() - 1 => {
                        let keep = reader.offset;
                        drop(reader);
                        std::fs::copy(path, path.with_extension("wal.broken"))?;
                        let file = OpenOptions::new().write(true).open(path)?;
                        file.set_len(keep)?;
                        file.sync_all()?;
                        tracing::warn!(path = %path.display(), offset = keep, "repaired torn wal tail");
                        return Ok(true);
                    }
                    Err(e) => return Err(e),
                }
            }
            crc = reader.crc;
        }
        Ok(false)
    }

    /// Append entries and an optional hard state change. The caller
    /// decides the sync boundary; nothing is durable until [`Wal::sync`].
    pub fn append(&mut self, hard_state: Option<&HardState>, entries: &[Entry]) -> Result<()> {
        for entry in entries {
            let payload = bincode::serialize(entry)?;
            self.write_record(RecordKind::Entry, &payload)?;
            self.last_index = entry.index;
        }
        if let Some(hs) = hard_state {
            let payload = bincode::serialize(hs)?;
            self.write_record(RecordKind::HardState, &payload)?;
            self.last_hard_state = *hs;
        }
        if self.segment_size >= self.segment_max_bytes {
            self.cut()?;
        }
        Ok(())
    }

    /// Record the log position of a completed snapshot.
    pub fn save_snapshot_pointer(&mut self, ptr: SnapshotPointer) -> Result<()> {
        let payload = bincode::serialize(&ptr)?;
        self.write_record(RecordKind::SnapshotPointer, &payload)?;
        self.sync()
    }

    /// Flush buffered records and fsync to the platform floor.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Close the current segment at a record boundary and open the next.
    pub fn cut(&mut self) -> Result<()> {
        self.sync()?;
        self.seq += 1;
        let path = self.dir.join(wal_name(self.seq, self.last_index + 1));
        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        self.writer = BufWriter::new(file);
        self.segment_size = 0;
        self.write_segment_head()?;
        // Re-state the hard state so the new segment replays standalone.
        let hs = self.last_hard_state;
        let payload = bincode::serialize(&hs)?;
        self.write_record(RecordKind::HardState, &payload)?;
        self.sync()?;
        tracing::debug!(seq = self.seq, first_index = self.last_index + 1, "cut wal segment");
        Ok(())
    }

    /// Remove segments that only contain entries below `index`. At least
    /// one segment is always retained.
    pub fn release_lock_to(&mut self, index: u64) -> Result<()> {
        let segments = scan_segments(&self.dir)?;
        // The newest segment whose first index is at or below `index`
        // still holds live entries; everything before it does not.
        let Some(keep_from) = segments.iter().rposition(|(_, first, _)| *first <= index) else {
            return Ok(());
        };
        for (_, _, path) in &segments[..keep_from] {
            std::fs::remove_file(path)?;
            tracing::debug!(path = %path.display(), "released wal segment");
        }
        Ok(())
    }

    /// Index of the last appended entry.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    /// Identity stamped on this log.
    pub fn metadata(&self) -> WalMetadata {
        self.metadata
    }

    fn write_segment_head(&mut self) -> Result<()> {
        self.write_record(RecordKind::Crc, &[])?;
        let payload = bincode::serialize(&self.metadata)?;
        self.write_record(RecordKind::Metadata, &payload)?;
        Ok(())
    }

    fn write_record(&mut self, kind: RecordKind, payload: &[u8]) -> Result<()> {
        let mut body = Vec::with_capacity(1 + payload.len());
        body.push(kind as u8);
        body.extend_from_slice(payload);
        let mut hasher = crc32fast::Hasher::new_with_initial(self.crc);
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut frame = BytesMut::with_capacity(8 + body.len());
        frame.put_u32_le(body.len() as u32);
        frame.put_u32_le(crc);
        frame.put_slice(&body);
        self.writer.write_all(&frame)?;
        self.crc = crc;
        self.segment_size += frame.len() as u64;
        Ok(())
    }
}

/// Summary of one WAL segment, for the inspection CLI.
#[derive(Debug)]
pub struct SegmentSummary {
    pub path: PathBuf,
    pub seq: u64,
    pub first_index: u64,
    pub entries: u64,
    pub size_bytes: u64,
}

/// Summarize the segments in `dir` without replaying entry payloads.
pub fn list_segments(dir: &Path) -> Result<Vec<SegmentSummary>> {
    let segments = scan_segments(dir)?;
    let mut crc: Option<u32> = None;
    let mut out = Vec::with_capacity(segments.len());
    for (seq, first_index, path) in segments {
        let size_bytes = std::fs::metadata(&path)?.len();
        let mut reader = RecordReader::new(path.clone(), crc)?;
        let mut entries = 0u64;
        loop {
            match reader.next() {
                Ok(Some(Record::Entry(_))) => entries += 1,
                Ok(Some(_)) => {}
                Ok(None) | Err(WalError::TornTail { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        crc = reader.crc;
        out.push(SegmentSummary {
            path,
            seq,
            first_index,
            entries,
            size_bytes,
        });
    }
    Ok(out)
}

/// Seek-free check that a file ends at a record boundary; used by tests
/// and the inspection CLI.
pub fn verify(dir: &Path) -> Result<()> {
    let segments = scan_segments(dir)?;
    let mut crc: Option<u32> = None;
    for (_, _, path) in segments {
        let mut reader = RecordReader::new(path, crc)?;
        while reader.next()?.is_some() {}
        crc = reader.crc;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_names_round_trip() {
        let name = wal_name(3, 0x10);
        assert_eq!(name, "0000000000000003-0000000000000010.wal");
        assert_eq!(parse_wal_name(&name), Some((3, 0x10)));
        assert_eq!(parse_wal_name("garbage.wal"), None);
        assert_eq!(parse_wal_name("0000000000000003-xyz.wal"), None);
    }
}
