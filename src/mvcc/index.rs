//! In-memory revision index.
//!
//! Maps each user key to its `KeyIndex`: an ordered list of generations,
//! where a generation spans the key's life from a creation to the
//! tombstone that deletes it. The final revision of every generation but
//! the current one is its tombstone. The index answers "what revision of
//! this key is visible at revision R" without touching the value log.

use crate::core::error::{Error, Result};
use crate::mvcc::revision::Revision;
use crate::mvcc::KeyRange;
use std::collections::BTreeMap;

/// One span of a key's life between creation and tombstone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    /// Count of puts in this generation, tombstone included.
    pub ver: i64,
    /// Revision of the first put.
    pub created: Revision,
    /// Revisions at which the key changed, ascending. For a sealed
    /// generation the last element is the tombstone.
    pub revs: Vec<Revision>,
}

impl Generation {
    fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    /// Index of the newest revision with `main <= at_rev`, if any.
    fn walk(&self, at_rev: i64) -> Option<usize> {
        self.revs.iter().rposition(|r| r.main <= at_rev)
    }
}

/// Per-key revision history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIndex {
    pub key: Vec<u8>,
    /// Newest revision of the key across generations.
    pub modified: Revision,
    /// Oldest first; the last element is the current generation and may
    /// be empty right after a tombstone.
    pub generations: Vec<Generation>,
}

/// Resolved view of one key at a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexGet {
    pub mod_rev: Revision,
    pub create_rev: Revision,
    pub version: i64,
}

impl KeyIndex {
    fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            modified: Revision::default(),
            generations: vec![Generation::default()],
        }
    }

    /// Record a put at `rev`.
    fn put(&mut self, rev: Revision) {
        debug_assert!(
            rev > self.modified,
            "put revision {rev} not newer than {}",
            self.modified
        );
        let gen = self.generations.last_mut().expect("at least one generation");
        if gen.is_empty() {
            gen.created = rev;
        }
        gen.ver += 1;
        gen.revs.push(rev);
        self.modified = rev;
    }

    /// Seal the current generation with a tombstone at `rev` and open an
    /// empty one.
    fn tombstone(&mut self, rev: Revision) -> Result<()> {
        let gen = self.generations.last_mut().expect("at least one generation");
        if gen.is_empty() {
            return Err(Error::KeyNotFound);
        }
        gen.ver += 1;
        gen.revs.push(rev);
        self.modified = rev;
        self.generations.push(Generation::default());
        Ok(())
    }

    /// Resolve the key at `at_rev`.
    fn get(&self, at_rev: i64) -> Option<IndexGet> {
        let gen = self.find_generation(at_rev)?;
        let n = gen.walk(at_rev)?;
        Some(IndexGet {
            mod_rev: gen.revs[n],
            create_rev: gen.created,
            version: gen.ver - (gen.revs.len() - n - 1) as i64,
        })
    }

    /// Find the generation live at `at_rev`: walking newest to oldest,
    /// a sealed generation whose tombstone is at or below `at_rev` means
    /// the key was dead at that revision.
    fn find_generation(&self, at_rev: i64) -> Option<&Generation> {
        let last = self.generations.len() - 1;
        for (i, gen) in self.generations.iter().enumerate().rev() {
            if gen.is_empty() {
                continue;
            }
            if i != last {
                let tomb = gen.revs.last().expect("sealed generation has revisions");
                if tomb.main <= at_rev {
                    return None;
                }
            }
            if gen.revs[0].main <= at_rev {
                return Some(gen);
            }
        }
        None
    }

    /// Drop history at or below `at_rev`, collecting value-log positions
    /// that became unreachable into `removed`. Returns `true` when the
    /// key has no history left at all.
    fn compact(&mut self, at_rev: i64, removed: &mut Vec<(Revision, bool)>) -> bool {
        let last = self.generations.len() - 1;
        let mut keep_from = 0;
        for (i, gen) in self.generations.iter_mut().enumerate() {
            if gen.is_empty() {
                continue;
            }
            let sealed = i != last;
            let tomb_dead = sealed && gen.revs.last().expect("sealed").main <= at_rev;
            if tomb_dead {
                // The whole generation, tombstone included, is invisible
                // at and after `at_rev`.
                let n = gen.revs.len();
                for (j, rev) in gen.revs.drain(..).enumerate() {
                    removed.push((rev, sealed && j == n - 1));
                }
                keep_from = i + 1;
                continue;
            }
            // Within a live generation, drop everything below the newest
            // surviving revision at or below `at_rev`.
            if let Some(n) = gen.walk(at_rev) {
                for rev in gen.revs.drain(..n) {
                    removed.push((rev, false));
                }
            }
        }
        self.generations.drain(..keep_from.min(self.generations.len() - 1));
        self.generations.iter().all(|g| g.is_empty())
    }

    /// Rebuild one key's entry from a surviving value-log record, used
    /// when reloading the index from the backend.
    fn restore(&mut self, created_main: i64, rev: Revision, ver: i64) {
        let gen = self.generations.last_mut().expect("at least one generation");
        debug_assert!(gen.is_empty());
        gen.created = Revision::new(created_main, 0);
        gen.ver = ver;
        gen.revs.push(rev);
        self.modified = rev;
    }
}

/// The ordered key → history map.
#[derive(Debug, Default)]
pub struct TreeIndex {
    tree: BTreeMap<Vec<u8>, KeyIndex>,
}

impl TreeIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a put of `key` at `rev`.
    pub fn put(&mut self, key: &[u8], rev: Revision) {
        self.tree
            .entry(key.to_vec())
            .or_insert_with(|| KeyIndex::new(key.to_vec()))
            .put(rev);
    }

    /// Record a tombstone of `key` at `rev`. Fails when the key has no
    /// live generation.
    pub fn tombstone(&mut self, key: &[u8], rev: Revision) -> Result<()> {
        match self.tree.get_mut(key) {
            Some(ki) => ki.tombstone(rev),
            None => Err(Error::KeyNotFound),
        }
    }

    /// Resolve `key` at `at_rev`.
    pub fn get(&self, key: &[u8], at_rev: i64) -> Option<IndexGet> {
        self.tree.get(key).and_then(|ki| ki.get(at_rev))
    }

    /// Keys live at `at_rev` within `range`, with their resolved views,
    /// in key order.
    pub fn range(&self, range: &KeyRange, at_rev: i64) -> Vec<(Vec<u8>, IndexGet)> {
        let mut out = Vec::new();
        self.walk_range(range, |key, ki| {
            if let Some(got) = ki.get(at_rev) {
                out.push((key.to_vec(), got));
            }
        });
        out
    }

    /// Like [`TreeIndex::range`] but yielding only the visible
    /// modification revisions, for value-log readers.
    pub fn revisions(&self, range: &KeyRange, at_rev: i64) -> Vec<Revision> {
        let mut out = Vec::new();
        self.walk_range(range, |_, ki| {
            if let Some(got) = ki.get(at_rev) {
                out.push(got.mod_rev);
            }
        });
        out
    }

    /// Number of distinct keys live at `at_rev` within `range`.
    pub fn count(&self, range: &KeyRange, at_rev: i64) -> usize {
        let mut n = 0;
        self.walk_range(range, |_, ki| {
            if ki.get(at_rev).is_some() {
                n += 1;
            }
        });
        n
    }

    /// Drop history at or below `at_rev` everywhere. Returns the
    /// value-log positions that may now be physically removed, as
    /// `(revision, is_tombstone)` pairs.
    pub fn compact(&mut self, at_rev: i64) -> Vec<(Revision, bool)> {
        let mut removed = Vec::new();
        let mut dead_keys = Vec::new();
        for (key, ki) in self.tree.iter_mut() {
            if ki.compact(at_rev, &mut removed) {
                dead_keys.push(key.clone());
            }
        }
        for key in dead_keys {
            self.tree.remove(&key);
        }
        removed
    }

    /// Rebuild an entry from a surviving record during restore.
    pub fn restore_record(&mut self, key: &[u8], created_main: i64, rev: Revision, ver: i64) {
        match self.tree.get_mut(key) {
            Some(ki) => ki.put(rev),
            None => {
                let mut ki = KeyIndex::new(key.to_vec());
                ki.restore(created_main, rev, ver);
                self.tree.insert(key.to_vec(), ki);
            }
        }
    }

    /// Number of keys with any retained history.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    fn walk_range<'a>(&'a self, range: &KeyRange, mut f: impl FnMut(&'a [u8], &'a KeyIndex)) {
        match range {
            KeyRange::Single(key) => {
                if let Some((key, ki)) = self.tree.get_key_value(key) {
                    f(key, ki);
                }
            }
            KeyRange::HalfOpen { begin, end } => {
                for (key, ki) in self.tree.range(begin.clone()..end.clone()) {
                    f(key, ki);
                }
            }
            KeyRange::FromKey(begin) => {
                for (key, ki) in self.tree.range(begin.clone()..) {
                    f(key, ki);
                }
            }
        }
    }
}
