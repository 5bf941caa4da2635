//! Directory snapshot: the name-sorted `(name, mtime)` list a node holds for
//! its view of the tree, plus the digest peers compare to detect change.
//!
//! The serialized form doubles as the MetaResponse payload:
//!
//! ```text
//! file_count: u32 | digest: u32 | mtime: i64 × file_count | name\0 × file_count
//! ```
//!
//! The digest covers the same layout with the digest field left out, so all
//! timestamps come first and all names after them.

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use std::path::Path;

use crate::checksum::Crc32;
use crate::error::ProtocolError;
use crate::fs_enum::{enumerate_files, file_mtime, FileFilter};
use crate::protocol::{MAX_FILES, MAX_PATH_LEN};
use crate::protocol_core::normalize_under_root;

const META_HEAD_LEN: usize = 8;
const MTIME_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub mtime: i64,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, mtime: i64) -> Self {
        Self {
            name: name.into(),
            mtime,
        }
    }

    pub fn name_len(&self) -> usize {
        self.name.len()
    }
}

/// Bounds applied while building a snapshot from disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanLimits {
    pub max_files: usize,
    /// Includes the terminating NUL, so names may be one byte shorter
    pub max_path_len: usize,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            max_files: MAX_FILES,
            max_path_len: MAX_PATH_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    entries: Vec<FileEntry>,
    capacity: usize,
    digest: u32,
}

impl Snapshot {
    /// Sort `entries` by name and compute the digest.
    pub fn from_entries(mut entries: Vec<FileEntry>, capacity: usize) -> Self {
        entries.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        entries.dedup_by(|a, b| a.name == b.name);
        let digest = compute_digest(&entries);
        Self {
            entries,
            capacity,
            digest,
        }
    }

    /// Build a snapshot from a full walk of `root`.
    pub fn scan(root: &Path, filter: &FileFilter, limits: ScanLimits) -> Result<Self> {
        let files = enumerate_files(root, filter)?;
        let found = files.len();

        let mut entries = Vec::with_capacity(found.min(limits.max_files));
        for f in files {
            if f.name.len() >= limits.max_path_len {
                tracing::warn!(
                    "skipping {}: name exceeds {} bytes",
                    f.name,
                    limits.max_path_len - 1
                );
                continue;
            }
            entries.push(FileEntry::new(f.name, f.mtime));
        }
        if entries.len() > limits.max_files {
            tracing::warn!(
                "{} files under {}, snapshot truncated to {}",
                entries.len(),
                root.display(),
                limits.max_files
            );
            // Keep the truncation deterministic across rescans
            entries.sort_unstable_by(|a, b| a.name.cmp(&b.name));
            entries.truncate(limits.max_files);
        }

        let snap = Self::from_entries(entries, limits.max_files);
        tracing::debug!(
            "scanned {}: {} files, digest 0x{:08x}",
            root.display(),
            snap.len(),
            snap.digest
        );
        Ok(snap)
    }

    /// Re-stat every entry against `root`. Entries whose file is gone are
    /// dropped; with `refresh_mtimes`, survivors pick up their on-disk mtime.
    /// Returns how many entries were removed.
    pub fn refresh(&mut self, root: &Path, refresh_mtimes: bool) -> usize {
        self.refresh_with(root, refresh_mtimes, |_| false)
    }

    /// `refresh`, except entries for which `keep_missing` holds stay even
    /// when their file is absent.
    pub fn refresh_with(
        &mut self,
        root: &Path,
        refresh_mtimes: bool,
        keep_missing: impl Fn(&str) -> bool,
    ) -> usize {
        let before = self.entries.len();
        self.entries.retain_mut(|entry| {
            let Ok(path) = normalize_under_root(root, &entry.name) else {
                return false;
            };
            match file_mtime(&path) {
                Ok(mtime) => {
                    if refresh_mtimes {
                        entry.mtime = mtime;
                    }
                    true
                }
                Err(_) => keep_missing(&entry.name),
            }
        });
        self.recompute_digest();
        before - self.entries.len()
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn digest(&self) -> u32 {
        self.digest
    }

    pub fn find(&self, name: &str) -> Option<&FileEntry> {
        self.position(name).map(|i| &self.entries[i])
    }

    /// Update one entry's mtime; false if `name` is not in the snapshot.
    pub fn set_mtime(&mut self, name: &str, mtime: i64) -> bool {
        let Some(i) = self.position(name) else {
            return false;
        };
        if self.entries[i].mtime != mtime {
            self.entries[i].mtime = mtime;
            self.recompute_digest();
        }
        true
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let Some(i) = self.position(name) else {
            return false;
        };
        self.entries.remove(i);
        self.recompute_digest();
        true
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
    }

    fn recompute_digest(&mut self) {
        self.digest = compute_digest(&self.entries);
    }

    /// Size of the MetaResponse payload for this snapshot
    pub fn serialized_len(&self) -> usize {
        META_HEAD_LEN
            + self.entries.len() * MTIME_LEN
            + self.entries.iter().map(|e| e.name_len() + 1).sum::<usize>()
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        buf.put_u32_le(self.entries.len() as u32);
        buf.put_u32_le(self.digest);
        for e in &self.entries {
            buf.put_i64_le(e.mtime);
        }
        for e in &self.entries {
            buf.put_slice(e.name.as_bytes());
            buf.put_u8(0);
        }
        buf.freeze()
    }

    /// Rebuild a snapshot from a MetaResponse payload. The digest is taken
    /// from the wire so later comparisons are against the sender's value.
    pub fn deserialize(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < META_HEAD_LEN {
            return Err(ProtocolError::Truncated {
                what: "snapshot header",
                need: META_HEAD_LEN,
                have: buf.len(),
            });
        }
        let count = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let digest = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

        let names_at = count
            .checked_mul(MTIME_LEN)
            .and_then(|n| n.checked_add(META_HEAD_LEN))
            .filter(|&n| n <= buf.len())
            .ok_or(ProtocolError::Truncated {
                what: "snapshot mtimes",
                need: META_HEAD_LEN.saturating_add(count.saturating_mul(MTIME_LEN)),
                have: buf.len(),
            })?;

        let mut entries: Vec<FileEntry> = Vec::with_capacity(count);
        let mut cursor = names_at;
        for i in 0..count {
            let at = META_HEAD_LEN + i * MTIME_LEN;
            let mut raw = [0u8; MTIME_LEN];
            raw.copy_from_slice(&buf[at..at + MTIME_LEN]);
            let mtime = i64::from_le_bytes(raw);

            let rest = &buf[cursor..];
            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or(ProtocolError::MissingNul("snapshot"))?;
            let name = std::str::from_utf8(&rest[..nul])
                .map_err(|_| ProtocolError::InvalidName(String::from_utf8_lossy(&rest[..nul]).into_owned()))?;
            if name.is_empty() {
                return Err(ProtocolError::InvalidName(String::new()));
            }
            if let Some(prev) = entries.last() {
                if prev.name.as_str() >= name {
                    return Err(ProtocolError::Unsorted(name.to_string()));
                }
            }
            entries.push(FileEntry::new(name, mtime));
            cursor += nul + 1;
        }

        if cursor != buf.len() {
            return Err(ProtocolError::LengthMismatch {
                what: "snapshot",
                declared: buf.len(),
                actual: cursor,
            });
        }

        Ok(Self {
            entries,
            capacity: count,
            digest,
        })
    }
}

/// Digest over `count | mtimes | names\0` for an already sorted entry list
pub fn compute_digest(entries: &[FileEntry]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(&(entries.len() as u32).to_le_bytes());
    for e in entries {
        crc.update(&e.mtime.to_le_bytes());
    }
    for e in entries {
        crc.update(e.name.as_bytes());
        crc.update(&[0]);
    }
    crc.value()
}
