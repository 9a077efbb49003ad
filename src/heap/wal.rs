//! Heap write-ahead log (§4.D, §6).
//!
//! Frame format and replay loop are carried over directly from the
//! teacher's `pager::wal::Wal` (magic + version header, per-frame crc,
//! commit-frame grouping by tx id, "discard unterminated tail on
//! replay"), generalized from whole-page SET frames to the spec's five
//! entry kinds (`set, set_bits, clr_bits, persist, commit`) against
//! arbitrary byte ranges instead of fixed-size pages.

use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;

use crate::error::{Result, VosError};

const WAL_MAGIC: &[u8; 8] = b"VOSWAL1\0";
const WAL_VERSION: u16 = 1;
const WAL_HEADER_SIZE: usize = 16;
const ENTRY_HEADER_SIZE: usize = 1 + 8 + 4 + 4; // type + target_off + payload_len + crc

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum WalEntryKind {
    Set = 0,
    SetBits = 1,
    ClrBits = 2,
    Persist = 3,
    Commit = 4,
}

impl WalEntryKind {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(WalEntryKind::Set),
            1 => Ok(WalEntryKind::SetBits),
            2 => Ok(WalEntryKind::ClrBits),
            3 => Ok(WalEntryKind::Persist),
            4 => Ok(WalEntryKind::Commit),
            other => Err(VosError::Corruption(format!("unknown WAL entry type {other}"))),
        }
    }
}

/// A single redo-log entry, decoded and ready to apply.
#[derive(Clone, Debug)]
pub struct WalEntry {
    pub kind: WalEntryKind,
    pub target_off: u64,
    pub payload: Vec<u8>,
}

/// Append-only redo log backing the persistent heap's transactions.
///
/// A transaction is `tx_begin` (implicit: the first entry appended under
/// a given `tx_id`) through `tx_end`. `tx_end(ok)` appends a commit entry;
/// `tx_end(err)` simply stops appending and the uncommitted entries are
/// discarded on the next replay.
pub struct HeapWal {
    file: File,
    sync_enabled: bool,
}

impl HeapWal {
    pub fn open(pool_path: &Path, sync_enabled: bool) -> Result<Self> {
        let path = wal_path(pool_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut wal = Self { file, sync_enabled };
        if wal.file.metadata()?.len() == 0 {
            wal.write_header()?;
        } else {
            wal.validate_header()?;
        }
        Ok(wal)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        header[..8].copy_from_slice(WAL_MAGIC);
        header[8..10].copy_from_slice(&WAL_VERSION.to_le_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn validate_header(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut header)?;
        if &header[..8] != WAL_MAGIC {
            return Err(VosError::Corruption("invalid heap WAL magic".into()));
        }
        let version = u16::from_le_bytes(header[8..10].try_into().unwrap());
        if version != WAL_VERSION {
            return Err(VosError::Corruption("unsupported heap WAL version".into()));
        }
        Ok(())
    }

    /// Appends a non-commit entry at the tail of the log.
    pub fn append(&mut self, kind: WalEntryKind, target_off: u64, payload: &[u8]) -> Result<()> {
        if kind == WalEntryKind::Commit {
            return Err(VosError::InvalidArgument(
                "use commit() to append a commit entry".into(),
            ));
        }
        self.append_raw(kind, target_off, payload)
    }

    /// Appends the commit marker closing a transaction.
    pub fn commit(&mut self) -> Result<()> {
        self.append_raw(WalEntryKind::Commit, 0, &[])?;
        if self.sync_enabled {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn append_raw(&mut self, kind: WalEntryKind, target_off: u64, payload: &[u8]) -> Result<()> {
        let payload_len: u32 = payload
            .len()
            .try_into()
            .map_err(|_| VosError::Overflow("WAL payload too large".into()))?;
        let crc = checksum_for(payload);
        let mut header = [0u8; ENTRY_HEADER_SIZE];
        header[0] = kind as u8;
        header[1..9].copy_from_slice(&target_off.to_le_bytes());
        header[9..13].copy_from_slice(&payload_len.to_le_bytes());
        header[13..17].copy_from_slice(&crc.to_le_bytes());
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        Ok(())
    }

    /// Truncates the log back to just the header, discarding all entries.
    /// Called after a clean checkpoint or after `tx_end(err)` when no
    /// commit record was ever written for the abandoned attempt.
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(WAL_HEADER_SIZE as u64)?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Replays the log, grouping entries by transaction (a run of
    /// non-commit entries terminated by a commit entry) and invoking
    /// `apply` once per entry in a committed group, in order. An
    /// unterminated tail is silently discarded.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<u32>
    where
        F: FnMut(&WalEntry) -> Result<()>,
    {
        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))?;
        let mut pending: Vec<WalEntry> = Vec::new();
        let mut applied = 0u32;

        loop {
            let mut header = [0u8; ENTRY_HEADER_SIZE];
            if !self.read_exact_or_eof(&mut header)? {
                break;
            }
            let kind = match WalEntryKind::from_u8(header[0]) {
                Ok(k) => k,
                Err(_) => break, // corrupt tail: treat as unterminated, discard
            };
            let target_off = u64::from_le_bytes(header[1..9].try_into().unwrap());
            let payload_len = u32::from_le_bytes(header[9..13].try_into().unwrap()) as usize;
            let crc = u32::from_le_bytes(header[13..17].try_into().unwrap());

            let mut payload = vec![0u8; payload_len];
            if !self.read_exact_or_eof(&mut payload)? {
                break; // partial final entry: unterminated tail, discard
            }
            if checksum_for(&payload) != crc {
                break; // torn write, stop replay here per spec §4.D
            }

            if kind == WalEntryKind::Commit {
                for entry in pending.drain(..) {
                    apply(&entry)?;
                    applied += 1;
                }
            } else {
                pending.push(WalEntry {
                    kind,
                    target_off,
                    payload,
                });
            }
        }
        // `pending` left over here (no trailing commit) is discarded.
        Ok(applied)
    }

    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut read = 0usize;
        while read < buf.len() {
            let n = self.file.read(&mut buf[read..])?;
            if n == 0 {
                return Ok(read == 0);
            }
            read += n;
        }
        Ok(true)
    }
}

fn checksum_for(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn wal_path(pool_path: &Path) -> PathBuf {
    let mut os_string = pool_path.as_os_str().to_owned();
    os_string.push(".wal");
    PathBuf::from(os_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn replay_applies_only_committed_groups() {
        let dir = tempdir().unwrap();
        let pool_path = dir.path().join("pool.vos");
        {
            let mut wal = HeapWal::open(&pool_path, true).unwrap();
            wal.append(WalEntryKind::Set, 64, b"hello").unwrap();
            wal.append(WalEntryKind::Set, 128, b"world").unwrap();
            wal.commit().unwrap();
            // A second, uncommitted transaction.
            wal.append(WalEntryKind::Set, 256, b"orphan").unwrap();
        }
        let mut wal = HeapWal::open(&pool_path, true).unwrap();
        let mut applied = Vec::new();
        let n = wal
            .replay(|entry| {
                applied.push(entry.target_off);
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(applied, vec![64, 128]);
    }

    #[test]
    fn reset_discards_all_entries() {
        let dir = tempdir().unwrap();
        let pool_path = dir.path().join("pool.vos");
        let mut wal = HeapWal::open(&pool_path, true).unwrap();
        wal.append(WalEntryKind::Set, 1, b"x").unwrap();
        wal.commit().unwrap();
        wal.reset().unwrap();
        let n = wal.replay(|_| Ok(())).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn commit_entry_cannot_be_appended_via_append() {
        let dir = tempdir().unwrap();
        let pool_path = dir.path().join("pool.vos");
        let mut wal = HeapWal::open(&pool_path, true).unwrap();
        assert!(wal.append(WalEntryKind::Commit, 0, b"").is_err());
    }
}
