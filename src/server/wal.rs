//! Participant write-ahead log: the durable record of 2PC phase transitions.
//!
//! Every entry is appended and fsync'ed before the append returns, so a
//! participant that voted READY can always learn, after a crash, which of
//! its proposals were decided. A PUT/DEL entry counts as durable state iff
//! it is immediately followed by a COMMIT entry; anything dangling at the
//! tail is an abandoned proposal and is never replayed.

use std::io::SeekFrom;
use std::path::Path;

use serde::{Serialize, Deserialize};

use rmp_serde::encode::to_vec as encode_to_vec;
use rmp_serde::decode::from_slice as decode_from_slice;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, AsyncSeekExt};

use crate::utils::TandemError;

/// Log entry type. Reads are never logged.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum WalEntry {
    /// Proposed put of value into key.
    Put { key: String, value: String },

    /// Proposed deletion of key.
    Del { key: String },

    /// The proposal immediately preceding was decided commit.
    Commit,

    /// The proposal immediately preceding was decided abort.
    Abort,
}

/// Durable append-only log over a backing file, with an in-memory mirror of
/// the recovered + appended entries.
pub struct WalLog {
    /// Owning participant's ID, used as logging prefix.
    me: u64,

    /// Backing file, cursor kept at EOF between operations.
    backer: File,

    /// Current file size in bytes.
    file_size: usize,

    /// In-memory mirror of all entries, in log order.
    entries: Vec<WalEntry>,
}

impl WalLog {
    /// Opens (creating if missing) the backing file at `path` and scans all
    /// well-formed entries into memory. A torn frame at the tail (e.g. from
    /// a crash mid-append) is truncated away so later appends land on a
    /// clean boundary.
    pub async fn open(me: u64, path: &Path) -> Result<Self, TandemError> {
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!(me; "created log file '{}'", path.display());
        } else {
            pf_info!(me; "log file '{}' already exists", path.display());
        }
        let mut backer =
            OpenOptions::new().read(true).write(true).open(path).await?;
        let file_size = backer.metadata().await?.len() as usize;

        // scan entries from the head; stop at the first ill-formed frame
        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < file_size {
            match Self::read_entry(&mut backer, file_size, offset).await? {
                (Some(entry), end_offset) => {
                    entries.push(entry);
                    offset = end_offset;
                }
                (None, _) => break,
            }
        }
        let mut log = WalLog {
            me,
            backer,
            file_size,
            entries,
        };
        if offset < file_size {
            pf_warn!(me; "truncating torn log tail at offset {}", offset);
            log.backer.set_len(offset as u64).await?;
            log.backer.sync_all().await?;
            log.file_size = offset;
        }
        log.backer.seek(SeekFrom::End(0)).await?;

        pf_debug!(me; "recovered {} log entries", log.entries.len());
        Ok(log)
    }

    /// Durably appends `entry`: length header, encoded body, fsync.
    pub async fn append(
        &mut self,
        entry: WalEntry,
    ) -> Result<(), TandemError> {
        let entry_bytes = encode_to_vec(&entry)?;
        self.backer.write_u64(entry_bytes.len() as u64).await?;
        self.backer.write_all(&entry_bytes[..]).await?;
        self.backer.sync_data().await?;

        self.file_size += 8 + entry_bytes.len();
        self.entries.push(entry);
        Ok(())
    }

    /// The most recently appended entry, if any.
    pub fn last_entry(&self) -> Option<&WalEntry> {
        self.entries.last()
    }

    /// All recovered + appended entries, in order.
    pub fn entries(&self) -> &[WalEntry] {
        &self.entries
    }

    /// Replays durable proposals: each PUT/DEL entry immediately followed by
    /// a COMMIT entry is fed to the matching apply callback, in log order.
    /// Everything else is skipped: COMMIT/ABORT markers themselves, aborted
    /// proposals, and a dangling tail proposal.
    pub fn replay<FP, FD>(&self, mut apply_put: FP, mut apply_del: FD)
    where
        FP: FnMut(&str, &str),
        FD: FnMut(&str),
    {
        let mut applied = 0;
        for (i, entry) in self.entries.iter().enumerate() {
            let committed =
                matches!(self.entries.get(i + 1), Some(WalEntry::Commit));
            match entry {
                WalEntry::Put { key, value } if committed => {
                    apply_put(key, value);
                    applied += 1;
                }
                WalEntry::Del { key } if committed => {
                    apply_del(key);
                    applied += 1;
                }
                _ => {}
            }
        }
        pf_debug!(self.me; "replayed {} committed proposals", applied);
    }

    /// Read out the entry at `offset`, returning `(None, offset)` if the
    /// frame is out of bounds or ill-formed.
    async fn read_entry(
        backer: &mut File,
        file_size: usize,
        offset: usize,
    ) -> Result<(Option<WalEntry>, usize), TandemError> {
        if offset + 8 > file_size {
            return Ok((None, offset));
        }

        // entry length header first
        backer.seek(SeekFrom::Start(offset as u64)).await?;
        let entry_len = backer.read_u64().await? as usize;
        let offset_e = offset + 8 + entry_len;
        if offset_e > file_size {
            return Ok((None, offset));
        }

        // then entry content
        let mut entry_buf: Vec<u8> = vec![0; entry_len];
        backer.read_exact(&mut entry_buf[..]).await?;
        match decode_from_slice(&entry_buf) {
            Ok(entry) => Ok((Some(entry), offset_e)),
            Err(_) => Ok((None, offset)),
        }
    }
}
