//! Write-ahead log I/O
//!
//! The WAL is an append-only file of length-prefixed records. Every
//! record is `[4-byte big-endian length][JSON payload]`. An append
//! returns only after `sync_data`, so a record that was acknowledged is
//! on stable storage; a record that was mid-write when the process died
//! shows up as a truncated tail and is discarded on replay.
//!
//! The append path here is synchronous per record. Group commit and
//! deferred fsync would raise throughput, but the durability contract
//! (acknowledge implies fsynced) is the whole point of this store, so
//! the simple discipline wins.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use super::log::WalRecord;

/// Append-only log handle.
///
/// `Wal` is not internally synchronized; the store holds it behind the
/// same mutex that guards the in-memory map, which is what totally
/// orders appends with respect to map updates.
pub struct Wal {
    file: File,
    path: PathBuf,
}

impl Wal {
    /// Open (creating if absent) the WAL at `path` for appending.
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { file, path })
    }

    /// Append one record and sync it to stable storage.
    ///
    /// Returns only after the data is fsynced. On error the record must
    /// be treated as not committed and the caller must not acknowledge.
    pub fn append(&mut self, record: &WalRecord) -> Result<()> {
        let encoded = serde_json::to_vec(record)?;
        let len = encoded.len() as u32;
        self.file.write_all(&len.to_be_bytes())?;
        self.file.write_all(&encoded)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Read every committed record from the start of the file.
    ///
    /// A truncated length prefix, a truncated payload, or a payload
    /// that fails to decode all mark the uncommitted tail of a crashed
    /// append; replay stops there and returns everything before it.
    pub fn replay(path: &Path) -> Result<Vec<WalRecord>> {
        Ok(Self::recover(path)?.0)
    }

    /// Replay plus the byte length of the clean record prefix.
    ///
    /// The caller must cut the file back to that length before
    /// appending again: a torn tail left in place would sit between
    /// the old records and any new ones, and the next replay would
    /// stop at it and lose every acknowledged write after it.
    pub(crate) fn recover(path: &Path) -> Result<(Vec<WalRecord>, u64)> {
        let mut records = Vec::new();
        let mut clean_len: u64 = 0;

        let file = match File::open(path) {
            Ok(f) => f,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((records, clean_len))
            }
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_be_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::warn!("Discarding truncated WAL record ({} bytes expected)", len);
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            match serde_json::from_slice::<WalRecord>(&payload) {
                Ok(record) => {
                    records.push(record);
                    clean_len += 4 + len as u64;
                }
                Err(e) => {
                    log::warn!("Discarding undecodable WAL tail: {}", e);
                    break;
                }
            }
        }

        Ok((records, clean_len))
    }

    /// Cut a torn tail off the log so the next append lands directly
    /// after the last committed record.
    pub(crate) fn trim_to(path: &Path, clean_len: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(clean_len)?;
        file.sync_all()?;
        Ok(())
    }

    /// Truncate the log to zero length and reopen it for appending.
    ///
    /// Must be called only after the store state covering these records
    /// has been durably checkpointed.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;

        let new_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.file = new_file;
        Ok(())
    }

    /// Final sync before shutdown.
    pub fn close(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_records() -> Vec<WalRecord> {
        vec![
            WalRecord::Set { key: "a".into(), value: json!(1) },
            WalRecord::Delete { key: "a".into() },
            WalRecord::BulkSet {
                items: vec![("b".into(), json!("x")), ("c".into(), json!(null))],
            },
        ]
    }

    #[test]
    fn test_replay_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let records = Wal::replay(&dir.path().join("wal.log")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_append_then_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = Wal::open(path.clone()).unwrap();
        for record in sample_records() {
            wal.append(&record).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, sample_records());
    }

    #[test]
    fn test_replay_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = Wal::open(path.clone()).unwrap();
        for record in sample_records() {
            wal.append(&record).unwrap();
        }

        let first = Wal::replay(&path).unwrap();
        let second = Wal::replay(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_truncated_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = Wal::open(path.clone()).unwrap();
        for record in sample_records() {
            wal.append(&record).unwrap();
        }

        // Chop one byte off the final record, as a crash mid-append would.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 1).unwrap();

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, sample_records()[..2].to_vec());
    }

    #[test]
    fn test_truncated_length_prefix_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = Wal::open(path.clone()).unwrap();
        wal.append(&WalRecord::Set { key: "a".into(), value: json!(1) }).unwrap();

        // A lone partial length prefix after the last full record.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x00, 0x00]).unwrap();

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
    }

    #[test]
    fn test_recover_reports_clean_prefix_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = Wal::open(path.clone()).unwrap();
        for record in sample_records() {
            wal.append(&record).unwrap();
        }
        let full_len = std::fs::metadata(&path).unwrap().len();

        let (records, clean_len) = Wal::recover(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(clean_len, full_len);

        // Tear the last record; the clean prefix shrinks to cover two.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 1).unwrap();

        let (records, clean_len) = Wal::recover(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(clean_len < full_len - 1);

        Wal::trim_to(&path, clean_len).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), clean_len);
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
    }

    #[test]
    fn test_truncate_empties_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let mut wal = Wal::open(path.clone()).unwrap();
        wal.append(&WalRecord::Set { key: "a".into(), value: json!(1) }).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);

        wal.truncate().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        // The handle must still be usable for appends after truncation.
        wal.append(&WalRecord::Set { key: "b".into(), value: json!(2) }).unwrap();
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
    }
}
