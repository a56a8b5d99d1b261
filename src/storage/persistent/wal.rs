//! Write-ahead log file.
//!
//! Every record is appended and flushed (and optionally fsynced) before the
//! store applies it, and replayed in order on startup.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [RECORD 1: codec-encoded LogRecord]
//! [RECORD 2: codec-encoded LogRecord]
//! ...
//! ```
//!
//! A torn or corrupt record ends the readable log. `FileLog::open` cuts the
//! file back to the last intact record so later appends stay readable.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use super::codec;
use crate::storage::traits::{LogRecord, LogSink, StorageError};

const HEADER_LEN: u64 = 5;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

/// File-backed append log.
///
/// Thread-safe via internal mutex.
pub struct FileLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    sync_on_write: bool,
}

impl std::fmt::Debug for FileLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLog")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

impl FileLog {
    /// Open or create a log file.
    ///
    /// A new file gets the header. An existing file is scanned and any torn
    /// or corrupt tail is truncated away.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the file cannot be opened, or if an
    /// existing file does not carry a valid header.
    pub fn open(path: &Path, sync_on_write: bool) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
        } else {
            let (intact, valid_len) = Self::scan(path)?;
            if valid_len < len {
                warn!(
                    path = %path.display(),
                    intact,
                    dropped_bytes = len - valid_len,
                    "truncating torn log tail"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }

        let file = OpenOptions::new().append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
            sync_on_write,
        })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the log file size in bytes.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the file metadata cannot be read.
    pub fn size_bytes(&self) -> Result<u64, StorageError> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Counts intact records and the byte offset just past the last one.
    fn scan(path: &Path) -> IoResult<(usize, u64)> {
        let mut iter = RecordIter::new(path)?;
        let mut intact = 0;
        let mut valid_len = HEADER_LEN;
        while let Some(next) = iter.next() {
            match next {
                Ok(_) => {
                    intact += 1;
                    valid_len = iter.position()?;
                }
                Err(e) => {
                    warn!(path = %path.display(), after = intact, error = %e, "log corruption detected");
                    break;
                }
            }
        }
        Ok((intact, valid_len))
    }
}

impl LogSink for FileLog {
    fn append(&self, record: &LogRecord) -> Result<(), StorageError> {
        let encoded = codec::encode(record)?;
        let mut writer = self.writer.lock().map_err(|_| lock_err("file_log.append"))?;

        writer.write_all(&encoded)?;
        writer.flush()?;

        if self.sync_on_write {
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn replay(&self) -> Result<Vec<LogRecord>, StorageError> {
        {
            let mut writer = self.writer.lock().map_err(|_| lock_err("file_log.replay"))?;
            writer.flush()?;
        }

        let mut records = Vec::new();
        for next in RecordIter::new(&self.path)? {
            match next {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        replayed = records.len(),
                        error = %e,
                        "stopping replay at corrupt record"
                    );
                    break;
                }
            }
        }
        Ok(records)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Iterator over log records.
struct RecordIter {
    reader: BufReader<File>,
    file_size: u64,
}

impl RecordIter {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let _version = codec::read_header(&mut reader)?;

        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }
}

impl Iterator for RecordIter {
    type Item = IoResult<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }

        match codec::decode(&mut self.reader) {
            Ok(record) => Some(Ok(record)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                Some(Err(std::io::Error::new(ErrorKind::UnexpectedEof, "torn record at end of log")))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityKind};
    use crate::storage::traits::LogEntryKind;
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(sequence: u64, name: &str) -> LogRecord {
        LogRecord {
            sequence,
            timestamp: Utc::now(),
            kind: LogEntryKind::EntityPut(Entity::new(name, EntityKind::Concept).unwrap()),
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("claims.wal");

        let log = FileLog::open(&path, false).unwrap();
        log.append(&record(1, "a")).unwrap();
        log.append(&record(2, "b")).unwrap();
        drop(log);

        let log = FileLog::open(&path, false).unwrap();
        let records = log.replay().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 1);
        assert!(matches!(records[1].kind, LogEntryKind::EntityPut(_)));
    }

    #[test]
    fn test_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("claims.wal");
        let log = FileLog::open(&path, true).unwrap();
        assert_eq!(log.size_bytes().unwrap(), HEADER_LEN);
    }

    #[test]
    fn test_torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("claims.wal");

        {
            let log = FileLog::open(&path, true).unwrap();
            log.append(&record(1, "a")).unwrap();
            log.append(&record(2, "b")).unwrap();
        }
        let full = std::fs::metadata(&path).unwrap().len();
        {
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            file.set_len(full - 4).unwrap();
        }

        let log = FileLog::open(&path, true).unwrap();
        assert_eq!(log.replay().unwrap().len(), 1);

        log.append(&record(2, "c")).unwrap();
        let records = log.replay().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].sequence, 2);
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("claims.wal");
        std::fs::write(&path, b"not a log file").unwrap();
        assert!(FileLog::open(&path, false).is_err());
    }
}
