//! In-memory log backend.
//!
//! Keeps records in process memory. Intended for embedded usage and tests;
//! sharing one `MemoryLog` between two stores simulates a restart.

use std::sync::Mutex;

use crate::storage::traits::{LogRecord, LogSink, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

/// Thread-safe in-memory append log.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLog {
    /// An empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records appended so far.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the lock is poisoned.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.records.lock().map_err(|_| lock_err("memory_log.len"))?.len())
    }

    /// # Errors
    ///
    /// Returns `StorageError::Backend` if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

impl LogSink for MemoryLog {
    fn append(&self, record: &LogRecord) -> Result<(), StorageError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| lock_err("memory_log.append"))?;
        if let Some(last) = records.last() {
            if record.sequence <= last.sequence {
                return Err(StorageError::Backend(format!(
                    "non-monotonic sequence {} after {}",
                    record.sequence, last.sequence
                )));
            }
        }
        records.push(record.clone());
        Ok(())
    }

    fn replay(&self) -> Result<Vec<LogRecord>, StorageError> {
        Ok(self
            .records
            .lock()
            .map_err(|_| lock_err("memory_log.replay"))?
            .clone())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityKind};
    use crate::storage::traits::LogEntryKind;
    use chrono::Utc;

    fn record(sequence: u64) -> LogRecord {
        LogRecord {
            sequence,
            timestamp: Utc::now(),
            kind: LogEntryKind::EntityPut(Entity::new("BERT", EntityKind::Artifact).unwrap()),
        }
    }

    #[test]
    fn test_append_and_replay() {
        let log = MemoryLog::new();
        assert!(log.is_empty().unwrap());

        log.append(&record(1)).unwrap();
        log.append(&record(2)).unwrap();

        let replayed = log.replay().unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].sequence, 1);
        assert_eq!(replayed[1].sequence, 2);
    }

    #[test]
    fn test_rejects_non_monotonic_sequence() {
        let log = MemoryLog::new();
        log.append(&record(2)).unwrap();
        assert!(matches!(
            log.append(&record(2)),
            Err(StorageError::Backend(_))
        ));
        assert_eq!(log.len().unwrap(), 1);
    }
}
