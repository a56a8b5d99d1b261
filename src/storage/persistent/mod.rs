//! Durable log backend.
//!
//! Provides [`FileLog`], a write-ahead log file with CRC32-framed records,
//! and a helper that opens a [`ClaimStore`] over it.
//!
//! ```text
//! ClaimStore --append--> FileLog --[version][len][json][crc32]--> claims.wal
//!            <--replay--
//! ```
//!
//! [`ClaimStore`]: crate::storage::ClaimStore

mod codec;
mod wal;

pub use wal::FileLog;

use std::path::Path;
use std::sync::Arc;

use crate::storage::{ClaimStore, StorageError};

/// File name of the log inside a data directory.
pub const LOG_FILE: &str = "claims.wal";

/// Opens (or creates) the claim store persisted under `data_dir`.
///
/// # Errors
///
/// Returns `StorageError` if the log cannot be opened or does not replay.
pub fn open_store(data_dir: &Path, sync_on_write: bool) -> Result<ClaimStore, StorageError> {
    let log = FileLog::open(&data_dir.join(LOG_FILE), sync_on_write)?;
    ClaimStore::open(Arc::new(log))
}
