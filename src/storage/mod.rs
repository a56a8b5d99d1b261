//! Claim storage.
//!
//! The [`ClaimStore`] keeps entities, claims, supersession links and gaps as
//! an append log plus secondary indices. Durability is pluggable through the
//! [`LogSink`] trait: [`MemoryLog`] keeps records in process, and
//! `persistent::FileLog` (feature `persistent`) writes them to disk.

mod memory;
mod store;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::MemoryLog;
pub use store::{ClaimQuery, ClaimStore};
pub use traits::{LogEntryKind, LogRecord, LogSink, StorageError};
