//! Document store
//!
//! Named JSON documents on disk with a write-through cache and rolling
//! backups.

mod backup;
mod error;
mod file_store;

pub use backup::BackupEntry;
pub use error::{StoreError, StoreResult};
pub use file_store::{DEFAULT_BACKUP_RETENTION, Document, FileStore, StoreConfig};
