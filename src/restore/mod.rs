//! Restores and automated test restores
//!
//! [`RestoreEngine`] turns a backup back into a database: pre-flight checks,
//! download with failover, decryption with checksum verification, then a
//! FULL, MERGE or point-in-time apply. [`TestRestoreRunner`] uses it to
//! restore the latest full backup into a throwaway database and check it.

pub mod engine;
pub mod selftest;

pub use engine::{PendingRestore, RestoreEngine, RestoreOutcome, RestoreRequest};
pub use selftest::{IntegrityCheck, TestRestoreReport, TestRestoreRunner};
