//! Background services.

pub mod syncer;

pub use syncer::{SyncConfig, SyncHandle, SyncReport, SyncService, SyncState};
