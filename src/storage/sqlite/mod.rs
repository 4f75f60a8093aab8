//! SQLite implementation of the ledger.

mod ledger_store;

pub use ledger_store::SqliteLedgerStore;
