//! Shared ledger integration tests.
//!
//! Tests the LedgerStore contract against every backend. Each backend's test
//! binary imports these functions and runs them through the macro.

pub mod ledger_store_tests;
