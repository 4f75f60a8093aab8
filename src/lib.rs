//! Gophermart - loyalty accrual reconciliation
//!
//! Keeps the order ledger in step with an external accrual authority and
//! books each order's loyalty points exactly once.

pub mod accrual;
pub mod app;
pub mod config;
pub mod model;
pub mod services;
pub mod storage;
pub mod utils;
