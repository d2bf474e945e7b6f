//! In-memory native session for testing collectors without Windows.
//!
//! `MockSession` serves WMI rows, performance-counter objects and a Task
//! Scheduler folder tree from memory, with injectable failures and delays.
//! Canned host states live in `scenarios.rs`.

mod scenarios;
mod session;

pub use session::{MockFolder, MockSession, MockTask};
