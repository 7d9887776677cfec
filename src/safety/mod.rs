//! Safety
//!
//! Tamper checks for appended files, locked shared-file updates, and the
//! cross-session registry built on them.

pub mod file_check;
pub mod lock_manager;
pub mod registry;
