//! Session
//!
//! The controller side of the sandbox: registers the session host-wide,
//! prepares the protected shell's environment, waits for the shell and
//! reports any recorded violations.

pub mod controller;
pub mod environment;
pub mod summary;

pub use controller::{SessionController, SessionOptions};
pub use summary::{SessionSummary, Violation};
