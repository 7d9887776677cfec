//! Observability
//!
//! Access audit lines for stderr, the violation log and the debug log.

pub mod audit;
