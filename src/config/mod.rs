//! Configuration
//!
//! Environment variable contract and shared type definitions.

pub mod env;
pub mod types;
