//! Thin wrappers around kernel-facing primitives.
//!
//! `unsafe` for errno and signal disposition is concentrated here.

pub mod errno;
pub mod signal;
