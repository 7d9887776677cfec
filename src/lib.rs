//! sandbox: A path sandbox for package builds
//! Confines which files a process tree may read, write, create or delete by
//! interposing on libc filesystem calls through the dynamic linker.
//!
//! # Architecture
//!
//! The crate is shared by two artifacts: the `sandbox` controller binary and
//! the `libsandbox_preload.so` interposition library (the `preload` member).
//!
//! ## Policy ([`policy`])
//! - [`policy::canonicalize`]: Lexical path normalization
//! - [`policy::prefix`]: Prefix lists parsed from `SANDBOX_DENY/READ/WRITE/PREDICT`
//! - [`policy::decision`]: Operation classes and the allow/deny precedence
//!
//! ## Interception ([`intercept`])
//! - [`intercept::resolver`]: Lazy resolution of the next definition of each libc symbol
//! - [`intercept::guard`]: Per-thread reentrancy guard for the library's own I/O
//! - [`intercept::wrappers`]: Check-then-forward logic behind every exported wrapper
//! - [`intercept::exec`]: Keeping the library in `LD_PRELOAD` across exec, `PATH` search
//! - [`intercept::at`]: Paths behind descriptor-relative (`*at`) calls
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Violation and debug logs with tamper checks
//!
//! ## Safety ([`safety`])
//! - [`safety::lock_manager`]: flock-protected shared files with stable inodes
//! - [`safety::registry`]: Host-wide session registry and preload list
//! - [`safety::file_check`]: Ownership and link checks on files we write through
//!
//! ## Kernel ([`kernel`])
//! - [`kernel::errno`]: errno save/restore around sandbox work
//! - [`kernel::signal`]: Async-safe signal flags for the controller
//!
//! ## Session ([`session`])
//! - [`session::environment`]: Child environment and default policy
//! - [`session::controller`]: Registration, shell lifecycle, teardown
//! - [`session::summary`]: Violation report and JSON summary
//!
//! ## Configuration ([`config`])
//! - [`config::env`]: Environment variable names and accessors
//! - [`config::types`]: Verdicts, error types and result aliases

// Configuration
pub mod config;

// Path policy
pub mod policy;

// Interposition
pub mod intercept;

// Observability
pub mod observability;

// Safety
pub mod safety;

// Kernel primitives
pub mod kernel;

// Controller
pub mod session;

// CLI entrypoint for the sandbox binary
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
