//! Policy
//!
//! Path canonicalization, the four prefix categories, and the decision
//! engine that combines them.

pub mod canonicalize;
pub mod decision;
pub mod prefix;

pub use canonicalize::{canonicalize, CanonicalPath, CanonicalizeError};
pub use decision::{HostProbe, LiveProbe, OperationClass, SandboxContext};
pub use prefix::{Category, PolicyStore, PrefixSet};
