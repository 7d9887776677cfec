//! Prefix sets for the four policy categories, parsed from the environment.
//!
//! Each category is memoized on the raw text of its variable. A refresh with
//! unchanged text is a no-op; changed text replaces the whole set.

use std::os::unix::ffi::OsStrExt;

use crate::config::env::{
    EnvSource, ENV_SANDBOX_DENY, ENV_SANDBOX_PREDICT, ENV_SANDBOX_READ, ENV_SANDBOX_WRITE,
};
use crate::config::types::SandboxError;
use crate::policy::canonicalize::{canonicalize_in, CanonicalPath, SB_PATH_MAX};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Deny,
    Read,
    Write,
    Predict,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Deny,
        Category::Read,
        Category::Write,
        Category::Predict,
    ];

    pub fn env_var(self) -> &'static str {
        match self {
            Category::Deny => ENV_SANDBOX_DENY,
            Category::Read => ENV_SANDBOX_READ,
            Category::Write => ENV_SANDBOX_WRITE,
            Category::Predict => ENV_SANDBOX_PREDICT,
        }
    }

    /// Predict is optional; the other three are expected in every session.
    pub fn reports_absence(self) -> bool {
        !matches!(self, Category::Predict)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Ordered canonical prefixes for one category.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrefixSet {
    entries: Vec<CanonicalPath>,
}

impl PrefixSet {
    /// Parse a colon-separated list. Relative tokens resolve against `cwd`;
    /// with no usable cwd they are dropped, as is any token that does not
    /// canonicalize.
    pub fn parse(text: &[u8], cwd: Option<&[u8]>) -> Self {
        let entries = text
            .split(|b| *b == b':')
            .filter(|token| !token.is_empty())
            .filter_map(|token| {
                let cwd = cwd.unwrap_or(b"");
                canonicalize_in(token, cwd, Some(SB_PATH_MAX)).ok()
            })
            .collect();
        Self { entries }
    }

    pub fn from_entries(entries: Vec<CanonicalPath>) -> Self {
        Self { entries }
    }

    /// Byte-wise prefix match against any entry.
    pub fn matches(&self, path: &CanonicalPath) -> bool {
        self.entries.iter().any(|e| path.starts_with(e.as_bytes()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CanonicalPath> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
struct CachedCategory {
    /// Raw variable text the current set was built from
    revision: Option<Vec<u8>>,
    set: Option<PrefixSet>,
    absence_reported: bool,
}

/// Reported once per process when a required category variable is unset.
pub fn absence_error(category: Category) -> SandboxError {
    SandboxError::PolicyFailure(format!(
        "the {} environmental variable should be defined.",
        category.env_var()
    ))
}

/// Memoized prefix sets for all four categories.
///
/// `None` from [`PolicyStore::get`] means the variable is unset, which the
/// decision engine treats differently from an empty list.
#[derive(Debug, Default)]
pub struct PolicyStore {
    slots: [CachedCategory; 4],
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-read one category from `env`, rebuilding its set only if the text
    /// changed since the last refresh.
    pub fn refresh<E: EnvSource + ?Sized>(
        &mut self,
        category: Category,
        env: &E,
    ) -> Option<&PrefixSet> {
        let slot = &mut self.slots[category.index()];

        match env.var_bytes(category.env_var()) {
            Some(text) => {
                if slot.revision.as_deref() != Some(text.as_slice()) || slot.set.is_none() {
                    let cwd = std::env::current_dir().ok();
                    let cwd = cwd.as_ref().map(|p| p.as_os_str().as_bytes());
                    let set = PrefixSet::parse(&text, cwd);
                    log::debug!(
                        "{} refreshed: {} prefix(es)",
                        category.env_var(),
                        set.len()
                    );
                    slot.set = Some(set);
                    slot.revision = Some(text);
                }
            }
            None => {
                slot.set = None;
                slot.revision = None;
                if category.reports_absence() && !slot.absence_reported {
                    slot.absence_reported = true;
                    eprintln!("{}", absence_error(category));
                }
            }
        }

        slot.set.as_ref()
    }

    pub fn refresh_all<E: EnvSource + ?Sized>(&mut self, env: &E) {
        for category in Category::ALL {
            self.refresh(category, env);
        }
    }

    pub fn get(&self, category: Category) -> Option<&PrefixSet> {
        self.slots[category.index()].set.as_ref()
    }

    /// Drop every memoized set. The next refresh rebuilds from scratch.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.set = None;
            slot.revision = None;
        }
    }

    /// Install a set directly, bypassing the environment.
    pub fn install(&mut self, category: Category, set: Option<PrefixSet>) {
        let slot = &mut self.slots[category.index()];
        slot.revision = None;
        slot.set = set;
    }
}
