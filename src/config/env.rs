//! Environment variable interface shared by the interposition library and the
//! session controller.
//!
//! All policy reaches a sandboxed process through its inherited environment.
//! Reads go through [`EnvSource`] so the decision path can be driven from an
//! in-memory map in tests.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

pub const ENV_SANDBOX_ON: &str = "SANDBOX_ON";
pub const ENV_SANDBOX_ACTIVE: &str = "SANDBOX_ACTIVE";
pub const ENV_SANDBOX_DENY: &str = "SANDBOX_DENY";
pub const ENV_SANDBOX_READ: &str = "SANDBOX_READ";
pub const ENV_SANDBOX_WRITE: &str = "SANDBOX_WRITE";
pub const ENV_SANDBOX_PREDICT: &str = "SANDBOX_PREDICT";
pub const ENV_SANDBOX_LOG: &str = "SANDBOX_LOG";
pub const ENV_SANDBOX_DEBUG: &str = "SANDBOX_DEBUG";
pub const ENV_SANDBOX_DEBUG_LOG: &str = "SANDBOX_DEBUG_LOG";
pub const ENV_SANDBOX_LIB: &str = "SANDBOX_LIB";
pub const ENV_SANDBOX_DIR: &str = "SANDBOX_DIR";
pub const ENV_SANDBOX_PIDS_FILE: &str = "SANDBOX_PIDS_FILE";
pub const ENV_SANDBOX_BEEP: &str = "SANDBOX_BEEP";
pub const ENV_SANDBOX_SERVICE_USER: &str = "SANDBOX_SERVICE_USER";
pub const ENV_LD_PRELOAD: &str = "LD_PRELOAD";
pub const ENV_PATH: &str = "PATH";

/// Value of `SANDBOX_ACTIVE` that only the controller sets.
pub const ACTIVE_TOKEN: &str = "armedandready";

/// Global dynamic-linker preload configuration file.
pub const LD_PRELOAD_FILE: &str = "/etc/ld.so.preload";

/// File name of the interposition library built by `preload/`.
pub const LIB_NAME: &str = "libsandbox_preload.so";

pub const DEFAULT_PIDS_FILE: &str = "/tmp/sandboxpids.tmp";
pub const DEFAULT_SERVICE_USER: &str = "portage";
pub const DEFAULT_BEEP_COUNT: u32 = 3;

/// Read-only view of an environment.
pub trait EnvSource {
    fn var_os(&self, name: &str) -> Option<OsString>;

    fn var_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.var_os(name).map(|v| v.as_bytes().to_vec())
    }

    fn var_path(&self, name: &str) -> Option<PathBuf> {
        self.var_os(name).map(PathBuf::from)
    }
}

/// The live process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var_os(&self, name: &str) -> Option<OsString> {
        std::env::var_os(name)
    }
}

/// Fixed environment, used by tests and by the controller when it prepares
/// a child environment.
#[derive(Debug, Default, Clone)]
pub struct MapEnv {
    vars: HashMap<String, OsString>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl AsRef<OsStr>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl AsRef<OsStr>) {
        self.vars.insert(name.to_string(), value.as_ref().to_os_string());
    }

    pub fn remove(&mut self, name: &str) {
        self.vars.remove(name);
    }
}

impl EnvSource for MapEnv {
    fn var_os(&self, name: &str) -> Option<OsString> {
        self.vars.get(name).cloned()
    }
}

/// The sandbox is armed only when the human-set request and the
/// controller-set token are both present.
pub fn is_sandbox_on<E: EnvSource + ?Sized>(env: &E) -> bool {
    let on = env
        .var_bytes(ENV_SANDBOX_ON)
        .map(|v| v.starts_with(b"1"))
        .unwrap_or(false);
    let active = env
        .var_bytes(ENV_SANDBOX_ACTIVE)
        .map(|v| v.starts_with(ACTIVE_TOKEN.as_bytes()))
        .unwrap_or(false);
    on && active
}

/// Debug mode is enabled by the mere presence of `SANDBOX_DEBUG`.
pub fn is_debug_on<E: EnvSource + ?Sized>(env: &E) -> bool {
    env.var_os(ENV_SANDBOX_DEBUG).is_some()
}

pub fn pids_file<E: EnvSource + ?Sized>(env: &E) -> PathBuf {
    env.var_path(ENV_SANDBOX_PIDS_FILE)
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PIDS_FILE))
}

pub fn service_user<E: EnvSource + ?Sized>(env: &E) -> String {
    env.var_os(ENV_SANDBOX_SERVICE_USER)
        .and_then(|v| v.into_string().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_SERVICE_USER.to_string())
}

/// Number of audible alerts after a session with violations. Unparseable
/// values count as zero, like `atoi`.
pub fn beep_count<E: EnvSource + ?Sized>(env: &E) -> u32 {
    match env.var_os(ENV_SANDBOX_BEEP) {
        Some(v) => v
            .to_str()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(0),
        None => DEFAULT_BEEP_COUNT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_requires_both_activation_variables() {
        let env = MapEnv::new().with(ENV_SANDBOX_ON, "1");
        assert!(!is_sandbox_on(&env));

        let env = env.with(ENV_SANDBOX_ACTIVE, ACTIVE_TOKEN);
        assert!(is_sandbox_on(&env));
    }

    #[test]
    fn forged_token_keeps_sandbox_off() {
        let env = MapEnv::new()
            .with(ENV_SANDBOX_ON, "1")
            .with(ENV_SANDBOX_ACTIVE, "armed");
        assert!(!is_sandbox_on(&env));

        let env = MapEnv::new()
            .with(ENV_SANDBOX_ON, "0")
            .with(ENV_SANDBOX_ACTIVE, ACTIVE_TOKEN);
        assert!(!is_sandbox_on(&env));
    }

    #[test]
    fn pids_file_defaults_when_unset_or_empty() {
        assert_eq!(pids_file(&MapEnv::new()), PathBuf::from(DEFAULT_PIDS_FILE));
        let env = MapEnv::new().with(ENV_SANDBOX_PIDS_FILE, "");
        assert_eq!(pids_file(&env), PathBuf::from(DEFAULT_PIDS_FILE));
        let env = MapEnv::new().with(ENV_SANDBOX_PIDS_FILE, "/run/sb.pids");
        assert_eq!(pids_file(&env), PathBuf::from("/run/sb.pids"));
    }

    #[test]
    fn beep_count_parsing() {
        assert_eq!(beep_count(&MapEnv::new()), DEFAULT_BEEP_COUNT);
        assert_eq!(beep_count(&MapEnv::new().with(ENV_SANDBOX_BEEP, "5")), 5);
        assert_eq!(beep_count(&MapEnv::new().with(ENV_SANDBOX_BEEP, "loud")), 0);
    }
}
