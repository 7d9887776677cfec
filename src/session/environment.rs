/// Child environment for a sandbox session.
///
/// Computes the variables handed to the session shell: log locations,
/// library identity, activation token and default policy for any category
/// the caller left unset. The controller's own environment is never changed.
use crate::config::env::{
    EnvSource, ACTIVE_TOKEN, ENV_LD_PRELOAD, ENV_SANDBOX_ACTIVE, ENV_SANDBOX_DEBUG_LOG,
    ENV_SANDBOX_DENY, ENV_SANDBOX_DIR, ENV_SANDBOX_LIB, ENV_SANDBOX_LOG, ENV_SANDBOX_ON,
    ENV_SANDBOX_PIDS_FILE, ENV_SANDBOX_PREDICT, ENV_SANDBOX_READ, ENV_SANDBOX_WRITE,
};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Device nodes a build may always write.
const DEVICE_WRITE_PREFIXES: [&str; 6] = [
    "/dev/zero",
    "/dev/fd/",
    "/dev/null",
    "/dev/pts/",
    "/dev/vc/",
    "/dev/tty",
];

/// Scratch files autoconf probes and desktop helpers are known to touch.
const KNOWN_SCRATCH_FILES: [&str; 5] = [
    "/var/log/scrollkeeper.log",
    "/usr/tmp/conftest",
    "/usr/lib/conftest",
    "/usr/tmp/cf",
    "/usr/lib/cf",
];

/// Log files of one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionPaths {
    pub log_file: PathBuf,
    pub debug_log_file: PathBuf,
}

impl SessionPaths {
    /// `<dir>/sandbox-[<tag>-]<pid>.log` and `<dir>/sandbox-debug-<pid>.log`.
    pub fn new(log_dir: &Path, tag: Option<&str>, pid: u32) -> Self {
        let log_name = match tag.filter(|t| !t.is_empty()) {
            Some(tag) => format!("sandbox-{}-{}.log", tag, pid),
            None => format!("sandbox-{}.log", pid),
        };
        Self {
            log_file: log_dir.join(log_name),
            debug_log_file: log_dir.join(format!("sandbox-debug-{}.log", pid)),
        }
    }
}

/// Inputs the controller has already resolved.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub lib: PathBuf,
    pub sandbox_dir: PathBuf,
    pub preload_file: PathBuf,
    pub pids_file: PathBuf,
    pub paths: SessionPaths,
}

/// Variables to set on the child, plus its working directory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChildEnvironment {
    pub vars: BTreeMap<String, OsString>,
    pub cwd: Option<PathBuf>,
}

impl ChildEnvironment {
    pub fn get(&self, name: &str) -> Option<&OsString> {
        self.vars.get(name)
    }

    fn set(&mut self, name: &str, value: impl Into<OsString>) {
        self.vars.insert(name.to_string(), value.into());
    }
}

pub fn build_child_environment<E: EnvSource + ?Sized>(
    env: &E,
    settings: &SessionSettings,
) -> ChildEnvironment {
    let mut child = ChildEnvironment::default();

    child.set(ENV_SANDBOX_LOG, settings.paths.log_file.as_os_str());
    child.set(ENV_SANDBOX_DEBUG_LOG, settings.paths.debug_log_file.as_os_str());
    child.set(ENV_SANDBOX_DIR, settings.sandbox_dir.as_os_str());
    child.set(ENV_SANDBOX_LIB, settings.lib.as_os_str());
    child.set(ENV_SANDBOX_PIDS_FILE, settings.pids_file.as_os_str());
    child.set(ENV_LD_PRELOAD, settings.lib.as_os_str());

    let home = env.var_path("HOME").filter(|h| !h.as_os_str().is_empty());
    let portage_tmp = env
        .var_path("PORTAGE_TMPDIR")
        .filter(|p| !p.as_os_str().is_empty())
        .and_then(|p| std::fs::canonicalize(p).ok());

    if env.var_os(ENV_SANDBOX_DENY).is_none() {
        child.set(ENV_SANDBOX_DENY, settings.preload_file.as_os_str());
    }
    if env.var_os(ENV_SANDBOX_READ).is_none() {
        child.set(ENV_SANDBOX_READ, "/");
    }
    if env.var_os(ENV_SANDBOX_WRITE).is_none() {
        child.set(
            ENV_SANDBOX_WRITE,
            default_write_list(home.as_deref(), portage_tmp.as_deref()),
        );
    }
    if env.var_os(ENV_SANDBOX_PREDICT).is_none() {
        if let Some(home) = home.as_deref() {
            child.set(ENV_SANDBOX_PREDICT, format!("{}/.", home.display()));
        }
    }
    if env.var_os(ENV_SANDBOX_ON).is_none() {
        child.set(ENV_SANDBOX_ON, "1");
    }
    child.set(ENV_SANDBOX_ACTIVE, ACTIVE_TOKEN);

    child.cwd = portage_tmp;
    child
}

/// Colon-joined default write prefixes. Real paths of the temporary
/// directories are added so a symlinked `/var/tmp` still matches.
pub fn default_write_list(home: Option<&Path>, portage_tmp: Option<&Path>) -> String {
    let mut entries: Vec<String> = DEVICE_WRITE_PREFIXES.iter().map(|s| s.to_string()).collect();
    entries.push("/tmp/".to_string());
    entries.extend(KNOWN_SCRATCH_FILES.iter().map(|s| s.to_string()));

    if let Some(home) = home {
        entries.push(format!("{}/.gconfd/lock", home.display()));
        entries.push(format!("{}/.bash_history", home.display()));
    }
    if let Some(portage_tmp) = portage_tmp {
        entries.push(portage_tmp.display().to_string());
    }
    for dir in ["/tmp", "/var/tmp"] {
        if let Ok(real) = std::fs::canonicalize(dir) {
            entries.push(real.display().to_string());
        }
    }
    entries.push("/var/tmp/".to_string());

    let mut seen = std::collections::HashSet::new();
    entries.retain(|e| seen.insert(e.clone()));
    entries.join(":")
}
