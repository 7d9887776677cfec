//! Access decision engine.
//!
//! Maps an operation class and a canonical path to a [`Verdict`] using a
//! fixed precedence: preload-file carve-out, deny, read, write, predict.

use std::fmt;

use crate::config::env::{EnvSource, LD_PRELOAD_FILE};
use crate::config::types::{Result, SandboxError, Verdict};
use crate::policy::canonicalize::CanonicalPath;
use crate::policy::prefix::{Category, PolicyStore};

/// Whether an operation only observes the filesystem or changes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationClass {
    OpenRead,
    OpenWrite,
    Opendir,
    Popen,
    System,
    Execl,
    Execlp,
    Execle,
    Execv,
    Execvp,
    Execve,
    PosixSpawn,
    PosixSpawnp,
    Creat,
    Creat64,
    Mkdir,
    Mknod,
    Mkfifo,
    Link,
    Symlink,
    Rename,
    Utime,
    Utimes,
    Unlink,
    Rmdir,
    Chown,
    Lchown,
    Chmod,
    Truncate,
    Ftruncate,
    Truncate64,
    Ftruncate64,
}

impl OperationClass {
    pub const ALL: [OperationClass; 32] = [
        Self::OpenRead,
        Self::OpenWrite,
        Self::Opendir,
        Self::Popen,
        Self::System,
        Self::Execl,
        Self::Execlp,
        Self::Execle,
        Self::Execv,
        Self::Execvp,
        Self::Execve,
        Self::PosixSpawn,
        Self::PosixSpawnp,
        Self::Creat,
        Self::Creat64,
        Self::Mkdir,
        Self::Mknod,
        Self::Mkfifo,
        Self::Link,
        Self::Symlink,
        Self::Rename,
        Self::Utime,
        Self::Utimes,
        Self::Unlink,
        Self::Rmdir,
        Self::Chown,
        Self::Lchown,
        Self::Chmod,
        Self::Truncate,
        Self::Ftruncate,
        Self::Truncate64,
        Self::Ftruncate64,
    ];

    /// Name used in log lines.
    pub fn name(self) -> &'static str {
        match self {
            Self::OpenRead => "open_read",
            Self::OpenWrite => "open_write",
            Self::Opendir => "opendir",
            Self::Popen => "popen",
            Self::System => "system",
            Self::Execl => "execl",
            Self::Execlp => "execlp",
            Self::Execle => "execle",
            Self::Execv => "execv",
            Self::Execvp => "execvp",
            Self::Execve => "execve",
            Self::PosixSpawn => "posix_spawn",
            Self::PosixSpawnp => "posix_spawnp",
            Self::Creat => "creat",
            Self::Creat64 => "creat64",
            Self::Mkdir => "mkdir",
            Self::Mknod => "mknod",
            Self::Mkfifo => "mkfifo",
            Self::Link => "link",
            Self::Symlink => "symlink",
            Self::Rename => "rename",
            Self::Utime => "utime",
            Self::Utimes => "utimes",
            Self::Unlink => "unlink",
            Self::Rmdir => "rmdir",
            Self::Chown => "chown",
            Self::Lchown => "lchown",
            Self::Chmod => "chmod",
            Self::Truncate => "truncate",
            Self::Ftruncate => "ftruncate",
            Self::Truncate64 => "truncate64",
            Self::Ftruncate64 => "ftruncate64",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    pub fn kind(self) -> AccessKind {
        match self {
            Self::OpenRead
            | Self::Opendir
            | Self::Popen
            | Self::System
            | Self::Execl
            | Self::Execlp
            | Self::Execle
            | Self::Execv
            | Self::Execvp
            | Self::Execve
            | Self::PosixSpawn
            | Self::PosixSpawnp => AccessKind::Read,
            _ => AccessKind::Write,
        }
    }

    /// Classify an `open` call from its flags.
    ///
    /// `O_CREAT` and `O_TRUNC` count as writes even with `O_RDONLY`, since
    /// both can change the filesystem.
    pub fn from_open_flags(flags: libc::c_int) -> Self {
        let writes = libc::O_WRONLY | libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC;
        if flags & writes != 0 {
            Self::OpenWrite
        } else {
            Self::OpenRead
        }
    }

    /// Classify an `fopen` call from its mode string: `r` followed only by
    /// non-writing modifiers is a read, anything else a write.
    pub fn from_fopen_mode(mode: &[u8]) -> Self {
        match mode.split_first() {
            Some((b'r', rest)) if rest.iter().all(|c| b"xbtmce".contains(c)) => Self::OpenRead,
            _ => Self::OpenWrite,
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Host facts the decision needs beyond the prefix sets.
pub trait HostProbe {
    /// True when the calling process is a registered session controller.
    fn is_registered_session(&self) -> bool;

    fn is_existing_directory(&self, path: &CanonicalPath) -> bool;
}

/// Probe backed by the real filesystem and session registry.
#[derive(Debug, Clone)]
pub struct LiveProbe {
    pids_file: std::path::PathBuf,
}

impl LiveProbe {
    pub fn new(pids_file: std::path::PathBuf) -> Self {
        Self { pids_file }
    }

    pub fn from_env<E: EnvSource + ?Sized>(env: &E) -> Self {
        Self::new(crate::config::env::pids_file(env))
    }
}

impl HostProbe for LiveProbe {
    fn is_registered_session(&self) -> bool {
        crate::safety::registry::is_registered(&self.pids_file, std::process::id())
    }

    fn is_existing_directory(&self, path: &CanonicalPath) -> bool {
        std::fs::metadata(path.as_path())
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}

/// Per-process decision state: the four prefix sets and the violation flag
/// of the decision in progress.
#[derive(Debug)]
pub struct SandboxContext {
    store: PolicyStore,
    show_violation: bool,
}

impl Default for SandboxContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxContext {
    pub fn new() -> Self {
        Self {
            store: PolicyStore::new(),
            show_violation: true,
        }
    }

    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut PolicyStore {
        &mut self.store
    }

    pub fn refresh<E: EnvSource + ?Sized>(&mut self, env: &E) {
        self.store.refresh_all(env);
    }

    /// Decide on `op` against `path` using the currently installed sets.
    pub fn decide(
        &mut self,
        op: OperationClass,
        path: &CanonicalPath,
        probe: &dyn HostProbe,
    ) -> Verdict {
        self.show_violation = true;
        let allowed = self.evaluate(op, path, probe);
        Verdict {
            allowed,
            show_violation: self.show_violation,
        }
    }

    /// [`SandboxContext::decide`] for internal callers: a denial becomes
    /// [`SandboxError::AccessDenied`].
    pub fn check(
        &mut self,
        op: OperationClass,
        path: &CanonicalPath,
        probe: &dyn HostProbe,
    ) -> Result<Verdict> {
        let verdict = self.decide(op, path, probe);
        if verdict.allowed {
            Ok(verdict)
        } else {
            Err(SandboxError::AccessDenied {
                operation: op.name().to_string(),
                path: path.to_string(),
            })
        }
    }

    fn evaluate(&mut self, op: OperationClass, path: &CanonicalPath, probe: &dyn HostProbe) -> bool {
        let matches = |store: &PolicyStore, category| {
            store
                .get(category)
                .map(|set| set.matches(path))
                .unwrap_or(false)
        };

        if path.starts_with(LD_PRELOAD_FILE.as_bytes()) && probe.is_registered_session() {
            return true;
        }

        if matches(&self.store, Category::Deny) {
            return false;
        }

        match op.kind() {
            AccessKind::Read => {
                // An unset read list grants everything; a set one must match.
                if self.store.get(Category::Read).is_none() {
                    return true;
                }
                if matches(&self.store, Category::Read) {
                    return true;
                }
            }
            AccessKind::Write => {
                if matches(&self.store, Category::Write) {
                    return true;
                }
                if op == OperationClass::Mkdir && probe.is_existing_directory(path) {
                    self.show_violation = false;
                    return true;
                }
                if matches(&self.store, Category::Predict) {
                    self.show_violation = false;
                    return true;
                }
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::env::{
        MapEnv, ENV_SANDBOX_DENY, ENV_SANDBOX_PREDICT, ENV_SANDBOX_READ, ENV_SANDBOX_WRITE,
    };
    use crate::policy::canonicalize::canonicalize_in;

    #[derive(Default)]
    struct FakeProbe {
        registered: bool,
        directories: Vec<&'static str>,
    }

    impl HostProbe for FakeProbe {
        fn is_registered_session(&self) -> bool {
            self.registered
        }

        fn is_existing_directory(&self, path: &CanonicalPath) -> bool {
            self.directories
                .iter()
                .any(|d| d.as_bytes() == path.as_bytes())
        }
    }

    fn canon(path: &str) -> CanonicalPath {
        canonicalize_in(path.as_bytes(), b"/", None).unwrap()
    }

    fn context(env: &MapEnv) -> SandboxContext {
        let mut ctx = SandboxContext::new();
        ctx.refresh(env);
        ctx
    }

    fn build_env() -> MapEnv {
        MapEnv::new()
            .with(ENV_SANDBOX_DENY, "/etc")
            .with(ENV_SANDBOX_READ, "/")
            .with(ENV_SANDBOX_WRITE, "/tmp/build")
    }

    #[test]
    fn deny_wins_over_every_other_list() {
        let env = MapEnv::new()
            .with(ENV_SANDBOX_DENY, "/secret")
            .with(ENV_SANDBOX_READ, "/")
            .with(ENV_SANDBOX_WRITE, "/")
            .with(ENV_SANDBOX_PREDICT, "/");
        let mut ctx = context(&env);
        let probe = FakeProbe::default();
        for op in OperationClass::ALL {
            let verdict = ctx.decide(op, &canon("/secret/key"), &probe);
            assert_eq!(verdict, Verdict::DENY, "{op}");
        }
    }

    #[test]
    fn build_scenario() {
        let mut ctx = context(&build_env());
        let probe = FakeProbe::default();

        assert_eq!(
            ctx.decide(OperationClass::OpenRead, &canon("/usr/include/stdio.h"), &probe),
            Verdict::ALLOW
        );
        assert_eq!(
            ctx.decide(OperationClass::OpenWrite, &canon("/tmp/build/out.o"), &probe),
            Verdict::ALLOW
        );
        assert_eq!(
            ctx.decide(OperationClass::Unlink, &canon("/etc/passwd"), &probe),
            Verdict::DENY
        );
        assert_eq!(
            ctx.decide(OperationClass::Mkdir, &canon("/home/user/x"), &probe),
            Verdict::DENY
        );
    }

    #[test]
    fn check_turns_denial_into_error() {
        let mut ctx = context(&build_env());
        let probe = FakeProbe::default();

        assert_eq!(
            ctx.check(OperationClass::OpenWrite, &canon("/tmp/build/a.log"), &probe)
                .unwrap(),
            Verdict::ALLOW
        );
        let err = ctx
            .check(OperationClass::OpenWrite, &canon("/var/log/a.log"), &probe)
            .unwrap_err();
        assert!(matches!(err, SandboxError::AccessDenied { .. }));
        assert_eq!(err.to_string(), "Access denied: open_write /var/log/a.log");
    }

    #[test]
    fn unmatched_write_class_is_visible_denial() {
        let mut ctx = context(&build_env());
        let probe = FakeProbe::default();
        for op in OperationClass::ALL
            .into_iter()
            .filter(|op| op.kind() == AccessKind::Write)
        {
            let verdict = ctx.decide(op, &canon("/opt/elsewhere"), &probe);
            assert!(verdict.is_visible_denial(), "{op}");
        }
    }

    #[test]
    fn read_list_definedness() {
        let probe = FakeProbe::default();
        let path = canon("/opt/data");

        let mut ctx = context(&MapEnv::new());
        assert!(ctx.decide(OperationClass::OpenRead, &path, &probe).allowed);

        let mut ctx = context(&MapEnv::new().with(ENV_SANDBOX_READ, ""));
        assert_eq!(
            ctx.decide(OperationClass::OpenRead, &path, &probe),
            Verdict::DENY
        );

        let mut ctx = context(&MapEnv::new().with(ENV_SANDBOX_READ, "/usr"));
        assert!(!ctx.decide(OperationClass::Execve, &path, &probe).allowed);
        assert!(ctx.decide(OperationClass::Execve, &canon("/usr/bin/cc"), &probe).allowed);
    }

    #[test]
    fn predict_allows_silently() {
        let env = build_env().with(ENV_SANDBOX_PREDICT, "/home/user/.");
        let mut ctx = context(&env);
        let probe = FakeProbe::default();
        assert_eq!(
            ctx.decide(OperationClass::OpenWrite, &canon("/home/user/.cache"), &probe),
            Verdict::ALLOW_SILENT
        );
        // Predict never widens reads.
        let env = MapEnv::new()
            .with(ENV_SANDBOX_READ, "/usr")
            .with(ENV_SANDBOX_PREDICT, "/home");
        let mut ctx = context(&env);
        assert!(!ctx.decide(OperationClass::OpenRead, &canon("/home/x"), &probe).allowed);
    }

    #[test]
    fn mkdir_on_existing_directory_is_silent() {
        let mut ctx = context(&build_env());
        let probe = FakeProbe {
            directories: vec!["/usr/lib"],
            ..Default::default()
        };
        assert_eq!(
            ctx.decide(OperationClass::Mkdir, &canon("/usr/lib"), &probe),
            Verdict::ALLOW_SILENT
        );
        assert_eq!(
            ctx.decide(OperationClass::Rmdir, &canon("/usr/lib"), &probe),
            Verdict::DENY
        );
    }

    #[test]
    fn preload_file_carve_out_needs_registration() {
        let env = MapEnv::new()
            .with(ENV_SANDBOX_DENY, LD_PRELOAD_FILE)
            .with(ENV_SANDBOX_READ, "/")
            .with(ENV_SANDBOX_WRITE, "/tmp");
        let mut ctx = context(&env);
        let path = canon(LD_PRELOAD_FILE);

        let outsider = FakeProbe::default();
        assert_eq!(
            ctx.decide(OperationClass::OpenWrite, &path, &outsider),
            Verdict::DENY
        );

        let controller = FakeProbe {
            registered: true,
            ..Default::default()
        };
        assert_eq!(
            ctx.decide(OperationClass::OpenWrite, &path, &controller),
            Verdict::ALLOW
        );
    }

    #[test]
    fn violation_flag_resets_each_decision() {
        let env = build_env().with(ENV_SANDBOX_PREDICT, "/var/cache");
        let mut ctx = context(&env);
        let probe = FakeProbe::default();
        assert!(!ctx
            .decide(OperationClass::Unlink, &canon("/var/cache/x"), &probe)
            .show_violation);
        assert!(ctx
            .decide(OperationClass::Unlink, &canon("/srv/x"), &probe)
            .show_violation);
    }

    #[test]
    fn open_flags_classification() {
        assert_eq!(
            OperationClass::from_open_flags(libc::O_RDONLY),
            OperationClass::OpenRead
        );
        assert_eq!(
            OperationClass::from_open_flags(libc::O_RDONLY | libc::O_CLOEXEC),
            OperationClass::OpenRead
        );
        assert_eq!(
            OperationClass::from_open_flags(libc::O_WRONLY),
            OperationClass::OpenWrite
        );
        assert_eq!(
            OperationClass::from_open_flags(libc::O_RDWR),
            OperationClass::OpenWrite
        );
        assert_eq!(
            OperationClass::from_open_flags(libc::O_RDONLY | libc::O_CREAT),
            OperationClass::OpenWrite
        );
    }

    #[test]
    fn fopen_mode_classification() {
        for mode in ["r", "rb", "rt", "rbe", "rx", "rm", "rc"] {
            assert_eq!(
                OperationClass::from_fopen_mode(mode.as_bytes()),
                OperationClass::OpenRead,
                "{mode}"
            );
        }
        for mode in ["r+", "rb+", "w", "a", "wb", "a+", ""] {
            assert_eq!(
                OperationClass::from_fopen_mode(mode.as_bytes()),
                OperationClass::OpenWrite,
                "{mode}"
            );
        }
    }

    #[test]
    fn names_round_trip() {
        assert_eq!(OperationClass::from_name("open_write"), Some(OperationClass::OpenWrite));
        assert_eq!(OperationClass::from_name("ftruncate64"), Some(OperationClass::Ftruncate64));
        assert_eq!(OperationClass::from_name("fork"), None);
        assert_eq!(
            OperationClass::from_name("posix_spawnp"),
            Some(OperationClass::PosixSpawnp)
        );
    }

    #[test]
    fn program_launches_are_reads() {
        for op in [
            OperationClass::Execlp,
            OperationClass::Execvp,
            OperationClass::PosixSpawn,
            OperationClass::PosixSpawnp,
        ] {
            assert_eq!(op.kind(), AccessKind::Read, "{op}");
        }
        assert_eq!(OperationClass::Mknod.kind(), AccessKind::Write);
    }
}
