/// Session controller: registration, protected shell, teardown, report.
use crate::config::env::{
    pids_file, EnvSource, ProcessEnv, ACTIVE_TOKEN, ENV_SANDBOX_ACTIVE, ENV_SANDBOX_DIR,
    ENV_SANDBOX_LIB, ENV_SANDBOX_LOG, LD_PRELOAD_FILE, LIB_NAME,
};
use crate::config::types::{Result, SandboxError};
use crate::kernel::signal::SignalHandler;
use crate::safety::registry::{Registration, SessionRegistry};
use crate::session::environment::{build_child_environment, SessionPaths, SessionSettings};
use crate::session::summary::SessionSummary;
use log::{info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::time::Duration;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Directory searched before the controller's own directory.
const SYSTEM_LIB_DIR: &str = "/lib";

#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Explicit library path; overrides every other lookup
    pub lib: Option<PathBuf>,
    pub shell: PathBuf,
    /// Joined with spaces and passed to `shell -c`; empty for interactive
    pub command: Vec<String>,
    pub preload_file: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            lib: None,
            shell: PathBuf::from("/bin/bash"),
            command: Vec::new(),
            preload_file: PathBuf::from(LD_PRELOAD_FILE),
            log_dir: PathBuf::from("/tmp"),
        }
    }
}

impl SessionOptions {
    pub fn is_interactive(&self) -> bool {
        self.command.is_empty()
    }
}

pub struct SessionController<E = ProcessEnv> {
    options: SessionOptions,
    env: E,
}

impl SessionController<ProcessEnv> {
    pub fn new(options: SessionOptions) -> Self {
        Self::with_env(options, ProcessEnv)
    }
}

impl<E: EnvSource> SessionController<E> {
    pub fn with_env(options: SessionOptions, env: E) -> Self {
        Self { options, env }
    }

    /// Run one session to completion. Teardown runs whenever registration
    /// succeeded, including after spawn failures and caught signals.
    pub fn run(&self) -> Result<SessionSummary> {
        if self.already_armed() {
            return Err(SandboxError::Config(
                "Not launching a new sandbox instance: another one is already running in this process hierarchy"
                    .to_string(),
            ));
        }

        let lib = self.locate_library()?;
        let pid = std::process::id();
        let pids_file = pids_file(&self.env);
        let registry = SessionRegistry::new(&pids_file, &self.options.preload_file, &lib);

        let tag = self
            .env
            .var_os(ENV_SANDBOX_LOG)
            .and_then(|v| v.into_string().ok());
        let paths = SessionPaths::new(&self.options.log_dir, tag.as_deref(), pid);
        let settings = SessionSettings {
            sandbox_dir: self.sandbox_dir(&lib),
            lib: lib.clone(),
            preload_file: self.options.preload_file.clone(),
            pids_file,
            paths: paths.clone(),
        };
        let child_env = build_child_environment(&self.env, &settings);

        let signals = SignalHandler::init().map_err(SandboxError::Config)?;
        let registration = registry.register(pid)?;
        if registration == Registration::Unavailable {
            println!(">>> Couldn't adapt {}.", self.options.preload_file.display());
            println!(">>> It's possible that not all function calls are trapped");
        }

        if self.options.is_interactive() {
            println!("The protected environment has been started.");
            println!("{}", "-".repeat(80));
        }

        let status = self
            .spawn_shell(&child_env.vars, child_env.cwd.as_deref())
            .and_then(|child| wait_for_shell(child, &signals));

        if registration != Registration::Unavailable {
            match registry.unregister(pid) {
                Ok(true) => info!("Removed {} from the preload list", lib.display()),
                Ok(false) => {}
                Err(e) => warn!("Session teardown incomplete: {}", e),
            }
        }

        if self.options.is_interactive() {
            println!("{}", "=".repeat(80));
            println!("The protected environment has been shut down.");
        }

        let status = status?;
        let log_text = read_log(&paths.log_file);
        Ok(SessionSummary::new(
            &paths.log_file,
            log_text.as_deref(),
            status.code(),
        ))
    }

    fn already_armed(&self) -> bool {
        self.env
            .var_bytes(ENV_SANDBOX_ACTIVE)
            .map(|v| v.starts_with(ACTIVE_TOKEN.as_bytes()))
            .unwrap_or(false)
    }

    /// `--lib`, else `SANDBOX_LIB`, else the system library directory, else
    /// next to the controller executable.
    pub fn locate_library(&self) -> Result<PathBuf> {
        let explicit = self
            .options
            .lib
            .clone()
            .or_else(|| self.env.var_path(ENV_SANDBOX_LIB))
            .filter(|p| !p.as_os_str().is_empty());
        if let Some(lib) = explicit {
            return if lib.is_file() {
                Ok(absolute(&lib))
            } else {
                Err(SandboxError::Config(format!(
                    "Could not open the sandbox library at '{}'",
                    lib.display()
                )))
            };
        }

        let mut candidates = vec![Path::new(SYSTEM_LIB_DIR).join(LIB_NAME)];
        if let Some(dir) = executable_dir() {
            candidates.push(dir.join(LIB_NAME));
        }
        candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .ok_or_else(|| {
                SandboxError::Config(format!(
                    "Could not find {} in {}",
                    LIB_NAME,
                    candidates
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }

    fn sandbox_dir(&self, lib: &Path) -> PathBuf {
        self.env
            .var_path(ENV_SANDBOX_DIR)
            .filter(|p| !p.as_os_str().is_empty())
            .or_else(executable_dir)
            .or_else(|| lib.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    fn spawn_shell(
        &self,
        vars: &std::collections::BTreeMap<String, std::ffi::OsString>,
        cwd: Option<&Path>,
    ) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.options.shell);
        if !self.options.is_interactive() {
            cmd.arg("-c").arg(self.options.command.join(" "));
        }
        cmd.envs(vars);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        info!(
            "Starting {} {:?}",
            self.options.shell.display(),
            self.options.command
        );
        cmd.spawn()
    }
}

/// Wait for the shell, forwarding hangup and termination to it. The terminal
/// already delivers SIGINT and SIGQUIT to the shell's process group.
fn wait_for_shell(mut child: Child, signals: &SignalHandler) -> std::io::Result<ExitStatus> {
    let child_pid = Pid::from_raw(child.id() as i32);
    loop {
        if let Some(sig) = signals.take_signal() {
            if matches!(sig, Signal::SIGHUP | Signal::SIGTERM) {
                info!("Forwarding {} to shell {}", sig, child_pid);
                if let Err(e) = kill(child_pid, sig) {
                    warn!("Could not forward {}: {}", sig, e);
                }
            }
        }
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        std::thread::sleep(WAIT_POLL_INTERVAL);
    }
}

fn read_log(path: &Path) -> Option<String> {
    std::fs::read(path)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn executable_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::env::{MapEnv, ENV_SANDBOX_PIDS_FILE};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        lib: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let lib = dir.path().join(LIB_NAME);
            std::fs::write(&lib, b"").unwrap();
            Self { dir, lib }
        }

        fn options(&self, command: &str) -> SessionOptions {
            SessionOptions {
                lib: Some(self.lib.clone()),
                shell: PathBuf::from("/bin/sh"),
                command: vec![command.to_string()],
                preload_file: self.dir.path().join("ld.so.preload"),
                log_dir: self.dir.path().to_path_buf(),
            }
        }

        fn env(&self) -> MapEnv {
            MapEnv::new().with(ENV_SANDBOX_PIDS_FILE, self.dir.path().join("pids"))
        }
    }

    #[test]
    fn refuses_to_nest() {
        let fx = Fixture::new();
        let env = fx.env().with(ENV_SANDBOX_ACTIVE, ACTIVE_TOKEN);
        let controller = SessionController::with_env(fx.options("true"), env);
        assert!(matches!(controller.run(), Err(SandboxError::Config(_))));
    }

    #[test]
    fn missing_explicit_library_is_an_error() {
        let fx = Fixture::new();
        let mut options = fx.options("true");
        options.lib = Some(fx.dir.path().join("nope.so"));
        let controller = SessionController::with_env(options, fx.env());
        let err = controller.locate_library().unwrap_err();
        assert!(err.to_string().contains("nope.so"));
    }

    #[test]
    fn clean_session_registers_and_tears_down() {
        let fx = Fixture::new();
        let options = fx.options("test \"$SANDBOX_ACTIVE\" = armedandready");
        let preload = options.preload_file.clone();
        let controller = SessionController::with_env(options, fx.env());

        let summary = controller.run().unwrap();
        assert_eq!(summary.shell_exit_code, Some(0));
        assert!(!summary.log_present);
        assert_eq!(summary.exit_code, 0);
        assert!(!preload.exists());
        assert!(!fx.dir.path().join("pids").exists());
    }

    #[test]
    fn shell_failure_sets_exit_code() {
        let fx = Fixture::new();
        let controller = SessionController::with_env(fx.options("exit 3"), fx.env());
        let summary = controller.run().unwrap();
        assert_eq!(summary.shell_exit_code, Some(3));
        assert_eq!(summary.exit_code, 1);
    }

    #[test]
    fn existing_log_is_reported() {
        let fx = Fixture::new();
        let command = "printf 'unlink:    /etc/passwd\\n' >> \"$SANDBOX_LOG\"";
        let controller = SessionController::with_env(fx.options(command), fx.env());
        let summary = controller.run().unwrap();
        assert!(summary.log_present);
        assert_eq!(summary.violations.len(), 1);
        assert_eq!(summary.violations[0].path, "/etc/passwd");
        assert_eq!(summary.exit_code, 1);
    }
}
