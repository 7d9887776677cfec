/// Access audit logging for the interposition library.
///
/// Visible denials go to stderr and, when `SANDBOX_LOG` is set, to the
/// violation log. In debug mode every other decision goes to the debug log or
/// to stderr. Every append first passes the tamper checks in
/// [`crate::safety::file_check`].
use crate::config::env::{
    is_debug_on, service_user, EnvSource, ENV_SANDBOX_DEBUG_LOG, ENV_SANDBOX_LOG,
};
use crate::config::types::{Result, SandboxError, TamperReason, Verdict};
use crate::policy::decision::OperationClass;
use crate::safety::file_check::{check_file_safety, open_for_append, TrustedIdentity};
use log::{debug, warn};
use once_cell::sync::OnceCell;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

pub const DENIED_PREFIX: &str = "\x1b[31;01mACCESS DENIED\x1b[0m  ";
pub const ALLOWED_PREFIX: &str = "\x1b[32;01mACCESS ALLOWED\x1b[0m ";
pub const BREACH_PREFIX: &str = "\x1b[31;01mSECURITY BREACH\x1b[0m  ";

/// Width of the `"<op>:"` column in log lines.
const OP_COLUMN: usize = 11;

/// `"<op>:"` left-justified to the op column, then the path and a newline.
pub fn format_line(op: &str, path: &[u8]) -> Vec<u8> {
    let mut line = format!("{:<width$}", format!("{}:", op), width = OP_COLUMN).into_bytes();
    line.extend_from_slice(path);
    line.push(b'\n');
    line
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Destination {
    Violations,
    Debug,
}

/// Per-process audit state.
#[derive(Debug, Default)]
pub struct AuditLog {
    violations_disabled: AtomicBool,
    debug_disabled: AtomicBool,
    trusted: OnceCell<TrustedIdentity>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed owner allow-list instead of looking one up.
    pub fn with_trusted(trusted: TrustedIdentity) -> Self {
        let log = Self::default();
        let _ = log.trusted.set(trusted);
        log
    }

    /// Record one decision.
    ///
    /// `log_permitted` answers whether the current policy lets this process
    /// write the given log path; a log that is not writable under policy is
    /// disabled for the rest of the process.
    pub fn record<E: EnvSource + ?Sized>(
        &self,
        env: &E,
        op: OperationClass,
        path: &[u8],
        verdict: Verdict,
        log_permitted: &mut dyn FnMut(&Path) -> bool,
    ) {
        let line = format_line(op.name(), path);

        if verdict.is_visible_denial() {
            stderr_line(DENIED_PREFIX, &line);
            if let Some(log) = env.var_path(ENV_SANDBOX_LOG) {
                self.append(Destination::Violations, &log, &line, env, log_permitted);
            }
            return;
        }

        if !is_debug_on(env) {
            return;
        }

        match env.var_path(ENV_SANDBOX_DEBUG_LOG) {
            Some(debug_log) => {
                if path.starts_with(debug_log.as_os_str().as_bytes()) {
                    return;
                }
                self.append(Destination::Debug, &debug_log, &line, env, log_permitted);
            }
            None if verdict.allowed => stderr_line(ALLOWED_PREFIX, &line),
            None => {}
        }
    }

    fn append<E: EnvSource + ?Sized>(
        &self,
        dest: Destination,
        path: &Path,
        line: &[u8],
        env: &E,
        log_permitted: &mut dyn FnMut(&Path) -> bool,
    ) {
        let disabled = match dest {
            Destination::Violations => &self.violations_disabled,
            Destination::Debug => &self.debug_disabled,
        };
        if disabled.load(Ordering::Relaxed) || path.as_os_str().is_empty() {
            return;
        }

        if !log_permitted(path) {
            if !disabled.swap(true, Ordering::Relaxed) {
                let err = SandboxError::TamperingDetected {
                    path: path.to_path_buf(),
                    reason: TamperReason::NotPermittedByPolicy,
                };
                report_breach(&err);
            }
            return;
        }

        let trusted = self
            .trusted
            .get_or_init(|| TrustedIdentity::current(&service_user(env)));
        if let Err(e) = write_checked(path, line, trusted) {
            match e {
                SandboxError::TamperingDetected { .. } => report_breach(&e),
                other => warn!("Cannot append to {}: {}", path.display(), other),
            }
        }
    }
}

/// Tamper check, open, append.
pub fn write_checked(path: &Path, line: &[u8], trusted: &TrustedIdentity) -> Result<()> {
    check_file_safety(path, trusted)?;
    let mut file = open_for_append(path)?;
    file.write_all(line)?;
    debug!("audit line appended to {}", path.display());
    Ok(())
}

fn stderr_line(prefix: &str, line: &[u8]) {
    let mut err = std::io::stderr().lock();
    let _ = err.write_all(prefix.as_bytes());
    let _ = err.write_all(line);
}

fn report_breach(err: &SandboxError) {
    let _ = writeln!(std::io::stderr().lock(), "{}{}", BREACH_PREFIX, err);
}
