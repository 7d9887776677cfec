//! Real process tests for the interposition library
//!
//! Each case re-runs this test binary as a child with the built
//! `libsandbox_preload.so` in `LD_PRELOAD`. The child performs one call
//! through the ordinary libc entry point and prints what it saw, so the
//! exported symbols, the C ABI and the exec environment are exercised the
//! way a confined build would hit them.

use pretty_assertions::assert_eq;
use std::ffi::{CStr, CString, OsStr};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::ptr;
use tempfile::TempDir;

use libc::{c_char, c_int};

const ACTION_VAR: &str = "SANDBOX_TEST_ACTION";
const TARGET_VAR: &str = "SANDBOX_TEST_TARGET";
const LIB_VAR: &str = "SANDBOX_PRELOAD_LIB";

const SHOW_PRELOAD: &CStr = c"echo PRELOAD=$LD_PRELOAD";

extern "C" {
    static environ: *const *mut c_char;
}

/// Built library: `SANDBOX_PRELOAD_LIB`, else next to this test binary.
fn preload_library() -> PathBuf {
    if let Some(lib) = std::env::var_os(LIB_VAR) {
        return PathBuf::from(lib);
    }
    let exe = std::env::current_exe().unwrap();
    let deps = exe.parent().unwrap();
    let lib = [Some(deps), deps.parent()]
        .into_iter()
        .flatten()
        .map(|dir| dir.join("libsandbox_preload.so"))
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| panic!("libsandbox_preload.so not found near {}", exe.display()));
    lib
}

struct Session {
    _dir: TempDir,
    root: PathBuf,
    lib: PathBuf,
}

impl Session {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        for sub in ["denied", "work", "outside"] {
            std::fs::create_dir(root.join(sub)).unwrap();
        }
        Self {
            _dir: dir,
            root,
            lib: preload_library(),
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Run `action` on `target` in a confined child and return its stdout.
    fn run(&self, action: &str, target: &Path) -> String {
        let output = Command::new(std::env::current_exe().unwrap())
            .args(["--exact", "child_action", "--nocapture", "--test-threads=1", "--quiet"])
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("SANDBOX_ON", "1")
            .env("SANDBOX_ACTIVE", "armedandready")
            .env("SANDBOX_DENY", self.path("denied"))
            .env("SANDBOX_READ", "/")
            .env("SANDBOX_WRITE", self.path("work"))
            .env("SANDBOX_LOG", self.path("work/sandbox.log"))
            .env("SANDBOX_PIDS_FILE", self.path("pids"))
            .env("LD_PRELOAD", &self.lib)
            .env(ACTION_VAR, action)
            .env(TARGET_VAR, target)
            .output()
            .unwrap();
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    /// `(rc, errno)` reported by the child.
    fn result(&self, action: &str, target: &Path) -> (i32, i32) {
        let stdout = self.run(action, target);
        let line = stdout
            .lines()
            .find_map(|l| l.strip_prefix("RESULT "))
            .unwrap_or_else(|| panic!("no result from {action}:\n{stdout}"));
        let field = |name: &str| -> i32 {
            line.split_whitespace()
                .find_map(|kv| kv.strip_prefix(name))
                .and_then(|v| v.parse().ok())
                .unwrap()
        };
        (field("rc="), field("errno="))
    }

    /// `LD_PRELOAD` as seen by a shell the child launched after clearing it.
    fn preload_seen_by(&self, action: &str) -> String {
        let stdout = self.run(action, &self.root);
        stdout
            .lines()
            .find_map(|l| l.strip_prefix("PRELOAD="))
            .unwrap_or_else(|| panic!("shell did not run for {action}:\n{stdout}"))
            .to_string()
    }
}

/// Entry point of the confined child; does nothing in a normal test run.
#[test]
fn child_action() {
    let Some(action) = std::env::var_os(ACTION_VAR) else {
        return;
    };
    let target = CString::new(std::env::var_os(TARGET_VAR).unwrap().into_vec()).unwrap();
    let (rc, errno) = unsafe { perform(&action.to_string_lossy(), &target) };
    println!("RESULT rc={rc} errno={errno}");
}

fn last_errno() -> c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

unsafe fn perform(action: &str, target: &CStr) -> (c_int, c_int) {
    match action {
        "mkdir" => {
            let rc = libc::mkdir(target.as_ptr(), 0o755);
            (rc, last_errno())
        }
        "mknod" => {
            let rc = libc::mknod(target.as_ptr(), libc::S_IFIFO | 0o644, 0);
            (rc, last_errno())
        }
        "unlinkat" => {
            let rc = libc::unlinkat(libc::AT_FDCWD, target.as_ptr(), 0);
            (rc, last_errno())
        }
        "unlinkat_dirfd" => {
            let path = Path::new(OsStr::from_bytes(target.to_bytes()));
            let dir = std::fs::File::open(path.parent().unwrap()).unwrap();
            let name = CString::new(path.file_name().unwrap().as_bytes()).unwrap();
            let rc = libc::unlinkat(dir.as_raw_fd(), name.as_ptr(), 0);
            (rc, last_errno())
        }
        "execv_denied" => {
            let argv = [target.as_ptr(), ptr::null()];
            let rc = libc::execv(target.as_ptr(), argv.as_ptr());
            (rc, last_errno())
        }
        shell => launch_shell(shell),
    }
}

/// Clear `LD_PRELOAD`, then start a shell that prints it.
unsafe fn launch_shell(action: &str) -> (c_int, c_int) {
    std::env::remove_var("LD_PRELOAD");
    let sh = c"sh".as_ptr();
    let dash_c = c"-c".as_ptr();
    let script = SHOW_PRELOAD.as_ptr();
    let end = ptr::null::<c_char>();
    let argv = [sh, dash_c, script, end];

    let rc = match action {
        "execve" => libc::execve(c"/bin/sh".as_ptr(), argv.as_ptr(), environ.cast()),
        "execvp" => libc::execvp(sh, argv.as_ptr()),
        "execl" => libc::execl(c"/bin/sh".as_ptr(), sh, dash_c, script, end),
        "execlp" => libc::execlp(sh, sh, dash_c, script, end),
        "execle" => {
            let envp = [c"PATH=/bin:/usr/bin".as_ptr(), ptr::null()];
            libc::execle(c"/bin/sh".as_ptr(), sh, dash_c, script, end, envp.as_ptr())
        }
        "posix_spawnp" => {
            let mut pid: libc::pid_t = 0;
            let spawn_argv = argv.map(|a| a as *mut c_char);
            let rc = libc::posix_spawnp(
                &mut pid,
                sh,
                ptr::null(),
                ptr::null(),
                spawn_argv.as_ptr(),
                environ,
            );
            if rc == 0 {
                let mut status = 0;
                libc::waitpid(pid, &mut status, 0);
            }
            return (rc, 0);
        }
        other => panic!("unknown action {other}"),
    };
    (rc, last_errno())
}

#[test]
fn test_mkdir_outside_write_list_is_refused() {
    let session = Session::new();
    let target = session.path("outside/newdir");
    assert_eq!(session.result("mkdir", &target), (-1, libc::EACCES));
    assert!(!target.exists());

    let log = std::fs::read_to_string(session.path("work/sandbox.log")).unwrap();
    assert!(log.contains(&format!("mkdir:     {}", target.display())), "{log}");
}

#[test]
fn test_mkdir_inside_write_list_succeeds() {
    let session = Session::new();
    let target = session.path("work/obj");
    assert_eq!(session.result("mkdir", &target).0, 0);
    assert!(target.is_dir());
}

#[test]
fn test_mknod_is_confined() {
    let session = Session::new();
    let refused = session.path("outside/fifo");
    assert_eq!(session.result("mknod", &refused), (-1, libc::EACCES));
    assert!(!refused.exists());

    let allowed = session.path("work/fifo");
    assert_eq!(session.result("mknod", &allowed).0, 0);
    assert!(allowed.exists());
}

#[test]
fn test_unlinkat_cannot_bypass_write_list() {
    let session = Session::new();
    let victim = session.path("outside/victim");
    std::fs::write(&victim, b"keep").unwrap();

    assert_eq!(session.result("unlinkat", &victim), (-1, libc::EACCES));
    assert_eq!(session.result("unlinkat_dirfd", &victim), (-1, libc::EACCES));
    assert!(victim.exists());

    let scratch = session.path("work/scratch");
    std::fs::write(&scratch, b"").unwrap();
    assert_eq!(session.result("unlinkat_dirfd", &scratch).0, 0);
    assert!(!scratch.exists());
}

#[test]
fn test_exec_of_denied_program_is_refused() {
    let session = Session::new();
    let tool = session.path("denied/tool");
    assert_eq!(session.result("execv_denied", &tool), (-1, libc::EACCES));
}

#[test]
fn test_exec_family_restores_preload() {
    let session = Session::new();
    let lib = session.lib.to_string_lossy().into_owned();
    for action in ["execve", "execvp", "execl", "execlp", "execle", "posix_spawnp"] {
        let seen = session.preload_seen_by(action);
        assert!(seen.contains(&lib), "{action}: LD_PRELOAD={seen}");
    }
}
