//! Integration tests for host-wide session registration
//!
//! Two controllers share one registry and one preload list; the library
//! entry must survive until the last of them leaves.

use sandbox::safety::registry::{is_registered, Registration, SessionRegistry};
use std::process::{Child, Command};
use tempfile::TempDir;

const LIB: &str = "/usr/lib/libsandbox_preload.so";

fn registry(dir: &TempDir) -> SessionRegistry {
    SessionRegistry::new(
        dir.path().join("sandboxpids.tmp"),
        dir.path().join("ld.so.preload"),
        LIB,
    )
}

fn sleeper() -> Child {
    Command::new("sleep").arg("30").spawn().unwrap()
}

fn preload_entries(dir: &TempDir) -> Vec<String> {
    std::fs::read_to_string(dir.path().join("ld.so.preload"))
        .map(|t| t.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

#[test]
fn test_overlapping_sessions_keep_entry_until_last_exit() {
    let dir = TempDir::new().unwrap();
    let reg = registry(&dir);
    let me = std::process::id();
    let mut other = sleeper();

    assert_eq!(reg.register(me).unwrap(), Registration::Installed);
    assert_eq!(reg.register(other.id()).unwrap(), Registration::AlreadyPresent);
    assert_eq!(preload_entries(&dir), vec![LIB.to_string()]);
    assert!(is_registered(reg.pids_file(), me));

    assert!(!reg.unregister(me).unwrap());
    assert_eq!(preload_entries(&dir), vec![LIB.to_string()]);
    assert!(!is_registered(reg.pids_file(), me));
    assert!(is_registered(reg.pids_file(), other.id()));

    assert!(reg.unregister(other.id()).unwrap());
    assert!(preload_entries(&dir).is_empty());
    assert!(!reg.pids_file().exists());

    other.kill().unwrap();
    other.wait().unwrap();
}

#[test]
fn test_dead_sessions_are_pruned_on_teardown() {
    let dir = TempDir::new().unwrap();
    let reg = registry(&dir);

    let mut crashed = sleeper();
    let crashed_pid = crashed.id();
    reg.register(crashed_pid).unwrap();
    crashed.kill().unwrap();
    crashed.wait().unwrap();

    let me = std::process::id();
    reg.register(me).unwrap();
    assert_eq!(reg.active_sessions().unwrap(), vec![me]);

    // The crashed controller never unregistered; the last live one cleans up
    assert!(reg.unregister(me).unwrap());
    assert!(preload_entries(&dir).is_empty());
}

#[test]
fn test_foreign_preload_entries_survive() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("ld.so.preload"), "/usr/lib/libfoo.so\n").unwrap();
    let reg = registry(&dir);
    let me = std::process::id();

    reg.register(me).unwrap();
    assert_eq!(
        preload_entries(&dir),
        vec!["/usr/lib/libfoo.so".to_string(), LIB.to_string()]
    );

    assert!(reg.unregister(me).unwrap());
    assert_eq!(preload_entries(&dir), vec!["/usr/lib/libfoo.so".to_string()]);
}
