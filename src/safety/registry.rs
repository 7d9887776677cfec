//! Session registry.
//!
//! Sessions on one host share two files: the PID registry, listing the
//! controller of every active session, and the dynamic linker's global
//! preload list. The library entry stays in the preload list while at least
//! one session is registered. Locks are always taken registry first, preload
//! list second.

use crate::config::types::{LockError, Result, SandboxError};
use crate::safety::lock_manager::{LockMode, LockedFile};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::{Path, PathBuf};

/// Outcome of [`SessionRegistry::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// Library entry added to the preload list by this session.
    Installed,
    /// Library entry was already present.
    AlreadyPresent,
    /// The preload list is not writable; the session runs without global
    /// registration and nothing was recorded.
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    pids_file: PathBuf,
    preload_file: PathBuf,
    lib_path: PathBuf,
}

impl SessionRegistry {
    pub fn new(
        pids_file: impl Into<PathBuf>,
        preload_file: impl Into<PathBuf>,
        lib_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pids_file: pids_file.into(),
            preload_file: preload_file.into(),
            lib_path: lib_path.into(),
        }
    }

    pub fn pids_file(&self) -> &Path {
        &self.pids_file
    }

    pub fn preload_file(&self) -> &Path {
        &self.preload_file
    }

    /// Record `session_id` and make sure the library is in the preload list.
    pub fn register(&self, session_id: u32) -> Result<Registration> {
        let mut pids = LockedFile::open_or_create(&self.pids_file).map_err(|e| {
            SandboxError::Registry(format!("cannot lock {}: {}", self.pids_file.display(), e))
        })?;

        let status = match LockedFile::open_or_create(&self.preload_file) {
            Ok(mut preload) => {
                let entries = preload.read_tokens()?;
                if entries.iter().any(|e| self.is_library_entry(e)) {
                    Registration::AlreadyPresent
                } else {
                    preload.append_line(&self.lib_path.to_string_lossy())?;
                    Registration::Installed
                }
            }
            Err(LockError::PermissionDenied { path }) => {
                warn!(
                    "Cannot modify {}; not all calls may be trapped",
                    path.display()
                );
                // Nothing was recorded, so a registry created just now goes away.
                if pids.read_tokens()?.is_empty() {
                    pids.remove()?;
                }
                return Ok(Registration::Unavailable);
            }
            Err(e) => return Err(e.into()),
        };

        let mut live: Vec<u32> = parse_pids(&pids.read_tokens()?)
            .into_iter()
            .filter(|pid| *pid != session_id)
            .collect();
        live.push(session_id);
        let lines: Vec<String> = live.iter().map(u32::to_string).collect();
        pids.rewrite(&lines)?;

        info!(
            "Registered session {} ({} active, preload {:?})",
            session_id,
            live.len(),
            status
        );
        Ok(status)
    }

    /// Remove `session_id` and prune dead entries. Returns true when no
    /// session remains, in which case the library entry has been removed
    /// from the preload list and the registry file deleted.
    pub fn unregister(&self, session_id: u32) -> Result<bool> {
        let pids = LockedFile::open(&self.pids_file, LockMode::Exclusive, false)?;

        let (remaining, pids) = match pids {
            Some(mut pids) => {
                let remaining: Vec<u32> = parse_pids(&pids.read_tokens()?)
                    .into_iter()
                    .filter(|pid| *pid != session_id && is_alive(*pid))
                    .collect();
                (remaining, Some(pids))
            }
            None => (Vec::new(), None),
        };

        if !remaining.is_empty() {
            if let Some(mut pids) = pids {
                let lines: Vec<String> = remaining.iter().map(u32::to_string).collect();
                pids.rewrite(&lines)?;
            }
            debug!(
                "Unregistered session {}; {} still active",
                session_id,
                remaining.len()
            );
            return Ok(false);
        }

        self.remove_library_entry()?;
        if let Some(pids) = pids {
            pids.remove()?;
        }
        info!("Last session {} ended; preload entry removed", session_id);
        Ok(true)
    }

    /// Live sessions currently recorded.
    pub fn active_sessions(&self) -> Result<Vec<u32>> {
        match LockedFile::open(&self.pids_file, LockMode::Shared, false)? {
            Some(mut pids) => Ok(parse_pids(&pids.read_tokens()?)
                .into_iter()
                .filter(|pid| is_alive(*pid))
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    fn remove_library_entry(&self) -> Result<()> {
        let preload = match LockedFile::open(&self.preload_file, LockMode::Exclusive, false) {
            Ok(Some(preload)) => preload,
            Ok(None) => return Ok(()),
            Err(LockError::PermissionDenied { path }) => {
                warn!("Cannot clean {}", path.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut preload = preload;

        let kept: Vec<String> = preload
            .read_tokens()?
            .into_iter()
            .filter(|e| !self.is_library_entry(e))
            .collect();
        if kept.is_empty() {
            preload.remove()?;
        } else {
            preload.rewrite(&kept)?;
        }
        Ok(())
    }

    /// An entry names the library when it is the configured path or resolves
    /// to the same file. A same-named library elsewhere is someone else's.
    fn is_library_entry(&self, entry: &str) -> bool {
        let entry = Path::new(entry);
        if entry == self.lib_path {
            return true;
        }
        match (
            std::fs::canonicalize(entry),
            std::fs::canonicalize(&self.lib_path),
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// True when `pid` is listed in `pids_file`. Read without a lock; a torn read
/// only makes the answer false.
pub fn is_registered(pids_file: &Path, pid: u32) -> bool {
    std::fs::read_to_string(pids_file)
        .map(|text| {
            text.split_whitespace()
                .any(|token| token.parse::<u32>().ok() == Some(pid))
        })
        .unwrap_or(false)
}

fn parse_pids(tokens: &[String]) -> Vec<u32> {
    let mut pids: Vec<u32> = tokens
        .iter()
        .filter_map(|t| t.parse::<u32>().ok())
        .filter(|pid| *pid > 0)
        .collect();
    pids.dedup();
    pids
}

/// Signal 0 probes existence; EPERM still means the process is there.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
