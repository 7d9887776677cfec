/// Tamper checks for files the sandbox appends to.
///
/// A log destination inside a writable area could be pre-planted as a
/// symlink or hard link to a file the sandboxed process may not touch. Any
/// such entry is removed and the write skipped. Best-effort only: the check
/// and the later open are not atomic, which the post-open `fstat` narrows
/// but cannot close.
use crate::config::types::{Result, SandboxError, TamperReason};
use log::warn;
use nix::unistd::{getgid, getuid, Group, User};
use std::fs::{File, Metadata, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

/// Owners and groups a log file may legitimately carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustedIdentity {
    uids: Vec<u32>,
    gids: Vec<u32>,
}

impl TrustedIdentity {
    /// Root, the current user, and the named service account.
    pub fn current(service_user: &str) -> Self {
        let mut uids = vec![0, getuid().as_raw()];
        let mut gids = vec![0, getgid().as_raw()];

        if let Ok(Some(user)) = User::from_name(service_user) {
            uids.push(user.uid.as_raw());
        }
        if let Ok(Some(group)) = Group::from_name(service_user) {
            gids.push(group.gid.as_raw());
        }
        Self::new(uids, gids)
    }

    pub fn new(mut uids: Vec<u32>, mut gids: Vec<u32>) -> Self {
        uids.sort_unstable();
        uids.dedup();
        gids.sort_unstable();
        gids.dedup();
        Self { uids, gids }
    }

    pub fn allows(&self, uid: u32, gid: u32) -> bool {
        self.uids.contains(&uid) && self.gids.contains(&gid)
    }
}

/// Classify an existing entry without touching it.
pub fn inspect(meta: &Metadata, trusted: &TrustedIdentity) -> Option<TamperReason> {
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        Some(TamperReason::Symlink)
    } else if !file_type.is_file() {
        Some(TamperReason::NotRegular)
    } else if meta.nlink() > 1 {
        Some(TamperReason::Hardlinked)
    } else if meta.permissions().mode() & 0o002 != 0 {
        Some(TamperReason::WorldWritable)
    } else if !trusted.allows(meta.uid(), meta.gid()) {
        Some(TamperReason::BadOwnership)
    } else {
        None
    }
}

/// Check `path` before appending to it. A missing file passes. An unsafe
/// entry is unlinked and reported as [`SandboxError::TamperingDetected`].
pub fn check_file_safety(path: &Path, trusted: &TrustedIdentity) -> Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    match inspect(&meta, trusted) {
        None => Ok(()),
        Some(reason) => {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Could not remove unsafe {}: {}", path.display(), e);
            }
            Err(SandboxError::TamperingDetected {
                path: path.to_path_buf(),
                reason,
            })
        }
    }
}

/// Open `path` for appending after it passed [`check_file_safety`].
///
/// `O_NOFOLLOW` refuses a symlink swapped in after the check; the descriptor
/// is then re-verified to be a singly-linked regular file.
pub fn open_for_append(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o644)
        .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
        .open(path)
        .map_err(|e| match e.raw_os_error() {
            Some(libc::ELOOP) => SandboxError::TamperingDetected {
                path: path.to_path_buf(),
                reason: TamperReason::Symlink,
            },
            _ => SandboxError::Io(e),
        })?;

    let meta = file.metadata()?;
    if !meta.file_type().is_file() {
        return Err(SandboxError::TamperingDetected {
            path: path.to_path_buf(),
            reason: TamperReason::NotRegular,
        });
    }
    if meta.nlink() != 1 {
        return Err(SandboxError::TamperingDetected {
            path: path.to_path_buf(),
            reason: TamperReason::Hardlinked,
        });
    }
    Ok(file)
}
