/// Locked read-modify-write of small line-oriented files shared between
/// sessions (PID registry, dynamic-linker preload list).
///
/// Locks are advisory `flock`s held on the file itself for the whole
/// read, compute, truncate, write sequence.
use crate::config::types::{LockError, LockResult};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Attempts to land on a stable inode before giving up
const MAX_REOPEN_ATTEMPTS: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn operation(self) -> libc::c_int {
        match self {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        }
    }
}

/// An open file holding an advisory lock. The lock is released on drop.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl LockedFile {
    /// Open `path` and block until the lock is held.
    ///
    /// With `create`, a missing file is created with mode 0644. Without it,
    /// a missing file yields `Ok(None)`. An existing non-regular entry is
    /// refused.
    pub fn open(path: &Path, mode: LockMode, create: bool) -> LockResult<Option<Self>> {
        for _ in 0..MAX_REOPEN_ATTEMPTS {
            match std::fs::symlink_metadata(path) {
                Ok(meta) if !meta.file_type().is_file() => {
                    return Err(LockError::NotRegular {
                        path: path.to_path_buf(),
                    });
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound && !create => return Ok(None),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(map_open_error(path, e)),
            }

            let mut options = OpenOptions::new();
            options.read(true).custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC);
            if mode == LockMode::Exclusive {
                options.write(true).create(create).mode(0o644);
            }
            let file = match options.open(path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound && !create => return Ok(None),
                Err(e) => return Err(map_open_error(path, e)),
            };

            // SAFETY: the descriptor is owned by `file` and stays open for the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), mode.operation()) };
            if rc != 0 {
                return Err(LockError::Flock {
                    path: path.to_path_buf(),
                    source: std::io::Error::last_os_error(),
                });
            }

            // Another holder may have unlinked or replaced the file while we
            // waited. Only a lock on the inode still named by `path` counts.
            let held = file.metadata()?;
            match std::fs::symlink_metadata(path) {
                Ok(current) if current.ino() == held.ino() && current.dev() == held.dev() => {
                    return Ok(Some(Self {
                        file,
                        path: path.to_path_buf(),
                        mode,
                    }));
                }
                Ok(_) => debug!("{} replaced while waiting for lock, reopening", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound && !create => return Ok(None),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("{} removed while waiting for lock, reopening", path.display())
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(LockError::Flock {
            path: path.to_path_buf(),
            source: std::io::Error::new(ErrorKind::Other, "lock file kept changing"),
        })
    }

    /// Like [`LockedFile::open`] with `create`, so the result is always present.
    pub fn open_or_create(path: &Path) -> LockResult<Self> {
        Self::open(path, LockMode::Exclusive, true)?.ok_or_else(|| {
            LockError::FilesystemError(std::io::Error::new(
                ErrorKind::NotFound,
                format!("{} vanished after creation", path.display()),
            ))
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Whitespace-separated tokens of the whole file, in order.
    pub fn read_tokens(&mut self) -> LockResult<Vec<String>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut text = String::new();
        self.file.read_to_string(&mut text)?;
        Ok(text.split_whitespace().map(str::to_string).collect())
    }

    /// Replace the file contents with one entry per line.
    pub fn rewrite<S: AsRef<str>>(&mut self, entries: &[S]) -> LockResult<()> {
        let mut body = String::new();
        for entry in entries {
            body.push_str(entry.as_ref());
            body.push('\n');
        }
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        self.file.write_all(body.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    pub fn append_line(&mut self, entry: &str) -> LockResult<()> {
        self.file.seek(SeekFrom::End(0))?;
        // Keep a previous line without terminator from swallowing ours.
        let len = self.file.metadata()?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            self.file.seek(SeekFrom::Start(len - 1))?;
            self.file.read_exact(&mut last)?;
            self.file.seek(SeekFrom::End(0))?;
            if last[0] != b'\n' {
                self.file.write_all(b"\n")?;
            }
        }
        writeln!(self.file, "{}", entry)?;
        self.file.flush()?;
        Ok(())
    }

    /// Unlink the file while still holding the lock.
    pub fn remove(self) -> LockResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        // SAFETY: descriptor still owned by `self.file`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn map_open_error(path: &Path, e: std::io::Error) -> LockError {
    match e.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) | Some(libc::EROFS) => LockError::PermissionDenied {
            path: path.to_path_buf(),
        },
        Some(libc::ELOOP) => LockError::NotRegular {
            path: path.to_path_buf(),
        },
        _ => LockError::FilesystemError(e),
    }
}

/// Run `op` on `path` under an exclusive lock, creating the file if needed.
pub fn with_locked_file<T>(
    path: &Path,
    op: impl FnOnce(&mut LockedFile) -> LockResult<T>,
) -> LockResult<T> {
    let mut locked = LockedFile::open_or_create(path)?;
    op(&mut locked)
}
