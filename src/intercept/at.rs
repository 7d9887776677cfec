//! Targets of the descriptor-relative (`*at`) calls.
//!
//! A relative name passed with a directory descriptor is checked as the
//! descriptor's path joined with the name, the same path the kernel walks.
//! The descriptor's path comes from `/proc/self/fd`.

use libc::c_int;
use std::ffi::CString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};

/// What the wrapper should do before forwarding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AtTarget {
    /// Decide on this path.
    Check(CString),
    /// Nothing to check; the real call reports its own error (`EBADF`,
    /// `EFAULT`).
    Forward,
    /// The descriptor is open but names no filesystem path.
    Unresolvable,
}

/// Work out the path an `*at` call acts on.
///
/// `name` is `None` for a null pointer. `empty_path` means the call was made
/// with `AT_EMPTY_PATH` (or, for `utimensat`, a null name), so an empty name
/// targets the descriptor itself.
pub fn resolve_at(dirfd: c_int, name: Option<&[u8]>, empty_path: bool) -> AtTarget {
    match name {
        Some(name) if name.first() == Some(&b'/') => check(name.to_vec()),
        Some(name) if !name.is_empty() => {
            if dirfd == libc::AT_FDCWD {
                return check(name.to_vec());
            }
            match descriptor_path(dirfd) {
                Descriptor::Path(dir) => check(join_dir(&dir, name)),
                Descriptor::Closed => AtTarget::Forward,
                Descriptor::Anonymous => AtTarget::Unresolvable,
            }
        }
        _ if empty_path => {
            if dirfd == libc::AT_FDCWD {
                return check(b".".to_vec());
            }
            match descriptor_path(dirfd) {
                Descriptor::Path(path) => check(path),
                Descriptor::Closed => AtTarget::Forward,
                Descriptor::Anonymous => AtTarget::Unresolvable,
            }
        }
        // An empty name without AT_EMPTY_PATH fails with ENOENT at the check.
        Some(_) => check(Vec::new()),
        None => AtTarget::Forward,
    }
}

fn check(path: Vec<u8>) -> AtTarget {
    CString::new(path)
        .map(AtTarget::Check)
        .unwrap_or(AtTarget::Unresolvable)
}

/// `dir` + `/` + `name`, without doubling a trailing slash.
pub fn join_dir(dir: &[u8], name: &[u8]) -> Vec<u8> {
    let mut joined = Vec::with_capacity(dir.len() + name.len() + 1);
    joined.extend_from_slice(dir);
    if !dir.ends_with(b"/") {
        joined.push(b'/');
    }
    joined.extend_from_slice(name);
    joined
}

enum Descriptor {
    Path(Vec<u8>),
    Closed,
    Anonymous,
}

fn descriptor_path(fd: c_int) -> Descriptor {
    // SAFETY: F_GETFD only inspects the descriptor table.
    if fd < 0 || unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Descriptor::Closed;
    }
    match std::fs::read_link(format!("/proc/self/fd/{fd}")) {
        // Sockets, pipes and anonymous inodes read back as `type:[inode]`.
        Ok(path) if path.as_os_str().as_bytes().first() == Some(&b'/') => {
            Descriptor::Path(path.into_os_string().into_vec())
        }
        _ => Descriptor::Anonymous,
    }
}
