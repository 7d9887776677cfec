//! Lexical path canonicalization.
//!
//! Produces an absolute path with no `.` or `..` segments and no repeated
//! separators. Symbolic links are never resolved, so a decision made on the
//! result does not change when a link is swapped underneath it.

use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use thiserror::Error;

/// Capacity used by the wrappers, matching the C `PATH_MAX` buffer.
pub const SB_PATH_MAX: usize = libc::PATH_MAX as usize;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalizeError {
    #[error("path is empty or cannot be resolved")]
    Invalid,

    #[error("path does not fit in {max} bytes")]
    TooLong { max: usize },
}

/// An absolute, lexically normalized path.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalPath(Vec<u8>);

impl CanonicalPath {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_path(&self) -> &Path {
        Path::new(OsStr::from_bytes(&self.0))
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Byte-wise prefix test. `/usr/lib` is a prefix of `/usr/lib64`.
    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }

    pub fn is_root(&self) -> bool {
        self.0 == b"/"
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanonicalPath({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl AsRef<Path> for CanonicalPath {
    fn as_ref(&self) -> &Path {
        self.as_path()
    }
}

/// Canonicalize `path`, resolving relative input against the current working
/// directory.
///
/// `max_len` is the size of the output buffer the caller would provide,
/// terminating NUL included; `None` requests growable output.
pub fn canonicalize(
    path: impl AsRef<OsStr>,
    max_len: Option<usize>,
) -> Result<CanonicalPath, CanonicalizeError> {
    let path = path.as_ref().as_bytes();
    match path.first() {
        None => Err(CanonicalizeError::Invalid),
        Some(b'/') => canonicalize_in(path, b"/", max_len),
        Some(_) => {
            let cwd = std::env::current_dir().map_err(|_| CanonicalizeError::Invalid)?;
            canonicalize_in(path, cwd.as_os_str().as_bytes(), max_len)
        }
    }
}

/// Canonicalize `path` against an explicit working directory.
///
/// `cwd` is only consulted for relative input and must itself be absolute.
pub fn canonicalize_in(
    path: &[u8],
    cwd: &[u8],
    max_len: Option<usize>,
) -> Result<CanonicalPath, CanonicalizeError> {
    if path.is_empty() {
        return Err(CanonicalizeError::Invalid);
    }

    let mut out = Vec::with_capacity(path.len().max(cwd.len()) + 1);
    out.push(b'/');

    if path[0] != b'/' {
        if cwd.first() != Some(&b'/') {
            return Err(CanonicalizeError::Invalid);
        }
        append_segments(&mut out, cwd, max_len)?;
    }
    append_segments(&mut out, path, max_len)?;

    Ok(CanonicalPath(out))
}

fn append_segments(
    out: &mut Vec<u8>,
    input: &[u8],
    max_len: Option<usize>,
) -> Result<(), CanonicalizeError> {
    for segment in input.split(|b| *b == b'/') {
        match segment {
            b"" | b"." => {}
            b".." => {
                // Never back up above the root.
                if out.len() > 1 {
                    let cut = out.iter().rposition(|b| *b == b'/').unwrap_or(0);
                    out.truncate(cut.max(1));
                }
            }
            name => {
                if out.last() != Some(&b'/') {
                    out.push(b'/');
                }
                if let Some(max) = max_len {
                    if out.len() + name.len() >= max {
                        return Err(CanonicalizeError::TooLong { max });
                    }
                }
                out.extend_from_slice(name);
            }
        }
    }
    Ok(())
}
