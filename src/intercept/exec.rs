//! Keeping the library in `LD_PRELOAD` across `exec`.
//!
//! A sandboxed program can scrub its environment before exec. The exec
//! and spawn wrappers put the library back so the new image is confined too.
//! The `p` variants search `PATH` here so every candidate is checked and
//! launched through the wrapped path.

use crate::config::env::{EnvSource, ENV_SANDBOX_LIB};
use std::ffi::{c_void, CStr, CString};

const PRELOAD_KEY: &[u8] = b"LD_PRELOAD=";

/// How a child environment must change to carry the library.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreloadEdit {
    /// Already names the library.
    Unchanged,
    /// Replace the entry at `index` with `entry`.
    Replace { index: usize, entry: CString },
    /// No preload entry; add `entry`.
    Append(CString),
}

/// Plan the change for `envp` so that its first `LD_PRELOAD` entry contains
/// `lib`.
pub fn plan_preload_edit<S: AsRef<[u8]>>(envp: &[S], lib: &[u8]) -> PreloadEdit {
    for (index, entry) in envp.iter().enumerate() {
        let entry = entry.as_ref();
        let Some(value) = entry.strip_prefix(PRELOAD_KEY) else {
            continue;
        };

        if contains(value, lib) {
            return PreloadEdit::Unchanged;
        }

        let mut joined = entry.to_vec();
        if !value.is_empty() {
            joined.push(b' ');
        }
        joined.extend_from_slice(lib);
        return match CString::new(joined) {
            Ok(entry) => PreloadEdit::Replace { index, entry },
            Err(_) => PreloadEdit::Unchanged,
        };
    }

    let mut entry = PRELOAD_KEY.to_vec();
    entry.extend_from_slice(lib);
    match CString::new(entry) {
        Ok(entry) => PreloadEdit::Append(entry),
        Err(_) => PreloadEdit::Unchanged,
    }
}

/// Search list used when `PATH` is unset.
pub const DEFAULT_SEARCH_PATH: &[u8] = b"/bin:/usr/bin";

/// Files to try, in order, when launching `file` the way `execvp` does. A
/// name containing a slash is used as is; an empty `PATH` component means
/// the current directory.
pub fn path_candidates(file: &[u8], search_path: Option<&[u8]>) -> Vec<CString> {
    if file.is_empty() {
        return Vec::new();
    }
    if file.contains(&b'/') {
        return CString::new(file).ok().into_iter().collect();
    }
    search_path
        .unwrap_or(DEFAULT_SEARCH_PATH)
        .split(|b| *b == b':')
        .filter_map(|dir| {
            let full = if dir.is_empty() {
                file.to_vec()
            } else {
                crate::intercept::at::join_dir(dir, file)
            };
            CString::new(full).ok()
        })
        .collect()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Path of the loaded interposition library: the object containing this
/// code according to the dynamic loader, else `SANDBOX_LIB`.
pub fn library_path<E: EnvSource + ?Sized>(env: &E) -> Option<CString> {
    loaded_object_path().or_else(|| {
        env.var_bytes(ENV_SANDBOX_LIB)
            .filter(|v| !v.is_empty())
            .and_then(|v| CString::new(v).ok())
    })
}

/// Only meaningful inside the shared library; in an executable this names
/// the executable itself.
pub fn loaded_object_path() -> Option<CString> {
    // SAFETY: Dl_info is plain data; dladdr fills it or returns 0.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let anchor = loaded_object_path as *const c_void;
    let found = unsafe { libc::dladdr(anchor, &mut info) };
    if found == 0 || info.dli_fname.is_null() {
        return None;
    }
    // SAFETY: dli_fname points at the loader's NUL-terminated copy of the path.
    let name = unsafe { CStr::from_ptr(info.dli_fname) };
    if name.to_bytes().is_empty() {
        None
    } else {
        Some(name.to_owned())
    }
}
