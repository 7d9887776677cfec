//! Thread-local `errno` access for the C-ABI wrappers.

/// Current value of `errno` for the calling thread.
pub fn get() -> libc::c_int {
    // SAFETY: __errno_location always returns a valid thread-local pointer.
    unsafe { *libc::__errno_location() }
}

pub fn set(value: libc::c_int) {
    // SAFETY: as above.
    unsafe {
        *libc::__errno_location() = value;
    }
}

/// `errno` captured on entry to a wrapper, put back once the sandbox's own
/// bookkeeping is done so the caller never observes it.
#[derive(Debug)]
#[must_use]
pub struct SavedErrno(libc::c_int);

impl SavedErrno {
    pub fn capture() -> Self {
        Self(get())
    }

    pub fn restore(self) {
        set(self.0);
    }
}
