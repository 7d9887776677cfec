//! Per-thread marker for "already inside the sandbox".
//!
//! The library's own file I/O (registry reads, log appends, `stat` for the
//! mkdir check) goes through the same wrapped entry points. While a guard is
//! held on a thread those calls forward straight to the real functions.

use std::cell::Cell;

thread_local! {
    static INSIDE: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug)]
pub struct ReentrancyGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ReentrancyGuard {
    /// `None` when this thread is already inside the sandbox.
    pub fn enter() -> Option<Self> {
        // A thread being torn down has no TLS; treat it as nested so the
        // call is forwarded.
        let entered = INSIDE
            .try_with(|inside| !inside.replace(true))
            .unwrap_or(false);
        entered.then(|| Self {
            _not_send: std::marker::PhantomData,
        })
    }

    pub fn is_active() -> bool {
        INSIDE.try_with(Cell::get).unwrap_or(true)
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = INSIDE.try_with(|inside| inside.set(false));
    }
}
