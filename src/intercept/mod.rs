//! Interception
//!
//! Logic behind the C-ABI wrappers exported by the preload library. The
//! process-wide [`Interceptor`] is created on first use and lives until the
//! process exits. Fork handlers keep its decision lock consistent in children.

pub mod at;
pub mod exec;
pub mod guard;
pub mod resolver;
pub mod wrappers;

use once_cell::sync::Lazy;

pub use crate::policy::decision::OperationClass;
pub use resolver::{DlsymResolver, Resolver, Symbol};
pub use wrappers::Interceptor;

static INTERCEPTOR: Lazy<Interceptor> =
    Lazy::new(|| Interceptor::new(DlsymResolver, crate::config::env::ProcessEnv));

/// The interceptor used by every exported wrapper.
pub fn interceptor() -> &'static Interceptor {
    &INTERCEPTOR
}

unsafe extern "C" fn fork_prepare() {
    interceptor().fork_prepare();
}

unsafe extern "C" fn fork_release() {
    interceptor().fork_release();
}

/// Library load hook.
pub fn on_load() {
    let resolved = interceptor().prime();
    log::debug!("sandbox loaded, {} of {} symbols resolved", resolved, Symbol::COUNT);

    // SAFETY: the handlers are plain functions that live as long as the library.
    let rc = unsafe { libc::pthread_atfork(Some(fork_prepare), Some(fork_release), Some(fork_release)) };
    if rc != 0 {
        log::warn!("fork handlers not installed: {}", std::io::Error::from_raw_os_error(rc));
    }
}

/// Library unload hook.
pub fn on_unload() {
    interceptor().release();
}
