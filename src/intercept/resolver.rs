//! Lookup of the real implementations behind each wrapped symbol.
//!
//! Resolution happens once per symbol and is cached in a table of atomic
//! pointers. Failing to resolve a symbol that is actually called leaves no
//! way to honor the call, so the process aborts.

use std::ffi::{c_void, CStr};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

/// Source of real function addresses.
pub trait Resolver: Send + Sync {
    fn resolve(&self, name: &CStr) -> Option<NonNull<c_void>>;

    /// Human-readable reason for the last failed resolution.
    fn last_error(&self) -> Option<String> {
        None
    }
}

/// Next definition in link order after the interposition library.
#[derive(Debug, Default, Clone, Copy)]
pub struct DlsymResolver;

impl Resolver for DlsymResolver {
    fn resolve(&self, name: &CStr) -> Option<NonNull<c_void>> {
        // SAFETY: `name` is NUL-terminated and RTLD_NEXT is a valid handle.
        NonNull::new(unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) })
    }

    fn last_error(&self) -> Option<String> {
        // SAFETY: dlerror returns null or a NUL-terminated static buffer.
        let msg = unsafe { libc::dlerror() };
        if msg.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned())
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Symbol {
    Open,
    Open64,
    Creat,
    Creat64,
    Fopen,
    Fopen64,
    Opendir,
    Mkdir,
    Rmdir,
    Unlink,
    Link,
    Symlink,
    Rename,
    Chmod,
    Chown,
    Lchown,
    Truncate,
    Truncate64,
    Utime,
    Utimes,
    Mkfifo,
    Execve,
    Openat,
    Openat64,
    Mkdirat,
    Mknod,
    Xmknod,
    Mknodat,
    Xmknodat,
    Unlinkat,
    Linkat,
    Symlinkat,
    Renameat,
    Renameat2,
    Fchmodat,
    Fchownat,
    Utimensat,
    PosixSpawn,
}

impl Symbol {
    pub const COUNT: usize = 38;

    pub const ALL: [Symbol; Symbol::COUNT] = [
        Symbol::Open,
        Symbol::Open64,
        Symbol::Creat,
        Symbol::Creat64,
        Symbol::Fopen,
        Symbol::Fopen64,
        Symbol::Opendir,
        Symbol::Mkdir,
        Symbol::Rmdir,
        Symbol::Unlink,
        Symbol::Link,
        Symbol::Symlink,
        Symbol::Rename,
        Symbol::Chmod,
        Symbol::Chown,
        Symbol::Lchown,
        Symbol::Truncate,
        Symbol::Truncate64,
        Symbol::Utime,
        Symbol::Utimes,
        Symbol::Mkfifo,
        Symbol::Execve,
        Symbol::Openat,
        Symbol::Openat64,
        Symbol::Mkdirat,
        Symbol::Mknod,
        Symbol::Xmknod,
        Symbol::Mknodat,
        Symbol::Xmknodat,
        Symbol::Unlinkat,
        Symbol::Linkat,
        Symbol::Symlinkat,
        Symbol::Renameat,
        Symbol::Renameat2,
        Symbol::Fchmodat,
        Symbol::Fchownat,
        Symbol::Utimensat,
        Symbol::PosixSpawn,
    ];

    pub fn name(self) -> &'static CStr {
        match self {
            Symbol::Open => c"open",
            Symbol::Open64 => c"open64",
            Symbol::Creat => c"creat",
            Symbol::Creat64 => c"creat64",
            Symbol::Fopen => c"fopen",
            Symbol::Fopen64 => c"fopen64",
            Symbol::Opendir => c"opendir",
            Symbol::Mkdir => c"mkdir",
            Symbol::Rmdir => c"rmdir",
            Symbol::Unlink => c"unlink",
            Symbol::Link => c"link",
            Symbol::Symlink => c"symlink",
            Symbol::Rename => c"rename",
            Symbol::Chmod => c"chmod",
            Symbol::Chown => c"chown",
            Symbol::Lchown => c"lchown",
            Symbol::Truncate => c"truncate",
            Symbol::Truncate64 => c"truncate64",
            Symbol::Utime => c"utime",
            Symbol::Utimes => c"utimes",
            Symbol::Mkfifo => c"mkfifo",
            Symbol::Execve => c"execve",
            Symbol::Openat => c"openat",
            Symbol::Openat64 => c"openat64",
            Symbol::Mkdirat => c"mkdirat",
            Symbol::Mknod => c"mknod",
            Symbol::Xmknod => c"__xmknod",
            Symbol::Mknodat => c"mknodat",
            Symbol::Xmknodat => c"__xmknodat",
            Symbol::Unlinkat => c"unlinkat",
            Symbol::Linkat => c"linkat",
            Symbol::Symlinkat => c"symlinkat",
            Symbol::Renameat => c"renameat",
            Symbol::Renameat2 => c"renameat2",
            Symbol::Fchmodat => c"fchmodat",
            Symbol::Fchownat => c"fchownat",
            Symbol::Utimensat => c"utimensat",
            Symbol::PosixSpawn => c"posix_spawn",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Capability table: one cached address per [`Symbol`].
pub struct SymbolTable<R> {
    resolver: R,
    slots: [AtomicPtr<c_void>; Symbol::COUNT],
}

impl<R: Resolver> SymbolTable<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            slots: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Cached or freshly resolved address, `None` if the resolver has none.
    pub fn try_get(&self, sym: Symbol) -> Option<NonNull<c_void>> {
        let slot = &self.slots[sym.index()];
        if let Some(addr) = NonNull::new(slot.load(Ordering::Acquire)) {
            return Some(addr);
        }
        // Racing threads resolve the same address; last store wins harmlessly.
        let addr = self.resolver.resolve(sym.name())?;
        slot.store(addr.as_ptr(), Ordering::Release);
        Some(addr)
    }

    /// Address of the real implementation. Aborts when it cannot be found.
    pub fn get(&self, sym: Symbol) -> NonNull<c_void> {
        match self.try_get(sym) {
            Some(addr) => addr,
            None => {
                let reason = self
                    .resolver
                    .last_error()
                    .unwrap_or_else(|| "symbol not found".to_string());
                eprintln!(
                    "libsandbox: Can't resolve {}: {}",
                    sym.name().to_string_lossy(),
                    reason
                );
                std::process::abort();
            }
        }
    }

    /// Resolve every symbol up front. Missing ones stay unresolved and only
    /// abort if they are ever called.
    pub fn prime(&self) -> usize {
        Symbol::ALL
            .into_iter()
            .filter(|sym| self.try_get(*sym).is_some())
            .count()
    }

    pub fn is_cached(&self, sym: Symbol) -> bool {
        !self.slots[sym.index()].load(Ordering::Acquire).is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingResolver {
        calls: AtomicUsize,
    }

    impl Resolver for CountingResolver {
        fn resolve(&self, name: &CStr) -> Option<NonNull<c_void>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if name == c"open64" {
                None
            } else {
                NonNull::new(0x1000 as *mut c_void)
            }
        }
    }

    #[test]
    fn resolves_once_then_caches() {
        let table = SymbolTable::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        assert!(!table.is_cached(Symbol::Mkdir));
        table.get(Symbol::Mkdir);
        table.get(Symbol::Mkdir);
        assert!(table.is_cached(Symbol::Mkdir));
        assert_eq!(table.resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prime_skips_missing_symbols() {
        let table = SymbolTable::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        assert_eq!(table.prime(), Symbol::COUNT - 1);
        assert!(table.try_get(Symbol::Open64).is_none());
    }

    #[test]
    fn dlsym_finds_libc_functions() {
        let table = SymbolTable::new(DlsymResolver);
        // The test binary defines none of these, so RTLD_NEXT reaches libc.
        assert!(table.try_get(Symbol::Mkdir).is_some());
        assert!(table.try_get(Symbol::Execve).is_some());
        assert!(table.try_get(Symbol::Unlinkat).is_some());
        assert!(table.try_get(Symbol::PosixSpawn).is_some());
    }

    #[test]
    fn names_are_distinct() {
        let mut names: Vec<&CStr> = Symbol::ALL.iter().map(|s| s.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Symbol::COUNT);
    }
}
