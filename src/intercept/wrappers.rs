//! Per-call interception logic.
//!
//! Every exported wrapper in the preload library lands in one of the methods
//! below: canonicalize the target, classify, decide, then forward to the real
//! function or fail with `EACCES`. Descriptor-relative calls are checked on
//! the path the descriptor names, and the exec and spawn families carry the
//! library into the new image. The type is generic over the symbol
//! resolver and the environment so the whole path can run in tests without
//! loading the shared library.

use crate::config::env::{is_sandbox_on, EnvSource, ProcessEnv, ENV_PATH};
use crate::config::types::Verdict;
use crate::intercept::at::{resolve_at, AtTarget};
use crate::intercept::exec::{library_path, path_candidates, plan_preload_edit, PreloadEdit};
use crate::intercept::guard::ReentrancyGuard;
use crate::intercept::resolver::{DlsymResolver, Resolver, Symbol, SymbolTable};
use crate::kernel::errno::{self, SavedErrno};
use crate::observability::audit::AuditLog;
use crate::policy::canonicalize::{canonicalize, SB_PATH_MAX};
use crate::policy::decision::{LiveProbe, OperationClass, SandboxContext};
use libc::{
    c_char, c_int, c_uint, dev_t, gid_t, mode_t, off64_t, off_t, pid_t,
    posix_spawn_file_actions_t, posix_spawnattr_t, timespec, timeval, uid_t, utimbuf, DIR, FILE,
};
use log::debug;
use once_cell::sync::OnceCell;
use std::cell::RefCell;
use std::ffi::{c_void, CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

type OpenFn = unsafe extern "C" fn(*const c_char, c_int, mode_t) -> c_int;
type FopenFn = unsafe extern "C" fn(*const c_char, *const c_char) -> *mut FILE;
type OpendirFn = unsafe extern "C" fn(*const c_char) -> *mut DIR;
type PathFn = unsafe extern "C" fn(*const c_char) -> c_int;
type PathModeFn = unsafe extern "C" fn(*const c_char, mode_t) -> c_int;
type TwoPathFn = unsafe extern "C" fn(*const c_char, *const c_char) -> c_int;
type ChownFn = unsafe extern "C" fn(*const c_char, uid_t, gid_t) -> c_int;
type TruncateFn = unsafe extern "C" fn(*const c_char, off_t) -> c_int;
type Truncate64Fn = unsafe extern "C" fn(*const c_char, off64_t) -> c_int;
type UtimeFn = unsafe extern "C" fn(*const c_char, *const utimbuf) -> c_int;
type UtimesFn = unsafe extern "C" fn(*const c_char, *const timeval) -> c_int;
type ExecveFn =
    unsafe extern "C" fn(*const c_char, *const *const c_char, *const *const c_char) -> c_int;
type MknodFn = unsafe extern "C" fn(*const c_char, mode_t, dev_t) -> c_int;
type XmknodFn = unsafe extern "C" fn(c_int, *const c_char, mode_t, *mut dev_t) -> c_int;
type OpenatFn = unsafe extern "C" fn(c_int, *const c_char, c_int, mode_t) -> c_int;
type AtModeFn = unsafe extern "C" fn(c_int, *const c_char, mode_t) -> c_int;
type MknodatFn = unsafe extern "C" fn(c_int, *const c_char, mode_t, dev_t) -> c_int;
type XmknodatFn = unsafe extern "C" fn(c_int, c_int, *const c_char, mode_t, *mut dev_t) -> c_int;
type UnlinkatFn = unsafe extern "C" fn(c_int, *const c_char, c_int) -> c_int;
type LinkatFn = unsafe extern "C" fn(c_int, *const c_char, c_int, *const c_char, c_int) -> c_int;
type SymlinkatFn = unsafe extern "C" fn(*const c_char, c_int, *const c_char) -> c_int;
type RenameatFn = unsafe extern "C" fn(c_int, *const c_char, c_int, *const c_char) -> c_int;
type Renameat2Fn =
    unsafe extern "C" fn(c_int, *const c_char, c_int, *const c_char, c_uint) -> c_int;
type FchmodatFn = unsafe extern "C" fn(c_int, *const c_char, mode_t, c_int) -> c_int;
type FchownatFn = unsafe extern "C" fn(c_int, *const c_char, uid_t, gid_t, c_int) -> c_int;
type UtimensatFn = unsafe extern "C" fn(c_int, *const c_char, *const timespec, c_int) -> c_int;
type PosixSpawnFn = unsafe extern "C" fn(
    *mut pid_t,
    *const c_char,
    *const posix_spawn_file_actions_t,
    *const posix_spawnattr_t,
    *const *mut c_char,
    *const *mut c_char,
) -> c_int;

/// Interpreter for files the kernel refuses with `ENOEXEC`.
const SCRIPT_SHELL: &CStr = c"/bin/sh";

extern "C" {
    static environ: *const *const c_char;
}

thread_local! {
    /// Decision lock held by this thread between the fork handlers.
    static FORK_HOLD: RefCell<Option<MutexGuard<'static, SandboxContext>>> =
        const { RefCell::new(None) };
}

pub struct Interceptor<R = DlsymResolver, E = ProcessEnv> {
    symbols: SymbolTable<R>,
    env: E,
    context: Mutex<SandboxContext>,
    audit: AuditLog,
    library: OnceCell<Option<CString>>,
}

impl<R: Resolver, E: EnvSource> Interceptor<R, E> {
    pub fn new(resolver: R, env: E) -> Self {
        Self {
            symbols: SymbolTable::new(resolver),
            env,
            context: Mutex::new(SandboxContext::new()),
            audit: AuditLog::new(),
            library: OnceCell::new(),
        }
    }

    /// Fix the path injected into child environments.
    pub fn with_library_path(self, path: CString) -> Self {
        let _ = self.library.set(Some(path));
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    /// Load-time setup: resolve what can be resolved and pin the library
    /// path. Returns the number of symbols resolved.
    pub fn prime(&self) -> usize {
        let _guard = ReentrancyGuard::enter();
        let resolved = self.symbols.prime();
        let _ = self.library_path();
        resolved
    }

    /// Unload-time teardown: forget memoized prefix sets.
    pub fn release(&self) {
        let mut ctx = self.context.lock().unwrap_or_else(PoisonError::into_inner);
        ctx.store_mut().clear();
    }

    /// `pthread_atfork` prepare handler. Holds the decision lock across
    /// `fork` so the child cannot inherit it locked by a thread that only
    /// exists in the parent.
    pub fn fork_prepare(&'static self) {
        let held = self.context.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = FORK_HOLD.try_with(move |slot| *slot.borrow_mut() = Some(held));
    }

    /// Parent and child handler: drops the lock taken by
    /// [`Interceptor::fork_prepare`].
    pub fn fork_release(&self) {
        let _ = FORK_HOLD.try_with(|slot| slot.borrow_mut().take());
    }

    pub fn library_path(&self) -> Option<&CStr> {
        self.library
            .get_or_init(|| library_path(&self.env))
            .as_deref()
    }

    /// Decide whether `op` on `path` may proceed.
    ///
    /// On refusal `errno` is `EACCES`, or `ENOENT` for an empty path. On
    /// success `errno` is exactly what it was on entry.
    pub fn permit(&self, op: OperationClass, path: &CStr) -> bool {
        let Some(_guard) = ReentrancyGuard::enter() else {
            return true;
        };
        let saved = SavedErrno::capture();

        if !is_sandbox_on(&self.env) {
            saved.restore();
            return true;
        }

        let raw = path.to_bytes();
        if raw.is_empty() {
            errno::set(libc::ENOENT);
            return false;
        }

        let verdict = self.evaluate(op, raw);
        saved.restore();
        if !verdict.allowed {
            errno::set(libc::EACCES);
        }
        verdict.allowed
    }

    fn evaluate(&self, op: OperationClass, raw: &[u8]) -> Verdict {
        let mut ctx = self.context.lock().unwrap_or_else(PoisonError::into_inner);
        ctx.refresh(&self.env);
        let probe = LiveProbe::from_env(&self.env);

        let (verdict, shown) = match canonicalize(OsStr::from_bytes(raw), Some(SB_PATH_MAX)) {
            Ok(path) => (ctx.decide(op, &path, &probe), path.into_bytes()),
            Err(e) if raw[0] != b'/' => {
                debug!("{} on relative path not canonicalized ({}); allowed", op, e);
                return Verdict::ALLOW;
            }
            Err(e) => {
                debug!("{} on absolute path not canonicalized ({}); denied", op, e);
                (Verdict::DENY, raw.to_vec())
            }
        };

        self.audit
            .record(&self.env, op, &shown, verdict, &mut |log_path| {
                match canonicalize(log_path.as_os_str(), Some(SB_PATH_MAX)) {
                    Ok(path) => match ctx.check(OperationClass::OpenWrite, &path, &probe) {
                        Ok(_) => true,
                        Err(e) => {
                            debug!("{}; log not written", e);
                            false
                        }
                    },
                    Err(_) => false,
                }
            });
        verdict
    }

    /// # Safety
    /// `path` must be null or a valid NUL-terminated string.
    unsafe fn allows(&self, op: OperationClass, path: *const c_char) -> bool {
        path.is_null() || self.permit(op, CStr::from_ptr(path))
    }

    /// [`Interceptor::allows`] for a name relative to `dirfd`.
    ///
    /// # Safety
    /// `path` must be null or a valid NUL-terminated string.
    unsafe fn allows_at(
        &self,
        op: OperationClass,
        dirfd: c_int,
        path: *const c_char,
        empty_path: bool,
    ) -> bool {
        let target = {
            let Some(_guard) = ReentrancyGuard::enter() else {
                return true;
            };
            let saved = SavedErrno::capture();
            if !is_sandbox_on(&self.env) {
                saved.restore();
                return true;
            }
            let name = (!path.is_null()).then(|| CStr::from_ptr(path).to_bytes());
            let target = resolve_at(dirfd, name, empty_path);
            saved.restore();
            target
        };

        match target {
            AtTarget::Check(resolved) => self.permit(op, &resolved),
            AtTarget::Forward => true,
            AtTarget::Unresolvable => {
                debug!("{} relative to descriptor {} without a path; denied", op, dirfd);
                errno::set(libc::EACCES);
                false
            }
        }
    }

    /// # Safety
    /// `F` must be the function pointer type matching `sym`'s C prototype.
    unsafe fn real<F: Copy>(&self, sym: Symbol) -> F {
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*mut c_void>());
        let addr = self.symbols.get(sym).as_ptr();
        std::mem::transmute_copy::<*mut c_void, F>(&addr)
    }

    /// [`Interceptor::real`] for symbols a libc may not provide.
    ///
    /// # Safety
    /// Same as [`Interceptor::real`].
    unsafe fn try_real<F: Copy>(&self, sym: Symbol) -> Option<F> {
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*mut c_void>());
        let addr = self.symbols.try_get(sym)?.as_ptr();
        Some(std::mem::transmute_copy::<*mut c_void, F>(&addr))
    }

    /// `open`/`open64`. The mode is read unconditionally; callers that pass
    /// no mode leave an unspecified value that the kernel ignores unless
    /// `O_CREAT` or `O_TMPFILE` is set.
    ///
    /// # Safety
    /// Same contract as `open(2)`.
    pub unsafe fn open(&self, sym: Symbol, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        if !self.allows(OperationClass::from_open_flags(flags), path) {
            return -1;
        }
        let real: OpenFn = self.real(sym);
        real(path, flags, mode)
    }

    /// # Safety
    /// Same contract as `creat(2)`.
    pub unsafe fn creat(&self, sym: Symbol, path: *const c_char, mode: mode_t) -> c_int {
        let op = if sym == Symbol::Creat64 {
            OperationClass::Creat64
        } else {
            OperationClass::Creat
        };
        if !self.allows(op, path) {
            return -1;
        }
        let real: PathModeFn = self.real(sym);
        real(path, mode)
    }

    /// # Safety
    /// Same contract as `fopen(3)`.
    pub unsafe fn fopen(&self, sym: Symbol, path: *const c_char, mode: *const c_char) -> *mut FILE {
        let op = if mode.is_null() {
            OperationClass::OpenRead
        } else {
            OperationClass::from_fopen_mode(CStr::from_ptr(mode).to_bytes())
        };
        if !self.allows(op, path) {
            return ptr::null_mut();
        }
        let real: FopenFn = self.real(sym);
        real(path, mode)
    }

    /// # Safety
    /// Same contract as `opendir(3)`.
    pub unsafe fn opendir(&self, path: *const c_char) -> *mut DIR {
        if !self.allows(OperationClass::Opendir, path) {
            return ptr::null_mut();
        }
        let real: OpendirFn = self.real(Symbol::Opendir);
        real(path)
    }

    /// # Safety
    /// Same contract as `mkdir(2)`.
    pub unsafe fn mkdir(&self, path: *const c_char, mode: mode_t) -> c_int {
        self.path_mode(Symbol::Mkdir, OperationClass::Mkdir, path, mode)
    }

    /// # Safety
    /// Same contract as `chmod(2)`.
    pub unsafe fn chmod(&self, path: *const c_char, mode: mode_t) -> c_int {
        self.path_mode(Symbol::Chmod, OperationClass::Chmod, path, mode)
    }

    /// # Safety
    /// Same contract as `mkfifo(3)`.
    pub unsafe fn mkfifo(&self, path: *const c_char, mode: mode_t) -> c_int {
        self.path_mode(Symbol::Mkfifo, OperationClass::Mkfifo, path, mode)
    }

    unsafe fn path_mode(
        &self,
        sym: Symbol,
        op: OperationClass,
        path: *const c_char,
        mode: mode_t,
    ) -> c_int {
        if !self.allows(op, path) {
            return -1;
        }
        let real: PathModeFn = self.real(sym);
        real(path, mode)
    }

    /// # Safety
    /// Same contract as `rmdir(2)`.
    pub unsafe fn rmdir(&self, path: *const c_char) -> c_int {
        self.path_only(Symbol::Rmdir, OperationClass::Rmdir, path)
    }

    /// # Safety
    /// Same contract as `unlink(2)`.
    pub unsafe fn unlink(&self, path: *const c_char) -> c_int {
        self.path_only(Symbol::Unlink, OperationClass::Unlink, path)
    }

    unsafe fn path_only(&self, sym: Symbol, op: OperationClass, path: *const c_char) -> c_int {
        if !self.allows(op, path) {
            return -1;
        }
        let real: PathFn = self.real(sym);
        real(path)
    }

    /// Only the new name is checked.
    ///
    /// # Safety
    /// Same contract as `link(2)`.
    pub unsafe fn link(&self, old: *const c_char, new: *const c_char) -> c_int {
        if !self.allows(OperationClass::Link, new) {
            return -1;
        }
        let real: TwoPathFn = self.real(Symbol::Link);
        real(old, new)
    }

    /// Only the link path is checked; the target is just text.
    ///
    /// # Safety
    /// Same contract as `symlink(2)`.
    pub unsafe fn symlink(&self, target: *const c_char, linkpath: *const c_char) -> c_int {
        if !self.allows(OperationClass::Symlink, linkpath) {
            return -1;
        }
        let real: TwoPathFn = self.real(Symbol::Symlink);
        real(target, linkpath)
    }

    /// Both names must be writable.
    ///
    /// # Safety
    /// Same contract as `rename(2)`.
    pub unsafe fn rename(&self, old: *const c_char, new: *const c_char) -> c_int {
        if !self.allows(OperationClass::Rename, old) || !self.allows(OperationClass::Rename, new) {
            return -1;
        }
        let real: TwoPathFn = self.real(Symbol::Rename);
        real(old, new)
    }

    /// # Safety
    /// Same contract as `chown(2)`.
    pub unsafe fn chown(&self, path: *const c_char, owner: uid_t, group: gid_t) -> c_int {
        if !self.allows(OperationClass::Chown, path) {
            return -1;
        }
        let real: ChownFn = self.real(Symbol::Chown);
        real(path, owner, group)
    }

    /// # Safety
    /// Same contract as `lchown(2)`.
    pub unsafe fn lchown(&self, path: *const c_char, owner: uid_t, group: gid_t) -> c_int {
        if !self.allows(OperationClass::Lchown, path) {
            return -1;
        }
        let real: ChownFn = self.real(Symbol::Lchown);
        real(path, owner, group)
    }

    /// # Safety
    /// Same contract as `truncate(2)`.
    pub unsafe fn truncate(&self, path: *const c_char, length: off_t) -> c_int {
        if !self.allows(OperationClass::Truncate, path) {
            return -1;
        }
        let real: TruncateFn = self.real(Symbol::Truncate);
        real(path, length)
    }

    /// # Safety
    /// Same contract as `truncate64(2)`.
    pub unsafe fn truncate64(&self, path: *const c_char, length: off64_t) -> c_int {
        if !self.allows(OperationClass::Truncate64, path) {
            return -1;
        }
        let real: Truncate64Fn = self.real(Symbol::Truncate64);
        real(path, length)
    }

    /// # Safety
    /// Same contract as `utime(2)`.
    pub unsafe fn utime(&self, path: *const c_char, times: *const utimbuf) -> c_int {
        if !self.allows(OperationClass::Utime, path) {
            return -1;
        }
        let real: UtimeFn = self.real(Symbol::Utime);
        real(path, times)
    }

    /// # Safety
    /// Same contract as `utimes(2)`.
    pub unsafe fn utimes(&self, path: *const c_char, times: *const timeval) -> c_int {
        if !self.allows(OperationClass::Utimes, path) {
            return -1;
        }
        let real: UtimesFn = self.real(Symbol::Utimes);
        real(path, times)
    }

    /// # Safety
    /// Same contract as `mknod(2)`.
    pub unsafe fn mknod(&self, path: *const c_char, mode: mode_t, dev: dev_t) -> c_int {
        if !self.allows(OperationClass::Mknod, path) {
            return -1;
        }
        let real: MknodFn = self.real(Symbol::Mknod);
        real(path, mode, dev)
    }

    /// Versioned entry point that glibc before 2.33 compiles `mknod` into.
    /// Newer glibc only keeps it as a hidden compat symbol, in which case
    /// the call goes to `mknod`.
    ///
    /// # Safety
    /// Same contract as glibc's `__xmknod`.
    pub unsafe fn xmknod(
        &self,
        ver: c_int,
        path: *const c_char,
        mode: mode_t,
        dev: *mut dev_t,
    ) -> c_int {
        if !self.allows(OperationClass::Mknod, path) {
            return -1;
        }
        match self.try_real::<XmknodFn>(Symbol::Xmknod) {
            Some(real) => real(ver, path, mode, dev),
            None => {
                let real: MknodFn = self.real(Symbol::Mknod);
                real(path, mode, device(dev))
            }
        }
    }

    /// # Safety
    /// Same contract as `openat(2)`.
    pub unsafe fn openat(
        &self,
        sym: Symbol,
        dirfd: c_int,
        path: *const c_char,
        flags: c_int,
        mode: mode_t,
    ) -> c_int {
        if !self.allows_at(OperationClass::from_open_flags(flags), dirfd, path, false) {
            return -1;
        }
        let real: OpenatFn = self.real(sym);
        real(dirfd, path, flags, mode)
    }

    /// # Safety
    /// Same contract as `mkdirat(2)`.
    pub unsafe fn mkdirat(&self, dirfd: c_int, path: *const c_char, mode: mode_t) -> c_int {
        if !self.allows_at(OperationClass::Mkdir, dirfd, path, false) {
            return -1;
        }
        let real: AtModeFn = self.real(Symbol::Mkdirat);
        real(dirfd, path, mode)
    }

    /// # Safety
    /// Same contract as `mknodat(2)`.
    pub unsafe fn mknodat(&self, dirfd: c_int, path: *const c_char, mode: mode_t, dev: dev_t) -> c_int {
        if !self.allows_at(OperationClass::Mknod, dirfd, path, false) {
            return -1;
        }
        let real: MknodatFn = self.real(Symbol::Mknodat);
        real(dirfd, path, mode, dev)
    }

    /// # Safety
    /// Same contract as glibc's `__xmknodat`.
    pub unsafe fn xmknodat(
        &self,
        ver: c_int,
        dirfd: c_int,
        path: *const c_char,
        mode: mode_t,
        dev: *mut dev_t,
    ) -> c_int {
        if !self.allows_at(OperationClass::Mknod, dirfd, path, false) {
            return -1;
        }
        match self.try_real::<XmknodatFn>(Symbol::Xmknodat) {
            Some(real) => real(ver, dirfd, path, mode, dev),
            None => {
                let real: MknodatFn = self.real(Symbol::Mknodat);
                real(dirfd, path, mode, device(dev))
            }
        }
    }

    /// `AT_REMOVEDIR` makes this an rmdir.
    ///
    /// # Safety
    /// Same contract as `unlinkat(2)`.
    pub unsafe fn unlinkat(&self, dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
        let op = if flags & libc::AT_REMOVEDIR != 0 {
            OperationClass::Rmdir
        } else {
            OperationClass::Unlink
        };
        if !self.allows_at(op, dirfd, path, false) {
            return -1;
        }
        let real: UnlinkatFn = self.real(Symbol::Unlinkat);
        real(dirfd, path, flags)
    }

    /// Only the new name is checked.
    ///
    /// # Safety
    /// Same contract as `linkat(2)`.
    pub unsafe fn linkat(
        &self,
        olddirfd: c_int,
        old: *const c_char,
        newdirfd: c_int,
        new: *const c_char,
        flags: c_int,
    ) -> c_int {
        if !self.allows_at(OperationClass::Link, newdirfd, new, false) {
            return -1;
        }
        let real: LinkatFn = self.real(Symbol::Linkat);
        real(olddirfd, old, newdirfd, new, flags)
    }

    /// # Safety
    /// Same contract as `symlinkat(2)`.
    pub unsafe fn symlinkat(
        &self,
        target: *const c_char,
        newdirfd: c_int,
        linkpath: *const c_char,
    ) -> c_int {
        if !self.allows_at(OperationClass::Symlink, newdirfd, linkpath, false) {
            return -1;
        }
        let real: SymlinkatFn = self.real(Symbol::Symlinkat);
        real(target, newdirfd, linkpath)
    }

    /// # Safety
    /// Same contract as `renameat(2)`.
    pub unsafe fn renameat(
        &self,
        olddirfd: c_int,
        old: *const c_char,
        newdirfd: c_int,
        new: *const c_char,
    ) -> c_int {
        if !self.allows_rename_at(olddirfd, old, newdirfd, new) {
            return -1;
        }
        let real: RenameatFn = self.real(Symbol::Renameat);
        real(olddirfd, old, newdirfd, new)
    }

    /// # Safety
    /// Same contract as `renameat2(2)`.
    pub unsafe fn renameat2(
        &self,
        olddirfd: c_int,
        old: *const c_char,
        newdirfd: c_int,
        new: *const c_char,
        flags: c_uint,
    ) -> c_int {
        if !self.allows_rename_at(olddirfd, old, newdirfd, new) {
            return -1;
        }
        let real: Renameat2Fn = self.real(Symbol::Renameat2);
        real(olddirfd, old, newdirfd, new, flags)
    }

    unsafe fn allows_rename_at(
        &self,
        olddirfd: c_int,
        old: *const c_char,
        newdirfd: c_int,
        new: *const c_char,
    ) -> bool {
        self.allows_at(OperationClass::Rename, olddirfd, old, false)
            && self.allows_at(OperationClass::Rename, newdirfd, new, false)
    }

    /// # Safety
    /// Same contract as `fchmodat(2)`.
    pub unsafe fn fchmodat(&self, dirfd: c_int, path: *const c_char, mode: mode_t, flags: c_int) -> c_int {
        let empty_path = flags & libc::AT_EMPTY_PATH != 0;
        if !self.allows_at(OperationClass::Chmod, dirfd, path, empty_path) {
            return -1;
        }
        let real: FchmodatFn = self.real(Symbol::Fchmodat);
        real(dirfd, path, mode, flags)
    }

    /// `AT_SYMLINK_NOFOLLOW` makes this an lchown.
    ///
    /// # Safety
    /// Same contract as `fchownat(2)`.
    pub unsafe fn fchownat(
        &self,
        dirfd: c_int,
        path: *const c_char,
        owner: uid_t,
        group: gid_t,
        flags: c_int,
    ) -> c_int {
        let op = if flags & libc::AT_SYMLINK_NOFOLLOW != 0 {
            OperationClass::Lchown
        } else {
            OperationClass::Chown
        };
        let empty_path = flags & libc::AT_EMPTY_PATH != 0;
        if !self.allows_at(op, dirfd, path, empty_path) {
            return -1;
        }
        let real: FchownatFn = self.real(Symbol::Fchownat);
        real(dirfd, path, owner, group, flags)
    }

    /// A null name sets the times of `dirfd` itself.
    ///
    /// # Safety
    /// Same contract as `utimensat(2)`.
    pub unsafe fn utimensat(
        &self,
        dirfd: c_int,
        path: *const c_char,
        times: *const timespec,
        flags: c_int,
    ) -> c_int {
        let empty_path = path.is_null() || flags & libc::AT_EMPTY_PATH != 0;
        if !self.allows_at(OperationClass::Utimes, dirfd, path, empty_path) {
            return -1;
        }
        let real: UtimensatFn = self.real(Symbol::Utimensat);
        real(dirfd, path, times, flags)
    }

    /// Checked as a read of the executable. When allowed, the child
    /// environment is made to preload this library.
    ///
    /// # Safety
    /// Same contract as `execve(2)`.
    pub unsafe fn execve(
        &self,
        path: *const c_char,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> c_int {
        self.exec_as(OperationClass::Execve, path, argv, envp)
    }

    /// # Safety
    /// Same contract as `execv(3)`.
    pub unsafe fn execv(&self, path: *const c_char, argv: *const *const c_char) -> c_int {
        self.exec_as(OperationClass::Execv, path, argv, environ)
    }

    /// # Safety
    /// Same contract as `execvp(3)`.
    pub unsafe fn execvp(&self, file: *const c_char, argv: *const *const c_char) -> c_int {
        self.exec_search(OperationClass::Execvp, file, argv, environ)
    }

    /// # Safety
    /// Same contract as `execvpe(3)`.
    pub unsafe fn execvpe(
        &self,
        file: *const c_char,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> c_int {
        self.exec_search(OperationClass::Execvp, file, argv, envp)
    }

    /// `execl`, `execle` and `execlp` once the caller's variadic arguments
    /// are gathered in `args`: the argument list up to its null terminator,
    /// then for `execle` the environment pointer. Fails with `E2BIG` when no
    /// terminator is found.
    ///
    /// # Safety
    /// Entries before the terminator must be valid strings. For `execle` the
    /// entry after it must be a valid environment array.
    pub unsafe fn exec_list(
        &self,
        op: OperationClass,
        path: *const c_char,
        args: &[*const c_char],
    ) -> c_int {
        let Some(end) = args.iter().position(|arg| arg.is_null()) else {
            errno::set(libc::E2BIG);
            return -1;
        };
        let argv = args[..=end].as_ptr();
        match op {
            OperationClass::Execle => match args.get(end + 1) {
                Some(envp) => self.exec_as(op, path, argv, *envp as *const *const c_char),
                None => {
                    errno::set(libc::E2BIG);
                    -1
                }
            },
            OperationClass::Execlp => self.exec_search(op, path, argv, environ),
            _ => self.exec_as(op, path, argv, environ),
        }
    }

    /// `PATH` lookup the way `execvp` does it, with every candidate checked
    /// and launched through [`Interceptor::exec_as`]. Missing and refused
    /// candidates are skipped; `EACCES` wins over `ENOENT` at the end.
    unsafe fn exec_search(
        &self,
        op: OperationClass,
        file: *const c_char,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> c_int {
        if file.is_null() {
            return self.exec_as(op, file, argv, envp);
        }
        let search = self.env.var_bytes(ENV_PATH);
        let candidates = path_candidates(CStr::from_ptr(file).to_bytes(), search.as_deref());
        if candidates.is_empty() {
            errno::set(libc::ENOENT);
            return -1;
        }

        let mut refused = false;
        for candidate in &candidates {
            let rc = self.exec_as(op, candidate.as_ptr(), argv, envp);
            if rc != -1 {
                return rc;
            }
            match errno::get() {
                libc::EACCES => refused = true,
                libc::ENOENT | libc::ENOTDIR | libc::ESTALE | libc::ENODEV | libc::ETIMEDOUT => {}
                libc::ENOEXEC => return self.exec_script(op, candidate, argv, envp),
                _ => return -1,
            }
        }
        errno::set(if refused { libc::EACCES } else { libc::ENOENT });
        -1
    }

    /// Run a file without a recognized binary format as a shell script.
    unsafe fn exec_script(
        &self,
        op: OperationClass,
        script: &CStr,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> c_int {
        let mut args = vec![SCRIPT_SHELL.as_ptr(), script.as_ptr()];
        args.extend(string_array(argv).into_iter().skip(1));
        args.push(ptr::null());
        self.exec_as(op, SCRIPT_SHELL.as_ptr(), args.as_ptr(), envp)
    }

    unsafe fn exec_as(
        &self,
        op: OperationClass,
        path: *const c_char,
        argv: *const *const c_char,
        envp: *const *const c_char,
    ) -> c_int {
        if !self.allows(op, path) {
            return -1;
        }
        let real: ExecveFn = self.real(Symbol::Execve);
        self.with_child_env(envp, |envp| real(path, argv, envp))
    }

    /// Checked like `execve`. Reports failure through the return value.
    ///
    /// # Safety
    /// Same contract as `posix_spawn(3)`.
    pub unsafe fn posix_spawn(
        &self,
        pid: *mut pid_t,
        path: *const c_char,
        file_actions: *const posix_spawn_file_actions_t,
        attrp: *const posix_spawnattr_t,
        argv: *const *mut c_char,
        envp: *const *mut c_char,
    ) -> c_int {
        let launch = SpawnRequest {
            pid,
            file_actions,
            attrp,
            argv,
            envp,
        };
        self.spawn_as(OperationClass::PosixSpawn, path, &launch)
    }

    /// `PATH` lookup done here, each candidate spawned through the real
    /// `posix_spawn` so the library reaches the child.
    ///
    /// # Safety
    /// Same contract as `posix_spawnp(3)`.
    pub unsafe fn posix_spawnp(
        &self,
        pid: *mut pid_t,
        file: *const c_char,
        file_actions: *const posix_spawn_file_actions_t,
        attrp: *const posix_spawnattr_t,
        argv: *const *mut c_char,
        envp: *const *mut c_char,
    ) -> c_int {
        let op = OperationClass::PosixSpawnp;
        let launch = SpawnRequest {
            pid,
            file_actions,
            attrp,
            argv,
            envp,
        };
        if file.is_null() {
            return self.spawn_as(op, file, &launch);
        }
        let search = self.env.var_bytes(ENV_PATH);
        let candidates = path_candidates(CStr::from_ptr(file).to_bytes(), search.as_deref());

        let mut refused = false;
        for candidate in &candidates {
            match self.spawn_as(op, candidate.as_ptr(), &launch) {
                libc::EACCES => refused = true,
                libc::ENOENT | libc::ENOTDIR => {}
                rc => return rc,
            }
        }
        if refused {
            libc::EACCES
        } else {
            libc::ENOENT
        }
    }

    unsafe fn spawn_as(&self, op: OperationClass, path: *const c_char, launch: &SpawnRequest) -> c_int {
        if !self.allows(op, path) {
            return errno::get();
        }
        let real: PosixSpawnFn = self.real(Symbol::PosixSpawn);
        self.with_child_env(launch.envp.cast(), |envp| {
            real(
                launch.pid,
                path,
                launch.file_actions,
                launch.attrp,
                launch.argv,
                envp.cast(),
            )
        })
    }

    /// Run `launch` with `envp` edited so the new image preloads this
    /// library. Nested calls and a disarmed sandbox pass `envp` through.
    unsafe fn with_child_env<T>(
        &self,
        envp: *const *const c_char,
        launch: impl FnOnce(*const *const c_char) -> T,
    ) -> T {
        if ReentrancyGuard::is_active() || !is_sandbox_on(&self.env) {
            return launch(envp);
        }
        let Some(lib) = self.library_path() else {
            return launch(envp);
        };

        let mut entries: Vec<*const c_char> = string_array(envp);
        let texts: Vec<&[u8]> = entries
            .iter()
            .map(|e| CStr::from_ptr(*e).to_bytes())
            .collect();

        // Keeps the replacement string alive across the call.
        let edit = plan_preload_edit(&texts, lib.to_bytes());
        match &edit {
            PreloadEdit::Unchanged => return launch(envp),
            PreloadEdit::Replace { index, entry } => entries[*index] = entry.as_ptr(),
            PreloadEdit::Append(entry) => entries.push(entry.as_ptr()),
        }
        entries.push(ptr::null());
        launch(entries.as_ptr())
    }
}

/// Arguments of a spawn call that pass through unchanged.
struct SpawnRequest {
    pid: *mut pid_t,
    file_actions: *const posix_spawn_file_actions_t,
    attrp: *const posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
}

unsafe fn device(dev: *const dev_t) -> dev_t {
    if dev.is_null() {
        0
    } else {
        *dev
    }
}

/// Collect a NULL-terminated array of strings (`argv`, `envp`).
unsafe fn string_array(array: *const *const c_char) -> Vec<*const c_char> {
    let mut entries = Vec::new();
    if array.is_null() {
        return entries;
    }
    let mut cursor = array;
    while !(*cursor).is_null() {
        entries.push(*cursor);
        cursor = cursor.add(1);
    }
    entries
}
