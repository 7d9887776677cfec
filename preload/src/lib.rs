//! Interposition library.
//!
//! Built as `libsandbox_preload.so` and force-loaded into every process of a
//! sandbox session through `LD_PRELOAD` or the global preload file. Each
//! export shadows the libc function of the same name and delegates to
//! [`sandbox::intercept`]; nothing else lives here.
//!
//! `open`, `open64`, `openat` and `openat64` are variadic in C. They are
//! declared here with a fixed trailing `mode_t` argument, which reads the
//! same register or stack slot a variadic caller fills on the x86_64 and
//! aarch64 Linux ABIs.
//!
//! `execl`, `execle` and `execlp` take a null-terminated variadic list. On
//! those ABIs variadic pointer arguments sit exactly where fixed pointer
//! parameters would, so each is declared with [`EXEC_LIST_SLOTS`] fixed
//! slots and the list is read up to its terminator. Slots past the
//! terminator are never dereferenced. A list longer than the slots fails
//! with `E2BIG`. Stable Rust cannot define C-variadic functions, and a C
//! shim would need its own build step.

#![allow(clippy::missing_safety_doc, clippy::too_many_arguments)]

use libc::{
    c_char, c_int, c_uint, dev_t, gid_t, mode_t, off64_t, off_t, pid_t,
    posix_spawn_file_actions_t, posix_spawnattr_t, timespec, timeval, uid_t, utimbuf, DIR, FILE,
};
use sandbox::intercept::{interceptor, on_load, on_unload, OperationClass, Symbol};

/// Argument slots read by the `execl` family, terminator included.
pub const EXEC_LIST_SLOTS: usize = 32;

#[used]
#[link_section = ".init_array"]
static LOAD_HOOK: extern "C" fn() = load_hook;

#[used]
#[link_section = ".fini_array"]
static UNLOAD_HOOK: extern "C" fn() = unload_hook;

extern "C" fn load_hook() {
    on_load();
}

extern "C" fn unload_hook() {
    on_unload();
}

#[no_mangle]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    interceptor().open(Symbol::Open, path, flags, mode)
}

#[no_mangle]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    interceptor().open(Symbol::Open64, path, flags, mode)
}

#[no_mangle]
pub unsafe extern "C" fn creat(path: *const c_char, mode: mode_t) -> c_int {
    interceptor().creat(Symbol::Creat, path, mode)
}

#[no_mangle]
pub unsafe extern "C" fn creat64(path: *const c_char, mode: mode_t) -> c_int {
    interceptor().creat(Symbol::Creat64, path, mode)
}

#[no_mangle]
pub unsafe extern "C" fn fopen(path: *const c_char, mode: *const c_char) -> *mut FILE {
    interceptor().fopen(Symbol::Fopen, path, mode)
}

#[no_mangle]
pub unsafe extern "C" fn fopen64(path: *const c_char, mode: *const c_char) -> *mut FILE {
    interceptor().fopen(Symbol::Fopen64, path, mode)
}

#[no_mangle]
pub unsafe extern "C" fn opendir(path: *const c_char) -> *mut DIR {
    interceptor().opendir(path)
}

#[no_mangle]
pub unsafe extern "C" fn mkdir(path: *const c_char, mode: mode_t) -> c_int {
    interceptor().mkdir(path, mode)
}

#[no_mangle]
pub unsafe extern "C" fn rmdir(path: *const c_char) -> c_int {
    interceptor().rmdir(path)
}

#[no_mangle]
pub unsafe extern "C" fn unlink(path: *const c_char) -> c_int {
    interceptor().unlink(path)
}

#[no_mangle]
pub unsafe extern "C" fn link(old: *const c_char, new: *const c_char) -> c_int {
    interceptor().link(old, new)
}

#[no_mangle]
pub unsafe extern "C" fn symlink(target: *const c_char, linkpath: *const c_char) -> c_int {
    interceptor().symlink(target, linkpath)
}

#[no_mangle]
pub unsafe extern "C" fn rename(old: *const c_char, new: *const c_char) -> c_int {
    interceptor().rename(old, new)
}

#[no_mangle]
pub unsafe extern "C" fn chmod(path: *const c_char, mode: mode_t) -> c_int {
    interceptor().chmod(path, mode)
}

#[no_mangle]
pub unsafe extern "C" fn chown(path: *const c_char, owner: uid_t, group: gid_t) -> c_int {
    interceptor().chown(path, owner, group)
}

#[no_mangle]
pub unsafe extern "C" fn lchown(path: *const c_char, owner: uid_t, group: gid_t) -> c_int {
    interceptor().lchown(path, owner, group)
}

#[no_mangle]
pub unsafe extern "C" fn truncate(path: *const c_char, length: off_t) -> c_int {
    interceptor().truncate(path, length)
}

#[no_mangle]
pub unsafe extern "C" fn truncate64(path: *const c_char, length: off64_t) -> c_int {
    interceptor().truncate64(path, length)
}

#[no_mangle]
pub unsafe extern "C" fn utime(path: *const c_char, times: *const utimbuf) -> c_int {
    interceptor().utime(path, times)
}

#[no_mangle]
pub unsafe extern "C" fn utimes(path: *const c_char, times: *const timeval) -> c_int {
    interceptor().utimes(path, times)
}

#[no_mangle]
pub unsafe extern "C" fn mkfifo(path: *const c_char, mode: mode_t) -> c_int {
    interceptor().mkfifo(path, mode)
}

#[no_mangle]
pub unsafe extern "C" fn execve(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    interceptor().execve(path, argv, envp)
}

#[no_mangle]
pub unsafe extern "C" fn execv(path: *const c_char, argv: *const *const c_char) -> c_int {
    interceptor().execv(path, argv)
}

#[no_mangle]
pub unsafe extern "C" fn execvp(file: *const c_char, argv: *const *const c_char) -> c_int {
    interceptor().execvp(file, argv)
}

#[no_mangle]
pub unsafe extern "C" fn execvpe(
    file: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    interceptor().execvpe(file, argv, envp)
}

macro_rules! exec_list_export {
    ($name:ident, $op:expr) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(
            path: *const c_char,
            a0: *const c_char,
            a1: *const c_char,
            a2: *const c_char,
            a3: *const c_char,
            a4: *const c_char,
            a5: *const c_char,
            a6: *const c_char,
            a7: *const c_char,
            a8: *const c_char,
            a9: *const c_char,
            a10: *const c_char,
            a11: *const c_char,
            a12: *const c_char,
            a13: *const c_char,
            a14: *const c_char,
            a15: *const c_char,
            a16: *const c_char,
            a17: *const c_char,
            a18: *const c_char,
            a19: *const c_char,
            a20: *const c_char,
            a21: *const c_char,
            a22: *const c_char,
            a23: *const c_char,
            a24: *const c_char,
            a25: *const c_char,
            a26: *const c_char,
            a27: *const c_char,
            a28: *const c_char,
            a29: *const c_char,
            a30: *const c_char,
            a31: *const c_char,
        ) -> c_int {
            let args: [*const c_char; EXEC_LIST_SLOTS] = [
                a0, a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13, a14, a15, a16, a17,
                a18, a19, a20, a21, a22, a23, a24, a25, a26, a27, a28, a29, a30, a31,
            ];
            interceptor().exec_list($op, path, &args)
        }
    };
}

exec_list_export!(execl, OperationClass::Execl);
exec_list_export!(execle, OperationClass::Execle);
exec_list_export!(execlp, OperationClass::Execlp);

#[no_mangle]
pub unsafe extern "C" fn posix_spawn(
    pid: *mut pid_t,
    path: *const c_char,
    file_actions: *const posix_spawn_file_actions_t,
    attrp: *const posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int {
    interceptor().posix_spawn(pid, path, file_actions, attrp, argv, envp)
}

#[no_mangle]
pub unsafe extern "C" fn posix_spawnp(
    pid: *mut pid_t,
    file: *const c_char,
    file_actions: *const posix_spawn_file_actions_t,
    attrp: *const posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int {
    interceptor().posix_spawnp(pid, file, file_actions, attrp, argv, envp)
}

#[no_mangle]
pub unsafe extern "C" fn mknod(path: *const c_char, mode: mode_t, dev: dev_t) -> c_int {
    interceptor().mknod(path, mode, dev)
}

#[no_mangle]
pub unsafe extern "C" fn __xmknod(
    ver: c_int,
    path: *const c_char,
    mode: mode_t,
    dev: *mut dev_t,
) -> c_int {
    interceptor().xmknod(ver, path, mode, dev)
}

#[no_mangle]
pub unsafe extern "C" fn openat(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    interceptor().openat(Symbol::Openat, dirfd, path, flags, mode)
}

#[no_mangle]
pub unsafe extern "C" fn openat64(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    interceptor().openat(Symbol::Openat64, dirfd, path, flags, mode)
}

#[no_mangle]
pub unsafe extern "C" fn mkdirat(dirfd: c_int, path: *const c_char, mode: mode_t) -> c_int {
    interceptor().mkdirat(dirfd, path, mode)
}

#[no_mangle]
pub unsafe extern "C" fn mknodat(
    dirfd: c_int,
    path: *const c_char,
    mode: mode_t,
    dev: dev_t,
) -> c_int {
    interceptor().mknodat(dirfd, path, mode, dev)
}

#[no_mangle]
pub unsafe extern "C" fn __xmknodat(
    ver: c_int,
    dirfd: c_int,
    path: *const c_char,
    mode: mode_t,
    dev: *mut dev_t,
) -> c_int {
    interceptor().xmknodat(ver, dirfd, path, mode, dev)
}

#[no_mangle]
pub unsafe extern "C" fn unlinkat(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
    interceptor().unlinkat(dirfd, path, flags)
}

#[no_mangle]
pub unsafe extern "C" fn linkat(
    olddirfd: c_int,
    old: *const c_char,
    newdirfd: c_int,
    new: *const c_char,
    flags: c_int,
) -> c_int {
    interceptor().linkat(olddirfd, old, newdirfd, new, flags)
}

#[no_mangle]
pub unsafe extern "C" fn symlinkat(
    target: *const c_char,
    newdirfd: c_int,
    linkpath: *const c_char,
) -> c_int {
    interceptor().symlinkat(target, newdirfd, linkpath)
}

#[no_mangle]
pub unsafe extern "C" fn renameat(
    olddirfd: c_int,
    old: *const c_char,
    newdirfd: c_int,
    new: *const c_char,
) -> c_int {
    interceptor().renameat(olddirfd, old, newdirfd, new)
}

#[no_mangle]
pub unsafe extern "C" fn renameat2(
    olddirfd: c_int,
    old: *const c_char,
    newdirfd: c_int,
    new: *const c_char,
    flags: c_uint,
) -> c_int {
    interceptor().renameat2(olddirfd, old, newdirfd, new, flags)
}

#[no_mangle]
pub unsafe extern "C" fn fchmodat(
    dirfd: c_int,
    path: *const c_char,
    mode: mode_t,
    flags: c_int,
) -> c_int {
    interceptor().fchmodat(dirfd, path, mode, flags)
}

#[no_mangle]
pub unsafe extern "C" fn fchownat(
    dirfd: c_int,
    path: *const c_char,
    owner: uid_t,
    group: gid_t,
    flags: c_int,
) -> c_int {
    interceptor().fchownat(dirfd, path, owner, group, flags)
}

#[no_mangle]
pub unsafe extern "C" fn utimensat(
    dirfd: c_int,
    path: *const c_char,
    times: *const timespec,
    flags: c_int,
) -> c_int {
    interceptor().utimensat(dirfd, path, times, flags)
}
