//! Integration tests for the decision engine
//!
//! Prefix lists are read from a fixed environment, paths go through the same
//! canonicalization the wrappers use.

use sandbox::config::env::{
    MapEnv, ENV_SANDBOX_DENY, ENV_SANDBOX_PREDICT, ENV_SANDBOX_READ, ENV_SANDBOX_WRITE,
};
use sandbox::policy::canonicalize::canonicalize_in;
use sandbox::policy::{CanonicalPath, HostProbe, OperationClass, SandboxContext};
use sandbox::Verdict;

struct Host {
    registered: bool,
}

impl HostProbe for Host {
    fn is_registered_session(&self) -> bool {
        self.registered
    }

    fn is_existing_directory(&self, path: &CanonicalPath) -> bool {
        path.as_bytes() == b"/usr/lib"
    }
}

const HOST: Host = Host { registered: false };

fn decide(ctx: &mut SandboxContext, op: OperationClass, path: &str) -> Verdict {
    let path = canonicalize_in(path.as_bytes(), b"/tmp/build/work", None).unwrap();
    ctx.decide(op, &path, &HOST)
}

fn context(env: &MapEnv) -> SandboxContext {
    let mut ctx = SandboxContext::new();
    ctx.refresh(env);
    ctx
}

#[test]
fn test_build_tree_scenario() {
    let env = MapEnv::new()
        .with(ENV_SANDBOX_DENY, "/etc")
        .with(ENV_SANDBOX_READ, "/")
        .with(ENV_SANDBOX_WRITE, "/tmp/build")
        .with(ENV_SANDBOX_PREDICT, "/usr/share/fonts");
    let mut ctx = context(&env);

    assert_eq!(decide(&mut ctx, OperationClass::OpenRead, "/usr/include/stdio.h"), Verdict::ALLOW);
    assert_eq!(decide(&mut ctx, OperationClass::OpenWrite, "obj/main.o"), Verdict::ALLOW);
    assert_eq!(
        decide(&mut ctx, OperationClass::Unlink, "../../../usr/bin/gcc"),
        Verdict::DENY
    );
    assert_eq!(decide(&mut ctx, OperationClass::OpenRead, "/etc/passwd"), Verdict::DENY);
    assert_eq!(
        decide(&mut ctx, OperationClass::OpenWrite, "/usr/share/fonts/fonts.cache"),
        Verdict::ALLOW_SILENT
    );
    assert_eq!(decide(&mut ctx, OperationClass::Mkdir, "/usr/lib"), Verdict::ALLOW_SILENT);
    assert_eq!(decide(&mut ctx, OperationClass::Mkdir, "/usr/lib64"), Verdict::DENY);
}

#[test]
fn test_deny_beats_every_allow_list() {
    let env = MapEnv::new()
        .with(ENV_SANDBOX_DENY, "/tmp/build/secret")
        .with(ENV_SANDBOX_READ, "/")
        .with(ENV_SANDBOX_WRITE, "/tmp/build")
        .with(ENV_SANDBOX_PREDICT, "/tmp/build");
    let mut ctx = context(&env);

    for op in [
        OperationClass::OpenRead,
        OperationClass::OpenWrite,
        OperationClass::Unlink,
        OperationClass::Mkdir,
    ] {
        assert_eq!(decide(&mut ctx, op, "../secret/key"), Verdict::DENY, "{op}");
    }
}

#[test]
fn test_prefix_match_is_bytewise() {
    let env = MapEnv::new()
        .with(ENV_SANDBOX_DENY, "")
        .with(ENV_SANDBOX_READ, "/")
        .with(ENV_SANDBOX_WRITE, "/tmp/build");
    let mut ctx = context(&env);

    // No component boundary: /tmp/buildroot shares the prefix
    assert!(decide(&mut ctx, OperationClass::OpenWrite, "/tmp/buildroot/x").allowed);
    assert!(!decide(&mut ctx, OperationClass::OpenWrite, "/tmp/buil").allowed);
}

#[test]
fn test_policy_changes_take_effect_on_refresh() {
    let mut env = MapEnv::new()
        .with(ENV_SANDBOX_DENY, "")
        .with(ENV_SANDBOX_READ, "/")
        .with(ENV_SANDBOX_WRITE, "/tmp/build");
    let mut ctx = context(&env);
    assert!(!decide(&mut ctx, OperationClass::OpenWrite, "/opt/out").allowed);

    env.set(ENV_SANDBOX_WRITE, "/tmp/build:/opt");
    ctx.refresh(&env);
    assert!(decide(&mut ctx, OperationClass::OpenWrite, "/opt/out").allowed);
}

#[test]
fn test_preload_list_carve_out() {
    let env = MapEnv::new()
        .with(ENV_SANDBOX_DENY, "/etc/ld.so.preload")
        .with(ENV_SANDBOX_READ, "/")
        .with(ENV_SANDBOX_WRITE, "/tmp");
    let mut ctx = context(&env);
    let path = canonicalize_in(b"/etc/ld.so.preload", b"/", None).unwrap();

    let controller = Host { registered: true };
    assert!(ctx.decide(OperationClass::OpenWrite, &path, &controller).allowed);
    assert!(!ctx.decide(OperationClass::OpenWrite, &path, &HOST).allowed);
}
