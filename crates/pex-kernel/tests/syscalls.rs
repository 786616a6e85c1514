//! Syscall dispatch, the audit trail and VPE control

mod common;

use common::*;
use pex_audit::SysEventType;
use pex_dtu_mock::MockDtu;
use pex_kernel::cap::TableId;
use pex_kernel::kif::encode_reply;
use pex_kernel::{
    CapRngDesc, Code, Kernel, PeFlags, RangeKind, SwitchConfig, Syscall, SyscallOutcome, VpeId,
    VpeOp, VpeState, STOPPED_EXIT_CODE,
};

fn setup() -> (Kernel<MockDtu>, VpeId) {
    let mut kernel = boot(platform_with(
        &[PeFlags::empty(), PeFlags::empty()],
        SwitchConfig::default(),
    ));
    let root = start(&mut kernel, app("root"));
    (kernel, root)
}

fn vpectrl(vpe: u32, op: VpeOp) -> Syscall {
    Syscall::VpeCtrl { vpe, op, arg: 0 }
}

/// Create and start a child at selector 2
fn spawn_child(kernel: &mut Kernel<MockDtu>, root: VpeId) -> VpeId {
    let vals = call_ok(
        kernel,
        root,
        Syscall::CreateVpe {
            dst: 2,
            name: "child".to_string(),
            isa: None,
            muxable: false,
        },
    );
    call_ok(kernel, root, vpectrl(2, VpeOp::Start));
    vals[0] as VpeId
}

#[test]
fn test_malformed_syscall_is_answered_and_audited() {
    let (mut kernel, root) = setup();
    let before = kernel.syslog().len();

    let out = kernel.handle_syscall(root, &[0xff; 3]);
    assert_eq!(out, SyscallOutcome::Replied(Err(Code::InvArgs)));
    assert_eq!(last_reply(&kernel, root), Some(Err(Code::InvArgs)));

    let events = &kernel.syslog().events()[before..];
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].sender, root);
    assert!(matches!(events[0].event_type, SysEventType::Request { .. }));
    match events[1].event_type {
        SysEventType::Response { request_id, result } => {
            assert_eq!(request_id, events[0].id);
            assert_eq!(result, Code::InvArgs as i64);
        }
        ref other => panic!("expected a response, got {:?}", other),
    }
    assert!(kernel.syslog().open_requests().is_empty());
}

#[test]
fn test_unknown_opcode_is_rejected() {
    let (mut kernel, root) = setup();
    let msg = 0xdead_u64.to_le_bytes();
    assert_eq!(
        kernel.handle_syscall(root, &msg),
        SyscallOutcome::Replied(Err(Code::InvArgs))
    );
}

#[test]
fn test_noop_replies_empty() {
    let (mut kernel, root) = setup();
    assert_eq!(call(&mut kernel, root, Syscall::Noop), Ok(vec![]));

    match kernel.syslog().events().last().map(|e| &e.event_type) {
        Some(SysEventType::Response { result, .. }) => assert_eq!(*result, 0),
        other => panic!("expected a response, got {:?}", other),
    }
}

#[test]
fn test_syscalls_of_unknown_vpes_are_dropped() {
    let (mut kernel, _) = setup();
    let before = kernel.syslog().len();
    let out = kernel.handle_syscall(999, &Syscall::Noop.encode());
    assert_eq!(out, SyscallOutcome::NoReply);
    assert_eq!(kernel.syslog().len(), before);
}

#[test]
fn test_deferred_reply_closes_audit_record() {
    let mut kernel = boot(platform_with(
        &[PeFlags::empty(), PeFlags::empty()],
        SwitchConfig::default(),
    ));
    let srv = start(&mut kernel, app("fs"));
    provide_service(&mut kernel, srv, "fs");
    let client = start(&mut kernel, app("client"));

    let out = kernel.syscall(
        client,
        &Syscall::CreateSess {
            dst: 2,
            name: "fs".to_string(),
            arg: 0,
        },
    );
    let req = match out {
        SyscallOutcome::Suspended(req) => req,
        other => panic!("session opened right away: {:?}", other),
    };
    assert_eq!(kernel.syslog().open_requests(), vec![req]);
    assert_eq!(kernel.syslog().response_of(req), None);

    let reqs = service_requests(&kernel, srv);
    kernel.handle_service_reply(srv, reqs[0].0, &encode_reply(&Ok(vec![0x33])));
    assert_eq!(kernel.syslog().response_of(req), Some(0));
    assert!(kernel.syslog().open_requests().is_empty());
}

// ============================================================================
// VPE control
// ============================================================================

#[test]
fn test_wait_reports_exit_code() {
    let (mut kernel, root) = setup();
    let child = spawn_child(&mut kernel, root);
    assert_eq!(
        kernel.vpes().get(child).map(|v| v.state()),
        Some(VpeState::Running)
    );

    let out = kernel.syscall(root, &vpectrl(2, VpeOp::Wait));
    assert!(matches!(out, SyscallOutcome::Suspended(_)), "{:?}", out);

    assert_eq!(kernel.syscall(child, &Syscall::Exit { code: 3 }), SyscallOutcome::NoReply);
    assert_eq!(kernel.waiting(), 0);
    assert_eq!(last_reply(&kernel, root), Some(Ok(vec![3])));

    // the VPE capability keeps the dead child around
    assert_eq!(
        kernel.vpes().get(child).map(|v| v.state()),
        Some(VpeState::Dead)
    );
    assert_eq!(call(&mut kernel, root, vpectrl(2, VpeOp::Wait)), Ok(vec![3]));

    call_ok(
        &mut kernel,
        root,
        Syscall::Revoke {
            vpe: 0,
            crd: CapRngDesc::single(2),
            own: true,
            kind: RangeKind::Obj,
        },
    );
    assert!(!kernel.vpes().contains(child));
    assert!(!kernel.caps().has_table(TableId::Obj(child)));
    assert_invariants(&kernel);
}

#[test]
fn test_stop_reports_stopped_exit_code() {
    let (mut kernel, root) = setup();
    let child = spawn_child(&mut kernel, root);

    call_ok(&mut kernel, root, vpectrl(2, VpeOp::Stop));
    assert_eq!(
        kernel.vpes().get(child).map(|v| v.state()),
        Some(VpeState::Dead)
    );
    let code = call_ok(&mut kernel, root, vpectrl(2, VpeOp::Wait));
    assert_eq!(code, vec![STOPPED_EXIT_CODE as i64 as u64]);

    // a dead VPE cannot be started again
    assert_eq!(call(&mut kernel, root, vpectrl(2, VpeOp::Start)), Err(Code::Gone));
    assert_eq!(kernel.syscall(child, &Syscall::Noop), SyscallOutcome::NoReply);
    assert_invariants(&kernel);
}

#[test]
fn test_vpectrl_checks_target() {
    let (mut kernel, root) = setup();
    spawn_child(&mut kernel, root);

    assert_eq!(call(&mut kernel, root, vpectrl(0, VpeOp::Start)), Err(Code::InvArgs));
    assert_eq!(call(&mut kernel, root, vpectrl(0, VpeOp::Wait)), Err(Code::InvArgs));
    assert_eq!(call(&mut kernel, root, vpectrl(2, VpeOp::Yield)), Err(Code::InvArgs));
    assert_eq!(call(&mut kernel, root, vpectrl(2, VpeOp::Start)), Err(Code::Exists));
    assert_eq!(call(&mut kernel, root, vpectrl(1, VpeOp::Stop)), Err(Code::InvArgs));
    assert_eq!(call(&mut kernel, root, vpectrl(42, VpeOp::Stop)), Err(Code::NotFound));
}

#[test]
fn test_exit_of_root_tears_down_its_children_caps() {
    let (mut kernel, root) = setup();
    let child = spawn_child(&mut kernel, root);

    assert_eq!(kernel.syscall(root, &Syscall::Exit { code: 0 }), SyscallOutcome::NoReply);
    assert!(!kernel.vpes().contains(root));
    // the running child holds its own reference
    assert!(kernel.vpes().contains(child));
    assert!(kernel.caps().get(TableId::Obj(child), 0).is_some());
    assert_invariants(&kernel);

    kernel.syscall(child, &Syscall::Exit { code: 0 });
    assert!(!kernel.vpes().contains(child));
    assert_invariants(&kernel);
}
