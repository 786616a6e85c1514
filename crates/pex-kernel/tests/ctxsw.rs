//! Multiplexing VPEs on PEs with a switching agent

mod common;

use common::*;
use pex_dtu_mock::{AgentMode, MockDtu};
use pex_kernel::pes::SwitchState;
use pex_kernel::{
    Code, Kernel, PeFlags, SwitchConfig, Syscall, SyscallOutcome, VpeFlags, VpeId, VpeState,
};

const PE: usize = 1;

#[test]
fn test_time_slices_alternate_vpes() {
    let mut kernel = boot(platform(1));
    let a = start(&mut kernel, muxable("a"));
    assert_eq!(current(&kernel, PE), Some(a));

    // the newcomer takes over right away; a waits for its turn
    let b = start(&mut kernel, muxable("b"));
    assert_eq!(current(&kernel, PE), Some(b));
    let ready: Vec<_> = kernel.pes().switcher_of(PE).expect("muxed").ready().collect();
    assert_eq!(ready, vec![a]);
    assert_invariants(&kernel);

    for expected in [a, b, a, b] {
        assert!(fire_next(&mut kernel));
        assert_eq!(current(&kernel, PE), Some(expected));
        let ctx = kernel.pes().switcher_of(PE).expect("muxed");
        assert_eq!(ctx.state(), SwitchState::Idle);
        assert_eq!(ctx.ready_len(), 1);
        assert_invariants(&kernel);
    }

    let running = kernel.vpes().get(b).expect("b exists");
    assert_eq!(running.state(), VpeState::Running);
    assert!(running.is_resident());
    let waiting = kernel.vpes().get(a).expect("a exists");
    assert_eq!(waiting.state(), VpeState::Suspended);
    assert!(waiting.has(VpeFlags::READY));
}

#[test]
fn test_single_vpe_keeps_its_pe() {
    let mut kernel = boot(platform(1));
    let a = start(&mut kernel, muxable("a"));

    // nobody else is ready, so no time slice is armed
    assert_eq!(kernel.next_deadline(), None);

    let out = kernel.syscall(
        a,
        &Syscall::VpeCtrl {
            vpe: 0,
            op: pex_kernel::VpeOp::Yield,
            arg: 0,
        },
    );
    assert_eq!(out, SyscallOutcome::Replied(Ok(vec![])));
    assert_eq!(current(&kernel, PE), Some(a));
    assert_invariants(&kernel);
}

#[test]
fn test_yield_hands_over_the_pe() {
    let mut kernel = boot(platform(1));
    let a = start(&mut kernel, muxable("a"));
    let b = start(&mut kernel, muxable("b"));
    assert_eq!(current(&kernel, PE), Some(b));

    let out = kernel.syscall(
        b,
        &Syscall::VpeCtrl {
            vpe: 0,
            op: pex_kernel::VpeOp::Yield,
            arg: 0,
        },
    );
    assert_eq!(out, SyscallOutcome::Replied(Ok(vec![])));
    assert_eq!(current(&kernel, PE), Some(a));
    assert_invariants(&kernel);
}

#[test]
fn test_non_muxable_vpe_gets_a_pe_of_its_own() {
    let mut kernel = boot(platform(2));
    let a = start(&mut kernel, app("a"));
    let b = start(&mut kernel, muxable("b"));

    let pe_a = kernel.vpes().get(a).map(|v| v.pe()).expect("a exists");
    let pe_b = kernel.vpes().get(b).map(|v| v.pe()).expect("b exists");
    assert_ne!(pe_a, pe_b);

    // neither PE accepts another VPE
    assert_eq!(kernel.create_boot_vpe(&app("c")), Err(Code::NoFreePe));
    let c = start(&mut kernel, muxable("c"));
    assert_eq!(kernel.vpes().get(c).map(|v| v.pe()), Some(pe_b));
    assert_invariants(&kernel);
}

#[test]
fn test_unresponsive_agent_disables_pe() {
    let mut kernel = boot(platform(1));
    let a = start(&mut kernel, muxable("a"));

    kernel.dtu().set_agent(PE, AgentMode::Unresponsive);
    let b = start(&mut kernel, muxable("b"));
    assert_eq!(
        kernel.pes().switcher_of(PE).map(|c| c.state()),
        Some(SwitchState::StoreDone)
    );

    let failed = run_until(&mut kernel, 64, |k| {
        k.pes().switcher_of(PE).is_some_and(|c| c.failed())
    });
    assert!(failed, "PE never gave up on its agent");
    // the agent was asked to store a
    assert!(kernel.dtu().irq_count(PE) >= 1);

    assert!(!kernel.vpes().contains(a));
    assert!(!kernel.vpes().contains(b));
    assert_eq!(kernel.next_deadline(), None);
    assert_eq!(kernel.create_boot_vpe(&muxable("c")), Err(Code::NoFreePe));
    assert_invariants(&kernel);
}

#[test]
fn test_slow_agent_is_polled_until_it_answers() {
    let cfg = SwitchConfig {
        init_wait_time: 10,
        ..SwitchConfig::default()
    };
    let mut kernel = boot(platform_with(&[PeFlags::CTXSW], cfg));
    kernel
        .dtu()
        .set_agent(PE, AgentMode::Responsive { polls_before_ack: 4 });

    let a = start(&mut kernel, muxable("a"));
    assert_ne!(current(&kernel, PE), Some(a));
    assert!(kernel.next_deadline().is_some());

    let switched = run_until(&mut kernel, 32, |k| {
        current(k, PE) == Some(a)
            && k.pes().switcher_of(PE).is_some_and(|c| c.is_idle())
    });
    assert!(switched);
    let vpe = kernel.vpes().get(a).expect("a exists");
    assert_eq!(vpe.state(), VpeState::Running);
    assert!(!vpe.has(VpeFlags::INIT));
    assert_invariants(&kernel);
}

#[test]
fn test_exit_during_store_defers_teardown() {
    let mut kernel = boot(platform(1));
    let a = start(&mut kernel, muxable("a"));
    let b = start(&mut kernel, muxable("b"));
    assert_eq!(current(&kernel, PE), Some(b));

    kernel
        .dtu()
        .set_agent(PE, AgentMode::Responsive { polls_before_ack: 3 });
    // the time slice ends; storing b takes a few polls
    assert!(fire_next(&mut kernel));
    assert_eq!(
        kernel.pes().switcher_of(PE).map(|c| c.state()),
        Some(SwitchState::StoreDone)
    );
    assert_eq!(current(&kernel, PE), Some(b));

    let out = kernel.syscall(b, &Syscall::Exit { code: 0 });
    assert_eq!(out, SyscallOutcome::NoReply);
    let dying = kernel.vpes().get(b).expect("b outlives the switch");
    assert_eq!(dying.state(), VpeState::Dead);
    assert_invariants(&kernel);

    let gone = run_until(&mut kernel, 32, |k| !k.vpes().contains(b));
    assert!(gone);
    assert!(run_until(&mut kernel, 32, |k| {
        k.pes().switcher_of(PE).is_some_and(|c| c.is_idle())
    }));
    assert_eq!(current(&kernel, PE), Some(a));
    assert_invariants(&kernel);
}

#[test]
fn test_last_vpe_exit_returns_pe_to_idle() {
    let mut kernel = boot(platform(1));
    let a = start(&mut kernel, muxable("a"));
    let idle = kernel
        .pes()
        .switcher_of(PE)
        .and_then(|c| c.idle_vpe())
        .expect("idle VPE");

    let out = kernel.syscall(a, &Syscall::Exit { code: 1 });
    assert_eq!(out, SyscallOutcome::NoReply);
    assert!(!kernel.vpes().contains(a));
    assert_eq!(current(&kernel, PE), Some(idle));

    // the PE is free for a VPE that wants it alone
    let b = start(&mut kernel, app("b"));
    assert_eq!(kernel.vpes().get(b).map(|v| v.pe()), Some(PE));
    assert_invariants(&kernel);
}

/// Two muxed VPEs on PE 1 and the service "fs" on PE 2
fn with_service() -> (Kernel<MockDtu>, VpeId, VpeId, VpeId) {
    let mut kernel = boot(platform_with(
        &[PeFlags::CTXSW, PeFlags::empty()],
        SwitchConfig::default(),
    ));
    let a = start(&mut kernel, muxable("a"));
    let fs = start(&mut kernel, app("fs"));
    let b = start(&mut kernel, muxable("b"));
    assert_eq!(kernel.vpes().get(fs).map(|v| v.pe()), Some(PE + 1));
    assert_eq!(kernel.vpes().get(b).map(|v| v.pe()), Some(PE));
    provide_service(&mut kernel, fs, "fs");
    assert_eq!(current(&kernel, PE), Some(b));
    (kernel, a, b, fs)
}

fn create_sess(kernel: &mut Kernel<MockDtu>, vpe: VpeId) {
    let out = kernel.syscall(
        vpe,
        &Syscall::CreateSess {
            dst: 2,
            name: "fs".to_string(),
            arg: 0,
        },
    );
    assert!(matches!(out, SyscallOutcome::Suspended(_)), "{:?}", out);
}

#[test]
fn test_reply_wakes_blocked_vpe() {
    let (mut kernel, a, b, fs) = with_service();
    create_sess(&mut kernel, b);

    // b waits for the service and blocks when its slice ends
    kernel.dtu().block_next_store(PE);
    assert!(fire_next(&mut kernel));
    assert_eq!(current(&kernel, PE), Some(a));
    let ctx = kernel.pes().switcher_of(PE).expect("muxed");
    assert_eq!(ctx.ready_len(), 0);
    assert_eq!(kernel.next_deadline(), None);

    let reqs = service_requests(&kernel, fs);
    assert_eq!(reqs.len(), 1);
    answer(&mut kernel, fs, reqs[0].0, Ok(vec![7]));
    kernel.process();

    assert_eq!(last_reply(&kernel, b), Some(Ok(vec![])));
    let ready: Vec<_> = kernel.pes().switcher_of(PE).expect("muxed").ready().collect();
    assert_eq!(ready, vec![b]);
    assert!(kernel.next_deadline().is_some());
    assert_invariants(&kernel);

    assert!(fire_next(&mut kernel));
    assert_eq!(current(&kernel, PE), Some(b));
    assert_eq!(kernel.vpes().get(b).map(|v| v.state()), Some(VpeState::Running));
    assert_invariants(&kernel);
}

#[test]
fn test_reply_during_store_keeps_vpe_ready() {
    let (mut kernel, a, b, fs) = with_service();
    create_sess(&mut kernel, b);

    kernel
        .dtu()
        .set_agent(PE, AgentMode::Responsive { polls_before_ack: 3 });
    kernel.dtu().block_next_store(PE);
    assert!(fire_next(&mut kernel));
    assert_eq!(
        kernel.pes().switcher_of(PE).map(|c| c.state()),
        Some(SwitchState::StoreDone)
    );

    // the answer arrives before the agent acknowledged the store
    let reqs = service_requests(&kernel, fs);
    answer(&mut kernel, fs, reqs[0].0, Ok(vec![7]));
    let switched = run_until(&mut kernel, 32, |k| {
        current(k, PE) == Some(a) && k.pes().switcher_of(PE).is_some_and(|c| c.is_idle())
    });
    assert!(switched);

    let ready: Vec<_> = kernel.pes().switcher_of(PE).expect("muxed").ready().collect();
    assert_eq!(ready, vec![b]);
    assert_invariants(&kernel);
}
