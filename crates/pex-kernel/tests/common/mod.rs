//! Shared fixtures for the kernel integration tests

#![allow(dead_code)]

use pex_dtu::{Dtu, Label, RECVBUF_SPACE};
use pex_dtu_mock::MockDtu;
use pex_kernel::com::ServiceCmd;
use pex_kernel::kif::{decode_reply, encode_reply};
use pex_kernel::{
    check_all_invariants, BootModule, Code, GateSpec, Isa, Kernel, PeDesc, PeFlags, Platform,
    SwitchConfig, Syscall, SyscallOutcome, VpeId,
};

/// Size of the memory PE
pub const MEM_SIZE: u64 = 64 << 20;
/// Local memory of every compute PE
pub const PE_MEM: u64 = 1 << 20;

/// Receive buffer address used for service gates
pub const SRV_RBUF: u64 = RECVBUF_SPACE + 0x1000;

/// Kernel PE, `muxed` PEs with context switching, one memory PE
pub fn platform(muxed: usize) -> Platform {
    platform_with(&vec![PeFlags::CTXSW; muxed], SwitchConfig::default())
}

pub fn platform_with(flags: &[PeFlags], cfg: SwitchConfig) -> Platform {
    let mut pes = vec![PeDesc::comp(Isa::X86, PE_MEM, PeFlags::empty())];
    pes.extend(flags.iter().map(|f| PeDesc::comp(Isa::X86, PE_MEM, *f)));
    pes.push(PeDesc::memory(MEM_SIZE));
    Platform::new(pes, cfg).expect("valid platform")
}

pub fn boot(platform: Platform) -> Kernel<MockDtu> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dtu = MockDtu::new(platform.pe_count());
    Kernel::new(dtu, platform).expect("kernel boots")
}

/// Start a boot module and let the kernel settle
pub fn start(kernel: &mut Kernel<MockDtu>, module: BootModule) -> VpeId {
    let id = kernel.create_boot_vpe(&module).expect("boot module starts");
    kernel.process();
    id
}

pub fn app(name: &str) -> BootModule {
    BootModule::new(name)
}

pub fn muxable(name: &str) -> BootModule {
    BootModule {
        muxable: true,
        ..BootModule::new(name)
    }
}

pub fn assert_invariants(kernel: &Kernel<MockDtu>) {
    let violations = check_all_invariants(kernel);
    assert!(violations.is_empty(), "invariants violated: {:#?}", violations);
}

/// Issue a syscall that must be answered right away
pub fn call(kernel: &mut Kernel<MockDtu>, vpe: VpeId, sc: Syscall) -> Result<Vec<u64>, Code> {
    match kernel.syscall(vpe, &sc) {
        SyscallOutcome::Replied(res) => res,
        other => panic!("{:?} of VPE {} did not reply: {:?}", sc, vpe, other),
    }
}

pub fn call_ok(kernel: &mut Kernel<MockDtu>, vpe: VpeId, sc: Syscall) -> Vec<u64> {
    let what = format!("{:?}", sc);
    call(kernel, vpe, sc).unwrap_or_else(|e| panic!("{} failed: {}", what, e))
}

/// Fire the earliest timer; false if none is armed
pub fn fire_next(kernel: &mut Kernel<MockDtu>) -> bool {
    let deadline = match kernel.next_deadline() {
        Some(d) => d,
        None => return false,
    };
    let now = kernel.dtu().time();
    kernel.dtu().set_time(deadline.max(now));
    kernel.tick();
    true
}

/// Fire timers until `done` holds or `max` timers fired
pub fn run_until(
    kernel: &mut Kernel<MockDtu>,
    max: usize,
    done: impl Fn(&Kernel<MockDtu>) -> bool,
) -> bool {
    for _ in 0..max {
        if done(kernel) {
            return true;
        }
        if !fire_next(kernel) {
            break;
        }
    }
    done(kernel)
}

/// Current VPE of the switcher of `pe`
pub fn current(kernel: &Kernel<MockDtu>, pe: usize) -> Option<VpeId> {
    kernel.pes().switcher_of(pe).and_then(|c| c.current())
}

/// Most recent reply sent to `vpe`
pub fn last_reply(kernel: &Kernel<MockDtu>, vpe: VpeId) -> Option<Result<Vec<u64>, Code>> {
    kernel
        .dtu()
        .replies()
        .iter()
        .rev()
        .find(|r| r.dst.vpe == vpe)
        .map(|r| decode_reply(&r.data))
}

// ============================================================================
// Services
// ============================================================================

/// Let `vpe` provide the service `name` with a receive gate at selector 2
/// (activated on ep 2) and the service capability at selector 3
pub fn provide_service(kernel: &mut Kernel<MockDtu>, vpe: VpeId, name: &str) {
    call_ok(
        kernel,
        vpe,
        Syscall::CreateGate {
            dst: 2,
            spec: GateSpec::Recv {
                order: 12,
                msg_order: 8,
            },
        },
    );
    call_ok(
        kernel,
        vpe,
        Syscall::Activate {
            vpe: 0,
            gate: 2,
            ep: 2,
            addr: SRV_RBUF,
        },
    );
    call_ok(
        kernel,
        vpe,
        Syscall::CreateSrv {
            dst: 3,
            rgate: 2,
            name: name.to_string(),
        },
    );
}

/// Requests the kernel delivered to `owner` since the last call
pub fn service_requests(kernel: &Kernel<MockDtu>, owner: VpeId) -> Vec<(Label, ServiceCmd)> {
    kernel
        .dtu()
        .take_sent()
        .into_iter()
        .filter(|m| m.dst.vpe == owner)
        .map(|m| (m.reply_label, ServiceCmd::decode(&m.data).expect("valid request")))
        .collect()
}

/// Answer a service request on behalf of `owner`
pub fn answer(kernel: &mut Kernel<MockDtu>, owner: VpeId, label: Label, res: Result<Vec<u64>, Code>) {
    kernel.handle_service_reply(owner, label, &encode_reply(&res));
}

/// Open a session as `client` at `dst` and let `owner` accept it with `ident`
pub fn open_session(
    kernel: &mut Kernel<MockDtu>,
    client: VpeId,
    owner: VpeId,
    name: &str,
    dst: u32,
    ident: u64,
) {
    let out = kernel.syscall(
        client,
        &Syscall::CreateSess {
            dst,
            name: name.to_string(),
            arg: 0,
        },
    );
    assert!(matches!(out, SyscallOutcome::Suspended(_)), "{:?}", out);
    let reqs = service_requests(kernel, owner);
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].1, ServiceCmd::Open { arg: 0 });
    answer(kernel, owner, reqs[0].0, Ok(vec![ident]));
    assert_eq!(last_reply(kernel, client), Some(Ok(vec![])));
}
