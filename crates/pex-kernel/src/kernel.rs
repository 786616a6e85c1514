//! The kernel: all state and the work loop
//!
//! A [`Kernel`] owns every table of the system and is driven from outside by
//! three kinds of input:
//!
//! - [`Kernel::handle_syscall`]: a message arrived on a syscall gate
//! - [`Kernel::handle_service_reply`]: a service answered a kernel request
//! - [`Kernel::tick`]: time advanced; expired timers drive the switchers
//!
//! Each input is handled to completion. Syscalls that cannot finish right
//! away leave a waiter behind, which is resumed by a later input. After
//! every input, [`Kernel::process`] runs the deferred work: tearing down
//! dead VPEs, delivering queued service requests and retrying waiters.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Ref, RefCell};

use pex_audit::{EventId, SysLog};
use pex_dtu::{Dtu, RecvEp, SendEp, VpeDesc, RECVBUF_SPACE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cap::{
    CapHooks, CapId, CapKind, CapTables, CapType, MGateObject, RGateObject, RevokeCtx, TableId,
};
use crate::com::{ServiceCmd, ServiceList};
use crate::error::Code;
use crate::kif::{encode_reply, Syscall};
use crate::mem::{AddrSpace, MainMemory, MemoryModule};
use crate::pes::{EpBinding, PeManager, SwitchError, SwitchEvent, Timeouts, VpeManager};
use crate::platform::{ConfigError, Isa, Platform, KERNEL_PE};
use crate::syscalls::{Flow, Wait, Waiter};
use crate::types::{
    CapRngDesc, CapSel, Label, PeId, Perm, VpeFlags, VpeId, VpeState, INVALID_VPE, PAGE_SIZE,
    SEL_MEM, SEL_VPE, SYSC_CREDITS, SYSC_GATES, SYSC_MSG_ORDER, SYSC_REP, SYSC_SEP,
    SYSC_SLOTS_PER_GATE,
};

/// Exit code reported for VPEs that were stopped instead of exiting
pub const STOPPED_EXIT_CODE: i32 = -1;

/// Errors while bringing the kernel up
#[derive(Debug, Error)]
pub enum BootError {
    #[error("invalid platform: {0}")]
    Config(#[from] ConfigError),
    #[error("boot failed: {0}")]
    Kernel(#[from] Code),
}

/// A program the kernel starts by itself
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootModule {
    pub name: String,
    #[serde(default)]
    pub isa: Option<Isa>,
    #[serde(default)]
    pub muxable: bool,
    /// Provides services only; does not keep the system alive
    #[serde(default)]
    pub daemon: bool,
    /// Services that must exist before the module is started
    #[serde(default)]
    pub requires: Vec<String>,
}

impl BootModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            isa: None,
            muxable: false,
            daemon: false,
            requires: Vec::new(),
        }
    }
}

/// What happened to a syscall
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Answered right away
    Replied(Result<Vec<u64>, Code>),
    /// The reply follows once the request with this id can be completed
    Suspended(EventId),
    /// No reply (exit, or the sender is gone)
    NoReply,
}

// ============================================================================
// Revocation side effects
// ============================================================================

/// Kind-specific side effects of capability operations
pub(crate) struct KernelHooks<'a, D: Dtu> {
    pub dtu: &'a D,
    pub vpes: &'a mut VpeManager,
    /// VPEs whose last reference went away
    pub dead: &'a mut Vec<VpeId>,
}

impl<D: Dtu> KernelHooks<'_, D> {
    /// Invalidate the endpoint a gate capability is activated on
    fn deactivate(&mut self, id: CapId, kind: &mut CapKind) {
        let act = match kind.activation() {
            Some(a) => a,
            None => return,
        };
        kind.set_activation(None);
        if let CapKind::RecvGate { obj, .. } = kind {
            obj.borrow_mut().loc = None;
        }
        let vpe = match self.vpes.get_mut(act.vpe) {
            Some(v) => v,
            None => return,
        };
        if vpe.binding(act.ep) == Some(EpBinding::Gate(id)) {
            if let Err(e) = vpe.invalidate_ep(self.dtu, act.ep) {
                log::warn!(
                    target: "caps",
                    "VPE {}: invalidating ep{} failed: {}",
                    act.vpe,
                    act.ep,
                    e
                );
            }
        }
    }
}

impl<D: Dtu> CapHooks for KernelHooks<'_, D> {
    fn on_obtain(&mut self, table: TableId, kind: &CapKind) {
        if let CapKind::Vpe(id) = kind {
            if table.vpe() != Some(*id) {
                if let Some(vpe) = self.vpes.get_mut(*id) {
                    vpe.add_ref();
                }
            }
        }
    }

    fn on_revoke(&mut self, ctx: &RevokeCtx, kind: &mut CapKind) -> Result<(), Code> {
        match kind {
            CapKind::SendGate { .. } | CapKind::RecvGate { .. } | CapKind::MemGate { .. } => {
                self.deactivate(ctx.id, kind);
                Ok(())
            }
            CapKind::Vpe(id) => {
                let id = *id;
                if ctx.table.vpe() != Some(id) {
                    if let Some(vpe) = self.vpes.get_mut(id) {
                        if vpe.drop_ref() {
                            self.dead.push(id);
                        }
                    }
                }
                Ok(())
            }
            CapKind::Map { .. } => {
                if let TableId::Map(owner) = ctx.table {
                    let virt = ctx.sel as u64 * PAGE_SIZE;
                    let aspace = self.vpes.get_mut(owner).and_then(|v| v.addr_space_mut());
                    if let Some(aspace) = aspace {
                        aspace.unmap_pages(self.dtu, virt, ctx.length as u64)?;
                    }
                }
                Ok(())
            }
            CapKind::Service(srv) => {
                let mut srv = srv.borrow_mut();
                if srv.pending() > 0 || (ctx.has_child && !srv.closing()) {
                    log::debug!(
                        target: "services",
                        "Service '{}' busy ({} pending); revoking sessions first",
                        srv.name(),
                        srv.pending()
                    );
                    srv.set_closing();
                    return Err(Code::Pending);
                }
                Ok(())
            }
            CapKind::Session(_) => Ok(()),
        }
    }
}

// ============================================================================
// Kernel
// ============================================================================

pub struct Kernel<D: Dtu> {
    pub(crate) dtu: D,
    pub(crate) platform: Platform,
    pub(crate) caps: CapTables,
    pub(crate) vpes: VpeManager,
    pub(crate) pes: PeManager,
    pub(crate) services: ServiceList,
    pub(crate) mem: Rc<RefCell<MainMemory>>,
    pub(crate) timeouts: Timeouts,
    pub(crate) syslog: SysLog,
    /// Syscalls waiting for something to happen
    pub(crate) waits: Vec<Waiter>,
    /// VPEs to tear down
    pub(crate) dead: Vec<VpeId>,
    /// Shutdown requests have been sent to all services
    pub(crate) shutdown: bool,
}

impl<D: Dtu> Kernel<D> {
    /// Bring the kernel up on `platform`
    ///
    /// Drops the privileges of all other PEs, registers main memory, sets up
    /// the syscall gates and starts the idle VPE of every multiplexed PE.
    pub fn new(dtu: D, platform: Platform) -> Result<Self, BootError> {
        platform.validate()?;

        let mut mem = MainMemory::new();
        for (pe, desc) in platform.memory_pes() {
            mem.add(MemoryModule::new(pe, desc.mem_size));
        }

        let mut pes = PeManager::new(&platform);
        pes.deprivilege(&dtu).map_err(Code::from)?;

        let kdesc = VpeDesc::pe_only(KERNEL_PE);
        let gate_size = (SYSC_SLOTS_PER_GATE as u64) << SYSC_MSG_ORDER;
        let gate_order = gate_size.trailing_zeros();
        for gate in 0..SYSC_GATES {
            let rep = RecvEp {
                buf: RECVBUF_SPACE + gate as u64 * gate_size,
                order: gate_order,
                msg_order: SYSC_MSG_ORDER,
            };
            dtu.config_recv(kdesc, gate, &rep).map_err(Code::from)?;
        }

        let mut caps = CapTables::new();
        caps.create_table(TableId::Kernel);

        let mut vpes = VpeManager::new();
        let mut timeouts = Timeouts::new();
        pes.init_idle(&dtu, &mut vpes, &mut timeouts)?;

        log::info!(
            target: "pes",
            "Kernel up: {} PEs, {} KiB main memory",
            platform.pe_count(),
            mem.size() / 1024
        );

        Ok(Self {
            dtu,
            platform,
            caps,
            vpes,
            pes,
            services: ServiceList::new(),
            mem: Rc::new(RefCell::new(mem)),
            timeouts,
            syslog: SysLog::new(),
            waits: Vec::new(),
            dead: Vec::new(),
            shutdown: false,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn dtu(&self) -> &D {
        &self.dtu
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn caps(&self) -> &CapTables {
        &self.caps
    }

    pub fn vpes(&self) -> &VpeManager {
        &self.vpes
    }

    pub fn pes(&self) -> &PeManager {
        &self.pes
    }

    pub fn services(&self) -> &ServiceList {
        &self.services
    }

    pub fn memory(&self) -> Ref<'_, MainMemory> {
        self.mem.borrow()
    }

    pub fn syslog(&self) -> &SysLog {
        &self.syslog
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Syscalls that have not been answered yet
    pub fn waiting(&self) -> usize {
        self.waits.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown
    }

    /// Earliest armed timer
    pub fn next_deadline(&self) -> Option<u64> {
        self.timeouts.next_deadline()
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    /// Start a boot module, or park it until its required services exist
    pub fn create_boot_vpe(&mut self, module: &BootModule) -> Result<VpeId, Code> {
        let isa = module.isa.unwrap_or_else(|| self.default_isa());
        let pe = self.pes.find_pe(&self.vpes, isa, module.muxable, None)?;

        let mut flags = VpeFlags::BOOTMOD;
        if module.muxable {
            flags |= VpeFlags::MUXABLE;
        }
        if module.daemon {
            flags |= VpeFlags::DAEMON;
        }
        let id = self.create_vpe(&module.name, pe, flags)?;
        if let Some(vpe) = self.vpes.get_mut(id) {
            for req in &module.requires {
                vpe.add_requirement(req);
            }
        }

        let services = &self.services;
        let ready = module.requires.iter().all(|r| services.find(r).is_some());
        if ready {
            self.start_app(id)?;
        } else {
            log::info!(
                target: "vpes",
                "VPE {} '{}' waits for services {:?}",
                id,
                module.name,
                module.requires
            );
            self.vpes.add_pending(id);
        }
        Ok(id)
    }

    /// A syscall message from `vpe` arrived
    pub fn handle_syscall(&mut self, vpe: VpeId, msg: &[u8]) -> SyscallOutcome {
        let alive = self
            .vpes
            .get(vpe)
            .is_some_and(|v| v.state() != VpeState::Dead);
        if !alive {
            log::warn!(target: "syscalls", "Dropping syscall of dead or unknown VPE {}", vpe);
            return SyscallOutcome::NoReply;
        }

        let (opcode, args) = Syscall::audit_words(msg);
        let now = self.dtu.time();
        let req = self.syslog.log_request(vpe, opcode, args, now);

        let outcome = match Syscall::decode(msg) {
            Ok(call) => {
                log::debug!(target: "syscalls", "VPE {}: {:?}", vpe, call);
                let res = self.dispatch(vpe, call);
                self.complete(vpe, req, res)
            }
            Err(e) => {
                log::warn!(target: "syscalls", "VPE {}: malformed syscall ({})", vpe, e);
                self.reply(vpe, req, Err(e));
                SyscallOutcome::Replied(Err(e))
            }
        };
        self.process();
        outcome
    }

    /// Encode `call` and handle it as if `vpe` had sent it
    pub fn syscall(&mut self, vpe: VpeId, call: &Syscall) -> SyscallOutcome {
        self.handle_syscall(vpe, &call.encode())
    }

    /// A service answered the request carrying `label`
    pub fn handle_service_reply(&mut self, from: VpeId, label: Label, data: &[u8]) {
        self.service_reply(from, label, data);
        self.process();
    }

    /// Fire all expired timers
    pub fn tick(&mut self) {
        let now = self.dtu.time();
        for (id, ev) in self.timeouts.pop_due(now) {
            let res = self
                .pes
                .on_timer(&self.dtu, &mut self.vpes, &mut self.timeouts, id, ev);
            self.sched_result(res);
        }
        self.process();
    }

    // ========================================================================
    // Replies
    // ========================================================================

    /// Turn the result of a handler into a reply or a waiter
    pub(crate) fn complete(
        &mut self,
        vpe: VpeId,
        req: EventId,
        res: Result<Flow, Code>,
    ) -> SyscallOutcome {
        match res {
            Ok(Flow::Reply(vals)) => {
                self.reply(vpe, req, Ok(vals.clone()));
                SyscallOutcome::Replied(Ok(vals))
            }
            Ok(Flow::Wait(wait)) => {
                log::debug!(target: "syscalls", "VPE {}: request {} waits for {:?}", vpe, req, wait);
                self.waits.push(Waiter { vpe, req, wait });
                SyscallOutcome::Suspended(req)
            }
            Ok(Flow::NoReply) => {
                let now = self.dtu.time();
                self.syslog.log_response(vpe, req, 0, now);
                SyscallOutcome::NoReply
            }
            Err(e) => {
                log::warn!(target: "syscalls", "VPE {}: request {} failed: {}", vpe, req, e);
                self.reply(vpe, req, Err(e));
                SyscallOutcome::Replied(Err(e))
            }
        }
    }

    /// Send the reply to request `req` of `vpe`
    pub(crate) fn reply(&mut self, vpe: VpeId, req: EventId, res: Result<Vec<u64>, Code>) {
        let now = self.dtu.time();
        let code = match &res {
            Ok(_) => 0,
            Err(e) => *e as i64,
        };
        self.syslog.log_response(vpe, req, code, now);

        let pe = match self.vpes.get(vpe) {
            Some(v) => v.pe(),
            None => return,
        };
        let msg = encode_reply(&res);
        if let Err(e) = self.dtu.reply(VpeDesc::new(pe, vpe), vpe as Label, &msg) {
            log::warn!(target: "syscalls", "Reply to VPE {} failed: {}", vpe, e);
            return;
        }
        // a VPE that blocked on the reply may have been switched out
        let res = self
            .pes
            .unblock_vpe(&self.dtu, &mut self.vpes, &mut self.timeouts, vpe);
        self.sched_result(res);
    }

    // ========================================================================
    // Capability helpers
    // ========================================================================

    pub(crate) fn revoke_range(
        &mut self,
        table: TableId,
        crd: CapRngDesc,
        own: bool,
    ) -> Result<(), (CapSel, Code)> {
        let Self {
            dtu,
            caps,
            vpes,
            dead,
            ..
        } = self;
        let mut hooks = KernelHooks {
            dtu: &*dtu,
            vpes,
            dead,
        };
        caps.revoke_range(table, crd, own, &mut hooks)
    }

    pub(crate) fn obtain(&mut self, dst: TableId, dst_sel: CapSel, src: CapId) -> Result<CapId, Code> {
        let Self {
            dtu,
            caps,
            vpes,
            dead,
            ..
        } = self;
        let mut hooks = KernelHooks {
            dtu: &*dtu,
            vpes,
            dead,
        };
        caps.obtain(dst, dst_sel, src, &mut hooks)
    }

    fn revoke_all(&mut self, table: TableId) {
        let Self {
            dtu,
            caps,
            vpes,
            dead,
            ..
        } = self;
        let mut hooks = KernelHooks {
            dtu: &*dtu,
            vpes,
            dead,
        };
        caps.revoke_all(table, &mut hooks);
    }

    /// Invalidate the endpoint `id` is activated on, if any
    pub(crate) fn deactivate(&mut self, id: CapId) {
        let Self {
            dtu,
            caps,
            vpes,
            dead,
            ..
        } = self;
        let mut hooks = KernelHooks {
            dtu: &*dtu,
            vpes,
            dead,
        };
        hooks.deactivate(id, &mut caps.cap_mut(id).kind);
    }

    /// The VPE behind the VPE capability `sel` of `caller`
    pub(crate) fn vpe_from_sel(&self, caller: VpeId, sel: CapSel) -> Result<VpeId, Code> {
        let id = self
            .caps
            .get_typed(TableId::Obj(caller), sel, CapType::VIRTPE)?;
        match &self.caps.cap(id).kind {
            CapKind::Vpe(v) if self.vpes.contains(*v) => Ok(*v),
            _ => Err(Code::Gone),
        }
    }

    fn default_isa(&self) -> Isa {
        self.platform
            .user_pes()
            .map(|(_, d)| d.isa)
            .next()
            .unwrap_or(Isa::None)
    }

    // ========================================================================
    // VPE lifecycle
    // ========================================================================

    /// Create a VPE on `pe` with its tables, own capabilities, address
    /// space and syscall endpoints
    pub(crate) fn create_vpe(
        &mut self,
        name: &str,
        pe: usize,
        flags: VpeFlags,
    ) -> Result<VpeId, Code> {
        let id = self.vpes.create(name, pe, flags | VpeFlags::INIT)?;
        if let Err(e) = self.init_vpe(id, pe) {
            log::warn!(target: "vpes", "Setting up VPE {} '{}' failed: {}", id, name, e);
            self.destroy_vpe(id);
            return Err(e);
        }
        Ok(id)
    }

    fn init_vpe(&mut self, id: VpeId, pe: usize) -> Result<(), Code> {
        let desc = *self.pes.desc(pe).ok_or(Code::InvArgs)?;

        self.caps.create_table(TableId::Obj(id));
        self.caps.create_table(TableId::Map(id));
        self.caps.insert(TableId::Obj(id), SEL_VPE, 1, CapKind::Vpe(id))?;
        let local = MGateObject::new(pe, id, 0, desc.mem_size, Perm::RWX);
        self.caps.insert(
            TableId::Obj(id),
            SEL_MEM,
            1,
            CapKind::MemGate {
                obj: Rc::new(local),
                act: None,
            },
        )?;

        if desc.has_vm() {
            let aspace = AddrSpace::new(&self.dtu, &mut self.mem.borrow_mut(), VpeDesc::new(pe, id))?;
            if let Some(vpe) = self.vpes.get_mut(id) {
                vpe.set_addr_space(aspace);
            }
        }

        let slot = self.vpes.alloc_sysc_slot(id)?;
        let vpe = self.vpes.get_mut(id).ok_or(Code::NotFound)?;
        let sep = SendEp {
            dst_pe: KERNEL_PE,
            dst_ep: slot / SYSC_SLOTS_PER_GATE,
            dst_vpe: INVALID_VPE,
            label: id as Label,
            msg_order: SYSC_MSG_ORDER,
            credits: SYSC_CREDITS,
        };
        vpe.config_snd_ep(&self.dtu, SYSC_SEP, sep)?;
        vpe.bind(SYSC_SEP, EpBinding::Raw);
        vpe.config_rcv_ep(&self.dtu, SYSC_REP, RECVBUF_SPACE, SYSC_MSG_ORDER, SYSC_MSG_ORDER)?;
        vpe.bind(SYSC_REP, EpBinding::Raw);

        self.pes.assign(&self.dtu, &mut self.vpes, id)
    }

    /// Let the application of `id` run
    pub(crate) fn start_app(&mut self, id: VpeId) -> Result<(), Code> {
        let vpe = self.vpes.get_mut(id).ok_or(Code::NotFound)?;
        if vpe.state() == VpeState::Dead {
            return Err(Code::Gone);
        }
        if vpe.has(VpeFlags::HASAPP) {
            return Err(Code::Exists);
        }
        vpe.set_flags(VpeFlags::HASAPP);
        vpe.add_ref();
        log::info!(target: "vpes", "Starting VPE {} '{}' on PE {}", id, vpe.name(), vpe.pe());
        let res = self
            .pes
            .start_vpe(&self.dtu, &mut self.vpes, &mut self.timeouts, id);
        self.sched_result(res);
        Ok(())
    }

    /// End the application of `id`; the VPE is dead from now on
    pub(crate) fn stop_app(&mut self, id: VpeId, code: i32) {
        let vpe = match self.vpes.get_mut(id) {
            Some(v) if v.state() != VpeState::Dead => v,
            _ => return,
        };
        log::info!(target: "vpes", "VPE {} '{}' exits with {}", id, vpe.name(), code);
        vpe.set_exit_code(code);
        vpe.set_state(VpeState::Dead);
        if vpe.has(VpeFlags::HASAPP) {
            vpe.drop_ref();
        }
        let res = self
            .pes
            .stop_vpe(&self.dtu, &mut self.vpes, &mut self.timeouts, id);
        self.sched_result(res);
        if self.vpes.get(id).is_some_and(|v| v.refs() == 0) {
            self.dead.push(id);
        }
    }

    /// Tear `id` down for good
    pub(crate) fn destroy_vpe(&mut self, id: VpeId) {
        let (name, exit) = match self.vpes.get(id) {
            Some(v) => (String::from(v.name()), v.exit_code()),
            None => return,
        };
        log::info!(target: "vpes", "Destroying VPE {} '{}'", id, name);

        let res = self
            .pes
            .remove_vpe(&self.dtu, &mut self.vpes, &mut self.timeouts, id);
        self.sched_result(res);
        if let Some(vpe) = self.vpes.get_mut(id) {
            vpe.set_state(VpeState::Dead);
        }

        for srv in self.services.owned_by(id) {
            let sid = srv.borrow().id();
            srv.borrow_mut().set_owner_dead();
            self.fail_service_waiters(sid);
        }

        self.revoke_all(TableId::Map(id));
        self.revoke_all(TableId::Obj(id));
        for table in [TableId::Map(id), TableId::Obj(id)] {
            if !self.caps.remove_table(table) {
                log::warn!(target: "caps", "VPE {}: {:?} still holds capabilities", id, table);
            }
        }

        let aspace = self.vpes.get_mut(id).and_then(|v| v.take_addr_space());
        if let Some(aspace) = aspace {
            if let Err(e) = aspace.destroy(&self.dtu, &mut self.mem.borrow_mut()) {
                log::warn!(target: "mem", "VPE {}: freeing page tables failed: {}", id, e);
            }
        }
        self.vpes.remove(id);

        // waiters on this VPE and its own unanswered syscalls
        let now = self.dtu.time();
        for w in core::mem::take(&mut self.waits) {
            if w.vpe == id {
                self.syslog.log_response(id, w.req, Code::Gone as i64, now);
                continue;
            }
            match w.wait {
                Wait::Exit(target) if target == id => {
                    let res = exit.map(|c| alloc::vec![c as i64 as u64]).ok_or(Code::Gone);
                    self.reply(w.vpe, w.req, res);
                }
                _ => self.waits.push(w),
            }
        }
    }

    /// A PE's switching agent stopped answering; its VPEs are lost
    fn pe_failed(&mut self, pe: usize) {
        let lost: Vec<VpeId> = self
            .vpes
            .iter()
            .filter(|v| v.pe() == pe && !v.has(VpeFlags::IDLE))
            .map(|v| v.id())
            .collect();
        log::error!(target: "pes", "PE {} failed; killing VPEs {:?}", pe, lost);
        for id in lost {
            if let Some(vpe) = self.vpes.get_mut(id) {
                vpe.set_state(VpeState::Dead);
                vpe.clear_flags(VpeFlags::HASAPP | VpeFlags::READY);
            }
            self.dead.push(id);
        }
    }

    /// Log scheduling failures; a VPE in a bad state is a kernel bug
    pub(crate) fn sched_result<R>(&self, res: Result<R, SwitchError>) {
        match res {
            Ok(_) => {}
            Err(SwitchError::InvalidState(s)) => {
                panic!("context switch step invoked in unreachable state {:?}", s)
            }
            // the PE has been disabled; its Failed event does the rest
            Err(e) => log::error!(target: "pes", "Scheduling failed: {}", e),
        }
    }

    // ========================================================================
    // Work loop
    // ========================================================================

    /// Run deferred work until nothing changes anymore
    pub fn process(&mut self) {
        loop {
            for ev in self.pes.take_events() {
                match ev {
                    SwitchEvent::Failed(pe) => self.pe_failed(pe),
                    SwitchEvent::Resumed(vpe) => {
                        log::trace!(target: "pes", "VPE {} resumed", vpe);
                    }
                    SwitchEvent::Migrate { .. } => {}
                }
            }

            let mut progress = self.reap();
            self.pump_services();
            progress |= self.retry_waiters();
            self.check_shutdown();
            if !progress {
                break;
            }
        }
    }

    /// Destroy dead VPEs whose PE is not in the middle of a switch
    fn reap(&mut self) -> bool {
        let mut progress = false;
        for id in core::mem::take(&mut self.dead) {
            let pe = match self.vpes.get(id) {
                Some(v) => v.pe(),
                None => continue,
            };
            if self.pes.can_remove(pe, id) {
                self.destroy_vpe(id);
                progress = true;
            } else {
                log::debug!(target: "vpes", "Deferring teardown of VPE {} until PE {} is idle", id, pe);
                if !self.dead.contains(&id) {
                    self.dead.push(id);
                }
            }
        }
        progress
    }

    /// Deliver queued service requests to owners that can receive them
    fn pump_services(&mut self) {
        for srv in self.services.live() {
            let (owner, sid) = {
                let s = srv.borrow();
                if !s.owner_alive() || !s.has_queued() {
                    continue;
                }
                (s.owner(), s.id())
            };
            let loc = srv.borrow().rgate().borrow().loc;
            let target = match self.vpes.get(owner) {
                Some(v) if v.state() == VpeState::Dead => continue,
                Some(v) => match loc {
                    Some((rv, ep, _))
                        if rv == owner && v.is_resident() && v.state() == VpeState::Running =>
                    {
                        Some((v.pe(), ep))
                    }
                    _ => None,
                },
                None => continue,
            };
            let (pe, ep) = match target {
                Some(t) => t,
                None => {
                    // delivered once the owner runs
                    let res = self
                        .pes
                        .unblock_vpe(&self.dtu, &mut self.vpes, &mut self.timeouts, owner);
                    self.sched_result(res);
                    continue;
                }
            };

            let desc = VpeDesc::new(pe, owner);
            loop {
                let msg = match srv.borrow_mut().queue_mut().pop_sendable() {
                    Some(m) => m,
                    None => break,
                };
                match self.dtu.send_to(desc, ep, sid as Label, msg.label, &msg.data) {
                    Ok(()) => {
                        log::trace!(target: "services", "Sent {:#x} to service {}", msg.label, sid);
                    }
                    Err(e) => {
                        log::warn!(target: "services", "Delivery to service {} failed: {}", sid, e);
                        srv.borrow_mut().queue_mut().requeue(msg);
                        break;
                    }
                }
            }
        }
    }

    /// Resume waiters whose condition holds now
    fn retry_waiters(&mut self) -> bool {
        let mut progress = false;
        for w in core::mem::take(&mut self.waits) {
            let Waiter { vpe, req, wait } = w;
            match wait {
                Wait::Exit(target) => match self.vpes.get(target) {
                    Some(t) if t.state() == VpeState::Dead => {
                        let code = t.exit_code().unwrap_or(STOPPED_EXIT_CODE);
                        self.reply(vpe, req, Ok(alloc::vec![code as i64 as u64]));
                        progress = true;
                    }
                    Some(_) => self.waits.push(Waiter { vpe, req, wait }),
                    None => {
                        self.reply(vpe, req, Err(Code::Gone));
                        progress = true;
                    }
                },
                Wait::Revoke(call) => match self.dispatch(vpe, call) {
                    Ok(Flow::Wait(wait)) => self.waits.push(Waiter { vpe, req, wait }),
                    res => {
                        self.complete(vpe, req, res);
                        progress = true;
                    }
                },
                Wait::Activate { rgate, call } => {
                    match rgate.upgrade().map(|r| r.borrow().activated()) {
                        None => {
                            self.reply(vpe, req, Err(Code::Gone));
                            progress = true;
                        }
                        Some(true) => {
                            let res = self.dispatch(vpe, call);
                            self.complete(vpe, req, res);
                            progress = true;
                        }
                        Some(false) => self.waits.push(Waiter {
                            vpe,
                            req,
                            wait: Wait::Activate { rgate, call },
                        }),
                    }
                }
                Wait::Resume { target, call } => match self.running_on(target) {
                    Ok(Some(_)) => {
                        let res = self.dispatch(vpe, call);
                        self.complete(vpe, req, res);
                        progress = true;
                    }
                    Ok(None) => self.waits.push(Waiter {
                        vpe,
                        req,
                        wait: Wait::Resume { target, call },
                    }),
                    Err(e) => {
                        self.reply(vpe, req, Err(e));
                        progress = true;
                    }
                },
                wait @ Wait::Service { .. } => self.waits.push(Waiter { vpe, req, wait }),
            }
        }
        progress
    }

    /// Once only daemons are left, ask every service to shut down
    fn check_shutdown(&mut self) {
        if self.shutdown || self.vpes.daemons() == 0 || self.vpes.used() != self.vpes.daemons() {
            return;
        }
        self.shutdown = true;
        log::info!(target: "services", "Only daemons left; shutting services down");
        for srv in self.services.live() {
            if srv.borrow().owner_alive() {
                srv.borrow_mut().send(ServiceCmd::Shutdown.encode());
            }
        }
        self.pump_services();
    }

    /// Answer every waiter of a service request to `sid` with `GONE`
    pub(crate) fn fail_service_waiters(&mut self, sid: u32) {
        for w in core::mem::take(&mut self.waits) {
            match &w.wait {
                Wait::Service { label, .. } if crate::com::label_service(*label) == sid => {
                    self.reply(w.vpe, w.req, Err(Code::Gone));
                }
                _ => self.waits.push(w),
            }
        }
    }

    /// PE of `id` if it runs with its endpoints loaded, `None` while it is
    /// switched out or not started
    pub(crate) fn running_on(&self, id: VpeId) -> Result<Option<PeId>, Code> {
        let vpe = self.vpes.get(id).ok_or(Code::Gone)?;
        match vpe.state() {
            VpeState::Dead => Err(Code::Gone),
            VpeState::Running if vpe.is_resident() => Ok(Some(vpe.pe())),
            _ => Ok(None),
        }
    }

    /// Gate capability of `table` that is a receive gate, as its object
    pub(crate) fn rgate_of(&self, table: TableId, sel: CapSel) -> Result<(CapId, Rc<RefCell<RGateObject>>), Code> {
        let id = self.caps.get_typed(table, sel, CapType::RGATE)?;
        match &self.caps.cap(id).kind {
            CapKind::RecvGate { obj, .. } => Ok((id, obj.clone())),
            _ => Err(Code::InvArgs),
        }
    }
}
