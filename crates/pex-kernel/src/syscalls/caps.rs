//! Gates, memory, mappings, endpoints and revocation

use alloc::rc::Rc;
use core::cell::RefCell;

use pex_dtu::{Dtu, PteFlags, SendEp};

use super::{Flow, Wait};
use crate::cap::{Activation, CapKind, CapType, MGateObject, RGateObject, SGateObject, TableId};
use crate::error::Code;
use crate::kernel::Kernel;
use crate::kif::{GateSpec, RangeKind, Syscall};
use crate::pes::EpBinding;
use crate::types::{
    glob_addr, glob_split, CapRngDesc, CapSel, EpId, Perm, VpeId, EP_COUNT, FIRST_FREE_EP,
    FIRST_FREE_SEL, INVALID_SEL, MAX_RBUF_ORDER, PAGE_SIZE,
};

/// What an endpoint is configured as by `activate`
enum EpConfig {
    Invalidate,
    Mem(Rc<MGateObject>),
    Send(SendEp),
    Recv(Rc<RefCell<RGateObject>>),
}

impl<D: Dtu> Kernel<D> {
    // ========================================================================
    // Gates and memory
    // ========================================================================

    pub(super) fn handle_creategate(
        &mut self,
        caller: VpeId,
        dst: CapSel,
        spec: GateSpec,
    ) -> Result<Flow, Code> {
        let table = TableId::Obj(caller);
        match spec {
            GateSpec::Recv { order, msg_order } => {
                if order > MAX_RBUF_ORDER || msg_order > order {
                    return Err(Code::InvArgs);
                }
                let obj = Rc::new(RefCell::new(RGateObject::new(order, msg_order)));
                self.caps
                    .insert(table, dst, 1, CapKind::RecvGate { obj, act: None })?;
            }
            GateSpec::Send {
                rgate,
                label,
                credits,
            } => {
                let (rid, robj) = self.rgate_of(table, rgate)?;
                let obj = Rc::new(SGateObject {
                    rgate: robj,
                    label,
                    credits,
                });
                let id = self
                    .caps
                    .insert(table, dst, 1, CapKind::SendGate { obj, act: None })?;
                self.caps.inherit(rid, id);
            }
        }
        Ok(Flow::done())
    }

    /// Allocate main memory, optionally at a fixed global address
    pub(super) fn handle_reqmem(
        &mut self,
        caller: VpeId,
        dst: CapSel,
        addr: Option<u64>,
        size: u64,
        perms: Perm,
    ) -> Result<Flow, Code> {
        if size == 0 || size % PAGE_SIZE != 0 || perms.is_empty() || !Perm::RWX.contains(perms) {
            return Err(Code::InvArgs);
        }
        let table = TableId::Obj(caller);
        if self.caps.range_used(table, dst, 1) {
            return Err(Code::Exists);
        }

        let alloc = match addr {
            Some(a) => {
                if a % PAGE_SIZE != 0 {
                    return Err(Code::InvArgs);
                }
                let (pe, off) = glob_split(a);
                self.mem.borrow_mut().allocate_at(pe, off, size)
            }
            None => self.mem.borrow_mut().allocate(size, PAGE_SIZE),
        };
        let alloc = alloc.ok_or(Code::OutOfMem)?;
        log::debug!(
            target: "mem",
            "VPE {}: {:#x} bytes @ {}:{:#x} ({:?})",
            caller,
            alloc.size,
            alloc.pe,
            alloc.addr,
            perms
        );

        let obj = Rc::new(MGateObject::allocated(alloc, perms, self.mem.clone()));
        self.caps
            .insert(table, dst, 1, CapKind::MemGate { obj, act: None })?;
        Ok(Flow::done())
    }

    /// Derive a sub-range of a memory capability with at most its permissions
    pub(super) fn handle_derivemem(
        &mut self,
        caller: VpeId,
        src: CapSel,
        dst: CapSel,
        offset: u64,
        size: u64,
        perms: Perm,
    ) -> Result<Flow, Code> {
        let table = TableId::Obj(caller);
        let src_id = self.caps.get_typed(table, src, CapType::MGATE)?;
        let parent = match &self.caps.cap(src_id).kind {
            CapKind::MemGate { obj, .. } => obj.clone(),
            _ => return Err(Code::InvArgs),
        };
        let end = offset.checked_add(size).ok_or(Code::InvArgs)?;
        if size == 0 || end > parent.size {
            return Err(Code::InvArgs);
        }
        if !parent.perms.contains(perms) {
            return Err(Code::NoPerm);
        }

        let obj = Rc::new(parent.derive(offset, size, perms));
        let id = self
            .caps
            .insert(table, dst, 1, CapKind::MemGate { obj, act: None })?;
        self.caps.inherit(src_id, id);
        Ok(Flow::done())
    }

    /// Map `pages` pages of a memory capability, starting at page `first`,
    /// at virtual page `dst` of a VPE
    #[allow(clippy::too_many_arguments)]
    pub(super) fn handle_createmap(
        &mut self,
        caller: VpeId,
        dst: CapSel,
        vsel: CapSel,
        mgate: CapSel,
        first: u64,
        pages: u32,
        perms: Perm,
    ) -> Result<Flow, Code> {
        let target = self.vpe_from_sel(caller, vsel)?;
        let mgate_id = self
            .caps
            .get_typed(TableId::Obj(caller), mgate, CapType::MGATE)?;
        let obj = match &self.caps.cap(mgate_id).kind {
            CapKind::MemGate { obj, .. } => obj.clone(),
            _ => return Err(Code::InvArgs),
        };

        let end = first
            .checked_add(pages as u64)
            .and_then(|p| p.checked_mul(PAGE_SIZE))
            .ok_or(Code::InvArgs)?;
        if pages == 0 || end > obj.size || dst.checked_add(pages).is_none() {
            return Err(Code::InvArgs);
        }
        if !obj.perms.contains(perms) {
            return Err(Code::NoPerm);
        }
        let table = TableId::Map(target);
        if self.caps.range_used(table, dst, pages) {
            return Err(Code::Exists);
        }

        let phys = glob_addr(obj.pe, obj.addr + first * PAGE_SIZE);
        let flags = PteFlags::from(perms);
        {
            let Self { dtu, vpes, mem, .. } = self;
            let aspace = vpes
                .get_mut(target)
                .ok_or(Code::Gone)?
                .addr_space_mut()
                .ok_or(Code::NotSup)?;
            aspace.map_pages(
                &*dtu,
                &mut mem.borrow_mut(),
                dst as u64 * PAGE_SIZE,
                phys,
                pages as u64,
                flags,
            )?;
        }

        let id = self
            .caps
            .insert(table, dst, pages, CapKind::Map { phys, flags })?;
        self.caps.inherit(mgate_id, id);
        Ok(Flow::done())
    }

    // ========================================================================
    // Endpoints
    // ========================================================================

    /// Bind a gate capability of the target VPE to one of its endpoints, or
    /// clear the endpoint if `gate` is `INVALID_SEL`
    pub(super) fn handle_activate(
        &mut self,
        caller: VpeId,
        vsel: CapSel,
        gate: CapSel,
        ep: EpId,
        addr: u64,
    ) -> Result<Flow, Code> {
        let target = self.vpe_from_sel(caller, vsel)?;
        if !(FIRST_FREE_EP..EP_COUNT).contains(&ep) {
            return Err(Code::InvArgs);
        }
        let binding = self
            .vpes
            .get(target)
            .and_then(|v| v.binding(ep))
            .ok_or(Code::InvArgs)?;
        if binding == EpBinding::Raw {
            return Err(Code::Exists);
        }

        let gate_id = match gate {
            INVALID_SEL => None,
            sel => Some(
                self.caps
                    .get_typed(TableId::Obj(target), sel, CapType::GATE)?,
            ),
        };
        let config = match gate_id.map(|id| &self.caps.cap(id).kind) {
            None => EpConfig::Invalidate,
            Some(CapKind::MemGate { obj, .. }) => EpConfig::Mem(obj.clone()),
            Some(CapKind::SendGate { obj, .. }) => {
                let rgate = obj.rgate.borrow();
                let (rvpe, rep, _) = match rgate.loc {
                    Some(loc) => loc,
                    None => {
                        log::debug!(
                            target: "syscalls",
                            "VPE {}: send gate waits for its receive gate",
                            caller
                        );
                        return Ok(Flow::Wait(Wait::Activate {
                            rgate: Rc::downgrade(&obj.rgate),
                            call: Syscall::Activate {
                                vpe: vsel,
                                gate,
                                ep,
                                addr,
                            },
                        }));
                    }
                };
                let dst_pe = self.vpes.get(rvpe).ok_or(Code::Gone)?.pe();
                EpConfig::Send(SendEp {
                    dst_pe,
                    dst_ep: rep,
                    dst_vpe: rvpe,
                    label: obj.label,
                    msg_order: rgate.msg_order,
                    credits: obj.credits,
                })
            }
            Some(CapKind::RecvGate { obj, act }) => {
                // another copy of the gate already receives
                if obj.borrow().activated() && act.is_none() {
                    return Err(Code::Exists);
                }
                EpConfig::Recv(obj.clone())
            }
            Some(_) => return Err(Code::InvArgs),
        };

        if let EpBinding::Gate(old) = binding {
            if Some(old) != gate_id {
                self.deactivate(old);
            }
        }
        if let Some(id) = gate_id {
            self.deactivate(id);
        }

        let vpe = self.vpes.get_mut(target).ok_or(Code::Gone)?;
        vpe.invalidate_ep(&self.dtu, ep)?;
        match &config {
            EpConfig::Invalidate => {}
            EpConfig::Mem(obj) => vpe.config_mem_ep(&self.dtu, ep, obj, addr)?,
            EpConfig::Send(sep) => vpe.config_snd_ep(&self.dtu, ep, *sep)?,
            EpConfig::Recv(obj) => {
                let (order, msg_order) = {
                    let r = obj.borrow();
                    (r.order, r.msg_order)
                };
                vpe.config_rcv_ep(&self.dtu, ep, addr, order, msg_order)?;
                obj.borrow_mut().loc = Some((target, ep, addr));
            }
        }

        if let Some(id) = gate_id {
            vpe.bind(ep, EpBinding::Gate(id));
            self.caps
                .cap_mut(id)
                .kind
                .set_activation(Some(Activation { vpe: target, ep }));
        }
        log::debug!(target: "syscalls", "VPE {}: ep{} <- {:?}:{}", target, ep, TableId::Obj(target), gate);
        Ok(Flow::done())
    }

    /// Configure a receive buffer on an endpoint without a capability
    pub(super) fn handle_attachrb(
        &mut self,
        caller: VpeId,
        vsel: CapSel,
        ep: EpId,
        addr: u64,
        order: u32,
        msg_order: u32,
    ) -> Result<Flow, Code> {
        let target = self.vpe_from_sel(caller, vsel)?;
        if ep < FIRST_FREE_EP {
            return Err(Code::InvArgs);
        }
        let vpe = self.vpes.get_mut(target).ok_or(Code::Gone)?;
        match vpe.binding(ep) {
            Some(EpBinding::Free) => {}
            Some(_) => return Err(Code::Exists),
            None => return Err(Code::InvArgs),
        }
        vpe.config_rcv_ep(&self.dtu, ep, addr, order, msg_order)?;
        vpe.bind(ep, EpBinding::Raw);
        Ok(Flow::done())
    }

    pub(super) fn handle_detachrb(
        &mut self,
        caller: VpeId,
        vsel: CapSel,
        ep: EpId,
    ) -> Result<Flow, Code> {
        let target = self.vpe_from_sel(caller, vsel)?;
        if ep < FIRST_FREE_EP {
            return Err(Code::InvArgs);
        }
        let vpe = self.vpes.get_mut(target).ok_or(Code::Gone)?;
        if vpe.binding(ep) != Some(EpBinding::Raw) {
            return Err(Code::InvArgs);
        }
        vpe.invalidate_ep(&self.dtu, ep)?;
        Ok(Flow::done())
    }

    // ========================================================================
    // Exchange and revocation
    // ========================================================================

    pub(super) fn handle_exchange(
        &mut self,
        caller: VpeId,
        vsel: CapSel,
        own: CapRngDesc,
        other: CapSel,
        obtain: bool,
    ) -> Result<Flow, Code> {
        let target = self.vpe_from_sel(caller, vsel)?;
        if target == caller {
            return Err(Code::InvArgs);
        }
        if obtain {
            self.copy_caps(
                TableId::Obj(target),
                other,
                TableId::Obj(caller),
                own.start,
                own.count,
            )?;
        } else {
            self.copy_caps(
                TableId::Obj(caller),
                own.start,
                TableId::Obj(target),
                other,
                own.count,
            )?;
        }
        Ok(Flow::done())
    }

    /// Revoke a range of the object or map table of a VPE
    ///
    /// A service that still has sessions or unanswered requests makes the
    /// call wait; it is retried until the service capability is gone.
    pub(super) fn handle_revoke(
        &mut self,
        caller: VpeId,
        vsel: CapSel,
        crd: CapRngDesc,
        own: bool,
        kind: RangeKind,
    ) -> Result<Flow, Code> {
        let target = self.vpe_from_sel(caller, vsel)?;
        if crd.end().is_none() {
            return Err(Code::InvArgs);
        }
        let table = match kind {
            RangeKind::Obj => TableId::Obj(target),
            RangeKind::Map => TableId::Map(target),
        };
        // a VPE's own capabilities go with the VPE only
        if own && kind == RangeKind::Obj && crd.count > 0 && crd.start < FIRST_FREE_SEL {
            return Err(Code::InvArgs);
        }

        match self.revoke_range(table, crd, own) {
            Ok(()) => Ok(Flow::done()),
            Err((_, e)) if e.is_transient() => Ok(Flow::Wait(Wait::Revoke(Syscall::Revoke {
                vpe: vsel,
                crd,
                own,
                kind,
            }))),
            Err((sel, e)) => {
                log::warn!(target: "caps", "VPE {}: revoke of {:?}:{} failed: {}", caller, table, sel, e);
                Err(e)
            }
        }
    }
}
