//! Syscall handling
//!
//! [`Kernel::dispatch`] routes a decoded [`Syscall`] to its handler. Every
//! handler checks the caller's capabilities and then either answers right
//! away or names the condition it waits for.
//!
//! Handlers never block. A syscall that depends on something outside the
//! kernel (a service reply, another VPE's exit, a receive gate being
//! activated) returns [`Flow::Wait`]; the kernel keeps the request open and
//! resumes it from its work loop.

mod caps;
mod forward;
mod service;
mod vpe;

use alloc::rc::Weak;
use alloc::vec::Vec;
use core::cell::RefCell;

use pex_audit::EventId;
use pex_dtu::Dtu;

use crate::cap::{RGateObject, TableId};
use crate::error::Code;
use crate::kernel::Kernel;
use crate::kif::Syscall;
use crate::types::{CapRngDesc, CapSel, Label, VpeId};

pub(crate) use service::ServiceCont;

/// How a syscall continues
#[derive(Debug)]
pub(crate) enum Flow {
    /// Reply with these values
    Reply(Vec<u64>),
    /// Reply later
    Wait(Wait),
    /// Never reply (the caller is gone)
    NoReply,
}

impl Flow {
    fn done() -> Self {
        Flow::Reply(Vec::new())
    }
}

/// What a suspended syscall waits for
#[derive(Debug)]
pub(crate) enum Wait {
    /// The reply of a service to the request with `label`
    Service { label: Label, cont: ServiceCont },
    /// Revocation of a busy service; retried as is
    Revoke(Syscall),
    /// Activation of the receive gate a send gate points to
    Activate {
        rgate: Weak<RefCell<RGateObject>>,
        call: Syscall,
    },
    /// Exit of a VPE
    Exit(VpeId),
    /// `target` running again; the forwarding `call` is retried as is
    Resume { target: VpeId, call: Syscall },
}

/// An open syscall
#[derive(Debug)]
pub(crate) struct Waiter {
    pub vpe: VpeId,
    pub req: EventId,
    pub wait: Wait,
}

impl<D: Dtu> Kernel<D> {
    pub(crate) fn dispatch(&mut self, vpe: VpeId, call: Syscall) -> Result<Flow, Code> {
        match call {
            Syscall::CreateSrv { dst, rgate, name } => self.handle_createsrv(vpe, dst, rgate, &name),
            Syscall::CreateSess { dst, name, arg } => self.handle_createsess(vpe, dst, &name, arg),
            Syscall::CreateGate { dst, spec } => self.handle_creategate(vpe, dst, spec),
            Syscall::CreateVpe {
                dst,
                name,
                isa,
                muxable,
            } => self.handle_createvpe(vpe, dst, &name, isa, muxable),
            Syscall::CreateMap {
                dst,
                vpe: vsel,
                mgate,
                first,
                pages,
                perms,
            } => self.handle_createmap(vpe, dst, vsel, mgate, first, pages, perms),
            Syscall::AttachRb {
                vpe: vsel,
                ep,
                addr,
                order,
                msg_order,
            } => self.handle_attachrb(vpe, vsel, ep, addr, order, msg_order),
            Syscall::DetachRb { vpe: vsel, ep } => self.handle_detachrb(vpe, vsel, ep),
            Syscall::Exchange {
                vpe: vsel,
                own,
                other,
                obtain,
            } => self.handle_exchange(vpe, vsel, own, other, obtain),
            Syscall::VpeCtrl { vpe: vsel, op, .. } => self.handle_vpectrl(vpe, vsel, op),
            Syscall::Delegate { sess, crd, args } => {
                self.handle_exchange_sess(vpe, sess, crd, args, false)
            }
            Syscall::Obtain { sess, crd, args } => {
                self.handle_exchange_sess(vpe, sess, crd, args, true)
            }
            Syscall::Activate {
                vpe: vsel,
                gate,
                ep,
                addr,
            } => self.handle_activate(vpe, vsel, gate, ep, addr),
            Syscall::ReqMem {
                dst,
                addr,
                size,
                perms,
            } => self.handle_reqmem(vpe, dst, addr, size, perms),
            Syscall::DeriveMem {
                src,
                dst,
                offset,
                size,
                perms,
            } => self.handle_derivemem(vpe, src, dst, offset, size, perms),
            Syscall::Revoke {
                vpe: vsel,
                crd,
                own,
                kind,
            } => self.handle_revoke(vpe, vsel, crd, own, kind),
            Syscall::Exit { code } => self.handle_exit(vpe, code),
            Syscall::Noop => Ok(Flow::done()),
            Syscall::ForwardMsg {
                sgate,
                rgate,
                rlabel,
                data,
            } => self.handle_forwardmsg(vpe, sgate, rgate, rlabel, data),
            Syscall::ForwardMem { mgate, offset, op } => {
                self.handle_forwardmem(vpe, mgate, offset, op)
            }
            Syscall::ForwardReply {
                rgate,
                msgaddr,
                data,
            } => self.handle_forwardreply(vpe, rgate, msgaddr, data),
        }
    }

    /// Copy the capabilities in `[src_start, src_start + count)` of `src` to
    /// the same offsets starting at `dst_start` in `dst`
    ///
    /// Empty selectors are skipped. The copies become children of their
    /// sources. Either all capabilities are copied or none.
    ///
    /// # Returns
    /// * `Err(Code::InvArgs)` - A range overflows or a source capability
    ///   crosses the range boundary
    /// * `Err(Code::Exists)` - The destination range is not empty
    /// * `Err(Code::NotSup)` - A source capability cannot be copied
    pub(crate) fn copy_caps(
        &mut self,
        src: TableId,
        src_start: CapSel,
        dst: TableId,
        dst_start: CapSel,
        count: u32,
    ) -> Result<(), Code> {
        let src_end = src_start.checked_add(count).ok_or(Code::InvArgs)?;
        dst_start.checked_add(count).ok_or(Code::InvArgs)?;
        if count == 0 {
            return Ok(());
        }
        if self.caps.range_used(dst, dst_start, count) {
            return Err(Code::Exists);
        }

        let mut ids = Vec::new();
        for id in self.caps.table_caps(src) {
            let cap = self.caps.cap(id);
            let end = cap.sel as u64 + cap.length as u64;
            if end <= src_start as u64 || cap.sel >= src_end {
                continue;
            }
            if cap.sel < src_start || end > src_end as u64 {
                return Err(Code::InvArgs);
            }
            ids.push(id);
        }

        let mut copied = Vec::with_capacity(ids.len());
        for id in ids {
            let sel = self.caps.cap(id).sel;
            let dst_sel = dst_start + (sel - src_start);
            match self.obtain(dst, dst_sel, id) {
                Ok(_) => copied.push(dst_sel),
                Err(e) => {
                    for sel in copied {
                        if let Err((s, re)) = self.revoke_range(dst, CapRngDesc::single(sel), true) {
                            log::warn!(
                                target: "caps",
                                "{:?}:{}: undoing partial copy failed: {}",
                                dst,
                                s,
                                re
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        log::debug!(
            target: "caps",
            "Copied {:?}:{}..{} to {:?}:{}",
            src,
            src_start,
            src_end,
            dst,
            dst_start
        );
        Ok(())
    }
}
