//! Forwarding on behalf of VPEs
//!
//! The endpoints of a muxed VPE only exist on its PE while it is resident.
//! A VPE that wants to talk to a suspended one hands the message, memory
//! access or reply to the kernel instead. The kernel wakes the target and
//! finishes the syscall once the target runs again.

use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;

use pex_dtu::{Dtu, HeaderFlags, MsgHeader, VpeDesc, HEADER_SIZE};

use super::{Flow, Wait};
use crate::cap::{CapKind, CapType, TableId};
use crate::error::Code;
use crate::kernel::Kernel;
use crate::kif::{MemOp, Syscall};
use crate::types::{CapSel, Label, Perm, VpeId, INVALID_SEL, INVALID_VPE};

/// Little-endian words of `bytes`, zero-padded
fn to_words(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks(8)
        .map(|c| {
            let mut w = [0u8; 8];
            w[..c.len()].copy_from_slice(c);
            u64::from_le_bytes(w)
        })
        .collect()
}

impl<D: Dtu> Kernel<D> {
    /// Wake `target` and retry `call` once it runs
    fn resume_later(&mut self, target: VpeId, call: Syscall) -> Flow {
        log::debug!(target: "syscalls", "Forwarding to VPE {} waits until it runs", target);
        let res = self
            .pes
            .unblock_vpe(&self.dtu, &mut self.vpes, &mut self.timeouts, target);
        self.sched_result(res);
        Flow::Wait(Wait::Resume { target, call })
    }

    pub(super) fn handle_forwardmsg(
        &mut self,
        caller: VpeId,
        sgate: CapSel,
        rgate: CapSel,
        rlabel: Label,
        data: Vec<u8>,
    ) -> Result<Flow, Code> {
        let table = TableId::Obj(caller);
        let sid = self.caps.get_typed(table, sgate, CapType::SGATE)?;
        let (obj, act) = match &self.caps.cap(sid).kind {
            CapKind::SendGate { obj, act } => (obj.clone(), *act),
            _ => return Err(Code::InvArgs),
        };
        // the caller must have activated the gate itself
        let sender_ep = act.filter(|a| a.vpe == caller).ok_or(Code::InvArgs)?.ep;
        let reply_ep = match rgate {
            INVALID_SEL => None,
            sel => {
                let (_, robj) = self.rgate_of(table, sel)?;
                let loc = robj.borrow().loc;
                match loc {
                    Some((owner, ep, _)) if owner == caller => Some(ep),
                    _ => return Err(Code::InvArgs),
                }
            }
        };

        let loc = obj.rgate.borrow().loc;
        let msg_order = obj.rgate.borrow().msg_order;
        let (dst, dst_ep) = match loc {
            Some((vpe, ep, _)) => (vpe, ep),
            None => {
                return Ok(Flow::Wait(Wait::Activate {
                    rgate: Rc::downgrade(&obj.rgate),
                    call: Syscall::ForwardMsg {
                        sgate,
                        rgate,
                        rlabel,
                        data,
                    },
                }));
            }
        };
        if HEADER_SIZE + data.len() > 1 << msg_order {
            return Err(Code::InvArgs);
        }
        let pe = match self.running_on(dst)? {
            Some(pe) => pe,
            None => {
                let call = Syscall::ForwardMsg {
                    sgate,
                    rgate,
                    rlabel,
                    data,
                };
                return Ok(self.resume_later(dst, call));
            }
        };

        let caller_pe = self.vpes.get(caller).ok_or(Code::Gone)?.pe();
        let hdr = MsgHeader {
            flags: if reply_ep.is_some() {
                HeaderFlags::REPLY_ENABLED
            } else {
                HeaderFlags::empty()
            },
            sender_pe: caller_pe,
            sender_ep,
            reply_ep: reply_ep.unwrap_or(0),
            length: data.len() as u16,
            sender_vpe: caller,
            reply_label: rlabel,
            label: obj.label,
        };
        self.dtu.forward_to(VpeDesc::new(pe, dst), dst_ep, &hdr, &data)?;
        log::debug!(
            target: "syscalls",
            "VPE {}: forwarded {} bytes to VPE {} ep{}",
            caller,
            data.len(),
            dst,
            dst_ep
        );
        Ok(Flow::done())
    }

    /// Read or write memory behind a memory gate
    ///
    /// Main memory is always accessible; the local memory of a VPE only
    /// while that VPE is resident.
    pub(super) fn handle_forwardmem(
        &mut self,
        caller: VpeId,
        mgate: CapSel,
        offset: u64,
        op: MemOp,
    ) -> Result<Flow, Code> {
        let id = self
            .caps
            .get_typed(TableId::Obj(caller), mgate, CapType::MGATE)?;
        let obj = match &self.caps.cap(id).kind {
            CapKind::MemGate { obj, .. } => obj.clone(),
            _ => return Err(Code::InvArgs),
        };
        let (need, len) = match &op {
            MemOp::Read { len } => (Perm::R, *len as u64),
            MemOp::Write(data) => (Perm::W, data.len() as u64),
        };
        if !obj.perms.contains(need) {
            return Err(Code::NoPerm);
        }
        let end = offset.checked_add(len).ok_or(Code::InvArgs)?;
        if end > obj.size {
            return Err(Code::InvArgs);
        }

        let desc = if obj.vpe == INVALID_VPE {
            VpeDesc::pe_only(obj.pe)
        } else {
            match self.running_on(obj.vpe)? {
                Some(_) => VpeDesc::new(obj.pe, obj.vpe),
                None => {
                    let call = Syscall::ForwardMem { mgate, offset, op };
                    return Ok(self.resume_later(obj.vpe, call));
                }
            }
        };
        let addr = obj.addr + offset;
        match op {
            MemOp::Read { len } => {
                let mut buf = vec![0u8; len as usize];
                self.dtu.read_mem(desc, addr, &mut buf)?;
                Ok(Flow::Reply(to_words(&buf)))
            }
            MemOp::Write(data) => {
                self.dtu.write_mem(desc, addr, &data)?;
                Ok(Flow::done())
            }
        }
    }

    /// Reply to a received message whose sender is not running
    ///
    /// The message header at `msgaddr` names the sender; replying clears
    /// its reply permission.
    pub(super) fn handle_forwardreply(
        &mut self,
        caller: VpeId,
        rgate: CapSel,
        msgaddr: u64,
        data: Vec<u8>,
    ) -> Result<Flow, Code> {
        let (_, robj) = self.rgate_of(TableId::Obj(caller), rgate)?;
        let (own_ep, buf, slot_size, size) = {
            let r = robj.borrow();
            match r.loc {
                Some((owner, ep, buf)) if owner == caller => {
                    (ep, buf, 1u64 << r.msg_order, r.size())
                }
                _ => return Err(Code::InvArgs),
            }
        };
        let off = msgaddr.checked_sub(buf).ok_or(Code::InvArgs)?;
        if off >= size || off % slot_size != 0 {
            return Err(Code::InvArgs);
        }
        if HEADER_SIZE + data.len() > slot_size as usize {
            return Err(Code::InvArgs);
        }

        let caller_pe = self.vpes.get(caller).ok_or(Code::Gone)?.pe();
        let own = VpeDesc::new(caller_pe, caller);
        let mut raw = [0u8; HEADER_SIZE];
        self.dtu.read_mem(own, msgaddr, &mut raw)?;
        let hdr = MsgHeader::decode(&raw).ok_or(Code::InvArgs)?;
        if hdr.flags.contains(HeaderFlags::REPLY) || !hdr.flags.contains(HeaderFlags::REPLY_ENABLED)
        {
            return Err(Code::InvArgs);
        }

        let sender = hdr.sender_vpe;
        match self.vpes.get(sender) {
            Some(v) if v.pe() == hdr.sender_pe => {}
            _ => return Err(Code::Gone),
        }
        let pe = match self.running_on(sender)? {
            Some(pe) => pe,
            None => {
                let call = Syscall::ForwardReply {
                    rgate,
                    msgaddr,
                    data,
                };
                return Ok(self.resume_later(sender, call));
            }
        };

        let reply = MsgHeader {
            flags: HeaderFlags::REPLY | HeaderFlags::GRANT_CREDITS,
            sender_pe: caller_pe,
            sender_ep: own_ep,
            reply_ep: hdr.sender_ep,
            length: data.len() as u16,
            sender_vpe: caller,
            reply_label: 0,
            label: hdr.reply_label,
        };
        self.dtu
            .forward_to(VpeDesc::new(pe, sender), hdr.reply_ep, &reply, &data)?;

        let mut replied = hdr;
        replied.flags.remove(HeaderFlags::REPLY_ENABLED);
        self.dtu.write_mem(own, msgaddr, &replied.encode())?;
        log::debug!(target: "syscalls", "VPE {}: forwarded reply to VPE {}", caller, sender);
        Ok(Flow::done())
    }
}
