//! VPE creation and control

use alloc::vec;

use pex_dtu::Dtu;

use super::{Flow, Wait};
use crate::cap::{CapKind, TableId};
use crate::error::Code;
use crate::kernel::{Kernel, STOPPED_EXIT_CODE};
use crate::kif::VpeOp;
use crate::platform::Isa;
use crate::types::{CapRngDesc, CapSel, VpeFlags, VpeId, VpeState, SEL_MEM};

impl<D: Dtu> Kernel<D> {
    /// Create a VPE on a PE of `isa` (default: the caller's)
    ///
    /// The caller receives the VPE capability at `dst` and the capability
    /// for the new VPE's local memory at `dst + 1`.
    pub(super) fn handle_createvpe(
        &mut self,
        caller: VpeId,
        dst: CapSel,
        name: &str,
        isa: Option<Isa>,
        muxable: bool,
    ) -> Result<Flow, Code> {
        if name.is_empty() {
            return Err(Code::InvArgs);
        }
        let table = TableId::Obj(caller);
        if dst.checked_add(2).is_none() {
            return Err(Code::InvArgs);
        }
        if self.caps.range_used(table, dst, 2) {
            return Err(Code::Exists);
        }

        let isa = match isa {
            Some(isa) => isa,
            None => {
                let pe = self.vpes.get(caller).ok_or(Code::Gone)?.pe();
                self.pes.desc(pe).map(|d| d.isa).ok_or(Code::InvArgs)?
            }
        };
        let pe = self.pes.find_pe(&self.vpes, isa, muxable, None)?;
        let flags = if muxable {
            VpeFlags::MUXABLE
        } else {
            VpeFlags::empty()
        };
        let id = self.create_vpe(name, pe, flags)?;

        if let Err(e) = self.hand_out_vpe(table, dst, id) {
            log::warn!(target: "vpes", "VPE {}: handing out VPE {} failed: {}", caller, id, e);
            self.take_back_vpe(table, dst, id);
            return Err(e);
        }
        log::info!(target: "vpes", "VPE {} created VPE {} '{}' on PE {}", caller, id, name, pe);
        Ok(Flow::Reply(vec![id as u64]))
    }

    fn hand_out_vpe(&mut self, table: TableId, dst: CapSel, id: VpeId) -> Result<(), Code> {
        self.caps.insert(table, dst, 1, CapKind::Vpe(id))?;
        if let Some(vpe) = self.vpes.get_mut(id) {
            vpe.add_ref();
        }
        let mem = self
            .caps
            .get(TableId::Obj(id), SEL_MEM)
            .ok_or(Code::NotFound)?;
        self.obtain(table, dst + 1, mem)?;
        Ok(())
    }

    /// Undo a partial [`Self::hand_out_vpe`] and drop the new VPE
    fn take_back_vpe(&mut self, table: TableId, dst: CapSel, id: VpeId) {
        if let Err((sel, e)) = self.revoke_range(table, CapRngDesc::new(dst, 2), true) {
            log::warn!(
                target: "syscalls",
                "{:?}:{}: revoke after failed createvpe failed: {}",
                table,
                sel,
                e
            );
        }
        self.destroy_vpe(id);
    }

    pub(super) fn handle_vpectrl(
        &mut self,
        caller: VpeId,
        vsel: CapSel,
        op: VpeOp,
    ) -> Result<Flow, Code> {
        let target = self.vpe_from_sel(caller, vsel)?;
        match op {
            VpeOp::Start => {
                if target == caller {
                    return Err(Code::InvArgs);
                }
                self.start_app(target)?;
                Ok(Flow::done())
            }
            VpeOp::Stop => {
                if target == caller {
                    return Err(Code::InvArgs);
                }
                self.stop_app(target, STOPPED_EXIT_CODE);
                Ok(Flow::done())
            }
            VpeOp::Yield => {
                if target != caller {
                    return Err(Code::InvArgs);
                }
                let res = self
                    .pes
                    .yield_vpe(&self.dtu, &mut self.vpes, &mut self.timeouts, caller);
                self.sched_result(res);
                Ok(Flow::done())
            }
            VpeOp::Wait => {
                if target == caller {
                    return Err(Code::InvArgs);
                }
                match self.vpes.get(target) {
                    Some(v) if v.state() == VpeState::Dead => {
                        let code = v.exit_code().unwrap_or(STOPPED_EXIT_CODE);
                        Ok(Flow::Reply(vec![code as i64 as u64]))
                    }
                    Some(_) => Ok(Flow::Wait(Wait::Exit(target))),
                    None => Err(Code::Gone),
                }
            }
        }
    }

    pub(super) fn handle_exit(&mut self, caller: VpeId, code: i32) -> Result<Flow, Code> {
        self.stop_app(caller, code);
        Ok(Flow::NoReply)
    }
}
