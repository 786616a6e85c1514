//! Saved DTU state of a VPE
//!
//! While a VPE is not resident, its endpoint configuration lives here and
//! is written back to the DTU in one piece when the VPE is restored.

use pex_dtu::{
    Dtu, DtuError, DtuFeatures, DtuReg, DtuRegs, EpDesc, VpeDesc, DTU_BASE_ADDR,
};

use crate::types::{EpId, VpeId};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DtuState {
    regs: DtuRegs,
}

impl DtuState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn regs(&self) -> &DtuRegs {
        &self.regs
    }

    pub fn ep(&self, ep: EpId) -> Option<EpDesc> {
        self.regs.ep(ep)
    }

    pub fn set_ep(&mut self, ep: EpId, desc: &EpDesc) {
        self.regs.set_ep(ep, desc);
    }

    pub fn invalidate(&mut self, ep: EpId) {
        self.regs.set_ep(ep, &EpDesc::Invalid);
    }

    /// Cycles the VPE spent waiting for messages during its last slice
    pub fn idle_time(&self) -> u64 {
        self.regs.get(DtuReg::IdleTime)
    }

    /// Unread messages in the VPE's receive buffers
    pub fn msg_count(&self) -> u64 {
        self.regs.get(DtuReg::MsgCnt)
    }

    /// Read the register file of `pe` into this state
    pub fn save<D: Dtu>(&mut self, dtu: &D, desc: VpeDesc) -> Result<(), DtuError> {
        let mut image = alloc::vec![0u8; DtuRegs::SIZE];
        dtu.read_mem(desc, DTU_BASE_ADDR, &mut image)?;
        self.regs = DtuRegs::from_bytes(&image).ok_or(DtuError::OutOfBounds)?;
        Ok(())
    }

    /// Write this state to the DTU of `desc.pe` on behalf of `vpe`
    pub fn restore<D: Dtu>(
        &mut self,
        dtu: &D,
        desc: VpeDesc,
        vpe: VpeId,
        root_pt: Option<u64>,
    ) -> Result<(), DtuError> {
        let features = match root_pt {
            Some(_) => DtuFeatures::PAGEFAULTS,
            None => DtuFeatures::empty(),
        };
        self.regs.set(DtuReg::Features, features.bits());
        self.regs.set(DtuReg::RootPt, root_pt.unwrap_or(0));
        self.regs.set(DtuReg::VpeId, vpe as u64);
        self.regs.set(DtuReg::IdleTime, 0);
        self.regs.set(DtuReg::ExtCmd, 0);
        dtu.write_mem(desc, DTU_BASE_ADDR, &self.regs.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pex_dtu::{MemEp, Perm};
    use pex_dtu_mock::MockDtu;

    #[test]
    fn test_restore_then_save_is_identity_for_endpoints() {
        let dtu = MockDtu::new(2);
        let desc = VpeDesc::new(1, 4);
        let mut st = DtuState::new();
        let ep = EpDesc::Memory(MemEp {
            pe: 3,
            vpe: 0,
            addr: 0x1000,
            size: 0x2000,
            perm: Perm::RW,
        });
        st.set_ep(5, &ep);
        st.restore(&dtu, desc, 4, Some(0x7000)).unwrap();
        assert_eq!(dtu.ep(1, 5), Some(ep));
        assert_eq!(dtu.reg(1, DtuReg::VpeId), 4);
        assert_eq!(dtu.reg(1, DtuReg::RootPt), 0x7000);

        let mut copy = DtuState::new();
        copy.save(&dtu, desc).unwrap();
        for e in 0..pex_dtu::EP_COUNT {
            assert_eq!(copy.ep(e), st.ep(e));
        }
    }

    #[test]
    fn test_counters_come_from_saved_image() {
        let dtu = MockDtu::new(2);
        dtu.set_reg(1, DtuReg::IdleTime, 500);
        dtu.set_reg(1, DtuReg::MsgCnt, 2);
        let mut st = DtuState::new();
        st.save(&dtu, VpeDesc::pe_only(1)).unwrap();
        assert_eq!(st.idle_time(), 500);
        assert_eq!(st.msg_count(), 2);
    }
}
