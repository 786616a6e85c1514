//! DTU register file
//!
//! The register window at [`DTU_BASE_ADDR`](crate::DTU_BASE_ADDR) starts with
//! [`DTU_REGS`] general registers, followed by [`EP_REGS`] registers for each
//! of the [`EP_COUNT`] endpoints. [`DtuRegs`] is a byte-exact image of that
//! window, which is what gets saved and restored on a context switch.

use alloc::vec::Vec;

use crate::ep::EpDesc;
use crate::{EpId, EP_COUNT, EP_REGS};

/// General DTU registers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum DtuReg {
    Features = 0,
    RootPt = 1,
    PfEp = 2,
    VpeId = 3,
    CurTime = 4,
    IdleTime = 5,
    MsgCnt = 6,
    ExtCmd = 7,
    RwBarrier = 8,
}

/// Number of general registers
pub const DTU_REGS: usize = 9;

impl DtuReg {
    /// Byte offset of the register within the register window
    pub const fn offset(self) -> u64 {
        (self as u64) * 8
    }
}

/// Byte offset of the first register of `ep` within the register window
pub const fn ep_offset(ep: EpId) -> u64 {
    ((DTU_REGS + ep * EP_REGS) as u64) * 8
}

/// External commands, written to [`DtuReg::ExtCmd`]
///
/// The opcode lives in the low three bits, the argument above.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum ExtCmd {
    Idle = 0,
    WakeupCore = 1,
    InvEp = 2,
    InvPage = 3,
    InvTlb = 4,
    Reset = 5,
}

impl ExtCmd {
    pub fn from_u64(v: u64) -> Option<Self> {
        match v & 0x7 {
            0 => Some(Self::Idle),
            1 => Some(Self::WakeupCore),
            2 => Some(Self::InvEp),
            3 => Some(Self::InvPage),
            4 => Some(Self::InvTlb),
            5 => Some(Self::Reset),
            _ => None,
        }
    }
}

/// Image of a DTU's register window
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DtuRegs {
    pub dtu: [u64; DTU_REGS],
    pub eps: [[u64; EP_REGS]; EP_COUNT],
}

impl DtuRegs {
    /// Size of the register window in bytes
    pub const SIZE: usize = (DTU_REGS + EP_COUNT * EP_REGS) * 8;

    pub fn new() -> Self {
        Self {
            dtu: [0; DTU_REGS],
            eps: [[0; EP_REGS]; EP_COUNT],
        }
    }

    pub fn get(&self, reg: DtuReg) -> u64 {
        self.dtu[reg as usize]
    }

    pub fn set(&mut self, reg: DtuReg, value: u64) {
        self.dtu[reg as usize] = value;
    }

    /// Decode the configuration of `ep`; garbage decodes as `None`
    pub fn ep(&self, ep: EpId) -> Option<EpDesc> {
        EpDesc::from_regs(self.eps.get(ep)?)
    }

    pub fn set_ep(&mut self, ep: EpId, desc: &EpDesc) {
        if let Some(regs) = self.eps.get_mut(ep) {
            *regs = desc.to_regs();
        }
    }

    /// Serialize in register-window order (little endian)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        for r in self.dtu.iter().chain(self.eps.iter().flatten()) {
            bytes.extend_from_slice(&r.to_le_bytes());
        }
        bytes
    }

    /// Parse a register-window image; `None` if `bytes` has the wrong size
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        let mut words = bytes.chunks_exact(8).map(|c| {
            let mut w = [0u8; 8];
            w.copy_from_slice(c);
            u64::from_le_bytes(w)
        });
        let mut regs = Self::new();
        for r in regs.dtu.iter_mut().chain(regs.eps.iter_mut().flatten()) {
            *r = words.next()?;
        }
        Some(regs)
    }
}

impl Default for DtuRegs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ep::RecvEp;

    #[test]
    fn test_ep_offsets_follow_general_regs() {
        assert_eq!(ep_offset(0), DTU_REGS as u64 * 8);
        assert_eq!(ep_offset(1) - ep_offset(0), EP_REGS as u64 * 8);
        assert_eq!(ep_offset(EP_COUNT) as usize, DtuRegs::SIZE);
    }

    #[test]
    fn test_bytes_preserve_endpoints() {
        let mut regs = DtuRegs::new();
        regs.set(DtuReg::VpeId, 42);
        regs.set_ep(
            3,
            &EpDesc::Recv(RecvEp {
                buf: 0x3FC0_0200,
                order: 10,
                msg_order: 6,
            }),
        );

        let bytes = regs.to_bytes();
        assert_eq!(bytes.len(), DtuRegs::SIZE);
        let parsed = DtuRegs::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.get(DtuReg::VpeId), 42);
        assert_eq!(parsed.ep(3), regs.ep(3));
    }

    #[test]
    fn test_from_bytes_rejects_short_image() {
        assert!(DtuRegs::from_bytes(&[0u8; 16]).is_none());
    }

    #[test]
    fn test_ext_cmd_opcode_in_low_bits() {
        assert_eq!(ExtCmd::from_u64(ExtCmd::Reset as u64 | (0x1000 << 3)), Some(ExtCmd::Reset));
        assert_eq!(ExtCmd::from_u64(7), None);
    }
}
