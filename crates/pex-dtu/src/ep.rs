//! Endpoint descriptors
//!
//! Each endpoint occupies [`EP_REGS`](crate::EP_REGS) registers in the DTU.
//! The first register carries the endpoint type in its top three bits; the
//! remaining layout depends on the type:
//!
//! ```text
//! receive: r0 = type << 61 | msg_order << 32 | order << 16   r1 = buffer   r2 = 0
//! send:    r0 = type << 61 | vpe << 16 | msg_order           r1 = pe << 40 | ep << 32 | credits << 16 | credits
//!          r2 = label
//! memory:  r0 = type << 61 | size                            r1 = addr     r2 = vpe << 12 | pe << 4 | perm
//! ```

use serde::{Deserialize, Serialize};

use crate::flags::Perm;
use crate::{EpId, Label, PeId, VpeId, EP_REGS};

/// Endpoint type as stored in the top bits of the first register
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u64)]
pub enum EpType {
    Invalid = 0,
    Send = 1,
    Receive = 2,
    Memory = 3,
}

impl EpType {
    /// Convert from the raw type field
    pub fn from_u64(v: u64) -> Option<Self> {
        match v {
            0 => Some(Self::Invalid),
            1 => Some(Self::Send),
            2 => Some(Self::Receive),
            3 => Some(Self::Memory),
            _ => None,
        }
    }
}

const TYPE_SHIFT: u32 = 61;
const SIZE_MASK: u64 = 0x1FFF_FFFF_FFFF_FFFF;

/// Receive endpoint: a ring buffer of `1 << order` bytes, slots of `1 << msg_order`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvEp {
    pub buf: u64,
    pub order: u32,
    pub msg_order: u32,
}

/// Send endpoint towards a receive endpoint of another VPE
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEp {
    pub dst_pe: PeId,
    pub dst_ep: EpId,
    pub dst_vpe: VpeId,
    pub label: Label,
    pub msg_order: u32,
    pub credits: u64,
}

/// Memory endpoint for remote access to `size` bytes at `addr` on `pe`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemEp {
    pub pe: PeId,
    pub vpe: VpeId,
    pub addr: u64,
    pub size: u64,
    pub perm: Perm,
}

/// Decoded endpoint configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpDesc {
    Invalid,
    Recv(RecvEp),
    Send(SendEp),
    Memory(MemEp),
}

impl EpDesc {
    pub fn ty(&self) -> EpType {
        match self {
            EpDesc::Invalid => EpType::Invalid,
            EpDesc::Recv(_) => EpType::Receive,
            EpDesc::Send(_) => EpType::Send,
            EpDesc::Memory(_) => EpType::Memory,
        }
    }

    /// Encode into the endpoint's register triple
    pub fn to_regs(&self) -> [u64; EP_REGS] {
        let ty = (self.ty() as u64) << TYPE_SHIFT;
        match self {
            EpDesc::Invalid => [0; EP_REGS],
            EpDesc::Recv(r) => [
                ty | ((r.msg_order as u64 & 0xFFFF) << 32) | ((r.order as u64 & 0xFFFF) << 16),
                r.buf,
                0,
            ],
            EpDesc::Send(s) => {
                let credits = s.credits & 0xFFFF;
                [
                    ty | ((s.dst_vpe as u64) << 16) | (s.msg_order as u64 & 0xFFFF),
                    ((s.dst_pe as u64 & 0xFF) << 40)
                        | ((s.dst_ep as u64 & 0xFF) << 32)
                        | (credits << 16)
                        | credits,
                    s.label,
                ]
            }
            EpDesc::Memory(m) => [
                ty | (m.size & SIZE_MASK),
                m.addr,
                ((m.vpe as u64) << 12) | ((m.pe as u64 & 0xFF) << 4) | (m.perm.bits() as u64 & 0x7),
            ],
        }
    }

    /// Decode a register triple
    ///
    /// Returns `None` for an unknown type field.
    pub fn from_regs(regs: &[u64; EP_REGS]) -> Option<Self> {
        let ty = EpType::from_u64(regs[0] >> TYPE_SHIFT)?;
        Some(match ty {
            EpType::Invalid => EpDesc::Invalid,
            EpType::Receive => EpDesc::Recv(RecvEp {
                buf: regs[1],
                order: ((regs[0] >> 16) & 0xFFFF) as u32,
                msg_order: ((regs[0] >> 32) & 0xFFFF) as u32,
            }),
            EpType::Send => EpDesc::Send(SendEp {
                dst_pe: ((regs[1] >> 40) & 0xFF) as PeId,
                dst_ep: ((regs[1] >> 32) & 0xFF) as EpId,
                dst_vpe: ((regs[0] >> 16) & 0xFFFF) as VpeId,
                label: regs[2],
                msg_order: (regs[0] & 0xFFFF) as u32,
                credits: regs[1] & 0xFFFF,
            }),
            EpType::Memory => EpDesc::Memory(MemEp {
                pe: ((regs[2] >> 4) & 0xFF) as PeId,
                vpe: ((regs[2] >> 12) & 0xFFFF) as VpeId,
                addr: regs[1],
                size: regs[0] & SIZE_MASK,
                perm: Perm::from_bits_truncate((regs[2] & 0x7) as u32),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_ep_layout() {
        let desc = EpDesc::Send(SendEp {
            dst_pe: 4,
            dst_ep: 7,
            dst_vpe: 0x12,
            label: 0xDEAD_BEEF,
            msg_order: 8,
            credits: 3,
        });
        let regs = desc.to_regs();
        assert_eq!(regs[0] >> 61, EpType::Send as u64);
        assert_eq!((regs[0] >> 16) & 0xFFFF, 0x12);
        assert_eq!(regs[1], (4 << 40) | (7 << 32) | (3 << 16) | 3);
        assert_eq!(regs[2], 0xDEAD_BEEF);
        assert_eq!(EpDesc::from_regs(&regs), Some(desc));
    }

    #[test]
    fn test_memory_ep_truncates_perm() {
        let desc = EpDesc::Memory(MemEp {
            pe: 2,
            vpe: 9,
            addr: 0x4000,
            size: 0x1000,
            perm: Perm::R | Perm::W,
        });
        let regs = desc.to_regs();
        assert_eq!(regs[2] & 0x7, 0x3);
        assert_eq!(EpDesc::from_regs(&regs), Some(desc));
    }

    #[test]
    fn test_zeroed_regs_are_invalid() {
        assert_eq!(EpDesc::from_regs(&[0; EP_REGS]), Some(EpDesc::Invalid));
        assert_eq!(EpDesc::Invalid.to_regs(), [0; EP_REGS]);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert_eq!(EpDesc::from_regs(&[7 << 61, 0, 0]), None);
    }
}
