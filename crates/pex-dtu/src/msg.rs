//! Message headers
//!
//! The DTU prepends a header to every message it places into a receive
//! buffer slot:
//!
//! ```text
//! byte 0: flags   1: sender PE   2: sender ep   3: reply ep   4..6: length   6..8: sender VPE
//! 8..16: reply label   16..24: label
//! ```
//!
//! For a reply, `reply_ep` names the endpoint that gets its credit back.

use bitflags::bitflags;

use crate::{EpId, Label, PeId, VpeId};

/// Size of an encoded header
pub const HEADER_SIZE: usize = 24;

bitflags! {
    /// Flags in the first byte of a header
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u8 {
        /// The message is a reply
        const REPLY = 1 << 0;
        /// The reply returns a credit to `reply_ep`
        const GRANT_CREDITS = 1 << 1;
        /// The receiver may still reply
        const REPLY_ENABLED = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgHeader {
    pub flags: HeaderFlags,
    pub sender_pe: PeId,
    pub sender_ep: EpId,
    pub reply_ep: EpId,
    /// Payload bytes following the header
    pub length: u16,
    pub sender_vpe: VpeId,
    pub reply_label: Label,
    pub label: Label,
}

impl MsgHeader {
    /// Encode into the buffer layout
    ///
    /// PE and endpoint numbers are truncated to one byte each.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.flags.bits();
        buf[1] = self.sender_pe as u8;
        buf[2] = self.sender_ep as u8;
        buf[3] = self.reply_ep as u8;
        buf[4..6].copy_from_slice(&self.length.to_le_bytes());
        buf[6..8].copy_from_slice(&self.sender_vpe.to_le_bytes());
        buf[8..16].copy_from_slice(&self.reply_label.to_le_bytes());
        buf[16..24].copy_from_slice(&self.label.to_le_bytes());
        buf
    }

    /// Decode a header; `None` for short input or unknown flags
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let buf = buf.get(..HEADER_SIZE)?;
        let word = |r: core::ops::Range<usize>| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&buf[r]);
            u64::from_le_bytes(w)
        };
        Some(Self {
            flags: HeaderFlags::from_bits(buf[0])?,
            sender_pe: buf[1] as PeId,
            sender_ep: buf[2] as EpId,
            reply_ep: buf[3] as EpId,
            length: u16::from_le_bytes([buf[4], buf[5]]),
            sender_vpe: u16::from_le_bytes([buf[6], buf[7]]),
            reply_label: word(8..16),
            label: word(16..24),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let hdr = MsgHeader {
            flags: HeaderFlags::REPLY_ENABLED,
            sender_pe: 3,
            sender_ep: 2,
            reply_ep: 5,
            length: 300,
            sender_vpe: 0x102,
            reply_label: 0x77,
            label: 0xDEAD,
        };
        let buf = hdr.encode();
        assert_eq!(buf[0], 4);
        assert_eq!(&buf[4..8], &[0x2C, 0x01, 0x02, 0x01]);
        assert_eq!(MsgHeader::decode(&buf), Some(hdr));
    }

    #[test]
    fn test_decode_rejects_short_and_unknown_flags() {
        let mut buf = [0u8; HEADER_SIZE];
        assert!(MsgHeader::decode(&buf[..HEADER_SIZE - 1]).is_none());
        buf[0] = 0x80;
        assert!(MsgHeader::decode(&buf).is_none());
    }
}
