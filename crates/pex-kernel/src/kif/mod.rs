//! Kernel interface
//!
//! Syscalls, replies and kernel-to-service requests are sequences of
//! little-endian 64-bit words. Strings and byte payloads are a length word
//! followed by the bytes, zero-padded to the next word boundary.
//!
//! Decoding is the trust boundary of the kernel: everything coming from a
//! VPE passes through [`Unmarshaller`], and any malformed message yields
//! [`Code::InvArgs`] before kernel state is touched.

pub mod service;
pub mod syscall;

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::Code;
use crate::types::CapSel;

pub use service::{ServiceCmd, ServiceOp};
pub use syscall::{GateSpec, MemOp, RangeKind, Syscall, VpeOp};

/// Longest service or VPE name
pub const MAX_NAME_LEN: usize = 64;
/// Most arguments a delegate/obtain exchange may carry
pub const MAX_EXCHG_ARGS: usize = 8;
/// Largest payload of a forwarded message or memory access
pub const MAX_FWD_SIZE: usize = 440;

/// Builds a message word by word
#[derive(Debug, Default)]
pub struct Marshaller {
    buf: Vec<u8>,
}

impl Marshaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, word: u64) -> &mut Self {
        self.buf.extend_from_slice(&word.to_le_bytes());
        self
    }

    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.push_bytes(s.as_bytes())
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.push(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
        let pad = (8 - bytes.len() % 8) % 8;
        self.buf.extend(core::iter::repeat(0).take(pad));
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.buf)
    }
}

/// Reads a message word by word
#[derive(Debug)]
pub struct Unmarshaller<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Unmarshaller<'a> {
    /// Fails if `data` is not a whole number of words
    pub fn new(data: &'a [u8]) -> Result<Self, Code> {
        if data.len() % 8 != 0 {
            return Err(Code::InvArgs);
        }
        Ok(Self { data, pos: 0 })
    }

    pub fn remaining(&self) -> usize {
        (self.data.len() - self.pos) / 8
    }

    pub fn pop(&mut self) -> Result<u64, Code> {
        let bytes = self.data.get(self.pos..self.pos + 8).ok_or(Code::InvArgs)?;
        let mut w = [0u8; 8];
        w.copy_from_slice(bytes);
        self.pos += 8;
        Ok(u64::from_le_bytes(w))
    }

    /// A selector; values beyond the selector space are rejected
    pub fn pop_sel(&mut self) -> Result<CapSel, Code> {
        CapSel::try_from(self.pop()?).map_err(|_| Code::InvArgs)
    }

    pub fn pop_u32(&mut self) -> Result<u32, Code> {
        u32::try_from(self.pop()?).map_err(|_| Code::InvArgs)
    }

    pub fn pop_bool(&mut self) -> Result<bool, Code> {
        match self.pop()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Code::InvArgs),
        }
    }

    /// A non-empty UTF-8 name of at most [`MAX_NAME_LEN`] bytes
    pub fn pop_name(&mut self) -> Result<String, Code> {
        let bytes = self.pop_slice(MAX_NAME_LEN)?;
        if bytes.is_empty() {
            return Err(Code::InvArgs);
        }
        core::str::from_utf8(bytes)
            .map(String::from)
            .map_err(|_| Code::InvArgs)
    }

    /// A byte payload of at most `max` bytes
    pub fn pop_bytes(&mut self, max: usize) -> Result<Vec<u8>, Code> {
        self.pop_slice(max).map(<[u8]>::to_vec)
    }

    fn pop_slice(&mut self, max: usize) -> Result<&'a [u8], Code> {
        let len = self.pop()? as usize;
        if len > max {
            return Err(Code::InvArgs);
        }
        let padded = (len + 7) & !7;
        let bytes = self
            .data
            .get(self.pos..self.pos + padded)
            .ok_or(Code::InvArgs)?;
        self.pos += padded;
        Ok(&bytes[..len])
    }

    /// Fails if words are left over
    pub fn finish(self) -> Result<(), Code> {
        if self.pos != self.data.len() {
            return Err(Code::InvArgs);
        }
        Ok(())
    }
}

/// Encode a reply: `[0, values...]` on success, `[code]` on failure
pub fn encode_reply(res: &Result<Vec<u64>, Code>) -> Vec<u8> {
    let mut m = Marshaller::new();
    match res {
        Ok(vals) => {
            m.push(0);
            for v in vals {
                m.push(*v);
            }
        }
        Err(e) => {
            m.push(*e as u64);
        }
    }
    m.finish()
}

/// Decode a reply produced by [`encode_reply`] (or by a service)
///
/// An unknown error code is reported as [`Code::InvArgs`].
pub fn decode_reply(data: &[u8]) -> Result<Vec<u64>, Code> {
    let mut um = Unmarshaller::new(data)?;
    let code = um.pop()?;
    if code != 0 {
        return Err(Code::from_u64(code).unwrap_or(Code::InvArgs));
    }
    let mut vals = Vec::with_capacity(um.remaining());
    while um.remaining() > 0 {
        vals.push(um.pop()?);
    }
    Ok(vals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_string_padding() {
        let msg = Marshaller::new().push(7).push_str("fs").push(9).finish();
        assert_eq!(msg.len(), 4 * 8);
        let mut um = Unmarshaller::new(&msg).unwrap();
        assert_eq!(um.pop(), Ok(7));
        assert_eq!(um.pop_name().as_deref(), Ok("fs"));
        assert_eq!(um.pop(), Ok(9));
        assert!(um.finish().is_ok());
    }

    #[test]
    fn test_unmarshaller_rejects_garbage() {
        assert_eq!(Unmarshaller::new(&[0u8; 5]).unwrap_err(), Code::InvArgs);

        let msg = Marshaller::new().push(u64::MAX).push(2).finish();
        let mut um = Unmarshaller::new(&msg).unwrap();
        assert_eq!(um.pop_sel(), Err(Code::InvArgs));
        assert_eq!(um.pop_bool(), Err(Code::InvArgs));
        assert_eq!(um.pop(), Err(Code::InvArgs));

        // name longer than the message
        let msg = Marshaller::new().push(40).push(0).finish();
        assert_eq!(Unmarshaller::new(&msg).unwrap().pop_name(), Err(Code::InvArgs));

        let msg = Marshaller::new().push(1).push(2).finish();
        let mut um = Unmarshaller::new(&msg).unwrap();
        um.pop().unwrap();
        assert_eq!(um.finish(), Err(Code::InvArgs));
    }

    #[test]
    fn test_byte_payloads() {
        let msg = Marshaller::new().push_bytes(b"hello").push_bytes(&[]).finish();
        assert_eq!(msg.len(), 4 * 8);
        let mut um = Unmarshaller::new(&msg).unwrap();
        assert_eq!(um.pop_bytes(8), Ok(b"hello".to_vec()));
        assert_eq!(um.pop_bytes(8), Ok(vec![]));
        assert!(um.finish().is_ok());

        let mut um = Unmarshaller::new(&msg).unwrap();
        assert_eq!(um.pop_bytes(4), Err(Code::InvArgs));
    }

    #[test]
    fn test_reply_encoding() {
        let ok = encode_reply(&Ok(vec![4, 5]));
        assert_eq!(decode_reply(&ok), Ok(vec![4, 5]));
        let err = encode_reply(&Err(Code::NoPerm));
        assert_eq!(err.len(), 8);
        assert_eq!(decode_reply(&err), Err(Code::NoPerm));
        let bogus = Marshaller::new().push(999).finish();
        assert_eq!(decode_reply(&bogus), Err(Code::InvArgs));
    }
}
