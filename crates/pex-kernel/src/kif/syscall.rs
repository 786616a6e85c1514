//! Syscall messages

use alloc::string::String;
use alloc::vec::Vec;

use super::{Marshaller, Unmarshaller, MAX_EXCHG_ARGS, MAX_FWD_SIZE};
use crate::error::Code;
use crate::platform::Isa;
use crate::types::{CapRngDesc, CapSel, EpId, Label, Perm};

/// Syscall opcodes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum Operation {
    CreateSrv = 0,
    CreateSess = 1,
    CreateGate = 2,
    CreateVpe = 3,
    CreateMap = 4,
    AttachRb = 5,
    DetachRb = 6,
    Exchange = 7,
    VpeCtrl = 8,
    Delegate = 9,
    Obtain = 10,
    Activate = 11,
    ReqMem = 12,
    DeriveMem = 13,
    Revoke = 14,
    Exit = 15,
    Noop = 16,
    ForwardMsg = 17,
    ForwardMem = 18,
    ForwardReply = 19,
}

impl Operation {
    pub fn from_u64(v: u64) -> Option<Self> {
        use Operation::*;
        Some(match v {
            0 => CreateSrv,
            1 => CreateSess,
            2 => CreateGate,
            3 => CreateVpe,
            4 => CreateMap,
            5 => AttachRb,
            6 => DetachRb,
            7 => Exchange,
            8 => VpeCtrl,
            9 => Delegate,
            10 => Obtain,
            11 => Activate,
            12 => ReqMem,
            13 => DeriveMem,
            14 => Revoke,
            15 => Exit,
            16 => Noop,
            17 => ForwardMsg,
            18 => ForwardMem,
            19 => ForwardReply,
            _ => return None,
        })
    }
}

/// Word meaning "no specific value" for optional arguments
const ANY: u64 = u64::MAX;

/// `ForwardMem` flag: the access writes
const FWD_MEM_WRITE: u64 = 1 << 1;

/// Parameters of a new gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateSpec {
    Recv { order: u32, msg_order: u32 },
    Send { rgate: CapSel, label: Label, credits: u64 },
}

/// Operations of `vpectrl`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VpeOp {
    Start,
    Stop,
    Yield,
    Wait,
}

/// A forwarded memory access
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemOp {
    Read { len: u32 },
    Write(Vec<u8>),
}

/// Table a revoke range refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeKind {
    Obj,
    Map,
}

/// A decoded syscall
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Syscall {
    CreateSrv {
        dst: CapSel,
        rgate: CapSel,
        name: String,
    },
    CreateSess {
        dst: CapSel,
        name: String,
        arg: u64,
    },
    CreateGate {
        dst: CapSel,
        spec: GateSpec,
    },
    CreateVpe {
        dst: CapSel,
        name: String,
        /// `None`: same ISA as the caller
        isa: Option<Isa>,
        muxable: bool,
    },
    CreateMap {
        /// First virtual page
        dst: CapSel,
        vpe: CapSel,
        mgate: CapSel,
        first: u64,
        pages: u32,
        perms: Perm,
    },
    AttachRb {
        vpe: CapSel,
        ep: EpId,
        addr: u64,
        order: u32,
        msg_order: u32,
    },
    DetachRb {
        vpe: CapSel,
        ep: EpId,
    },
    Exchange {
        vpe: CapSel,
        own: CapRngDesc,
        other: CapSel,
        obtain: bool,
    },
    VpeCtrl {
        vpe: CapSel,
        op: VpeOp,
        arg: u64,
    },
    Delegate {
        sess: CapSel,
        crd: CapRngDesc,
        args: Vec<u64>,
    },
    Obtain {
        sess: CapSel,
        crd: CapRngDesc,
        args: Vec<u64>,
    },
    Activate {
        vpe: CapSel,
        gate: CapSel,
        ep: EpId,
        addr: u64,
    },
    ReqMem {
        dst: CapSel,
        /// `None`: anywhere
        addr: Option<u64>,
        size: u64,
        perms: Perm,
    },
    DeriveMem {
        src: CapSel,
        dst: CapSel,
        offset: u64,
        size: u64,
        perms: Perm,
    },
    Revoke {
        vpe: CapSel,
        crd: CapRngDesc,
        own: bool,
        kind: RangeKind,
    },
    Exit {
        code: i32,
    },
    Noop,
    /// Send over `sgate` to a receiver that is not running
    ForwardMsg {
        sgate: CapSel,
        /// Gate for the reply; `INVALID_SEL` for none
        rgate: CapSel,
        rlabel: Label,
        data: Vec<u8>,
    },
    /// Access the memory behind `mgate` while its owner is not running
    ForwardMem {
        mgate: CapSel,
        offset: u64,
        op: MemOp,
    },
    /// Reply to the message at `msgaddr` in the buffer of `rgate`
    ForwardReply {
        rgate: CapSel,
        msgaddr: u64,
        data: Vec<u8>,
    },
}

fn pop_perms(um: &mut Unmarshaller<'_>) -> Result<Perm, Code> {
    let raw = um.pop_u32()?;
    Perm::from_bits(raw).ok_or(Code::InvArgs)
}

fn pop_ep(um: &mut Unmarshaller<'_>) -> Result<EpId, Code> {
    usize::try_from(um.pop()?).map_err(|_| Code::InvArgs)
}

fn pop_args(um: &mut Unmarshaller<'_>) -> Result<Vec<u64>, Code> {
    let count = um.pop()? as usize;
    if count > MAX_EXCHG_ARGS {
        return Err(Code::InvArgs);
    }
    (0..count).map(|_| um.pop()).collect()
}

impl Syscall {
    pub fn operation(&self) -> Operation {
        match self {
            Syscall::CreateSrv { .. } => Operation::CreateSrv,
            Syscall::CreateSess { .. } => Operation::CreateSess,
            Syscall::CreateGate { .. } => Operation::CreateGate,
            Syscall::CreateVpe { .. } => Operation::CreateVpe,
            Syscall::CreateMap { .. } => Operation::CreateMap,
            Syscall::AttachRb { .. } => Operation::AttachRb,
            Syscall::DetachRb { .. } => Operation::DetachRb,
            Syscall::Exchange { .. } => Operation::Exchange,
            Syscall::VpeCtrl { .. } => Operation::VpeCtrl,
            Syscall::Delegate { .. } => Operation::Delegate,
            Syscall::Obtain { .. } => Operation::Obtain,
            Syscall::Activate { .. } => Operation::Activate,
            Syscall::ReqMem { .. } => Operation::ReqMem,
            Syscall::DeriveMem { .. } => Operation::DeriveMem,
            Syscall::Revoke { .. } => Operation::Revoke,
            Syscall::Exit { .. } => Operation::Exit,
            Syscall::Noop => Operation::Noop,
            Syscall::ForwardMsg { .. } => Operation::ForwardMsg,
            Syscall::ForwardMem { .. } => Operation::ForwardMem,
            Syscall::ForwardReply { .. } => Operation::ForwardReply,
        }
    }

    /// Decode an untrusted syscall message
    ///
    /// # Returns
    /// * `Ok(syscall)` - Well-formed message
    /// * `Err(Code::InvArgs)` - Unknown opcode, truncated or trailing words,
    ///   out-of-range values
    pub fn decode(msg: &[u8]) -> Result<Self, Code> {
        let mut um = Unmarshaller::new(msg)?;
        let op = Operation::from_u64(um.pop()?).ok_or(Code::InvArgs)?;
        let sys = match op {
            Operation::CreateSrv => Syscall::CreateSrv {
                dst: um.pop_sel()?,
                rgate: um.pop_sel()?,
                name: um.pop_name()?,
            },
            Operation::CreateSess => Syscall::CreateSess {
                dst: um.pop_sel()?,
                arg: um.pop()?,
                name: um.pop_name()?,
            },
            Operation::CreateGate => {
                let dst = um.pop_sel()?;
                let spec = match um.pop()? {
                    0 => GateSpec::Recv {
                        order: um.pop_u32()?,
                        msg_order: um.pop_u32()?,
                    },
                    1 => GateSpec::Send {
                        rgate: um.pop_sel()?,
                        label: um.pop()?,
                        credits: um.pop()?,
                    },
                    _ => return Err(Code::InvArgs),
                };
                Syscall::CreateGate { dst, spec }
            }
            Operation::CreateVpe => {
                let dst = um.pop_sel()?;
                let isa = match um.pop()? {
                    ANY => None,
                    v => Some(Isa::from_u64(v).ok_or(Code::InvArgs)?),
                };
                Syscall::CreateVpe {
                    dst,
                    isa,
                    muxable: um.pop_bool()?,
                    name: um.pop_name()?,
                }
            }
            Operation::CreateMap => Syscall::CreateMap {
                dst: um.pop_sel()?,
                vpe: um.pop_sel()?,
                mgate: um.pop_sel()?,
                first: um.pop()?,
                pages: um.pop_u32()?,
                perms: pop_perms(&mut um)?,
            },
            Operation::AttachRb => Syscall::AttachRb {
                vpe: um.pop_sel()?,
                ep: pop_ep(&mut um)?,
                addr: um.pop()?,
                order: um.pop_u32()?,
                msg_order: um.pop_u32()?,
            },
            Operation::DetachRb => Syscall::DetachRb {
                vpe: um.pop_sel()?,
                ep: pop_ep(&mut um)?,
            },
            Operation::Exchange => Syscall::Exchange {
                vpe: um.pop_sel()?,
                own: CapRngDesc::from_raw(um.pop()?),
                other: um.pop_sel()?,
                obtain: um.pop_bool()?,
            },
            Operation::VpeCtrl => {
                let vpe = um.pop_sel()?;
                let op = match um.pop()? {
                    0 => VpeOp::Start,
                    1 => VpeOp::Stop,
                    2 => VpeOp::Yield,
                    3 => VpeOp::Wait,
                    _ => return Err(Code::InvArgs),
                };
                Syscall::VpeCtrl {
                    vpe,
                    op,
                    arg: um.pop()?,
                }
            }
            Operation::Delegate | Operation::Obtain => {
                let sess = um.pop_sel()?;
                let crd = CapRngDesc::from_raw(um.pop()?);
                let args = pop_args(&mut um)?;
                if op == Operation::Delegate {
                    Syscall::Delegate { sess, crd, args }
                } else {
                    Syscall::Obtain { sess, crd, args }
                }
            }
            Operation::Activate => Syscall::Activate {
                vpe: um.pop_sel()?,
                gate: um.pop_sel()?,
                ep: pop_ep(&mut um)?,
                addr: um.pop()?,
            },
            Operation::ReqMem => Syscall::ReqMem {
                dst: um.pop_sel()?,
                addr: match um.pop()? {
                    ANY => None,
                    a => Some(a),
                },
                size: um.pop()?,
                perms: pop_perms(&mut um)?,
            },
            Operation::DeriveMem => Syscall::DeriveMem {
                src: um.pop_sel()?,
                dst: um.pop_sel()?,
                offset: um.pop()?,
                size: um.pop()?,
                perms: pop_perms(&mut um)?,
            },
            Operation::Revoke => Syscall::Revoke {
                vpe: um.pop_sel()?,
                crd: CapRngDesc::from_raw(um.pop()?),
                own: um.pop_bool()?,
                kind: match um.pop()? {
                    0 => RangeKind::Obj,
                    1 => RangeKind::Map,
                    _ => return Err(Code::InvArgs),
                },
            },
            Operation::Exit => Syscall::Exit {
                code: um.pop()? as i64 as i32,
            },
            Operation::Noop => Syscall::Noop,
            Operation::ForwardMsg => Syscall::ForwardMsg {
                sgate: um.pop_sel()?,
                rgate: um.pop_sel()?,
                rlabel: um.pop()?,
                data: um.pop_bytes(MAX_FWD_SIZE)?,
            },
            Operation::ForwardMem => {
                let mgate = um.pop_sel()?;
                let offset = um.pop()?;
                let op = match um.pop()? {
                    0 => {
                        let len = um.pop_u32()?;
                        if len as usize > MAX_FWD_SIZE {
                            return Err(Code::InvArgs);
                        }
                        MemOp::Read { len }
                    }
                    FWD_MEM_WRITE => MemOp::Write(um.pop_bytes(MAX_FWD_SIZE)?),
                    _ => return Err(Code::InvArgs),
                };
                Syscall::ForwardMem { mgate, offset, op }
            }
            Operation::ForwardReply => Syscall::ForwardReply {
                rgate: um.pop_sel()?,
                msgaddr: um.pop()?,
                data: um.pop_bytes(MAX_FWD_SIZE)?,
            },
        };
        um.finish()?;
        Ok(sys)
    }

    /// Encode for sending to the kernel
    pub fn encode(&self) -> Vec<u8> {
        let mut m = Marshaller::new();
        m.push(self.operation() as u64);
        match self {
            Syscall::CreateSrv { dst, rgate, name } => {
                m.push(*dst as u64).push(*rgate as u64).push_str(name);
            }
            Syscall::CreateSess { dst, name, arg } => {
                m.push(*dst as u64).push(*arg).push_str(name);
            }
            Syscall::CreateGate { dst, spec } => {
                m.push(*dst as u64);
                match spec {
                    GateSpec::Recv { order, msg_order } => {
                        m.push(0).push(*order as u64).push(*msg_order as u64);
                    }
                    GateSpec::Send {
                        rgate,
                        label,
                        credits,
                    } => {
                        m.push(1).push(*rgate as u64).push(*label).push(*credits);
                    }
                }
            }
            Syscall::CreateVpe {
                dst,
                name,
                isa,
                muxable,
            } => {
                m.push(*dst as u64)
                    .push(isa.map_or(ANY, |i| i as u64))
                    .push(*muxable as u64)
                    .push_str(name);
            }
            Syscall::CreateMap {
                dst,
                vpe,
                mgate,
                first,
                pages,
                perms,
            } => {
                m.push(*dst as u64)
                    .push(*vpe as u64)
                    .push(*mgate as u64)
                    .push(*first)
                    .push(*pages as u64)
                    .push(perms.bits() as u64);
            }
            Syscall::AttachRb {
                vpe,
                ep,
                addr,
                order,
                msg_order,
            } => {
                m.push(*vpe as u64)
                    .push(*ep as u64)
                    .push(*addr)
                    .push(*order as u64)
                    .push(*msg_order as u64);
            }
            Syscall::DetachRb { vpe, ep } => {
                m.push(*vpe as u64).push(*ep as u64);
            }
            Syscall::Exchange {
                vpe,
                own,
                other,
                obtain,
            } => {
                m.push(*vpe as u64)
                    .push(own.raw())
                    .push(*other as u64)
                    .push(*obtain as u64);
            }
            Syscall::VpeCtrl { vpe, op, arg } => {
                m.push(*vpe as u64).push(*op as u64).push(*arg);
            }
            Syscall::Delegate { sess, crd, args } | Syscall::Obtain { sess, crd, args } => {
                m.push(*sess as u64).push(crd.raw()).push(args.len() as u64);
                for a in args {
                    m.push(*a);
                }
            }
            Syscall::Activate {
                vpe,
                gate,
                ep,
                addr,
            } => {
                m.push(*vpe as u64)
                    .push(*gate as u64)
                    .push(*ep as u64)
                    .push(*addr);
            }
            Syscall::ReqMem {
                dst,
                addr,
                size,
                perms,
            } => {
                m.push(*dst as u64)
                    .push(addr.unwrap_or(ANY))
                    .push(*size)
                    .push(perms.bits() as u64);
            }
            Syscall::DeriveMem {
                src,
                dst,
                offset,
                size,
                perms,
            } => {
                m.push(*src as u64)
                    .push(*dst as u64)
                    .push(*offset)
                    .push(*size)
                    .push(perms.bits() as u64);
            }
            Syscall::Revoke {
                vpe,
                crd,
                own,
                kind,
            } => {
                m.push(*vpe as u64)
                    .push(crd.raw())
                    .push(*own as u64)
                    .push(*kind as u64);
            }
            Syscall::Exit { code } => {
                m.push(*code as i64 as u64);
            }
            Syscall::Noop => {}
            Syscall::ForwardMsg {
                sgate,
                rgate,
                rlabel,
                data,
            } => {
                m.push(*sgate as u64)
                    .push(*rgate as u64)
                    .push(*rlabel)
                    .push_bytes(data);
            }
            Syscall::ForwardMem { mgate, offset, op } => {
                m.push(*mgate as u64).push(*offset);
                match op {
                    MemOp::Read { len } => {
                        m.push(0).push(*len as u64);
                    }
                    MemOp::Write(data) => {
                        m.push(FWD_MEM_WRITE).push_bytes(data);
                    }
                }
            }
            Syscall::ForwardReply {
                rgate,
                msgaddr,
                data,
            } => {
                m.push(*rgate as u64).push(*msgaddr).push_bytes(data);
            }
        }
        m.finish()
    }

    /// Opcode and the first four argument words, for the audit trail
    pub fn audit_words(msg: &[u8]) -> (u64, [u64; 4]) {
        let mut words = [0u64; 5];
        for (w, chunk) in words.iter_mut().zip(msg.chunks_exact(8)) {
            let mut b = [0u8; 8];
            b.copy_from_slice(chunk);
            *w = u64::from_le_bytes(b);
        }
        (words[0], [words[1], words[2], words[3], words[4]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    #[test]
    fn test_decode_matches_encode() {
        let calls = vec![
            Syscall::CreateSrv {
                dst: 4,
                rgate: 3,
                name: "pipes".to_string(),
            },
            Syscall::CreateVpe {
                dst: 10,
                name: "child".to_string(),
                isa: None,
                muxable: true,
            },
            Syscall::Obtain {
                sess: 5,
                crd: CapRngDesc::new(20, 2),
                args: vec![1, 2, 3],
            },
            Syscall::ReqMem {
                dst: 6,
                addr: Some(0x4000),
                size: 0x1000,
                perms: Perm::RW,
            },
            Syscall::Exit { code: -3 },
            Syscall::ForwardMsg {
                sgate: 7,
                rgate: u32::MAX,
                rlabel: 0x33,
                data: b"ping".to_vec(),
            },
            Syscall::ForwardMem {
                mgate: 4,
                offset: 0x80,
                op: MemOp::Write(vec![1, 2, 3, 4, 5, 6, 7, 8, 9]),
            },
            Syscall::ForwardMem {
                mgate: 4,
                offset: 0,
                op: MemOp::Read { len: 16 },
            },
            Syscall::ForwardReply {
                rgate: 2,
                msgaddr: 0x3FC0_1100,
                data: vec![],
            },
        ];
        for sys in calls {
            assert_eq!(Syscall::decode(&sys.encode()), Ok(sys));
        }
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        let msg = Marshaller::new().push(99).finish();
        assert_eq!(Syscall::decode(&msg), Err(Code::InvArgs));
        assert_eq!(Syscall::decode(&[]), Err(Code::InvArgs));
    }

    #[test]
    fn test_decode_rejects_truncated_and_trailing() {
        let full = Syscall::Activate {
            vpe: 0,
            gate: 4,
            ep: 3,
            addr: 0,
        }
        .encode();
        assert_eq!(Syscall::decode(&full[..full.len() - 8]), Err(Code::InvArgs));

        let mut long = full.clone();
        long.extend_from_slice(&[0u8; 8]);
        assert_eq!(Syscall::decode(&long), Err(Code::InvArgs));
    }

    #[test]
    fn test_decode_rejects_bad_fields() {
        // unknown permission bits
        let msg = Marshaller::new()
            .push(Operation::ReqMem as u64)
            .push(4)
            .push(ANY)
            .push(0x1000)
            .push(0x10)
            .finish();
        assert_eq!(Syscall::decode(&msg), Err(Code::InvArgs));

        // selector beyond 32 bits
        let msg = Marshaller::new()
            .push(Operation::DetachRb as u64)
            .push(1 << 40)
            .push(2)
            .finish();
        assert_eq!(Syscall::decode(&msg), Err(Code::InvArgs));

        // too many exchange arguments
        let mut m = Marshaller::new();
        m.push(Operation::Delegate as u64).push(1).push(CapRngDesc::single(3).raw());
        m.push(MAX_EXCHG_ARGS as u64 + 1);
        for i in 0..=MAX_EXCHG_ARGS {
            m.push(i as u64);
        }
        assert_eq!(Syscall::decode(&m.finish()), Err(Code::InvArgs));
    }

    #[test]
    fn test_forward_payloads_are_bounded() {
        let big = Syscall::ForwardMsg {
            sgate: 3,
            rgate: 4,
            rlabel: 0,
            data: vec![0xAA; MAX_FWD_SIZE + 1],
        };
        assert_eq!(Syscall::decode(&big.encode()), Err(Code::InvArgs));

        let read = Marshaller::new()
            .push(Operation::ForwardMem as u64)
            .push(4)
            .push(0)
            .push(0)
            .push(MAX_FWD_SIZE as u64 + 1)
            .finish();
        assert_eq!(Syscall::decode(&read), Err(Code::InvArgs));

        // no-pagefault flag is not supported
        let flags = Marshaller::new()
            .push(Operation::ForwardMem as u64)
            .push(4)
            .push(0)
            .push(1)
            .push(8)
            .finish();
        assert_eq!(Syscall::decode(&flags), Err(Code::InvArgs));
    }

    #[test]
    fn test_audit_words() {
        let msg = Syscall::DeriveMem {
            src: 1,
            dst: 2,
            offset: 3,
            size: 4,
            perms: Perm::R,
        }
        .encode();
        assert_eq!(
            Syscall::audit_words(&msg),
            (Operation::DeriveMem as u64, [1, 2, 3, 4])
        );
        assert_eq!(Syscall::audit_words(&[]), (0, [0; 4]));
    }
}
