//! Requests the kernel sends to services
//!
//! Services answer with a regular reply (`[code, values...]`):
//!
//! | request    | reply values                          |
//! |------------|---------------------------------------|
//! | `Open`     | `[ident]`                             |
//! | `Obtain`   | `[crd, args...]` caps to hand out     |
//! | `Delegate` | `[crd, args...]` where to put the caps |
//! | `Close`    | ignored                               |
//! | `Shutdown` | ignored                               |

use alloc::vec::Vec;

use super::{Marshaller, Unmarshaller, MAX_EXCHG_ARGS};
use crate::error::Code;

/// Opcodes of kernel-to-service requests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum ServiceOp {
    Open = 0,
    Obtain = 1,
    Delegate = 2,
    Close = 3,
    Shutdown = 4,
}

/// A request to a service
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceCmd {
    Open { arg: u64 },
    Obtain { ident: u64, count: u32, args: Vec<u64> },
    Delegate { ident: u64, count: u32, args: Vec<u64> },
    Close { ident: u64 },
    Shutdown,
}

impl ServiceCmd {
    pub fn op(&self) -> ServiceOp {
        match self {
            ServiceCmd::Open { .. } => ServiceOp::Open,
            ServiceCmd::Obtain { .. } => ServiceOp::Obtain,
            ServiceCmd::Delegate { .. } => ServiceOp::Delegate,
            ServiceCmd::Close { .. } => ServiceOp::Close,
            ServiceCmd::Shutdown => ServiceOp::Shutdown,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut m = Marshaller::new();
        m.push(self.op() as u64);
        match self {
            ServiceCmd::Open { arg } => {
                m.push(*arg);
            }
            ServiceCmd::Obtain { ident, count, args }
            | ServiceCmd::Delegate { ident, count, args } => {
                m.push(*ident).push(*count as u64).push(args.len() as u64);
                for a in args {
                    m.push(*a);
                }
            }
            ServiceCmd::Close { ident } => {
                m.push(*ident);
            }
            ServiceCmd::Shutdown => {}
        }
        m.finish()
    }

    /// Decode a request (the service side of the protocol)
    pub fn decode(msg: &[u8]) -> Result<Self, Code> {
        let mut um = Unmarshaller::new(msg)?;
        let cmd = match um.pop()? {
            0 => ServiceCmd::Open { arg: um.pop()? },
            op @ (1 | 2) => {
                let ident = um.pop()?;
                let count = um.pop_u32()?;
                let n = um.pop()? as usize;
                if n > MAX_EXCHG_ARGS {
                    return Err(Code::InvArgs);
                }
                let args = (0..n).map(|_| um.pop()).collect::<Result<Vec<_>, _>>()?;
                if op == 1 {
                    ServiceCmd::Obtain { ident, count, args }
                } else {
                    ServiceCmd::Delegate { ident, count, args }
                }
            }
            3 => ServiceCmd::Close { ident: um.pop()? },
            4 => ServiceCmd::Shutdown,
            _ => return Err(Code::InvArgs),
        };
        um.finish()?;
        Ok(cmd)
    }
}
