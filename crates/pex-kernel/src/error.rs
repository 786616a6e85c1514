//! Kernel error codes
//!
//! Every capability, VPE and syscall operation reports failures as a [`Code`].
//! The syscall layer sends the numeric value back to the issuing VPE; the
//! kernel never aborts because of a malformed request.

use pex_dtu::DtuError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes returned to VPEs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[repr(u64)]
pub enum Code {
    /// Malformed arguments or ranges
    #[error("invalid arguments")]
    InvArgs = 1,
    /// Duplicate selector or service name
    #[error("already exists")]
    Exists = 2,
    /// Absent capability, service or VPE
    #[error("not found")]
    NotFound = 3,
    /// Selector space or VPE slots exhausted
    #[error("no space left")]
    NoSpace = 4,
    /// Memory allocator exhausted
    #[error("out of memory")]
    OutOfMem = 5,
    /// Requested rights exceed the capability's
    #[error("no permission")]
    NoPerm = 6,
    /// Operation unsupported on this PE variant
    #[error("not supported")]
    NotSup = 7,
    /// No PE matches the request
    #[error("no free PE")]
    NoFreePe = 8,
    /// The object went away while the operation was in flight
    #[error("object gone")]
    Gone = 9,
    /// Revocation must wait for outstanding service requests
    #[error("pending sessions")]
    Pending = 10,
}

impl Code {
    pub fn from_u64(v: u64) -> Option<Self> {
        Some(match v {
            1 => Code::InvArgs,
            2 => Code::Exists,
            3 => Code::NotFound,
            4 => Code::NoSpace,
            5 => Code::OutOfMem,
            6 => Code::NoPerm,
            7 => Code::NotSup,
            8 => Code::NoFreePe,
            9 => Code::Gone,
            10 => Code::Pending,
            _ => return None,
        })
    }

    /// Transient failures are retried by the kernel instead of being reported
    pub fn is_transient(self) -> bool {
        self == Code::Pending
    }
}

impl From<DtuError> for Code {
    fn from(e: DtuError) -> Self {
        match e {
            DtuError::InvalidPe | DtuError::InvalidEp | DtuError::OutOfBounds => Code::InvArgs,
            DtuError::NoReceiver => Code::Gone,
            DtuError::NotSupported => Code::NotSup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_numbers_roundtrip() {
        for v in 1..=10 {
            let code = Code::from_u64(v).unwrap();
            assert_eq!(code as u64, v);
        }
        assert_eq!(Code::from_u64(0), None);
        assert_eq!(Code::from_u64(11), None);
    }

    #[test]
    fn test_dtu_error_mapping() {
        assert_eq!(Code::from(DtuError::OutOfBounds), Code::InvArgs);
        assert_eq!(Code::from(DtuError::NoReceiver), Code::Gone);
        assert!(Code::Pending.is_transient());
        assert!(!Code::InvArgs.is_transient());
    }
}
