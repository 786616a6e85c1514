//! Platform description
//!
//! Lists the PEs of the machine and the context-switching policy. A platform
//! is normally loaded from JSON at boot:
//!
//! ```json
//! {
//!   "pes": [
//!     { "ty": "Comp", "isa": "X86", "mem_size": 1048576, "flags": "CTXSW" },
//!     { "ty": "Mem", "isa": "None", "mem_size": 67108864, "flags": "" }
//!   ],
//!   "switching": { "time_slice": 6000000 }
//! }
//! ```

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::PeId;

/// Kind of processing element
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeType {
    /// Compute core
    Comp,
    /// Memory-only tile
    Mem,
}

/// Instruction set of a compute PE
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Isa {
    None,
    X86,
    Arm,
    Xtensa,
    Accel,
}

impl Isa {
    pub fn from_u64(v: u64) -> Option<Self> {
        Some(match v {
            0 => Isa::None,
            1 => Isa::X86,
            2 => Isa::Arm,
            3 => Isa::Xtensa,
            4 => Isa::Accel,
            _ => return None,
        })
    }
}

bitflags! {
    /// PE capabilities
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PeFlags: u32 {
        /// Runs a switching agent; VPEs can be multiplexed
        const CTXSW = 1 << 0;
        /// DTU-side virtual memory
        const VM = 1 << 1;
    }
}

/// Description of one PE
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeDesc {
    pub ty: PeType,
    pub isa: Isa,
    /// Local memory (compute PEs) or module size (memory PEs) in bytes
    pub mem_size: u64,
    #[serde(default = "PeFlags::empty")]
    pub flags: PeFlags,
}

impl PeDesc {
    pub fn comp(isa: Isa, mem_size: u64, flags: PeFlags) -> Self {
        Self {
            ty: PeType::Comp,
            isa,
            mem_size,
            flags,
        }
    }

    pub fn memory(mem_size: u64) -> Self {
        Self {
            ty: PeType::Mem,
            isa: Isa::None,
            mem_size,
            flags: PeFlags::empty(),
        }
    }

    pub fn is_memory(&self) -> bool {
        self.ty == PeType::Mem
    }

    pub fn supports_ctxsw(&self) -> bool {
        self.flags.contains(PeFlags::CTXSW)
    }

    pub fn has_vm(&self) -> bool {
        self.flags.contains(PeFlags::VM)
    }

    /// Whether a VPE built for `self` can run on `other`
    pub fn is_compatible(&self, other: &PeDesc) -> bool {
        self.ty == other.ty && self.isa == other.isa
    }
}

/// Context-switching policy (times in cycles)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// Length of a time slice when other VPEs are ready
    pub time_slice: u64,
    /// First delay before polling the switching agent
    pub init_wait_time: u64,
    /// Upper bound of the exponential polling backoff
    pub max_wait_time: u64,
    /// Polls without acknowledgement before the PE is given up
    pub max_poll_retries: u32,
    /// Hand preempted VPEs to idle compatible PEs
    pub migration: bool,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            time_slice: 6_000_000,
            init_wait_time: 100,
            max_wait_time: 100_000,
            max_poll_retries: 16,
            migration: false,
        }
    }
}

/// Errors while loading a platform description
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("malformed platform description: {0}")]
    Parse(String),
    #[error("PE 0 must be a compute PE for the kernel")]
    NoKernelPe,
    #[error("no memory PE")]
    NoMemory,
    #[error("PE {0} has no memory")]
    EmptyPe(PeId),
    #[error("polling backoff: init_wait_time must be non-zero and not exceed max_wait_time")]
    BadBackoff,
    #[error("time slice must be non-zero")]
    ZeroTimeSlice,
}

/// Machine description
///
/// PE 0 always runs the kernel itself and never hosts VPEs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub pes: Vec<PeDesc>,
    #[serde(default)]
    pub switching: SwitchConfig,
}

/// Id of the PE that runs the kernel
pub const KERNEL_PE: PeId = 0;

impl Platform {
    pub fn new(pes: Vec<PeDesc>, switching: SwitchConfig) -> Result<Self, ConfigError> {
        let p = Self { pes, switching };
        p.validate()?;
        Ok(p)
    }

    /// Parse and validate a JSON platform description
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let p: Platform =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        p.validate()?;
        Ok(p)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.pes.first() {
            Some(pe) if pe.ty == PeType::Comp => {}
            _ => return Err(ConfigError::NoKernelPe),
        }
        if !self.pes.iter().any(|p| p.is_memory()) {
            return Err(ConfigError::NoMemory);
        }
        if let Some(id) = self.pes.iter().position(|p| p.mem_size == 0) {
            return Err(ConfigError::EmptyPe(id));
        }
        let sw = &self.switching;
        if sw.init_wait_time == 0 || sw.init_wait_time > sw.max_wait_time {
            return Err(ConfigError::BadBackoff);
        }
        if sw.time_slice == 0 {
            return Err(ConfigError::ZeroTimeSlice);
        }
        Ok(())
    }

    pub fn pe(&self, id: PeId) -> Option<&PeDesc> {
        self.pes.get(id)
    }

    pub fn pe_count(&self) -> usize {
        self.pes.len()
    }

    /// Compute PEs available for VPEs
    pub fn user_pes(&self) -> impl Iterator<Item = (PeId, &PeDesc)> {
        self.pes
            .iter()
            .enumerate()
            .filter(|(id, p)| *id != KERNEL_PE && !p.is_memory())
    }

    pub fn memory_pes(&self) -> impl Iterator<Item = (PeId, &PeDesc)> {
        self.pes.iter().enumerate().filter(|(_, p)| p.is_memory())
    }
}
