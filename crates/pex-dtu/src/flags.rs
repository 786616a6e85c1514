//! Bit sets shared between the kernel, the DTU and the switching agent

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Access permissions for memory endpoints and memory capabilities
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Perm: u32 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        const RW = Self::R.bits() | Self::W.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

bitflags! {
    /// Flags of a page-table entry
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        /// Entry points to another page table
        const INTERN = 1 << 3;
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl From<Perm> for PteFlags {
    fn from(perm: Perm) -> Self {
        PteFlags::from_bits_truncate(perm.bits() as u64)
    }
}

bitflags! {
    /// Handshake flags exchanged with the switching agent at `RCTMUX_FLAGS`
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct RctMuxFlags: u64 {
        /// Set by the agent to acknowledge a request
        const SIGNAL = 1 << 0;
        /// Save the current VPE
        const STORE = 1 << 1;
        /// Restore the VPE whose state has been written
        const RESTORE = 1 << 2;
        /// Kernel waits for an acknowledgement
        const WAITING = 1 << 3;
        /// The VPE runs for the first time
        const INIT = 1 << 4;
        /// Set by the agent if the saved VPE waits for a message
        const BLOCK = 1 << 5;
        /// Other VPEs are ready; report idle phases to the kernel
        const REPORT = 1 << 6;
    }
}

bitflags! {
    /// Contents of the DTU's FEATURES register
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DtuFeatures: u64 {
        /// Privileged DTU (only the kernel's)
        const PRIV = 1 << 0;
        /// Page faults are forwarded to a pager endpoint
        const PAGEFAULTS = 1 << 1;
    }
}
