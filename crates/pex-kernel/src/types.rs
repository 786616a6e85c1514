//! Core type definitions for the kernel

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub use pex_dtu::{EpId, Label, PeId, Perm, VpeId, EP_COUNT, INVALID_VPE, PAGE_BITS, PAGE_SIZE};

/// Capability selector, unique within one capability table
pub type CapSel = u32;

/// Selector meaning "none"
pub const INVALID_SEL: CapSel = CapSel::MAX;

/// Every VPE's own VPE capability
pub const SEL_VPE: CapSel = 0;
/// Every VPE's address-space memory capability
pub const SEL_MEM: CapSel = 1;
/// First selector available to syscalls
pub const FIRST_FREE_SEL: CapSel = 2;

/// Maximum number of VPEs (including the per-PE idle VPEs)
pub const MAX_VPES: usize = 64;

/// Send endpoint towards the kernel's syscall receive gate
pub const SYSC_SEP: EpId = 0;
/// Receive endpoint for syscall replies
pub const SYSC_REP: EpId = 1;
/// First endpoint a VPE may activate gates on
pub const FIRST_FREE_EP: EpId = 2;

/// Syscall receive gates of the kernel, on endpoints `0..SYSC_GATES` of its PE
pub const SYSC_GATES: usize = 4;
/// Message slots per syscall receive gate; one per VPE
pub const SYSC_SLOTS_PER_GATE: usize = MAX_VPES / SYSC_GATES;

/// Message slot size of the syscall reply buffer
pub const SYSC_MSG_ORDER: u32 = 9;
/// Credits of a VPE's syscall send endpoint
pub const SYSC_CREDITS: u64 = 1;

/// Largest receive buffer order a gate may request
pub const MAX_RBUF_ORDER: u32 = 20;

/// Bits of a global address that hold the PE-local offset
pub const GLOB_OFF_BITS: u32 = 48;

/// Build a machine-wide physical address from a PE id and a PE-local offset
pub const fn glob_addr(pe: PeId, off: u64) -> u64 {
    ((pe as u64) << GLOB_OFF_BITS) | (off & ((1 << GLOB_OFF_BITS) - 1))
}

/// Split a global address into PE id and offset
pub const fn glob_split(addr: u64) -> (PeId, u64) {
    (
        (addr >> GLOB_OFF_BITS) as PeId,
        addr & ((1 << GLOB_OFF_BITS) - 1),
    )
}

/// A contiguous range of capability selectors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapRngDesc {
    pub start: CapSel,
    pub count: u32,
}

impl CapRngDesc {
    pub fn new(start: CapSel, count: u32) -> Self {
        Self { start, count }
    }

    /// Range covering a single selector
    pub fn single(sel: CapSel) -> Self {
        Self::new(sel, 1)
    }

    /// One past the last selector; `None` if the range overflows
    pub fn end(&self) -> Option<CapSel> {
        self.start.checked_add(self.count)
    }

    pub fn contains(&self, sel: CapSel) -> bool {
        sel >= self.start && (sel - self.start) < self.count
    }

    /// Wire format: count in the upper half, start in the lower half
    pub fn raw(&self) -> u64 {
        ((self.count as u64) << 32) | self.start as u64
    }

    pub fn from_raw(raw: u64) -> Self {
        Self::new(raw as u32, (raw >> 32) as u32)
    }
}

/// VPE lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VpeState {
    Running,
    Suspended,
    Dead,
}

bitflags! {
    /// VPE flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct VpeFlags: u32 {
        /// Started by the kernel at boot
        const BOOTMOD = 1 << 0;
        /// The per-PE idle VPE
        const IDLE = 1 << 1;
        /// Has never run; memory must be initialized on first restore
        const INIT = 1 << 2;
        /// An application has been started
        const HASAPP = 1 << 3;
        /// May share its PE with other VPEs
        const MUXABLE = 1 << 4;
        /// Sits in a ready queue
        const READY = 1 << 5;
        /// Provides a service; does not keep the system alive
        const DAEMON = 1 << 6;
        /// Its DTU state is currently loaded on its PE
        const RESIDENT = 1 << 7;
    }
}
