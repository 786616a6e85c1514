//! Data Transfer Unit abstraction for the pex kernel
//!
//! Every processing element (PE) of the machine carries a DTU: a small
//! hardware unit that provides message-passing and remote-memory endpoints.
//! The kernel never touches a DTU directly. It goes through the [`Dtu`] trait
//! defined here, so that simulated, cycle-accurate and real backends look
//! identical from the kernel's perspective.
//!
//! # Layout
//!
//! - [`ep`]: endpoint descriptors and their three-register encoding
//! - [`regs`]: the DTU register file image that is saved and restored when
//!   a VPE is switched out and back in
//! - [`flags`]: bit sets shared between the kernel and the switching agent
//! - [`msg`]: the header the DTU puts in front of every received message

#![no_std]

extern crate alloc;

pub mod ep;
pub mod flags;
pub mod msg;
pub mod regs;

pub use ep::{EpDesc, EpType, MemEp, RecvEp, SendEp};
pub use flags::{DtuFeatures, Perm, PteFlags, RctMuxFlags};
pub use msg::{HeaderFlags, MsgHeader, HEADER_SIZE};
pub use regs::{ep_offset, DtuReg, DtuRegs, ExtCmd, DTU_REGS};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Index of a physical processing element
pub type PeId = usize;
/// Kernel-assigned VPE identifier as seen by the DTU
pub type VpeId = u16;
/// Endpoint index within a DTU
pub type EpId = usize;
/// Message label carried by send endpoints
pub type Label = u64;

/// VPE id that denotes "no VPE", used while a PE is between two VPEs
pub const INVALID_VPE: VpeId = 0xFFFF;

/// Number of endpoints per DTU
pub const EP_COUNT: usize = 16;
/// Number of 64-bit registers per endpoint
pub const EP_REGS: usize = 3;

/// Page size of the DTU's translation
pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// PE-local address of the DTU register window
pub const DTU_BASE_ADDR: u64 = 0xF000_0000;

/// PE-local entry point of the switching agent
pub const RCTMUX_ENTRY: u64 = 0x1000;
/// PE-local word holding the voluntary-yield policy of the resident VPE
pub const RCTMUX_YIELD: u64 = 0x1FF0;
/// PE-local word used to exchange [`RctMuxFlags`] with the switching agent
pub const RCTMUX_FLAGS: u64 = 0x1FF8;

/// Start of the per-VPE region reserved for receive buffers
pub const RECVBUF_SPACE: u64 = 0x3FC0_0000;
/// Size of the receive buffer region
pub const RECVBUF_SIZE: u64 = 64 * 1024;
/// Size of the syscall reply buffer at the start of the receive region
pub const SYSC_RBUF_SIZE: u64 = 1 << 9;

/// Addresses a VPE on a PE.
///
/// Remote accesses are always performed on behalf of a VPE; `vpe` may be
/// [`INVALID_VPE`] when the PE is between two VPEs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VpeDesc {
    pub pe: PeId,
    pub vpe: VpeId,
}

impl VpeDesc {
    pub fn new(pe: PeId, vpe: VpeId) -> Self {
        Self { pe, vpe }
    }

    /// Descriptor that addresses the PE itself rather than a VPE on it
    pub fn pe_only(pe: PeId) -> Self {
        Self {
            pe,
            vpe: INVALID_VPE,
        }
    }
}

/// DTU abstraction trait
///
/// Implementations provide register-level access to the DTUs of all PEs:
/// - Remote memory access (including the register window at [`DTU_BASE_ADDR`])
/// - Endpoint programming
/// - Interrupt injection and core wakeup
/// - Page mapping for PEs with DTU-side translation
/// - Message delivery from the kernel to a VPE, or on behalf of another VPE
///
/// All methods take `&self`; backends use interior mutability. The kernel is
/// single-threaded and calls one method at a time.
pub trait Dtu: 'static {
    // === Time ===

    /// Current time in cycles (monotonic)
    fn time(&self) -> u64;

    // === Remote Memory ===

    /// Read `buf.len()` bytes at `addr` from the memory of `vpe.pe`
    ///
    /// # Returns
    /// * `Ok(())` - Read complete
    /// * `Err(DtuError::InvalidPe)` - No such PE
    /// * `Err(DtuError::OutOfBounds)` - Range exceeds the PE's memory
    fn read_mem(&self, vpe: VpeDesc, addr: u64, buf: &mut [u8]) -> Result<(), DtuError>;

    /// Write `data` at `addr` into the memory of `vpe.pe`
    fn write_mem(&self, vpe: VpeDesc, addr: u64, data: &[u8]) -> Result<(), DtuError>;

    // === Endpoints ===

    /// Configure a receive endpoint on a remote DTU
    fn config_recv(&self, vpe: VpeDesc, ep: EpId, desc: &RecvEp) -> Result<(), DtuError>;

    /// Configure a send endpoint on a remote DTU
    fn config_send(&self, vpe: VpeDesc, ep: EpId, desc: &SendEp) -> Result<(), DtuError>;

    /// Configure a memory endpoint on a remote DTU
    fn config_mem(&self, vpe: VpeDesc, ep: EpId, desc: &MemEp) -> Result<(), DtuError>;

    /// Invalidate a single endpoint
    fn invalidate_ep(&self, vpe: VpeDesc, ep: EpId) -> Result<(), DtuError>;

    /// Invalidate all endpoints starting at `first`
    fn invalidate_eps(&self, vpe: VpeDesc, first: EpId) -> Result<(), DtuError> {
        for ep in first..EP_COUNT {
            self.invalidate_ep(vpe, ep)?;
        }
        Ok(())
    }

    // === Core Control ===

    /// Raise an interrupt at the PE's core (enters the switching agent)
    fn inject_irq(&self, vpe: VpeDesc) -> Result<(), DtuError>;

    /// Wake the PE's core if it sleeps
    fn wakeup(&self, vpe: VpeDesc) -> Result<(), DtuError>;

    /// Put the PE's core to sleep
    fn suspend(&self, vpe: VpeDesc) -> Result<(), DtuError>;

    /// Reset the PE's core and let it start at `entry`
    fn reset(&self, vpe: VpeDesc, entry: u64) -> Result<(), DtuError> {
        let cmd = ExtCmd::Reset as u64 | (entry << 3);
        self.write_mem(
            vpe,
            DTU_BASE_ADDR + DtuReg::ExtCmd.offset(),
            &cmd.to_le_bytes(),
        )
    }

    // === Translation ===

    /// Insert a translation into the DTU's TLB of the given VPE
    fn map_page(&self, vpe: VpeDesc, virt: u64, phys: u64, flags: PteFlags)
        -> Result<(), DtuError>;

    /// Remove a translation from the DTU's TLB of the given VPE
    fn unmap_page(&self, vpe: VpeDesc, virt: u64) -> Result<(), DtuError>;

    // === Messaging ===

    /// Deliver a message from the kernel to `ep` of `vpe`
    ///
    /// `reply_label` is handed back by the receiver when it replies.
    fn send_to(
        &self,
        vpe: VpeDesc,
        ep: EpId,
        label: Label,
        reply_label: Label,
        msg: &[u8],
    ) -> Result<(), DtuError>;

    /// Deliver a message to `ep` of `vpe` on behalf of another VPE
    ///
    /// The receiver sees `hdr` as if the sender's DTU had written it.
    fn forward_to(&self, vpe: VpeDesc, ep: EpId, hdr: &MsgHeader, msg: &[u8]) -> Result<(), DtuError>;

    /// Reply to a message the kernel received from `vpe`
    fn reply(&self, vpe: VpeDesc, label: Label, msg: &[u8]) -> Result<(), DtuError>;
}

/// DTU errors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DtuError {
    /// The addressed PE does not exist
    #[error("invalid PE")]
    InvalidPe,
    /// Endpoint index out of range
    #[error("invalid endpoint")]
    InvalidEp,
    /// Access exceeds the target memory
    #[error("access out of bounds")]
    OutOfBounds,
    /// The receiving endpoint is not configured or full
    #[error("no receiver")]
    NoReceiver,
    /// Operation not supported by the backend
    #[error("not supported")]
    NotSupported,
}

/// Encode a word for the switching agent: flags in the low half, PE id in the high half
pub fn rctmux_word(flags: RctMuxFlags, pe: PeId) -> u64 {
    flags.bits() | ((pe as u64) << 32)
}
