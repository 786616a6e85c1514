//! pex kernel core
//!
//! The kernel of a machine made of processing elements (PEs) that talk to
//! each other only through their DTUs. Applications run in VPEs (virtual
//! PEs); the kernel hands out capabilities for everything a VPE may use and
//! multiplexes VPEs on PEs that support context switching.
//!
//! The crate is a single-threaded state machine. It owns no thread and no
//! clock: a driver feeds it syscall messages, service replies and timer
//! ticks (see [`Kernel`]), and every effect on the machine goes through the
//! [`pex_dtu::Dtu`] trait.
//!
//! # Module Organization
//!
//! - `cap` - Capability kinds, the capability arena and its treaps
//! - `pes` - VPEs, the per-PE context switcher and the PE manager
//! - `mem` - Main memory allocation and VPE address spaces
//! - `com` - Services and their request queues
//! - `kif` - Syscall and service message formats
//! - `kernel` - The kernel state and its work loop
//! - `invariants` - Runtime-checkable invariants for tests

#![no_std]
extern crate alloc;

pub mod cap;
pub mod com;
pub mod error;
pub mod invariants;
pub mod kernel;
pub mod kif;
pub mod mem;
pub mod pes;
pub mod platform;
mod syscalls;
pub mod types;

pub use error::Code;
pub use invariants::{check_all_invariants, InvariantViolation};
pub use kernel::{BootError, BootModule, Kernel, SyscallOutcome, STOPPED_EXIT_CODE};
pub use kif::{GateSpec, MemOp, RangeKind, Syscall, VpeOp};
pub use platform::{Isa, PeDesc, PeFlags, PeType, Platform, SwitchConfig};
pub use types::{CapRngDesc, CapSel, VpeFlags, VpeId, VpeState};
