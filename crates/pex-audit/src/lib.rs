//! Audit trail for the pex kernel
//!
//! Every syscall a VPE issues is recorded as a request event; the reply,
//! which may be sent much later for suspending syscalls, is recorded as a
//! response event referring back to the request.

#![no_std]

extern crate alloc;

pub mod syslog;

pub use syslog::{EventId, SysEvent, SysEventType, SysLog, MAX_SYSLOG_EVENTS};
