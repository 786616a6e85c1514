//! System Event Log (SysLog)
//!
//! Records all syscalls (request + response) for audit trail. Requests of
//! suspending syscalls stay open until the kernel finally replies.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use pex_dtu::VpeId;
use serde::{Deserialize, Serialize};

/// Monotonic event identifier
pub type EventId = u64;

/// A system event (syscall request or response).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SysEvent {
    /// Unique event ID (monotonic)
    pub id: EventId,
    /// VPE that made the syscall
    pub sender: VpeId,
    /// Timestamp (cycles)
    pub timestamp: u64,
    /// Event type (request or response)
    pub event_type: SysEventType,
}

/// Type of system event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SysEventType {
    /// Syscall request from a VPE
    Request {
        /// Syscall opcode
        opcode: u64,
        /// First syscall arguments (zero-padded)
        args: [u64; 4],
    },
    /// Syscall response to a VPE
    Response {
        /// ID of the request this responds to
        request_id: EventId,
        /// Error code (0 = success)
        result: i64,
    },
}

/// Maximum number of events to keep in memory
pub const MAX_SYSLOG_EVENTS: usize = 10000;

/// System event log for auditing.
///
/// Events are append-only with monotonic IDs.
pub struct SysLog {
    /// Event entries (append-only)
    events: Vec<SysEvent>,
    /// Requests without a response yet
    open: BTreeSet<EventId>,
    /// Next event ID to assign
    next_id: EventId,
}

impl SysLog {
    /// Create a new empty SysLog.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            open: BTreeSet::new(),
            next_id: 0,
        }
    }

    /// Log a syscall request.
    ///
    /// Returns the event ID for correlating with the response.
    pub fn log_request(
        &mut self,
        sender: VpeId,
        opcode: u64,
        args: [u64; 4],
        timestamp: u64,
    ) -> EventId {
        let id = self.push(sender, timestamp, SysEventType::Request { opcode, args });
        self.open.insert(id);
        id
    }

    /// Log a syscall response.
    pub fn log_response(
        &mut self,
        sender: VpeId,
        request_id: EventId,
        result: i64,
        timestamp: u64,
    ) {
        self.open.remove(&request_id);
        self.push(
            sender,
            timestamp,
            SysEventType::Response { request_id, result },
        );
    }

    /// Get all events.
    pub fn events(&self) -> &[SysEvent] {
        &self.events
    }

    /// Requests that are still waiting for their response
    pub fn open_requests(&self) -> Vec<EventId> {
        self.open.iter().copied().collect()
    }

    /// Response to `request_id`, if it is still in memory
    pub fn response_of(&self, request_id: EventId) -> Option<i64> {
        self.events.iter().find_map(|e| match e.event_type {
            SysEventType::Response {
                request_id: r,
                result,
            } if r == request_id => Some(result),
            _ => None,
        })
    }

    /// Get events in a sequence range.
    pub fn get_range(&self, start_id: EventId, end_id: EventId) -> Vec<&SysEvent> {
        self.events
            .iter()
            .filter(|e| e.id >= start_id && e.id < end_id)
            .collect()
    }

    /// Get the most recent N events.
    pub fn get_recent(&self, count: usize) -> Vec<&SysEvent> {
        self.events.iter().rev().take(count).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn next_id(&self) -> EventId {
        self.next_id
    }

    fn push(&mut self, sender: VpeId, timestamp: u64, event_type: SysEventType) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        self.events.push(SysEvent {
            id,
            sender,
            timestamp,
            event_type,
        });
        self.trim_if_needed();
        id
    }

    /// Trim old events if exceeding max capacity.
    fn trim_if_needed(&mut self) {
        if self.events.len() > MAX_SYSLOG_EVENTS {
            let drain_count = self.events.len() - MAX_SYSLOG_EVENTS;
            self.events.drain(0..drain_count);
        }
    }
}

impl Default for SysLog {
    fn default() -> Self {
        Self::new()
    }
}
