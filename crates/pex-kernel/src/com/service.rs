//! Services and their send queues
//!
//! A service is provided by a VPE (its owner) that receives kernel requests
//! on a receive gate. Requests are queued per service; at most
//! [`SRV_QUEUE_CAPACITY`] are in flight at a time and the rest wait in FIFO
//! order until replies come back.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::rc::{Rc, Weak};
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::cap::RGateObject;
use crate::error::Code;
use crate::types::{CapSel, Label, VpeId};

/// Identifies a service; also the upper half of its request labels
pub type ServiceId = u32;

/// Requests in flight per service
pub const SRV_QUEUE_CAPACITY: usize = 4;

/// A request waiting to be delivered
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedMsg {
    pub label: Label,
    pub data: Vec<u8>,
}

/// Bounded in-flight window plus FIFO backlog
#[derive(Debug)]
pub struct SendQueue {
    capacity: usize,
    inflight: usize,
    queue: VecDeque<QueuedMsg>,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inflight: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, msg: QueuedMsg) {
        self.queue.push_back(msg);
    }

    /// Next message to deliver, if the window allows it
    pub fn pop_sendable(&mut self) -> Option<QueuedMsg> {
        if self.inflight >= self.capacity {
            return None;
        }
        let msg = self.queue.pop_front()?;
        self.inflight += 1;
        Some(msg)
    }

    /// Put back a message that could not be delivered
    pub fn requeue(&mut self, msg: QueuedMsg) {
        self.inflight = self.inflight.saturating_sub(1);
        self.queue.push_front(msg);
    }

    pub fn received_reply(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
    }

    /// Requests in flight or queued
    pub fn pending(&self) -> usize {
        self.inflight + self.queue.len()
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Forget everything; returns the number of dropped requests
    pub fn abort(&mut self) -> usize {
        let n = self.pending();
        self.queue.clear();
        self.inflight = 0;
        n
    }
}

/// A registered service
#[derive(Debug)]
pub struct Service {
    id: ServiceId,
    name: String,
    owner: VpeId,
    owner_alive: bool,
    /// Selector of the service capability in the owner's table
    sel: CapSel,
    rgate: Rc<RefCell<RGateObject>>,
    queue: SendQueue,
    closing: bool,
    next_seq: u32,
}

pub type ServiceRef = Rc<RefCell<Service>>;

impl Service {
    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> VpeId {
        self.owner
    }

    pub fn sel(&self) -> CapSel {
        self.sel
    }

    pub fn owner_alive(&self) -> bool {
        self.owner_alive
    }

    pub fn rgate(&self) -> &Rc<RefCell<RGateObject>> {
        &self.rgate
    }

    /// The owner is gone: drop all outstanding requests
    pub fn set_owner_dead(&mut self) {
        self.owner_alive = false;
        let dropped = self.queue.abort();
        if dropped > 0 {
            log::debug!(
                target: "services",
                "Service '{}': dropped {} requests",
                self.name,
                dropped
            );
        }
    }

    pub fn closing(&self) -> bool {
        self.closing
    }

    pub fn set_closing(&mut self) {
        self.closing = true;
    }

    /// Queue a request; returns the label the reply will carry
    pub fn send(&mut self, data: Vec<u8>) -> Label {
        let label = ((self.id as u64) << 32) | self.next_seq as u64;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.queue.push(QueuedMsg { label, data });
        label
    }

    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Requests not delivered yet
    pub fn has_queued(&self) -> bool {
        self.queue.has_queued()
    }

    pub fn queue_mut(&mut self) -> &mut SendQueue {
        &mut self.queue
    }
}

/// Service a reply label belongs to
pub fn label_service(label: Label) -> ServiceId {
    (label >> 32) as ServiceId
}

/// Registry of services by id and name
///
/// Holds weak references: a service lives as long as its capability (and
/// the sessions referring to it).
#[derive(Debug)]
pub struct ServiceList {
    next_id: ServiceId,
    srvs: BTreeMap<ServiceId, Weak<RefCell<Service>>>,
}

impl ServiceList {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            srvs: BTreeMap::new(),
        }
    }

    /// Register a new service
    ///
    /// # Returns
    /// * `Err(Code::Exists)` - A live service with that name exists
    pub fn create(
        &mut self,
        name: &str,
        owner: VpeId,
        sel: CapSel,
        rgate: Rc<RefCell<RGateObject>>,
    ) -> Result<ServiceRef, Code> {
        self.srvs.retain(|_, s| s.strong_count() > 0);
        if self.find(name).is_some() {
            return Err(Code::Exists);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let srv = Rc::new(RefCell::new(Service {
            id,
            name: String::from(name),
            owner,
            owner_alive: true,
            sel,
            rgate,
            queue: SendQueue::new(SRV_QUEUE_CAPACITY),
            closing: false,
            next_seq: 0,
        }));
        self.srvs.insert(id, Rc::downgrade(&srv));
        log::debug!(target: "services", "Service '{}' ({}) created by VPE {}", name, id, owner);
        Ok(srv)
    }

    pub fn find(&self, name: &str) -> Option<ServiceRef> {
        self.live().into_iter().find(|s| s.borrow().name == name)
    }

    pub fn get(&self, id: ServiceId) -> Option<ServiceRef> {
        self.srvs.get(&id)?.upgrade()
    }

    pub fn live(&self) -> Vec<ServiceRef> {
        self.srvs.values().filter_map(Weak::upgrade).collect()
    }

    pub fn owned_by(&self, vpe: VpeId) -> Vec<ServiceRef> {
        self.live()
            .into_iter()
            .filter(|s| s.borrow().owner == vpe)
            .collect()
    }
}

impl Default for ServiceList {
    fn default() -> Self {
        Self::new()
    }
}
