//! Capability kinds and the kernel objects they refer to
//!
//! Kernel objects are shared between all capabilities derived from the same
//! origin (`Rc`). Their `Drop` impls carry the side effects of the last
//! reference going away: freeing backing memory, telling a service that a
//! session is closed.

use alloc::rc::Rc;
use core::cell::RefCell;

use bitflags::bitflags;
use pex_dtu::PteFlags;

use crate::com::service::ServiceRef;
use crate::com::ServiceCmd;
use crate::mem::{Allocation, MainMemory};
use crate::types::{EpId, Label, PeId, Perm, VpeId};

bitflags! {
    /// Kind mask for typed lookups
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct CapType: u32 {
        const SERV = 1 << 0;
        const SESS = 1 << 1;
        const SGATE = 1 << 2;
        const RGATE = 1 << 3;
        const MGATE = 1 << 4;
        const MAP = 1 << 5;
        const VIRTPE = 1 << 6;
        /// Anything that can be activated on an endpoint
        const GATE = Self::SGATE.bits() | Self::RGATE.bits() | Self::MGATE.bits();
    }
}

/// Where a gate capability is currently activated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Activation {
    pub vpe: VpeId,
    pub ep: EpId,
}

/// A receive buffer, attached once the gate is activated
#[derive(Debug)]
pub struct RGateObject {
    pub order: u32,
    pub msg_order: u32,
    /// Owner, endpoint and buffer address once activated
    pub loc: Option<(VpeId, EpId, u64)>,
}

impl RGateObject {
    pub fn new(order: u32, msg_order: u32) -> Self {
        Self {
            order,
            msg_order,
            loc: None,
        }
    }

    pub fn activated(&self) -> bool {
        self.loc.is_some()
    }

    pub fn size(&self) -> u64 {
        1 << self.order
    }
}

/// A send gate towards a receive gate
#[derive(Debug)]
pub struct SGateObject {
    pub rgate: Rc<RefCell<RGateObject>>,
    pub label: Label,
    pub credits: u64,
}

/// A region of physical memory
#[derive(Debug)]
pub struct MGateObject {
    pub pe: PeId,
    /// VPE whose local memory this is (`INVALID_VPE` for main memory)
    pub vpe: VpeId,
    pub addr: u64,
    pub size: u64,
    pub perms: Perm,
    pub derived: bool,
    /// Set if the region came from the allocator and must go back to it
    backing: Option<Rc<RefCell<MainMemory>>>,
}

impl MGateObject {
    pub fn new(pe: PeId, vpe: VpeId, addr: u64, size: u64, perms: Perm) -> Self {
        Self {
            pe,
            vpe,
            addr,
            size,
            perms,
            derived: false,
            backing: None,
        }
    }

    /// Memory obtained from `mem`; released when the last reference drops
    pub fn allocated(alloc: Allocation, perms: Perm, mem: Rc<RefCell<MainMemory>>) -> Self {
        Self {
            pe: alloc.pe,
            vpe: crate::types::INVALID_VPE,
            addr: alloc.addr,
            size: alloc.size,
            perms,
            derived: false,
            backing: Some(mem),
        }
    }

    /// A sub-range of `self`; never frees anything
    pub fn derive(&self, offset: u64, size: u64, perms: Perm) -> Self {
        Self {
            pe: self.pe,
            vpe: self.vpe,
            addr: self.addr + offset,
            size,
            perms,
            derived: true,
            backing: None,
        }
    }
}

impl Drop for MGateObject {
    fn drop(&mut self) {
        if self.derived {
            return;
        }
        if let Some(mem) = self.backing.take() {
            mem.borrow_mut().free(&Allocation {
                pe: self.pe,
                addr: self.addr,
                size: self.size,
            });
        }
    }
}

/// A session with a service
#[derive(Debug)]
pub struct SessObject {
    pub srv: ServiceRef,
    pub ident: u64,
}

impl Drop for SessObject {
    fn drop(&mut self) {
        let mut srv = self.srv.borrow_mut();
        if srv.owner_alive() {
            log::debug!(
                target: "services",
                "Closing session {:#x} of service '{}'",
                self.ident,
                srv.name()
            );
            srv.send(ServiceCmd::Close { ident: self.ident }.encode());
        }
    }
}

/// Kind-specific payload of a capability
#[derive(Debug)]
pub enum CapKind {
    Service(ServiceRef),
    Session(Rc<SessObject>),
    SendGate {
        obj: Rc<SGateObject>,
        act: Option<Activation>,
    },
    RecvGate {
        obj: Rc<RefCell<RGateObject>>,
        act: Option<Activation>,
    },
    MemGate {
        obj: Rc<MGateObject>,
        act: Option<Activation>,
    },
    Vpe(VpeId),
    /// Pages mapped at the capability's selector (virtual page number)
    Map { phys: u64, flags: PteFlags },
}

impl CapKind {
    pub fn ty(&self) -> CapType {
        match self {
            CapKind::Service(_) => CapType::SERV,
            CapKind::Session(_) => CapType::SESS,
            CapKind::SendGate { .. } => CapType::SGATE,
            CapKind::RecvGate { .. } => CapType::RGATE,
            CapKind::MemGate { .. } => CapType::MGATE,
            CapKind::Vpe(_) => CapType::VIRTPE,
            CapKind::Map { .. } => CapType::MAP,
        }
    }

    /// Copy for delegation. Services and mappings cannot be copied.
    ///
    /// The copy shares the kernel object but is not activated anywhere.
    pub fn clone_for_obtain(&self) -> Option<CapKind> {
        Some(match self {
            CapKind::Service(_) | CapKind::Map { .. } => return None,
            CapKind::Session(s) => CapKind::Session(s.clone()),
            CapKind::SendGate { obj, .. } => CapKind::SendGate {
                obj: obj.clone(),
                act: None,
            },
            CapKind::RecvGate { obj, .. } => CapKind::RecvGate {
                obj: obj.clone(),
                act: None,
            },
            CapKind::MemGate { obj, .. } => CapKind::MemGate {
                obj: obj.clone(),
                act: None,
            },
            CapKind::Vpe(id) => CapKind::Vpe(*id),
        })
    }

    pub fn activation(&self) -> Option<Activation> {
        match self {
            CapKind::SendGate { act, .. }
            | CapKind::RecvGate { act, .. }
            | CapKind::MemGate { act, .. } => *act,
            _ => None,
        }
    }

    /// Record or clear the activation; ignored for non-gates
    pub fn set_activation(&mut self, new: Option<Activation>) {
        match self {
            CapKind::SendGate { act, .. }
            | CapKind::RecvGate { act, .. }
            | CapKind::MemGate { act, .. } => *act = new,
            _ => {}
        }
    }
}

impl core::fmt::Display for CapKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CapKind::Service(s) => write!(f, "Serv[name={}]", s.borrow().name()),
            CapKind::Session(s) => write!(f, "Sess[ident={:#x}]", s.ident),
            CapKind::SendGate { obj, act } => {
                write!(f, "SGate[label={:#x}, crd={}, act={:?}]", obj.label, obj.credits, act)
            }
            CapKind::RecvGate { obj, act } => {
                let r = obj.borrow();
                write!(f, "RGate[order={}, msgorder={}, act={:?}]", r.order, r.msg_order, act)
            }
            CapKind::MemGate { obj, act } => write!(
                f,
                "MGate[pe={}, addr={:#x}, size={:#x}, perms={:?}, act={:?}]",
                obj.pe, obj.addr, obj.size, obj.perms, act
            ),
            CapKind::Vpe(id) => write!(f, "VPE[id={}]", id),
            CapKind::Map { phys, flags } => write!(f, "Map[phys={:#x}, flags={:?}]", phys, flags),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryModule;

    #[test]
    fn test_allocated_memory_freed_on_last_drop() {
        let mem = Rc::new(RefCell::new(MainMemory::new()));
        mem.borrow_mut().add(MemoryModule::new(3, 0x10000));
        let alloc = mem.borrow_mut().allocate(0x4000, 0x1000).unwrap();

        let obj = Rc::new(MGateObject::allocated(alloc, Perm::RW, mem.clone()));
        let copy = obj.clone();
        drop(obj);
        assert_eq!(mem.borrow().available(), 0xC000);
        drop(copy);
        assert_eq!(mem.borrow().available(), 0x10000);
    }

    #[test]
    fn test_derived_memory_never_frees() {
        let mem = Rc::new(RefCell::new(MainMemory::new()));
        mem.borrow_mut().add(MemoryModule::new(3, 0x10000));
        let alloc = mem.borrow_mut().allocate(0x4000, 0x1000).unwrap();
        let parent = MGateObject::allocated(alloc, Perm::RW, mem.clone());

        let derived = parent.derive(0x1000, 0x1000, Perm::R);
        assert_eq!(derived.addr, alloc.addr + 0x1000);
        drop(derived);
        assert_eq!(mem.borrow().available(), 0xC000);
    }

    #[test]
    fn test_services_and_maps_are_not_copied() {
        let map = CapKind::Map {
            phys: 0,
            flags: PteFlags::R,
        };
        assert!(map.clone_for_obtain().is_none());

        let gate = CapKind::MemGate {
            obj: Rc::new(MGateObject::new(1, 2, 0, 0x1000, Perm::R)),
            act: Some(Activation { vpe: 2, ep: 4 }),
        };
        let copy = gate.clone_for_obtain().unwrap();
        assert_eq!(copy.ty(), CapType::MGATE);
        assert_eq!(copy.activation(), None);
    }
}
