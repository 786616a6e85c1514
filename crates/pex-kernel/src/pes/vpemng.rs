//! VPE registry
//!
//! Owns all VPEs, hands out ids (round-robin over [`MAX_VPES`]) and the
//! syscall slots VPEs use to reach the kernel.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::vpe::Vpe;
use crate::error::Code;
use crate::types::{PeId, VpeFlags, VpeId, MAX_VPES};

#[derive(Debug, Default)]
pub struct VpeManager {
    vpes: BTreeMap<VpeId, Vpe>,
    next_id: VpeId,
    /// Bitmap of taken syscall slots
    sysc_slots: u64,
    /// Created VPEs waiting for required services
    pending: Vec<VpeId>,
}

impl VpeManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_id(&mut self) -> Option<VpeId> {
        let max = MAX_VPES as VpeId;
        let free = (self.next_id..max)
            .chain(0..self.next_id)
            .find(|id| !self.vpes.contains_key(id))?;
        self.next_id = (free + 1) % max;
        Some(free)
    }

    /// Register a new VPE on `pe`
    ///
    /// # Returns
    /// * `Err(Code::NoSpace)` - All VPE ids are taken
    pub fn create(&mut self, name: &str, pe: PeId, flags: VpeFlags) -> Result<VpeId, Code> {
        let id = self.get_id().ok_or(Code::NoSpace)?;
        self.vpes.insert(id, Vpe::new(id, name, pe, flags));
        log::debug!(target: "vpes", "Created VPE {} '{}' on PE {} ({:?})", id, name, pe, flags);
        Ok(id)
    }

    pub fn get(&self, id: VpeId) -> Option<&Vpe> {
        self.vpes.get(&id)
    }

    pub fn get_mut(&mut self, id: VpeId) -> Option<&mut Vpe> {
        self.vpes.get_mut(&id)
    }

    pub fn contains(&self, id: VpeId) -> bool {
        self.vpes.contains_key(&id)
    }

    /// Unregister a VPE and release its syscall slot
    pub fn remove(&mut self, id: VpeId) -> Option<Vpe> {
        let vpe = self.vpes.remove(&id)?;
        if let Some(slot) = vpe.sysc_slot() {
            self.sysc_slots &= !(1 << slot);
        }
        self.pending.retain(|p| *p != id);
        log::debug!(target: "vpes", "Removed VPE {} '{}'", id, vpe.name());
        Some(vpe)
    }

    pub fn ids(&self) -> Vec<VpeId> {
        self.vpes.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vpe> {
        self.vpes.values()
    }

    pub fn len(&self) -> usize {
        self.vpes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vpes.is_empty()
    }

    /// Reserve a syscall slot for `id`
    pub fn alloc_sysc_slot(&mut self, id: VpeId) -> Result<usize, Code> {
        let slot = (0..MAX_VPES)
            .find(|s| self.sysc_slots & (1 << s) == 0)
            .ok_or(Code::NoSpace)?;
        let vpe = self.vpes.get_mut(&id).ok_or(Code::NotFound)?;
        self.sysc_slots |= 1 << slot;
        vpe.set_sysc_slot(Some(slot));
        Ok(slot)
    }

    pub fn sysc_slots_used(&self) -> u32 {
        self.sysc_slots.count_ones()
    }

    // ========================================================================
    // Pending VPEs
    // ========================================================================

    pub fn add_pending(&mut self, id: VpeId) {
        if !self.pending.contains(&id) {
            self.pending.push(id);
        }
    }

    pub fn pending(&self) -> &[VpeId] {
        &self.pending
    }

    /// Remove and return the pending VPEs whose requirements are all met
    pub fn take_startable(&mut self, available: impl Fn(&str) -> bool) -> Vec<VpeId> {
        let vpes = &self.vpes;
        let (ready, waiting): (Vec<VpeId>, Vec<VpeId>) =
            self.pending.iter().partition(|id| match vpes.get(*id) {
                Some(v) => v.requirements().iter().all(|r| available(r)),
                None => false,
            });
        self.pending = waiting;
        ready
    }

    // ========================================================================
    // Counting
    // ========================================================================

    /// VPEs besides the per-PE idle VPEs
    pub fn used(&self) -> usize {
        self.vpes.values().filter(|v| !v.has(VpeFlags::IDLE)).count()
    }

    pub fn daemons(&self) -> usize {
        self.vpes
            .values()
            .filter(|v| v.has(VpeFlags::DAEMON) && !v.has(VpeFlags::IDLE))
            .count()
    }
}
