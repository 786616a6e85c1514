//! Main memory management
//!
//! Memory PEs contribute their whole capacity to [`MainMemory`]. Each module
//! keeps a first-fit free list ([`MemoryMap`]); freed areas are merged with
//! their neighbours.

pub mod addrspace;

use alloc::vec::Vec;

use crate::types::PeId;

pub use addrspace::AddrSpace;

/// A free area within a memory module
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Area {
    addr: u64,
    size: u64,
}

/// First-fit allocator over one address range
#[derive(Clone, Debug)]
pub struct MemoryMap {
    /// Free areas, sorted by address, never adjacent
    areas: Vec<Area>,
}

impl MemoryMap {
    pub fn new(addr: u64, size: u64) -> Self {
        Self {
            areas: alloc::vec![Area { addr, size }],
        }
    }

    /// Allocate `size` bytes aligned to `align` (a power of two)
    pub fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }
        let idx = self.areas.iter().position(|a| {
            let start = (a.addr + align - 1) & !(align - 1);
            start - a.addr + size <= a.size
        })?;
        let area = self.areas[idx];
        let start = (area.addr + align - 1) & !(align - 1);
        let end = start + size;

        // the alignment gap in front stays free
        let mut rest = Vec::with_capacity(2);
        if start > area.addr {
            rest.push(Area {
                addr: area.addr,
                size: start - area.addr,
            });
        }
        if end < area.addr + area.size {
            rest.push(Area {
                addr: end,
                size: area.addr + area.size - end,
            });
        }
        self.areas.splice(idx..idx + 1, rest);
        Some(start)
    }

    /// Take exactly `[addr, addr + size)` out of the free list
    pub fn allocate_at(&mut self, addr: u64, size: u64) -> bool {
        let end = match addr.checked_add(size) {
            Some(e) if size > 0 => e,
            _ => return false,
        };
        let idx = match self
            .areas
            .iter()
            .position(|a| a.addr <= addr && end <= a.addr + a.size)
        {
            Some(i) => i,
            None => return false,
        };
        let area = self.areas[idx];
        let mut rest = Vec::with_capacity(2);
        if addr > area.addr {
            rest.push(Area {
                addr: area.addr,
                size: addr - area.addr,
            });
        }
        if end < area.addr + area.size {
            rest.push(Area {
                addr: end,
                size: area.addr + area.size - end,
            });
        }
        self.areas.splice(idx..idx + 1, rest);
        true
    }

    pub fn free(&mut self, addr: u64, size: u64) {
        if size == 0 {
            return;
        }
        let idx = self.areas.partition_point(|a| a.addr < addr);
        let merges_prev = idx > 0 && {
            let p = self.areas[idx - 1];
            p.addr + p.size == addr
        };
        let merges_next = idx < self.areas.len() && addr + size == self.areas[idx].addr;

        match (merges_prev, merges_next) {
            (true, true) => {
                let next = self.areas.remove(idx);
                self.areas[idx - 1].size += size + next.size;
            }
            (true, false) => self.areas[idx - 1].size += size,
            (false, true) => {
                self.areas[idx].addr = addr;
                self.areas[idx].size += size;
            }
            (false, false) => self.areas.insert(idx, Area { addr, size }),
        }
    }

    /// Total free bytes and number of free areas
    pub fn free_size(&self) -> (u64, usize) {
        (self.areas.iter().map(|a| a.size).sum(), self.areas.len())
    }
}

/// A memory module located on a memory PE
#[derive(Clone, Debug)]
pub struct MemoryModule {
    pub pe: PeId,
    pub size: u64,
    map: MemoryMap,
}

impl MemoryModule {
    pub fn new(pe: PeId, size: u64) -> Self {
        Self {
            pe,
            size,
            map: MemoryMap::new(0, size),
        }
    }

    pub fn map(&self) -> &MemoryMap {
        &self.map
    }
}

/// A successful allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub pe: PeId,
    pub addr: u64,
    pub size: u64,
}

/// All memory modules of the machine
#[derive(Debug, Default)]
pub struct MainMemory {
    mods: Vec<MemoryModule>,
}

impl MainMemory {
    pub fn new() -> Self {
        Self { mods: Vec::new() }
    }

    pub fn add(&mut self, module: MemoryModule) {
        log::debug!(
            target: "mem",
            "Adding memory module on PE {} with {} KiB",
            module.pe,
            module.size / 1024
        );
        self.mods.push(module);
    }

    pub fn allocate(&mut self, size: u64, align: u64) -> Option<Allocation> {
        for m in &mut self.mods {
            if let Some(addr) = m.map.allocate(size, align) {
                log::trace!(target: "mem", "Allocated {:#x} bytes @ {}:{:#x}", size, m.pe, addr);
                return Some(Allocation {
                    pe: m.pe,
                    addr,
                    size,
                });
            }
        }
        None
    }

    /// Allocate a fixed range on memory PE `pe`
    pub fn allocate_at(&mut self, pe: PeId, addr: u64, size: u64) -> Option<Allocation> {
        let m = self.mods.iter_mut().find(|m| m.pe == pe)?;
        if m.map.allocate_at(addr, size) {
            Some(Allocation { pe, addr, size })
        } else {
            None
        }
    }

    pub fn free(&mut self, alloc: &Allocation) {
        if let Some(m) = self.mods.iter_mut().find(|m| m.pe == alloc.pe) {
            log::trace!(
                target: "mem",
                "Freed {:#x} bytes @ {}:{:#x}",
                alloc.size,
                alloc.pe,
                alloc.addr
            );
            m.map.free(alloc.addr, alloc.size);
        }
    }

    /// Total capacity
    pub fn size(&self) -> u64 {
        self.mods.iter().map(|m| m.size).sum()
    }

    /// Currently free bytes
    pub fn available(&self) -> u64 {
        self.mods.iter().map(|m| m.map.free_size().0).sum()
    }

    pub fn modules(&self) -> &[MemoryModule] {
        &self.mods
    }
}
