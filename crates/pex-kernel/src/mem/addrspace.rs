//! Page tables of a VPE with DTU-side virtual memory
//!
//! Two-level tables live in main memory and are accessed through the DTU.
//! Each table is one page of 512 entries. An entry holds a global physical
//! address plus [`PteFlags`]; [`PteFlags::INTERN`] marks a pointer to the
//! next level.

use alloc::vec;

use pex_dtu::{Dtu, PteFlags, VpeDesc, PAGE_MASK};

use super::{Allocation, MainMemory};
use crate::error::Code;
use crate::types::{glob_addr, glob_split, PAGE_BITS, PAGE_SIZE};

const LEVEL_BITS: u32 = 9;
const LEVEL_MASK: u64 = (1 << LEVEL_BITS) - 1;
const LEVELS: u32 = 2;
const PTE_SIZE: u64 = 8;

/// Highest virtual address + 1 that can be mapped
pub const VIRT_LIMIT: u64 = 1 << (PAGE_BITS + LEVELS * LEVEL_BITS);

fn pte_index(virt: u64, level: u32) -> u64 {
    (virt >> (PAGE_BITS + level * LEVEL_BITS)) & LEVEL_MASK
}

/// Address space of one VPE
#[derive(Debug)]
pub struct AddrSpace {
    vpe: VpeDesc,
    root: Allocation,
}

impl AddrSpace {
    /// Allocate an empty root table for `vpe`
    pub fn new<D: Dtu>(dtu: &D, mem: &mut MainMemory, vpe: VpeDesc) -> Result<Self, Code> {
        let root = Self::alloc_table(dtu, mem)?;
        Ok(Self { vpe, root })
    }

    /// Global address of the root table (value of the DTU's ROOT_PT register)
    pub fn root(&self) -> u64 {
        glob_addr(self.root.pe, self.root.addr)
    }

    pub fn set_vpe(&mut self, vpe: VpeDesc) {
        self.vpe = vpe;
    }

    fn alloc_table<D: Dtu>(dtu: &D, mem: &mut MainMemory) -> Result<Allocation, Code> {
        let table = mem.allocate(PAGE_SIZE, PAGE_SIZE).ok_or(Code::OutOfMem)?;
        let zeros = vec![0u8; PAGE_SIZE as usize];
        if let Err(e) = dtu.write_mem(VpeDesc::pe_only(table.pe), table.addr, &zeros) {
            mem.free(&table);
            return Err(e.into());
        }
        Ok(table)
    }

    fn read_pte<D: Dtu>(dtu: &D, table: u64, idx: u64) -> Result<u64, Code> {
        let (pe, off) = glob_split(table);
        let mut buf = [0u8; 8];
        dtu.read_mem(VpeDesc::pe_only(pe), off + idx * PTE_SIZE, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_pte<D: Dtu>(dtu: &D, table: u64, idx: u64, pte: u64) -> Result<(), Code> {
        let (pe, off) = glob_split(table);
        dtu.write_mem(VpeDesc::pe_only(pe), off + idx * PTE_SIZE, &pte.to_le_bytes())?;
        Ok(())
    }

    /// Find the last-level table for `virt`, creating it if `mem` is given
    fn leaf_table<D: Dtu>(
        &self,
        dtu: &D,
        mem: Option<&mut MainMemory>,
        virt: u64,
    ) -> Result<Option<u64>, Code> {
        let idx = pte_index(virt, LEVELS - 1);
        let pte = Self::read_pte(dtu, self.root(), idx)?;
        if PteFlags::from_bits_truncate(pte).contains(PteFlags::INTERN) {
            return Ok(Some(pte & !PAGE_MASK));
        }
        match mem {
            Some(mem) => {
                let table = Self::alloc_table(dtu, mem)?;
                let addr = glob_addr(table.pe, table.addr);
                Self::write_pte(dtu, self.root(), idx, addr | PteFlags::INTERN.bits())?;
                Ok(Some(addr))
            }
            None => Ok(None),
        }
    }

    /// Map `pages` pages starting at `virt` to the global address `phys`
    pub fn map_pages<D: Dtu>(
        &mut self,
        dtu: &D,
        mem: &mut MainMemory,
        virt: u64,
        phys: u64,
        pages: u64,
        flags: PteFlags,
    ) -> Result<(), Code> {
        let end = pages
            .checked_mul(PAGE_SIZE)
            .and_then(|len| virt.checked_add(len))
            .ok_or(Code::InvArgs)?;
        if virt & PAGE_MASK != 0 || end > VIRT_LIMIT {
            return Err(Code::InvArgs);
        }
        let flags = flags & PteFlags::RWX;
        for i in 0..pages {
            let v = virt + i * PAGE_SIZE;
            let p = phys + i * PAGE_SIZE;
            let table = self.leaf_table(dtu, Some(&mut *mem), v)?.ok_or(Code::OutOfMem)?;
            Self::write_pte(dtu, table, pte_index(v, 0), (p & !PAGE_MASK) | flags.bits())?;
            dtu.map_page(self.vpe, v, p, flags)?;
        }
        log::trace!(
            target: "mem",
            "VPE {}: mapped {} pages @ {:#x} -> {:#x} ({:?})",
            self.vpe.vpe,
            pages,
            virt,
            phys,
            flags
        );
        Ok(())
    }

    /// Remove the mappings of `pages` pages starting at `virt`
    pub fn unmap_pages<D: Dtu>(&mut self, dtu: &D, virt: u64, pages: u64) -> Result<(), Code> {
        for i in 0..pages {
            let v = virt + i * PAGE_SIZE;
            if v >= VIRT_LIMIT {
                break;
            }
            if let Some(table) = self.leaf_table(dtu, None, v)? {
                Self::write_pte(dtu, table, pte_index(v, 0), 0)?;
            }
            dtu.unmap_page(self.vpe, v)?;
        }
        Ok(())
    }

    /// Look up the translation of `virt`
    pub fn translate<D: Dtu>(&self, dtu: &D, virt: u64) -> Result<Option<(u64, PteFlags)>, Code> {
        if virt >= VIRT_LIMIT {
            return Ok(None);
        }
        let table = match self.leaf_table(dtu, None, virt)? {
            Some(t) => t,
            None => return Ok(None),
        };
        let pte = Self::read_pte(dtu, table, pte_index(virt, 0))?;
        let flags = PteFlags::from_bits_truncate(pte & PAGE_MASK);
        if flags.is_empty() {
            return Ok(None);
        }
        Ok(Some(((pte & !PAGE_MASK) | (virt & PAGE_MASK), flags)))
    }

    /// Free all tables, walking from the root
    pub fn destroy<D: Dtu>(self, dtu: &D, mem: &mut MainMemory) -> Result<(), Code> {
        let mut root = vec![0u8; PAGE_SIZE as usize];
        dtu.read_mem(VpeDesc::pe_only(self.root.pe), self.root.addr, &mut root)?;
        for entry in root.chunks_exact(PTE_SIZE as usize) {
            let mut w = [0u8; 8];
            w.copy_from_slice(entry);
            let pte = u64::from_le_bytes(w);
            if PteFlags::from_bits_truncate(pte).contains(PteFlags::INTERN) {
                let (pe, addr) = glob_split(pte & !PAGE_MASK);
                mem.free(&Allocation {
                    pe,
                    addr,
                    size: PAGE_SIZE,
                });
            }
        }
        mem.free(&self.root);
        log::debug!(target: "mem", "VPE {}: address space destroyed", self.vpe.vpe);
        Ok(())
    }
}
