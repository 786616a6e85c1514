//! Virtual processing elements
//!
//! A VPE is bound to one PE at a time. While it is resident, endpoint
//! changes are written through to the PE's DTU. Otherwise they are latched
//! in the VPE's [`DtuState`] and become visible with the next restore.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use pex_dtu::{Dtu, EpDesc, MemEp, RecvEp, SendEp, VpeDesc, RECVBUF_SIZE, RECVBUF_SPACE};

use super::dtustate::DtuState;
use crate::cap::{CapId, MGateObject};
use crate::error::Code;
use crate::mem::addrspace::AddrSpace;
use crate::types::{EpId, PeId, VpeFlags, VpeId, VpeState, EP_COUNT, MAX_RBUF_ORDER, SYSC_REP};

/// What occupies an endpoint of a VPE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpBinding {
    Free,
    /// Activated gate capability
    Gate(CapId),
    /// Configured by the kernel without a capability (syscall endpoints, attached buffers)
    Raw,
}

#[derive(Debug)]
pub struct Vpe {
    id: VpeId,
    name: String,
    pe: PeId,
    state: VpeState,
    flags: VpeFlags,
    /// Capabilities for this VPE held by others, plus one while an application runs
    refs: u32,
    exit_code: Option<i32>,
    dtu_state: DtuState,
    addr_space: Option<AddrSpace>,
    eps: [EpBinding; EP_COUNT],
    /// Receive buffers by endpoint: (address, size)
    rbufs: BTreeMap<EpId, (u64, u64)>,
    requirements: Vec<String>,
    sysc_slot: Option<usize>,
    last_sched: u64,
}

impl Vpe {
    pub fn new(id: VpeId, name: &str, pe: PeId, flags: VpeFlags) -> Self {
        Self {
            id,
            name: String::from(name),
            pe,
            state: VpeState::Suspended,
            flags,
            refs: 0,
            exit_code: None,
            dtu_state: DtuState::new(),
            addr_space: None,
            eps: [EpBinding::Free; EP_COUNT],
            rbufs: BTreeMap::new(),
            requirements: Vec::new(),
            sysc_slot: None,
            last_sched: 0,
        }
    }

    pub fn id(&self) -> VpeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pe(&self) -> PeId {
        self.pe
    }

    pub fn desc(&self) -> VpeDesc {
        VpeDesc::new(self.pe, self.id)
    }

    /// Move the VPE to another PE; only valid while it is not resident
    pub fn set_pe(&mut self, pe: PeId) {
        self.pe = pe;
        let desc = self.desc();
        if let Some(aspace) = self.addr_space.as_mut() {
            aspace.set_vpe(desc);
        }
    }

    pub fn state(&self) -> VpeState {
        self.state
    }

    pub fn set_state(&mut self, state: VpeState) {
        if self.state != state {
            log::trace!(target: "vpes", "VPE {} ({}): {:?} -> {:?}", self.id, self.name, self.state, state);
        }
        self.state = state;
    }

    pub fn flags(&self) -> VpeFlags {
        self.flags
    }

    pub fn has(&self, flags: VpeFlags) -> bool {
        self.flags.contains(flags)
    }

    pub fn set_flags(&mut self, flags: VpeFlags) {
        self.flags.insert(flags);
    }

    pub fn clear_flags(&mut self, flags: VpeFlags) {
        self.flags.remove(flags);
    }

    pub fn is_resident(&self) -> bool {
        self.flags.contains(VpeFlags::RESIDENT)
    }

    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn add_ref(&mut self) {
        self.refs += 1;
    }

    /// Drop a reference; returns true if it was the last one
    pub fn drop_ref(&mut self) -> bool {
        if self.refs == 0 {
            return false;
        }
        self.refs -= 1;
        self.refs == 0
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn set_exit_code(&mut self, code: i32) {
        self.exit_code = Some(code);
    }

    pub fn dtu_state(&self) -> &DtuState {
        &self.dtu_state
    }

    pub fn dtu_state_mut(&mut self) -> &mut DtuState {
        &mut self.dtu_state
    }

    /// Root page table, if the VPE has an address space
    pub fn root_pt(&self) -> Option<u64> {
        self.addr_space.as_ref().map(AddrSpace::root)
    }

    pub fn addr_space(&self) -> Option<&AddrSpace> {
        self.addr_space.as_ref()
    }

    pub fn addr_space_mut(&mut self) -> Option<&mut AddrSpace> {
        self.addr_space.as_mut()
    }

    pub fn set_addr_space(&mut self, aspace: AddrSpace) {
        self.addr_space = Some(aspace);
    }

    pub fn take_addr_space(&mut self) -> Option<AddrSpace> {
        self.addr_space.take()
    }

    pub fn requirements(&self) -> &[String] {
        &self.requirements
    }

    pub fn add_requirement(&mut self, name: &str) {
        self.requirements.push(String::from(name));
    }

    pub fn sysc_slot(&self) -> Option<usize> {
        self.sysc_slot
    }

    pub fn set_sysc_slot(&mut self, slot: Option<usize>) {
        self.sysc_slot = slot;
    }

    /// Time of the last restore
    pub fn last_sched(&self) -> u64 {
        self.last_sched
    }

    pub fn set_last_sched(&mut self, now: u64) {
        self.last_sched = now;
    }

    /// A VPE may only change its PE as long as nobody sends to it
    pub fn can_migrate(&self) -> bool {
        self.has(VpeFlags::MUXABLE)
            && !self.has(VpeFlags::IDLE)
            && self.rbufs.keys().all(|ep| *ep == SYSC_REP)
    }

    // ========================================================================
    // Endpoints
    // ========================================================================

    pub fn binding(&self, ep: EpId) -> Option<EpBinding> {
        self.eps.get(ep).copied()
    }

    pub fn bind(&mut self, ep: EpId, binding: EpBinding) {
        if let Some(slot) = self.eps.get_mut(ep) {
            *slot = binding;
        }
    }

    /// Endpoints occupied by activated capabilities
    pub fn gate_bindings(&self) -> impl Iterator<Item = (EpId, CapId)> + '_ {
        self.eps.iter().enumerate().filter_map(|(ep, b)| match b {
            EpBinding::Gate(id) => Some((ep, *id)),
            _ => None,
        })
    }

    pub fn rbufs(&self) -> &BTreeMap<EpId, (u64, u64)> {
        &self.rbufs
    }

    fn check_ep(ep: EpId) -> Result<(), Code> {
        if ep >= EP_COUNT {
            return Err(Code::InvArgs);
        }
        Ok(())
    }

    /// Latch `desc` and write it through if the VPE is on its PE
    fn apply<D: Dtu>(&mut self, dtu: &D, ep: EpId, desc: EpDesc) -> Result<(), Code> {
        self.dtu_state.set_ep(ep, &desc);
        if self.is_resident() {
            let vd = self.desc();
            match &desc {
                EpDesc::Invalid => dtu.invalidate_ep(vd, ep)?,
                EpDesc::Recv(r) => dtu.config_recv(vd, ep, r)?,
                EpDesc::Send(s) => dtu.config_send(vd, ep, s)?,
                EpDesc::Memory(m) => dtu.config_mem(vd, ep, m)?,
            }
        }
        Ok(())
    }

    /// Configure a receive buffer of `1 << order` bytes at `addr`
    ///
    /// # Returns
    /// * `Err(Code::InvArgs)` - Bad endpoint or orders, buffer outside the
    ///   receive-buffer region or overlapping another buffer
    pub fn config_rcv_ep<D: Dtu>(
        &mut self,
        dtu: &D,
        ep: EpId,
        addr: u64,
        order: u32,
        msg_order: u32,
    ) -> Result<(), Code> {
        Self::check_ep(ep)?;
        if order > MAX_RBUF_ORDER || msg_order > order {
            return Err(Code::InvArgs);
        }
        let size = 1u64 << order;
        let end = addr.checked_add(size).ok_or(Code::InvArgs)?;
        if addr < RECVBUF_SPACE || end > RECVBUF_SPACE + RECVBUF_SIZE {
            return Err(Code::InvArgs);
        }
        let overlaps = self
            .rbufs
            .iter()
            .any(|(e, (a, s))| *e != ep && addr < a + s && *a < end);
        if overlaps {
            return Err(Code::InvArgs);
        }

        self.apply(
            dtu,
            ep,
            EpDesc::Recv(RecvEp {
                buf: addr,
                order,
                msg_order,
            }),
        )?;
        self.rbufs.insert(ep, (addr, size));
        log::trace!(target: "vpes", "VPE {}: rbuf ep{} @ {:#x} ({:#x} bytes)", self.id, ep, addr, size);
        Ok(())
    }

    pub fn config_snd_ep<D: Dtu>(&mut self, dtu: &D, ep: EpId, desc: SendEp) -> Result<(), Code> {
        Self::check_ep(ep)?;
        self.rbufs.remove(&ep);
        self.apply(dtu, ep, EpDesc::Send(desc))
    }

    /// Grant access to `mgate`, starting `offset` bytes into it
    pub fn config_mem_ep<D: Dtu>(
        &mut self,
        dtu: &D,
        ep: EpId,
        mgate: &MGateObject,
        offset: u64,
    ) -> Result<(), Code> {
        Self::check_ep(ep)?;
        if offset > mgate.size {
            return Err(Code::InvArgs);
        }
        self.rbufs.remove(&ep);
        self.apply(
            dtu,
            ep,
            EpDesc::Memory(MemEp {
                pe: mgate.pe,
                vpe: mgate.vpe,
                addr: mgate.addr + offset,
                size: mgate.size - offset,
                perm: mgate.perms,
            }),
        )
    }

    /// Invalidate `ep` and forget what was bound to it
    pub fn invalidate_ep<D: Dtu>(&mut self, dtu: &D, ep: EpId) -> Result<(), Code> {
        Self::check_ep(ep)?;
        self.rbufs.remove(&ep);
        self.eps[ep] = EpBinding::Free;
        self.apply(dtu, ep, EpDesc::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Perm;
    use pex_dtu_mock::MockDtu;

    fn vpe(flags: VpeFlags) -> Vpe {
        Vpe::new(3, "test", 1, flags)
    }

    fn send_ep(label: u64) -> SendEp {
        SendEp {
            dst_pe: 2,
            dst_ep: 4,
            dst_vpe: 7,
            label,
            msg_order: 6,
            credits: 2,
        }
    }

    #[test]
    fn test_latched_until_resident() {
        let dtu = MockDtu::new(2);
        let mut v = vpe(VpeFlags::empty());
        v.config_snd_ep(&dtu, 4, send_ep(0x11)).unwrap();
        assert_eq!(dtu.ep(1, 4), Some(EpDesc::Invalid));
        assert_eq!(v.dtu_state().ep(4), Some(EpDesc::Send(send_ep(0x11))));

        v.set_flags(VpeFlags::RESIDENT);
        v.config_snd_ep(&dtu, 5, send_ep(0x22)).unwrap();
        assert_eq!(dtu.ep(1, 5), Some(EpDesc::Send(send_ep(0x22))));
    }

    #[test]
    fn test_second_config_overwrites_first() {
        let dtu = MockDtu::new(2);
        let mut v = vpe(VpeFlags::RESIDENT);
        let mgate = MGateObject::new(2, 0, 0x1000, 0x4000, Perm::RW);
        v.config_snd_ep(&dtu, 6, send_ep(0x33)).unwrap();
        v.config_mem_ep(&dtu, 6, &mgate, 0x1000).unwrap();

        let expected = EpDesc::Memory(MemEp {
            pe: 2,
            vpe: 0,
            addr: 0x2000,
            size: 0x3000,
            perm: Perm::RW,
        });
        assert_eq!(dtu.ep(1, 6), Some(expected));
        assert_eq!(v.dtu_state().ep(6), Some(expected));
    }

    #[test]
    fn test_mem_ep_offset_bounded_by_size() {
        let dtu = MockDtu::new(2);
        let mut v = vpe(VpeFlags::empty());
        let mgate = MGateObject::new(2, 0, 0, 0x1000, Perm::R);
        assert_eq!(v.config_mem_ep(&dtu, 4, &mgate, 0x1001), Err(Code::InvArgs));
        assert!(v.config_mem_ep(&dtu, 4, &mgate, 0x1000).is_ok());
        assert_eq!(v.config_mem_ep(&dtu, EP_COUNT, &mgate, 0), Err(Code::InvArgs));
    }

    #[test]
    fn test_rbuf_placement() {
        let dtu = MockDtu::new(2);
        let mut v = vpe(VpeFlags::empty());
        assert_eq!(v.config_rcv_ep(&dtu, 4, 0x1000, 10, 6), Err(Code::InvArgs));
        assert_eq!(
            v.config_rcv_ep(&dtu, 4, RECVBUF_SPACE + RECVBUF_SIZE - 512, 10, 6),
            Err(Code::InvArgs)
        );
        assert_eq!(v.config_rcv_ep(&dtu, 4, RECVBUF_SPACE, 10, 11), Err(Code::InvArgs));

        v.config_rcv_ep(&dtu, 4, RECVBUF_SPACE, 10, 6).unwrap();
        assert_eq!(
            v.config_rcv_ep(&dtu, 5, RECVBUF_SPACE + 512, 10, 6),
            Err(Code::InvArgs)
        );
        // replacing the buffer of the same endpoint is fine
        v.config_rcv_ep(&dtu, 4, RECVBUF_SPACE + 256, 10, 6).unwrap();
        v.config_rcv_ep(&dtu, 5, RECVBUF_SPACE + 0x1000, 10, 6).unwrap();
        assert_eq!(v.rbufs().len(), 2);

        v.invalidate_ep(&dtu, 4).unwrap();
        assert_eq!(v.rbufs().len(), 1);
        assert_eq!(v.dtu_state().ep(4), Some(EpDesc::Invalid));
    }

    #[test]
    fn test_refs_and_bindings() {
        let dtu = MockDtu::new(2);
        let mut v = vpe(VpeFlags::MUXABLE);
        v.add_ref();
        v.add_ref();
        assert!(!v.drop_ref());
        assert!(v.drop_ref());
        assert!(!v.drop_ref());

        v.bind(4, EpBinding::Gate(CapId(9)));
        assert_eq!(v.gate_bindings().collect::<Vec<_>>(), [(4, CapId(9))]);
        v.invalidate_ep(&dtu, 4).unwrap();
        assert_eq!(v.binding(4), Some(EpBinding::Free));
        assert!(v.can_migrate());
    }
}
