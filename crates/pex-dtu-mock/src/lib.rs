//! Mock DTU implementation for testing the pex kernel
//!
//! This provides an in-memory implementation of the [`Dtu`] trait that can be
//! used for testing the kernel without a simulator or hardware. Each PE has a
//! sparse memory, a DTU register file and a simulated switching agent that
//! answers store and restore requests the way the real agent does.

#![no_std]
extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};

use pex_dtu::{
    Dtu, DtuError, DtuReg, DtuRegs, EpDesc, EpId, ExtCmd, Label, MemEp, MsgHeader, PteFlags,
    RctMuxFlags, RecvEp, SendEp, VpeDesc, VpeId, DTU_BASE_ADDR, EP_COUNT, PAGE_BITS, PAGE_MASK,
    PAGE_SIZE, RCTMUX_FLAGS,
};

/// Memory size of every simulated PE
pub const DEFAULT_MEM_SIZE: u64 = 1 << 32;

/// How the simulated switching agent answers requests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentMode {
    /// Acknowledge after the kernel polled the flags `polls_before_ack` times
    Responsive { polls_before_ack: u32 },
    /// Never acknowledge
    Unresponsive,
}

/// A message the kernel delivered to a VPE
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMsg {
    pub dst: VpeDesc,
    pub ep: EpId,
    pub label: Label,
    pub reply_label: Label,
    pub data: Vec<u8>,
    /// Header of a message forwarded on behalf of another VPE
    pub header: Option<MsgHeader>,
}

/// A reply the kernel sent to a VPE's syscall
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentReply {
    pub dst: VpeDesc,
    pub label: Label,
    pub data: Vec<u8>,
}

/// Simulated PE state
struct MockPe {
    mem_size: u64,
    /// Sparse memory (page number -> page contents)
    pages: BTreeMap<u64, Vec<u8>>,
    regs: DtuRegs,
    tlb: BTreeMap<(VpeId, u64), (u64, PteFlags)>,
    agent: AgentMode,
    /// Polls left until the pending request is acknowledged
    pending_ack: Option<u32>,
    block_on_store: bool,
    irqs: u32,
    wakeups: u32,
    suspended: bool,
    resets: Vec<u64>,
}

impl MockPe {
    fn new(mem_size: u64) -> Self {
        Self {
            mem_size,
            pages: BTreeMap::new(),
            regs: DtuRegs::new(),
            tlb: BTreeMap::new(),
            agent: AgentMode::Responsive {
                polls_before_ack: 0,
            },
            pending_ack: None,
            block_on_store: false,
            irqs: 0,
            wakeups: 0,
            suspended: true,
            resets: Vec::new(),
        }
    }

    fn read_bytes(&self, addr: u64, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            let a = addr + i as u64;
            *b = self
                .pages
                .get(&(a >> PAGE_BITS))
                .map(|p| p[(a & PAGE_MASK) as usize])
                .unwrap_or(0);
        }
    }

    fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            let a = addr + i as u64;
            let page = self
                .pages
                .entry(a >> PAGE_BITS)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize]);
            page[(a & PAGE_MASK) as usize] = *b;
        }
    }

    fn flags(&self) -> u64 {
        let mut w = [0u8; 8];
        self.read_bytes(RCTMUX_FLAGS, &mut w);
        u64::from_le_bytes(w)
    }

    fn set_flags(&mut self, value: u64) {
        self.write_bytes(RCTMUX_FLAGS, &value.to_le_bytes());
    }

    fn arm_ack(&mut self) {
        if let AgentMode::Responsive { polls_before_ack } = self.agent {
            self.pending_ack = Some(polls_before_ack);
        }
    }

    /// Called whenever the kernel reads the flags word
    fn poll(&mut self) {
        match self.pending_ack {
            Some(0) => {
                self.pending_ack = None;
                self.acknowledge();
            }
            Some(n) => self.pending_ack = Some(n - 1),
            None => {}
        }
    }

    fn acknowledge(&mut self) {
        let flags = RctMuxFlags::from_bits_truncate(self.flags() & 0xFFFF_FFFF);
        let mut ack = flags | RctMuxFlags::SIGNAL;
        if flags.contains(RctMuxFlags::STORE) {
            ack.remove(RctMuxFlags::WAITING);
            if self.block_on_store {
                ack |= RctMuxFlags::BLOCK;
                self.block_on_store = false;
            }
            self.suspended = true;
        } else {
            ack.remove(RctMuxFlags::WAITING);
            self.suspended = !flags.contains(RctMuxFlags::RESTORE);
        }
        self.set_flags((self.flags() & !0xFFFF_FFFF) | ack.bits());
    }

    fn in_dtu_window(addr: u64, len: usize) -> bool {
        addr >= DTU_BASE_ADDR && addr + len as u64 <= DTU_BASE_ADDR + DtuRegs::SIZE as u64
    }

    fn check_ep(ep: EpId) -> Result<(), DtuError> {
        if ep >= EP_COUNT {
            return Err(DtuError::InvalidEp);
        }
        Ok(())
    }
}

/// Mock DTU for testing
///
/// Provides simulated PE memory, DTU registers, a switching agent and a
/// record of everything the kernel sent, for testing kernel logic without a
/// real platform.
pub struct MockDtu {
    /// Simulated time in cycles
    time: AtomicU64,
    pes: RefCell<Vec<MockPe>>,
    sent: RefCell<Vec<SentMsg>>,
    replies: RefCell<Vec<SentReply>>,
    /// Captured operations, one line per call
    op_log: RefCell<Vec<String>>,
}

impl MockDtu {
    /// Create a mock with `pe_count` PEs of [`DEFAULT_MEM_SIZE`] bytes each
    pub fn new(pe_count: usize) -> Self {
        Self {
            time: AtomicU64::new(0),
            pes: RefCell::new((0..pe_count).map(|_| MockPe::new(DEFAULT_MEM_SIZE)).collect()),
            sent: RefCell::new(Vec::new()),
            replies: RefCell::new(Vec::new()),
            op_log: RefCell::new(Vec::new()),
        }
    }

    /// Advance the simulated time by the given number of cycles
    pub fn advance_time(&self, cycles: u64) {
        self.time.fetch_add(cycles, Ordering::SeqCst);
    }

    /// Set the simulated time to a specific value
    pub fn set_time(&self, cycles: u64) {
        self.time.store(cycles, Ordering::SeqCst);
    }

    /// Change how the agent of `pe` answers from now on
    pub fn set_agent(&self, pe: usize, mode: AgentMode) {
        if let Some(p) = self.pes.borrow_mut().get_mut(pe) {
            p.agent = mode;
        }
    }

    /// Let the next store on `pe` report that the VPE waits for a message
    pub fn block_next_store(&self, pe: usize) {
        if let Some(p) = self.pes.borrow_mut().get_mut(pe) {
            p.block_on_store = true;
        }
    }

    /// Set a general DTU register (e.g. idle time or message count)
    pub fn set_reg(&self, pe: usize, reg: DtuReg, value: u64) {
        if let Some(p) = self.pes.borrow_mut().get_mut(pe) {
            p.regs.set(reg, value);
        }
    }

    pub fn reg(&self, pe: usize, reg: DtuReg) -> u64 {
        self.pes.borrow().get(pe).map(|p| p.regs.get(reg)).unwrap_or(0)
    }

    /// Current endpoint configuration of `pe`
    pub fn ep(&self, pe: usize, ep: EpId) -> Option<EpDesc> {
        self.pes.borrow().get(pe).and_then(|p| p.regs.ep(ep))
    }

    /// Copy of the full register file of `pe`
    pub fn regs(&self, pe: usize) -> DtuRegs {
        self.pes
            .borrow()
            .get(pe)
            .map(|p| p.regs.clone())
            .unwrap_or_default()
    }

    /// Flags word currently stored for the agent of `pe` (does not count as a poll)
    pub fn agent_flags(&self, pe: usize) -> u64 {
        self.pes.borrow().get(pe).map(|p| p.flags()).unwrap_or(0)
    }

    pub fn read_word(&self, pe: usize, addr: u64) -> u64 {
        let mut w = [0u8; 8];
        if let Some(p) = self.pes.borrow().get(pe) {
            p.read_bytes(addr, &mut w);
        }
        u64::from_le_bytes(w)
    }

    pub fn irq_count(&self, pe: usize) -> u32 {
        self.pes.borrow().get(pe).map(|p| p.irqs).unwrap_or(0)
    }

    pub fn wakeup_count(&self, pe: usize) -> u32 {
        self.pes.borrow().get(pe).map(|p| p.wakeups).unwrap_or(0)
    }

    pub fn is_suspended(&self, pe: usize) -> bool {
        self.pes.borrow().get(pe).map(|p| p.suspended).unwrap_or(true)
    }

    /// Entry addresses of all resets of `pe`, oldest first
    pub fn resets(&self, pe: usize) -> Vec<u64> {
        self.pes
            .borrow()
            .get(pe)
            .map(|p| p.resets.clone())
            .unwrap_or_default()
    }

    pub fn tlb_entry(&self, pe: usize, vpe: VpeId, virt: u64) -> Option<(u64, PteFlags)> {
        self.pes
            .borrow()
            .get(pe)
            .and_then(|p| p.tlb.get(&(vpe, virt & !PAGE_MASK)).copied())
    }

    /// All messages delivered so far
    pub fn sent_messages(&self) -> Vec<SentMsg> {
        self.sent.borrow().clone()
    }

    /// Remove and return all delivered messages
    pub fn take_sent(&self) -> Vec<SentMsg> {
        core::mem::take(&mut *self.sent.borrow_mut())
    }

    pub fn replies(&self) -> Vec<SentReply> {
        self.replies.borrow().clone()
    }

    pub fn take_replies(&self) -> Vec<SentReply> {
        core::mem::take(&mut *self.replies.borrow_mut())
    }

    /// Get all captured operations
    pub fn get_op_log(&self) -> Vec<String> {
        self.op_log.borrow().clone()
    }

    /// Check if a specific operation was logged
    pub fn has_log_containing(&self, substr: &str) -> bool {
        self.op_log.borrow().iter().any(|msg| msg.contains(substr))
    }

    pub fn clear_op_log(&self) {
        self.op_log.borrow_mut().clear();
    }

    fn log(&self, msg: String) {
        log::trace!(target: "mockdtu", "{}", msg);
        self.op_log.borrow_mut().push(msg);
    }

    /// `ep` of the PE's current register file must be a receive endpoint
    fn check_receiver(&self, vpe: VpeDesc, ep: EpId) -> Result<(), DtuError> {
        self.with_pe(vpe.pe, |p| {
            MockPe::check_ep(ep)?;
            match p.regs.ep(ep) {
                Some(EpDesc::Recv(_)) => Ok(()),
                _ => Err(DtuError::NoReceiver),
            }
        })
    }

    fn with_pe<R>(
        &self,
        pe: usize,
        f: impl FnOnce(&mut MockPe) -> Result<R, DtuError>,
    ) -> Result<R, DtuError> {
        let mut pes = self.pes.borrow_mut();
        let p = pes.get_mut(pe).ok_or(DtuError::InvalidPe)?;
        f(p)
    }
}

impl Default for MockDtu {
    fn default() -> Self {
        Self::new(4)
    }
}

impl Dtu for MockDtu {
    fn time(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }

    fn read_mem(&self, vpe: VpeDesc, addr: u64, buf: &mut [u8]) -> Result<(), DtuError> {
        let now = self.time();
        self.with_pe(vpe.pe, |p| {
            if MockPe::in_dtu_window(addr, buf.len()) {
                p.regs.set(DtuReg::CurTime, now);
                let image = p.regs.to_bytes();
                let off = (addr - DTU_BASE_ADDR) as usize;
                buf.copy_from_slice(&image[off..off + buf.len()]);
                return Ok(());
            }
            if addr + buf.len() as u64 > p.mem_size {
                return Err(DtuError::OutOfBounds);
            }
            if addr <= RCTMUX_FLAGS && RCTMUX_FLAGS < addr + buf.len() as u64 {
                p.poll();
            }
            p.read_bytes(addr, buf);
            Ok(())
        })
    }

    fn write_mem(&self, vpe: VpeDesc, addr: u64, data: &[u8]) -> Result<(), DtuError> {
        let mut reset = None;
        self.with_pe(vpe.pe, |p| {
            if MockPe::in_dtu_window(addr, data.len()) {
                let mut image = p.regs.to_bytes();
                let off = (addr - DTU_BASE_ADDR) as usize;
                image[off..off + data.len()].copy_from_slice(data);
                p.regs = DtuRegs::from_bytes(&image).ok_or(DtuError::OutOfBounds)?;
                let cmd = p.regs.get(DtuReg::ExtCmd);
                if ExtCmd::from_u64(cmd) == Some(ExtCmd::Reset) {
                    p.resets.push(cmd >> 3);
                    p.suspended = false;
                    reset = Some(cmd >> 3);
                }
                p.regs.set(DtuReg::ExtCmd, 0);
                return Ok(());
            }
            if addr + data.len() as u64 > p.mem_size {
                return Err(DtuError::OutOfBounds);
            }
            p.write_bytes(addr, data);
            Ok(())
        })?;
        if let Some(entry) = reset {
            self.log(format!("reset pe={} entry={:#x}", vpe.pe, entry));
        }
        Ok(())
    }

    fn config_recv(&self, vpe: VpeDesc, ep: EpId, desc: &RecvEp) -> Result<(), DtuError> {
        self.with_pe(vpe.pe, |p| {
            MockPe::check_ep(ep)?;
            p.regs.set_ep(ep, &EpDesc::Recv(*desc));
            Ok(())
        })?;
        self.log(format!("config_recv pe={} ep={} buf={:#x}", vpe.pe, ep, desc.buf));
        Ok(())
    }

    fn config_send(&self, vpe: VpeDesc, ep: EpId, desc: &SendEp) -> Result<(), DtuError> {
        self.with_pe(vpe.pe, |p| {
            MockPe::check_ep(ep)?;
            p.regs.set_ep(ep, &EpDesc::Send(*desc));
            Ok(())
        })?;
        self.log(format!("config_send pe={} ep={} label={:#x}", vpe.pe, ep, desc.label));
        Ok(())
    }

    fn config_mem(&self, vpe: VpeDesc, ep: EpId, desc: &MemEp) -> Result<(), DtuError> {
        self.with_pe(vpe.pe, |p| {
            MockPe::check_ep(ep)?;
            p.regs.set_ep(ep, &EpDesc::Memory(*desc));
            Ok(())
        })?;
        self.log(format!("config_mem pe={} ep={} addr={:#x}", vpe.pe, ep, desc.addr));
        Ok(())
    }

    fn invalidate_ep(&self, vpe: VpeDesc, ep: EpId) -> Result<(), DtuError> {
        self.with_pe(vpe.pe, |p| {
            MockPe::check_ep(ep)?;
            p.regs.set_ep(ep, &EpDesc::Invalid);
            Ok(())
        })?;
        self.log(format!("invalidate_ep pe={} ep={}", vpe.pe, ep));
        Ok(())
    }

    fn inject_irq(&self, vpe: VpeDesc) -> Result<(), DtuError> {
        self.with_pe(vpe.pe, |p| {
            p.irqs += 1;
            let flags = RctMuxFlags::from_bits_truncate(p.flags() & 0xFFFF_FFFF);
            if flags.contains(RctMuxFlags::STORE) {
                p.arm_ack();
            }
            Ok(())
        })?;
        self.log(format!("inject_irq pe={}", vpe.pe));
        Ok(())
    }

    fn wakeup(&self, vpe: VpeDesc) -> Result<(), DtuError> {
        self.with_pe(vpe.pe, |p| {
            p.wakeups += 1;
            let flags = RctMuxFlags::from_bits_truncate(p.flags() & 0xFFFF_FFFF);
            if flags.contains(RctMuxFlags::WAITING) && !flags.contains(RctMuxFlags::STORE) {
                p.arm_ack();
            }
            Ok(())
        })?;
        self.log(format!("wakeup pe={}", vpe.pe));
        Ok(())
    }

    fn suspend(&self, vpe: VpeDesc) -> Result<(), DtuError> {
        self.with_pe(vpe.pe, |p| {
            p.suspended = true;
            Ok(())
        })?;
        self.log(format!("suspend pe={}", vpe.pe));
        Ok(())
    }

    fn map_page(
        &self,
        vpe: VpeDesc,
        virt: u64,
        phys: u64,
        flags: PteFlags,
    ) -> Result<(), DtuError> {
        self.with_pe(vpe.pe, |p| {
            p.tlb.insert((vpe.vpe, virt & !PAGE_MASK), (phys, flags));
            Ok(())
        })?;
        self.log(format!("map_page pe={} virt={:#x} phys={:#x}", vpe.pe, virt, phys));
        Ok(())
    }

    fn unmap_page(&self, vpe: VpeDesc, virt: u64) -> Result<(), DtuError> {
        self.with_pe(vpe.pe, |p| {
            p.tlb.remove(&(vpe.vpe, virt & !PAGE_MASK));
            Ok(())
        })?;
        self.log(format!("unmap_page pe={} virt={:#x}", vpe.pe, virt));
        Ok(())
    }

    fn send_to(
        &self,
        vpe: VpeDesc,
        ep: EpId,
        label: Label,
        reply_label: Label,
        msg: &[u8],
    ) -> Result<(), DtuError> {
        self.check_receiver(vpe, ep)?;
        self.sent.borrow_mut().push(SentMsg {
            dst: vpe,
            ep,
            label,
            reply_label,
            data: msg.to_vec(),
            header: None,
        });
        self.log(format!("send pe={} ep={} label={:#x}", vpe.pe, ep, label));
        Ok(())
    }

    fn forward_to(&self, vpe: VpeDesc, ep: EpId, hdr: &MsgHeader, msg: &[u8]) -> Result<(), DtuError> {
        self.check_receiver(vpe, ep)?;
        self.sent.borrow_mut().push(SentMsg {
            dst: vpe,
            ep,
            label: hdr.label,
            reply_label: hdr.reply_label,
            data: msg.to_vec(),
            header: Some(*hdr),
        });
        self.log(format!(
            "forward pe={} ep={} from vpe={} label={:#x}",
            vpe.pe, ep, hdr.sender_vpe, hdr.label
        ));
        Ok(())
    }

    fn reply(&self, vpe: VpeDesc, label: Label, msg: &[u8]) -> Result<(), DtuError> {
        self.with_pe(vpe.pe, |_| Ok(()))?;
        self.replies.borrow_mut().push(SentReply {
            dst: vpe,
            label,
            data: msg.to_vec(),
        });
        self.log(format!("reply pe={} vpe={} label={:#x}", vpe.pe, vpe.vpe, label));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pex_dtu::{rctmux_word, HeaderFlags, Perm};

    fn read_flags(dtu: &MockDtu, pe: usize) -> RctMuxFlags {
        let mut w = [0u8; 8];
        dtu.read_mem(VpeDesc::pe_only(pe), RCTMUX_FLAGS, &mut w).unwrap();
        RctMuxFlags::from_bits_truncate(u64::from_le_bytes(w) & 0xFFFF_FFFF)
    }

    fn write_flags(dtu: &MockDtu, pe: usize, flags: RctMuxFlags) {
        let word = rctmux_word(flags, pe);
        dtu.write_mem(VpeDesc::pe_only(pe), RCTMUX_FLAGS, &word.to_le_bytes())
            .unwrap();
    }

    #[test]
    fn test_mock_time() {
        let dtu = MockDtu::new(1);
        assert_eq!(dtu.time(), 0);
        dtu.advance_time(1000);
        assert_eq!(dtu.time(), 1000);
        dtu.set_time(5);
        assert_eq!(dtu.time(), 5);
    }

    #[test]
    fn test_memory_roundtrip_and_bounds() {
        let dtu = MockDtu::new(2);
        let desc = VpeDesc::pe_only(1);
        dtu.write_mem(desc, 0x1234, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 4];
        dtu.read_mem(desc, 0x1233, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3]);

        assert_eq!(
            dtu.read_mem(VpeDesc::pe_only(7), 0, &mut buf),
            Err(DtuError::InvalidPe)
        );
        assert_eq!(
            dtu.write_mem(desc, DEFAULT_MEM_SIZE, &[0]),
            Err(DtuError::OutOfBounds)
        );
    }

    #[test]
    fn test_agent_acks_store_on_first_poll() {
        let dtu = MockDtu::new(1);
        write_flags(&dtu, 0, RctMuxFlags::STORE | RctMuxFlags::WAITING);
        dtu.inject_irq(VpeDesc::pe_only(0)).unwrap();

        let flags = read_flags(&dtu, 0);
        assert!(flags.contains(RctMuxFlags::SIGNAL));
        assert!(!flags.contains(RctMuxFlags::BLOCK));
        assert_eq!(dtu.irq_count(0), 1);
    }

    #[test]
    fn test_agent_delayed_ack() {
        let dtu = MockDtu::new(1);
        dtu.set_agent(0, AgentMode::Responsive { polls_before_ack: 2 });
        write_flags(&dtu, 0, RctMuxFlags::RESTORE | RctMuxFlags::WAITING);
        dtu.wakeup(VpeDesc::pe_only(0)).unwrap();

        assert!(!read_flags(&dtu, 0).contains(RctMuxFlags::SIGNAL));
        assert!(!read_flags(&dtu, 0).contains(RctMuxFlags::SIGNAL));
        assert!(read_flags(&dtu, 0).contains(RctMuxFlags::SIGNAL));
        assert!(!dtu.is_suspended(0));
    }

    #[test]
    fn test_unresponsive_agent_never_acks() {
        let dtu = MockDtu::new(1);
        dtu.set_agent(0, AgentMode::Unresponsive);
        write_flags(&dtu, 0, RctMuxFlags::STORE | RctMuxFlags::WAITING);
        dtu.inject_irq(VpeDesc::pe_only(0)).unwrap();
        for _ in 0..10 {
            assert!(!read_flags(&dtu, 0).contains(RctMuxFlags::SIGNAL));
        }
    }

    #[test]
    fn test_blocked_store() {
        let dtu = MockDtu::new(1);
        dtu.block_next_store(0);
        write_flags(&dtu, 0, RctMuxFlags::STORE | RctMuxFlags::WAITING);
        dtu.inject_irq(VpeDesc::pe_only(0)).unwrap();
        assert!(read_flags(&dtu, 0).contains(RctMuxFlags::BLOCK));
    }

    #[test]
    fn test_register_window_access() {
        let dtu = MockDtu::new(1);
        let desc = VpeDesc::pe_only(0);
        dtu.config_mem(
            desc,
            4,
            &MemEp {
                pe: 1,
                vpe: 2,
                addr: 0x1000,
                size: 0x2000,
                perm: Perm::R,
            },
        )
        .unwrap();

        let mut image = vec![0u8; DtuRegs::SIZE];
        dtu.read_mem(desc, DTU_BASE_ADDR, &mut image).unwrap();
        let regs = DtuRegs::from_bytes(&image).unwrap();
        assert_eq!(regs.ep(4), dtu.ep(0, 4));

        dtu.invalidate_ep(desc, 4).unwrap();
        assert_eq!(dtu.ep(0, 4), Some(EpDesc::Invalid));

        dtu.write_mem(desc, DTU_BASE_ADDR, &image).unwrap();
        assert_eq!(dtu.ep(0, 4), regs.ep(4));
    }

    #[test]
    fn test_reset_command_recorded() {
        let dtu = MockDtu::new(1);
        dtu.reset(VpeDesc::pe_only(0), 0x1000).unwrap();
        assert_eq!(dtu.resets(0), vec![0x1000]);
        assert_eq!(dtu.reg(0, DtuReg::ExtCmd), 0);
        assert!(dtu.has_log_containing("reset pe=0"));
    }

    #[test]
    fn test_send_requires_receive_ep() {
        let dtu = MockDtu::new(1);
        let desc = VpeDesc::new(0, 1);
        assert_eq!(
            dtu.send_to(desc, 3, 1, 2, b"hi"),
            Err(DtuError::NoReceiver)
        );
        dtu.config_recv(
            desc,
            3,
            &RecvEp {
                buf: 0,
                order: 10,
                msg_order: 6,
            },
        )
        .unwrap();
        dtu.send_to(desc, 3, 1, 2, b"hi").unwrap();
        let sent = dtu.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, b"hi".to_vec());
        assert_eq!(sent[0].header, None);
        assert!(dtu.sent_messages().is_empty());
    }

    #[test]
    fn test_forward_keeps_sender_header() {
        let dtu = MockDtu::new(2);
        let desc = VpeDesc::new(1, 4);
        let hdr = MsgHeader {
            flags: HeaderFlags::REPLY_ENABLED,
            sender_pe: 0,
            sender_ep: 2,
            reply_ep: 3,
            length: 2,
            sender_vpe: 7,
            reply_label: 0x10,
            label: 0x20,
        };
        assert_eq!(dtu.forward_to(desc, 2, &hdr, b"yo"), Err(DtuError::NoReceiver));

        let rep = RecvEp {
            buf: 0,
            order: 10,
            msg_order: 6,
        };
        dtu.config_recv(desc, 2, &rep).unwrap();
        dtu.forward_to(desc, 2, &hdr, b"yo").unwrap();
        let sent = dtu.take_sent();
        assert_eq!(sent[0].label, 0x20);
        assert_eq!(sent[0].reply_label, 0x10);
        assert_eq!(sent[0].header.map(|h| h.sender_vpe), Some(7));
    }
}
