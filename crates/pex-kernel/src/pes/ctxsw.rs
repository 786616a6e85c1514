//! Per-PE context switching
//!
//! A [`ContextSwitcher`] multiplexes the VPEs assigned to one PE. Switching
//! is a conversation with the switching agent on that PE, driven through
//! the flags word at [`RCTMUX_FLAGS`]:
//!
//! ```text
//!            switch & cur      +----------+
//!          /-------------------|   Idle   |<---------------\
//!          v                   +----------+                |
//!  +---------------+   switch & !cur |                +-------------+
//!  |  StoreWait    |                 |                | RestoreDone |
//!  |  e/ IRQ       |                 |                | e/ resume   |
//!  +---------------+                 |                +-------------+
//!          | (ack pending)           v                       ^ signal
//!  +---------------+  signal   +------------+   +-------------+
//!  |  StoreDone    |---------->|   Switch   |-->| RestoreWait |
//!  | e/ save regs  |           | e/ reset   |   | e/ wakeup   |
//!  +---------------+           +------------+   +-------------+
//! ```
//!
//! The request is written in the `*Wait` states; the machine then sits in
//! the matching `*Done` state until the agent sets [`RctMuxFlags::SIGNAL`].
//! The agent is polled once right away and then by timer with exponential
//! backoff. After `max_poll_retries` unanswered polls the PE is given up.
//!
//! Only one switch runs per PE. A switch requested in the middle of another
//! one is remembered and started once the machine is back in `Idle`.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use pex_dtu::{
    rctmux_word, Dtu, DtuError, RctMuxFlags, VpeDesc, RCTMUX_ENTRY, RCTMUX_FLAGS, RCTMUX_YIELD,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::timeouts::{TimerEvent, TimerId, Timeouts};
use super::vpemng::VpeManager;
use crate::platform::SwitchConfig;
use crate::types::{PeId, VpeFlags, VpeId, VpeState};

/// Transitions kept for inspection
const HISTORY_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwitchState {
    Idle,
    StoreWait,
    StoreDone,
    Switch,
    RestoreWait,
    RestoreDone,
}

/// Things the PE manager and the kernel have to react to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchEvent {
    /// A VPE runs again
    Resumed(VpeId),
    /// A preempted VPE should continue on another PE
    Migrate { vpe: VpeId, to: PeId },
    /// The switching agent of a PE stopped answering
    Failed(PeId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SwitchError {
    #[error("switching agent on PE {pe} did not answer")]
    AgentTimeout { pe: PeId },
    #[error("DTU access failed: {0}")]
    Dtu(DtuError),
    #[error("switch step invoked in state {0:?}")]
    InvalidState(SwitchState),
}

impl From<DtuError> for SwitchError {
    fn from(e: DtuError) -> Self {
        SwitchError::Dtu(e)
    }
}

/// What a switch step may touch besides the switcher itself
pub struct SwitchEnv<'a, D: Dtu> {
    pub dtu: &'a D,
    pub vpes: &'a mut VpeManager,
    pub timeouts: &'a mut Timeouts,
    pub cfg: &'a SwitchConfig,
    pub events: &'a mut Vec<SwitchEvent>,
    /// Idle PE that would take a preempted VPE
    pub spill: Option<PeId>,
}

#[derive(Debug)]
pub struct ContextSwitcher {
    pe: PeId,
    state: SwitchState,
    /// All VPEs assigned to the PE, except the idle VPE
    vpes: Vec<VpeId>,
    ready: VecDeque<VpeId>,
    cur: Option<VpeId>,
    idle: Option<VpeId>,
    slice: Option<TimerId>,
    poll: Option<TimerId>,
    wait_time: u64,
    retries: u32,
    /// Flags of the last acknowledgement
    ack: RctMuxFlags,
    /// The VPE being stored got work during the store
    wake_cur: bool,
    pending: bool,
    failed: bool,
    history: VecDeque<(u64, SwitchState)>,
}

impl ContextSwitcher {
    pub fn new(pe: PeId) -> Self {
        log::debug!(target: "ctxsw", "Initialized context switcher for PE {}", pe);
        Self {
            pe,
            state: SwitchState::Idle,
            vpes: Vec::new(),
            ready: VecDeque::new(),
            cur: None,
            idle: None,
            slice: None,
            poll: None,
            wait_time: 0,
            retries: 0,
            ack: RctMuxFlags::empty(),
            wake_cur: false,
            pending: false,
            failed: false,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    pub fn pe(&self) -> PeId {
        self.pe
    }

    pub fn state(&self) -> SwitchState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == SwitchState::Idle
    }

    pub fn current(&self) -> Option<VpeId> {
        self.cur
    }

    pub fn idle_vpe(&self) -> Option<VpeId> {
        self.idle
    }

    pub fn set_idle_vpe(&mut self, id: VpeId) {
        self.idle = Some(id);
    }

    /// Whether nothing but the idle VPE (or nothing at all) is on the PE
    pub fn runs_idle(&self) -> bool {
        self.cur.is_none() || self.cur == self.idle
    }

    pub fn ready(&self) -> impl Iterator<Item = VpeId> + '_ {
        self.ready.iter().copied()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn vpes(&self) -> &[VpeId] {
        &self.vpes
    }

    pub fn count(&self) -> usize {
        self.vpes.len()
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Recent state transitions with their time, oldest first
    pub fn history(&self) -> impl Iterator<Item = (u64, SwitchState)> + '_ {
        self.history.iter().copied()
    }

    /// Whether another VPE may join the PE
    pub fn can_mux(&self, vpes: &VpeManager) -> bool {
        self.vpes
            .iter()
            .all(|id| vpes.get(*id).map_or(true, |v| v.has(VpeFlags::MUXABLE)))
    }

    // ========================================================================
    // Queue management
    // ========================================================================

    pub fn add_vpe(&mut self, id: VpeId) {
        if !self.vpes.contains(&id) {
            self.vpes.push(id);
        }
    }

    /// Forget `id` without touching the running VPE
    pub fn detach(&mut self, vpes: &mut VpeManager, id: VpeId) {
        self.dequeue(vpes, id);
        self.vpes.retain(|v| *v != id);
    }

    /// Remove `id` from the PE; switches away if it is running
    ///
    /// Must only be called while the switcher is idle.
    pub fn remove_vpe<D: Dtu>(
        &mut self,
        env: &mut SwitchEnv<'_, D>,
        id: VpeId,
    ) -> Result<(), SwitchError> {
        self.detach(env.vpes, id);
        if self.cur != Some(id) {
            return Ok(());
        }
        if self.state != SwitchState::Idle {
            return Err(SwitchError::InvalidState(self.state));
        }
        if let Some(vpe) = env.vpes.get_mut(id) {
            vpe.clear_flags(VpeFlags::RESIDENT);
            if vpe.state() != VpeState::Dead {
                vpe.set_state(VpeState::Suspended);
            }
        }
        self.cur = None;
        self.start_switch(env, false)
    }

    /// Put `id` at the end of the ready queue
    pub fn enqueue(&mut self, vpes: &mut VpeManager, id: VpeId) {
        let vpe = match vpes.get_mut(id) {
            Some(v) => v,
            None => return,
        };
        if vpe.flags().intersects(VpeFlags::READY | VpeFlags::IDLE) {
            return;
        }
        vpe.set_flags(VpeFlags::READY);
        self.ready.push_back(id);
    }

    pub fn dequeue(&mut self, vpes: &mut VpeManager, id: VpeId) {
        if let Some(vpe) = vpes.get_mut(id) {
            vpe.clear_flags(VpeFlags::READY);
        }
        self.ready.retain(|v| *v != id);
    }

    /// Hand out a ready VPE that may change its PE
    pub fn steal(&mut self, vpes: &mut VpeManager) -> Option<VpeId> {
        let pos = self
            .ready
            .iter()
            .rposition(|id| vpes.get(*id).is_some_and(|v| v.can_migrate()))?;
        let id = self.ready.remove(pos)?;
        self.detach(vpes, id);
        Some(id)
    }

    // ========================================================================
    // Scheduling requests
    // ========================================================================

    /// Make `id` runnable and switch to it as soon as possible
    pub fn start_vpe<D: Dtu>(
        &mut self,
        env: &mut SwitchEnv<'_, D>,
        id: VpeId,
    ) -> Result<(), SwitchError> {
        if self.cur != Some(id) {
            self.enqueue(env.vpes, id);
            return self.start_switch(env, false);
        }
        if self.state != SwitchState::Idle || self.failed {
            return Ok(());
        }
        self.wait_time = env.cfg.init_wait_time;
        self.set_state(env.dtu.time(), SwitchState::RestoreWait);
        self.run(env)
    }

    /// Take `id` off the PE; it is not queued again
    ///
    /// The VPE loses its application; it runs again only after a new start.
    pub fn stop_vpe<D: Dtu>(
        &mut self,
        env: &mut SwitchEnv<'_, D>,
        id: VpeId,
    ) -> Result<(), SwitchError> {
        self.dequeue(env.vpes, id);
        if let Some(vpe) = env.vpes.get_mut(id) {
            vpe.clear_flags(VpeFlags::HASAPP);
        }
        if self.cur == Some(id) {
            return self.switch(env, false, true);
        }
        Ok(())
    }

    /// The running VPE gives up the PE
    ///
    /// Returns false if nobody else is ready, in which case it keeps running.
    pub fn yield_vpe<D: Dtu>(
        &mut self,
        env: &mut SwitchEnv<'_, D>,
        id: VpeId,
    ) -> Result<bool, SwitchError> {
        if self.cur != Some(id) || self.ready.is_empty() {
            return Ok(false);
        }
        self.start_switch(env, false)?;
        Ok(true)
    }

    /// A blocked VPE has work again
    ///
    /// It preempts the idle VPE right away and otherwise waits for the end
    /// of the current time slice. A VPE that is being stored goes back to
    /// the ready queue afterwards.
    pub fn unblock_vpe<D: Dtu>(
        &mut self,
        env: &mut SwitchEnv<'_, D>,
        id: VpeId,
    ) -> Result<(), SwitchError> {
        if self.cur == Some(id) {
            if matches!(self.state, SwitchState::StoreWait | SwitchState::StoreDone) {
                self.wake_cur = true;
            }
            return Ok(());
        }
        self.enqueue(env.vpes, id);
        if self.runs_idle() {
            return self.start_switch(env, false);
        }
        if self.slice.is_none() && self.state == SwitchState::Idle && !self.failed {
            self.arm_slice(env);
        }
        Ok(())
    }

    /// Switch to the next ready VPE (if any)
    pub fn start_switch<D: Dtu>(
        &mut self,
        env: &mut SwitchEnv<'_, D>,
        timedout: bool,
    ) -> Result<(), SwitchError> {
        self.switch(env, timedout, false)
    }

    /// An armed timer of this PE expired
    pub fn timer<D: Dtu>(
        &mut self,
        env: &mut SwitchEnv<'_, D>,
        id: TimerId,
        event: TimerEvent,
    ) -> Result<(), SwitchError> {
        match event {
            TimerEvent::TimeSlice(_) if self.slice == Some(id) => {
                self.slice = None;
                self.start_switch(env, true)
            }
            TimerEvent::SwitchPoll(_) if self.poll == Some(id) => {
                self.poll = None;
                self.continue_switch(env)
            }
            // cancelled or superseded
            _ => Ok(()),
        }
    }

    // ========================================================================
    // State machine
    // ========================================================================

    fn switch<D: Dtu>(
        &mut self,
        env: &mut SwitchEnv<'_, D>,
        timedout: bool,
        force: bool,
    ) -> Result<(), SwitchError> {
        if !timedout {
            if let Some(t) = self.slice.take() {
                env.timeouts.cancel(t);
            }
        }
        self.slice = None;

        if self.failed {
            return Ok(());
        }
        if self.state != SwitchState::Idle {
            self.pending = true;
            return Ok(());
        }

        let cur_alive = self
            .cur
            .and_then(|c| env.vpes.get(c))
            .is_some_and(|v| v.state() != VpeState::Dead);
        if self.ready.is_empty() && !force {
            if cur_alive {
                return Ok(());
            }
            if self.idle.is_none() {
                self.drop_cur(env.vpes);
                return Ok(());
            }
        }

        let now = env.dtu.time();
        if cur_alive {
            self.set_state(now, SwitchState::StoreWait);
        } else {
            self.drop_cur(env.vpes);
            self.set_state(now, SwitchState::Switch);
        }
        self.run(env)
    }

    /// Forget a current VPE that is dead or gone; nothing to store
    fn drop_cur(&mut self, vpes: &mut VpeManager) {
        self.wake_cur = false;
        if let Some(gone) = self.cur.take() {
            if let Some(v) = vpes.get_mut(gone) {
                v.clear_flags(VpeFlags::RESIDENT);
            }
        }
    }

    fn continue_switch<D: Dtu>(&mut self, env: &mut SwitchEnv<'_, D>) -> Result<(), SwitchError> {
        match self.state {
            SwitchState::StoreDone | SwitchState::RestoreDone => {}
            s => return Err(SwitchError::InvalidState(s)),
        }

        let acked = match self.acked(env.dtu) {
            Ok(a) => a,
            Err(e) => return Err(self.fail(env, SwitchError::Dtu(e))),
        };
        if acked {
            return self.run(env);
        }

        self.retries += 1;
        if self.retries > env.cfg.max_poll_retries {
            return Err(self.fail(env, SwitchError::AgentTimeout { pe: self.pe }));
        }
        self.wait_time = (self.wait_time * 2).min(env.cfg.max_wait_time);
        self.arm_poll(env);
        Ok(())
    }

    fn run<D: Dtu>(&mut self, env: &mut SwitchEnv<'_, D>) -> Result<(), SwitchError> {
        match self.steps(env) {
            Err(SwitchError::Dtu(e)) => Err(self.fail(env, SwitchError::Dtu(e))),
            res => res,
        }
    }

    fn steps<D: Dtu>(&mut self, env: &mut SwitchEnv<'_, D>) -> Result<(), SwitchError> {
        loop {
            log::trace!(
                target: "ctxsw",
                "PE {}: next; state={:?} (current={:?})",
                self.pe,
                self.state,
                self.cur
            );

            match self.state {
                SwitchState::Idle => return Ok(()),

                SwitchState::StoreWait => {
                    let cur = self.expect_cur()?;
                    self.send_flags(env.dtu, cur, RctMuxFlags::STORE | RctMuxFlags::WAITING)?;
                    env.dtu.inject_irq(VpeDesc::new(self.pe, cur))?;
                    self.set_state(env.dtu.time(), SwitchState::StoreDone);
                    if !self.await_ack(env)? {
                        return Ok(());
                    }
                }

                SwitchState::StoreDone => {
                    self.store_done(env)?;
                    self.set_state(env.dtu.time(), SwitchState::Switch);
                }

                SwitchState::Switch => {
                    if !self.schedule(env)? {
                        self.set_state(env.dtu.time(), SwitchState::Idle);
                        return Ok(());
                    }
                    self.set_state(env.dtu.time(), SwitchState::RestoreWait);
                }

                SwitchState::RestoreWait => {
                    let cur = self.expect_cur()?;
                    let vpe = env.vpes.get(cur).ok_or(SwitchError::InvalidState(self.state))?;
                    let mut flags = RctMuxFlags::WAITING;
                    if vpe.has(VpeFlags::INIT) {
                        flags |= RctMuxFlags::INIT;
                    }
                    if vpe.has(VpeFlags::HASAPP) {
                        flags |= RctMuxFlags::RESTORE;
                    }
                    let yield_time = if self.ready.is_empty() {
                        0
                    } else {
                        flags |= RctMuxFlags::REPORT;
                        env.cfg.time_slice
                    };

                    log::trace!(target: "ctxsw", "PE {}: waking up with flags={:?}", self.pe, flags);
                    let desc = VpeDesc::new(self.pe, cur);
                    env.dtu.write_mem(desc, RCTMUX_YIELD, &yield_time.to_le_bytes())?;
                    self.send_flags(env.dtu, cur, flags)?;
                    env.dtu.wakeup(desc)?;
                    self.set_state(env.dtu.time(), SwitchState::RestoreDone);
                    if !self.await_ack(env)? {
                        return Ok(());
                    }
                }

                SwitchState::RestoreDone => {
                    self.restore_done(env)?;
                    self.set_state(env.dtu.time(), SwitchState::Idle);
                    if self.pending {
                        self.pending = false;
                        return self.switch(env, false, false);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Save the outgoing VPE and decide whether it goes back to the queue
    fn store_done<D: Dtu>(&mut self, env: &mut SwitchEnv<'_, D>) -> Result<(), SwitchError> {
        let cur = self.expect_cur()?;
        self.cur = None;
        let pe = self.pe;
        let now = env.dtu.time();
        let ack = self.ack;
        let time_slice = env.cfg.time_slice;

        let vpe = env
            .vpes
            .get_mut(cur)
            .ok_or(SwitchError::InvalidState(self.state))?;
        vpe.dtu_state_mut().save(env.dtu, VpeDesc::pe_only(pe))?;

        let idle = vpe.dtu_state().idle_time();
        let woken = core::mem::take(&mut self.wake_cur);
        let blocked = !woken
            && (ack.contains(RctMuxFlags::BLOCK) || idle >= time_slice)
            && vpe.dtu_state().msg_count() == 0;
        log::debug!(
            target: "ctxsw",
            "PE {}: VPE {} idled for {} of {} cycles; {}",
            pe,
            cur,
            idle,
            now.saturating_sub(vpe.last_sched()),
            if blocked { "blocked" } else { "ready" }
        );

        vpe.clear_flags(VpeFlags::RESIDENT);
        if vpe.state() != VpeState::Dead {
            vpe.set_state(VpeState::Suspended);
        }
        let requeue = !blocked
            && vpe.has(VpeFlags::HASAPP)
            && !vpe.has(VpeFlags::IDLE)
            && vpe.state() != VpeState::Dead;
        let migratable = vpe.can_migrate();

        if requeue {
            match env.spill {
                Some(to) if migratable => env.events.push(SwitchEvent::Migrate { vpe: cur, to }),
                _ => self.enqueue(env.vpes, cur),
            }
        }
        Ok(())
    }

    /// Load the next VPE onto the PE; false if there is none
    fn schedule<D: Dtu>(&mut self, env: &mut SwitchEnv<'_, D>) -> Result<bool, SwitchError> {
        let next = match self.ready.pop_front() {
            Some(id) => {
                if let Some(v) = env.vpes.get_mut(id) {
                    v.clear_flags(VpeFlags::READY);
                }
                id
            }
            None => match self.idle {
                Some(id) => id,
                None => return Ok(false),
            },
        };

        let pe = self.pe;
        let now = env.dtu.time();
        let vpe = env
            .vpes
            .get_mut(next)
            .ok_or(SwitchError::InvalidState(self.state))?;
        let desc = VpeDesc::new(pe, next);
        vpe.set_flags(VpeFlags::RESIDENT);
        vpe.set_last_sched(now);
        env.dtu.reset(desc, RCTMUX_ENTRY)?;
        let root = vpe.root_pt();
        vpe.dtu_state_mut().restore(env.dtu, desc, next, root)?;
        log::debug!(target: "ctxsw", "PE {}: switching to VPE {} '{}'", pe, next, vpe.name());

        self.cur = Some(next);
        Ok(true)
    }

    fn restore_done<D: Dtu>(&mut self, env: &mut SwitchEnv<'_, D>) -> Result<(), SwitchError> {
        let cur = self.expect_cur()?;
        if let Some(vpe) = env.vpes.get_mut(cur) {
            vpe.clear_flags(VpeFlags::INIT);
            vpe.set_state(VpeState::Running);
        }
        self.send_flags(env.dtu, cur, RctMuxFlags::empty())?;
        env.events.push(SwitchEvent::Resumed(cur));

        if !self.ready.is_empty() && self.slice.is_none() {
            self.arm_slice(env);
        }
        Ok(())
    }

    // ========================================================================
    // Agent communication
    // ========================================================================

    fn send_flags<D: Dtu>(&self, dtu: &D, vpe: VpeId, flags: RctMuxFlags) -> Result<(), DtuError> {
        let word = rctmux_word(flags, self.pe);
        dtu.write_mem(VpeDesc::new(self.pe, vpe), RCTMUX_FLAGS, &word.to_le_bytes())
    }

    fn acked<D: Dtu>(&mut self, dtu: &D) -> Result<bool, DtuError> {
        let mut buf = [0u8; 8];
        dtu.read_mem(VpeDesc::pe_only(self.pe), RCTMUX_FLAGS, &mut buf)?;
        let flags = RctMuxFlags::from_bits_truncate(u64::from_le_bytes(buf) & 0xFFFF_FFFF);
        if flags.contains(RctMuxFlags::SIGNAL) {
            self.ack = flags;
            return Ok(true);
        }
        Ok(false)
    }

    /// Poll once; arm the poll timer if the agent has not answered yet
    fn await_ack<D: Dtu>(&mut self, env: &mut SwitchEnv<'_, D>) -> Result<bool, SwitchError> {
        self.wait_time = env.cfg.init_wait_time;
        self.retries = 0;
        if self.acked(env.dtu)? {
            return Ok(true);
        }
        self.arm_poll(env);
        Ok(false)
    }

    fn arm_poll<D: Dtu>(&mut self, env: &mut SwitchEnv<'_, D>) {
        let deadline = env.dtu.time() + self.wait_time;
        self.poll = Some(env.timeouts.add(deadline, TimerEvent::SwitchPoll(self.pe)));
    }

    fn arm_slice<D: Dtu>(&mut self, env: &mut SwitchEnv<'_, D>) {
        let deadline = env.dtu.time() + env.cfg.time_slice;
        self.slice = Some(env.timeouts.add(deadline, TimerEvent::TimeSlice(self.pe)));
    }

    /// Give up the PE
    fn fail<D: Dtu>(&mut self, env: &mut SwitchEnv<'_, D>, err: SwitchError) -> SwitchError {
        log::error!(
            target: "ctxsw",
            "PE {}: {} in state {:?}; PE disabled",
            self.pe,
            err,
            self.state
        );
        self.failed = true;
        self.pending = false;
        if let Some(t) = self.slice.take() {
            env.timeouts.cancel(t);
        }
        if let Some(t) = self.poll.take() {
            env.timeouts.cancel(t);
        }
        self.set_state(env.dtu.time(), SwitchState::Idle);
        env.events.push(SwitchEvent::Failed(self.pe));
        err
    }

    fn expect_cur(&self) -> Result<VpeId, SwitchError> {
        self.cur.ok_or(SwitchError::InvalidState(self.state))
    }

    fn set_state(&mut self, now: u64, state: SwitchState) {
        self.state = state;
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back((now, state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pex_dtu::{DtuReg, EpDesc, SendEp};
    use pex_dtu_mock::{AgentMode, MockDtu};

    const PE: PeId = 1;

    struct Fixture {
        dtu: MockDtu,
        vpes: VpeManager,
        timeouts: Timeouts,
        cfg: SwitchConfig,
        events: Vec<SwitchEvent>,
        ctx: ContextSwitcher,
    }

    impl Fixture {
        fn new() -> Self {
            let mut vpes = VpeManager::new();
            let mut ctx = ContextSwitcher::new(PE);
            let idle = vpes.create("idle", PE, VpeFlags::IDLE | VpeFlags::INIT).unwrap();
            ctx.set_idle_vpe(idle);
            Self {
                dtu: MockDtu::new(2),
                vpes,
                timeouts: Timeouts::new(),
                cfg: SwitchConfig {
                    time_slice: 1000,
                    init_wait_time: 10,
                    max_wait_time: 80,
                    max_poll_retries: 3,
                    migration: false,
                },
                events: Vec::new(),
                ctx,
            }
        }

        fn with<R>(
            &mut self,
            f: impl FnOnce(&mut ContextSwitcher, &mut SwitchEnv<'_, MockDtu>) -> R,
        ) -> R {
            let mut env = SwitchEnv {
                dtu: &self.dtu,
                vpes: &mut self.vpes,
                timeouts: &mut self.timeouts,
                cfg: &self.cfg,
                events: &mut self.events,
                spill: None,
            };
            f(&mut self.ctx, &mut env)
        }

        fn app(&mut self, name: &str) -> VpeId {
            let flags = VpeFlags::MUXABLE | VpeFlags::HASAPP | VpeFlags::INIT;
            let id = self.vpes.create(name, PE, flags).unwrap();
            self.ctx.add_vpe(id);
            id
        }

        fn start(&mut self, id: VpeId) {
            self.with(|ctx, env| ctx.start_vpe(env, id)).unwrap();
        }

        /// Jump to the next deadline and fire everything due
        fn fire(&mut self) -> Result<(), SwitchError> {
            let deadline = self.timeouts.next_deadline().unwrap();
            self.dtu.set_time(deadline);
            for (id, ev) in self.timeouts.pop_due(deadline) {
                self.with(|ctx, env| ctx.timer(env, id, ev))?;
            }
            Ok(())
        }

        fn state(&self, id: VpeId) -> VpeState {
            self.vpes.get(id).unwrap().state()
        }

        fn resumed(&mut self) -> Vec<VpeId> {
            self.events
                .drain(..)
                .filter_map(|e| match e {
                    SwitchEvent::Resumed(v) => Some(v),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn test_first_start_skips_store() {
        let mut f = Fixture::new();
        let v1 = f.app("v1");
        f.start(v1);

        assert_eq!(f.dtu.irq_count(PE), 0);
        assert_eq!(f.dtu.resets(PE), [RCTMUX_ENTRY]);
        assert_eq!(f.state(v1), VpeState::Running);
        assert!(f.vpes.get(v1).unwrap().is_resident());
        assert!(!f.vpes.get(v1).unwrap().has(VpeFlags::INIT));
        assert_eq!(f.ctx.state(), SwitchState::Idle);
        assert_eq!(f.ctx.current(), Some(v1));
        assert_eq!(f.resumed(), [v1]);
        // alone on the PE: no time slice
        assert!(f.timeouts.is_empty());
        assert_eq!(f.dtu.read_word(PE, RCTMUX_YIELD), 0);
    }

    #[test]
    fn test_switch_passes_all_states() {
        let mut f = Fixture::new();
        let v1 = f.app("v1");
        let v2 = f.app("v2");
        f.start(v1);
        f.start(v2);

        let states: Vec<_> = f.ctx.history().map(|(_, s)| s).collect();
        assert_eq!(
            states[states.len() - 6..],
            [
                SwitchState::StoreWait,
                SwitchState::StoreDone,
                SwitchState::Switch,
                SwitchState::RestoreWait,
                SwitchState::RestoreDone,
                SwitchState::Idle,
            ]
        );
        assert_eq!(f.ctx.current(), Some(v2));
        assert_eq!(f.state(v2), VpeState::Running);
        assert_eq!(f.state(v1), VpeState::Suspended);
        assert!(!f.vpes.get(v1).unwrap().is_resident());
        assert_eq!(f.ctx.ready().collect::<Vec<_>>(), [v1]);
        assert_eq!(f.dtu.irq_count(PE), 1);
        // v1 is waiting: v2 gets a slice and reports idle phases
        assert_eq!(f.timeouts.len(), 1);
        assert_eq!(f.dtu.read_word(PE, RCTMUX_YIELD), 1000);
    }

    #[test]
    fn test_yield_without_ready_keeps_running() {
        let mut f = Fixture::new();
        let v1 = f.app("v1");
        f.start(v1);
        let switched = f.with(|ctx, env| ctx.yield_vpe(env, v1)).unwrap();
        assert!(!switched);
        assert_eq!(f.dtu.irq_count(PE), 0);
        assert_eq!(f.ctx.current(), Some(v1));
    }

    #[test]
    fn test_blocked_vpe_leaves_queue() {
        let mut f = Fixture::new();
        let v1 = f.app("v1");
        let v2 = f.app("v2");
        f.start(v1);
        f.dtu.block_next_store(PE);
        f.start(v2);
        assert_eq!(f.ctx.current(), Some(v2));
        assert_eq!(f.ctx.ready_len(), 0);
        assert_eq!(f.state(v1), VpeState::Suspended);
        assert!(f.timeouts.is_empty());

        // unread messages keep a VPE ready even if it asked to block
        f.dtu.set_reg(PE, DtuReg::MsgCnt, 1);
        f.dtu.block_next_store(PE);
        f.with(|ctx, env| ctx.unblock_vpe(env, v1)).unwrap();
        assert_eq!(f.timeouts.len(), 1);
        f.fire().unwrap();
        assert_eq!(f.ctx.current(), Some(v1));
        assert_eq!(f.ctx.ready().collect::<Vec<_>>(), [v2]);
    }

    #[test]
    fn test_idle_vpe_when_nothing_ready() {
        let mut f = Fixture::new();
        let v1 = f.app("v1");
        f.start(v1);
        f.with(|ctx, env| ctx.stop_vpe(env, v1)).unwrap();
        let idle = f.ctx.idle_vpe();
        assert_eq!(f.ctx.current(), idle);
        assert!(f.ctx.runs_idle());
        assert_eq!(f.ctx.ready_len(), 0);
        // the idle VPE has no application to restore
        assert!(f.dtu.is_suspended(PE));
    }

    #[test]
    fn test_endpoints_survive_round_trip() {
        let mut f = Fixture::new();
        let v1 = f.app("v1");
        let v2 = f.app("v2");
        f.start(v1);
        let sep = SendEp {
            dst_pe: 3,
            dst_ep: 5,
            dst_vpe: 9,
            label: 0xABCD,
            msg_order: 6,
            credits: 4,
        };
        let dtu = &f.dtu;
        f.vpes.get_mut(v1).unwrap().config_snd_ep(dtu, 7, sep).unwrap();
        let before = f.dtu.regs(PE);

        f.start(v2);
        assert_eq!(f.dtu.ep(PE, 7), Some(EpDesc::Invalid));
        f.fire().unwrap();
        assert_eq!(f.ctx.current(), Some(v1));
        let after = f.dtu.regs(PE);
        assert_eq!(after.eps, before.eps);
        assert_eq!(f.dtu.ep(PE, 7), Some(EpDesc::Send(sep)));
    }

    #[test]
    fn test_every_vpe_runs_within_n_slices() {
        let mut f = Fixture::new();
        let ids = [f.app("a"), f.app("b"), f.app("c")];
        for id in ids {
            f.start(id);
        }
        f.resumed();

        let mut seen = Vec::new();
        for _ in 0..ids.len() {
            f.fire().unwrap();
            seen.extend(f.resumed());
        }
        for id in ids {
            assert!(seen.contains(&id), "VPE {} never ran", id);
        }
    }

    #[test]
    fn test_backoff_doubles_poll_interval() {
        let mut f = Fixture::new();
        let v1 = f.app("v1");
        f.dtu.set_agent(PE, AgentMode::Responsive { polls_before_ack: 2 });
        f.start(v1);
        assert_eq!(f.ctx.state(), SwitchState::RestoreDone);
        assert_eq!(f.timeouts.next_deadline(), Some(10));

        f.fire().unwrap();
        assert_eq!(f.ctx.state(), SwitchState::RestoreDone);
        assert_eq!(f.timeouts.next_deadline(), Some(30));

        f.fire().unwrap();
        assert_eq!(f.ctx.state(), SwitchState::Idle);
        assert_eq!(f.state(v1), VpeState::Running);
    }

    #[test]
    fn test_switch_during_switch_is_deferred() {
        let mut f = Fixture::new();
        let v1 = f.app("v1");
        let v2 = f.app("v2");
        f.start(v1);
        f.dtu.set_agent(PE, AgentMode::Responsive { polls_before_ack: 1 });
        f.start(v2);
        assert_eq!(f.ctx.state(), SwitchState::StoreDone);

        // a second request while storing
        f.with(|ctx, env| ctx.start_switch(env, false)).unwrap();
        assert_eq!(f.ctx.state(), SwitchState::StoreDone);

        f.dtu.set_agent(PE, AgentMode::Responsive { polls_before_ack: 0 });
        f.fire().unwrap();
        // the deferred request ran right after v2 was restored
        assert_eq!(f.resumed(), [v1, v2, v1]);
        assert_eq!(f.ctx.current(), Some(v1));
    }

    #[test]
    fn test_unresponsive_agent_disables_pe() {
        let mut f = Fixture::new();
        let v1 = f.app("v1");
        let v2 = f.app("v2");
        f.start(v1);
        f.dtu.set_agent(PE, AgentMode::Unresponsive);
        f.start(v2);

        for _ in 0..3 {
            f.fire().unwrap();
        }
        assert_eq!(f.fire(), Err(SwitchError::AgentTimeout { pe: PE }));
        assert!(f.ctx.failed());
        assert_eq!(f.ctx.state(), SwitchState::Idle);
        assert!(f.events.contains(&SwitchEvent::Failed(PE)));
        assert!(f.timeouts.is_empty());

        // no further attempts
        f.with(|ctx, env| ctx.start_switch(env, false)).unwrap();
        assert_eq!(f.dtu.irq_count(PE), 1);
    }
}
