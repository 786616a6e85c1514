//! PE manager
//!
//! Knows how every PE is scheduled and routes VPE lifecycle requests to the
//! right place:
//! - the kernel PE and memory PEs never run VPEs
//! - PEs without a switching agent run exactly one VPE
//! - PEs with a switching agent multiplex VPEs through a [`ContextSwitcher`]
//!
//! It also places new VPEs and, if enabled, moves preempted VPEs between
//! PEs with virtual memory.

use alloc::vec::Vec;

use pex_dtu::{Dtu, DtuError, DtuFeatures, DtuReg, VpeDesc, DTU_BASE_ADDR};

use super::ctxsw::{ContextSwitcher, SwitchEnv, SwitchError, SwitchEvent};
use super::timeouts::{TimerEvent, TimerId, Timeouts};
use super::vpemng::VpeManager;
use crate::error::Code;
use crate::platform::{Isa, PeDesc, Platform, SwitchConfig, KERNEL_PE};
use crate::types::{PeId, VpeFlags, VpeId, VpeState};

/// How a PE is used
#[derive(Debug)]
pub enum PeSched {
    Kernel,
    Memory,
    /// One VPE at a time, no switching agent
    Dedicated(Option<VpeId>),
    Muxed(ContextSwitcher),
}

pub struct PeManager {
    pes: Vec<PeSched>,
    descs: Vec<PeDesc>,
    cfg: SwitchConfig,
    /// Raw events of the switchers, before migrations are carried out
    raw: Vec<SwitchEvent>,
    /// Events for the kernel
    events: Vec<SwitchEvent>,
}

impl PeManager {
    pub fn new(platform: &Platform) -> Self {
        let pes = platform
            .pes
            .iter()
            .enumerate()
            .map(|(id, desc)| {
                if id == KERNEL_PE {
                    PeSched::Kernel
                } else if desc.is_memory() {
                    PeSched::Memory
                } else if desc.supports_ctxsw() {
                    PeSched::Muxed(ContextSwitcher::new(id))
                } else {
                    PeSched::Dedicated(None)
                }
            })
            .collect();

        Self {
            pes,
            descs: platform.pes.clone(),
            cfg: platform.switching.clone(),
            raw: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Drop the privileges of all PEs but the kernel's
    pub fn deprivilege<D: Dtu>(&self, dtu: &D) -> Result<(), DtuError> {
        let addr = DTU_BASE_ADDR + DtuReg::Features.offset();
        for (id, sched) in self.pes.iter().enumerate() {
            let features = match sched {
                PeSched::Memory => continue,
                PeSched::Kernel => DtuFeatures::PRIV,
                _ => DtuFeatures::empty(),
            };
            dtu.write_mem(VpeDesc::pe_only(id), addr, &features.bits().to_le_bytes())?;
        }
        log::info!(target: "pes", "Deprivileged {} PEs", self.pes.len() - 1);
        Ok(())
    }

    /// Create the idle VPE of every multiplexed PE and let it run
    pub fn init_idle<D: Dtu>(
        &mut self,
        dtu: &D,
        vpes: &mut VpeManager,
        timeouts: &mut Timeouts,
    ) -> Result<(), Code> {
        for pe in 0..self.pes.len() {
            let ctx = match &mut self.pes[pe] {
                PeSched::Muxed(ctx) => ctx,
                _ => continue,
            };
            let id = vpes.create("idle", pe, VpeFlags::IDLE | VpeFlags::INIT)?;
            ctx.set_idle_vpe(id);
            if let Err(e) = self.switcher(dtu, vpes, timeouts, pe, |ctx, env| ctx.start_switch(env, false)) {
                log::error!(target: "pes", "PE {}: could not start idle VPE: {}", pe, e);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn count(&self) -> usize {
        self.pes.len()
    }

    pub fn sched(&self, pe: PeId) -> Option<&PeSched> {
        self.pes.get(pe)
    }

    pub fn desc(&self, pe: PeId) -> Option<&PeDesc> {
        self.descs.get(pe)
    }

    pub fn switcher_of(&self, pe: PeId) -> Option<&ContextSwitcher> {
        match self.pes.get(pe) {
            Some(PeSched::Muxed(ctx)) => Some(ctx),
            _ => None,
        }
    }

    pub fn switchers(&self) -> impl Iterator<Item = &ContextSwitcher> {
        self.pes.iter().filter_map(|s| match s {
            PeSched::Muxed(ctx) => Some(ctx),
            _ => None,
        })
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.cfg
    }

    /// Whether `vpe` on `pe` may be torn down now
    ///
    /// A VPE that is being stored or restored has to wait for the switch.
    pub fn can_remove(&self, pe: PeId, vpe: VpeId) -> bool {
        match self.pes.get(pe) {
            Some(PeSched::Muxed(ctx)) => ctx.is_idle() || ctx.current() != Some(vpe),
            _ => true,
        }
    }

    /// Ready VPEs on all PEs
    pub fn ready_count(&self) -> usize {
        self.switchers().map(|c| c.ready_len()).sum()
    }

    /// Find a PE for a new VPE
    ///
    /// An empty PE of the right ISA is preferred. Otherwise a VPE that may
    /// share its PE goes to the least loaded multiplexed PE on which all
    /// VPEs may share as well.
    ///
    /// # Returns
    /// * `Err(Code::NoFreePe)` - No suitable PE
    pub fn find_pe(
        &self,
        vpes: &VpeManager,
        isa: Isa,
        muxable: bool,
        except: Option<PeId>,
    ) -> Result<PeId, Code> {
        let mut best: Option<(PeId, usize)> = None;
        for (id, sched) in self.pes.iter().enumerate() {
            if Some(id) == except || self.descs[id].isa != isa {
                continue;
            }
            match sched {
                PeSched::Dedicated(None) => return Ok(id),
                PeSched::Muxed(ctx) if !ctx.failed() => {
                    if ctx.count() == 0 {
                        return Ok(id);
                    }
                    let load = ctx.count();
                    if muxable
                        && ctx.can_mux(vpes)
                        && best.map_or(true, |(_, l)| load < l)
                    {
                        best = Some((id, load));
                    }
                }
                _ => {}
            }
        }
        best.map(|(id, _)| id).ok_or(Code::NoFreePe)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Put `id` on its PE
    ///
    /// On a dedicated PE the VPE becomes resident right away.
    pub fn assign<D: Dtu>(&mut self, dtu: &D, vpes: &mut VpeManager, id: VpeId) -> Result<(), Code> {
        let vpe = vpes.get_mut(id).ok_or(Code::NotFound)?;
        let pe = vpe.pe();
        match self.pes.get_mut(pe) {
            Some(PeSched::Dedicated(slot @ None)) => {
                *slot = Some(id);
                vpe.set_flags(VpeFlags::RESIDENT);
                let root = vpe.root_pt();
                vpe.dtu_state_mut().restore(dtu, VpeDesc::new(pe, id), id, root)?;
            }
            Some(PeSched::Muxed(ctx)) => ctx.add_vpe(id),
            _ => return Err(Code::NoFreePe),
        }
        log::debug!(target: "pes", "Assigned VPE {} to PE {}", id, pe);
        Ok(())
    }

    pub fn start_vpe<D: Dtu>(
        &mut self,
        dtu: &D,
        vpes: &mut VpeManager,
        timeouts: &mut Timeouts,
        id: VpeId,
    ) -> Result<(), SwitchError> {
        let pe = match vpes.get(id) {
            Some(v) => v.pe(),
            None => return Ok(()),
        };
        if let Some(PeSched::Dedicated(_)) = self.pes.get(pe) {
            dtu.wakeup(VpeDesc::new(pe, id))?;
            if let Some(vpe) = vpes.get_mut(id) {
                vpe.set_state(VpeState::Running);
            }
            self.events.push(SwitchEvent::Resumed(id));
            return Ok(());
        }
        self.switcher(dtu, vpes, timeouts, pe, |ctx, env| ctx.start_vpe(env, id))
    }

    pub fn stop_vpe<D: Dtu>(
        &mut self,
        dtu: &D,
        vpes: &mut VpeManager,
        timeouts: &mut Timeouts,
        id: VpeId,
    ) -> Result<(), SwitchError> {
        let pe = match vpes.get(id) {
            Some(v) => v.pe(),
            None => return Ok(()),
        };
        if let Some(PeSched::Dedicated(_)) = self.pes.get(pe) {
            dtu.suspend(VpeDesc::new(pe, id))?;
            if let Some(vpe) = vpes.get_mut(id) {
                vpe.clear_flags(VpeFlags::HASAPP);
                if vpe.state() != VpeState::Dead {
                    vpe.set_state(VpeState::Suspended);
                }
            }
            return Ok(());
        }
        self.switcher(dtu, vpes, timeouts, pe, |ctx, env| ctx.stop_vpe(env, id))
    }

    /// Take `id` off its PE for good
    ///
    /// Must only be called if [`can_remove`](Self::can_remove) holds.
    pub fn remove_vpe<D: Dtu>(
        &mut self,
        dtu: &D,
        vpes: &mut VpeManager,
        timeouts: &mut Timeouts,
        id: VpeId,
    ) -> Result<(), SwitchError> {
        let pe = match vpes.get(id) {
            Some(v) => v.pe(),
            None => return Ok(()),
        };
        match self.pes.get_mut(pe) {
            Some(PeSched::Dedicated(slot)) if *slot == Some(id) => {
                *slot = None;
                dtu.suspend(VpeDesc::pe_only(pe))?;
                if let Some(vpe) = vpes.get_mut(id) {
                    vpe.clear_flags(VpeFlags::RESIDENT);
                }
                Ok(())
            }
            Some(PeSched::Muxed(_)) => {
                self.switcher(dtu, vpes, timeouts, pe, |ctx, env| ctx.remove_vpe(env, id))
            }
            _ => Ok(()),
        }
    }

    /// `id` gives up its PE
    ///
    /// If nobody else waits on its PE, a ready VPE is taken over from
    /// another PE (only between PEs with virtual memory).
    pub fn yield_vpe<D: Dtu>(
        &mut self,
        dtu: &D,
        vpes: &mut VpeManager,
        timeouts: &mut Timeouts,
        id: VpeId,
    ) -> Result<(), SwitchError> {
        let pe = match vpes.get(id) {
            Some(v) => v.pe(),
            None => return Ok(()),
        };
        if !matches!(self.pes.get(pe), Some(PeSched::Muxed(_))) {
            return Ok(());
        }
        let switched = match self.switcher(dtu, vpes, timeouts, pe, |ctx, env| ctx.yield_vpe(env, id)) {
            Ok(s) => s,
            Err(SwitchError::InvalidState(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if switched || !self.cfg.migration || !self.descs[pe].has_vm() {
            return Ok(());
        }

        let from = (0..self.pes.len()).find(|other| {
            *other != pe
                && self.descs[*other].has_vm()
                && self.descs[*other].is_compatible(&self.descs[pe])
                && matches!(&self.pes[*other], PeSched::Muxed(c) if c.ready_len() > 0)
        });
        let stolen = match from {
            Some(other) => match &mut self.pes[other] {
                PeSched::Muxed(ctx) => ctx.steal(vpes).map(|v| (v, other)),
                _ => None,
            },
            None => None,
        };
        if let Some((vpe, other)) = stolen {
            self.move_vpe(dtu, vpes, timeouts, vpe, other, pe)?;
        }
        Ok(())
    }

    /// A VPE on `pe` has new work
    pub fn unblock_vpe<D: Dtu>(
        &mut self,
        dtu: &D,
        vpes: &mut VpeManager,
        timeouts: &mut Timeouts,
        id: VpeId,
    ) -> Result<(), SwitchError> {
        let vpe = match vpes.get(id) {
            Some(v) if v.has(VpeFlags::HASAPP) && v.state() != VpeState::Dead => v,
            _ => return Ok(()),
        };
        let pe = vpe.pe();
        match self.pes.get(pe) {
            Some(PeSched::Muxed(_)) => {
                self.switcher(dtu, vpes, timeouts, pe, |ctx, env| ctx.unblock_vpe(env, id))
            }
            _ => Ok(()),
        }
    }

    /// Dispatch an expired timer to its switcher
    pub fn on_timer<D: Dtu>(
        &mut self,
        dtu: &D,
        vpes: &mut VpeManager,
        timeouts: &mut Timeouts,
        id: TimerId,
        event: TimerEvent,
    ) -> Result<(), SwitchError> {
        let pe = match event {
            TimerEvent::SwitchPoll(pe) | TimerEvent::TimeSlice(pe) => pe,
        };
        match self.pes.get(pe) {
            Some(PeSched::Muxed(_)) => {
                self.switcher(dtu, vpes, timeouts, pe, |ctx, env| ctx.timer(env, id, event))
            }
            _ => Ok(()),
        }
    }

    /// Events for the kernel since the last call
    pub fn take_events(&mut self) -> Vec<SwitchEvent> {
        core::mem::take(&mut self.events)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Run `f` on the switcher of `pe` and carry out resulting migrations
    fn switcher<D: Dtu, R>(
        &mut self,
        dtu: &D,
        vpes: &mut VpeManager,
        timeouts: &mut Timeouts,
        pe: PeId,
        f: impl FnOnce(&mut ContextSwitcher, &mut SwitchEnv<'_, D>) -> Result<R, SwitchError>,
    ) -> Result<R, SwitchError> {
        let spill = self.spill_target(pe);
        let res = {
            let Self { pes, cfg, raw, .. } = self;
            let ctx = match pes.get_mut(pe) {
                Some(PeSched::Muxed(ctx)) => ctx,
                _ => return Err(SwitchError::Dtu(DtuError::InvalidPe)),
            };
            let mut env = SwitchEnv {
                dtu,
                vpes: &mut *vpes,
                timeouts: &mut *timeouts,
                cfg,
                events: raw,
                spill,
            };
            f(ctx, &mut env)
        };
        self.dispatch(dtu, vpes, timeouts)?;
        res
    }

    fn dispatch<D: Dtu>(
        &mut self,
        dtu: &D,
        vpes: &mut VpeManager,
        timeouts: &mut Timeouts,
    ) -> Result<(), SwitchError> {
        while !self.raw.is_empty() {
            for ev in core::mem::take(&mut self.raw) {
                match ev {
                    SwitchEvent::Migrate { vpe, to } => {
                        let from = match vpes.get(vpe) {
                            Some(v) => v.pe(),
                            None => continue,
                        };
                        self.move_vpe(dtu, vpes, timeouts, vpe, from, to)?;
                    }
                    other => self.events.push(other),
                }
            }
        }
        Ok(())
    }

    /// An idle, compatible PE with virtual memory next to `pe`
    fn spill_target(&self, pe: PeId) -> Option<PeId> {
        if !self.cfg.migration || !self.descs.get(pe)?.has_vm() {
            return None;
        }
        self.pes.iter().enumerate().find_map(|(id, sched)| match sched {
            PeSched::Muxed(ctx)
                if id != pe
                    && self.descs[id].has_vm()
                    && self.descs[id].is_compatible(&self.descs[pe])
                    && !ctx.failed()
                    && ctx.is_idle()
                    && ctx.runs_idle()
                    && ctx.ready_len() == 0 =>
            {
                Some(id)
            }
            _ => None,
        })
    }

    fn move_vpe<D: Dtu>(
        &mut self,
        dtu: &D,
        vpes: &mut VpeManager,
        timeouts: &mut Timeouts,
        id: VpeId,
        from: PeId,
        to: PeId,
    ) -> Result<(), SwitchError> {
        if let Some(PeSched::Muxed(ctx)) = self.pes.get_mut(from) {
            ctx.detach(vpes, id);
        }
        let to_ctx = match self.pes.get_mut(to) {
            Some(PeSched::Muxed(ctx)) => ctx,
            _ => return Err(SwitchError::Dtu(DtuError::InvalidPe)),
        };
        to_ctx.add_vpe(id);
        if let Some(vpe) = vpes.get_mut(id) {
            vpe.set_pe(to);
        }
        log::info!(target: "pes", "Migrating VPE {} from PE {} to PE {}", id, from, to);
        self.switcher(dtu, vpes, timeouts, to, |ctx, env| ctx.start_vpe(env, id))
    }
}
