//! Runtime-checkable kernel invariants
//!
//! Tests call [`check_all_invariants`] after every step of a scenario. The
//! invariants are:
//!
//! 1. **Capability links**: parent, child and sibling links agree with each
//!    other and only name live capabilities
//! 2. **Treap shape**: every table is ordered by selector without overlapping
//!    ranges, and priorities never decrease downwards
//! 3. **Endpoint binding**: a gate is activated on an endpoint exactly when
//!    the endpoint is bound to it
//! 4. **Ready queues**: only READY VPEs of the PE are queued, each once
//! 5. **Switch state**: a switch in progress has a current VPE, and the
//!    current VPE is resident
//! 6. **VPE tables**: every VPE except the idle VPEs has its object and map
//!    tables, and no table outlives its VPE

use alloc::collections::BTreeSet;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use pex_dtu::Dtu;

use crate::cap::{Activation, CapId, CapTables, TableId};
use crate::kernel::Kernel;
use crate::pes::{EpBinding, SwitchState};
use crate::types::VpeFlags;

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

fn violation(invariant: &'static str, description: String) -> InvariantViolation {
    InvariantViolation {
        invariant,
        description,
    }
}

/// Check all kernel invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants<D: Dtu>(kernel: &Kernel<D>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_cap_links(kernel.caps()));
    violations.extend(check_treaps(kernel.caps()));
    violations.extend(check_endpoint_bindings(kernel));
    violations.extend(check_ready_queues(kernel));
    violations.extend(check_switch_state(kernel));
    violations.extend(check_vpe_tables(kernel));

    violations
}

/// Invariant 1: ownership links are consistent
pub fn check_cap_links(caps: &CapTables) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let live = |id: CapId| caps.try_cap(id).is_some();

    for (id, cap) in caps.iter() {
        let name = format!("{:?}:{}", cap.table, cap.sel);
        for (what, link) in [
            ("parent", cap.parent),
            ("child", cap.child),
            ("next", cap.next),
            ("prev", cap.prev),
        ] {
            if let Some(l) = link {
                if !live(l) {
                    violations.push(violation(
                        "cap_links",
                        format!("{} has dangling {} link {:?}", name, what, l),
                    ));
                }
            }
        }

        if let Some(c) = cap.child.and_then(|c| caps.try_cap(c)) {
            if c.parent != Some(id) || c.prev.is_some() {
                violations.push(violation(
                    "cap_links",
                    format!("first child of {} does not point back", name),
                ));
            }
        }
        if let Some(n) = cap.next.and_then(|n| caps.try_cap(n)) {
            if n.prev != Some(id) || n.parent != cap.parent {
                violations.push(violation(
                    "cap_links",
                    format!("next sibling of {} does not point back", name),
                ));
            }
        }
        if let Some(p) = cap.prev.and_then(|p| caps.try_cap(p)) {
            if p.next != Some(id) {
                violations.push(violation(
                    "cap_links",
                    format!("previous sibling of {} does not point to it", name),
                ));
            }
        }
        if cap.prev.is_none() {
            if let Some(p) = cap.parent.and_then(|p| caps.try_cap(p)) {
                if p.child != Some(id) {
                    violations.push(violation(
                        "cap_links",
                        format!("{} is unreachable from its parent", name),
                    ));
                }
            }
        }
        if !caps.has_table(cap.table) {
            violations.push(violation(
                "cap_links",
                format!("{} lives in a table that does not exist", name),
            ));
        }
    }

    violations
}

/// Invariant 2: treap order and heap property
pub fn check_treaps(caps: &CapTables) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for table in caps.table_ids() {
        let order = caps.table_caps(table);
        for pair in order.windows(2) {
            let (a, b) = (caps.cap(pair[0]), caps.cap(pair[1]));
            if (a.sel as u64) + (a.length as u64) > b.sel as u64 {
                violations.push(violation(
                    "treap_order",
                    format!("{:?}: {}+{} overlaps or precedes {}", table, a.sel, a.length, b.sel),
                ));
            }
        }
        for id in &order {
            let cap = caps.cap(*id);
            if cap.table != table {
                violations.push(violation(
                    "treap_order",
                    format!("{:?}:{} is linked into {:?}", cap.table, cap.sel, table),
                ));
            }
            let links = cap.links();
            for child in [links.left, links.right].into_iter().flatten() {
                if caps.cap(child).links().prio < links.prio {
                    violations.push(violation(
                        "treap_heap",
                        format!("{:?}:{} has a child of higher priority", table, cap.sel),
                    ));
                }
            }
        }

        let members = caps.iter().filter(|(_, c)| c.table == table).count();
        if members != order.len() {
            violations.push(violation(
                "treap_order",
                format!(
                    "{:?} holds {} capabilities, {} are reachable",
                    table,
                    members,
                    order.len()
                ),
            ));
        }
        if order.is_empty() != caps.table_root(table).is_none() {
            violations.push(violation("treap_order", format!("{:?} has a stale root", table)));
        }
    }

    violations
}

/// Invariant 3: activations and endpoint bindings mirror each other
fn check_endpoint_bindings<D: Dtu>(kernel: &Kernel<D>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let caps = kernel.caps();

    for vpe in kernel.vpes().iter() {
        for (ep, id) in vpe.gate_bindings() {
            let act = caps.try_cap(id).and_then(|c| c.kind.activation());
            if act != Some(Activation { vpe: vpe.id(), ep }) {
                violations.push(violation(
                    "endpoint_binding",
                    format!(
                        "VPE {} ep{} is bound to a capability activated at {:?}",
                        vpe.id(),
                        ep,
                        act
                    ),
                ));
            }
        }
    }

    for (id, cap) in caps.iter() {
        let act = match cap.kind.activation() {
            Some(a) => a,
            None => continue,
        };
        let bound = kernel
            .vpes()
            .get(act.vpe)
            .and_then(|v| v.binding(act.ep));
        if bound != Some(EpBinding::Gate(id)) {
            violations.push(violation(
                "endpoint_binding",
                format!(
                    "{:?}:{} is activated on VPE {} ep{} which holds {:?}",
                    cap.table, cap.sel, act.vpe, act.ep, bound
                ),
            ));
        }
    }

    violations
}

/// Invariant 4: ready queues hold READY VPEs of their PE, once each
fn check_ready_queues<D: Dtu>(kernel: &Kernel<D>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for ctx in kernel.pes().switchers().filter(|c| !c.failed()) {
        let mut seen = BTreeSet::new();
        for id in ctx.ready() {
            if !seen.insert(id) {
                violations.push(violation(
                    "ready_queue",
                    format!("VPE {} is queued twice on PE {}", id, ctx.pe()),
                ));
            }
            if ctx.current() == Some(id) {
                violations.push(violation(
                    "ready_queue",
                    format!("running VPE {} is queued on PE {}", id, ctx.pe()),
                ));
            }
            match kernel.vpes().get(id) {
                Some(v) if !v.has(VpeFlags::READY) => violations.push(violation(
                    "ready_queue",
                    format!("VPE {} is queued on PE {} without READY", id, ctx.pe()),
                )),
                Some(v) if v.pe() != ctx.pe() => violations.push(violation(
                    "ready_queue",
                    format!("VPE {} of PE {} is queued on PE {}", id, v.pe(), ctx.pe()),
                )),
                Some(_) => {}
                None => violations.push(violation(
                    "ready_queue",
                    format!("unknown VPE {} is queued on PE {}", id, ctx.pe()),
                )),
            }
        }
    }

    violations
}

/// Invariant 5: switch state and current VPE agree
fn check_switch_state<D: Dtu>(kernel: &Kernel<D>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for ctx in kernel.pes().switchers().filter(|c| !c.failed()) {
        let state = ctx.state();
        match state {
            SwitchState::Idle => {}
            SwitchState::Switch => violations.push(violation(
                "switch_state",
                format!("PE {} rests in the middle of a switch", ctx.pe()),
            )),
            _ if ctx.current().is_none() => violations.push(violation(
                "switch_state",
                format!("PE {} is in {:?} without a current VPE", ctx.pe(), state),
            )),
            _ => {}
        }

        let cur = match ctx.current().and_then(|c| kernel.vpes().get(c)) {
            Some(v) => v,
            None => continue,
        };
        if !cur.has(VpeFlags::RESIDENT) {
            violations.push(violation(
                "switch_state",
                format!("current VPE {} of PE {} is not resident", cur.id(), ctx.pe()),
            ));
        }
    }

    violations
}

/// Invariant 6: tables exist exactly for the VPEs that own them
fn check_vpe_tables<D: Dtu>(kernel: &Kernel<D>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let caps = kernel.caps();

    for vpe in kernel.vpes().iter().filter(|v| !v.has(VpeFlags::IDLE)) {
        for table in [TableId::Obj(vpe.id()), TableId::Map(vpe.id())] {
            if !caps.has_table(table) {
                violations.push(violation(
                    "vpe_tables",
                    format!("VPE {} has no table {:?}", vpe.id(), table),
                ));
            }
        }
    }
    for table in caps.table_ids() {
        if let Some(owner) = table.vpe() {
            if !kernel.vpes().contains(owner) {
                violations.push(violation(
                    "vpe_tables",
                    format!("{:?} outlives VPE {}", table, owner),
                ));
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::{CapHooks, CapKind, RevokeCtx};
    use crate::error::Code;

    struct NoHooks;

    impl CapHooks for NoHooks {
        fn on_revoke(&mut self, _ctx: &RevokeCtx, _kind: &mut CapKind) -> Result<(), Code> {
            Ok(())
        }
    }

    fn tables() -> CapTables {
        let mut caps = CapTables::new();
        caps.create_table(TableId::Obj(1));
        caps.create_table(TableId::Obj(2));
        caps
    }

    #[test]
    fn test_fresh_tables_are_consistent() {
        let mut caps = tables();
        for sel in [5, 1, 9, 3, 7] {
            caps.insert(TableId::Obj(1), sel, 1, CapKind::Vpe(1)).unwrap();
        }
        assert!(check_cap_links(&caps).is_empty());
        assert!(check_treaps(&caps).is_empty());
    }

    #[test]
    fn test_links_stay_consistent_through_revoke() {
        let mut caps = tables();
        let root = caps.insert(TableId::Obj(1), 2, 1, CapKind::Vpe(3)).unwrap();
        let a = caps.obtain(TableId::Obj(2), 2, root, &mut NoHooks).unwrap();
        caps.obtain(TableId::Obj(2), 3, root, &mut NoHooks).unwrap();
        caps.obtain(TableId::Obj(1), 4, a, &mut NoHooks).unwrap();
        assert!(check_cap_links(&caps).is_empty());

        caps.revoke(a, &mut NoHooks).unwrap();
        assert!(check_cap_links(&caps).is_empty());
        assert!(check_treaps(&caps).is_empty());
        assert_eq!(caps.children(root).len(), 1);
    }

    #[test]
    fn test_detects_broken_sibling_link() {
        let mut caps = tables();
        let root = caps.insert(TableId::Obj(1), 2, 1, CapKind::Vpe(3)).unwrap();
        let a = caps.obtain(TableId::Obj(2), 2, root, &mut NoHooks).unwrap();
        let b = caps.obtain(TableId::Obj(2), 3, root, &mut NoHooks).unwrap();
        // b is the first child; a follows it
        caps.cap_mut(a).prev = None;

        let v = check_cap_links(&caps);
        assert!(v.iter().any(|v| v.invariant == "cap_links"));
        assert!(caps.cap(b).next == Some(a));
    }
}
