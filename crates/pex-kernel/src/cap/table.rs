//! Capability arena, per-table treaps and the ownership tree
//!
//! # Revocation
//!
//! [`CapTables::revoke`] unlinks a capability from its siblings and parent and
//! then walks its subtree. For every node the kind-specific hook runs first:
//!
//! - hook succeeds: the node is removed from its table and freed
//! - hook fails: the node stays in its table, detached, with its child
//!   pointer cleared
//!
//! In both cases the children are revoked. A service that cannot go away yet
//! (outstanding requests) thereby still loses all of its sessions.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::kind::{CapKind, CapType};
use super::treap::{Treap, TreapArena, TreapLinks};
use super::{CapId, TableId};
use crate::error::Code;
use crate::types::{CapRngDesc, CapSel};

/// A capability: a typed, selector-addressed entry of one table
#[derive(Debug)]
pub struct Capability {
    pub table: TableId,
    pub sel: CapSel,
    /// Number of selectors covered, starting at `sel`
    pub length: u32,
    pub kind: CapKind,
    pub parent: Option<CapId>,
    pub child: Option<CapId>,
    pub next: Option<CapId>,
    pub prev: Option<CapId>,
    links: TreapLinks,
}

impl Capability {
    pub fn contains(&self, sel: CapSel) -> bool {
        sel >= self.sel && sel - self.sel < self.length
    }

    pub fn links(&self) -> &TreapLinks {
        &self.links
    }
}

/// Storage for all capabilities
#[derive(Debug, Default)]
struct CapArena {
    slots: Vec<Option<Capability>>,
    free: Vec<u32>,
}

impl CapArena {
    fn alloc(&mut self, cap: Capability) -> CapId {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(cap);
                CapId(idx)
            }
            None => {
                self.slots.push(Some(cap));
                CapId(self.slots.len() as u32 - 1)
            }
        }
    }

    fn release(&mut self, id: CapId) -> Capability {
        match self.slots.get_mut(id.0 as usize).and_then(Option::take) {
            Some(cap) => {
                self.free.push(id.0);
                cap
            }
            None => panic!("dangling capability handle {:?}", id),
        }
    }

    fn try_get(&self, id: CapId) -> Option<&Capability> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn get(&self, id: CapId) -> &Capability {
        match self.try_get(id) {
            Some(cap) => cap,
            None => panic!("dangling capability handle {:?}", id),
        }
    }

    fn get_mut(&mut self, id: CapId) -> &mut Capability {
        match self.slots.get_mut(id.0 as usize).and_then(Option::as_mut) {
            Some(cap) => cap,
            None => panic!("dangling capability handle {:?}", id),
        }
    }
}

impl TreapArena for CapArena {
    fn key(&self, id: CapId) -> CapSel {
        self.get(id).sel
    }

    fn matches(&self, id: CapId, key: CapSel) -> bool {
        self.get(id).contains(key)
    }

    fn links(&self, id: CapId) -> &TreapLinks {
        &self.get(id).links
    }

    fn links_mut(&mut self, id: CapId) -> &mut TreapLinks {
        &mut self.get_mut(id).links
    }
}

/// What a revoke hook gets to see about the capability
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RevokeCtx {
    pub id: CapId,
    pub table: TableId,
    pub sel: CapSel,
    pub length: u32,
    /// The capability still has derived capabilities
    pub has_child: bool,
}

/// Kind-specific side effects of obtaining and revoking capabilities
pub trait CapHooks {
    /// A copy of a capability has been placed into `table`
    fn on_obtain(&mut self, _table: TableId, _kind: &CapKind) {}

    /// Release what the capability refers to
    ///
    /// # Returns
    /// * `Ok(())` - The capability may be removed
    /// * `Err(code)` - The capability has to stay; its children are revoked anyway
    fn on_revoke(&mut self, ctx: &RevokeCtx, kind: &mut CapKind) -> Result<(), Code>;
}

/// All capability tables of the system
#[derive(Debug, Default)]
pub struct CapTables {
    arena: CapArena,
    tables: BTreeMap<TableId, Treap>,
}

impl CapTables {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Tables
    // ========================================================================

    pub fn create_table(&mut self, table: TableId) {
        self.tables.entry(table).or_default();
    }

    /// Drop an empty table
    ///
    /// Returns false if the table still holds capabilities.
    pub fn remove_table(&mut self, table: TableId) -> bool {
        match self.tables.get(&table) {
            Some(t) if !t.is_empty() => false,
            Some(_) => {
                self.tables.remove(&table);
                true
            }
            None => true,
        }
    }

    pub fn has_table(&self, table: TableId) -> bool {
        self.tables.contains_key(&table)
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        self.tables.keys().copied().collect()
    }

    /// Capabilities of `table` in selector order
    pub fn table_caps(&self, table: TableId) -> Vec<CapId> {
        self.tables
            .get(&table)
            .map(|t| t.in_order(&self.arena))
            .unwrap_or_default()
    }

    /// Root node of the treap of `table`
    pub fn table_root(&self, table: TableId) -> Option<CapId> {
        self.tables.get(&table)?.root()
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Number of live capabilities in all tables
    pub fn len(&self) -> usize {
        self.arena.slots.len() - self.arena.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (CapId, &Capability)> {
        self.arena
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (CapId(i as u32), c)))
    }

    /// Find the capability covering `sel`
    pub fn get(&self, table: TableId, sel: CapSel) -> Option<CapId> {
        self.tables.get(&table)?.find(&self.arena, sel)
    }

    /// Find the capability covering `sel` and check its kind
    ///
    /// # Returns
    /// * `Err(Code::NotFound)` - No capability at `sel`
    /// * `Err(Code::InvArgs)` - The capability is not of a kind in `mask`
    pub fn get_typed(&self, table: TableId, sel: CapSel, mask: CapType) -> Result<CapId, Code> {
        let id = self.get(table, sel).ok_or(Code::NotFound)?;
        if !mask.intersects(self.arena.get(id).kind.ty()) {
            return Err(Code::InvArgs);
        }
        Ok(id)
    }

    pub fn cap(&self, id: CapId) -> &Capability {
        self.arena.get(id)
    }

    pub fn cap_mut(&mut self, id: CapId) -> &mut Capability {
        self.arena.get_mut(id)
    }

    pub fn try_cap(&self, id: CapId) -> Option<&Capability> {
        self.arena.try_get(id)
    }

    /// Direct children of `id`, most recent first
    pub fn children(&self, id: CapId) -> Vec<CapId> {
        let mut out = Vec::new();
        let mut cur = self.arena.get(id).child;
        while let Some(c) = cur {
            out.push(c);
            cur = self.arena.get(c).next;
        }
        out
    }

    /// Whether any selector of `[sel, sel + len)` is taken
    pub fn range_used(&self, table: TableId, sel: CapSel, len: u32) -> bool {
        let tree = match self.tables.get(&table) {
            Some(t) => t,
            None => return false,
        };
        if tree.find(&self.arena, sel).is_some() {
            return true;
        }
        match tree.lower_bound(&self.arena, sel) {
            Some(n) => (self.arena.get(n).sel as u64) < sel as u64 + len as u64,
            None => false,
        }
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Place a new root capability at `[sel, sel + length)` of `table`
    ///
    /// # Returns
    /// * `Err(Code::NotFound)` - The table does not exist
    /// * `Err(Code::InvArgs)` - Empty or overflowing range
    /// * `Err(Code::Exists)` - A selector of the range is taken
    pub fn insert(
        &mut self,
        table: TableId,
        sel: CapSel,
        length: u32,
        kind: CapKind,
    ) -> Result<CapId, Code> {
        if !self.tables.contains_key(&table) {
            return Err(Code::NotFound);
        }
        if length == 0 || sel.checked_add(length).is_none() {
            return Err(Code::InvArgs);
        }
        if self.range_used(table, sel, length) {
            return Err(Code::Exists);
        }

        log::trace!(target: "caps", "{:?}:{} <- {}", table, sel, kind);
        let id = self.arena.alloc(Capability {
            table,
            sel,
            length,
            kind,
            parent: None,
            child: None,
            next: None,
            prev: None,
            links: TreapLinks::default(),
        });
        if let Some(tree) = self.tables.get_mut(&table) {
            tree.insert(&mut self.arena, id);
        }
        Ok(id)
    }

    /// Copy `src` to `dst_sel` of `dst` as a child of `src`
    ///
    /// # Returns
    /// * `Err(Code::NotSup)` - The kind of `src` cannot be copied
    /// * any error of [`CapTables::insert`]
    pub fn obtain<H: CapHooks>(
        &mut self,
        dst: TableId,
        dst_sel: CapSel,
        src: CapId,
        hooks: &mut H,
    ) -> Result<CapId, Code> {
        let (kind, length) = {
            let cap = self.arena.get(src);
            (cap.kind.clone_for_obtain().ok_or(Code::NotSup)?, cap.length)
        };
        let id = self.insert(dst, dst_sel, length, kind)?;
        hooks.on_obtain(dst, &self.arena.get(id).kind);
        self.inherit(src, id);
        Ok(id)
    }

    /// Record `child` as the most recent child of `parent`
    pub fn inherit(&mut self, parent: CapId, child: CapId) {
        let first = self.arena.get(parent).child;
        {
            let c = self.arena.get_mut(child);
            c.parent = Some(parent);
            c.prev = None;
            c.next = first;
        }
        if let Some(f) = first {
            self.arena.get_mut(f).prev = Some(child);
        }
        self.arena.get_mut(parent).child = Some(child);
    }

    // ========================================================================
    // Revocation
    // ========================================================================

    /// Revoke every capability in `crd`, in selector order
    ///
    /// With `own`, the capabilities themselves are revoked; otherwise only
    /// what has been derived from them. Stops at the first failure.
    ///
    /// # Returns
    /// * `Ok(())` - All capabilities of the range are revoked (or there were none)
    /// * `Err((sel, code))` - Revoking the capability at `sel` failed
    pub fn revoke_range<H: CapHooks>(
        &mut self,
        table: TableId,
        crd: CapRngDesc,
        own: bool,
        hooks: &mut H,
    ) -> Result<(), (CapSel, Code)> {
        let end = crd.end().ok_or((crd.start, Code::InvArgs))?;
        let mut sel = crd.start;
        while sel < end {
            let id = match self.get(table, sel) {
                Some(id) => id,
                None => {
                    let next = self
                        .tables
                        .get(&table)
                        .and_then(|t| t.lower_bound(&self.arena, sel))
                        .map(|n| self.arena.get(n).sel);
                    match next {
                        Some(s) if s < end => {
                            sel = s;
                            continue;
                        }
                        _ => break,
                    }
                }
            };

            let next_sel = {
                let cap = self.arena.get(id);
                cap.sel.saturating_add(cap.length)
            };
            let res = if own {
                self.revoke(id, hooks)
            } else {
                match self.arena.get_mut(id).child.take() {
                    Some(child) => self.revoke_rec(child, true, hooks),
                    None => Ok(()),
                }
            };
            if let Err(e) = res {
                log::debug!(target: "caps", "Revoke of {:?}:{} failed: {:?}", table, sel, e);
                return Err((sel, e));
            }
            sel = next_sel;
        }
        Ok(())
    }

    /// Revoke `id` and everything derived from it
    ///
    /// Returns the result of the hook of `id` itself.
    pub fn revoke<H: CapHooks>(&mut self, id: CapId, hooks: &mut H) -> Result<(), Code> {
        self.unlink(id);
        self.revoke_rec(id, false, hooks)
    }

    /// Revoke everything in `table`
    ///
    /// Capabilities whose hook refuses are removed anyway.
    pub fn revoke_all<H: CapHooks>(&mut self, table: TableId, hooks: &mut H) {
        while let Some(root) = self.tables.get(&table).and_then(|t| t.root()) {
            if let Err(e) = self.revoke(root, hooks) {
                log::warn!(
                    target: "caps",
                    "Removing {:?}:{} despite failed revoke ({:?})",
                    table,
                    self.arena.get(root).sel,
                    e
                );
                self.remove_node(root);
            }
        }
    }

    fn unlink(&mut self, id: CapId) {
        let (parent, prev, next) = {
            let c = self.arena.get(id);
            (c.parent, c.prev, c.next)
        };
        match prev {
            Some(p) => self.arena.get_mut(p).next = next,
            None => {
                if let Some(par) = parent {
                    if self.arena.get(par).child == Some(id) {
                        self.arena.get_mut(par).child = next;
                    }
                }
            }
        }
        if let Some(n) = next {
            self.arena.get_mut(n).prev = prev;
        }
        let c = self.arena.get_mut(id);
        c.parent = None;
        c.prev = None;
        c.next = None;
    }

    fn revoke_rec<H: CapHooks>(
        &mut self,
        id: CapId,
        revnext: bool,
        hooks: &mut H,
    ) -> Result<(), Code> {
        let (child, next, ctx) = {
            let c = self.arena.get(id);
            (
                c.child,
                c.next,
                RevokeCtx {
                    id,
                    table: c.table,
                    sel: c.sel,
                    length: c.length,
                    has_child: c.child.is_some(),
                },
            )
        };

        let res = hooks.on_revoke(&ctx, &mut self.arena.get_mut(id).kind);
        match res {
            Ok(()) => self.remove_node(id),
            Err(e) => {
                log::debug!(
                    target: "caps",
                    "{:?}:{} stays after failed revoke ({:?})",
                    ctx.table,
                    ctx.sel,
                    e
                );
                let c = self.arena.get_mut(id);
                c.child = None;
                c.parent = None;
                c.prev = None;
                c.next = None;
            }
        }

        if let Some(c) = child {
            let _ = self.revoke_rec(c, true, hooks);
        }
        if revnext {
            let mut cur = next;
            while let Some(n) = cur {
                cur = self.arena.get(n).next;
                let _ = self.revoke_rec(n, false, hooks);
            }
        }
        res
    }

    fn remove_node(&mut self, id: CapId) {
        let table = self.arena.get(id).table;
        if let Some(tree) = self.tables.get_mut(&table) {
            tree.remove(&mut self.arena, id);
        }
        let cap = self.arena.release(id);
        log::trace!(target: "caps", "{:?}:{} removed", cap.table, cap.sel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::kind::MGateObject;
    use crate::types::Perm;
    use alloc::rc::Rc;
    use alloc::vec;

    const T1: TableId = TableId::Obj(1);
    const T2: TableId = TableId::Obj(2);

    /// Accepts everything except the listed selectors, records the order
    #[derive(Default)]
    struct TestHooks {
        refuse: Vec<(TableId, CapSel)>,
        seen: Vec<(TableId, CapSel, bool)>,
        obtained: usize,
    }

    impl CapHooks for TestHooks {
        fn on_obtain(&mut self, _table: TableId, _kind: &CapKind) {
            self.obtained += 1;
        }

        fn on_revoke(&mut self, ctx: &RevokeCtx, _kind: &mut CapKind) -> Result<(), Code> {
            self.seen.push((ctx.table, ctx.sel, ctx.has_child));
            if self.refuse.contains(&(ctx.table, ctx.sel)) {
                return Err(Code::Pending);
            }
            Ok(())
        }
    }

    fn mem(size: u64) -> CapKind {
        CapKind::MemGate {
            obj: Rc::new(MGateObject::new(1, 1, 0, size, Perm::RW)),
            act: None,
        }
    }

    fn setup() -> CapTables {
        let mut caps = CapTables::new();
        caps.create_table(T1);
        caps.create_table(T2);
        caps
    }

    #[test]
    fn test_insert_and_typed_lookup() {
        let mut caps = setup();
        let id = caps.insert(T1, 5, 1, mem(0x1000)).unwrap();
        assert_eq!(caps.get(T1, 5), Some(id));
        assert_eq!(caps.get(T2, 5), None);
        assert_eq!(caps.get_typed(T1, 5, CapType::MGATE), Ok(id));
        assert_eq!(caps.get_typed(T1, 5, CapType::SGATE), Err(Code::InvArgs));
        assert_eq!(caps.get_typed(T1, 6, CapType::MGATE), Err(Code::NotFound));
        assert_eq!(caps.insert(T1, 5, 1, mem(0x1000)).unwrap_err(), Code::Exists);
        assert_eq!(caps.insert(TableId::Map(9), 0, 1, mem(1)).unwrap_err(), Code::NotFound);
        assert_eq!(caps.insert(T1, 10, 0, mem(1)).unwrap_err(), Code::InvArgs);
    }

    #[test]
    fn test_range_capabilities_block_their_selectors() {
        let mut caps = setup();
        caps.insert(T1, 10, 4, CapKind::Vpe(3)).unwrap();
        assert!(caps.get(T1, 13).is_some());
        assert!(caps.get(T1, 14).is_none());
        assert_eq!(caps.insert(T1, 8, 3, CapKind::Vpe(3)).unwrap_err(), Code::Exists);
        assert_eq!(caps.insert(T1, 12, 1, CapKind::Vpe(3)).unwrap_err(), Code::Exists);
        assert!(caps.insert(T1, 14, 2, CapKind::Vpe(3)).is_ok());
        assert!(caps.range_used(T1, 0, 11));
        assert!(!caps.range_used(T1, 16, 100));
    }

    #[test]
    fn test_obtain_links_child() {
        let mut caps = setup();
        let mut hooks = TestHooks::default();
        let root = caps.insert(T1, 2, 1, mem(0x1000)).unwrap();
        let a = caps.obtain(T2, 7, root, &mut hooks).unwrap();
        let b = caps.obtain(T2, 8, root, &mut hooks).unwrap();

        assert_eq!(hooks.obtained, 2);
        assert_eq!(caps.children(root), vec![b, a]);
        assert_eq!(caps.cap(a).parent, Some(root));
        assert_eq!(caps.cap(b).next, Some(a));
        assert_eq!(caps.cap(a).prev, Some(b));
    }

    #[test]
    fn test_obtain_rejects_uncopyable_kinds() {
        let mut caps = setup();
        let mut hooks = TestHooks::default();
        let map = caps
            .insert(
                T1,
                0,
                4,
                CapKind::Map {
                    phys: 0,
                    flags: pex_dtu::PteFlags::R,
                },
            )
            .unwrap();
        assert_eq!(caps.obtain(T2, 0, map, &mut hooks), Err(Code::NotSup));
        assert_eq!(caps.len(), 1);
    }

    #[test]
    fn test_revoke_removes_subtree_across_tables() {
        let mut caps = setup();
        let mut hooks = TestHooks::default();
        let root = caps.insert(T1, 2, 1, mem(0x1000)).unwrap();
        let a = caps.obtain(T2, 3, root, &mut hooks).unwrap();
        caps.obtain(T1, 4, a, &mut hooks).unwrap();
        let keep = caps.insert(T1, 9, 1, mem(0x1000)).unwrap();

        caps.revoke(a, &mut hooks).unwrap();
        assert_eq!(caps.get(T2, 3), None);
        assert_eq!(caps.get(T1, 4), None);
        assert_eq!(caps.cap(root).child, None);
        assert_eq!(caps.get(T1, 9), Some(keep));
        assert_eq!(caps.len(), 2);
    }

    #[test]
    fn test_revoke_unlinks_middle_sibling() {
        let mut caps = setup();
        let mut hooks = TestHooks::default();
        let root = caps.insert(T1, 0, 1, mem(0x1000)).unwrap();
        let a = caps.obtain(T2, 1, root, &mut hooks).unwrap();
        let b = caps.obtain(T2, 2, root, &mut hooks).unwrap();
        let c = caps.obtain(T2, 3, root, &mut hooks).unwrap();

        caps.revoke(b, &mut hooks).unwrap();
        assert_eq!(caps.children(root), vec![c, a]);
        assert_eq!(caps.cap(c).next, Some(a));
        assert_eq!(caps.cap(a).prev, Some(c));
        // siblings of the revoked node are untouched
        assert_eq!(hooks.seen, vec![(T2, 2, false)]);
    }

    #[test]
    fn test_revoke_empty_range_is_noop() {
        let mut caps = setup();
        let mut hooks = TestHooks::default();
        caps.insert(T1, 50, 1, mem(1)).unwrap();
        assert_eq!(caps.revoke_range(T1, CapRngDesc::new(10, 20), true, &mut hooks), Ok(()));
        assert_eq!(caps.revoke_range(T1, CapRngDesc::new(10, 20), true, &mut hooks), Ok(()));
        assert_eq!(caps.revoke_range(TableId::Obj(77), CapRngDesc::new(0, 5), true, &mut hooks), Ok(()));
        assert!(hooks.seen.is_empty());
        assert_eq!(caps.len(), 1);
    }

    #[test]
    fn test_revoke_range_stops_at_first_failure() {
        let mut caps = setup();
        let mut hooks = TestHooks {
            refuse: vec![(T1, 12)],
            ..TestHooks::default()
        };
        for sel in [10, 12, 14] {
            caps.insert(T1, sel, 1, mem(1)).unwrap();
        }

        let res = caps.revoke_range(T1, CapRngDesc::new(10, 10), true, &mut hooks);
        assert_eq!(res, Err((12, Code::Pending)));
        assert_eq!(caps.get(T1, 10), None);
        assert!(caps.get(T1, 12).is_some());
        // never reached
        assert!(caps.get(T1, 14).is_some());
        assert_eq!(hooks.seen, vec![(T1, 10, false), (T1, 12, false)]);
    }

    #[test]
    fn test_failed_revoke_still_revokes_children() {
        let mut caps = setup();
        let mut hooks = TestHooks {
            refuse: vec![(T1, 1)],
            ..TestHooks::default()
        };
        let srv = caps.insert(T1, 1, 1, CapKind::Vpe(9)).unwrap();
        let s1 = caps.insert(T2, 5, 1, mem(1)).unwrap();
        let s2 = caps.insert(T2, 6, 1, mem(1)).unwrap();
        caps.inherit(srv, s1);
        caps.inherit(srv, s2);

        assert_eq!(caps.revoke(srv, &mut hooks), Err(Code::Pending));
        assert_eq!(caps.get(T1, 1), Some(srv));
        assert_eq!(caps.cap(srv).child, None);
        assert_eq!(caps.get(T2, 5), None);
        assert_eq!(caps.get(T2, 6), None);
        assert_eq!(hooks.seen[0], (T1, 1, true));

        // second attempt: no children left, hook decides alone
        hooks.refuse.clear();
        assert_eq!(caps.revoke(srv, &mut hooks), Ok(()));
        assert_eq!(hooks.seen.last(), Some(&(T1, 1, false)));
        assert!(caps.is_empty());
    }

    #[test]
    fn test_revoke_children_only() {
        let mut caps = setup();
        let mut hooks = TestHooks::default();
        let root = caps.insert(T1, 3, 1, mem(0x1000)).unwrap();
        caps.obtain(T2, 3, root, &mut hooks).unwrap();
        caps.obtain(T2, 4, root, &mut hooks).unwrap();

        caps.revoke_range(T1, CapRngDesc::single(3), false, &mut hooks).unwrap();
        assert_eq!(caps.get(T1, 3), Some(root));
        assert_eq!(caps.cap(root).child, None);
        assert_eq!(caps.table_caps(T2), vec![]);
    }

    #[test]
    fn test_revoke_all_forces_removal() {
        let mut caps = setup();
        let mut hooks = TestHooks {
            refuse: vec![(T1, 4)],
            ..TestHooks::default()
        };
        for sel in 0..8 {
            caps.insert(T1, sel, 1, mem(1)).unwrap();
        }
        let root = caps.get(T1, 0).unwrap();
        caps.obtain(T2, 0, root, &mut hooks).unwrap();

        caps.revoke_all(T1, &mut hooks);
        assert!(caps.table_caps(T1).is_empty());
        assert!(caps.table_caps(T2).is_empty());
        assert!(caps.remove_table(T1));
        assert!(!caps.has_table(T1));
    }

    #[test]
    fn test_remove_table_keeps_non_empty_table() {
        let mut caps = setup();
        let mut hooks = TestHooks::default();
        let a = caps.insert(T1, 3, 1, mem(1)).unwrap();
        assert!(!caps.remove_table(T1));
        assert!(caps.has_table(T1));
        assert_eq!(caps.table_caps(T1), vec![a]);

        caps.revoke(a, &mut hooks).unwrap();
        assert!(caps.remove_table(T1));
        assert!(caps.remove_table(T1));
    }

    #[test]
    fn test_arena_reuses_slots() {
        let mut caps = setup();
        let mut hooks = TestHooks::default();
        let a = caps.insert(T1, 0, 1, mem(1)).unwrap();
        caps.revoke(a, &mut hooks).unwrap();
        let b = caps.insert(T1, 1, 1, mem(1)).unwrap();
        assert_eq!(a, b);
        assert_eq!(caps.cap(b).sel, 1);
    }
}
