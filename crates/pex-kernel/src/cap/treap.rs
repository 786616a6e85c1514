//! Treap over arena-allocated capability nodes
//!
//! Nodes are ordered by selector (BST) and by priority (min-heap). Priorities
//! are not random: every insert takes the next value of a Fibonacci-hashing
//! sequence, which spreads them well enough to keep the tree balanced while
//! staying deterministic.
//!
//! The treap does not own nodes. It links them through [`TreapLinks`] stored
//! inside each node and reaches them through the [`TreapArena`] trait.

use super::CapId;
use crate::types::CapSel;

const PRIO_START: u32 = 314_159_265;
const PRIO_STEP: u32 = 0x9e37_79b9;

/// Per-node treap links
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreapLinks {
    pub prio: u32,
    pub left: Option<CapId>,
    pub right: Option<CapId>,
}

/// Access to the nodes a treap links together
pub trait TreapArena {
    /// BST key of the node
    fn key(&self, id: CapId) -> CapSel;
    /// Whether the node covers `key` (nodes may span a selector range)
    fn matches(&self, id: CapId, key: CapSel) -> bool;
    fn links(&self, id: CapId) -> &TreapLinks;
    fn links_mut(&mut self, id: CapId) -> &mut TreapLinks;
}

/// Location of a child pointer: the root or one side of a node
#[derive(Clone, Copy, Debug)]
enum Slot {
    Root,
    Left(CapId),
    Right(CapId),
}

/// A treap keyed by capability selector
#[derive(Debug)]
pub struct Treap {
    root: Option<CapId>,
    next_prio: u32,
}

impl Treap {
    pub fn new() -> Self {
        Self {
            root: None,
            next_prio: PRIO_START,
        }
    }

    pub fn root(&self) -> Option<CapId> {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    fn get<A: TreapArena>(&self, arena: &A, slot: Slot) -> Option<CapId> {
        match slot {
            Slot::Root => self.root,
            Slot::Left(n) => arena.links(n).left,
            Slot::Right(n) => arena.links(n).right,
        }
    }

    fn set<A: TreapArena>(&mut self, arena: &mut A, slot: Slot, val: Option<CapId>) {
        match slot {
            Slot::Root => self.root = val,
            Slot::Left(n) => arena.links_mut(n).left = val,
            Slot::Right(n) => arena.links_mut(n).right = val,
        }
    }

    /// Find the node covering `key`
    pub fn find<A: TreapArena>(&self, arena: &A, key: CapSel) -> Option<CapId> {
        let mut cur = self.root;
        while let Some(n) = cur {
            if arena.matches(n, key) {
                return Some(n);
            }
            cur = if key < arena.key(n) {
                arena.links(n).left
            } else {
                arena.links(n).right
            };
        }
        None
    }

    /// Node with the smallest key that is `>= key`
    pub fn lower_bound<A: TreapArena>(&self, arena: &A, key: CapSel) -> Option<CapId> {
        let mut cur = self.root;
        let mut best = None;
        while let Some(n) = cur {
            if arena.key(n) >= key {
                best = Some(n);
                cur = arena.links(n).left;
            } else {
                cur = arena.links(n).right;
            }
        }
        best
    }

    /// Link `node` into the treap. Its key must not be present yet.
    pub fn insert<A: TreapArena>(&mut self, arena: &mut A, node: CapId) {
        let key = arena.key(node);
        let prio = self.next_prio;
        self.next_prio = self.next_prio.wrapping_add(PRIO_STEP);

        // descend while the existing nodes have higher priority (smaller value)
        let mut slot = Slot::Root;
        let mut cur = self.root;
        while let Some(n) = cur {
            if arena.links(n).prio >= prio {
                break;
            }
            slot = if key < arena.key(n) {
                Slot::Left(n)
            } else {
                Slot::Right(n)
            };
            cur = self.get(arena, slot);
        }

        self.set(arena, slot, Some(node));
        arena.links_mut(node).prio = prio;

        // split the displaced subtree around `key`
        let mut left = Slot::Left(node);
        let mut right = Slot::Right(node);
        while let Some(n) = cur {
            if key < arena.key(n) {
                self.set(arena, right, Some(n));
                right = Slot::Left(n);
                cur = arena.links(n).left;
            } else {
                self.set(arena, left, Some(n));
                left = Slot::Right(n);
                cur = arena.links(n).right;
            }
        }
        self.set(arena, left, None);
        self.set(arena, right, None);
    }

    /// Unlink `node` from the treap; no-op if it is not linked
    pub fn remove<A: TreapArena>(&mut self, arena: &mut A, node: CapId) {
        let key = arena.key(node);
        let mut slot = Slot::Root;
        loop {
            match self.get(arena, slot) {
                Some(n) if n == node => break,
                Some(n) => {
                    slot = if key < arena.key(n) {
                        Slot::Left(n)
                    } else {
                        Slot::Right(n)
                    };
                }
                None => return,
            }
        }

        // rotate the node down until it has at most one child
        loop {
            let TreapLinks { left, right, .. } = *arena.links(node);
            match (left, right) {
                (Some(l), Some(r)) => {
                    if arena.links(l).prio < arena.links(r).prio {
                        arena.links_mut(node).left = arena.links(l).right;
                        arena.links_mut(l).right = Some(node);
                        self.set(arena, slot, Some(l));
                        slot = Slot::Right(l);
                    } else {
                        arena.links_mut(node).right = arena.links(r).left;
                        arena.links_mut(r).left = Some(node);
                        self.set(arena, slot, Some(r));
                        slot = Slot::Left(r);
                    }
                }
                (Some(c), None) | (None, Some(c)) => {
                    self.set(arena, slot, Some(c));
                    break;
                }
                (None, None) => {
                    self.set(arena, slot, None);
                    break;
                }
            }
        }

        let links = arena.links_mut(node);
        links.left = None;
        links.right = None;
    }

    /// In-order traversal
    pub fn in_order<A: TreapArena>(&self, arena: &A) -> alloc::vec::Vec<CapId> {
        let mut out = alloc::vec::Vec::new();
        let mut stack = alloc::vec::Vec::new();
        let mut cur = self.root;
        while cur.is_some() || !stack.is_empty() {
            while let Some(n) = cur {
                stack.push(n);
                cur = arena.links(n).left;
            }
            if let Some(n) = stack.pop() {
                out.push(n);
                cur = arena.links(n).right;
            }
        }
        out
    }
}

impl Default for Treap {
    fn default() -> Self {
        Self::new()
    }
}
