//! Capabilities and capability tables
//!
//! All capabilities of the system live in one arena ([`CapTables`]) and are
//! addressed by [`CapId`]. Every table (one kernel table, and an object and
//! a map table per VPE) is a treap over arena nodes keyed by selector.
//!
//! Besides the treap links, every capability carries ownership links
//! (parent, first child, next/prev sibling). Obtaining a capability makes
//! the copy a child of its source; revoking a capability revokes its whole
//! subtree, across tables.

pub mod kind;
pub mod table;
pub mod treap;

use serde::{Deserialize, Serialize};

use crate::types::VpeId;

pub use kind::{
    Activation, CapKind, CapType, MGateObject, RGateObject, SGateObject, SessObject,
};
pub use table::{CapHooks, Capability, CapTables, RevokeCtx};
pub use treap::{Treap, TreapArena, TreapLinks};

/// Handle of a capability in the arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapId(pub u32);

/// Identifies a capability table
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TableId {
    /// Capabilities owned by the kernel itself
    Kernel,
    /// Object capabilities of a VPE
    Obj(VpeId),
    /// Mapping capabilities of a VPE, keyed by virtual page number
    Map(VpeId),
}

impl TableId {
    /// VPE owning the table
    pub fn vpe(&self) -> Option<VpeId> {
        match self {
            TableId::Kernel => None,
            TableId::Obj(v) | TableId::Map(v) => Some(*v),
        }
    }
}
