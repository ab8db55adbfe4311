//! Alias registries and the local node table.
//!
//! Alias allocation and bus-level discovery live outside this crate; these
//! registries are the lookup surface the core consumes. Both directions of
//! the (alias, node-id) translation are served from one table, small enough
//! that a linear scan beats anything cleverer.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use super::{NodeAlias, NodeId};

/// Shared alias ↔ node-id registry.
#[derive(Clone, Default)]
pub struct AliasRegistry {
    entries: Rc<RefCell<Vec<(NodeAlias, NodeId)>>>,
}

impl AliasRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the mapping for `alias`.
    pub fn register(&self, alias: NodeAlias, id: NodeId) {
        let mut entries = self.entries.borrow_mut();
        if let Some(slot) = entries.iter_mut().find(|(a, _)| *a == alias) {
            debug!("alias {alias:03x} remapped to {id:012x}");
            slot.1 = id;
        } else {
            entries.push((alias, id));
        }
    }

    pub fn unregister(&self, alias: NodeAlias) {
        self.entries.borrow_mut().retain(|(a, _)| *a != alias);
    }

    /// Node id for `alias`, if known. Zero aliases never match.
    pub fn lookup_id(&self, alias: NodeAlias) -> Option<NodeId> {
        if alias == 0 {
            return None;
        }
        self.entries.borrow().iter().find(|(a, _)| *a == alias).map(|(_, id)| *id)
    }

    /// Alias for `id`, if known.
    pub fn lookup_alias(&self, id: NodeId) -> Option<NodeAlias> {
        if id == 0 {
            return None;
        }
        self.entries.borrow().iter().find(|(_, i)| *i == id).map(|(a, _)| *a)
    }
}

/// The set of node ids hosted on this interface.
#[derive(Clone, Default)]
pub struct LocalNodeTable {
    nodes: Rc<RefCell<Vec<NodeId>>>,
}

impl LocalNodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: NodeId) {
        let mut nodes = self.nodes.borrow_mut();
        if !nodes.contains(&id) {
            nodes.push(id);
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id != 0 && self.nodes.borrow().contains(&id)
    }
}
