//! Bidirectional Node ID / alias map with reservation and eviction.
//!
//! An interface keeps two of these: one for aliases it owns and one for
//! bindings learned from other nodes. Each alias maps to at most one Node ID
//! and each Node ID to at most one alias. Only the executor thread touches a
//! cache, so it needs no locking.

use std::collections::{BTreeMap, HashMap};

use crate::node::{NodeAlias, NodeId};

/// Lifecycle of an alias within one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasState {
    /// Not present.
    Free,
    /// Claimed on the bus, not yet handed to a node.
    Reserved,
    /// Mapped to a Node ID.
    Bound,
    /// Lost to another node; reported by [`AliasCache::conflict`] as the
    /// entry leaves the cache.
    Conflicted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasEntry {
    pub node: Option<NodeId>,
    pub alias: NodeAlias,
    pub state: AliasState,
    /// Logical time of the last insert; the smallest value is evicted first.
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct AliasCache {
    capacity: usize,
    by_alias: BTreeMap<NodeAlias, AliasEntry>,
    by_node: HashMap<NodeId, NodeAlias>,
    clock: u64,
}

impl AliasCache {
    pub fn new(capacity: usize) -> Self {
        AliasCache {
            capacity: capacity.max(1),
            by_alias: BTreeMap::new(),
            by_node: HashMap::new(),
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.by_alias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_alias.is_empty()
    }

    /// Bind `alias` to `node`, replacing any entry for either of them.
    pub fn add(&mut self, node: NodeId, alias: NodeAlias) {
        self.remove_node(node);
        self.remove(alias);
        self.insert(AliasEntry {
            node: Some(node),
            alias,
            state: AliasState::Bound,
            timestamp: 0,
        });
        self.by_node.insert(node, alias);
    }

    /// Record `alias` as reserved by this cache's owner.
    pub fn reserve(&mut self, alias: NodeAlias) {
        self.remove(alias);
        self.insert(AliasEntry {
            node: None,
            alias,
            state: AliasState::Reserved,
            timestamp: 0,
        });
    }

    fn insert(&mut self, mut entry: AliasEntry) {
        if self.by_alias.len() >= self.capacity {
            self.evict_oldest();
        }
        self.clock += 1;
        entry.timestamp = self.clock;
        self.by_alias.insert(entry.alias, entry);
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .by_alias
            .values()
            .min_by_key(|e| e.timestamp)
            .map(|e| e.alias);
        if let Some(alias) = oldest {
            self.remove(alias);
        }
    }

    /// Drop `alias`. Removing an absent alias is a no-op.
    pub fn remove(&mut self, alias: NodeAlias) -> Option<AliasEntry> {
        let entry = self.by_alias.remove(&alias)?;
        if let Some(node) = entry.node {
            if self.by_node.get(&node) == Some(&alias) {
                self.by_node.remove(&node);
            }
        }
        Some(entry)
    }

    /// Drop whatever alias `node` is bound to.
    pub fn remove_node(&mut self, node: NodeId) -> Option<AliasEntry> {
        let alias = self.by_node.get(&node).copied()?;
        self.remove(alias)
    }

    /// Evict `alias` because another node is using it. Returns the evicted
    /// entry marked [`AliasState::Conflicted`].
    pub fn conflict(&mut self, alias: NodeAlias) -> Option<AliasEntry> {
        let mut entry = self.remove(alias)?;
        entry.state = AliasState::Conflicted;
        Some(entry)
    }

    pub fn lookup_by_node(&self, node: NodeId) -> Option<NodeAlias> {
        self.by_node.get(&node).copied()
    }

    /// The node bound to `alias`. Reserved aliases have none.
    pub fn lookup_by_alias(&self, alias: NodeAlias) -> Option<NodeId> {
        self.by_alias.get(&alias).and_then(|e| e.node)
    }

    pub fn state(&self, alias: NodeAlias) -> AliasState {
        self.by_alias
            .get(&alias)
            .map_or(AliasState::Free, |e| e.state)
    }

    pub fn contains_alias(&self, alias: NodeAlias) -> bool {
        self.by_alias.contains_key(&alias)
    }

    pub fn get(&self, alias: NodeAlias) -> Option<&AliasEntry> {
        self.by_alias.get(&alias)
    }

    /// Bound pairs in alias order.
    pub fn bound(&self) -> impl Iterator<Item = (NodeId, NodeAlias)> + '_ {
        self.by_alias
            .values()
            .filter_map(|e| Some((e.node?, e.alias)))
    }

    pub fn entries(&self) -> impl Iterator<Item = &AliasEntry> + '_ {
        self.by_alias.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> NodeId {
        NodeId::new(raw)
    }

    fn alias(raw: u16) -> NodeAlias {
        NodeAlias::new(raw)
    }

    #[test]
    fn test_add_and_lookup_both_ways() {
        let mut cache = AliasCache::new(4);
        cache.add(id(0x050101FFFFDD), alias(0x210));
        assert_eq!(cache.lookup_by_node(id(0x050101FFFFDD)), Some(alias(0x210)));
        assert_eq!(cache.lookup_by_alias(alias(0x210)), Some(id(0x050101FFFFDD)));
        assert_eq!(cache.state(alias(0x210)), AliasState::Bound);
        assert_eq!(cache.state(alias(0x211)), AliasState::Free);
    }

    #[test]
    fn test_add_replaces_previous_bindings() {
        let mut cache = AliasCache::new(4);
        cache.add(id(1), alias(0x100));
        cache.add(id(1), alias(0x200));
        assert_eq!(cache.lookup_by_alias(alias(0x100)), None);
        assert_eq!(cache.lookup_by_node(id(1)), Some(alias(0x200)));

        cache.add(id(2), alias(0x200));
        assert_eq!(cache.lookup_by_node(id(1)), None);
        assert_eq!(cache.lookup_by_alias(alias(0x200)), Some(id(2)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut cache = AliasCache::new(4);
        cache.add(id(1), alias(0x100));
        assert!(cache.remove(alias(0x300)).is_none());
        assert!(cache.remove(alias(0x100)).is_some());
        assert!(cache.remove(alias(0x100)).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.lookup_by_node(id(1)), None);
    }

    #[test]
    fn test_reserved_alias_has_no_node() {
        let mut cache = AliasCache::new(4);
        cache.reserve(alias(0x44C));
        assert_eq!(cache.state(alias(0x44C)), AliasState::Reserved);
        assert_eq!(cache.lookup_by_alias(alias(0x44C)), None);
        cache.add(id(7), alias(0x44C));
        assert_eq!(cache.state(alias(0x44C)), AliasState::Bound);
    }

    #[test]
    fn test_conflict_evicts() {
        let mut cache = AliasCache::new(4);
        cache.add(id(1), alias(0x22A));
        let entry = cache.conflict(alias(0x22A)).unwrap();
        assert_eq!(entry.state, AliasState::Conflicted);
        assert_eq!(entry.node, Some(id(1)));
        assert_eq!(cache.state(alias(0x22A)), AliasState::Free);
        assert!(cache.conflict(alias(0x22A)).is_none());
    }

    #[test]
    fn test_full_cache_evicts_oldest() {
        let mut cache = AliasCache::new(2);
        cache.add(id(1), alias(0x001));
        cache.add(id(2), alias(0x002));
        // Refreshing node 1 makes node 2 the oldest.
        cache.add(id(1), alias(0x001));
        cache.add(id(3), alias(0x003));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup_by_node(id(2)), None);
        assert_eq!(cache.lookup_by_node(id(1)), Some(alias(0x001)));
        assert_eq!(cache.lookup_by_node(id(3)), Some(alias(0x003)));
    }

    #[test]
    fn test_bound_iterates_in_alias_order() {
        let mut cache = AliasCache::new(4);
        cache.add(id(2), alias(0x300));
        cache.reserve(alias(0x200));
        cache.add(id(1), alias(0x100));
        let bound: Vec<_> = cache.bound().collect();
        assert_eq!(bound, vec![(id(1), alias(0x100)), (id(2), alias(0x300))]);
    }
}
