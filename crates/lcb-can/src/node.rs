//! Node identities: 48-bit Node IDs, 12-bit aliases and handles combining them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Globally unique 48-bit node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    pub const MASK: u64 = 0xFFFF_FFFF_FFFF;

    /// Create a Node ID; bits above 48 are discarded.
    pub const fn new(raw: u64) -> Self {
        NodeId(raw & Self::MASK)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Big-endian wire representation.
    pub fn to_bytes(&self) -> [u8; 6] {
        let b = self.0.to_be_bytes();
        [b[2], b[3], b[4], b[5], b[6], b[7]]
    }

    /// Read a Node ID from the first six bytes of `data`.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let bytes: &[u8; 6] = data.get(..6)?.try_into().ok()?;
        let mut wide = [0u8; 8];
        wide[2..].copy_from_slice(bytes);
        Some(NodeId(u64::from_be_bytes(wide)))
    }

    /// The 12-bit segment of this ID carried by Check-ID frame `seq` (7..=4).
    pub fn cid_segment(&self, seq: u8) -> u16 {
        let shift = 12 * u32::from(seq.clamp(4, 7) - 4);
        ((self.0 >> shift) & 0xFFF) as u16
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.to_bytes()))
    }
}

impl From<u64> for NodeId {
    fn from(raw: u64) -> Self {
        NodeId::new(raw)
    }
}

/// 12-bit bus-local alias standing in for a Node ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAlias(u16);

impl NodeAlias {
    pub const MASK: u16 = 0xFFF;

    /// Create an alias; bits above 12 are discarded.
    pub const fn new(raw: u16) -> Self {
        NodeAlias(raw & Self::MASK)
    }

    pub const fn raw(&self) -> u16 {
        self.0
    }

    /// Alias zero is reserved and never assigned to a node.
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for NodeAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}", self.0)
    }
}

impl From<u16> for NodeAlias {
    fn from(raw: u16) -> Self {
        NodeAlias::new(raw)
    }
}

/// A node named by ID, alias, or both. Either half may be unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeHandle {
    #[serde(default)]
    pub id: Option<NodeId>,
    #[serde(default)]
    pub alias: Option<NodeAlias>,
}

impl NodeHandle {
    pub fn new(id: NodeId, alias: NodeAlias) -> Self {
        NodeHandle {
            id: Some(id),
            alias: Some(alias),
        }
    }

    pub fn from_id(id: NodeId) -> Self {
        NodeHandle {
            id: Some(id),
            alias: None,
        }
    }

    pub fn from_alias(alias: NodeAlias) -> Self {
        NodeHandle {
            id: None,
            alias: Some(alias),
        }
    }

    /// True if neither half is known.
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.alias.map_or(true, |a| !a.is_valid())
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.id, self.alias) {
            (Some(id), Some(alias)) => write!(f, "{id}/{alias}"),
            (Some(id), None) => write!(f, "{id}/?"),
            (None, Some(alias)) => write!(f, "?/{alias}"),
            (None, None) => f.write_str("?/?"),
        }
    }
}
