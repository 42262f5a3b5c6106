//! Candidate alias generation.

use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::node::{NodeAlias, NodeId};

/// Supplies candidate aliases to the allocator.
///
/// Candidates may repeat or be zero; the allocator skips anything unusable.
pub trait AliasSource: Send {
    fn next_alias(&mut self) -> NodeAlias;
}

/// The 48-bit generator nodes use to derive aliases from their Node ID.
///
/// Two nodes with different IDs produce different sequences, so restarting
/// after a conflict rarely collides twice.
#[derive(Debug, Clone)]
pub struct PrngAliasSource {
    seed: u64,
}

impl PrngAliasSource {
    const MASK: u64 = 0xFFFF_FFFF_FFFF;
    const INCREMENT: u64 = 0x1B0C_A37A_4BA9;

    pub fn new(node: NodeId) -> Self {
        PrngAliasSource { seed: node.raw() }
    }

    fn advance(&mut self) {
        self.seed = (self.seed.wrapping_shl(9))
            .wrapping_add(self.seed)
            .wrapping_add(Self::INCREMENT)
            & Self::MASK;
    }
}

impl AliasSource for PrngAliasSource {
    fn next_alias(&mut self) -> NodeAlias {
        let s = self.seed;
        let alias = (s ^ (s >> 12) ^ (s >> 24) ^ (s >> 36)) & 0xFFF;
        self.advance();
        NodeAlias::new(alias as u16)
    }
}

/// Hands out a fixed list of aliases first, then falls back to the node's
/// generator. Lets tests pin the exact frames an interface emits.
#[derive(Debug, Clone)]
pub struct ScriptedAliasSource {
    script: VecDeque<NodeAlias>,
    fallback: PrngAliasSource,
}

impl ScriptedAliasSource {
    pub fn new(node: NodeId, aliases: impl IntoIterator<Item = u16>) -> Self {
        ScriptedAliasSource {
            script: aliases.into_iter().map(NodeAlias::new).collect(),
            fallback: PrngAliasSource::new(node),
        }
    }

    /// Scripted aliases not yet handed out.
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl AliasSource for ScriptedAliasSource {
    fn next_alias(&mut self) -> NodeAlias {
        match self.script.pop_front() {
            Some(alias) => alias,
            None => self.fallback.next_alias(),
        }
    }
}

/// Uniform candidates from a seeded ChaCha stream, for simulations that
/// want every run reproducible but not tied to Node IDs.
#[derive(Debug, Clone)]
pub struct RandomAliasSource {
    rng: ChaCha8Rng,
}

impl RandomAliasSource {
    pub fn new(seed: u64) -> Self {
        RandomAliasSource {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl AliasSource for RandomAliasSource {
    fn next_alias(&mut self) -> NodeAlias {
        NodeAlias::new(self.rng.gen_range(1..=0xFFF))
    }
}
