//! Splitting addressed payloads into frames and joining them back.
//!
//! Every frame of an addressed message starts with two bytes holding the
//! continuation code in the top nibble and the destination alias in the low
//! twelve bits. Six payload bytes follow.

use std::collections::HashMap;

use tracing::debug;

use crate::mti::Mti;
use crate::node::NodeAlias;

/// Payload bytes per addressed frame.
pub const ADDRESSED_CHUNK: usize = 6;

/// Continuation codes of the addressed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Only,
    First,
    Middle,
    Last,
}

impl Continuation {
    pub fn code(&self) -> u8 {
        match self {
            Continuation::Only => 0,
            Continuation::First => 1,
            Continuation::Last => 2,
            Continuation::Middle => 3,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code & 0x3 {
            0 => Continuation::Only,
            1 => Continuation::First,
            2 => Continuation::Last,
            _ => Continuation::Middle,
        }
    }
}

/// Build the two-byte header of an addressed frame.
pub fn addressed_header(cont: Continuation, dst: NodeAlias) -> [u8; 2] {
    let word = (u16::from(cont.code()) << 12) | dst.raw();
    word.to_be_bytes()
}

/// Split an addressed frame's data into continuation, destination and body.
/// `None` if the header is missing.
pub fn parse_addressed(data: &[u8]) -> Option<(Continuation, NodeAlias, &[u8])> {
    let header = data.get(..2)?;
    let cont = Continuation::from_code(header[0] >> 4);
    let dst = NodeAlias::new(u16::from_be_bytes([header[0], header[1]]));
    Some((cont, dst, &data[2..]))
}

/// Frame data for an addressed payload, in transmit order. An empty payload
/// still yields one frame carrying just the header.
pub fn fragment_addressed(dst: NodeAlias, payload: &[u8]) -> Vec<Vec<u8>> {
    if payload.len() <= ADDRESSED_CHUNK {
        let mut data = addressed_header(Continuation::Only, dst).to_vec();
        data.extend_from_slice(payload);
        return vec![data];
    }

    let chunks: Vec<&[u8]> = payload.chunks(ADDRESSED_CHUNK).collect();
    let last = chunks.len() - 1;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let cont = match i {
                0 => Continuation::First,
                i if i == last => Continuation::Last,
                _ => Continuation::Middle,
            };
            let mut data = addressed_header(cont, dst).to_vec();
            data.extend_from_slice(chunk);
            data
        })
        .collect()
}

/// Joins addressed fragments per (source, destination, MTI).
///
/// Fragments from different sources may interleave on the bus; each source
/// sends its own fragments in order. At most `slots` messages are assembled
/// at once; a new first fragment beyond that evicts the oldest one. A
/// message growing past `max_len` bytes is dropped.
#[derive(Debug)]
pub struct Reassembler {
    partial: HashMap<(NodeAlias, NodeAlias, Mti), Partial>,
    slots: usize,
    max_len: usize,
    /// Start order of partial messages, for eviction.
    clock: u64,
    dropped: u64,
}

#[derive(Debug)]
struct Partial {
    started: u64,
    buf: Vec<u8>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS, DEFAULT_MAX_LEN)
    }
}

const DEFAULT_SLOTS: usize = 8;
const DEFAULT_MAX_LEN: usize = 256;

impl Reassembler {
    pub fn new(slots: usize, max_len: usize) -> Self {
        Reassembler {
            partial: HashMap::new(),
            slots: slots.max(1),
            max_len,
            clock: 0,
            dropped: 0,
        }
    }

    /// Feed one fragment body. Returns the full payload once the last
    /// fragment arrives. A middle or last fragment with no first is dropped.
    pub fn push(
        &mut self,
        src: NodeAlias,
        dst: NodeAlias,
        mti: Mti,
        cont: Continuation,
        body: &[u8],
    ) -> Option<Vec<u8>> {
        let key = (src, dst, mti);
        match cont {
            Continuation::Only => Some(body.to_vec()),
            Continuation::First => {
                if !self.partial.contains_key(&key) && self.partial.len() >= self.slots {
                    self.evict_oldest();
                }
                self.clock += 1;
                let partial = Partial {
                    started: self.clock,
                    buf: body.to_vec(),
                };
                if self.partial.insert(key, partial).is_some() {
                    self.dropped += 1;
                }
                self.check_len(key);
                None
            }
            Continuation::Middle => {
                if let Some(partial) = self.partial.get_mut(&key) {
                    partial.buf.extend_from_slice(body);
                    self.check_len(key);
                }
                None
            }
            Continuation::Last => {
                let mut partial = self.partial.remove(&key)?;
                partial.buf.extend_from_slice(body);
                if partial.buf.len() > self.max_len {
                    self.dropped += 1;
                    debug!(src = %src, mti = %mti, len = partial.buf.len(), "reassembled message too long");
                    return None;
                }
                Some(partial.buf)
            }
        }
    }

    fn check_len(&mut self, key: (NodeAlias, NodeAlias, Mti)) {
        if self.partial.get(&key).is_some_and(|p| p.buf.len() > self.max_len) {
            self.partial.remove(&key);
            self.dropped += 1;
            debug!(src = %key.0, mti = %key.2, max = self.max_len, "partial message too long, dropped");
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .partial
            .iter()
            .min_by_key(|(_, p)| p.started)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            self.partial.remove(&key);
            self.dropped += 1;
            debug!(src = %key.0, mti = %key.2, "no reassembly slot, oldest partial message dropped");
        }
    }

    /// Messages waiting for more fragments.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Messages given up on: evicted, too long, or restarted by a new first
    /// fragment.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Bytes collected so far for a partial message.
    pub fn partial_len(&self, src: NodeAlias, dst: NodeAlias, mti: Mti) -> Option<usize> {
        self.partial.get(&(src, dst, mti)).map(|p| p.buf.len())
    }
}
