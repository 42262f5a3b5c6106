//! Error types for the CAN interface.

use lcb_executor::PoolError;
use thiserror::Error;

use crate::mti::Mti;
use crate::node::{NodeAlias, NodeId};

/// Outcome of a failed interface operation.
///
/// Every asynchronous request reports through its own [`Completion`](crate::Completion),
/// so these values are cloned into completions and compared in tests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IfError {
    /// No free message slot for the request.
    #[error("no free message slot")]
    ResourceExhausted,

    /// An alias was lost to another node.
    #[error("alias {alias} is in use by another node")]
    ProtocolConflict { alias: NodeAlias },

    /// The destination never answered alias resolution.
    #[error("no alias found for node {node}")]
    LookupTimeout { node: NodeId },

    /// The MTI cannot be carried by the message write path.
    #[error("MTI {mti} cannot be sent as a CAN message frame")]
    UnsupportedMti { mti: Mti },

    /// An unaddressed payload larger than one frame.
    #[error("payload of {len} bytes exceeds {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    /// An addressed write without a usable destination.
    #[error("destination is missing or not addressable")]
    InvalidDestination,

    /// The request was dropped before it completed.
    #[error("request abandoned")]
    Abandoned,
}

/// Result type alias for interface operations.
pub type IfResult<T> = Result<T, IfError>;

impl From<PoolError> for IfError {
    fn from(_: PoolError) -> Self {
        IfError::ResourceExhausted
    }
}

/// Errors from building or parsing CAN frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// GridConnect text that does not follow `:X<id>N<data>;`.
    #[error("malformed GridConnect frame: {0}")]
    Malformed(String),

    /// Hex digits that do not parse.
    #[error("invalid hex in frame: {0}")]
    InvalidHex(String),

    /// More than eight data bytes.
    #[error("frame data too long: {len} bytes (max 8)")]
    DataTooLong { len: usize },

    /// Identifier wider than the frame format allows.
    #[error("identifier {id:#X} does not fit a {bits}-bit frame")]
    IdOutOfRange { id: u32, bits: u8 },
}
