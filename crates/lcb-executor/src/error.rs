//! Error types for the executor crate.

use thiserror::Error;

/// Errors reported by [`Pool`](crate::Pool) reservations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Every slot of the pool is leased.
    #[error("pool {pool} exhausted ({capacity} slots in use)")]
    Exhausted { pool: String, capacity: usize },

    /// A blocking reservation gave up before a slot came free.
    #[error("timed out waiting for a slot in pool {pool}")]
    Timeout { pool: String },
}

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;
