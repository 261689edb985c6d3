//! Authoritative-state lookups supplied by the host.

use protocol::{BlockPos, BlockState};
use thiserror::Error;

use crate::config::ObjectKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("state lookups are not available right now")]
    Unavailable,
    #[error("chunk containing {0} is not loaded")]
    Unloaded(BlockPos),
    #[error("{0}")]
    Failed(String),
}

/// Reads the server's current state of a block.
///
/// Called from inside a connection's packet lane, so implementations must
/// answer from memory and return [`QueryError::Unavailable`] rather than wait
/// on the main thread or on I/O.
pub trait StateQuery: Send + Sync {
    fn query_state(&self, position: BlockPos, kind: ObjectKind) -> Result<BlockState, QueryError>;
}

impl<F> StateQuery for F
where
    F: Fn(BlockPos, ObjectKind) -> Result<BlockState, QueryError> + Send + Sync,
{
    fn query_state(&self, position: BlockPos, kind: ObjectKind) -> Result<BlockState, QueryError> {
        self(position, kind)
    }
}
