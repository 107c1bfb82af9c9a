use async_trait::async_trait;
use thiserror::Error;

use crate::hydrate::DehydratedState;

/// Failure inside a persistence backend; the engine treats persistence as
/// best-effort and never propagates these into cache state
#[derive(Debug, Error)]
pub enum PersistError {
    /// The backing storage rejected the operation
    #[error("persister storage failed: {0}")]
    Storage(String),
    /// The stored snapshot could not be decoded
    #[error("persisted snapshot invalid: {0}")]
    Invalid(String),
}

/// A client-side persistence backend for dehydrated cache snapshots
///
/// Implementations decide on encoding, storage and retry; the engine only
/// hands snapshots over and asks for them back.
#[async_trait(?Send)]
pub trait Persister {
    /// Stores a snapshot, replacing any previous one
    async fn persist_client(&self, state: &DehydratedState) -> Result<(), PersistError>;

    /// Loads the stored snapshot, if one exists
    async fn restore_client(&self) -> Result<Option<DehydratedState>, PersistError>;

    /// Deletes the stored snapshot
    async fn remove_client(&self) -> Result<(), PersistError>;
}
