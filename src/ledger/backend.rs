use async_trait::async_trait;

use crate::error::Result;
use crate::ledger::entity::{EntityCreate, EntityQuery, LedgerEntity, QueryPage};

/// A handle onto the content-addressed ledger.
///
/// Implemented by the JSON-RPC client for real deployments and by the
/// in-process backend for memory mode and tests. Handles are pooled; one
/// handle serves one call at a time.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Writes a batch of entities in a single ledger transaction.
    ///
    /// Returns one entity key per input, in order. The call is
    /// all-or-nothing: a failed batch creates no entities.
    async fn create_entities(&self, entities: Vec<EntityCreate>) -> Result<Vec<String>>;

    /// Fetches a single entity by its key.
    async fn get_entity(&self, key: &str) -> Result<Option<LedgerEntity>>;

    /// Runs one page of an annotation query. Callers drain pages by passing
    /// the returned cursor back in.
    async fn query_entities(
        &self,
        query: &EntityQuery,
        cursor: Option<String>,
    ) -> Result<QueryPage>;

    /// The ledger's current block height.
    async fn block_number(&self) -> Result<u64>;

    /// Seconds per block, from the ledger's timing probe.
    async fn block_duration_secs(&self) -> Result<f64>;

    /// Whether this handle holds write credentials.
    fn can_write(&self) -> bool;
}
