use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{AppError, Result};
use crate::ledger::backend::LedgerBackend;
use crate::ledger::entity::{EntityCreate, EntityQuery, LedgerEntity, QueryPage};

/// Entities returned per query page.
const PAGE_SIZE: usize = 100;
/// Simulated seconds per block.
const BLOCK_SECS: f64 = 2.0;
/// Block height the simulated chain starts at.
const BASE_BLOCK: u64 = 1_000;

#[derive(Default)]
struct Inner {
    /// Insertion order, for stable pagination.
    order: Vec<String>,
    by_key: HashMap<String, LedgerEntity>,
}

/// The in-process ledger backend.
///
/// Backs `STORAGE_MODE=memory` and the integration tests. Block height
/// advances with wall time so expiration invariants stay observable.
pub struct MemoryLedger {
    inner: RwLock<Inner>,
    next_key: AtomicU64,
    started: Instant,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_key: AtomicU64::new(1),
            started: Instant::now(),
        }
    }

    fn current_block(&self) -> u64 {
        BASE_BLOCK + (self.started.elapsed().as_secs_f64() / BLOCK_SECS) as u64
    }

    fn mint_key(&self) -> String {
        format!("0x{:032x}", self.next_key.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerBackend for MemoryLedger {
    async fn create_entities(&self, entities: Vec<EntityCreate>) -> Result<Vec<String>> {
        let current = self.current_block();
        for entity in &entities {
            if entity.expiration_block <= current {
                return Err(AppError::LedgerUnavailable(format!(
                    "expiration block {} is not past current block {}",
                    entity.expiration_block, current
                )));
            }
        }

        let mut inner = self.inner.write().await;
        let keys = entities
            .into_iter()
            .map(|entity| {
                let key = self.mint_key();
                inner.by_key.insert(
                    key.clone(),
                    LedgerEntity {
                        key: key.clone(),
                        payload: entity.payload,
                        expiration_block: entity.expiration_block,
                        string_annotations: entity.string_annotations,
                        numeric_annotations: entity.numeric_annotations,
                    },
                );
                inner.order.push(key.clone());
                key
            })
            .collect();

        Ok(keys)
    }

    async fn get_entity(&self, key: &str) -> Result<Option<LedgerEntity>> {
        let current = self.current_block();
        let inner = self.inner.read().await;
        Ok(inner
            .by_key
            .get(key)
            .filter(|e| e.expiration_block > current)
            .cloned())
    }

    async fn query_entities(
        &self,
        query: &EntityQuery,
        cursor: Option<String>,
    ) -> Result<QueryPage> {
        let offset: usize = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| AppError::Validation(format!("invalid query cursor '{}'", c)))?,
            None => 0,
        };
        let page_size = query.limit.unwrap_or(PAGE_SIZE).min(PAGE_SIZE);
        let current = self.current_block();

        let inner = self.inner.read().await;
        let mut matched = 0usize;
        let mut entities = Vec::new();
        let mut exhausted = true;

        for key in &inner.order {
            let Some(entity) = inner.by_key.get(key) else {
                continue;
            };
            if entity.expiration_block <= current || !query.matches(entity) {
                continue;
            }
            matched += 1;
            if matched <= offset {
                continue;
            }
            if entities.len() == page_size {
                exhausted = false;
                break;
            }
            entities.push(entity.clone());
        }

        let next_cursor = if exhausted {
            None
        } else {
            Some((offset + entities.len()).to_string())
        };

        Ok(QueryPage {
            entities,
            next_cursor,
        })
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.current_block())
    }

    async fn block_duration_secs(&self) -> Result<f64> {
        Ok(BLOCK_SECS)
    }

    fn can_write(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::entity::Annotation;

    fn entity(kind: &str, tag: u64) -> EntityCreate {
        EntityCreate {
            payload: vec![tag as u8],
            expiration_block: BASE_BLOCK + 10_000,
            string_annotations: vec![Annotation::new("type", kind.to_string())],
            numeric_annotations: vec![Annotation::new("tag", tag)],
        }
    }

    #[tokio::test]
    async fn create_returns_one_key_per_entity_in_order() {
        let ledger = MemoryLedger::new();
        let keys = ledger
            .create_entities(vec![entity("chunk", 0), entity("chunk", 1)])
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);

        let first = ledger.get_entity(&keys[0]).await.unwrap().unwrap();
        assert_eq!(first.numeric_annotation("tag"), Some(0));
    }

    #[tokio::test]
    async fn stale_expiration_blocks_are_rejected() {
        let ledger = MemoryLedger::new();
        let stale = EntityCreate {
            expiration_block: 0,
            ..entity("chunk", 0)
        };
        assert!(ledger.create_entities(vec![stale]).await.is_err());
    }

    #[tokio::test]
    async fn query_pages_drain_with_cursors() {
        let ledger = MemoryLedger::new();
        let batch: Vec<EntityCreate> = (0..250).map(|i| entity("chunk", i)).collect();
        ledger.create_entities(batch).await.unwrap();
        ledger.create_entities(vec![entity("metadata", 0)]).await.unwrap();

        let query = EntityQuery::new().with_str("type", "chunk");
        let mut seen = 0usize;
        let mut cursor = None;
        let mut pages = 0usize;
        loop {
            let page = ledger.query_entities(&query, cursor).await.unwrap();
            seen += page.entities.len();
            pages += 1;
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(seen, 250);
        assert!(pages >= 3, "250 matches must span several pages");
    }

    #[tokio::test]
    async fn query_limit_caps_the_first_page() {
        let ledger = MemoryLedger::new();
        let batch: Vec<EntityCreate> = (0..5).map(|i| entity("metadata", i)).collect();
        ledger.create_entities(batch).await.unwrap();

        let query = EntityQuery::new().with_str("type", "metadata").with_limit(1);
        let page = ledger.query_entities(&query, None).await.unwrap();
        assert_eq!(page.entities.len(), 1);
    }
}
