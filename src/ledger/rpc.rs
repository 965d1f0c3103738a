use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{AppError, Result};
use crate::ledger::backend::LedgerBackend;
use crate::ledger::entity::{Annotation, EntityCreate, EntityQuery, LedgerEntity, QueryPage};

/// Header carrying the write credential to the ledger node.
const CREDENTIAL_HEADER: &str = "x-ledger-key";

/// A JSON-RPC 2.0 client handle onto the ledger node.
///
/// One handle per pooled slot; the underlying `reqwest::Client` applies the
/// per-call deadline and connect timeout from the configuration.
pub struct LedgerRpcClient {
    http: reqwest::Client,
    url: String,
    private_key: Option<String>,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Serialize)]
struct EntityCreateDto {
    /// Hex-encoded payload bytes.
    payload: String,
    expiration_block: u64,
    string_annotations: Vec<Annotation<String>>,
    numeric_annotations: Vec<Annotation<u64>>,
}

#[derive(Deserialize)]
struct EntityDto {
    key: String,
    payload: String,
    expiration_block: u64,
    #[serde(default)]
    string_annotations: Vec<Annotation<String>>,
    #[serde(default)]
    numeric_annotations: Vec<Annotation<u64>>,
}

#[derive(Serialize)]
struct QueryParams<'a> {
    query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct QueryResultDto {
    #[serde(default)]
    entities: Vec<EntityDto>,
    next_cursor: Option<String>,
}

impl EntityDto {
    fn into_entity(self) -> Result<LedgerEntity> {
        let payload = hex::decode(&self.payload).map_err(|e| {
            AppError::Internal(format!("entity {} payload is not valid hex: {}", self.key, e))
        })?;
        Ok(LedgerEntity {
            key: self.key,
            payload,
            expiration_block: self.expiration_block,
            string_annotations: self.string_annotations,
            numeric_annotations: self.numeric_annotations,
        })
    }
}

impl LedgerRpcClient {
    /// Creates a new client handle.
    ///
    /// # Arguments
    ///
    /// * `url` - The ledger node's JSON-RPC endpoint.
    /// * `private_key` - The write credential, if this handle may write.
    /// * `timeout` - The per-call deadline.
    /// * `connect_timeout` - The connection-establishment deadline.
    pub fn new(
        url: &str,
        private_key: Option<String>,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self {
            http,
            url: url.to_string(),
            private_key,
            next_id: AtomicU64::new(1),
        })
    }

    /// Issues one JSON-RPC call; a `null` result is `Ok(None)`.
    async fn call_opt<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<Option<R>> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let mut builder = self.http.post(&self.url).json(&request);
        if let Some(key) = &self.private_key {
            builder = builder.header(CREDENTIAL_HEADER, key.as_str());
        }

        let response = builder.send().await.map_err(classify_transport)?;
        let response: RpcResponse<R> = response
            .error_for_status()
            .map_err(classify_transport)?
            .json()
            .await
            .map_err(classify_transport)?;

        if let Some(error) = response.error {
            return Err(AppError::LedgerUnavailable(format!(
                "{} rejected: {} (code {})",
                method, error.message, error.code
            )));
        }

        Ok(response.result)
    }

    /// Issues one JSON-RPC call whose result must be present.
    async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
        self.call_opt(method, params).await?.ok_or_else(|| {
            AppError::LedgerUnavailable(format!("{} returned an empty result", method))
        })
    }
}

/// Maps a transport failure onto the error taxonomy.
fn classify_transport(err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::Timeout(format!("ledger call: {}", err))
    } else if err.is_connect() {
        AppError::Connection(format!("ledger node unreachable: {}", err))
    } else {
        AppError::Transport(err)
    }
}

#[async_trait]
impl LedgerBackend for LedgerRpcClient {
    async fn create_entities(&self, entities: Vec<EntityCreate>) -> Result<Vec<String>> {
        if !self.can_write() {
            return Err(AppError::LedgerUnavailable(
                "handle has no write credential".to_string(),
            ));
        }

        let dtos: Vec<EntityCreateDto> = entities
            .into_iter()
            .map(|e| EntityCreateDto {
                payload: hex::encode(&e.payload),
                expiration_block: e.expiration_block,
                string_annotations: e.string_annotations,
                numeric_annotations: e.numeric_annotations,
            })
            .collect();

        self.call("vault_createEntities", (dtos,)).await
    }

    async fn get_entity(&self, key: &str) -> Result<Option<LedgerEntity>> {
        let dto: Option<EntityDto> = self.call_opt("vault_getEntity", (key,)).await?;
        dto.map(EntityDto::into_entity).transpose()
    }

    async fn query_entities(
        &self,
        query: &EntityQuery,
        cursor: Option<String>,
    ) -> Result<QueryPage> {
        let params = QueryParams {
            query: query.to_expression(),
            cursor: cursor.as_deref(),
            limit: query.limit,
        };
        let result: QueryResultDto = self.call("vault_queryEntities", (params,)).await?;

        let entities = result
            .entities
            .into_iter()
            .map(EntityDto::into_entity)
            .collect::<Result<Vec<_>>>()?;

        Ok(QueryPage {
            entities,
            next_cursor: result.next_cursor,
        })
    }

    async fn block_number(&self) -> Result<u64> {
        self.call("vault_blockNumber", ()).await
    }

    async fn block_duration_secs(&self) -> Result<f64> {
        self.call("vault_blockDuration", ()).await
    }

    fn can_write(&self) -> bool {
        self.private_key.is_some()
    }
}
