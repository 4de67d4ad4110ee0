//! Qdrant REST vector-store compat adapter (manifest kind `qdrant-rest`).
//!
//! Talks the plain HTTP API so the adapter carries no client SDK. Point ids
//! from callers are arbitrary strings; anything the store would reject is
//! mapped to a deterministic UUIDv5 with the original kept in the payload.

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{QueryOptions, VectorStoreCompat};
use crate::error::{CoordResult, CoordinatorError};
use crate::logging::log_debug;
use crate::vector::{VectorPoint, VectorQueryResult};

/// Manifest kind served by this adapter.
pub const KIND: &str = "qdrant-rest";

/// Payload key holding the caller's original id when it had to be mapped.
const ORIGINAL_ID_KEY: &str = "_originalId";

/// Qdrant REST adapter. One instance per manager; connection state lives
/// between `connect` and `close`.
#[derive(Debug, Default)]
pub struct QdrantRestCompat {
    client: Option<reqwest::Client>,
    base_url: String,
    api_key: Option<String>,
}

impl QdrantRestCompat {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> CoordResult<&reqwest::Client> {
        self.client
            .as_ref()
            .ok_or_else(|| CoordinatorError::Internal(anyhow::anyhow!("vector store not connected")))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> CoordResult<reqwest::RequestBuilder> {
        let mut builder = self
            .client()?
            .request(method, format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.header("api-key", key);
        }
        Ok(builder)
    }

    async fn expect_ok(response: reqwest::Response, action: &str) -> CoordResult<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoordinatorError::Internal(anyhow::anyhow!(
                "vector store {action} returned {status}: {body}"
            )));
        }
        response
            .json()
            .await
            .map_err(|err| CoordinatorError::Internal(anyhow::anyhow!("unparseable {action} response: {err}")))
    }

    /// Map an arbitrary caller id onto an id Qdrant accepts.
    fn encode_id(id: &str) -> Value {
        if id.parse::<u64>().is_ok() {
            return json!(id.parse::<u64>().expect("checked above"));
        }
        if Uuid::parse_str(id).is_ok() {
            return json!(id);
        }
        json!(Uuid::new_v5(&Uuid::NAMESPACE_OID, id.as_bytes()).to_string())
    }

    /// Recover the caller id from a scored point, preferring the stashed
    /// original.
    fn decode_id(point: &Value) -> String {
        if let Some(original) = point
            .get("payload")
            .and_then(|p| p.get(ORIGINAL_ID_KEY))
            .and_then(Value::as_str)
        {
            return original.to_string();
        }
        match point.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    }
}

#[async_trait]
impl VectorStoreCompat for QdrantRestCompat {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn connect(&mut self, config: &Value) -> CoordResult<()> {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| CoordinatorError::manifest("qdrant-rest config requires a url"))?;
        self.base_url = url.trim_end_matches('/').to_string();
        self.api_key = config
            .get("apiKey")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.client = Some(reqwest::Client::new());
        log_debug!(url = %self.base_url, "Connected vector store");
        Ok(())
    }

    async fn close(&mut self) -> CoordResult<()> {
        self.client = None;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        options: &QueryOptions,
    ) -> CoordResult<Vec<VectorQueryResult>> {
        let mut body = json!({
            "vector": vector,
            "limit": top_k,
            "with_payload": true,
            "with_vector": options.with_vector,
        });
        if let Some(filter) = &options.filter {
            body["filter"] = filter.clone();
        }
        if let Some(threshold) = options.score_threshold {
            body["score_threshold"] = json!(threshold);
        }

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/search"),
            )?
            .json(&body)
            .send()
            .await
            .map_err(|err| CoordinatorError::Internal(anyhow::anyhow!("vector query failed: {err}")))?;
        let parsed = Self::expect_ok(response, "query").await?;

        let points = parsed
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let results = points
            .iter()
            .map(|point| {
                let score = point.get("score").and_then(Value::as_f64).unwrap_or(0.0);
                VectorQueryResult {
                    id: Self::decode_id(point),
                    score: score.clamp(0.0, 1.0),
                    payload: point.get("payload").filter(|p| !p.is_null()).cloned(),
                    vector: point.get("vector").and_then(Value::as_array).map(|v| {
                        v.iter()
                            .filter_map(Value::as_f64)
                            .map(|f| f as f32)
                            .collect()
                    }),
                }
            })
            .collect();
        Ok(results)
    }

    async fn upsert(&self, collection: &str, points: &[VectorPoint]) -> CoordResult<()> {
        let wire_points: Vec<Value> = points
            .iter()
            .map(|point| {
                let mut payload = match &point.payload {
                    Some(Value::Object(map)) => map.clone(),
                    _ => serde_json::Map::new(),
                };
                let encoded = Self::encode_id(&point.id);
                if encoded != json!(point.id) {
                    payload.insert(ORIGINAL_ID_KEY.to_string(), json!(point.id));
                }
                json!({
                    "id": encoded,
                    "vector": point.vector,
                    "payload": payload,
                })
            })
            .collect();

        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/collections/{collection}/points?wait=true"),
            )?
            .json(&json!({ "points": wire_points }))
            .send()
            .await
            .map_err(|err| CoordinatorError::Internal(anyhow::anyhow!("vector upsert failed: {err}")))?;
        Self::expect_ok(response, "upsert").await.map(|_| ())
    }

    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> CoordResult<()> {
        let encoded: Vec<Value> = ids.iter().map(|id| Self::encode_id(id)).collect();
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/delete?wait=true"),
            )?
            .json(&json!({ "points": encoded }))
            .send()
            .await
            .map_err(|err| CoordinatorError::Internal(anyhow::anyhow!("vector delete failed: {err}")))?;
        Self::expect_ok(response, "delete").await.map(|_| ())
    }

    async fn collection_exists(&self, name: &str) -> CoordResult<bool> {
        let response = self
            .request(reqwest::Method::GET, &format!("/collections/{name}"))?
            .send()
            .await
            .map_err(|err| {
                CoordinatorError::Internal(anyhow::anyhow!("collection lookup failed: {err}"))
            })?;
        Ok(response.status().is_success())
    }

    async fn create_collection(
        &self,
        name: &str,
        dimensions: usize,
        options: &Value,
    ) -> CoordResult<()> {
        let mut body = json!({
            "vectors": { "size": dimensions, "distance": "Cosine" },
        });
        if let (Some(base), Some(extra)) = (body.as_object_mut(), options.as_object()) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }
        let response = self
            .request(reqwest::Method::PUT, &format!("/collections/{name}"))?
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                CoordinatorError::Internal(anyhow::anyhow!("collection create failed: {err}"))
            })?;
        Self::expect_ok(response, "create collection").await.map(|_| ())
    }

    async fn list_collections(&self) -> CoordResult<Vec<String>> {
        let response = self
            .request(reqwest::Method::GET, "/collections")?
            .send()
            .await
            .map_err(|err| {
                CoordinatorError::Internal(anyhow::anyhow!("collection list failed: {err}"))
            })?;
        let parsed = Self::expect_ok(response, "list collections").await?;
        Ok(parsed
            .pointer("/result/collections")
            .and_then(Value::as_array)
            .map(|collections| {
                collections
                    .iter()
                    .filter_map(|c| c.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_collection(&self, name: &str) -> CoordResult<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/collections/{name}"))?
            .send()
            .await
            .map_err(|err| {
                CoordinatorError::Internal(anyhow::anyhow!("collection delete failed: {err}"))
            })?;
        Self::expect_ok(response, "delete collection").await.map(|_| ())
    }
}
