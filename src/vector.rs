//! Vector-store manager: embedding-priority resolution and store
//! operations.
//!
//! A manager owns its own vector-store compat instances (constructed fresh
//! from the registry, never shared) and connects them lazily. Embedding
//! providers are resolved through an ordered priority with the same
//! advance-on-failure policy the LLM coordinator applies to its priority
//! list.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::compat::{Embeddings, QueryOptions, VectorStoreCompat};
use crate::error::{CoordResult, CoordinatorError};
use crate::logging::{log_debug, log_warn};
use crate::registry::{PluginRegistry, VectorStoreManifest};
use crate::spec::EmbeddingPriorityEntry;

/// A point to upsert. Ids are arbitrary caller strings; compats map them to
/// whatever id format the backing store accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// One scored query hit. Scores are in [0, 1] under the collection's
/// metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorQueryResult {
    pub id: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

struct ConnectedStore {
    manifest: Arc<VectorStoreManifest>,
    compat: Box<dyn VectorStoreCompat>,
}

/// Per-coordinator vector-store access.
pub struct VectorStoreManager {
    registry: Arc<PluginRegistry>,
    stores: Mutex<HashMap<String, ConnectedStore>>,
}

impl VectorStoreManager {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// The manifest for a store id (connects nothing).
    pub fn manifest(&self, store_id: &str) -> CoordResult<Arc<VectorStoreManifest>> {
        self.registry.get_vector_store(store_id)
    }

    /// Get-or-connect the store inside the held guard.
    async fn connected<'a>(
        &self,
        stores: &'a mut HashMap<String, ConnectedStore>,
        store_id: &str,
    ) -> CoordResult<&'a ConnectedStore> {
        if !stores.contains_key(store_id) {
            let manifest = self.registry.get_vector_store(store_id)?;
            let mut compat = self.registry.get_vector_store_compat(&manifest.kind)?;
            compat.connect(&manifest.config).await?;
            stores.insert(store_id.to_string(), ConnectedStore { manifest, compat });
        }
        Ok(stores.get(store_id).expect("inserted above"))
    }

    /// Resolve the collection for an operation: explicit argument, then the
    /// store's default.
    fn resolve_collection(
        manifest: &VectorStoreManifest,
        explicit: Option<&str>,
    ) -> CoordResult<String> {
        explicit
            .map(str::to_string)
            .or_else(|| manifest.default_collection.clone())
            .ok_or_else(|| {
                CoordinatorError::validation(format!(
                    "no collection given and store {} declares no default",
                    manifest.id
                ))
            })
    }

    pub async fn query(
        &self,
        store_id: &str,
        collection: Option<&str>,
        vector: Vec<f32>,
        top_k: usize,
        options: QueryOptions,
    ) -> CoordResult<Vec<VectorQueryResult>> {
        let mut stores = self.stores.lock().await;
        let store = self.connected(&mut stores, store_id).await?;
        let collection = Self::resolve_collection(&store.manifest, collection)?;
        store.compat.query(&collection, &vector, top_k, &options).await
    }

    pub async fn upsert(
        &self,
        store_id: &str,
        collection: Option<&str>,
        points: Vec<VectorPoint>,
    ) -> CoordResult<usize> {
        let count = points.len();
        let mut stores = self.stores.lock().await;
        let store = self.connected(&mut stores, store_id).await?;
        let collection = Self::resolve_collection(&store.manifest, collection)?;
        store.compat.upsert(&collection, &points).await?;
        Ok(count)
    }

    pub async fn delete(
        &self,
        store_id: &str,
        collection: Option<&str>,
        ids: Vec<String>,
    ) -> CoordResult<usize> {
        let count = ids.len();
        let mut stores = self.stores.lock().await;
        let store = self.connected(&mut stores, store_id).await?;
        let collection = Self::resolve_collection(&store.manifest, collection)?;
        store.compat.delete_by_ids(&collection, &ids).await?;
        Ok(count)
    }

    pub async fn collection_exists(&self, store_id: &str, name: String) -> CoordResult<bool> {
        let mut stores = self.stores.lock().await;
        let store = self.connected(&mut stores, store_id).await?;
        store.compat.collection_exists(&name).await
    }

    pub async fn create_collection(
        &self,
        store_id: &str,
        name: String,
        dimensions: usize,
        options: Value,
    ) -> CoordResult<()> {
        let mut stores = self.stores.lock().await;
        let store = self.connected(&mut stores, store_id).await?;
        store.compat.create_collection(&name, dimensions, &options).await
    }

    pub async fn list_collections(&self, store_id: &str) -> CoordResult<Vec<String>> {
        let mut stores = self.stores.lock().await;
        let store = self.connected(&mut stores, store_id).await?;
        store.compat.list_collections().await
    }

    pub async fn delete_collection(&self, store_id: &str, name: String) -> CoordResult<()> {
        let mut stores = self.stores.lock().await;
        let store = self.connected(&mut stores, store_id).await?;
        store.compat.delete_collection(&name).await
    }

    // ------------------------------------------------------------------
    // Embeddings
    // ------------------------------------------------------------------

    /// Resolve the effective embedding priority.
    ///
    /// Preference: an explicit list on the config, then the shared default
    /// of every named store (disagreement is a distinguished error), else a
    /// distinguished "not configured" error.
    pub fn resolve_embedding_priority(
        &self,
        explicit: Option<&[EmbeddingPriorityEntry]>,
        store_ids: &[String],
    ) -> CoordResult<Vec<EmbeddingPriorityEntry>> {
        if let Some(explicit) = explicit {
            if !explicit.is_empty() {
                return Ok(explicit.to_vec());
            }
        }

        let mut shared: Option<Vec<EmbeddingPriorityEntry>> = None;
        for store_id in store_ids {
            let manifest = self.registry.get_vector_store(store_id)?;
            let Some(defaults) = &manifest.embedding_priority else {
                continue;
            };
            match &shared {
                Some(existing) if existing != defaults => {
                    return Err(CoordinatorError::validation(
                        "multiple vector stores specify different default embedding priorities",
                    ));
                }
                Some(_) => {}
                None => shared = Some(defaults.clone()),
            }
        }

        shared.ok_or_else(|| CoordinatorError::validation("no embedding priority configured"))
    }

    /// Embed `inputs`, walking the priority: rate-limit errors advance,
    /// other provider errors advance and are recorded, and exhausting the
    /// list raises the last error.
    pub async fn embed(
        &self,
        priority: &[EmbeddingPriorityEntry],
        inputs: &[String],
    ) -> CoordResult<Embeddings> {
        let mut last_error: Option<CoordinatorError> = None;
        for entry in priority {
            let manifest = match self.registry.get_embedding_provider(&entry.provider) {
                Ok(manifest) => manifest,
                Err(err) => {
                    last_error = Some(err);
                    continue;
                }
            };
            let compat = match self.registry.get_embedding_compat(&manifest.kind) {
                Ok(compat) => compat,
                Err(err) => {
                    last_error = Some(err);
                    continue;
                }
            };
            if let Err(err) = compat.validate(&manifest) {
                last_error = Some(err);
                continue;
            }

            match compat.embed(inputs, &manifest, entry.model.as_deref()).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(err) if err.is_rate_limit() => {
                    log_debug!(provider = %entry.provider, "Embedding provider rate limited, advancing");
                    last_error = Some(err);
                }
                Err(err) => {
                    log_warn!(provider = %entry.provider, error = %err, "Embedding provider failed, advancing");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            CoordinatorError::validation("no embedding priority configured")
        }))
    }

    /// Embed one query string and return its vector.
    pub async fn embed_query(
        &self,
        priority: &[EmbeddingPriorityEntry],
        query: &str,
    ) -> CoordResult<Vec<f32>> {
        let embeddings = self.embed(priority, &[query.to_string()]).await?;
        embeddings.vectors.into_iter().next().ok_or_else(|| {
            CoordinatorError::Internal(anyhow::anyhow!("embedding provider returned no vectors"))
        })
    }

    /// Close every connected store; failures are logged and swallowed.
    pub async fn close(&self) {
        let mut stores = self.stores.lock().await;
        for (id, mut store) in stores.drain() {
            if let Err(err) = store.compat.close().await {
                log_warn!(store = %id, error = %err, "Failed to close vector store");
            }
        }
    }
}
