//! Persisted index storage and its process-wide cache.
//!
//! A [`StorageContext`] bundles the document store (every indexed text node),
//! the index store (which nodes make up which per-document index) and the
//! vector store holding the embeddings. The first two are persisted as JSON
//! files under the persist directory; the vector store persists itself.

use crate::infrastructure::traits::VectorStore;
use crate::infrastructure::vector_store::{StoreError, TextNode};
use di::{inject, injectable};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Duration, Instant};

pub const DOCSTORE_FILE: &str = "docstore.json";
pub const INDEX_STORE_FILE: &str = "index_store.json";

/// How long a loaded storage context is reused.
pub const STORAGE_CONTEXT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no persisted storage found at {0}")]
    NotFound(PathBuf),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    VectorStore(#[from] StoreError),
}

/// The nodes that make up one per-document vector index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStruct {
    pub index_id: String,
    pub node_ids: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DocStore {
    nodes: BTreeMap<String, TextNode>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexStore {
    indices: BTreeMap<String, IndexStruct>,
}

pub struct StorageContext {
    docstore: RwLock<DocStore>,
    index_store: RwLock<IndexStore>,
    vector_store: Arc<dyn VectorStore>,
    persist_lock: Mutex<()>,
}

impl StorageContext {
    /// An empty context backed by the given vector store.
    pub fn fresh(vector_store: Arc<dyn VectorStore>) -> Self {
        StorageContext {
            docstore: RwLock::new(DocStore::default()),
            index_store: RwLock::new(IndexStore::default()),
            vector_store,
            persist_lock: Mutex::new(()),
        }
    }

    /// Loads a persisted context, failing with [`StorageError::NotFound`] when
    /// nothing was persisted at `persist_dir` yet. Indices with nodes absent
    /// from `vector_store` are left out.
    pub async fn from_persist_dir(
        persist_dir: &Path,
        vector_store: Arc<dyn VectorStore>,
    ) -> Result<Self, StorageError> {
        let docstore: DocStore = read_json(persist_dir, DOCSTORE_FILE).await?;
        let mut index_store: IndexStore = read_json(persist_dir, INDEX_STORE_FILE).await?;

        // an index whose embeddings were lost must be rebuilt, not served empty
        let mut stale = Vec::new();
        for (index_id, index_struct) in &index_store.indices {
            if !vector_store.contains_all(&index_struct.node_ids).await {
                stale.push(index_id.clone());
            }
        }
        for index_id in stale {
            warn!("vector store is missing nodes of index {index_id}; dropping it");
            index_store.indices.remove(&index_id);
        }

        Ok(StorageContext {
            docstore: RwLock::new(docstore),
            index_store: RwLock::new(index_store),
            vector_store,
            persist_lock: Mutex::new(()),
        })
    }

    pub async fn persist(&self, persist_dir: &Path) -> Result<(), StorageError> {
        let _guard = self.persist_lock.lock().await;
        tokio::fs::create_dir_all(persist_dir).await?;

        let docstore = serde_json::to_vec(&*self.docstore.read().await)?;
        tokio::fs::write(persist_dir.join(DOCSTORE_FILE), docstore).await?;

        let index_store = serde_json::to_vec(&*self.index_store.read().await)?;
        tokio::fs::write(persist_dir.join(INDEX_STORE_FILE), index_store).await?;

        self.vector_store.persist(persist_dir).await?;
        Ok(())
    }

    pub fn vector_store(&self) -> &Arc<dyn VectorStore> {
        &self.vector_store
    }

    pub async fn add_nodes(&self, nodes: &[TextNode]) {
        let mut docstore = self.docstore.write().await;
        for node in nodes {
            docstore.nodes.insert(node.node_id.clone(), node.clone());
        }
    }

    /// Removes every node of the given document from the document store.
    pub async fn remove_document_nodes(&self, ref_doc_id: &str) {
        self.docstore
            .write()
            .await
            .nodes
            .retain(|_, node| node.ref_doc_id != ref_doc_id);
    }

    pub async fn get_node(&self, node_id: &str) -> Option<TextNode> {
        self.docstore.read().await.nodes.get(node_id).cloned()
    }

    pub async fn index_struct(&self, index_id: &str) -> Option<IndexStruct> {
        self.index_store.read().await.indices.get(index_id).cloned()
    }

    /// Index structures of the given ids, read under one lock.
    pub async fn index_structs(&self, index_ids: &[String]) -> Vec<Option<IndexStruct>> {
        let index_store = self.index_store.read().await;
        index_ids
            .iter()
            .map(|index_id| index_store.indices.get(index_id).cloned())
            .collect()
    }

    /// Stores the index structure, replacing any previous one with the same id.
    pub async fn set_index_struct(&self, index_struct: IndexStruct) {
        self.index_store
            .write()
            .await
            .indices
            .insert(index_struct.index_id.clone(), index_struct);
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    persist_dir: &Path,
    file_name: &str,
) -> Result<T, StorageError> {
    let path = persist_dir.join(file_name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(StorageError::NotFound(persist_dir.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

struct CachedContext {
    context: Arc<StorageContext>,
    expires_at: Instant,
}

/// Single-slot, time-bounded cache of the storage context.
///
/// Every lookup within the TTL returns the same instance, whatever arguments
/// it is called with.
pub struct StorageContextCache {
    ttl: Duration,
    slot: Mutex<Option<CachedContext>>,
}

#[injectable]
impl StorageContextCache {
    #[inject]
    pub fn create() -> StorageContextCache {
        StorageContextCache::new(STORAGE_CONTEXT_TTL)
    }
}

impl StorageContextCache {
    pub fn new(ttl: Duration) -> Self {
        StorageContextCache {
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// Returns the cached context, loading it from `persist_dir` on a miss or
    /// after expiry. A missing persisted context is reported, not cached.
    pub async fn get(
        &self,
        persist_dir: &Path,
        vector_store: Arc<dyn VectorStore>,
    ) -> Result<Arc<StorageContext>, StorageError> {
        let mut slot = self.slot.lock().await;
        if let Some(context) = self.current(&slot) {
            return Ok(context);
        }

        info!("Creating new storage context.");
        let context = StorageContext::from_persist_dir(persist_dir, vector_store).await?;
        Ok(self.store(&mut slot, context))
    }

    /// Like [`StorageContextCache::get`], but creates and persists an empty
    /// context when none exists yet. Runs under the cache lock, so concurrent
    /// callers end up sharing one context.
    pub async fn get_or_create(
        &self,
        persist_dir: &Path,
        vector_store: Arc<dyn VectorStore>,
    ) -> Result<Arc<StorageContext>, StorageError> {
        let mut slot = self.slot.lock().await;
        if let Some(context) = self.current(&slot) {
            return Ok(context);
        }

        info!("Creating new storage context.");
        let context =
            match StorageContext::from_persist_dir(persist_dir, vector_store.clone()).await {
                Ok(context) => context,
                Err(StorageError::NotFound(_)) => {
                    info!("Could not find storage context. Creating new storage context.");
                    let context = StorageContext::fresh(vector_store);
                    context.persist(persist_dir).await?;
                    context
                }
                Err(e) => return Err(e),
            };

        Ok(self.store(&mut slot, context))
    }

    fn current(&self, slot: &Option<CachedContext>) -> Option<Arc<StorageContext>> {
        slot.as_ref()
            .filter(|cached| Instant::now() < cached.expires_at)
            .map(|cached| cached.context.clone())
    }

    fn store(&self, slot: &mut Option<CachedContext>, context: StorageContext) -> Arc<StorageContext> {
        let context = Arc::new(context);
        *slot = Some(CachedContext {
            context: context.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        context
    }
}
