//! Per-document vector indices and the builder that loads or rebuilds them.

use super::loader::{DocumentLoader, split_into_nodes};
use super::storage::{IndexStruct, StorageContext, StorageContextCache};
use super::{EngineError, ServiceContext};
use crate::infrastructure::entities::SubProcessSource;
use crate::infrastructure::settings::Settings;
use crate::infrastructure::traits::VectorStore;
use crate::infrastructure::vector_store::{EmbeddedNode, MetadataFilters, ScoredNode, VectorStoreQuery};
use di::{Ref, inject, injectable};
use log::{debug, error, info};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Texts sent to the embedding model per request.
const EMBED_BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("no index with id {0} in storage")]
    MissingIndex(String),
}

pub type DocIndexMap = BTreeMap<String, Arc<VectorIndex>>;

/// A vector index over the nodes of one document.
pub struct VectorIndex {
    index_struct: IndexStruct,
    storage: Arc<StorageContext>,
    service_context: ServiceContext,
}

impl VectorIndex {
    pub fn index_id(&self) -> &str {
        &self.index_struct.index_id
    }

    pub fn node_ids(&self) -> &[String] {
        &self.index_struct.node_ids
    }

    pub fn service_context(&self) -> &ServiceContext {
        &self.service_context
    }

    /// Returns the `top_k` nodes most similar to `query` that pass `filters`.
    pub async fn retrieve(
        &self,
        query: &str,
        filters: &MetadataFilters,
        top_k: usize,
    ) -> Result<Vec<ScoredNode>, EngineError> {
        let mut embeddings = self
            .service_context
            .embedder
            .embed(&[query.to_owned()])
            .await?;
        let embedding = embeddings.pop().unwrap_or_default();

        let nodes = self
            .storage
            .vector_store()
            .query(&VectorStoreQuery {
                embedding,
                top_k,
                filters: filters.clone(),
            })
            .await?;
        Ok(nodes)
    }
}

/// Looks up the index structure of every id, failing on the first one missing.
pub async fn load_indices_from_storage(
    storage: &Arc<StorageContext>,
    index_ids: &[String],
    service_context: &ServiceContext,
) -> Result<Vec<VectorIndex>, IndexError> {
    let snapshot = storage.index_structs(index_ids).await;
    indices_from_snapshot(storage, index_ids, snapshot, service_context)
}

fn indices_from_snapshot(
    storage: &Arc<StorageContext>,
    index_ids: &[String],
    snapshot: Vec<Option<IndexStruct>>,
    service_context: &ServiceContext,
) -> Result<Vec<VectorIndex>, IndexError> {
    index_ids
        .iter()
        .zip(snapshot)
        .map(|(index_id, index_struct)| {
            let index_struct =
                index_struct.ok_or_else(|| IndexError::MissingIndex(index_id.clone()))?;
            Ok(VectorIndex {
                index_struct,
                storage: storage.clone(),
                service_context: service_context.clone(),
            })
        })
        .collect()
}

/// Builds the document id to index map for a conversation, loading persisted
/// indices and rebuilding when any of them is missing.
pub struct IndexBuilder {
    loader: DocumentLoader,
    persist_dir: PathBuf,
    vector_store: Arc<dyn VectorStore>,
    cache: Arc<StorageContextCache>,
    build_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

#[injectable]
impl IndexBuilder {
    #[inject]
    pub fn create(
        settings: Ref<Settings>,
        vector_store: Ref<dyn VectorStore>,
        cache: Ref<StorageContextCache>,
    ) -> IndexBuilder {
        IndexBuilder::new(
            settings.upload_dir.clone(),
            settings.persist_dir.clone(),
            vector_store,
            cache,
        )
    }
}

impl IndexBuilder {
    pub fn new(
        upload_dir: impl Into<PathBuf>,
        persist_dir: impl Into<PathBuf>,
        vector_store: Arc<dyn VectorStore>,
        cache: Arc<StorageContextCache>,
    ) -> Self {
        IndexBuilder {
            loader: DocumentLoader::new(upload_dir),
            persist_dir: persist_dir.into(),
            vector_store,
            cache,
            build_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn persist_dir(&self) -> &Path {
        &self.persist_dir
    }

    pub async fn build_doc_id_to_index_map(
        &self,
        service_context: &ServiceContext,
        documents: &[String],
    ) -> Result<DocIndexMap, EngineError> {
        let storage = self
            .cache
            .get_or_create(&self.persist_dir, self.vector_store.clone())
            .await?;

        let snapshot = storage.index_structs(documents).await;
        match indices_from_snapshot(&storage, documents, snapshot.clone(), service_context) {
            Ok(indices) => {
                debug!("Loaded indices from storage.");
                Ok(documents
                    .iter()
                    .cloned()
                    .zip(indices.into_iter().map(Arc::new))
                    .collect())
            }
            Err(IndexError::MissingIndex(index_id)) => {
                error!("Failed to load index {index_id} from storage; creating new indices.");
                let seen = documents.iter().cloned().zip(snapshot).collect();
                self.rebuild(&storage, service_context, documents, seen)
                    .await
            }
        }
    }

    async fn rebuild(
        &self,
        storage: &Arc<StorageContext>,
        service_context: &ServiceContext,
        documents: &[String],
        seen: HashMap<String, Option<IndexStruct>>,
    ) -> Result<DocIndexMap, EngineError> {
        let mut doc_ids: Vec<&String> = documents.iter().collect();
        doc_ids.sort();
        doc_ids.dedup();

        let mut indices = DocIndexMap::new();
        for doc_id in doc_ids {
            let lock = self.build_lock(doc_id);
            let built = {
                let _guard = lock.lock().await;

                // another request may have built it while we waited
                let seen_before = seen.get(doc_id).and_then(Option::as_ref);
                match storage.index_struct(doc_id).await {
                    Some(existing) if seen_before != Some(&existing) => Ok(existing),
                    _ => self.build_index(storage, service_context, doc_id).await,
                }
            };
            self.release_build_lock(doc_id, lock);
            let index_struct = built?;

            indices.insert(
                doc_id.clone(),
                Arc::new(VectorIndex {
                    index_struct,
                    storage: storage.clone(),
                    service_context: service_context.clone(),
                }),
            );
        }

        Ok(indices)
    }

    fn build_lock(&self, doc_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .build_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(doc_id.to_owned()).or_default().clone()
    }

    /// Drops the lock entry once no other build holds or waits on it.
    fn release_build_lock(&self, doc_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .build_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // one reference in the map, one in `lock`
        if Arc::strong_count(&lock) == 2 {
            locks.remove(doc_id);
        }
    }

    /// Loads, chunks and embeds one document, replacing whatever the storage
    /// held for it before, then persists the storage.
    async fn build_index(
        &self,
        storage: &StorageContext,
        service_context: &ServiceContext,
        doc_id: &str,
    ) -> Result<IndexStruct, EngineError> {
        info!("Building index for {doc_id}");
        let documents = self.loader.load(doc_id).await?;
        let nodes = split_into_nodes(
            &documents,
            service_context.chunk_size,
            service_context.chunk_overlap,
        );
        service_context.events.finished(
            SubProcessSource::NodeParsing,
            json!({ "document": doc_id, "nodes": nodes.len() }),
        );

        let mut embeddings = Vec::with_capacity(nodes.len());
        for batch in nodes.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|node| node.text.clone()).collect();
            embeddings.extend(service_context.embedder.embed(&texts).await?);
        }
        service_context.events.finished(
            SubProcessSource::Embedding,
            json!({ "document": doc_id, "embeddings": embeddings.len() }),
        );

        let vector_store = storage.vector_store();
        vector_store.delete_document(doc_id).await?;
        storage.remove_document_nodes(doc_id).await;

        storage.add_nodes(&nodes).await;
        let index_struct = IndexStruct {
            index_id: doc_id.to_owned(),
            node_ids: nodes.iter().map(|node| node.node_id.clone()).collect(),
        };
        vector_store
            .add(
                nodes
                    .into_iter()
                    .zip(embeddings)
                    .map(|(node, embedding)| EmbeddedNode { node, embedding })
                    .collect(),
            )
            .await?;
        storage.set_index_struct(index_struct.clone()).await;

        storage.persist(&self.persist_dir).await?;
        Ok(index_struct)
    }
}
