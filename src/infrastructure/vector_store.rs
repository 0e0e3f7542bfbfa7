//! In-process vector store persisted as a JSON file.

use crate::infrastructure::settings::Settings;
use crate::infrastructure::traits::VectorStore;
use async_trait::async_trait;
use di::{Ref, inject, injectable};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tokio::sync::RwLock;

pub const VECTOR_STORE_FILE: &str = "vector_store.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("vector store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("vector store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An indexable unit of text, tagged with the document it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextNode {
    pub node_id: String,
    pub ref_doc_id: String,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedNode {
    pub node: TextNode,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: TextNode,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExactMatchFilter {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilters {
    pub filters: Vec<ExactMatchFilter>,
}

impl MetadataFilters {
    pub fn exact(key: impl Into<String>, value: impl Into<String>) -> Self {
        MetadataFilters {
            filters: vec![ExactMatchFilter {
                key: key.into(),
                value: value.into(),
            }],
        }
    }

    pub fn matches(&self, metadata: &BTreeMap<String, String>) -> bool {
        self.filters
            .iter()
            .all(|filter| metadata.get(&filter.key) == Some(&filter.value))
    }
}

#[derive(Debug, Clone)]
pub struct VectorStoreQuery {
    pub embedding: Vec<f32>,
    pub top_k: usize,
    pub filters: MetadataFilters,
}

#[derive(Default, Serialize, Deserialize)]
struct StoreData {
    nodes: BTreeMap<String, EmbeddedNode>,
}

pub struct FileVectorStore {
    data: RwLock<StoreData>,
}

#[injectable(VectorStore)]
impl FileVectorStore {
    #[inject]
    pub fn create(settings: Ref<Settings>) -> FileVectorStore {
        match FileVectorStore::load(&settings.persist_dir) {
            Ok(store) => store,
            Err(e) => {
                warn!("could not load vector store, starting empty: {e}");
                FileVectorStore::new()
            }
        }
    }
}

impl FileVectorStore {
    pub fn new() -> Self {
        FileVectorStore {
            data: RwLock::new(StoreData::default()),
        }
    }

    /// Loads a persisted store, or an empty one if nothing was persisted yet.
    pub fn load(persist_dir: &Path) -> Result<Self, StoreError> {
        let path = persist_dir.join(VECTOR_STORE_FILE);
        if !path.is_file() {
            return Ok(FileVectorStore::new());
        }

        let data: StoreData = serde_json::from_slice(&std::fs::read(&path)?)?;
        info!(
            "loaded {} nodes from {}",
            data.nodes.len(),
            path.display()
        );

        Ok(FileVectorStore {
            data: RwLock::new(data),
        })
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.nodes.len()
    }
}

impl Default for FileVectorStore {
    fn default() -> Self {
        FileVectorStore::new()
    }
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorStore for FileVectorStore {
    async fn add(&self, nodes: Vec<EmbeddedNode>) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        for node in nodes {
            data.nodes.insert(node.node.node_id.clone(), node);
        }
        Ok(())
    }

    async fn delete_document(&self, ref_doc_id: &str) -> Result<(), StoreError> {
        self.data
            .write()
            .await
            .nodes
            .retain(|_, node| node.node.ref_doc_id != ref_doc_id);
        Ok(())
    }

    async fn query(&self, query: &VectorStoreQuery) -> Result<Vec<ScoredNode>, StoreError> {
        let data = self.data.read().await;

        let mut scored: Vec<ScoredNode> = data
            .nodes
            .values()
            .filter(|node| query.filters.matches(&node.node.metadata))
            .map(|node| ScoredNode {
                node: node.node.clone(),
                score: cosine_similarity(&query.embedding, &node.embedding),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(query.top_k);
        Ok(scored)
    }

    async fn contains_all(&self, node_ids: &[String]) -> bool {
        let data = self.data.read().await;
        node_ids.iter().all(|node_id| data.nodes.contains_key(node_id))
    }

    async fn persist(&self, persist_dir: &Path) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&*self.data.read().await)?;
        tokio::fs::create_dir_all(persist_dir).await?;
        tokio::fs::write(persist_dir.join(VECTOR_STORE_FILE), bytes).await?;
        Ok(())
    }
}
