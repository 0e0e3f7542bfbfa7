//! Reads uploaded documents from disk and splits them into text nodes.

use crate::infrastructure::vector_store::TextNode;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Metadata key every node carries with the identifier of its source document.
pub const DB_DOC_ID_KEY: &str = "db_document_id";

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("document {0} is not available")]
    DocumentUnavailable(String),

    #[error("failed to read document {document}: {source}")]
    Io {
        document: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse PDF {document}: {message}")]
    Pdf { document: String, message: String },

    #[error("unsupported file type: .{0}")]
    UnsupportedType(String),
}

/// Parsed content of one document, before chunking.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDocument {
    pub doc_id: String,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

/// Accepts a bare file name; anything that could escape the upload directory is refused.
pub fn is_valid_document_id(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
}

#[derive(Debug, Clone)]
pub struct DocumentLoader {
    upload_dir: PathBuf,
}

impl DocumentLoader {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        DocumentLoader {
            upload_dir: upload_dir.into(),
        }
    }

    pub fn path_for(&self, doc_id: &str) -> PathBuf {
        self.upload_dir.join(doc_id)
    }

    /// Reads and parses the uploaded file for `doc_id`.
    ///
    /// An id that is not a bare file name, or a path that is not a regular
    /// file, yields [`LoaderError::DocumentUnavailable`].
    pub async fn load(&self, doc_id: &str) -> Result<Vec<LoadedDocument>, LoaderError> {
        if !is_valid_document_id(doc_id) {
            warn!("refusing to load document id {doc_id:?}");
            return Err(LoaderError::DocumentUnavailable(doc_id.to_owned()));
        }

        let path = self.path_for(doc_id);
        let is_file = tokio::fs::metadata(&path)
            .await
            .map(|metadata| metadata.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(LoaderError::DocumentUnavailable(doc_id.to_owned()));
        }

        let text = read_text(doc_id, &path).await?;
        debug!("loaded {} characters from {}", text.len(), path.display());

        let mut metadata = BTreeMap::new();
        metadata.insert(DB_DOC_ID_KEY.to_owned(), doc_id.to_owned());
        metadata.insert("file_name".to_owned(), doc_id.to_owned());

        Ok(vec![LoadedDocument {
            doc_id: doc_id.to_owned(),
            text,
            metadata,
        }])
    }
}

async fn read_text(doc_id: &str, path: &Path) -> Result<String, LoaderError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let io_error = |source| LoaderError::Io {
        document: doc_id.to_owned(),
        source,
    };

    match extension.as_str() {
        "txt" | "md" | "markdown" => tokio::fs::read_to_string(path).await.map_err(io_error),
        "pdf" => {
            let bytes = tokio::fs::read(path).await.map_err(io_error)?;
            let document = doc_id.to_owned();
            tokio::task::spawn_blocking(move || {
                pdf_extract::extract_text_from_mem(&bytes).map_err(|e| LoaderError::Pdf {
                    document,
                    message: e.to_string(),
                })
            })
            .await
            .map_err(|e| LoaderError::Pdf {
                document: doc_id.to_owned(),
                message: e.to_string(),
            })?
        }
        other => Err(LoaderError::UnsupportedType(other.to_owned())),
    }
}

/// Splits text into chunks of `chunk_size` words, consecutive chunks sharing
/// `overlap` words.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() || chunk_size == 0 {
        return Vec::new();
    }
    if words.len() <= chunk_size {
        return vec![words.join(" ")];
    }

    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < words.len() {
        let end = (start + chunk_size).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += step;
    }

    chunks
}

/// Turns loaded documents into text nodes. Node ids are derived from the
/// document id and chunk position, so re-indexing a document reproduces them.
pub fn split_into_nodes(
    documents: &[LoadedDocument],
    chunk_size: usize,
    overlap: usize,
) -> Vec<TextNode> {
    let mut nodes = Vec::new();

    for (doc_index, document) in documents.iter().enumerate() {
        for (chunk_index, chunk) in chunk_text(&document.text, chunk_size, overlap)
            .into_iter()
            .enumerate()
        {
            nodes.push(TextNode {
                node_id: format!("{}#{}-{}", document.doc_id, doc_index, chunk_index),
                ref_doc_id: document.doc_id.clone(),
                text: chunk,
                metadata: document.metadata.clone(),
            });
        }
    }

    nodes
}
