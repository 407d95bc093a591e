//! Search API contract (no transport is implemented here,
//! only the stable Rust surface a future IPC front-end would wrap).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchKind {
    /// Exact path existence check.
    Path,
    /// Substring/fuzzy/pinyin free-text search over file names.
    FreeText,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub kind: SearchKind,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub full_path: String,
    pub bucket: String,
    pub is_dir: bool,
    pub score: f32,
}

/// The daemon's search surface. A D-Bus (or other IPC) front-end wraps this
/// trait; none is implemented here (that's scoped as an
/// external collaborator).
#[async_trait]
pub trait SearchService: Send + Sync {
    async fn search(&self, request: SearchRequest) -> Result<Vec<SearchResult>>;
}

pub struct IndexSearchService {
    index: crate::index::IndexHandle,
}

impl IndexSearchService {
    pub fn new(index: crate::index::IndexHandle) -> Self {
        Self { index }
    }
}

#[async_trait]
impl SearchService for IndexSearchService {
    async fn search(&self, request: SearchRequest) -> Result<Vec<SearchResult>> {
        match request.kind {
            SearchKind::Path => {
                let exists = self.index.exists(&request.query)?;
                if exists {
                    Ok(vec![SearchResult { full_path: request.query, bucket: String::new(), is_dir: false, score: 1.0 }])
                } else {
                    Ok(Vec::new())
                }
            }
            SearchKind::FreeText => {
                let hits = self.index.search(&request.query, request.limit)?;
                Ok(hits
                    .into_iter()
                    .map(|(doc, score)| SearchResult { full_path: doc.full_path, bucket: doc.bucket, is_dir: doc.is_dir, score })
                    .collect())
            }
        }
    }
}
