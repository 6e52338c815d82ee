//! Knowledge-base retrieval tool
//!
//! The engine never touches embeddings or the vector index directly; it only
//! sees `search_knowledge_base` like any other tool.

use super::{ToolArguments, ToolHandler};
use crate::error::EngineError;
use crate::models::{ParamType, ToolSchema};
use crate::Result;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const TOOL_NAME: &str = "search_knowledge_base";
const DEFAULT_TOP_K: usize = 3;
const MAX_TOP_K: usize = 10;

#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn encode(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub id: String,
    pub score: f32,
    pub text: String,
    pub source: Option<String>,
}

#[async_trait::async_trait]
pub trait VectorIndex: Send + Sync {
    /// Best matches first.
    async fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<Match>>;
}

pub struct KnowledgeBaseTool {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl KnowledgeBaseTool {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embedder, index }
    }

    pub fn schema() -> ToolSchema {
        ToolSchema::new(
            TOOL_NAME,
            "Searches the curated financial knowledge base for explanations of concepts, \
             strategies and terminology.",
        )
        .param("query", ParamType::String, true, "What to look up.")
        .param("top_k", ParamType::Integer, false, "Number of passages to return. Defaults to 3.")
    }
}

#[async_trait::async_trait]
impl ToolHandler for KnowledgeBaseTool {
    async fn call(&self, args: ToolArguments) -> Result<Value> {
        let query = args.str("query").unwrap_or_default().trim();
        if query.is_empty() {
            return Err(EngineError::ToolExecution {
                tool: TOOL_NAME.to_string(),
                message: "the search query is empty".to_string(),
            });
        }

        let top_k = args
            .i64("top_k")
            .map(|k| k.clamp(1, MAX_TOP_K as i64) as usize)
            .unwrap_or(DEFAULT_TOP_K);

        let embedding = self.embedder.encode(query).await?;
        let matches = self.index.query(&embedding, top_k).await?;

        if matches.is_empty() {
            return Ok(json!({
                "query": query,
                "matches": [],
                "note": "No relevant passages were found in the knowledge base."
            }));
        }

        Ok(json!({ "query": query, "matches": matches }))
    }
}

struct IndexedDocument {
    id: String,
    text: String,
    source: Option<String>,
    embedding: Vec<f32>,
}

/// Brute-force cosine-similarity index held in memory.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    documents: RwLock<Vec<IndexedDocument>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(
        &self,
        id: impl Into<String>,
        text: impl Into<String>,
        source: Option<String>,
        embedding: Vec<f32>,
    ) {
        self.documents.write().await.push(IndexedDocument {
            id: id.into(),
            text: text.into(),
            source,
            embedding,
        });
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }
}

#[async_trait::async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<Match>> {
        let documents = self.documents.read().await;

        let mut scored: Vec<Match> = documents
            .iter()
            .map(|doc| Match {
                id: doc.id.clone(),
                score: cosine_similarity(embedding, &doc.embedding),
                text: doc.text.clone(),
                source: doc.source.clone(),
            })
            .filter(|m| m.score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// Returns a value between -1.0 and 1.0; 0.0 for mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
