pub mod answer;
pub mod chat;
pub mod config;
pub mod feedback;
pub mod health;
pub mod search;
pub mod secrets;

use retrieval_pipeline::{plan::parse_intent, SearchContext, SearchSpec};

use crate::{api_state::ApiState, error::ApiError};

/// Common request fields shared by search/answer/chat bodies.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RetrievalParams {
    #[serde(default)]
    pub query: String,
    pub corpus_id: Option<String>,
    #[serde(default)]
    pub corpus_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub include_vector: bool,
    #[serde(default = "default_true")]
    pub include_sparse: bool,
    #[serde(default = "default_true")]
    pub include_graph: bool,
    pub top_k: Option<usize>,
    pub intent: Option<String>,
}

pub(crate) fn default_true() -> bool {
    true
}

impl RetrievalParams {
    /// Validate the request shape and resolve the corpus set. Unknown
    /// corpora surface as NotFound before any leg is dispatched.
    pub async fn to_spec(&self, state: &ApiState) -> Result<SearchSpec, ApiError> {
        if self.query.trim().is_empty() {
            return Err(ApiError::ValidationError("query must not be empty".to_string()));
        }

        let mut corpus_ids = self.corpus_ids.clone();
        if let Some(corpus_id) = &self.corpus_id {
            if !corpus_ids.contains(corpus_id) {
                corpus_ids.insert(0, corpus_id.clone());
            }
        }
        if corpus_ids.is_empty() {
            return Err(ApiError::ValidationError(
                "corpus_id or corpus_ids is required".to_string(),
            ));
        }

        for corpus_id in &corpus_ids {
            common::storage::types::corpus::Corpus::require(&state.db, corpus_id)
                .await
                .map_err(ApiError::from)?;
        }

        let mut spec = SearchSpec::new(self.query.trim(), corpus_ids);
        spec.include_vector = self.include_vector;
        spec.include_sparse = self.include_sparse;
        spec.include_graph = self.include_graph;
        spec.top_k = self.top_k;
        spec.intent = self.intent.as_deref().and_then(parse_intent);
        Ok(spec)
    }

    pub fn primary_corpus(&self) -> String {
        self.corpus_id
            .clone()
            .or_else(|| self.corpus_ids.first().cloned())
            .unwrap_or_default()
    }
}

/// Build the per-request search context off the shared state.
pub fn search_context(state: &ApiState) -> SearchContext {
    SearchContext::new(state.db.clone(), state.embedder.clone())
        .with_reranker(state.reranker.clone())
        .with_leg_deadline(state.leg_deadline())
}

/// Resolve the scoped config for the request's primary corpus.
pub async fn resolve_config(
    state: &ApiState,
    corpus_id: &str,
) -> Result<std::sync::Arc<common::config::ScopedConfig>, ApiError> {
    let scope = if corpus_id.is_empty() { None } else { Some(corpus_id) };
    state.resolver.get(scope).await.map_err(ApiError::from)
}
