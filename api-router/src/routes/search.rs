use std::time::Instant;

use axum::{extract::State, Json};
use retrieval_pipeline::{debug::FusionDebug, run_search, ChunkMatch};
use serde::Serialize;

use crate::{
    api_state::ApiState,
    error::ApiError,
    metrics::{SEARCH_LATENCY_SECONDS, SEARCH_REQUESTS_TOTAL},
    routes::{resolve_config, search_context, RetrievalParams},
};

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub corpus_id: String,
    pub corpus_ids: Vec<String>,
    pub matches: Vec<ChunkMatch>,
    pub latency_ms: f64,
    pub debug: FusionDebug,
}

/// Tri-source retrieval. Leg failures degrade into the debug block; only
/// request-shape problems and unknown corpora produce non-200 responses.
pub async fn search(
    State(state): State<ApiState>,
    Json(params): Json<RetrievalParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let started = Instant::now();

    let spec = params.to_spec(&state).await?;
    let config = resolve_config(&state, &params.primary_corpus()).await?;

    let ctx = search_context(&state);
    let outcome = run_search(&ctx, &spec, &config).await;

    let latency = started.elapsed();
    metrics::counter!(SEARCH_REQUESTS_TOTAL).increment(1);
    metrics::histogram!(SEARCH_LATENCY_SECONDS).record(latency.as_secs_f64());

    Ok(Json(SearchResponse {
        corpus_id: params.primary_corpus(),
        corpus_ids: spec.corpus_ids,
        matches: outcome.matches,
        latency_ms: latency.as_secs_f64() * 1000.0,
        debug: outcome.debug,
    }))
}
