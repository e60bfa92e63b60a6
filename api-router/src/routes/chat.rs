use std::convert::Infallible;
use std::time::Instant;

use axum::{
    extract::State,
    response::sse::{Event, Sse},
    Json,
};
use chrono::Utc;
use futures::{Stream, StreamExt};
use generation::{answer_best_effort, stream::AnswerEvent, stream::HistoryTurn, AnswerRequest};
use retrieval_pipeline::{
    recall::{apply_recency_weight, classify_for_recall, RecallPlan},
    run_search, SearchSpec,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::config::scoped::RecallIntensity;

use crate::{
    api_state::ApiState,
    error::ApiError,
    routes::{
        answer::{event_for, sse_with_keep_alive},
        resolve_config, search_context, RetrievalParams,
    },
};

#[derive(Debug, Deserialize)]
pub struct ChatRequestBody {
    #[serde(flatten)]
    pub retrieval: RetrievalParams,
    /// The chat message; falls back to `query` when absent.
    pub message: Option<String>,
    #[serde(default)]
    pub model: String,
    pub system_prompt: Option<String>,
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
    /// Prior provider response id for conversation continuity.
    pub provider_response_id: Option<String>,
    /// Secondary chat-memory corpus, queried through the recall gate.
    pub recall_corpus_id: Option<String>,
    #[serde(default)]
    pub conversation_turn: usize,
    #[serde(default)]
    pub last_recall_had_results: bool,
    /// User override for the gate: skip | light | standard | deep.
    pub recall_intensity: Option<RecallIntensity>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub answer: String,
    pub sources: Vec<retrieval_pipeline::ChunkMatch>,
    pub model: String,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_response_id: Option<String>,
    pub recall_plan: RecallPlan,
    pub debug: generation::AnswerDebug,
}

impl ChatRequestBody {
    fn message(&self) -> &str {
        self.message.as_deref().unwrap_or(&self.retrieval.query)
    }
}

/// Gate recall, retrieve chat memory when the plan says so, and hand the
/// combined request to the answer composer.
async fn build_chat_request(
    state: &ApiState,
    body: &ChatRequestBody,
) -> Result<(AnswerRequest, RecallPlan), ApiError> {
    let mut retrieval = body.retrieval.clone();
    if retrieval.query.trim().is_empty() {
        retrieval.query = body.message().to_string();
    }

    let spec = retrieval.to_spec(state).await?;
    let config = resolve_config(state, &retrieval.primary_corpus()).await?;

    let plan = classify_for_recall(
        body.message(),
        body.conversation_turn,
        body.last_recall_had_results,
        !spec.corpus_ids.is_empty(),
        &config.chat.recall_gate,
        body.recall_intensity,
    );

    let recall_chunks = match (&body.recall_corpus_id, plan.intensity) {
        (Some(recall_corpus), intensity) if intensity != RecallIntensity::Skip => {
            fetch_recall_chunks(state, recall_corpus, body.message(), &plan).await?
        }
        _ => Vec::new(),
    };

    let mut request = AnswerRequest::new(spec);
    request.model_override = body.model.clone();
    request.system_prompt_override = body.system_prompt.clone();
    request.history = body.history.clone();
    request.recall_chunks = recall_chunks;
    request.conversation_id = Some(
        body.conversation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
    );
    request.run_id = Some(Uuid::new_v4().to_string());

    Ok((request, plan))
}

/// Recall retrieval with the gate's overrides applied by replacement: leg
/// toggles and top_k go into the spec, `enable_rerank` gates the reranker
/// handle, and `recency_weight` re-scores against chunk timestamps.
async fn fetch_recall_chunks(
    state: &ApiState,
    recall_corpus: &str,
    message: &str,
    plan: &RecallPlan,
) -> Result<Vec<retrieval_pipeline::ChunkMatch>, ApiError> {
    common::storage::types::corpus::Corpus::require(&state.db, recall_corpus)
        .await
        .map_err(ApiError::from)?;

    let config = resolve_config(state, recall_corpus).await?;

    let mut spec = SearchSpec::new(message, vec![recall_corpus.to_string()]);
    if let Some(include_vector) = plan.overrides.include_vector {
        spec.include_vector = include_vector;
    }
    if let Some(include_sparse) = plan.overrides.include_sparse {
        spec.include_sparse = include_sparse;
    }
    spec.top_k = plan.overrides.top_k;

    let mut ctx = search_context(state);
    if plan.overrides.enable_rerank == Some(false) {
        ctx.reranker = None;
    }

    let outcome = run_search(&ctx, &spec, &config).await;
    let mut matches = outcome.matches;
    if let Some(weight) = plan.overrides.recency_weight {
        apply_recency_weight(&mut matches, weight, Utc::now());
    }
    Ok(matches)
}

pub async fn chat(
    State(state): State<ApiState>,
    Json(body): Json<ChatRequestBody>,
) -> Result<Json<ChatResponse>, ApiError> {
    let started = Instant::now();

    let (request, plan) = build_chat_request(&state, &body).await?;
    let config = resolve_config(&state, &body.retrieval.primary_corpus()).await?;
    let ctx = search_context(&state);

    let output = answer_best_effort(&ctx, &config, &request).await;

    Ok(Json(ChatResponse {
        conversation_id: request.conversation_id.clone().unwrap_or_default(),
        answer: output.answer,
        sources: output.sources,
        model: output.model,
        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        provider_response_id: output.provider_response_id,
        recall_plan: plan,
        debug: output.debug,
    }))
}

pub async fn chat_stream(
    State(state): State<ApiState>,
    Json(body): Json<ChatRequestBody>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let (request, _plan) = match build_chat_request(&state, &body).await {
            Ok(pair) => pair,
            Err(err) => {
                yield Ok(event_for(&AnswerEvent::Error { message: err.to_string() }));
                return;
            }
        };
        let config = match resolve_config(&state, &body.retrieval.primary_corpus()).await {
            Ok(config) => config,
            Err(err) => {
                yield Ok(event_for(&AnswerEvent::Error { message: err.to_string() }));
                return;
            }
        };

        let ctx = search_context(&state);
        let mut inner = Box::pin(generation::stream_answer(&ctx, &config, &request));
        while let Some(event) = inner.next().await {
            yield Ok(event_for(&event));
        }
    };

    sse_with_keep_alive(stream)
}
