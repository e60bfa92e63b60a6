use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use generation::{
    answer_best_effort, stream::AnswerEvent, stream::HistoryTurn, AnswerDebug, AnswerRequest,
};
use retrieval_pipeline::ChunkMatch;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    api_state::ApiState,
    error::ApiError,
    routes::{resolve_config, search_context, RetrievalParams},
};

#[derive(Debug, Deserialize)]
pub struct AnswerRequestBody {
    #[serde(flatten)]
    pub retrieval: RetrievalParams,
    #[serde(default)]
    pub model: String,
    pub system_prompt: Option<String>,
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
}

#[derive(Debug, Serialize)]
pub struct AnswerResponse {
    pub query: String,
    pub corpus_id: String,
    pub answer: String,
    pub sources: Vec<ChunkMatch>,
    pub model: String,
    pub tokens_used: u32,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_response_id: Option<String>,
    pub debug: AnswerDebug,
}

pub(crate) async fn build_answer_request(
    state: &ApiState,
    body: &AnswerRequestBody,
) -> Result<AnswerRequest, ApiError> {
    let spec = body.retrieval.to_spec(state).await?;
    let mut request = AnswerRequest::new(spec);
    request.model_override = body.model.clone();
    request.system_prompt_override = body.system_prompt.clone();
    request.history = body.history.clone();
    request.conversation_id = body.conversation_id.clone();
    request.run_id = Some(Uuid::new_v4().to_string());
    Ok(request)
}

/// Retrieve + compose. Never 5xx on provider absence: the always-answer
/// fallback returns the top matches with `debug.llm_used = false`.
pub async fn answer(
    State(state): State<ApiState>,
    Json(body): Json<AnswerRequestBody>,
) -> Result<Json<AnswerResponse>, ApiError> {
    let started = Instant::now();

    let request = build_answer_request(&state, &body).await?;
    let config = resolve_config(&state, &body.retrieval.primary_corpus()).await?;
    let ctx = search_context(&state);

    let output = answer_best_effort(&ctx, &config, &request).await;

    Ok(Json(AnswerResponse {
        query: body.retrieval.query.clone(),
        corpus_id: body.retrieval.primary_corpus(),
        answer: output.answer,
        sources: output.sources,
        model: output.model,
        tokens_used: 0,
        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        provider_response_id: output.provider_response_id,
        debug: output.debug,
    }))
}

/// SSE variant of `/api/answer`. The stream always terminates with a `done`
/// event; validation and unknown-corpus failures yield a terminal `error`
/// event instead of an HTTP error so the envelope stays uniform.
pub async fn answer_stream(
    State(state): State<ApiState>,
    Json(body): Json<AnswerRequestBody>,
) -> Sse<KeepAliveStream<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>> {
    let stream = async_stream_events(state, body);
    sse_with_keep_alive(stream)
}

pub(crate) fn sse_with_keep_alive<S>(stream: S) -> Sse<KeepAliveStream<S>>
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

pub(crate) fn event_for(event: &AnswerEvent) -> Event {
    let name = match event {
        AnswerEvent::Text { .. } => "text",
        AnswerEvent::Done { .. } => "done",
        AnswerEvent::Error { .. } => "error",
    };
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(name).data(data)
}

fn async_stream_events(
    state: ApiState,
    body: AnswerRequestBody,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let request = match build_answer_request(&state, &body).await {
            Ok(request) => request,
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
    }
}
