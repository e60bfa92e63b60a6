pub mod context;
pub mod providers;
pub mod stream;

use async_openai::types::CreateChatCompletionRequestArgs;
use async_stream::stream;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use common::{
    config::ScopedConfig,
    error::AppError,
    utils::redaction::safe_error_message,
};
use retrieval_pipeline::{
    debug::FusionDebug, run_search, ChunkMatch, SearchContext, SearchSpec,
};

use context::{format_context, retrieval_only_answer, select_system_prompt};
use providers::{build_client, select_provider_route, ProviderEnv, ProviderKind, ProviderRoute};
use stream::{
    build_messages, extract_delta, extract_response_id, now_ms, AnswerEvent, DonePayload,
    HistoryTurn,
};

/// The provider actually used for a response, surfaced in debug payloads.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub kind: ProviderKind,
    pub provider_name: String,
    pub model: String,
    pub base_url: String,
}

impl From<&ProviderRoute> for ProviderInfo {
    fn from(route: &ProviderRoute) -> Self {
        Self {
            kind: route.kind,
            provider_name: route.provider_name.clone(),
            model: route.model.clone(),
            base_url: route.base_url.clone(),
        }
    }
}

/// Retrieval debug extended with the generation outcome.
#[derive(Debug, Serialize)]
pub struct AnswerDebug {
    #[serde(flatten)]
    pub retrieval: FusionDebug,
    pub llm_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderInfo>,
}

impl AnswerDebug {
    pub fn new(retrieval: FusionDebug) -> Self {
        Self {
            retrieval,
            llm_used: true,
            llm_error: None,
            provider: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn empty_for_tests() -> Self {
        use common::config::scoped::FusionMethod;
        Self::new(FusionDebug::new(FusionMethod::Rrf, 10))
    }
}

/// Everything the composer needs for one answer request.
#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub spec: SearchSpec,
    pub model_override: String,
    pub system_prompt_override: Option<String>,
    pub history: Vec<HistoryTurn>,
    pub recall_chunks: Vec<ChunkMatch>,
    pub conversation_id: Option<String>,
    pub run_id: Option<String>,
}

impl AnswerRequest {
    pub fn new(spec: SearchSpec) -> Self {
        Self {
            spec,
            model_override: String::new(),
            system_prompt_override: None,
            history: Vec::new(),
            recall_chunks: Vec::new(),
            conversation_id: None,
            run_id: None,
        }
    }

    fn primary_corpus(&self) -> &str {
        self.spec
            .corpus_ids
            .first()
            .map(String::as_str)
            .unwrap_or("")
    }
}

#[derive(Debug, Serialize)]
pub struct AnswerOutput {
    pub answer: String,
    pub sources: Vec<ChunkMatch>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_response_id: Option<String>,
    pub debug: AnswerDebug,
}

struct PreparedGeneration {
    route: ProviderRoute,
    system_prompt: String,
    context_text: String,
    temperature: f32,
}

fn prepare_generation(
    request: &AnswerRequest,
    config: &ScopedConfig,
    chunks: &[ChunkMatch],
) -> Result<PreparedGeneration, AppError> {
    let context_text = format_context(chunks, &request.recall_chunks);

    let system_prompt = match &request.system_prompt_override {
        Some(prompt) if !prompt.trim().is_empty() => prompt.trim().to_string(),
        _ => select_system_prompt(
            !chunks.is_empty(),
            !request.recall_chunks.is_empty(),
            &config.chat,
        ),
    };

    let route = select_provider_route(
        &config.chat,
        &config.generation.openai_base_url,
        &request.model_override,
        &ProviderEnv::from_process(),
    )?;

    let temperature = if chunks.is_empty() {
        config.chat.temperature_no_retrieval
    } else {
        config.chat.temperature
    };

    Ok(PreparedGeneration {
        route,
        system_prompt,
        context_text,
        temperature,
    })
}

/// Retrieve, then compose an answer with the routed provider. The
/// always-answer guarantee holds: any LLM failure (routing, transport,
/// empty response) degrades to a deterministic retrieval-only answer with
/// `llm_used = false` and a redacted `llm_error`.
#[instrument(skip_all, fields(corpus = %request.primary_corpus()))]
pub async fn answer_best_effort(
    ctx: &SearchContext,
    config: &ScopedConfig,
    request: &AnswerRequest,
) -> AnswerOutput {
    let outcome = run_search(ctx, &request.spec, config).await;
    let chunks = outcome.matches;
    let mut dbg = AnswerDebug::new(outcome.debug);

    let mut provider_response_id = None;
    let answer = match generate_once(ctx, config, request, &chunks, &mut dbg).await {
        Ok((text, response_id)) => {
            provider_response_id = response_id;
            text
        }
        Err(err) => {
            let message = safe_error_message(&err.to_string());
            warn!(error = %message, "LLM unavailable; returning retrieval-only answer");
            dbg.llm_used = false;
            dbg.llm_error = Some(message);
            retrieval_only_answer(&request.spec.query, request.primary_corpus(), &chunks)
        }
    };

    let model = if dbg.llm_used {
        dbg.provider
            .as_ref()
            .map(|p| p.model.clone())
            .unwrap_or_else(|| "retrieval-only".to_string())
    } else {
        "retrieval-only".to_string()
    };

    AnswerOutput {
        answer,
        sources: chunks,
        model,
        provider_response_id,
        debug: dbg,
    }
}

async fn generate_once(
    _ctx: &SearchContext,
    config: &ScopedConfig,
    request: &AnswerRequest,
    chunks: &[ChunkMatch],
    dbg: &mut AnswerDebug,
) -> Result<(String, Option<String>), AppError> {
    let prepared = prepare_generation(request, config, chunks)?;
    dbg.provider = Some(ProviderInfo::from(&prepared.route));

    let client = build_client(&prepared.route);
    let messages = build_messages(
        &prepared.system_prompt,
        &request.history,
        &prepared.context_text,
        &request.spec.query,
    )?;

    let chat_request = CreateChatCompletionRequestArgs::default()
        .model(&prepared.route.model)
        .messages(messages)
        .temperature(prepared.temperature)
        .max_completion_tokens(config.chat.max_tokens)
        .build()?;

    let response = client.chat().create(chat_request).await?;

    let response_id = {
        let id = response.id.trim();
        if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        }
    };

    let text = response
        .choices
        .first()
        .and_then(|choice| choice.message.content.clone())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(AppError::InternalError(
            "LLM returned an empty response".to_string(),
        ));
    }

    Ok((text.trim().to_string(), response_id))
}

/// Streaming variant. Yields `text` deltas in provider order and always
/// terminates with a `done` event; LLM failure degrades to one retrieval-only
/// `text` fragment followed by `done`.
pub fn stream_answer<'a>(
    ctx: &'a SearchContext,
    config: &'a ScopedConfig,
    request: &'a AnswerRequest,
) -> impl Stream<Item = AnswerEvent> + 'a {
    stream! {
        let started_at_ms = now_ms();

        let outcome = run_search(ctx, &request.spec, config).await;
        let chunks = outcome.matches;
        let mut dbg = AnswerDebug::new(outcome.debug);

        let mut provider_response_id: Option<String> = None;
        let mut accumulated = String::new();

        match prepare_generation(request, config, &chunks) {
            Ok(prepared) => {
                dbg.provider = Some(ProviderInfo::from(&prepared.route));
                let client = build_client(&prepared.route);

                let stream_result = async {
                    let messages = build_messages(
                        &prepared.system_prompt,
                        &request.history,
                        &prepared.context_text,
                        &request.spec.query,
                    )?;
                    let chat_request = CreateChatCompletionRequestArgs::default()
                        .model(&prepared.route.model)
                        .messages(messages)
                        .temperature(prepared.temperature)
                        .max_completion_tokens(config.chat.max_tokens)
                        .stream(true)
                        .build()?;
                    client
                        .chat()
                        .create_stream(chat_request)
                        .await
                        .map_err(AppError::OpenAI)
                }
                .await;

                match stream_result {
                    Ok(mut provider_stream) => {
                        while let Some(item) = provider_stream.next().await {
                            match item {
                                Ok(response) => {
                                    if provider_response_id.is_none() {
                                        provider_response_id = extract_response_id(&response);
                                    }
                                    if let Some(delta) = extract_delta(&response) {
                                        accumulated.push_str(&delta);
                                        yield AnswerEvent::Text { content: delta };
                                    }
                                }
                                Err(err) => {
                                    let message = safe_error_message(&err.to_string());
                                    warn!(error = %message, "Provider stream failed mid-flight");
                                    dbg.llm_error = Some(message);
                                    break;
                                }
                            }
                        }

                        if accumulated.trim().is_empty() {
                            dbg.llm_used = false;
                            if dbg.llm_error.is_none() {
                                dbg.llm_error =
                                    Some("LLM stream produced no content".to_string());
                            }
                        }
                    }
                    Err(err) => {
                        dbg.llm_used = false;
                        dbg.llm_error = Some(safe_error_message(&err.to_string()));
                    }
                }
            }
            Err(err) => {
                dbg.llm_used = false;
                dbg.llm_error = Some(safe_error_message(&err.to_string()));
            }
        }

        if !dbg.llm_used {
            debug!("Streaming fallback to retrieval-only answer");
            let fallback = retrieval_only_answer(
                &request.spec.query,
                request.primary_corpus(),
                &chunks,
            );
            yield AnswerEvent::Text { content: fallback };
        }

        let payload = DonePayload {
            run_id: request.run_id.clone(),
            conversation_id: request.conversation_id.clone(),
            started_at_ms,
            ended_at_ms: now_ms().max(started_at_ms),
            sources: chunks,
            provider: dbg.provider.clone(),
            provider_response_id,
            debug: dbg,
        };
        yield AnswerEvent::Done { payload: Box::new(payload) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::scoped::SparseLegSettings;
    use common::storage::db::SurrealDbClient;
    use common::storage::types::chunk::Chunk;
    use common::utils::embedding::EmbeddingProvider;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn seeded_context() -> SearchContext {
        let db = Arc::new(
            SurrealDbClient::memory("gen_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );
        db.apply_schema(16, &SparseLegSettings::default(), 1.2, 0.4)
            .await
            .expect("schema");

        let embedder = Arc::new(EmbeddingProvider::new_hashed(16));

        let chunk = Chunk::new(
            "c1".into(),
            "repo".into(),
            "authentication flow token refresh login".into(),
            "src/auth.py".into(),
            1,
            12,
        );
        let embedding = embedder.embed(&chunk.content).await.expect("embed");
        Chunk::store_with_embedding(chunk, embedding, &db)
            .await
            .expect("store");
        db.rebuild_indexes().await.expect("rebuild");

        SearchContext::new(db, embedder)
    }

    fn offline_config() -> ScopedConfig {
        // No providers configured anywhere: routing must fail and the
        // always-answer fallback must kick in.
        ScopedConfig::default()
    }

    #[tokio::test]
    async fn answer_falls_back_to_retrieval_only_without_providers() {
        // The test environment must not carry provider keys.
        std::env::remove_var("OPENAI_API_KEY");
        std::env::remove_var("OPENROUTER_API_KEY");

        let ctx = seeded_context().await;
        let request = AnswerRequest::new(SearchSpec::new(
            "authentication token refresh",
            vec!["repo".into()],
        ));

        let output = answer_best_effort(&ctx, &offline_config(), &request).await;

        assert_eq!(output.model, "retrieval-only");
        assert!(!output.debug.llm_used);
        assert!(output.debug.llm_error.as_deref().map(|e| !e.is_empty()).unwrap_or(false));
        assert!(!output.sources.is_empty(), "retrieval should still find the chunk");
        assert!(output.answer.contains("src/auth.py:1-12"));
    }

    #[tokio::test]
    async fn stream_always_ends_with_done_carrying_sources() {
        std::env::remove_var("OPENAI_API_KEY");
        std::env::remove_var("OPENROUTER_API_KEY");

        let ctx = seeded_context().await;
        let mut request = AnswerRequest::new(SearchSpec::new(
            "authentication token refresh",
            vec!["repo".into()],
        ));
        request.run_id = Some("run-1".to_string());

        let config = offline_config();
        let events: Vec<AnswerEvent> = stream_answer(&ctx, &config, &request).collect().await;

        assert!(events.len() >= 2, "at least one text and one done event");
        match events.last().expect("terminal event") {
            AnswerEvent::Done { payload } => {
                assert_eq!(payload.run_id.as_deref(), Some("run-1"));
                assert!(payload.ended_at_ms >= payload.started_at_ms);
                assert!(!payload.sources.is_empty());
                assert!(!payload.debug.llm_used);
            }
            other => panic!("expected done event, got {other:?}"),
        }

        match events.first().expect("first event") {
            AnswerEvent::Text { content } => {
                assert!(content.contains("retrieval-only") || content.contains("Top matching"));
            }
            other => panic!("expected text event, got {other:?}"),
        }
    }
}
