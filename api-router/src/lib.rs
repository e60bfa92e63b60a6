use axum::{
    http::header,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use api_state::ApiState;
use routes::{
    answer::{answer, answer_stream},
    chat::{chat, chat_stream},
    config::{get_config, patch_config, put_config, reset_config},
    feedback::post_feedback,
    health::{health, ready},
    search::search,
    secrets::secrets_check,
};

pub mod api_state;
pub mod error;
pub mod metrics;
mod routes;

/// Assemble the HTTP surface: the retrieval/answer endpoints under `/api`,
/// plus the Prometheus exposition at `/metrics`.
pub fn api_router(state: ApiState, metrics_handle: PrometheusHandle) -> Router {
    let prometheus = Router::new().route(
        "/metrics",
        get(move || {
            let handle = metrics_handle.clone();
            async move {
                (
                    [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                    handle.render(),
                )
            }
        }),
    );

    Router::new()
        .route("/api/search", post(search))
        .route("/api/answer", post(answer))
        .route("/api/answer/stream", post(answer_stream))
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/health", get(health))
        .route("/api/ready", get(ready))
        .route(
            "/api/config",
            get(get_config).put(put_config).patch(patch_config),
        )
        .route("/api/config/reset", post(reset_config))
        .route("/api/feedback", post(post_feedback))
        .route("/api/secrets/check", get(secrets_check))
        .merge(prometheus)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use common::config::AppConfig;
    use common::config::scoped::SparseLegSettings;
    use common::storage::db::SurrealDbClient;
    use common::storage::types::{chunk::Chunk, corpus::Corpus, feedback::FeedbackRecord};
    use common::utils::embedding::EmbeddingProvider;
    use retrieval_pipeline::rerank::RerankerRegistry;
    use std::sync::{Arc, OnceLock};
    use tower::ServiceExt;
    use uuid::Uuid;

    static METRICS: OnceLock<PrometheusHandle> = OnceLock::new();

    fn metrics_handle() -> PrometheusHandle {
        METRICS
            .get_or_init(|| metrics::init_metrics().expect("install metrics recorder"))
            .clone()
    }

    fn test_config() -> AppConfig {
        AppConfig {
            surrealdb_address: "mem://".into(),
            surrealdb_username: "root".into(),
            surrealdb_password: "root".into(),
            surrealdb_namespace: "test".into(),
            surrealdb_database: "test".into(),
            data_dir: "./data".into(),
            http_port: 0,
            request_timeout_ms: 5_000,
            leg_safety_margin_ms: 250,
            reranking_enabled: false,
            reranking_pool_size: None,
            fastembed_cache_dir: None,
        }
    }

    async fn build_app() -> (Router, Arc<SurrealDbClient>) {
        let db = Arc::new(
            SurrealDbClient::memory("api_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );
        db.apply_schema(16, &SparseLegSettings::default(), 1.2, 0.4)
            .await
            .expect("schema");

        let embedder = Arc::new(EmbeddingProvider::new_hashed(16));
        let state = ApiState::with_resources(
            Arc::clone(&db),
            embedder,
            RerankerRegistry::new(None),
            test_config(),
        );

        (api_router(state, metrics_handle()), db)
    }

    async fn seed_corpus(db: &SurrealDbClient, corpus_id: &str) {
        db.store_item(Corpus::new(
            corpus_id.to_string(),
            corpus_id.to_string(),
            format!("/srv/{corpus_id}"),
        ))
        .await
        .expect("store corpus");
    }

    async fn seed_chunk(db: &SurrealDbClient, corpus_id: &str, id: &str, content: &str, path: &str) {
        let embedder = EmbeddingProvider::new_hashed(16);
        let chunk = Chunk::new(
            id.to_string(),
            corpus_id.to_string(),
            content.to_string(),
            path.to_string(),
            1,
            14,
        );
        let embedding = embedder.embed(content).await.expect("embed");
        Chunk::store_with_embedding(chunk, embedding, db)
            .await
            .expect("store chunk");
        db.rebuild_indexes().await.expect("rebuild indexes");
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("parse json")
    }

    #[tokio::test]
    async fn search_rejects_empty_query_with_422() {
        let (app, _db) = build_app().await;
        let response = app
            .oneshot(post_json(
                "/api/search",
                serde_json::json!({"query": "  ", "corpus_id": "repo"}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn search_unknown_corpus_is_404() {
        let (app, _db) = build_app().await;
        let response = app
            .oneshot(post_json(
                "/api/search",
                serde_json::json!({"query": "anything", "corpus_id": "ghost"}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn search_returns_matches_with_debug_and_counts_requests() {
        let (app, db) = build_app().await;
        seed_corpus(&db, "repo").await;
        seed_chunk(
            &db,
            "repo",
            "c1",
            "authentication flow token refresh login",
            "src/auth.py",
        )
        .await;

        let before = counter_value(&metrics_handle().render(), "tribrid_search_requests_total");

        let response = app
            .oneshot(post_json(
                "/api/search",
                serde_json::json!({"query": "authentication token refresh", "corpus_id": "repo"}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_json(response).await;
        assert_eq!(body["corpus_id"], "repo");
        assert!(body["latency_ms"].as_f64().is_some());
        assert!(body["debug"]["sparse_attempted"].as_bool().unwrap());
        let matches = body["matches"].as_array().expect("matches array");
        assert!(!matches.is_empty());
        assert!(matches.len() <= 10);

        // Other tests may hit /api/search concurrently; the counter must
        // have moved by at least this request.
        let after = counter_value(&metrics_handle().render(), "tribrid_search_requests_total");
        assert!(after >= before + 1, "counter must increment per search call");
    }

    fn counter_value(exposition: &str, name: &str) -> u64 {
        exposition
            .lines()
            .find(|line| line.starts_with(name) && !line.starts_with('#'))
            .and_then(|line| line.split_whitespace().last())
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value as u64)
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn search_with_legs_disabled_still_returns_200() {
        let (app, db) = build_app().await;
        seed_corpus(&db, "repo").await;

        let response = app
            .oneshot(post_json(
                "/api/search",
                serde_json::json!({
                    "query": "anything",
                    "corpus_id": "repo",
                    "include_vector": false,
                    "include_sparse": false,
                    "include_graph": false
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_json(response).await;
        assert_eq!(body["matches"].as_array().map(Vec::len), Some(0));
        assert_eq!(body["debug"]["vector_attempted"], false);
    }

    #[tokio::test]
    async fn answer_without_providers_returns_retrieval_only() {
        std::env::remove_var("OPENAI_API_KEY");
        std::env::remove_var("OPENROUTER_API_KEY");

        let (app, db) = build_app().await;
        seed_corpus(&db, "repo").await;
        seed_chunk(
            &db,
            "repo",
            "c1",
            "authentication flow token refresh login",
            "src/auth.py",
        )
        .await;

        let response = app
            .oneshot(post_json(
                "/api/answer",
                serde_json::json!({"query": "authentication token refresh", "corpus_id": "repo"}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_json(response).await;
        assert_eq!(body["model"], "retrieval-only");
        assert_eq!(body["debug"]["llm_used"], false);
        assert!(body["debug"]["llm_error"].as_str().map(|s| !s.is_empty()).unwrap_or(false));
        assert!(!body["sources"].as_array().expect("sources").is_empty());
        assert!(body["answer"].as_str().expect("answer").contains("src/auth.py"));
    }

    #[tokio::test]
    async fn config_get_unknown_corpus_is_404_and_creates_nothing() {
        let (app, db) = build_app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/config?corpus_id=ghost")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let corpora = Corpus::list(&db).await.expect("list");
        assert!(corpora.is_empty(), "read path must not create corpora");
    }

    #[tokio::test]
    async fn config_patch_round_trips_through_resolver() {
        let (app, db) = build_app().await;
        seed_corpus(&db, "repo").await;

        let response = app
            .clone()
            .oneshot({
                Request::builder()
                    .method("PATCH")
                    .uri("/api/config?corpus_id=repo")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"retrieval": {"final_k": 7}}).to_string(),
                    ))
                    .expect("request")
            })
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/config?corpus_id=repo")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let body = response_json(response).await;
        assert_eq!(body["retrieval"]["final_k"], 7);
    }

    #[tokio::test]
    async fn feedback_test_header_suppresses_writes() {
        let (app, db) = build_app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/feedback")
                    .header("content-type", "application/json")
                    .header("x-tribrid-test", "1")
                    .body(Body::from(
                        serde_json::json!({"event_id": "e1", "signal": "thumbsup"}).to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let rows: Vec<FeedbackRecord> = db.get_all_stored_items().await.expect("list feedback");
        assert!(rows.is_empty(), "test-tagged feedback must not be written");
    }

    #[tokio::test]
    async fn feedback_rejects_unknown_signals() {
        let (app, _db) = build_app().await;

        let response = app
            .oneshot(post_json(
                "/api/feedback",
                serde_json::json!({"event_id": "e1", "signal": "star9"}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn feedback_without_test_header_persists() {
        let (app, db) = build_app().await;

        let response = app
            .oneshot(post_json(
                "/api/feedback",
                serde_json::json!({"event_id": "e1", "signal": "star5", "comment": "good"}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let rows: Vec<FeedbackRecord> = db.get_all_stored_items().await.expect("list feedback");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].signal.as_deref(), Some("star5"));
    }

    #[tokio::test]
    async fn health_and_ready_respond_200() {
        let (app, db) = build_app().await;
        seed_corpus(&db, "repo").await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/ready?corpus_id=repo")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["ready"], true);
        assert_eq!(body["dependencies"]["chunk_store"]["ok"], true);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let (app, _db) = build_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn secrets_check_returns_booleans_only() {
        let (app, _db) = build_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/secrets/check")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_json(response).await;
        for (_, value) in body.as_object().expect("object") {
            assert!(value.is_boolean());
        }
    }

    #[tokio::test]
    async fn chat_applies_recall_gate_and_always_answers() {
        std::env::remove_var("OPENAI_API_KEY");
        std::env::remove_var("OPENROUTER_API_KEY");

        let (app, db) = build_app().await;
        seed_corpus(&db, "repo").await;
        seed_chunk(
            &db,
            "repo",
            "c1",
            "authentication flow token refresh login",
            "src/auth.py",
        )
        .await;

        // A bare greeting mid-conversation should classify as skip.
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/chat",
                serde_json::json!({
                    "message": "hi",
                    "query": "hi",
                    "corpus_id": "repo",
                    "conversation_turn": 3
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["recall_plan"]["intensity"], "skip");
        assert_eq!(body["debug"]["llm_used"], false);
        assert!(!body["conversation_id"].as_str().expect("conversation id").is_empty());

        // An explicit past reference classifies as deep.
        let response = app
            .oneshot(post_json(
                "/api/chat",
                serde_json::json!({
                    "message": "what did we discuss about auth?",
                    "query": "what did we discuss about auth?",
                    "corpus_id": "repo",
                    "conversation_turn": 3
                }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["recall_plan"]["intensity"], "deep");
    }

    #[tokio::test]
    async fn answer_stream_terminates_with_done_event() {
        std::env::remove_var("OPENAI_API_KEY");
        std::env::remove_var("OPENROUTER_API_KEY");

        let (app, db) = build_app().await;
        seed_corpus(&db, "repo").await;
        seed_chunk(
            &db,
            "repo",
            "c1",
            "authentication flow token refresh login",
            "src/auth.py",
        )
        .await;

        let response = app
            .oneshot(post_json(
                "/api/answer/stream",
                serde_json::json!({"query": "authentication token refresh", "corpus_id": "repo"}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read sse body");
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("event: text"));
        assert!(text.contains("event: done"));
        assert!(text.contains("\"sources\""));

        let done_at = text.find("event: done").expect("done event present");
        let text_at = text.find("event: text").expect("text event present");
        assert!(text_at < done_at, "text deltas precede the terminal done event");
    }
}
