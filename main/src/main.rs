use std::sync::Arc;
use std::time::Duration;

use api_router::{api_router, api_state::ApiState, metrics::init_metrics};
use common::{
    config::{apply_dotenv, get_config, ConfigResolver},
    storage::db::ClientPool,
    utils::embedding::EmbeddingProvider,
};
use mcp_router::{McpDeps, TriBridMcpServer};
use retrieval_pipeline::rerank::{RerankerPool, RerankerRegistry};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing. Everything goes to stderr so the MCP stdio transport
    // keeps stdout to itself.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Environment first: .env never overrides operator exports.
    apply_dotenv();
    let config = get_config()?;

    // One shared client per DSN for the process lifetime.
    let db = ClientPool::global()
        .acquire(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?;

    let resolver = Arc::new(ConfigResolver::new(Arc::clone(&db)));
    let global_config = resolver.get(None).await?;

    db.apply_schema(
        global_config.embedding.embedding_dim,
        &global_config.sparse,
        global_config.retrieval.bm25_k1,
        global_config.retrieval.bm25_b,
    )
    .await?;

    let embedder = Arc::new(EmbeddingProvider::from_env(&global_config.embedding));
    info!(
        embedding_backend = embedder.backend_label(),
        embedding_dimension = embedder.dimension(),
        "Embedding provider initialized"
    );

    let reranker_pool = RerankerPool::maybe_from_config(&config)?;
    let reranker = RerankerRegistry::new(reranker_pool);

    // `--mcp` switches the process into stdio MCP mode; no HTTP listener.
    if std::env::args().any(|arg| arg == "--mcp") {
        info!("Starting MCP server on stdio");
        let deps = McpDeps {
            db,
            resolver,
            embedder,
            reranker,
            leg_deadline: Duration::from_millis(
                config
                    .request_timeout_ms
                    .saturating_sub(config.leg_safety_margin_ms)
                    .max(1),
            ),
        };
        mcp_router::serve_stdio(TriBridMcpServer::new(deps)).await?;
        return Ok(());
    }

    let metrics_handle = init_metrics()?;

    let state = ApiState::with_resources(db, embedder, reranker, config.clone());
    let app = api_router(state, metrics_handle);

    let serve_address = format!("0.0.0.0:{}", config.http_port);
    info!("Starting server listening on {serve_address}");
    let listener = tokio::net::TcpListener::bind(&serve_address).await?;

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
    {
        error!("Server error: {e}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_router::metrics;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use common::config::AppConfig;
    use common::config::scoped::SparseLegSettings;
    use common::storage::db::SurrealDbClient;
    use metrics_exporter_prometheus::PrometheusHandle;
    use std::sync::OnceLock;
    use tower::ServiceExt;
    use uuid::Uuid;

    static METRICS: OnceLock<PrometheusHandle> = OnceLock::new();

    fn metrics_handle() -> PrometheusHandle {
        METRICS
            .get_or_init(|| metrics::init_metrics().expect("install metrics recorder"))
            .clone()
    }

    fn smoke_test_config() -> AppConfig {
        AppConfig {
            surrealdb_address: "mem://".into(),
            surrealdb_username: "root".into(),
            surrealdb_password: "root".into(),
            surrealdb_namespace: "smoke".into(),
            surrealdb_database: "smoke".into(),
            data_dir: "./data".into(),
            http_port: 0,
            request_timeout_ms: 5_000,
            leg_safety_margin_ms: 250,
            reranking_enabled: false,
            reranking_pool_size: None,
            fastembed_cache_dir: None,
        }
    }

    async fn build_test_app() -> Router {
        let db = Arc::new(
            SurrealDbClient::memory("smoke_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );
        db.apply_schema(8, &SparseLegSettings::default(), 1.2, 0.4)
            .await
            .expect("schema");

        let state = ApiState::with_resources(
            db,
            Arc::new(EmbeddingProvider::new_hashed(8)),
            RerankerRegistry::new(None),
            smoke_test_config(),
        );
        api_router(state, metrics_handle())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn smoke_startup_with_in_memory_surrealdb() {
        let app = build_test_app().await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("health response");
        assert_eq!(response.status(), StatusCode::OK);

        let ready_response = app
            .oneshot(
                Request::builder()
                    .uri("/api/ready")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("ready response");
        assert_eq!(ready_response.status(), StatusCode::OK);
    }
}
