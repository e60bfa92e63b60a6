use std::sync::Arc;
use std::time::Duration;

use common::{
    config::{AppConfig, ConfigResolver},
    storage::db::{ClientPool, SurrealDbClient},
    utils::embedding::EmbeddingProvider,
};
use retrieval_pipeline::rerank::RerankerRegistry;

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub resolver: Arc<ConfigResolver>,
    pub embedder: Arc<EmbeddingProvider>,
    pub reranker: Arc<RerankerRegistry>,
    pub config: AppConfig,
}

impl ApiState {
    pub async fn new(
        config: &AppConfig,
        embedder: Arc<EmbeddingProvider>,
        reranker: Arc<RerankerRegistry>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let db = ClientPool::global()
            .acquire(
                &config.surrealdb_address,
                &config.surrealdb_username,
                &config.surrealdb_password,
                &config.surrealdb_namespace,
                &config.surrealdb_database,
            )
            .await?;

        Ok(Self::with_resources(db, embedder, reranker, config.clone()))
    }

    pub fn with_resources(
        db: Arc<SurrealDbClient>,
        embedder: Arc<EmbeddingProvider>,
        reranker: Arc<RerankerRegistry>,
        config: AppConfig,
    ) -> Self {
        let resolver = Arc::new(ConfigResolver::new(Arc::clone(&db)));
        Self {
            db,
            resolver,
            embedder,
            reranker,
            config,
        }
    }

    /// Deadline handed to each retrieval leg: the request budget minus the
    /// planner/fusion reserve.
    pub fn leg_deadline(&self) -> Duration {
        let budget = self.config.request_timeout_ms;
        let margin = self.config.leg_safety_margin_ms.min(budget);
        Duration::from_millis(budget.saturating_sub(margin).max(1))
    }
}
