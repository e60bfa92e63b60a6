use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::AppError;
use crate::storage::{
    db::SurrealDbClient,
    types::{corpus::Corpus, corpus_config::CorpusConfigDoc},
};

use super::scoped::ScopedConfig;

/// Record id of the persisted global template.
const GLOBAL_SCOPE_ID: &str = "_global";

/// Read-through resolver for scoped configuration (C1).
///
/// Precedence: per-corpus document, then the global template. Entries are
/// cached per scope; any write invalidates exactly the affected scope.
/// Unknown corpora are never auto-created on reads.
pub struct ConfigResolver {
    db: Arc<SurrealDbClient>,
    cache: RwLock<HashMap<Option<String>, Arc<ScopedConfig>>>,
}

impl ConfigResolver {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, corpus_id: Option<&str>) -> Result<Arc<ScopedConfig>, AppError> {
        let key = corpus_id.map(ToOwned::to_owned);

        if let Some(cached) = self.cache.read().await.get(&key) {
            return Ok(Arc::clone(cached));
        }

        let resolved = match corpus_id {
            None => Arc::new(self.load_global().await?),
            Some(corpus) => Arc::new(self.load_for_corpus(corpus).await?),
        };

        self.cache
            .write()
            .await
            .insert(key, Arc::clone(&resolved));
        Ok(resolved)
    }

    async fn load_global(&self) -> Result<ScopedConfig, AppError> {
        match CorpusConfigDoc::get_for_corpus(&self.db, GLOBAL_SCOPE_ID).await? {
            Some(doc) => parse_document(doc.document),
            None => ScopedConfig::default().validated(),
        }
    }

    async fn load_for_corpus(&self, corpus_id: &str) -> Result<ScopedConfig, AppError> {
        Corpus::require(&self.db, corpus_id).await?;

        match CorpusConfigDoc::get_for_corpus(&self.db, corpus_id).await? {
            Some(doc) => parse_document(doc.document),
            None => {
                // Seed the corpus document from the global template on the
                // first read of an existing corpus.
                let global = self.load_global().await?;
                let document = serde_json::to_value(&global)
                    .map_err(|e| AppError::InternalError(e.to_string()))?;
                CorpusConfigDoc::upsert_document(&self.db, corpus_id, document).await?;
                debug!(corpus_id, "Seeded corpus config from global template");
                Ok(global)
            }
        }
    }

    /// Persist a full document for the scope and refresh the cache entry.
    pub async fn save(
        &self,
        corpus_id: Option<&str>,
        config: ScopedConfig,
    ) -> Result<Arc<ScopedConfig>, AppError> {
        let config = config.validated()?;

        let scope = match corpus_id {
            None => GLOBAL_SCOPE_ID.to_string(),
            Some(corpus) => {
                Corpus::require(&self.db, corpus).await?;
                corpus.to_string()
            }
        };

        let document =
            serde_json::to_value(&config).map_err(|e| AppError::InternalError(e.to_string()))?;
        CorpusConfigDoc::upsert_document(&self.db, &scope, document).await?;

        let shared = Arc::new(config);
        self.cache
            .write()
            .await
            .insert(corpus_id.map(ToOwned::to_owned), Arc::clone(&shared));
        Ok(shared)
    }

    /// Merge a partial JSON document into the scope's current config.
    pub async fn patch(
        &self,
        corpus_id: Option<&str>,
        patch: serde_json::Value,
    ) -> Result<Arc<ScopedConfig>, AppError> {
        let current = self.get(corpus_id).await?;
        let mut document = serde_json::to_value(current.as_ref())
            .map_err(|e| AppError::InternalError(e.to_string()))?;
        merge_json(&mut document, patch);

        let merged = parse_document(document)?;
        self.save(corpus_id, merged).await
    }

    /// Reset the scope to built-in defaults.
    pub async fn reset(&self, corpus_id: Option<&str>) -> Result<Arc<ScopedConfig>, AppError> {
        self.save(corpus_id, ScopedConfig::default()).await
    }

    pub async fn invalidate(&self, corpus_id: Option<&str>) {
        self.cache
            .write()
            .await
            .remove(&corpus_id.map(ToOwned::to_owned));
    }
}

fn parse_document(document: serde_json::Value) -> Result<ScopedConfig, AppError> {
    let config: ScopedConfig = serde_json::from_value(document)
        .map_err(|e| AppError::Validation(format!("invalid config document: {e}")))?;
    config.validated()
}

fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
