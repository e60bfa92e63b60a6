use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use std::sync::OnceLock;
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};
use tracing::debug;

use crate::config::scoped::{SparseLegSettings, TokenizerMode};
use crate::error::AppError;

use super::types::StoredObject;

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        // Sign in to database; the embedded engine has no auth layer.
        if !address.starts_with("mem:") {
            db.signin(Root { username, password }).await?;
        }

        // Set namespace
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Bootstrap the schema the retrieval core reads from: the dense index,
    /// the BM25 full-text index, and the corpus-scoped lookup indexes. Safe
    /// to call repeatedly; dimension changes redefine the dense index.
    pub async fn apply_schema(
        &self,
        embedding_dim: usize,
        sparse: &SparseLegSettings,
        bm25_k1: f32,
        bm25_b: f32,
    ) -> Result<(), AppError> {
        self.client
            .query(format!(
                "DEFINE INDEX OVERWRITE idx_embedding_chunk ON chunk_embedding FIELDS embedding HNSW DIMENSION {embedding_dim}"
            ))
            .await
            .map_err(AppError::Database)?;

        self.define_fts_index(sparse, bm25_k1, bm25_b).await?;

        for statement in [
            "DEFINE INDEX IF NOT EXISTS idx_chunk_corpus ON chunk FIELDS corpus_id",
            "DEFINE INDEX IF NOT EXISTS idx_chunk_embedding_corpus ON chunk_embedding FIELDS corpus_id",
            "DEFINE INDEX IF NOT EXISTS idx_entity_corpus ON entity FIELDS corpus_id",
            "DEFINE INDEX IF NOT EXISTS idx_entity_name ON entity FIELDS name_lower",
            "DEFINE INDEX IF NOT EXISTS idx_relation_source ON entity_relation FIELDS source_id",
            "DEFINE INDEX IF NOT EXISTS idx_relation_target ON entity_relation FIELDS target_id",
            "DEFINE INDEX IF NOT EXISTS idx_membership_entity ON chunk_membership FIELDS entity_id",
        ] {
            self.client.query(statement).await.map_err(AppError::Database)?;
        }

        Ok(())
    }

    async fn define_fts_index(
        &self,
        sparse: &SparseLegSettings,
        bm25_k1: f32,
        bm25_b: f32,
    ) -> Result<(), AppError> {
        // The analyzer must match what the indexer wrote with; the tokenizer
        // mode is part of the corpus config for exactly that reason.
        let filters = match sparse.tokenizer {
            TokenizerMode::Whitespace => "",
            TokenizerMode::Lowercase => "FILTERS lowercase, ascii",
            TokenizerMode::Stemmer => "FILTERS lowercase, ascii, snowball(english)",
        };

        let analyzer_sql = format!(
            "DEFINE ANALYZER OVERWRITE chunk_fts_analyzer TOKENIZERS class, punct {filters};"
        );
        let index_sql = format!(
            "DEFINE INDEX IF NOT EXISTS chunk_fts_content_idx ON TABLE chunk FIELDS content \
             SEARCH ANALYZER chunk_fts_analyzer BM25({bm25_k1},{bm25_b});"
        );

        if let Err(err) = self.client.query(format!("{analyzer_sql}{index_sql}")).await {
            // Snowball may be unavailable in some builds; fall back to an
            // ascii-only analyzer so sparse search keeps working.
            debug!(error = %err, "FTS analyzer definition failed, retrying without stemmer");
            let fallback = format!(
                "DEFINE ANALYZER OVERWRITE chunk_fts_analyzer TOKENIZERS class, punct FILTERS lowercase, ascii;{index_sql}"
            );
            self.client.query(fallback).await.map_err(AppError::Database)?;
        }

        Ok(())
    }

    pub async fn rebuild_indexes(&self) -> Result<(), Error> {
        self.client
            .query("REBUILD INDEX IF EXISTS chunk_fts_content_idx ON chunk")
            .await?;
        self.client
            .query("REBUILD INDEX IF EXISTS idx_embedding_chunk ON chunk_embedding")
            .await?;
        Ok(())
    }

    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn upsert_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .upsert((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }
}

impl std::ops::Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}

/// Process-wide client pool keyed by DSN. Clients are created exactly once
/// per address and shared across requests; dropping a handle never closes
/// the underlying connection.
pub struct ClientPool {
    clients: DashMap<String, Arc<SurrealDbClient>>,
    created: AtomicUsize,
}

static POOL: OnceLock<ClientPool> = OnceLock::new();

impl Default for ClientPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientPool {
    pub fn new() -> Self {
        ClientPool {
            clients: DashMap::new(),
            created: AtomicUsize::new(0),
        }
    }

    pub fn global() -> &'static ClientPool {
        POOL.get_or_init(|| ClientPool {
            clients: DashMap::new(),
            created: AtomicUsize::new(0),
        })
    }

    pub async fn acquire(
        &self,
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Arc<SurrealDbClient>, Error> {
        let key = format!("{address}/{namespace}/{database}");
        if let Some(existing) = self.clients.get(&key) {
            return Ok(Arc::clone(&existing));
        }

        let client = Arc::new(
            SurrealDbClient::new(address, username, password, namespace, database).await?,
        );
        self.created.fetch_add(1, Ordering::Relaxed);
        let entry = self
            .clients
            .entry(key)
            .or_insert_with(|| Arc::clone(&client));
        Ok(Arc::clone(&entry))
    }

    pub fn connections_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}
