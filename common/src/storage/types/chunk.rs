use std::collections::HashMap;

use crate::storage::types::chunk_embedding::ChunkEmbedding;
use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Chunk, "chunk", {
    corpus_id: String,
    content: String,
    file_path: String,
    start_line: u32,
    end_line: u32,
    language: Option<String>,
    token_count: u32,
    summary: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value
});

/// A chunk row plus the leg-local score it was found with.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

impl Chunk {
    pub fn new(
        chunk_id: String,
        corpus_id: String,
        content: String,
        file_path: String,
        start_line: u32,
        end_line: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: chunk_id,
            created_at: now,
            updated_at: now,
            corpus_id,
            content,
            file_path,
            start_line,
            end_line,
            language: None,
            token_count: 0,
            summary: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Store a chunk and its embedding atomically. The indexer is the real
    /// writer; the core ships this for fixtures and bootstrap tooling.
    pub async fn store_with_embedding(
        chunk: Chunk,
        embedding: Vec<f32>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let chunk_id = chunk.id.clone();
        let emb = ChunkEmbedding::new(&chunk_id, chunk.corpus_id.clone(), embedding);

        let response = db
            .client
            .query("BEGIN TRANSACTION;")
            .query(format!(
                "CREATE type::thing('{chunk_table}', $chunk_id) CONTENT $chunk;",
                chunk_table = Self::table_name(),
            ))
            .query(format!(
                "CREATE type::thing('{emb_table}', $emb_id) CONTENT $emb;",
                emb_table = ChunkEmbedding::table_name(),
            ))
            .query("COMMIT TRANSACTION;")
            .bind(("chunk_id", chunk_id.clone()))
            .bind(("chunk", chunk))
            .bind(("emb_id", emb.id.clone()))
            .bind(("emb", emb))
            .await
            .map_err(AppError::Database)?;

        response.check().map_err(AppError::Database)?;

        Ok(())
    }

    /// Hydrate full rows for a set of chunk ids, preserving input order.
    pub async fn fetch_by_ids(
        db: &SurrealDbClient,
        corpus_id: &str,
        ids: &[String],
    ) -> Result<Vec<Chunk>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let thing_ids: Vec<Thing> = ids
            .iter()
            .map(|id| Thing::from((Self::table_name(), id.as_str())))
            .collect();

        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE id IN $things AND corpus_id = $corpus_id")
            .bind(("table", Self::table_name().to_owned()))
            .bind(("things", thing_ids))
            .bind(("corpus_id", corpus_id.to_owned()))
            .await
            .map_err(AppError::Database)?;

        let rows: Vec<Chunk> = response.take(0).map_err(AppError::Database)?;

        let mut by_id: HashMap<String, Chunk> =
            rows.into_iter().map(|c| (c.id.clone(), c)).collect();

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Full-text search over chunk content using the BM25 index. Scores are
    /// BM25 relevance as reported by the index; ordering is score-descending.
    pub async fn fts_search(
        db: &SurrealDbClient,
        corpus_id: &str,
        terms: &str,
        take: usize,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        #[derive(Deserialize)]
        struct ScoreRow {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            id: String,
            score: Option<f32>,
        }

        let limit = i64::try_from(take).unwrap_or(i64::MAX);

        let sql = format!(
            r#"
            SELECT
                id,
                IF search::score(0) != NONE THEN search::score(0) ELSE 0 END AS score
            FROM {chunk_table}
            WHERE content @0@ $terms
              AND corpus_id = $corpus_id
            ORDER BY score DESC
            LIMIT $limit;
            "#,
            chunk_table = Self::table_name(),
        );

        let mut response = db
            .query(&sql)
            .bind(("terms", terms.to_owned()))
            .bind(("corpus_id", corpus_id.to_owned()))
            .bind(("limit", limit))
            .await
            .map_err(|e| AppError::InternalError(format!("Surreal query failed: {e}")))?;

        let response = response.check();
        let mut response = match response {
            Ok(response) => response,
            // An FTS query without a matching index errors rather than
            // returning empty; treat that as no hits.
            Err(_) => return Ok(Vec::new()),
        };

        let score_rows: Vec<ScoreRow> = response.take(0).map_err(AppError::Database)?;
        if score_rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = score_rows.iter().map(|row| row.id.clone()).collect();
        let chunks = Self::fetch_by_ids(db, corpus_id, &ids).await?;

        let mut chunk_map: HashMap<String, Chunk> =
            chunks.into_iter().map(|c| (c.id.clone(), c)).collect();

        let mut results = Vec::with_capacity(score_rows.len());
        for row in score_rows {
            if let Some(chunk) = chunk_map.remove(&row.id) {
                results.push(ScoredChunk {
                    chunk,
                    score: row.score.unwrap_or_default(),
                });
            }
        }

        Ok(results)
    }

    /// Path-component search used by the sparse leg's filename fallback.
    pub async fn file_path_search(
        db: &SurrealDbClient,
        corpus_id: &str,
        tokens: &[String],
        take: usize,
    ) -> Result<Vec<Chunk>, AppError> {
        let mut seen: HashMap<String, Chunk> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for token in tokens {
            let token = token.trim().to_ascii_lowercase();
            if token.is_empty() {
                continue;
            }

            let mut response = db
                .query(
                    "SELECT * FROM type::table($table) \
                     WHERE corpus_id = $corpus_id \
                       AND string::contains(string::lowercase(file_path), $needle) \
                     LIMIT $limit",
                )
                .bind(("table", Self::table_name().to_owned()))
                .bind(("corpus_id", corpus_id.to_owned()))
                .bind(("needle", token))
                .bind(("limit", i64::try_from(take).unwrap_or(i64::MAX)))
                .await
                .map_err(AppError::Database)?;

            let rows: Vec<Chunk> = response.take(0).map_err(AppError::Database)?;
            for chunk in rows {
                if !seen.contains_key(&chunk.id) {
                    order.push(chunk.id.clone());
                    seen.insert(chunk.id.clone(), chunk);
                }
            }
            if order.len() >= take {
                break;
            }
        }

        Ok(order
            .into_iter()
            .take(take)
            .filter_map(|id| seen.remove(&id))
            .collect())
    }

    /// Line-range lookup used by the graph leg when membership edges are
    /// absent: any chunk of the file overlapping [start, end].
    pub async fn find_by_span(
        db: &SurrealDbClient,
        corpus_id: &str,
        file_path: &str,
        start_line: u32,
        end_line: u32,
    ) -> Result<Vec<Chunk>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE corpus_id = $corpus_id \
                   AND file_path = $file_path \
                   AND start_line <= $end_line \
                   AND end_line >= $start_line",
            )
            .bind(("table", Self::table_name().to_owned()))
            .bind(("corpus_id", corpus_id.to_owned()))
            .bind(("file_path", file_path.to_owned()))
            .bind(("start_line", i64::from(start_line)))
            .bind(("end_line", i64::from(end_line)))
            .await
            .map_err(AppError::Database)?;

        response.take(0).map_err(AppError::Database)
    }

    pub async fn count_for_corpus(db: &SurrealDbClient, corpus_id: &str) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct CountRow {
            total: Option<u64>,
        }

        let mut response = db
            .query("SELECT count() AS total FROM type::table($table) WHERE corpus_id = $corpus_id GROUP ALL")
            .bind(("table", Self::table_name().to_owned()))
            .bind(("corpus_id", corpus_id.to_owned()))
            .await
            .map_err(AppError::Database)?;

        let rows: Vec<CountRow> = response.take(0).map_err(AppError::Database)?;
        Ok(rows
            .first()
            .and_then(|row| row.total)
            .map(|v| v as usize)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::scoped::SparseLegSettings;
    use uuid::Uuid;

    async fn test_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("chunk_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");
        db.apply_schema(3, &SparseLegSettings::default(), 1.2, 0.4)
            .await
            .expect("schema");
        db
    }

    fn sample_chunk(id: &str, corpus: &str, content: &str, path: &str) -> Chunk {
        Chunk::new(
            id.to_string(),
            corpus.to_string(),
            content.to_string(),
            path.to_string(),
            1,
            10,
        )
    }

    #[tokio::test]
    async fn store_with_embedding_creates_both_rows() {
        let db = test_db().await;
        let chunk = sample_chunk("c1", "repo", "fn main() {}", "src/main.rs");

        Chunk::store_with_embedding(chunk.clone(), vec![0.1, 0.2, 0.3], &db)
            .await
            .expect("store");

        let stored: Option<Chunk> = db.get_item("c1").await.expect("get chunk");
        assert!(stored.is_some());

        let emb: Option<ChunkEmbedding> = db.get_item("c1").await.expect("get embedding");
        let emb = emb.expect("embedding row");
        assert_eq!(emb.chunk_id, "c1");
        assert_eq!(emb.embedding.len(), 3);
    }

    #[tokio::test]
    async fn fetch_by_ids_preserves_requested_order() {
        let db = test_db().await;
        for (id, content) in [("a", "alpha"), ("b", "beta"), ("c", "gamma")] {
            Chunk::store_with_embedding(
                sample_chunk(id, "repo", content, "src/lib.rs"),
                vec![0.0, 0.0, 1.0],
                &db,
            )
            .await
            .expect("store");
        }

        let fetched = Chunk::fetch_by_ids(&db, "repo", &["c".into(), "a".into()])
            .await
            .expect("fetch");
        let ids: Vec<&str> = fetched.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn fts_search_scopes_to_corpus() {
        let db = test_db().await;
        Chunk::store_with_embedding(
            sample_chunk("c1", "repo_a", "token refresh login flow", "src/auth.rs"),
            vec![1.0, 0.0, 0.0],
            &db,
        )
        .await
        .expect("store a");
        Chunk::store_with_embedding(
            sample_chunk("c2", "repo_b", "token refresh login flow", "src/auth.rs"),
            vec![1.0, 0.0, 0.0],
            &db,
        )
        .await
        .expect("store b");
        db.rebuild_indexes().await.expect("rebuild");

        let hits = Chunk::fts_search(&db, "repo_a", "token", 10).await.expect("fts");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.id, "c1");
        assert!(hits[0].score.is_finite());
    }

    #[tokio::test]
    async fn file_path_search_matches_path_components() {
        let db = test_db().await;
        Chunk::store_with_embedding(
            sample_chunk("c1", "repo", "irrelevant body", "src/auth/login_controller.py"),
            vec![1.0, 0.0, 0.0],
            &db,
        )
        .await
        .expect("store");

        let hits = Chunk::file_path_search(&db, "repo", &["login".into()], 5)
            .await
            .expect("path search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c1");

        let misses = Chunk::file_path_search(&db, "repo", &["nonexistent".into()], 5)
            .await
            .expect("path search");
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn find_by_span_returns_overlapping_chunks() {
        let db = test_db().await;
        let mut chunk = sample_chunk("c1", "repo", "body", "src/lib.rs");
        chunk.start_line = 10;
        chunk.end_line = 30;
        Chunk::store_with_embedding(chunk, vec![1.0, 0.0, 0.0], &db)
            .await
            .expect("store");

        let hits = Chunk::find_by_span(&db, "repo", "src/lib.rs", 25, 40)
            .await
            .expect("span query");
        assert_eq!(hits.len(), 1);

        let misses = Chunk::find_by_span(&db, "repo", "src/lib.rs", 31, 40)
            .await
            .expect("span query");
        assert!(misses.is_empty());
    }
}
