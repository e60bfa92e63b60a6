use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(ChunkEmbedding, "chunk_embedding", {
    chunk_id: String,
    corpus_id: String,
    embedding: Vec<f32>
});

/// One ANN hit: the chunk id plus its cosine similarity. Hydration of the
/// chunk body is deferred to the fusion stage.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct AnnHit {
    pub chunk_id: String,
    pub score: f32,
}

impl ChunkEmbedding {
    /// The embedding row reuses the chunk id, keeping a 1:1 mapping.
    pub fn new(chunk_id: &str, corpus_id: String, embedding: Vec<f32>) -> Self {
        let now = Utc::now();
        Self {
            id: chunk_id.to_string(),
            created_at: now,
            updated_at: now,
            chunk_id: chunk_id.to_string(),
            corpus_id,
            embedding,
        }
    }

    /// ANN over the dense index, scoped to one corpus. Returns up to `take`
    /// hits with cosine similarity, score-descending.
    pub async fn knn_search(
        db: &SurrealDbClient,
        corpus_id: &str,
        query_embedding: Vec<f32>,
        take: usize,
    ) -> Result<Vec<AnnHit>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            chunk_id: String,
            score: f32,
        }

        let sql = format!(
            r#"
            SELECT
                chunk_id,
                vector::similarity::cosine(embedding, $embedding) AS score
            FROM {emb_table}
            WHERE corpus_id = $corpus_id
              AND embedding <|{take},100|> $embedding
            ORDER BY score DESC
            LIMIT {take};
            "#,
            emb_table = Self::table_name(),
            take = take
        );

        let mut response = db
            .query(&sql)
            .bind(("embedding", query_embedding))
            .bind(("corpus_id", corpus_id.to_string()))
            .await
            .map_err(|e| AppError::InternalError(format!("Surreal query failed: {e}")))?;

        let rows: Vec<Row> = response.take::<Vec<Row>>(0).unwrap_or_default();

        Ok(rows
            .into_iter()
            .map(|r| AnnHit {
                chunk_id: r.chunk_id,
                score: r.score,
            })
            .collect())
    }
}
