use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

// Entity -> chunk membership edge (the IN_CHUNK relation).
stored_object!(ChunkMembership, "chunk_membership", {
    corpus_id: String,
    entity_id: String,
    chunk_id: String
});

impl ChunkMembership {
    pub fn new(corpus_id: String, entity_id: String, chunk_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            corpus_id,
            entity_id,
            chunk_id,
        }
    }

    pub async fn find_for_entities(
        db: &SurrealDbClient,
        corpus_id: &str,
        entity_ids: &[String],
    ) -> Result<Vec<ChunkMembership>, AppError> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = entity_ids.to_vec();

        let mut response = db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE corpus_id = $corpus_id AND entity_id IN $ids",
            )
            .bind(("table", Self::table_name().to_owned()))
            .bind(("corpus_id", corpus_id.to_owned()))
            .bind(("ids", ids))
            .await
            .map_err(AppError::Database)?;

        response.take(0).map_err(AppError::Database)
    }
}
