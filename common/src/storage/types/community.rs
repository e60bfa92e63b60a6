use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

// Entity community aggregation written by the graph builder; the core only
// lists them for graph statistics.
stored_object!(Community, "community", {
    corpus_id: String,
    level: u32,
    entity_ids: Vec<String>,
    summary: Option<String>
});

impl Community {
    pub async fn list_for_corpus(
        db: &SurrealDbClient,
        corpus_id: &str,
    ) -> Result<Vec<Community>, AppError> {
        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE corpus_id = $corpus_id ORDER BY level")
            .bind(("table", Self::table_name().to_owned()))
            .bind(("corpus_id", corpus_id.to_owned()))
            .await
            .map_err(AppError::Database)?;

        response.take(0).map_err(AppError::Database)
    }
}
