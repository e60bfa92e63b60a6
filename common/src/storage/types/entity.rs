use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Entity, "entity", {
    corpus_id: String,
    name: String,
    /// Lowercased copy of `name`, maintained for case-insensitive lookups.
    name_lower: String,
    entity_type: EntityType,
    file_path: Option<String>,
    start_line: Option<u32>,
    end_line: Option<u32>,
    #[serde(default)]
    properties: serde_json::Value
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Function,
    Class,
    Module,
    Variable,
    Concept,
}

impl Entity {
    pub fn new(
        entity_id: String,
        corpus_id: String,
        name: String,
        entity_type: EntityType,
    ) -> Self {
        let now = Utc::now();
        let name_lower = name.to_lowercase();
        Self {
            id: entity_id,
            created_at: now,
            updated_at: now,
            corpus_id,
            name,
            name_lower,
            entity_type,
            file_path: None,
            start_line: None,
            end_line: None,
            properties: serde_json::Value::Null,
        }
    }

    pub fn at_location(mut self, file_path: impl Into<String>, start: u32, end: u32) -> Self {
        self.file_path = Some(file_path.into());
        self.start_line = Some(start);
        self.end_line = Some(end);
        self
    }

    /// Entities whose name equals any query token, case-insensitively.
    /// These are the graph leg's direct matches (hops = 0).
    pub async fn find_by_name_tokens(
        db: &SurrealDbClient,
        corpus_id: &str,
        tokens: &[String],
    ) -> Result<Vec<Entity>, AppError> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let lowered: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();

        let mut response = db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE corpus_id = $corpus_id AND name_lower IN $tokens",
            )
            .bind(("table", Self::table_name().to_owned()))
            .bind(("corpus_id", corpus_id.to_owned()))
            .bind(("tokens", lowered))
            .await
            .map_err(AppError::Database)?;

        response.take(0).map_err(AppError::Database)
    }

    pub async fn fetch_by_ids(
        db: &SurrealDbClient,
        corpus_id: &str,
        ids: &[String],
    ) -> Result<Vec<Entity>, AppError> {
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
    use uuid::Uuid;

    #[tokio::test]
    async fn name_lookup_is_case_insensitive() {
        let db = SurrealDbClient::memory("entity_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");

        let entity = Entity::new(
            "e1".into(),
            "repo".into(),
            "AuthManager".into(),
            EntityType::Class,
        );
        db.store_item(entity).await.expect("store entity");

        let hits = Entity::find_by_name_tokens(&db, "repo", &["authmanager".into()])
            .await
            .expect("lookup");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "AuthManager");

        let misses = Entity::find_by_name_tokens(&db, "other", &["authmanager".into()])
            .await
            .expect("lookup");
        assert!(misses.is_empty(), "lookup must stay corpus-scoped");
    }
}
