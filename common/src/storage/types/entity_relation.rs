use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(EntityRelation, "entity_relation", {
    corpus_id: String,
    source_id: String,
    target_id: String,
    relation_type: RelationType,
    weight: f32
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Calls,
    Imports,
    Inherits,
    Contains,
    References,
    RelatedTo,
}

impl EntityRelation {
    pub fn new(
        corpus_id: String,
        source_id: String,
        target_id: String,
        relation_type: RelationType,
        weight: f32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            corpus_id,
            source_id,
            target_id,
            relation_type,
            weight,
        }
    }

    /// All edges touching any of the given entities, in either direction.
    pub async fn find_touching(
        db: &SurrealDbClient,
        corpus_id: &str,
        entity_ids: &[String],
    ) -> Result<Vec<EntityRelation>, AppError> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = entity_ids.to_vec();

        let mut response = db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE corpus_id = $corpus_id \
                   AND (source_id IN $ids OR target_id IN $ids)",
            )
            .bind(("table", Self::table_name().to_owned()))
            .bind(("corpus_id", corpus_id.to_owned()))
            .bind(("ids", ids))
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
    async fn find_touching_matches_both_directions() {
        let db = SurrealDbClient::memory("rel_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");

        let outgoing = EntityRelation::new(
            "repo".into(),
            "e1".into(),
            "e2".into(),
            RelationType::Calls,
            1.0,
        );
        let incoming = EntityRelation::new(
            "repo".into(),
            "e3".into(),
            "e1".into(),
            RelationType::Imports,
            0.7,
        );
        let unrelated = EntityRelation::new(
            "repo".into(),
            "e4".into(),
            "e5".into(),
            RelationType::Contains,
            1.0,
        );

        for rel in [outgoing, incoming, unrelated] {
            db.store_item(rel).await.expect("store relation");
        }

        let touching = EntityRelation::find_touching(&db, "repo", &["e1".into()])
            .await
            .expect("find touching");
        assert_eq!(touching.len(), 2);
    }
}
