use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

// Per-corpus configuration document. The record id is the corpus id so a
// corpus can never accumulate more than one document; saves are whole-row
// upserts, which keeps readers from ever observing a partial write.
stored_object!(CorpusConfigDoc, "corpus_config", {
    corpus_id: String,
    document: serde_json::Value
});

impl CorpusConfigDoc {
    pub fn new(corpus_id: String, document: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: corpus_id.clone(),
            created_at: now,
            updated_at: now,
            corpus_id,
            document,
        }
    }

    pub async fn get_for_corpus(
        db: &SurrealDbClient,
        corpus_id: &str,
    ) -> Result<Option<CorpusConfigDoc>, AppError> {
        db.get_item(corpus_id).await.map_err(AppError::Database)
    }

    pub async fn upsert_document(
        db: &SurrealDbClient,
        corpus_id: &str,
        document: serde_json::Value,
    ) -> Result<(), AppError> {
        let doc = CorpusConfigDoc::new(corpus_id.to_string(), document);
        db.upsert_item(doc).await.map_err(AppError::Database)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn upsert_replaces_the_single_document() {
        let db = SurrealDbClient::memory("cfgdoc_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");

        CorpusConfigDoc::upsert_document(&db, "repo", serde_json::json!({"v": 1}))
            .await
            .expect("first upsert");
        CorpusConfigDoc::upsert_document(&db, "repo", serde_json::json!({"v": 2}))
            .await
            .expect("second upsert");

        let all: Vec<CorpusConfigDoc> = db.get_all_stored_items().await.expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].document["v"], 2);
    }
}
