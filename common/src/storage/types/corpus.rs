use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Corpus, "corpus", {
    name: String,
    root_path: String,
    description: Option<String>
});

impl Corpus {
    /// The record id doubles as the `corpus_id`.
    pub fn new(corpus_id: String, name: String, root_path: String) -> Self {
        let now = Utc::now();
        Self {
            id: corpus_id,
            created_at: now,
            updated_at: now,
            name,
            root_path,
            description: None,
        }
    }

    pub async fn get(db: &SurrealDbClient, corpus_id: &str) -> Result<Option<Self>, AppError> {
        db.get_item(corpus_id).await.map_err(AppError::Database)
    }

    /// Read-paths never auto-create corpora; unknown ids surface as NotFound.
    pub async fn require(db: &SurrealDbClient, corpus_id: &str) -> Result<Self, AppError> {
        Self::get(db, corpus_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("corpus '{corpus_id}' not found")))
    }

    pub async fn list(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        db.get_all_stored_items().await.map_err(AppError::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn require_rejects_unknown_corpus_without_creating_it() {
        let db = SurrealDbClient::memory("corpus_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");

        let err = Corpus::require(&db, "missing").await.expect_err("should not resolve");
        assert!(matches!(err, AppError::NotFound(_)));

        let all = Corpus::list(&db).await.expect("list");
        assert!(all.is_empty(), "require must not create a corpus row");
    }

    #[tokio::test]
    async fn stores_and_requires_corpus() {
        let db = SurrealDbClient::memory("corpus_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");

        let corpus = Corpus::new("repo-a".into(), "Repo A".into(), "/srv/repo-a".into());
        db.store_item(corpus.clone()).await.expect("store corpus");

        let loaded = Corpus::require(&db, "repo-a").await.expect("require");
        assert_eq!(loaded.name, "Repo A");
    }
}
