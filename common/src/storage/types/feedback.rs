use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(FeedbackRecord, "feedback", {
    corpus_id: Option<String>,
    event_id: Option<String>,
    signal: Option<String>,
    doc_id: Option<String>,
    note: Option<String>,
    rating: Option<u8>,
    comment: Option<String>,
    #[serde(default)]
    context: serde_json::Value
});

/// Signals accepted by the learning-feedback shape. UI meta feedback is
/// gated by `rating` instead.
pub const VALID_SIGNALS: &[&str] = &[
    "thumbsup", "thumbsdown", "click", "noclick", "note", "star1", "star2", "star3", "star4",
    "star5",
];

pub fn is_valid_signal(signal: &str) -> bool {
    VALID_SIGNALS.contains(&signal)
}

impl FeedbackRecord {
    pub fn new(corpus_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            corpus_id,
            event_id: None,
            signal: None,
            doc_id: None,
            note: None,
            rating: None,
            comment: None,
            context: serde_json::Value::Null,
        }
    }

    pub async fn append(self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.store_item(self).await.map_err(AppError::Database)?;
        Ok(())
    }
}
