use axum::{extract::State, http::HeaderMap, Json};
use common::storage::types::{
    corpus::Corpus,
    feedback::{is_valid_signal, FeedbackRecord},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{api_state::ApiState, error::ApiError};

/// Marks requests coming from automated tests so they never contaminate
/// the training log.
const TEST_HEADER: &str = "x-tribrid-test";

#[derive(Debug, Deserialize)]
pub struct FeedbackRequestBody {
    pub corpus_id: Option<String>,
    pub event_id: Option<String>,
    pub signal: Option<String>,
    pub doc_id: Option<String>,
    pub note: Option<String>,
    pub rating: Option<u8>,
    pub comment: Option<String>,
    #[serde(default)]
    pub context: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub ok: bool,
}

fn is_test_request(headers: &HeaderMap) -> bool {
    headers
        .get(TEST_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// Record relevance/UI feedback. Test-tagged requests skip the write path
/// entirely; for real requests a failed write is a 500.
pub async fn post_feedback(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<FeedbackRequestBody>,
) -> Result<Json<FeedbackResponse>, ApiError> {
    if let Some(signal) = &body.signal {
        if !is_valid_signal(signal) {
            return Err(ApiError::ValidationError(format!("invalid signal '{signal}'")));
        }
    }

    if body.signal.is_none() && body.rating.is_none() {
        return Err(ApiError::ValidationError(
            "feedback requires a signal or a rating".to_string(),
        ));
    }

    if !is_test_request(&headers) {
        if let Some(corpus_id) = &body.corpus_id {
            Corpus::require(&state.db, corpus_id).await?;
        }

        let mut record = FeedbackRecord::new(body.corpus_id.clone());
        record.event_id = body.event_id;
        record.signal = body.signal;
        record.doc_id = body.doc_id;
        record.note = body.note;
        record.rating = body.rating;
        record.comment = body.comment;
        record.context = body.context;

        record.append(&state.db).await.map_err(|err| {
            error!(error = %err, "Failed to record feedback");
            ApiError::InternalError("Failed to record feedback".to_string())
        })?;
    }

    Ok(Json(FeedbackResponse { ok: true }))
}
