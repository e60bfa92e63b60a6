use axum::Json;
use common::config::{secrets_status, SecretsStatus};

/// Presence booleans for provider credentials; values never leave the
/// process.
pub async fn secrets_check() -> Json<SecretsStatus> {
    Json(secrets_status())
}
