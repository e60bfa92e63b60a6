use axum::{
    extract::{Query, State},
    Json,
};
use common::config::ScopedConfig;
use serde::Deserialize;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct ConfigScope {
    pub corpus_id: Option<String>,
}

impl ConfigScope {
    fn as_deref(&self) -> Option<&str> {
        self.corpus_id.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Effective config for the scope: per-corpus override when present, else
/// the global template. Unknown corpora are 404 and are never created here.
pub async fn get_config(
    State(state): State<ApiState>,
    Query(scope): Query<ConfigScope>,
) -> Result<Json<ScopedConfig>, ApiError> {
    let config = state.resolver.get(scope.as_deref()).await?;
    Ok(Json(config.as_ref().clone()))
}

/// Replace the scope's document wholesale.
pub async fn put_config(
    State(state): State<ApiState>,
    Query(scope): Query<ConfigScope>,
    Json(body): Json<ScopedConfig>,
) -> Result<Json<ScopedConfig>, ApiError> {
    let saved = state.resolver.save(scope.as_deref(), body).await?;
    Ok(Json(saved.as_ref().clone()))
}

/// Merge a partial document into the scope's current config.
pub async fn patch_config(
    State(state): State<ApiState>,
    Query(scope): Query<ConfigScope>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ScopedConfig>, ApiError> {
    let saved = state.resolver.patch(scope.as_deref(), body).await?;
    Ok(Json(saved.as_ref().clone()))
}

/// Reset the scope to built-in defaults.
pub async fn reset_config(
    State(state): State<ApiState>,
    Query(scope): Query<ConfigScope>,
) -> Result<Json<ScopedConfig>, ApiError> {
    let saved = state.resolver.reset(scope.as_deref()).await?;
    Ok(Json(saved.as_ref().clone()))
}
