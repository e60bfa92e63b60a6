use axum::{
    extract::{Query, State},
    Json,
};
use common::storage::types::{
    chunk::Chunk,
    entity::Entity,
    entity_relation::EntityRelation,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    api_state::ApiState,
    metrics::{CHUNKS_INDEXED_CURRENT, GRAPH_ENTITIES_CURRENT, GRAPH_RELATIONSHIPS_CURRENT},
};

/// Liveness: the process is up. No dependency probing here.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "services": {
            "api": { "status": "up" },
        }
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReadyScope {
    pub corpus_id: Option<String>,
}

/// Readiness: probes the chunk store and the graph store, optionally scoped
/// to one corpus. Degraded dependencies flip `ready` to false but the
/// response stays 200 so callers always get the full status shape.
pub async fn ready(
    State(state): State<ApiState>,
    Query(scope): Query<ReadyScope>,
) -> Json<serde_json::Value> {
    let corpus_id = scope
        .corpus_id
        .as_deref()
        .filter(|s| !s.trim().is_empty());

    let mut ready = true;
    let mut chunk_store = json!({ "ok": true, "error": null });
    let mut graph_store = json!({ "ok": true, "error": null });

    match probe_chunk_store(&state, corpus_id).await {
        Ok(count) => {
            if let Some(count) = count {
                metrics::gauge!(CHUNKS_INDEXED_CURRENT).set(count as f64);
                chunk_store["chunks"] = json!(count);
            }
        }
        Err(err) => {
            ready = false;
            chunk_store = json!({ "ok": false, "error": err });
        }
    }

    match probe_graph_store(&state, corpus_id).await {
        Ok(counts) => {
            if let Some((entities, relationships)) = counts {
                metrics::gauge!(GRAPH_ENTITIES_CURRENT).set(entities as f64);
                metrics::gauge!(GRAPH_RELATIONSHIPS_CURRENT).set(relationships as f64);
                graph_store["entities"] = json!(entities);
                graph_store["relationships"] = json!(relationships);
            }
        }
        Err(err) => {
            ready = false;
            graph_store = json!({ "ok": false, "error": err });
        }
    }

    Json(json!({
        "ready": ready,
        "corpus_id": corpus_id,
        "dependencies": {
            "chunk_store": chunk_store,
            "graph_store": graph_store,
        }
    }))
}

async fn probe_chunk_store(
    state: &ApiState,
    corpus_id: Option<&str>,
) -> Result<Option<usize>, String> {
    match corpus_id {
        Some(corpus) => Chunk::count_for_corpus(&state.db, corpus)
            .await
            .map(Some)
            .map_err(|e| e.to_string()),
        None => state
            .db
            .client
            .query("RETURN true")
            .await
            .map(|_| None)
            .map_err(|e| e.to_string()),
    }
}

async fn probe_graph_store(
    state: &ApiState,
    corpus_id: Option<&str>,
) -> Result<Option<(usize, usize)>, String> {
    match corpus_id {
        Some(corpus) => {
            let entities = Entity::count_for_corpus(&state.db, corpus)
                .await
                .map_err(|e| e.to_string())?;
            let relationships = EntityRelation::count_for_corpus(&state.db, corpus)
                .await
                .map_err(|e| e.to_string())?;
            Ok(Some((entities, relationships)))
        }
        None => state
            .db
            .client
            .query("RETURN true")
            .await
            .map(|_| None)
            .map_err(|e| e.to_string()),
    }
}
