use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant, SystemTime};

use common::config::scoped::{RerankerMode, RerankingSettings};
use common::error::AppError;
use common::utils::redaction::safe_error_message;
use fastembed::{RerankInitOptions, RerankResult, TextRerank};
use serde::Deserialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::{debug::RerankDebugInfo, ChunkMatch, SearchContext};

static NEXT_ENGINE: AtomicUsize = AtomicUsize::new(0);

fn pick_engine_index(pool_len: usize) -> usize {
    let n = NEXT_ENGINE.fetch_add(1, Ordering::Relaxed);
    n % pool_len
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

/// Pool of local cross-encoder engines. The semaphore bounds concurrent
/// inference; each lease locks one engine.
pub struct RerankerPool {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
}

impl RerankerPool {
    pub fn new(pool_size: usize) -> Result<Arc<Self>, AppError> {
        Self::new_with_options(pool_size, RerankInitOptions::default())
    }

    fn new_with_options(
        pool_size: usize,
        init_options: RerankInitOptions,
    ) -> Result<Arc<Self>, AppError> {
        if pool_size == 0 {
            return Err(AppError::Validation(
                "reranker pool size must be greater than zero".to_string(),
            ));
        }

        std::fs::create_dir_all(&init_options.cache_dir)?;

        let mut engines = Vec::with_capacity(pool_size);
        for x in 0..pool_size {
            debug!("Creating reranking engine: {x}");
            let model = TextRerank::try_new(init_options.clone())
                .map_err(|e| AppError::InternalError(e.to_string()))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
        }))
    }

    /// Initialize a pool from process configuration; `None` when local
    /// reranking is disabled.
    pub fn maybe_from_config(
        config: &common::config::AppConfig,
    ) -> Result<Option<Arc<Self>>, AppError> {
        if !config.reranking_enabled {
            return Ok(None);
        }

        let pool_size = config.reranking_pool_size.unwrap_or_else(default_pool_size);

        let mut options = RerankInitOptions::default();
        if let Some(cache_dir) = &config.fastembed_cache_dir {
            options.cache_dir = PathBuf::from(cache_dir);
        } else {
            options.cache_dir = Path::new(&config.data_dir).join("fastembed").join("reranker");
        }

        Self::new_with_options(pool_size, options).map(Some)
    }

    pub async fn checkout(self: &Arc<Self>) -> Result<RerankerLease, AppError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::InternalError("reranker pool closed".to_string()))?;

        let idx = pick_engine_index(self.engines.len());
        let engine = Arc::clone(&self.engines[idx]);

        Ok(RerankerLease {
            _permit: permit,
            engine,
        })
    }
}

/// Active lease on a single cross-encoder instance.
pub struct RerankerLease {
    // When this drops the semaphore permit is released.
    _permit: OwnedSemaphorePermit,
    engine: Arc<Mutex<TextRerank>>,
}

impl RerankerLease {
    pub async fn rerank(
        &self,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<RerankResult>, AppError> {
        let mut guard = self.engine.lock().await;

        guard
            .rerank(query.to_owned(), documents, false, None)
            .map_err(|e| AppError::InternalError(e.to_string()))
    }
}

/// (mtime, size) of the artifact's weights file. A change in either forces
/// a reload on the next borrow.
pub type ArtifactFingerprint = (SystemTime, u64);

struct LearningEntry {
    fingerprint: ArtifactFingerprint,
    last_used: Instant,
    in_use: usize,
}

/// Tracks loaded learning artifacts per directory: fingerprint-based hot
/// reload, in-use counters, and idle unloading.
#[derive(Default)]
pub struct LearningArtifacts {
    entries: StdMutex<HashMap<String, LearningEntry>>,
}

pub struct LearningTicket {
    registry: Arc<LearningArtifacts>,
    key: String,
}

impl Drop for LearningTicket {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

impl LearningArtifacts {
    /// Borrow the artifact under `dir`. Returns `None` when the directory
    /// has no recognizable weights, which the caller reports as
    /// `missing_trained_model`.
    pub fn borrow(self: &Arc<Self>, dir: &Path) -> Option<LearningTicket> {
        let fingerprint = weights_fingerprint(dir)?;
        let key = dir.to_string_lossy().into_owned();

        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.get_mut(&key) {
            Some(entry) if entry.fingerprint == fingerprint => {
                entry.last_used = Instant::now();
                entry.in_use += 1;
            }
            Some(entry) => {
                info!(artifact = %key, "Learning reranker weights changed; reloading");
                entry.fingerprint = fingerprint;
                entry.last_used = Instant::now();
                entry.in_use += 1;
            }
            None => {
                info!(artifact = %key, "Loading learning reranker artifact");
                entries.insert(
                    key.clone(),
                    LearningEntry {
                        fingerprint,
                        last_used: Instant::now(),
                        in_use: 1,
                    },
                );
            }
        }

        Some(LearningTicket {
            registry: Arc::clone(self),
            key,
        })
    }

    fn release(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = entries.get_mut(key) {
            entry.in_use = entry.in_use.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }

    /// Drop entries idle for longer than `ttl`. Entries with live tickets
    /// are never unloaded.
    pub fn unload_idle(&self, ttl: Duration) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.in_use > 0 || entry.last_used.elapsed() < ttl);
        before - entries.len()
    }

    pub fn loaded_count(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Weight files a trained cross-encoder directory may carry.
fn weights_fingerprint(dir: &Path) -> Option<ArtifactFingerprint> {
    if !dir.is_dir() {
        return None;
    }

    for name in ["model.safetensors", "pytorch_model.bin", "model.onnx"] {
        if let Ok(meta) = dir.join(name).metadata() {
            if meta.is_file() {
                return Some((meta.modified().ok()?, meta.len()));
            }
        }
    }

    // Sharded safetensors: model-00001-of-00002.safetensors and friends.
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let sharded = (name.starts_with("model-") && name.ends_with(".safetensors"))
            || (name.starts_with("pytorch_model-") && name.ends_with(".bin"));
        if sharded {
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    return Some((meta.modified().ok()?, meta.len()));
                }
            }
        }
    }

    None
}

/// Process-wide reranker facade: the local engine pool, the learning
/// artifact registry, and the HTTP client for the cloud provider.
pub struct RerankerRegistry {
    pool: Option<Arc<RerankerPool>>,
    learning: Arc<LearningArtifacts>,
    http: reqwest::Client,
}

impl RerankerRegistry {
    pub fn new(pool: Option<Arc<RerankerPool>>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            learning: Arc::new(LearningArtifacts::default()),
            http: reqwest::Client::new(),
        })
    }

    pub fn learning_artifacts(&self) -> Arc<LearningArtifacts> {
        Arc::clone(&self.learning)
    }
}

/// Rerank the fused pool according to the configured mode. Never fails the
/// request: every failure path preserves fusion order and reports itself in
/// the returned [`RerankDebugInfo`].
pub async fn rerank_matches(
    ctx: &SearchContext,
    query: &str,
    matches: Vec<ChunkMatch>,
    config: &RerankingSettings,
) -> (Vec<ChunkMatch>, RerankDebugInfo) {
    let mode = config.reranker_mode;

    if mode == RerankerMode::None {
        return (matches, RerankDebugInfo::passthrough(mode));
    }

    if matches.len() <= 1 {
        return (matches, RerankDebugInfo::skipped(mode, "insufficient_candidates"));
    }

    let Some(registry) = ctx.reranker.as_ref() else {
        return (matches, RerankDebugInfo::skipped(mode, "reranker_unavailable"));
    };

    match mode {
        RerankerMode::None => (matches, RerankDebugInfo::passthrough(mode)),
        RerankerMode::Local => rerank_with_pool(registry, mode, query, matches).await,
        RerankerMode::Learning => {
            let corpus = matches
                .first()
                .map(|m| m.corpus_id.as_str())
                .unwrap_or("_global");
            let dir = PathBuf::from(config.learning_model_dir.replace("{corpus_id}", corpus));

            let Some(_ticket) = registry.learning.borrow(&dir) else {
                debug!(artifact = %dir.display(), "Learning reranker artifact missing weights");
                return (
                    matches,
                    RerankDebugInfo::skipped(mode, "missing_trained_model"),
                );
            };

            rerank_with_pool(registry, mode, query, matches).await
        }
        RerankerMode::Cloud => rerank_with_cloud(registry, config, query, matches).await,
    }
}

async fn rerank_with_pool(
    registry: &Arc<RerankerRegistry>,
    mode: RerankerMode,
    query: &str,
    matches: Vec<ChunkMatch>,
) -> (Vec<ChunkMatch>, RerankDebugInfo) {
    let Some(pool) = registry.pool.as_ref() else {
        return (matches, RerankDebugInfo::skipped(mode, "local_pool_unavailable"));
    };

    let lease = match pool.checkout().await {
        Ok(lease) => lease,
        Err(err) => {
            let mut info = RerankDebugInfo::passthrough(mode);
            info.ok = false;
            info.error = Some(safe_error_message(&err.to_string()));
            return (matches, info);
        }
    };

    let documents = rerank_documents(&matches);
    match lease.rerank(query, documents).await {
        Ok(results) if !results.is_empty() => {
            let count = matches.len();
            let reordered = apply_rerank_order(
                matches,
                results.into_iter().map(|r| (r.index, r.score)).collect(),
            );
            let mut info = RerankDebugInfo::passthrough(mode);
            info.applied = true;
            info.candidates_reranked = count;
            (reordered, info)
        }
        Ok(_) => {
            debug!("Reranker returned no results; retaining fusion ordering");
            (matches, RerankDebugInfo::skipped(mode, "empty_rerank_response"))
        }
        Err(err) => {
            warn!(error = %err, "Reranking failed; continuing with fusion ordering");
            let mut info = RerankDebugInfo::passthrough(mode);
            info.ok = false;
            info.error = Some(safe_error_message(&err.to_string()));
            (matches, info)
        }
    }
}

#[derive(Deserialize)]
struct CloudRerankResponse {
    results: Vec<CloudRerankResult>,
}

#[derive(Deserialize)]
struct CloudRerankResult {
    index: usize,
    relevance_score: f32,
}

async fn rerank_with_cloud(
    registry: &Arc<RerankerRegistry>,
    config: &RerankingSettings,
    query: &str,
    matches: Vec<ChunkMatch>,
) -> (Vec<ChunkMatch>, RerankDebugInfo) {
    let mode = RerankerMode::Cloud;

    let api_key = std::env::var("COHERE_API_KEY").unwrap_or_default();
    if api_key.trim().is_empty() {
        let mut info = RerankDebugInfo::passthrough(mode);
        info.ok = false;
        info.error = Some("COHERE_API_KEY not set".to_string());
        info.error_message = info.error.clone();
        return (matches, info);
    }

    let documents = rerank_documents(&matches);
    let top_n = documents.len();
    let body = serde_json::json!({
        "model": config.cloud_model,
        "query": query,
        "documents": documents,
        "top_n": top_n,
    });

    let url = format!("{}/v1/rerank", config.cloud_endpoint.trim_end_matches('/'));
    let response = registry
        .http
        .post(&url)
        .bearer_auth(api_key.trim())
        .json(&body)
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(err) => {
            let mut info = RerankDebugInfo::passthrough(mode);
            info.ok = false;
            info.error = Some(safe_error_message(&err.to_string()));
            info.error_message = info.error.clone();
            return (matches, info);
        }
    };

    let trace_id = response
        .headers()
        .get("x-debug-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let mut info = RerankDebugInfo::passthrough(mode);
        info.ok = false;
        info.error = Some(safe_error_message(&format!("HTTP {status}: {body}")));
        info.error_message = summarize_provider_error(&body)
            .or_else(|| info.error.clone());
        info.debug_trace_id = trace_id;
        return (matches, info);
    }

    match response.json::<CloudRerankResponse>().await {
        Ok(parsed) => {
            let count = matches.len();
            let reordered = apply_rerank_order(
                matches,
                parsed
                    .results
                    .into_iter()
                    .map(|r| (r.index, r.relevance_score))
                    .collect(),
            );
            let mut info = RerankDebugInfo::passthrough(mode);
            info.applied = true;
            info.candidates_reranked = count;
            info.debug_trace_id = trace_id;
            (reordered, info)
        }
        Err(err) => {
            let mut info = RerankDebugInfo::passthrough(mode);
            info.ok = false;
            info.error = Some(safe_error_message(&err.to_string()));
            info.error_message = info.error.clone();
            info.debug_trace_id = trace_id;
            (matches, info)
        }
    }
}

fn rerank_documents(matches: &[ChunkMatch]) -> Vec<String> {
    matches
        .iter()
        .map(|m| {
            if m.content.trim().is_empty() {
                m.file_path.clone()
            } else {
                m.content.clone()
            }
        })
        .collect()
}

/// Reorder matches by reranker output; scores replace the fused score.
/// Indices the provider did not return keep their relative fusion order at
/// the tail.
fn apply_rerank_order(matches: Vec<ChunkMatch>, ranked: Vec<(usize, f32)>) -> Vec<ChunkMatch> {
    let mut remaining: Vec<Option<ChunkMatch>> = matches.into_iter().map(Some).collect();
    let mut out = Vec::with_capacity(remaining.len());

    for (index, score) in ranked {
        if let Some(slot) = remaining.get_mut(index) {
            if let Some(mut m) = slot.take() {
                m.score = score;
                out.push(m);
            }
        } else {
            warn!(index, "Reranker returned out-of-range index; skipping");
        }
    }

    for slot in remaining {
        if let Some(m) = slot {
            out.push(m);
        }
    }

    out
}

/// Pull a human-readable `message` out of a provider error body.
fn summarize_provider_error(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
            let trimmed = message.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}
