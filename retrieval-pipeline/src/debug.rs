use common::config::scoped::{FusionMethod, RerankerMode};
use common::config::ScopedConfig;
use serde::Serialize;

use crate::ChunkMatch;

/// Structured telemetry attached to every retrieval response.
#[derive(Debug, Clone, Serialize)]
pub struct FusionDebug {
    pub vector_attempted: bool,
    pub vector_enabled: bool,
    pub vector_error: Option<String>,
    pub vector_results: usize,

    pub sparse_attempted: bool,
    pub sparse_enabled: bool,
    pub sparse_error: Option<String>,
    pub sparse_results: usize,

    pub graph_attempted: bool,
    pub graph_enabled: bool,
    pub graph_error: Option<String>,
    pub graph_entity_hits: usize,
    pub graph_hydrated_chunks: usize,

    pub fusion_method: FusionMethod,
    pub final_k_used: usize,
    pub final_results: usize,

    pub top1_score: Option<f32>,
    pub avg5_score: Option<f32>,
    pub confidence: Option<f32>,
    pub conf_top1_thresh: f32,
    pub conf_avg5_thresh: f32,

    pub hydration_error: Option<String>,
    pub rerank: Option<RerankDebugInfo>,
}

impl FusionDebug {
    pub fn new(method: FusionMethod, final_k: usize) -> Self {
        Self {
            vector_attempted: false,
            vector_enabled: false,
            vector_error: None,
            vector_results: 0,
            sparse_attempted: false,
            sparse_enabled: false,
            sparse_error: None,
            sparse_results: 0,
            graph_attempted: false,
            graph_enabled: false,
            graph_error: None,
            graph_entity_hits: 0,
            graph_hydrated_chunks: 0,
            fusion_method: method,
            final_k_used: final_k,
            final_results: 0,
            top1_score: None,
            avg5_score: None,
            confidence: None,
            conf_top1_thresh: 0.0,
            conf_avg5_thresh: 0.0,
            hydration_error: None,
            rerank: None,
        }
    }

    /// Fill the result-shape fields once the final list is known.
    pub fn finalize(&mut self, matches: &[ChunkMatch], config: &ScopedConfig) {
        self.final_results = matches.len();
        self.conf_top1_thresh = config.retrieval.conf_top1;
        self.conf_avg5_thresh = config.retrieval.conf_avg5;

        self.top1_score = matches.first().map(|m| m.score);
        if !matches.is_empty() {
            let top5: Vec<f32> = matches.iter().take(5).map(|m| m.score).collect();
            self.avg5_score = Some(top5.iter().sum::<f32>() / top5.len() as f32);
        }

        self.confidence = self.compute_confidence(config);
    }

    /// Normalize the top-1 fused score into [0, 1].
    ///
    /// Under RRF the best achievable score is `legs_used / (k + 1)` (rank 1
    /// in every contributing leg); weighted scores are already unit-scaled.
    fn compute_confidence(&self, config: &ScopedConfig) -> Option<f32> {
        let top1 = self.top1_score?;
        match self.fusion_method {
            FusionMethod::Rrf => {
                let legs_used = usize::from(self.vector_results > 0)
                    + usize::from(self.sparse_results > 0)
                    + usize::from(self.graph_hydrated_chunks > 0);
                if legs_used == 0 {
                    return None;
                }
                let denom = legs_used as f32 / (config.retrieval.rrf_k as f32 + 1.0);
                if denom <= 0.0 {
                    return None;
                }
                Some((top1 / denom).clamp(0.0, 1.0))
            }
            FusionMethod::Weighted => Some(top1.clamp(0.0, 1.0)),
        }
    }
}

/// Reranker status. Never an error channel: the reranker preserves fusion
/// order on failure and reports what happened here.
#[derive(Debug, Clone, Serialize)]
pub struct RerankDebugInfo {
    pub enabled: bool,
    pub mode: RerankerMode,
    pub ok: bool,
    pub applied: bool,
    pub candidates_reranked: usize,
    pub skipped_reason: Option<String>,
    pub error: Option<String>,
    pub error_message: Option<String>,
    pub debug_trace_id: Option<String>,
}

impl RerankDebugInfo {
    pub fn passthrough(mode: RerankerMode) -> Self {
        Self {
            enabled: mode != RerankerMode::None,
            mode,
            ok: true,
            applied: false,
            candidates_reranked: 0,
            skipped_reason: None,
            error: None,
            error_message: None,
            debug_trace_id: None,
        }
    }

    pub fn skipped(mode: RerankerMode, reason: impl Into<String>) -> Self {
        let mut info = Self::passthrough(mode);
        info.skipped_reason = Some(reason.into());
        info
    }
}
