use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Tunable parameters for the retrieval fan-out and fusion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalSettings {
    /// RRF rank smoothing constant (higher = more weight to top ranks).
    pub rrf_k: u32,
    /// Default top-k for search results.
    pub final_k: usize,
    pub topk_dense: usize,
    pub topk_sparse: usize,
    pub similarity_threshold: f32,
    pub bm25_weight: f32,
    pub vector_weight: f32,
    pub bm25_k1: f32,
    pub bm25_b: f32,
    pub query_expansion_enabled: bool,
    pub multi_query_m: usize,
    pub hydration_mode: HydrationMode,
    pub hydration_max_chars: usize,
    pub conf_top1: f32,
    pub conf_avg5: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            rrf_k: 60,
            final_k: 10,
            topk_dense: 75,
            topk_sparse: 75,
            similarity_threshold: 0.0,
            bm25_weight: 0.3,
            vector_weight: 0.7,
            bm25_k1: 1.2,
            bm25_b: 0.4,
            query_expansion_enabled: true,
            multi_query_m: 4,
            hydration_mode: HydrationMode::Lazy,
            hydration_max_chars: 2000,
            conf_top1: 0.62,
            conf_avg5: 0.55,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HydrationMode {
    #[default]
    Lazy,
    Eager,
    /// `off` is a legacy alias kept for older persisted documents.
    #[serde(alias = "off")]
    None,
}

impl fmt::Display for HydrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lazy => "lazy",
            Self::Eager => "eager",
            Self::None => "none",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VendorMode {
    #[default]
    PreferFirstParty,
    PreferVendor,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringSettings {
    /// Score multiplier when the filename exactly matches the query terms.
    pub filename_boost_exact: f32,
    /// Score multiplier when any path component matches a query term.
    pub filename_boost_partial: f32,
    pub vendor_mode: VendorMode,
    pub path_boosts: Vec<String>,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            filename_boost_exact: 1.5,
            filename_boost_partial: 1.2,
            vendor_mode: VendorMode::PreferFirstParty,
            path_boosts: vec![
                "/gui".to_string(),
                "/server".to_string(),
                "/indexer".to_string(),
                "/retrieval".to_string(),
            ],
        }
    }
}

/// Layer-aware bonuses. Base bonuses are additive percentages and are
/// converted downstream into multiplicative factors (`1 + bonus`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LayerBonusSettings {
    pub gui: f32,
    pub retrieval: f32,
    pub indexer: f32,
    pub vendor_penalty: f32,
    pub path_boost: f32,
    pub intent_matrix: HashMap<String, HashMap<String, f32>>,
}

impl Default for LayerBonusSettings {
    fn default() -> Self {
        Self {
            gui: 0.15,
            retrieval: 0.15,
            indexer: 0.15,
            vendor_penalty: -0.1,
            path_boost: 0.1,
            intent_matrix: default_intent_matrix(),
        }
    }
}

fn default_intent_matrix() -> HashMap<String, HashMap<String, f32>> {
    fn row(pairs: &[(&str, f32)]) -> HashMap<String, f32> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    let mut matrix = HashMap::new();
    matrix.insert(
        "gui".to_string(),
        row(&[("gui", 1.2), ("web", 1.2), ("server", 0.9), ("retrieval", 0.8), ("indexer", 0.8)]),
    );
    matrix.insert(
        "retrieval".to_string(),
        row(&[("retrieval", 1.3), ("server", 1.15), ("common", 1.1), ("web", 0.7), ("gui", 0.6)]),
    );
    matrix.insert(
        "indexer".to_string(),
        row(&[("indexer", 1.3), ("retrieval", 1.15), ("common", 1.1), ("web", 0.7), ("gui", 0.6)]),
    );
    matrix.insert(
        "eval".to_string(),
        row(&[("eval", 1.3), ("retrieval", 1.15), ("server", 1.1), ("web", 0.8), ("gui", 0.7)]),
    );
    matrix.insert(
        "infra".to_string(),
        row(&[("infra", 1.3), ("scripts", 1.15), ("server", 1.1), ("web", 0.9)]),
    );
    matrix.insert(
        "server".to_string(),
        row(&[("server", 1.3), ("retrieval", 1.15), ("common", 1.1), ("web", 0.7), ("gui", 0.6)]),
    );
    matrix
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FusionMethod {
    #[default]
    Rrf,
    Weighted,
}

impl fmt::Display for FusionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rrf => "rrf",
            Self::Weighted => "weighted",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FusionSettings {
    pub method: FusionMethod,
    /// Leg weights for the weighted method; ignored under RRF.
    pub vector_weight: f32,
    pub sparse_weight: f32,
    pub graph_weight: f32,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            method: FusionMethod::Rrf,
            vector_weight: 0.5,
            sparse_weight: 0.3,
            graph_weight: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VectorLegSettings {
    pub enabled: bool,
}

impl Default for VectorLegSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerMode {
    Whitespace,
    Lowercase,
    #[default]
    Stemmer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SparseLegSettings {
    pub enabled: bool,
    /// Distinct tokens used by the relaxed OR fallback.
    pub max_terms: usize,
    pub tokenizer: TokenizerMode,
}

impl Default for SparseLegSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_terms: 8,
            tokenizer: TokenizerMode::Stemmer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphLegSettings {
    pub enabled: bool,
    pub max_hops: u32,
    pub top_k: usize,
    pub base_boost: f32,
    /// Per-hop score decay, in (0, 1].
    pub hop_decay: f32,
    pub direct_match_boost: f32,
    pub ast_contains_weight: f32,
    pub ast_inherits_weight: f32,
    pub ast_imports_weight: f32,
    pub ast_calls_weight: f32,
}

impl Default for GraphLegSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_hops: 2,
            top_k: 25,
            base_boost: 1.0,
            hop_decay: 0.7,
            direct_match_boost: 1.25,
            ast_contains_weight: 1.0,
            ast_inherits_weight: 0.9,
            ast_imports_weight: 0.7,
            ast_calls_weight: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RerankerMode {
    #[default]
    None,
    Local,
    Learning,
    Cloud,
}

impl fmt::Display for RerankerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Local => "local",
            Self::Learning => "learning",
            Self::Cloud => "cloud",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RerankingSettings {
    pub reranker_mode: RerankerMode,
    /// Candidate pool handed to the reranker; typically 2-4x final_k.
    pub tribrid_reranker_topn: usize,
    /// Directory holding a fine-tuned cross-encoder artifact. `{corpus_id}`
    /// is substituted before resolution.
    pub learning_model_dir: String,
    pub cloud_endpoint: String,
    pub cloud_model: String,
    /// Unload an idle learning artifact after this many seconds.
    pub idle_unload_secs: u64,
}

impl Default for RerankingSettings {
    fn default() -> Self {
        Self {
            reranker_mode: RerankerMode::None,
            tribrid_reranker_topn: 30,
            learning_model_dir: "data/reranker/{corpus_id}".to_string(),
            cloud_endpoint: "https://api.cohere.com".to_string(),
            cloud_model: "rerank-v3.5".to_string(),
            idle_unload_secs: 900,
        }
    }
}

/// Read-side view of the chunking parameters; the core validates the
/// invariant but never chunks anything itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OpenRouterSettings {
    pub enabled: bool,
    pub base_url: String,
    pub default_model: String,
}

impl Default for OpenRouterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://openrouter.ai/api/v1".to_string(),
            default_model: "openai/gpt-4o-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalProviderSettings {
    pub name: String,
    pub base_url: String,
    pub priority: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecallIntensity {
    Skip,
    Light,
    #[default]
    Standard,
    Deep,
}

impl fmt::Display for RecallIntensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Skip => "skip",
            Self::Light => "light",
            Self::Standard => "standard",
            Self::Deep => "deep",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecallGateSettings {
    pub enabled: bool,
    pub default_intensity: RecallIntensity,
    pub skip_greetings: bool,
    pub skip_standalone_questions: bool,
    pub skip_when_rag_active: bool,
    pub deep_on_explicit_reference: bool,
    pub light_for_short_questions: bool,
    pub skip_max_tokens: usize,
    pub light_top_k: usize,
    pub standard_top_k: usize,
    pub deep_top_k: usize,
    pub standard_recency_weight: f32,
    pub deep_recency_weight: f32,
}

impl Default for RecallGateSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_intensity: RecallIntensity::Standard,
            skip_greetings: true,
            skip_standalone_questions: true,
            skip_when_rag_active: false,
            deep_on_explicit_reference: true,
            light_for_short_questions: true,
            skip_max_tokens: 3,
            light_top_k: 3,
            standard_top_k: 5,
            deep_top_k: 10,
            standard_recency_weight: 0.3,
            deep_recency_weight: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatSettings {
    pub system_prompt_direct: String,
    pub system_prompt_rag: String,
    pub system_prompt_recall: String,
    pub system_prompt_rag_and_recall: String,
    pub temperature: f32,
    pub temperature_no_retrieval: f32,
    pub max_tokens: u32,
    pub stream_timeout_secs: u64,
    pub openrouter: OpenRouterSettings,
    pub local_providers: Vec<LocalProviderSettings>,
    pub default_local_model: String,
    pub recall_gate: RecallGateSettings,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            system_prompt_direct: "You are a helpful assistant.".to_string(),
            system_prompt_rag: "You are a code assistant. Answer from the \
                provided <rag_context> and cite sources as path:line."
                .to_string(),
            system_prompt_recall: "You are a helpful assistant with access to \
                prior conversation snippets in <recall_context>."
                .to_string(),
            system_prompt_rag_and_recall: "You are a code assistant. Use \
                <rag_context> for code facts and <recall_context> for \
                conversational continuity; cite code sources as path:line."
                .to_string(),
            temperature: 0.2,
            temperature_no_retrieval: 0.7,
            max_tokens: 1024,
            stream_timeout_secs: 120,
            openrouter: OpenRouterSettings::default(),
            local_providers: Vec::new(),
            default_local_model: "llama3.1".to_string(),
            recall_gate: RecallGateSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationSettings {
    pub gen_temperature: f32,
    pub gen_top_p: f32,
    pub gen_max_tokens: u32,
    pub openai_base_url: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            gen_temperature: 0.2,
            gen_top_p: 1.0,
            gen_max_tokens: 1024,
            openai_base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub embedding_model: String,
    pub embedding_dim: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dim: 1536,
        }
    }
}

/// The per-corpus configuration document. A global instance acts as the
/// fallback template; per-corpus overrides are persisted as JSON and pass
/// through [`ScopedConfig::validated`] on every load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ScopedConfig {
    pub retrieval: RetrievalSettings,
    pub scoring: ScoringSettings,
    pub layer_bonuses: LayerBonusSettings,
    pub fusion: FusionSettings,
    pub vector: VectorLegSettings,
    pub sparse: SparseLegSettings,
    pub graph: GraphLegSettings,
    pub reranking: RerankingSettings,
    pub chunking: ChunkingSettings,
    pub chat: ChatSettings,
    pub generation: GenerationSettings,
    pub embedding: EmbeddingSettings,
}

/// Traversal depth accepted from config before the leg refuses to expand.
pub const MAX_GRAPH_HOPS: u32 = 5;

impl ScopedConfig {
    /// Normalize soft invariants and reject hard ones.
    ///
    /// Weight drift never fails the load; structural violations (overlap >=
    /// size, inverted filename boosts) do.
    pub fn validated(mut self) -> Result<Self, AppError> {
        let total = self.retrieval.bm25_weight + self.retrieval.vector_weight;
        if total <= 0.0 {
            self.retrieval.bm25_weight = 0.3;
            self.retrieval.vector_weight = 0.7;
        } else if !(0.99..=1.01).contains(&total) {
            self.retrieval.bm25_weight = (self.retrieval.bm25_weight / total).clamp(0.0, 1.0);
            self.retrieval.vector_weight = (self.retrieval.vector_weight / total).clamp(0.0, 1.0);
        }

        self.retrieval.rrf_k = self.retrieval.rrf_k.clamp(1, 200);
        self.retrieval.final_k = self.retrieval.final_k.clamp(1, 100);
        self.graph.hop_decay = self.graph.hop_decay.clamp(f32::EPSILON, 1.0);
        self.graph.max_hops = self.graph.max_hops.min(MAX_GRAPH_HOPS);
        self.reranking.tribrid_reranker_topn = self.reranking.tribrid_reranker_topn.max(1);

        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(AppError::Validation(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            )));
        }

        if self.scoring.filename_boost_exact < self.scoring.filename_boost_partial {
            return Err(AppError::Validation(
                "filename_boost_exact must be at least filename_boost_partial".to_string(),
            ));
        }
        if self.scoring.filename_boost_partial < 1.0 {
            return Err(AppError::Validation(
                "filename boosts must be multiplicative factors >= 1".to_string(),
            ));
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_normalize_to_sum_one() {
        let mut cfg = ScopedConfig::default();
        cfg.retrieval.bm25_weight = 0.6;
        cfg.retrieval.vector_weight = 0.6;

        let cfg = cfg.validated().expect("validation should pass");
        let total = cfg.retrieval.bm25_weight + cfg.retrieval.vector_weight;
        assert!((total - 1.0).abs() < 1e-5, "weights should sum to 1, got {total}");
        assert!((cfg.retrieval.bm25_weight - 0.5).abs() < 1e-5);
    }

    #[test]
    fn zero_weights_reset_to_defaults() {
        let mut cfg = ScopedConfig::default();
        cfg.retrieval.bm25_weight = 0.0;
        cfg.retrieval.vector_weight = 0.0;

        let cfg = cfg.validated().expect("validation should pass");
        assert!((cfg.retrieval.bm25_weight - 0.3).abs() < 1e-6);
        assert!((cfg.retrieval.vector_weight - 0.7).abs() < 1e-6);
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let mut cfg = ScopedConfig::default();
        cfg.chunking.chunk_size = 100;
        cfg.chunking.chunk_overlap = 100;

        assert!(matches!(cfg.validated(), Err(AppError::Validation(_))));
    }

    #[test]
    fn rrf_k_and_final_k_are_clamped() {
        let mut cfg = ScopedConfig::default();
        cfg.retrieval.rrf_k = 4000;
        cfg.retrieval.final_k = 0;

        let cfg = cfg.validated().expect("validation should pass");
        assert_eq!(cfg.retrieval.rrf_k, 200);
        assert_eq!(cfg.retrieval.final_k, 1);
    }

    #[test]
    fn exact_boost_below_partial_boost_is_rejected() {
        let mut cfg = ScopedConfig::default();
        cfg.scoring.filename_boost_exact = 1.1;
        cfg.scoring.filename_boost_partial = 1.2;

        assert!(matches!(cfg.validated(), Err(AppError::Validation(_))));
    }

    #[test]
    fn equal_filename_boosts_are_valid() {
        let mut cfg = ScopedConfig::default();
        cfg.scoring.filename_boost_exact = 1.5;
        cfg.scoring.filename_boost_partial = 1.5;

        let cfg = cfg.validated().expect("equal boosts satisfy exact >= partial >= 1");
        assert!((cfg.scoring.filename_boost_exact - 1.5).abs() < 1e-6);
    }

    #[test]
    fn hydration_mode_accepts_off_alias() {
        let cfg: RetrievalSettings =
            serde_json::from_str(r#"{"hydration_mode": "off"}"#).expect("parse settings");
        assert_eq!(cfg.hydration_mode, HydrationMode::None);
    }

    #[test]
    fn documents_round_trip_through_json() {
        let cfg = ScopedConfig::default();
        let json = serde_json::to_value(&cfg).expect("serialize");
        let back: ScopedConfig = serde_json::from_value(json).expect("deserialize");
        assert_eq!(cfg, back);
    }
}
