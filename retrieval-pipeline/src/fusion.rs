use std::collections::HashMap;

use common::config::scoped::{LayerBonusSettings, ScoringSettings, VendorMode};

use crate::{ChunkMatch, MatchSource, QueryIntent};

/// Reciprocal Rank Fusion: each leg contributes `1 / (k + rank)` for the
/// chunk at 1-indexed `rank`. Deterministic; ties break by ascending
/// chunk id.
pub fn rrf_fuse(lists: &[Vec<ChunkMatch>], k: u32) -> Vec<ChunkMatch> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    let mut payloads: HashMap<String, ChunkMatch> = HashMap::new();

    for list in lists {
        for (index, m) in list.iter().enumerate() {
            let rank = index as f32 + 1.0;
            *scores.entry(m.chunk_id.clone()).or_insert(0.0) += 1.0 / (k as f32 + rank);
            merge_payload(&mut payloads, m);
        }
    }

    assemble(scores, payloads)
}

/// Weighted fusion over min-max normalized leg scores. A chunk missing from
/// a leg contributes zero for that leg.
pub fn weighted_fuse(lists: &[Vec<ChunkMatch>], weights: &[f32]) -> Vec<ChunkMatch> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    let mut payloads: HashMap<String, ChunkMatch> = HashMap::new();

    for (list, weight) in lists.iter().zip(weights.iter()) {
        let raw: Vec<f32> = list.iter().map(|m| m.score).collect();
        let normalized = min_max_normalize(&raw);

        for (m, norm) in list.iter().zip(normalized.into_iter()) {
            *scores.entry(m.chunk_id.clone()).or_insert(0.0) += weight * norm;
            merge_payload(&mut payloads, m);
        }
    }

    assemble(scores, payloads)
}

fn merge_payload(payloads: &mut HashMap<String, ChunkMatch>, incoming: &ChunkMatch) {
    match payloads.get_mut(&incoming.chunk_id) {
        Some(existing) => {
            // First leg wins the body; later legs fill missing annotations
            // and content a skeletal match did not carry.
            if existing.content.is_empty() && !incoming.content.is_empty() {
                existing.content = incoming.content.clone();
                existing.file_path = incoming.file_path.clone();
                existing.start_line = incoming.start_line;
                existing.end_line = incoming.end_line;
                existing.language = incoming.language.clone();
            }
            for (key, value) in &incoming.metadata {
                existing
                    .metadata
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }
        None => {
            payloads.insert(incoming.chunk_id.clone(), incoming.clone());
        }
    }
}

fn assemble(scores: HashMap<String, f32>, mut payloads: HashMap<String, ChunkMatch>) -> Vec<ChunkMatch> {
    let mut fused: Vec<ChunkMatch> = scores
        .into_iter()
        .filter_map(|(chunk_id, score)| {
            payloads.remove(&chunk_id).map(|mut m| {
                m.score = score;
                m.source = MatchSource::Fused;
                m
            })
        })
        .collect();

    sort_fused(&mut fused);
    fused
}

pub fn sort_fused(matches: &mut [ChunkMatch]) {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }

    let mut min = f32::MAX;
    let mut max = f32::MIN;

    for s in scores {
        if !s.is_finite() {
            continue;
        }
        if *s < min {
            min = *s;
        }
        if *s > max {
            max = *s;
        }
    }

    if !min.is_finite() || !max.is_finite() {
        return scores.iter().map(|_| 0.0).collect();
    }

    if (max - min).abs() < f32::EPSILON {
        return vec![1.0; scores.len()];
    }

    scores
        .iter()
        .map(|score| {
            if score.is_finite() {
                ((score - min) / (max - min)).clamp(0.0, 1.0)
            } else {
                0.0
            }
        })
        .collect()
}

/// Apply the (intent x layer) matrix, path boosts, and vendor handling.
/// Additive bonuses become multiplicative factors via `1 + bonus`.
pub fn apply_layer_bonuses(
    matches: &mut Vec<ChunkMatch>,
    intent: Option<QueryIntent>,
    scoring: &ScoringSettings,
    bonuses: &LayerBonusSettings,
) {
    if matches.is_empty() {
        return;
    }

    for m in matches.iter_mut() {
        if m.file_path.is_empty() {
            continue;
        }

        let layer = layer_of(&m.file_path);
        let mut factor = intent_factor(intent, layer, bonuses);

        if scoring
            .path_boosts
            .iter()
            .any(|prefix| path_has_prefix(&m.file_path, prefix))
        {
            factor *= 1.0 + bonuses.path_boost;
        }

        if is_vendor_path(&m.file_path) {
            match scoring.vendor_mode {
                VendorMode::PreferFirstParty => factor *= 1.0 + bonuses.vendor_penalty,
                VendorMode::PreferVendor => factor *= 1.0 - bonuses.vendor_penalty,
                VendorMode::Neutral => {}
            }
        }

        m.score *= factor.max(0.0);
    }

    sort_fused(matches);
}

fn intent_factor(intent: Option<QueryIntent>, layer: &str, bonuses: &LayerBonusSettings) -> f32 {
    if let Some(intent) = intent {
        if let Some(row) = bonuses.intent_matrix.get(intent.as_str()) {
            if let Some(factor) = row.get(layer) {
                return *factor;
            }
        }
        return 1.0;
    }

    // Without an intent, fall back to the flat per-layer bonuses.
    match layer {
        "gui" | "web" => 1.0 + bonuses.gui,
        "retrieval" => 1.0 + bonuses.retrieval,
        "indexer" => 1.0 + bonuses.indexer,
        _ => 1.0,
    }
}

const KNOWN_LAYERS: &[&str] = &[
    "gui", "web", "server", "retrieval", "indexer", "common", "eval", "infra", "scripts",
];

/// First known layer name among the path components, else the first
/// component itself.
fn layer_of(file_path: &str) -> &str {
    let mut first = "";
    for component in file_path.trim_start_matches('/').split('/') {
        if component.is_empty() {
            continue;
        }
        if first.is_empty() {
            first = component;
        }
        if KNOWN_LAYERS.contains(&component) {
            return component;
        }
    }
    first
}

fn path_has_prefix(file_path: &str, prefix: &str) -> bool {
    let normalized = prefix.trim_start_matches('/');
    file_path
        .trim_start_matches('/')
        .split('/')
        .next()
        .map(|head| head == normalized)
        .unwrap_or(false)
        || file_path.contains(prefix)
}

fn is_vendor_path(file_path: &str) -> bool {
    file_path
        .split('/')
        .any(|c| matches!(c, "vendor" | "node_modules" | "third_party"))
}
