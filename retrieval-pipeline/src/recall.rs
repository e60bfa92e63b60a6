use chrono::{DateTime, Utc};
use common::config::scoped::{RecallGateSettings, RecallIntensity};
use serde::Serialize;

use crate::{fusion, ChunkMatch};

/// Classification signals extracted from one chat message. Pure string
/// analysis plus conversation state; must stay well under a millisecond.
#[derive(Debug, Clone, Serialize)]
pub struct RecallSignals {
    pub token_count: usize,
    pub is_question: bool,
    pub is_greeting: bool,
    pub is_acknowledgment: bool,
    pub is_follow_up: bool,
    pub is_recall_trigger: bool,
    pub has_definite_article: bool,
    pub is_standalone_question: bool,
    pub conversation_turn: usize,
    pub last_recall_had_results: bool,
    pub rag_corpora_active: bool,
}

/// Per-message retrieval overrides chosen by the gate. Values replace the
/// request-level settings rather than composing with them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecallOverrides {
    pub include_vector: Option<bool>,
    pub include_sparse: Option<bool>,
    pub top_k: Option<usize>,
    pub enable_rerank: Option<bool>,
    pub recency_weight: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecallPlan {
    pub intensity: RecallIntensity,
    pub overrides: RecallOverrides,
    pub signals: RecallSignals,
    pub reason: String,
    pub user_override: bool,
}

const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "yo", "sup", "howdy", "good morning", "good afternoon", "good evening",
    "what's up", "whats up", "greetings",
];

const FAREWELLS_AND_ACKS: &[&str] = &[
    "bye", "goodbye", "see ya", "later", "peace", "cheers", "take care", "thanks", "thanks a lot",
    "thanks so much", "thank you", "ok", "okay", "ok got it", "okay got it", "ok thanks",
    "got it", "sure", "yep", "yeah", "yes", "no", "nah", "nope", "right", "exactly",
    "makes sense", "understood", "perfect", "great", "cool", "nice", "awesome", "sounds good",
    "agreed", "k", "lol", "haha", "lmao", "ty", "thx", "hmm", "ah", "oh",
];

/// Explicit references to past conversation. Strong signal for Recall.
const RECALL_TRIGGERS: &[&str] = &[
    "we discussed", "we talked", "we chatted", "we covered", "we went over", "we decided",
    "you said", "you mentioned", "you suggested", "you told", "you explained", "you recommended",
    "last time", "earlier", "before", "previously", "remember when", "as i mentioned",
    "as we mentioned", "from our", "in our last", "do you recall", "what was that",
    "what did we", "didn't we", "wasn't there", "back when we",
];

const DEFINITE_SHARED_CONTEXT: &[&str] = &[
    "the thing", "the issue", "the problem", "the approach", "the idea", "the plan",
    "the decision", "the conversation", "the discussion", "the point", "the question",
    "the bug", "the change",
];

/// Question openers that typically need no chat history.
const STANDALONE_OPENERS: &[&str] = &[
    "what is", "what's the", "whats the", "how does", "how do i", "explain", "define",
    "what are the", "show me", "can you", "where is", "how to", "what's the difference",
    "whats the difference",
];

const QUESTION_OPENERS: &[&str] = &[
    "what", "where", "how", "why", "when", "who", "which", "is", "are", "do", "does", "can",
    "could", "should", "would", "will", "did",
];

fn normalized(message: &str) -> String {
    message
        .trim()
        .trim_end_matches(['!', '.', '?', ' '])
        .to_lowercase()
}

fn matches_bank_exact(message: &str, bank: &[&str]) -> bool {
    bank.contains(&message)
}

fn contains_any(message: &str, bank: &[&str]) -> bool {
    bank.iter().any(|phrase| message.contains(phrase))
}

fn starts_with_any(message: &str, bank: &[&str]) -> bool {
    bank.iter().any(|phrase| {
        message.starts_with(phrase)
            && message[phrase.len()..]
                .chars()
                .next()
                .map(|c| !c.is_alphanumeric())
                .unwrap_or(true)
    })
}

pub fn extract_recall_signals(
    message: &str,
    conversation_turn: usize,
    last_recall_had_results: bool,
    rag_corpora_active: bool,
) -> RecallSignals {
    let stripped = message.trim();
    let lowered = normalized(message);
    let token_count = stripped.split_whitespace().count();

    let is_question = stripped.contains('?') || starts_with_any(&lowered, QUESTION_OPENERS);
    let is_recall_trigger = contains_any(&lowered, RECALL_TRIGGERS);
    let is_standalone =
        starts_with_any(&lowered, STANDALONE_OPENERS) && !is_recall_trigger;

    RecallSignals {
        token_count,
        is_question,
        is_greeting: matches_bank_exact(&lowered, GREETINGS),
        is_acknowledgment: matches_bank_exact(&lowered, FAREWELLS_AND_ACKS),
        is_follow_up: token_count <= 5 && conversation_turn > 0 && !is_question,
        is_recall_trigger,
        has_definite_article: contains_any(&lowered, DEFINITE_SHARED_CONTEXT),
        is_standalone_question: is_standalone,
        conversation_turn,
        last_recall_had_results,
        rag_corpora_active,
    }
}

/// Decide whether and how to query the Recall corpus for this message.
///
/// This only gates Recall (chat memory); RAG corpora are always queried
/// when requested. Rules are ordered; the first hit wins.
pub fn classify_for_recall(
    message: &str,
    conversation_turn: usize,
    last_recall_had_results: bool,
    rag_corpora_active: bool,
    config: &RecallGateSettings,
    user_override: Option<RecallIntensity>,
) -> RecallPlan {
    let signals = extract_recall_signals(
        message,
        conversation_turn,
        last_recall_had_results,
        rag_corpora_active,
    );

    if !config.enabled {
        return build_plan(
            config.default_intensity,
            signals,
            config,
            "Recall gate disabled; using default intensity.",
            None,
        );
    }

    if let Some(intensity) = user_override {
        let mut plan = build_plan(
            intensity,
            signals,
            config,
            format!("User override: {intensity}"),
            None,
        );
        plan.user_override = true;
        return plan;
    }

    if config.skip_greetings && signals.is_greeting {
        return skip_plan(signals, "Greeting; skipping Recall.");
    }

    if config.skip_greetings && signals.is_acknowledgment {
        return skip_plan(signals, "Acknowledgment; skipping Recall.");
    }

    if config.deep_on_explicit_reference && signals.is_recall_trigger {
        return build_plan(
            RecallIntensity::Deep,
            signals,
            config,
            "Explicit past reference; deep Recall query.",
            Some(config.deep_recency_weight),
        );
    }

    if signals.has_definite_article && signals.conversation_turn > 0 {
        return build_plan(
            RecallIntensity::Standard,
            signals,
            config,
            "Definite article implies shared context; standard Recall.",
            None,
        );
    }

    if config.skip_standalone_questions && signals.is_standalone_question {
        return skip_plan(signals, "Standalone question; skipping Recall.");
    }

    if config.skip_when_rag_active && signals.rag_corpora_active {
        return skip_plan(signals, "RAG corpora active; skipping Recall per config.");
    }

    if config.light_for_short_questions
        && signals.is_question
        && signals.token_count < 10
        && !signals.is_recall_trigger
        && !signals.is_standalone_question
    {
        return build_plan(
            RecallIntensity::Light,
            signals,
            config,
            "Short question; light Recall check.",
            None,
        );
    }

    if signals.token_count <= config.skip_max_tokens && !signals.is_question {
        return build_plan(
            RecallIntensity::Light,
            signals,
            config,
            "Short statement; light Recall check.",
            None,
        );
    }

    if signals.conversation_turn == 0 {
        return build_plan(
            config.default_intensity,
            signals,
            config,
            format!("First message; {} Recall.", config.default_intensity),
            None,
        );
    }

    build_plan(
        config.default_intensity,
        signals,
        config,
        "No specific pattern; default Recall intensity.",
        None,
    )
}

/// Age at which a recall chunk keeps half of its recency credit.
const RECENCY_HALF_LIFE_HOURS: f32 = 72.0;

/// Blend recall scores toward message recency.
///
/// Recall chunks carry an RFC 3339 `timestamp` in their metadata; a chunk's
/// recency credit halves every [`RECENCY_HALF_LIFE_HOURS`]. The blended
/// score is `(1 - weight) * score + weight * recency`. Chunks without a
/// parseable timestamp keep their fused score untouched. Re-sorts with the
/// fusion tie-break, so a zero weight is a no-op.
pub fn apply_recency_weight(matches: &mut [ChunkMatch], weight: f32, now: DateTime<Utc>) {
    let weight = weight.clamp(0.0, 1.0);
    if weight <= 0.0 || matches.is_empty() {
        return;
    }

    for m in matches.iter_mut() {
        let Some(timestamp) = m
            .metadata
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        else {
            continue;
        };

        let age_hours = (now - timestamp.with_timezone(&Utc))
            .num_seconds()
            .max(0) as f32
            / 3600.0;
        let recency = 0.5f32.powf(age_hours / RECENCY_HALF_LIFE_HOURS);
        m.score = (1.0 - weight) * m.score + weight * recency;
    }

    fusion::sort_fused(matches);
}

fn skip_plan(signals: RecallSignals, reason: &str) -> RecallPlan {
    RecallPlan {
        intensity: RecallIntensity::Skip,
        overrides: RecallOverrides::default(),
        signals,
        reason: reason.to_string(),
        user_override: false,
    }
}

fn build_plan(
    intensity: RecallIntensity,
    signals: RecallSignals,
    config: &RecallGateSettings,
    reason: impl Into<String>,
    recency_override: Option<f32>,
) -> RecallPlan {
    let mut overrides = RecallOverrides::default();

    match intensity {
        RecallIntensity::Skip => {}
        RecallIntensity::Light => {
            overrides.include_vector = Some(false);
            overrides.include_sparse = Some(true);
            overrides.top_k = Some(config.light_top_k);
            overrides.enable_rerank = Some(false);
            overrides.recency_weight = Some(config.standard_recency_weight);
        }
        RecallIntensity::Standard => {
            overrides.top_k = Some(config.standard_top_k);
            overrides.recency_weight =
                Some(recency_override.unwrap_or(config.standard_recency_weight));
        }
        RecallIntensity::Deep => {
            overrides.top_k = Some(config.deep_top_k);
            overrides.recency_weight = Some(recency_override.unwrap_or(config.deep_recency_weight));
            overrides.enable_rerank = Some(true);
        }
    }

    RecallPlan {
        intensity,
        overrides,
        signals,
        reason: reason.into(),
        user_override: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(message: &str, turn: usize) -> RecallPlan {
        classify_for_recall(message, turn, true, true, &RecallGateSettings::default(), None)
    }

    #[test]
    fn greetings_and_acknowledgments_skip() {
        for message in ["hi", "hello!", "thanks", "ok got it", "lol"] {
            let plan = gate(message, 3);
            assert_eq!(plan.intensity, RecallIntensity::Skip, "message: {message}");
        }
    }

    #[test]
    fn standalone_questions_skip() {
        for message in [
            "what's the auth flow?",
            "how does chunking work?",
            "explain the retrieval pipeline",
            "where is the config file?",
        ] {
            let plan = gate(message, 1);
            assert_eq!(plan.intensity, RecallIntensity::Skip, "message: {message}");
        }
    }

    #[test]
    fn explicit_references_go_deep_with_deep_recency() {
        let config = RecallGateSettings::default();
        for message in [
            "what did we discuss about auth?",
            "you mentioned a better approach",
            "as we talked about earlier",
            "remember when we decided on chunking?",
            "what was that thing you suggested?",
        ] {
            let plan = gate(message, 5);
            assert_eq!(plan.intensity, RecallIntensity::Deep, "message: {message}");
            assert_eq!(
                plan.overrides.recency_weight,
                Some(config.deep_recency_weight),
                "message: {message}"
            );
            assert_eq!(plan.overrides.top_k, Some(config.deep_top_k));
        }
    }

    #[test]
    fn definite_articles_imply_standard() {
        for message in ["the bug", "the approach", "the issue we found"] {
            let plan = gate(message, 3);
            assert_eq!(plan.intensity, RecallIntensity::Standard, "message: {message}");
        }
    }

    #[test]
    fn short_questions_go_light_with_sparse_only() {
        let plan = gate("did tests pass?", 2);
        assert_eq!(plan.intensity, RecallIntensity::Light);
        assert_eq!(plan.overrides.include_vector, Some(false));
        assert_eq!(plan.overrides.include_sparse, Some(true));
        assert_eq!(plan.overrides.enable_rerank, Some(false));
    }

    #[test]
    fn disabled_gate_uses_default_intensity() {
        let mut config = RecallGateSettings::default();
        config.enabled = false;

        let plan = classify_for_recall("hi", 3, true, true, &config, None);
        assert_eq!(plan.intensity, config.default_intensity);
    }

    #[test]
    fn user_override_wins_over_rules() {
        let plan = classify_for_recall(
            "hi",
            3,
            true,
            true,
            &RecallGateSettings::default(),
            Some(RecallIntensity::Deep),
        );
        assert_eq!(plan.intensity, RecallIntensity::Deep);
        assert!(plan.user_override);
    }

    #[test]
    fn first_message_gets_default_intensity() {
        let config = RecallGateSettings::default();
        let plan = classify_for_recall(
            "walk me through the token rotation design tradeoffs in detail please",
            0,
            false,
            false,
            &config,
            None,
        );
        assert_eq!(plan.intensity, config.default_intensity);
    }

    #[test]
    fn signals_count_tokens_and_questions() {
        let signals = extract_recall_signals("what did we discuss about auth?", 3, true, true);
        assert!(signals.is_question);
        assert!(signals.is_recall_trigger);
        assert_eq!(signals.token_count, 6);
    }

    fn recall_match(id: &str, score: f32, timestamp: Option<&str>) -> ChunkMatch {
        let mut m = ChunkMatch::skeletal(
            id.to_string(),
            "recall".to_string(),
            score,
            crate::MatchSource::Fused,
        );
        if let Some(timestamp) = timestamp {
            m.meta_insert("timestamp", serde_json::json!(timestamp));
        }
        m
    }

    #[test]
    fn recency_weight_lifts_newer_chunks_over_older_ones() {
        let now = DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
            .expect("parse now")
            .with_timezone(&Utc);

        let mut matches = vec![
            recall_match("old", 0.5, Some("2026-07-01T12:00:00Z")),
            recall_match("new", 0.5, Some("2026-08-01T11:00:00Z")),
        ];

        apply_recency_weight(&mut matches, 0.6, now);
        assert_eq!(matches[0].chunk_id, "new");
        assert!(matches[0].score > matches[1].score);
    }

    #[test]
    fn zero_recency_weight_is_a_no_op() {
        let now = DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
            .expect("parse now")
            .with_timezone(&Utc);

        let mut matches = vec![
            recall_match("a", 0.9, Some("2026-07-01T12:00:00Z")),
            recall_match("b", 0.4, Some("2026-08-01T11:00:00Z")),
        ];

        apply_recency_weight(&mut matches, 0.0, now);
        assert_eq!(matches[0].chunk_id, "a");
        assert!((matches[0].score - 0.9).abs() < 1e-6);
        assert!((matches[1].score - 0.4).abs() < 1e-6);
    }

    #[test]
    fn chunks_without_timestamps_keep_their_score() {
        let now = DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
            .expect("parse now")
            .with_timezone(&Utc);

        let mut matches = vec![
            recall_match("untimed", 0.8, None),
            recall_match("timed", 0.8, Some("2026-08-01T11:00:00Z")),
        ];

        apply_recency_weight(&mut matches, 0.5, now);
        let untimed = matches
            .iter()
            .find(|m| m.chunk_id == "untimed")
            .expect("untimed match");
        assert!((untimed.score - 0.8).abs() < 1e-6);
    }
}
