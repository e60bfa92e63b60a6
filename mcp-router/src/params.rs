//! MCP tool parameter types.
//!
//! Input schemas are generated with `schemars`, as the MCP protocol
//! requires.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Leg selection shorthand exposed to MCP clients.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    #[default]
    Tribrid,
    DenseOnly,
    SparseOnly,
    GraphOnly,
}

impl SearchMode {
    /// Map the mode onto (vector, sparse, graph) leg flags.
    pub fn leg_flags(self) -> (bool, bool, bool) {
        match self {
            Self::Tribrid => (true, true, true),
            Self::DenseOnly => (true, false, false),
            Self::SparseOnly => (false, true, false),
            Self::GraphOnly => (false, false, true),
        }
    }
}

/// Parameters for the `search` tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SearchParams {
    /// Natural-language query.
    pub query: String,

    /// Corpus to search.
    pub corpus_id: String,

    /// Leg selection; defaults to all three legs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SearchMode>,

    /// Result cap override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
}

/// Parameters for the `answer` tool. Same shape as `search`; the answer is
/// composed from the retrieved chunks.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AnswerParams {
    /// Natural-language question.
    pub query: String,

    /// Corpus to answer from.
    pub corpus_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SearchMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_map_to_leg_flags() {
        assert_eq!(SearchMode::Tribrid.leg_flags(), (true, true, true));
        assert_eq!(SearchMode::DenseOnly.leg_flags(), (true, false, false));
        assert_eq!(SearchMode::SparseOnly.leg_flags(), (false, true, false));
        assert_eq!(SearchMode::GraphOnly.leg_flags(), (false, false, true));
    }

    #[test]
    fn mode_names_use_snake_case() {
        let mode: SearchMode = serde_json::from_str("\"dense_only\"").expect("parse");
        assert_eq!(mode, SearchMode::DenseOnly);
    }
}
