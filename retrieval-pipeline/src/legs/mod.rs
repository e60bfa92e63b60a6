pub mod graph;
pub mod sparse;
pub mod vector;

/// Tokenize a query for lexical matching: lowercase alphanumeric runs, short
/// noise dropped, order-preserving dedup.
pub fn query_tokens(query: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut tokens = Vec::new();

    for raw in query.split(|c: char| !c.is_alphanumeric() && c != '_') {
        let token = raw.trim_matches('_').to_lowercase();
        if token.len() < 2 || STOPWORDS.contains(&token.as_str()) {
            continue;
        }
        if seen.insert(token.clone()) {
            tokens.push(token);
        }
    }

    tokens
}

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "of", "to", "in", "on", "for",
    "and", "or", "at", "by", "with", "from", "as", "it", "this", "that", "these", "those", "i",
    "we", "you", "they", "do", "does", "did", "where", "what", "when", "how", "why", "which",
    "who", "can", "could", "should", "would",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_drop_stopwords_and_dedup() {
        let tokens = query_tokens("Where is the authentication flow and the authentication code?");
        assert_eq!(tokens, vec!["authentication", "flow", "code"]);
    }

    #[test]
    fn tokens_keep_identifier_underscores_split() {
        let tokens = query_tokens("login_controller refresh");
        assert_eq!(tokens, vec!["login_controller", "refresh"]);
    }
}
