use common::config::scoped::ChatSettings;
use retrieval_pipeline::ChunkMatch;

/// Format retrieval results into the structured context block handed to the
/// model: `<rag_context>` for code/doc chunks, `<recall_context>` for chat
/// memory snippets.
pub fn format_context(rag_chunks: &[ChunkMatch], recall_chunks: &[ChunkMatch]) -> String {
    let mut sections: Vec<String> = Vec::new();

    if !rag_chunks.is_empty() {
        let mut lines: Vec<String> = vec!["<rag_context>".to_string()];
        for chunk in rag_chunks {
            lines.push(format!(
                "## {}:{}-{}",
                chunk.file_path, chunk.start_line, chunk.end_line
            ));
            if let Some(language) = &chunk.language {
                lines.push(format!("Language: {language}"));
            }
            lines.push(format!("```\n{}\n```", chunk.content));
            lines.push(String::new());
        }
        lines.push("</rag_context>".to_string());
        sections.push(lines.join("\n"));
    }

    if !recall_chunks.is_empty() {
        let mut lines: Vec<String> = vec!["<recall_context>".to_string()];
        for chunk in recall_chunks {
            let role = chunk
                .metadata
                .get("role")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let timestamp = chunk
                .metadata
                .get("timestamp")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            lines.push(format!("## [{role}] {timestamp}").trim_end().to_string());
            lines.push(chunk.content.clone());
            lines.push(String::new());
        }
        lines.push("</recall_context>".to_string());
        sections.push(lines.join("\n"));
    }

    sections.join("\n\n").trim().to_string()
}

/// Four context states, four prompts. An empty selected prompt falls back
/// to the direct prompt.
pub fn select_system_prompt(
    has_rag_context: bool,
    has_recall_context: bool,
    chat: &ChatSettings,
) -> String {
    let selected = match (has_rag_context, has_recall_context) {
        (true, true) => &chat.system_prompt_rag_and_recall,
        (true, false) => &chat.system_prompt_rag,
        (false, true) => &chat.system_prompt_recall,
        (false, false) => &chat.system_prompt_direct,
    };

    let trimmed = selected.trim();
    if trimmed.is_empty() {
        let direct = chat.system_prompt_direct.trim();
        if direct.is_empty() {
            "You are a helpful assistant.".to_string()
        } else {
            direct.to_string()
        }
    } else {
        trimmed.to_string()
    }
}

/// Deterministic, model-free answer used whenever the LLM is unavailable.
/// Enumerates the top hydrated matches so the response stays actionable.
pub fn retrieval_only_answer(query: &str, corpus_id: &str, chunks: &[ChunkMatch]) -> String {
    if chunks.is_empty() {
        return format!(
            "No LLM is available and retrieval returned no matches.\n\n\
             Query: {query}\n\
             Corpus: {corpus_id}\n\
             Tip: verify the corpus is indexed and that at least one retrieval leg is enabled."
        );
    }

    let mut lines: Vec<String> = vec![
        "No LLM is available. Returning retrieval-only results.".to_string(),
        String::new(),
        format!("Query: {query}"),
        format!("Corpus: {corpus_id}"),
        String::new(),
        "Top matching sources:".to_string(),
    ];

    for (i, chunk) in chunks.iter().take(8).enumerate() {
        lines.push(format!(
            "{}. {}:{}-{} (score {:.4})",
            i + 1,
            chunk.file_path,
            chunk.start_line,
            chunk.end_line,
            chunk.score
        ));
        let snippet: String = chunk.content.split_whitespace().collect::<Vec<_>>().join(" ");
        if !snippet.is_empty() {
            let snippet: String = snippet.chars().take(220).collect();
            lines.push(format!("   {snippet}"));
        }
    }

    lines.join("\n").trim().to_string()
}
