use std::collections::HashMap;

use common::{
    config::scoped::HydrationMode,
    error::AppError,
    storage::{db::SurrealDbClient, types::chunk::Chunk},
};

use crate::ChunkMatch;

/// Fill chunk bodies for matches according to the hydration mode.
///
/// `lazy` hydrates only matches that arrived skeletal (id + score), `eager`
/// refreshes every match from storage, `none` leaves matches as the legs
/// produced them. Content is capped at `max_chars`.
pub async fn hydrate_matches(
    db: &SurrealDbClient,
    matches: &mut [ChunkMatch],
    mode: HydrationMode,
    max_chars: usize,
) -> Result<(), AppError> {
    if matches.is_empty() {
        return Ok(());
    }

    if mode == HydrationMode::None {
        for m in matches.iter_mut() {
            truncate_content(m, max_chars);
        }
        return Ok(());
    }

    // Group the ids needing a fetch by corpus.
    let mut wanted: HashMap<String, Vec<String>> = HashMap::new();
    for m in matches.iter() {
        let needs_fetch = mode == HydrationMode::Eager || m.content.is_empty();
        if needs_fetch {
            wanted
                .entry(m.corpus_id.clone())
                .or_default()
                .push(m.chunk_id.clone());
        }
    }

    let mut fetched: HashMap<(String, String), Chunk> = HashMap::new();
    for (corpus_id, ids) in wanted {
        let chunks = Chunk::fetch_by_ids(db, &corpus_id, &ids).await?;
        for chunk in chunks {
            fetched.insert((corpus_id.clone(), chunk.id.clone()), chunk);
        }
    }

    for m in matches.iter_mut() {
        if let Some(chunk) = fetched.remove(&(m.corpus_id.clone(), m.chunk_id.clone())) {
            m.content = chunk.content;
            m.file_path = chunk.file_path;
            m.start_line = chunk.start_line;
            m.end_line = chunk.end_line;
            m.language = chunk.language;
            m.absorb_chunk_metadata(&chunk.metadata);
        }
        truncate_content(m, max_chars);
    }

    Ok(())
}

fn truncate_content(m: &mut ChunkMatch, max_chars: usize) {
    if max_chars == 0 || m.content.chars().count() <= max_chars {
        return;
    }
    m.content = m.content.chars().take(max_chars).collect();
}
