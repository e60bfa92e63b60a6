use std::collections::{HashMap, HashSet};

use common::{
    config::scoped::GraphLegSettings,
    config::ScopedConfig,
    error::AppError,
    storage::types::{
        chunk::Chunk,
        chunk_membership::ChunkMembership,
        entity::Entity,
        entity_relation::{EntityRelation, RelationType},
    },
};
use tracing::debug;

use crate::{ChunkMatch, MatchSource, SearchContext};

use super::query_tokens;

pub struct GraphLegOutput {
    pub matches: Vec<ChunkMatch>,
    pub entity_hits: usize,
}

/// State accumulated per reached entity during expansion.
#[derive(Debug, Clone)]
struct ReachedEntity {
    hops: u32,
    path_weight: f32,
    direct: bool,
}

/// Graph leg: match entity names against query tokens (direct matches,
/// hops = 0), expand up to `max_hops` over typed edges, hydrate entities to
/// chunks, and score with hop decay. A chunk reached through several
/// entities keeps the maximum contribution, never the sum.
pub async fn run(
    ctx: &SearchContext,
    corpus_ids: &[String],
    query: &str,
    config: &ScopedConfig,
) -> Result<GraphLegOutput, AppError> {
    let tokens: Vec<String> = query_tokens(query)
        .into_iter()
        .filter(|t| t.len() >= 3)
        .collect();

    let mut matches = Vec::new();
    let mut entity_hits = 0usize;

    for corpus_id in corpus_ids {
        let (corpus_matches, corpus_entities) =
            run_for_corpus(ctx, corpus_id, &tokens, config).await?;
        entity_hits += corpus_entities;
        matches.extend(corpus_matches);
    }

    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    matches.truncate(config.graph.top_k);

    debug!(results = matches.len(), entity_hits, "Graph leg complete");
    Ok(GraphLegOutput {
        matches,
        entity_hits,
    })
}

async fn run_for_corpus(
    ctx: &SearchContext,
    corpus_id: &str,
    tokens: &[String],
    config: &ScopedConfig,
) -> Result<(Vec<ChunkMatch>, usize), AppError> {
    if tokens.is_empty() {
        return Ok((Vec::new(), 0));
    }

    let direct = Entity::find_by_name_tokens(&ctx.db, corpus_id, tokens).await?;
    if direct.is_empty() {
        return Ok((Vec::new(), 0));
    }

    let mut reached: HashMap<String, ReachedEntity> = HashMap::new();
    let mut entities: HashMap<String, Entity> = HashMap::new();
    for entity in direct {
        reached.insert(
            entity.id.clone(),
            ReachedEntity {
                hops: 0,
                path_weight: 1.0,
                direct: true,
            },
        );
        entities.insert(entity.id.clone(), entity);
    }

    expand(ctx, corpus_id, config, &mut reached, &mut entities).await?;

    let entity_hits = reached.len();
    let chunk_matches = hydrate_entities(ctx, corpus_id, config, &reached, &entities).await?;

    Ok((chunk_matches, entity_hits))
}

/// Breadth-first expansion over typed edges, tracking the minimum hop count
/// per entity. On equal hops the stronger path weight wins.
async fn expand(
    ctx: &SearchContext,
    corpus_id: &str,
    config: &ScopedConfig,
    reached: &mut HashMap<String, ReachedEntity>,
    entities: &mut HashMap<String, Entity>,
) -> Result<(), AppError> {
    let mut frontier: Vec<String> = reached.keys().cloned().collect();

    for hop in 1..=config.graph.max_hops {
        if frontier.is_empty() {
            break;
        }

        let relations = EntityRelation::find_touching(&ctx.db, corpus_id, &frontier).await?;
        if relations.is_empty() {
            break;
        }

        let frontier_set: HashSet<&str> = frontier.iter().map(String::as_str).collect();
        let mut next_frontier: Vec<String> = Vec::new();

        for relation in &relations {
            for (from, to) in [
                (relation.source_id.as_str(), relation.target_id.as_str()),
                (relation.target_id.as_str(), relation.source_id.as_str()),
            ] {
                if !frontier_set.contains(from) {
                    continue;
                }
                let Some(origin) = reached.get(from).cloned() else {
                    continue;
                };

                let edge = edge_weight(relation.relation_type, &config.graph) * relation.weight;
                let candidate = ReachedEntity {
                    hops: hop,
                    path_weight: origin.path_weight * edge,
                    direct: false,
                };

                match reached.get_mut(to) {
                    Some(existing) => {
                        if candidate.hops == existing.hops
                            && candidate.path_weight > existing.path_weight
                        {
                            existing.path_weight = candidate.path_weight;
                        }
                    }
                    None => {
                        reached.insert(to.to_string(), candidate);
                        next_frontier.push(to.to_string());
                    }
                }
            }
        }

        let missing: Vec<String> = next_frontier
            .iter()
            .filter(|id| !entities.contains_key(*id))
            .cloned()
            .collect();
        for entity in Entity::fetch_by_ids(&ctx.db, corpus_id, &missing).await? {
            entities.insert(entity.id.clone(), entity);
        }

        frontier = next_frontier;
    }

    Ok(())
}

fn edge_weight(relation_type: RelationType, graph: &GraphLegSettings) -> f32 {
    match relation_type {
        RelationType::Contains => graph.ast_contains_weight,
        RelationType::Inherits => graph.ast_inherits_weight,
        RelationType::Imports => graph.ast_imports_weight,
        RelationType::Calls => graph.ast_calls_weight,
        RelationType::References | RelationType::RelatedTo => 1.0,
    }
}

fn entity_score(state: &ReachedEntity, graph: &GraphLegSettings) -> f32 {
    let decayed = graph.base_boost * graph.hop_decay.powi(state.hops as i32) * state.path_weight;
    if state.direct {
        decayed * graph.direct_match_boost
    } else {
        decayed
    }
}

/// Map reached entities onto chunks: membership edges first, the entity's
/// own line span as fallback. Chunk score is the max over contributors.
async fn hydrate_entities(
    ctx: &SearchContext,
    corpus_id: &str,
    config: &ScopedConfig,
    reached: &HashMap<String, ReachedEntity>,
    entities: &HashMap<String, Entity>,
) -> Result<Vec<ChunkMatch>, AppError> {
    let entity_ids: Vec<String> = reached.keys().cloned().collect();
    let memberships = ChunkMembership::find_for_entities(&ctx.db, corpus_id, &entity_ids).await?;

    let mut membership_by_entity: HashMap<&str, Vec<&str>> = HashMap::new();
    for membership in &memberships {
        membership_by_entity
            .entry(membership.entity_id.as_str())
            .or_default()
            .push(membership.chunk_id.as_str());
    }

    // Best contribution per chunk id.
    struct Contribution {
        score: f32,
        hops: u32,
        direct: bool,
        entity_id: String,
    }
    let mut best: HashMap<String, Contribution> = HashMap::new();
    let mut span_lookups: Vec<(String, f32, u32, bool)> = Vec::new();

    for (entity_id, state) in reached {
        let score = entity_score(state, &config.graph);

        match membership_by_entity.get(entity_id.as_str()) {
            Some(chunk_ids) => {
                for chunk_id in chunk_ids {
                    let replace = best
                        .get(*chunk_id)
                        .map(|existing| score > existing.score)
                        .unwrap_or(true);
                    if replace {
                        best.insert(
                            (*chunk_id).to_string(),
                            Contribution {
                                score,
                                hops: state.hops,
                                direct: state.direct,
                                entity_id: entity_id.clone(),
                            },
                        );
                    }
                }
            }
            None => {
                span_lookups.push((entity_id.clone(), score, state.hops, state.direct));
            }
        }
    }

    // Fallback hydration over (file_path, start_line, end_line).
    for (entity_id, score, hops, direct) in span_lookups {
        let Some(entity) = entities.get(&entity_id) else {
            continue;
        };
        let (Some(file_path), Some(start), Some(end)) =
            (entity.file_path.as_ref(), entity.start_line, entity.end_line)
        else {
            continue;
        };

        let chunks = Chunk::find_by_span(&ctx.db, corpus_id, file_path, start, end).await?;
        for chunk in chunks {
            let replace = best
                .get(&chunk.id)
                .map(|existing| score > existing.score)
                .unwrap_or(true);
            if replace {
                best.insert(
                    chunk.id.clone(),
                    Contribution {
                        score,
                        hops,
                        direct,
                        entity_id: entity_id.clone(),
                    },
                );
            }
        }
    }

    let chunk_ids: Vec<String> = best.keys().cloned().collect();
    let chunks = Chunk::fetch_by_ids(&ctx.db, corpus_id, &chunk_ids).await?;

    let mut out = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let Some(contribution) = best.get(&chunk.id) else {
            continue;
        };
        let mut m = ChunkMatch {
            chunk_id: chunk.id,
            corpus_id: chunk.corpus_id,
            content: chunk.content,
            file_path: chunk.file_path,
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            language: chunk.language,
            score: contribution.score,
            source: MatchSource::Graph,
            metadata: serde_json::Map::new(),
        };
        m.absorb_chunk_metadata(&chunk.metadata);
        m.meta_insert("hops", serde_json::json!(contribution.hops));
        m.meta_insert("direct_match", serde_json::json!(contribution.direct));
        m.meta_insert("entity_id", serde_json::json!(contribution.entity_id));
        out.push(m);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::scoped::SparseLegSettings;
    use common::storage::db::SurrealDbClient;
    use common::storage::types::entity::EntityType;
    use common::utils::embedding::EmbeddingProvider;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn context() -> SearchContext {
        let db = Arc::new(
            SurrealDbClient::memory("graph_leg_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );
        db.apply_schema(3, &SparseLegSettings::default(), 1.2, 0.4)
            .await
            .expect("schema");
        SearchContext::new(db, Arc::new(EmbeddingProvider::new_hashed(3)))
    }

    async fn store_chunk(ctx: &SearchContext, id: &str, path: &str, start: u32, end: u32) {
        Chunk::store_with_embedding(
            Chunk::new(
                id.into(),
                "repo".into(),
                format!("content of {id}"),
                path.into(),
                start,
                end,
            ),
            vec![1.0, 0.0, 0.0],
            &ctx.db,
        )
        .await
        .expect("store chunk");
    }

    async fn store_entity(ctx: &SearchContext, id: &str, name: &str) {
        ctx.db
            .store_item(Entity::new(
                id.into(),
                "repo".into(),
                name.into(),
                EntityType::Function,
            ))
            .await
            .expect("store entity");
    }

    async fn link(ctx: &SearchContext, entity: &str, chunk: &str) {
        ctx.db
            .store_item(ChunkMembership::new(
                "repo".into(),
                entity.into(),
                chunk.into(),
            ))
            .await
            .expect("store membership");
    }

    async fn relate(ctx: &SearchContext, from: &str, to: &str, rel: RelationType) {
        ctx.db
            .store_item(EntityRelation::new(
                "repo".into(),
                from.into(),
                to.into(),
                rel,
                1.0,
            ))
            .await
            .expect("store relation");
    }

    #[tokio::test]
    async fn direct_matches_carry_hops_zero() {
        let ctx = context().await;
        store_chunk(&ctx, "c_a", "src/auth.rs", 1, 20).await;
        store_entity(&ctx, "e1", "authenticate").await;
        link(&ctx, "e1", "c_a").await;

        let config = ScopedConfig::default();
        let out = run(&ctx, &["repo".to_string()], "authenticate request", &config)
            .await
            .expect("graph leg");

        assert_eq!(out.matches.len(), 1);
        let top = &out.matches[0];
        assert_eq!(top.source, MatchSource::Graph);
        assert_eq!(top.metadata["hops"], 0);
        assert_eq!(top.metadata["direct_match"], true);
    }

    #[tokio::test]
    async fn hop_decay_scores_closer_entities_higher() {
        let ctx = context().await;
        store_chunk(&ctx, "c_a", "src/auth.rs", 1, 20).await;
        store_chunk(&ctx, "c_b", "src/tokens.rs", 1, 20).await;

        store_entity(&ctx, "e_direct", "authenticate").await;
        store_entity(&ctx, "e_mid", "issue_token").await;
        store_entity(&ctx, "e_far", "rotate_keys").await;

        link(&ctx, "e_direct", "c_a").await;
        link(&ctx, "e_far", "c_b").await;

        relate(&ctx, "e_direct", "e_mid", RelationType::Calls).await;
        relate(&ctx, "e_mid", "e_far", RelationType::Calls).await;

        let config = ScopedConfig::default();
        let out = run(&ctx, &["repo".to_string()], "authenticate", &config)
            .await
            .expect("graph leg");

        assert_eq!(out.matches.len(), 2);
        let by_id: std::collections::HashMap<&str, &ChunkMatch> = out
            .matches
            .iter()
            .map(|m| (m.chunk_id.as_str(), m))
            .collect();

        let direct = by_id["c_a"];
        let far = by_id["c_b"];
        assert!(direct.score > far.score, "hops=0 must outscore hops=2");
        assert_eq!(far.metadata["hops"], 2);
        assert_eq!(far.metadata["direct_match"], false);
        assert!(out.entity_hits >= 3);
    }

    #[tokio::test]
    async fn expansion_respects_max_hops() {
        let ctx = context().await;
        store_chunk(&ctx, "c_far", "src/far.rs", 1, 20).await;

        store_entity(&ctx, "e0", "authenticate").await;
        store_entity(&ctx, "e1", "one").await;
        store_entity(&ctx, "e2", "two").await;
        store_entity(&ctx, "e3", "three").await;
        link(&ctx, "e3", "c_far").await;

        relate(&ctx, "e0", "e1", RelationType::Calls).await;
        relate(&ctx, "e1", "e2", RelationType::Calls).await;
        relate(&ctx, "e2", "e3", RelationType::Calls).await;

        let mut config = ScopedConfig::default();
        config.graph.max_hops = 2;

        let out = run(&ctx, &["repo".to_string()], "authenticate", &config)
            .await
            .expect("graph leg");

        // e3 sits at hops=3 and must stay unreached.
        assert!(out.matches.is_empty());
        assert_eq!(out.entity_hits, 3);
    }

    #[tokio::test]
    async fn span_fallback_hydrates_without_memberships() {
        let ctx = context().await;
        store_chunk(&ctx, "c_span", "src/auth.rs", 10, 40).await;

        let entity = Entity::new(
            "e1".into(),
            "repo".into(),
            "authenticate".into(),
            EntityType::Function,
        )
        .at_location("src/auth.rs", 12, 30);
        ctx.db.store_item(entity).await.expect("store entity");

        let config = ScopedConfig::default();
        let out = run(&ctx, &["repo".to_string()], "authenticate", &config)
            .await
            .expect("graph leg");

        assert_eq!(out.matches.len(), 1);
        assert_eq!(out.matches[0].chunk_id, "c_span");
    }
}
