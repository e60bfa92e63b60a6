use std::future::Future;
use std::time::{Duration, Instant};

use common::{config::ScopedConfig, error::AppError, utils::redaction::safe_error_message};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    debug::FusionDebug,
    legs,
    plan::QueryPlan,
    ChunkMatch, SearchContext, SearchSpec,
};

/// Outcome of one leg. Errors are data here; a failed leg contributes an
/// empty list and a redacted message, never a request failure.
#[derive(Debug, Default)]
pub struct LegRun {
    pub enabled: bool,
    pub attempted: bool,
    pub error: Option<String>,
    pub matches: Vec<ChunkMatch>,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub vector: LegRun,
    pub sparse: LegRun,
    pub graph: LegRun,
    pub graph_entity_hits: usize,
}

impl DispatchReport {
    pub fn record(&self, dbg: &mut FusionDebug) {
        dbg.vector_enabled = self.vector.enabled;
        dbg.vector_attempted = self.vector.attempted;
        dbg.vector_error = self.vector.error.clone();
        dbg.vector_results = self.vector.matches.len();

        dbg.sparse_enabled = self.sparse.enabled;
        dbg.sparse_attempted = self.sparse.attempted;
        dbg.sparse_error = self.sparse.error.clone();
        dbg.sparse_results = self.sparse.matches.len();

        dbg.graph_enabled = self.graph.enabled;
        dbg.graph_attempted = self.graph.attempted;
        dbg.graph_error = self.graph.error.clone();
        dbg.graph_entity_hits = self.graph_entity_hits;
        dbg.graph_hydrated_chunks = self.graph.matches.len();
    }

    /// Leg lists in the fixed (vector, sparse, graph) order RRF depends on.
    pub fn into_ordered_lists(self) -> [Vec<ChunkMatch>; 3] {
        [self.vector.matches, self.sparse.matches, self.graph.matches]
    }
}

/// Fan the enabled legs out concurrently. Each leg runs under its own
/// deadline and observes the request's cancellation token; completion order
/// is irrelevant because results are reassembled in leg order.
pub async fn dispatch_legs(
    ctx: &SearchContext,
    spec: &SearchSpec,
    plan: &QueryPlan,
    config: &ScopedConfig,
) -> DispatchReport {
    let (vector, sparse, graph) = tokio::join!(
        guard_leg(ctx, plan.vector, "vector", async {
            legs::vector::run(ctx, &spec.corpus_ids, &spec.query, config).await
        }),
        guard_leg(ctx, plan.sparse, "sparse", async {
            legs::sparse::run(ctx, &spec.corpus_ids, &spec.query, config).await
        }),
        guard_leg_inner(ctx, plan.graph, "graph", async {
            legs::graph::run(ctx, &spec.corpus_ids, &spec.query, config)
                .await
                .map(|out| (out.matches, out.entity_hits))
        }),
    );

    observe_latency("tribrid_vector_leg_latency_seconds", &vector);
    observe_latency("tribrid_sparse_leg_latency_seconds", &sparse);

    let (graph_run, graph_entity_hits) = split_graph_run(graph);
    metrics::histogram!("tribrid_graph_leg_latency_seconds")
        .record(graph_run.elapsed.as_secs_f64());

    DispatchReport {
        vector,
        sparse,
        graph: graph_run,
        graph_entity_hits,
    }
}

fn observe_latency(name: &'static str, run: &LegRun) {
    if run.attempted {
        metrics::histogram!(name).record(run.elapsed.as_secs_f64());
    }
}

fn split_graph_run(run: LegRunWith<(Vec<ChunkMatch>, usize)>) -> (LegRun, usize) {
    let (matches, entity_hits) = run.value.unwrap_or_default();
    (
        LegRun {
            enabled: run.enabled,
            attempted: run.attempted,
            error: run.error,
            matches,
            elapsed: run.elapsed,
        },
        entity_hits,
    )
}

struct LegRunWith<T> {
    enabled: bool,
    attempted: bool,
    error: Option<String>,
    value: Option<T>,
    elapsed: Duration,
}

async fn guard_leg<F>(
    ctx: &SearchContext,
    enabled: bool,
    leg: &'static str,
    fut: F,
) -> LegRun
where
    F: Future<Output = Result<Vec<ChunkMatch>, AppError>>,
{
    let run = guard_leg_inner(ctx, enabled, leg, fut).await;
    LegRun {
        enabled: run.enabled,
        attempted: run.attempted,
        error: run.error,
        matches: run.value.unwrap_or_default(),
        elapsed: run.elapsed,
    }
}

async fn guard_leg_inner<F, T>(
    ctx: &SearchContext,
    enabled: bool,
    leg: &'static str,
    fut: F,
) -> LegRunWith<T>
where
    F: Future<Output = Result<T, AppError>>,
{
    if !enabled {
        return LegRunWith {
            enabled: false,
            attempted: false,
            error: None,
            value: None,
            elapsed: Duration::ZERO,
        };
    }

    let started = Instant::now();
    // Cancellation always wins over a leg that is ready on the same poll.
    let outcome = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => Err("cancelled".to_string()),
        result = timeout(ctx.leg_deadline, fut) => match result {
            Err(_) => Err("timeout".to_string()),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(safe_error_message(&err.to_string())),
        },
    };
    let elapsed = started.elapsed();

    match outcome {
        Ok(value) => {
            debug!(leg, elapsed_ms = elapsed.as_millis() as u64, "Leg finished");
            LegRunWith {
                enabled: true,
                attempted: true,
                error: None,
                value: Some(value),
                elapsed,
            }
        }
        Err(message) => {
            warn!(leg, error = %message, "Leg failed; continuing with remaining legs");
            LegRunWith {
                enabled: true,
                attempted: true,
                error: Some(message),
                value: None,
                elapsed,
            }
        }
    }
}
