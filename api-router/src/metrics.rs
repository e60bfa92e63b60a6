use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

pub const SEARCH_REQUESTS_TOTAL: &str = "tribrid_search_requests_total";
pub const SEARCH_ERRORS_TOTAL: &str = "tribrid_search_errors_total";
pub const INDEX_RUNS_TOTAL: &str = "tribrid_index_runs_total";
pub const SEARCH_LATENCY_SECONDS: &str = "tribrid_search_latency_seconds";
pub const VECTOR_LEG_LATENCY_SECONDS: &str = "tribrid_vector_leg_latency_seconds";
pub const SPARSE_LEG_LATENCY_SECONDS: &str = "tribrid_sparse_leg_latency_seconds";
pub const GRAPH_LEG_LATENCY_SECONDS: &str = "tribrid_graph_leg_latency_seconds";
pub const CHUNKS_INDEXED_CURRENT: &str = "tribrid_chunks_indexed_current";
pub const GRAPH_ENTITIES_CURRENT: &str = "tribrid_graph_entities_current";
pub const GRAPH_RELATIONSHIPS_CURRENT: &str = "tribrid_graph_relationships_current";

/// Install the process-global Prometheus recorder and register metric
/// metadata. Labels stay low-cardinality: no corpus, query, or file labels
/// anywhere.
pub fn init_metrics() -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(SEARCH_LATENCY_SECONDS.to_string()),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )?
        .set_buckets_for_metric(
            Matcher::Full(VECTOR_LEG_LATENCY_SECONDS.to_string()),
            &[0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
        )?
        .set_buckets_for_metric(
            Matcher::Full(SPARSE_LEG_LATENCY_SECONDS.to_string()),
            &[0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
        )?
        .set_buckets_for_metric(
            Matcher::Full(GRAPH_LEG_LATENCY_SECONDS.to_string()),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )?
        .install_recorder()?;

    describe_counter!(
        SEARCH_REQUESTS_TOTAL,
        "Total number of /api/search requests handled."
    );
    describe_counter!(
        SEARCH_ERRORS_TOTAL,
        "Total number of /api/search internal errors."
    );
    describe_counter!(
        INDEX_RUNS_TOTAL,
        "Total number of indexing runs reported by the indexer."
    );
    describe_histogram!(
        SEARCH_LATENCY_SECONDS,
        Unit::Seconds,
        "End-to-end /api/search latency in seconds."
    );
    describe_histogram!(
        VECTOR_LEG_LATENCY_SECONDS,
        Unit::Seconds,
        "Vector retrieval leg latency in seconds (embed + ANN)."
    );
    describe_histogram!(
        SPARSE_LEG_LATENCY_SECONDS,
        Unit::Seconds,
        "Sparse retrieval leg latency in seconds (FTS/BM25)."
    );
    describe_histogram!(
        GRAPH_LEG_LATENCY_SECONDS,
        Unit::Seconds,
        "Graph retrieval leg latency in seconds (traversal + hydration)."
    );
    describe_gauge!(CHUNKS_INDEXED_CURRENT, "Chunks currently indexed.");
    describe_gauge!(GRAPH_ENTITIES_CURRENT, "Graph entities currently stored.");
    describe_gauge!(
        GRAPH_RELATIONSHIPS_CURRENT,
        "Graph relationships currently stored."
    );

    Ok(handle)
}
