//! MCP server exposing the retrieval fusion core as tools.

use std::sync::Arc;
use std::time::Duration;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Content, Implementation, ProtocolVersion, ServerCapabilities, ServerInfo,
};
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler};

use common::{
    config::ConfigResolver,
    storage::{db::SurrealDbClient, types::corpus::Corpus},
    utils::embedding::EmbeddingProvider,
};
use generation::{answer_best_effort, AnswerRequest};
use retrieval_pipeline::{rerank::RerankerRegistry, run_search, SearchContext, SearchSpec};

use crate::params::{AnswerParams, SearchMode, SearchParams};

/// Shared handles the MCP tools operate on.
#[derive(Clone)]
pub struct McpDeps {
    pub db: Arc<SurrealDbClient>,
    pub resolver: Arc<ConfigResolver>,
    pub embedder: Arc<EmbeddingProvider>,
    pub reranker: Arc<RerankerRegistry>,
    pub leg_deadline: Duration,
}

#[derive(Clone)]
pub struct TriBridMcpServer {
    tool_router: ToolRouter<Self>,
    deps: McpDeps,
}

impl TriBridMcpServer {
    pub fn new(deps: McpDeps) -> Self {
        Self {
            tool_router: Self::tool_router(),
            deps,
        }
    }

    fn context(&self) -> SearchContext {
        SearchContext::new(self.deps.db.clone(), self.deps.embedder.clone())
            .with_reranker(self.deps.reranker.clone())
            .with_leg_deadline(self.deps.leg_deadline)
    }

    async fn spec_for(
        &self,
        query: &str,
        corpus_id: &str,
        mode: Option<SearchMode>,
        top_k: Option<usize>,
    ) -> Result<SearchSpec, McpError> {
        if query.trim().is_empty() {
            return Err(McpError::invalid_params("query must not be empty", None));
        }

        Corpus::require(&self.deps.db, corpus_id)
            .await
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;

        let (vector, sparse, graph) = mode.unwrap_or_default().leg_flags();
        let mut spec = SearchSpec::new(query.trim(), vec![corpus_id.to_string()]);
        spec.include_vector = vector;
        spec.include_sparse = sparse;
        spec.include_graph = graph;
        spec.top_k = top_k;
        Ok(spec)
    }
}

#[tool_router]
impl TriBridMcpServer {
    /// Tri-source retrieval over one corpus.
    #[tool(
        name = "search",
        description = "Search a corpus with tri-source retrieval (vector + sparse + graph). Returns fused chunk matches as JSON, including per-leg debug telemetry."
    )]
    async fn search(
        &self,
        Parameters(params): Parameters<SearchParams>,
    ) -> Result<CallToolResult, McpError> {
        let spec = self
            .spec_for(&params.query, &params.corpus_id, params.mode, params.top_k)
            .await?;

        let config = self
            .deps
            .resolver
            .get(Some(&params.corpus_id))
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;

        let outcome = run_search(&self.context(), &spec, &config).await;

        let json = serde_json::to_string_pretty(&outcome)
            .map_err(|e| McpError::internal_error(format!("Serialization error: {e}"), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    /// Retrieval plus LLM composition with the always-answer guarantee.
    #[tool(
        name = "answer",
        description = "Answer a question from a corpus using tri-source retrieval and the configured LLM. Falls back to a retrieval-only answer when no provider is available."
    )]
    async fn answer(
        &self,
        Parameters(params): Parameters<AnswerParams>,
    ) -> Result<CallToolResult, McpError> {
        let spec = self
            .spec_for(&params.query, &params.corpus_id, params.mode, params.top_k)
            .await?;

        let config = self
            .deps
            .resolver
            .get(Some(&params.corpus_id))
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;

        let request = AnswerRequest::new(spec);
        let output = answer_best_effort(&self.context(), &config, &request).await;

        let json = serde_json::to_string_pretty(&output)
            .map_err(|e| McpError::internal_error(format!("Serialization error: {e}"), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    /// Enumerate available corpora.
    #[tool(name = "list_corpora", description = "List the corpora available for search.")]
    async fn list_corpora(&self) -> Result<CallToolResult, McpError> {
        let corpora = Corpus::list(&self.deps.db)
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;

        let json = serde_json::to_string_pretty(&corpora)
            .map_err(|e| McpError::internal_error(format!("Serialization error: {e}"), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }
}

#[tool_handler]
impl ServerHandler for TriBridMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "tribrid-rag".to_string(),
                title: Some("TriBridRAG MCP Server".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "TriBridRAG: tri-source retrieval (vector + sparse + graph) over indexed \
                 corpora. Use `search` for raw fused matches, `answer` for an LLM-composed \
                 answer with sources, and `list_corpora` to discover corpora."
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::scoped::SparseLegSettings;
    use uuid::Uuid;

    async fn deps() -> McpDeps {
        let db = Arc::new(
            SurrealDbClient::memory("mcp_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );
        db.apply_schema(8, &SparseLegSettings::default(), 1.2, 0.4)
            .await
            .expect("schema");

        McpDeps {
            resolver: Arc::new(ConfigResolver::new(Arc::clone(&db))),
            embedder: Arc::new(EmbeddingProvider::new_hashed(8)),
            reranker: RerankerRegistry::new(None),
            leg_deadline: Duration::from_secs(5),
            db,
        }
    }

    #[tokio::test]
    async fn spec_for_rejects_empty_query_and_unknown_corpus() {
        let server = TriBridMcpServer::new(deps().await);

        let err = server
            .spec_for("", "repo", None, None)
            .await
            .expect_err("empty query");
        assert!(err.message.contains("query"));

        let err = server
            .spec_for("question", "ghost", None, None)
            .await
            .expect_err("unknown corpus");
        assert!(err.message.contains("not found"));
    }

    #[tokio::test]
    async fn spec_for_applies_mode_flags() {
        let server = TriBridMcpServer::new(deps().await);
        server
            .deps
            .db
            .store_item(Corpus::new("repo".into(), "repo".into(), "/srv/repo".into()))
            .await
            .expect("store corpus");

        let spec = server
            .spec_for("question", "repo", Some(SearchMode::SparseOnly), Some(5))
            .await
            .expect("spec");
        assert!(!spec.include_vector);
        assert!(spec.include_sparse);
        assert!(!spec.include_graph);
        assert_eq!(spec.top_k, Some(5));
    }
}
