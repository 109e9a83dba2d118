use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

use insightforge_ai::{AnalysisError, Analyzer, HeuristicAnalyzer, HttpAnalyzer};
use insightforge_infra::jobs::ManualTrigger;
use insightforge_infra::metrics::MetricsCollector;
use insightforge_infra::store::{
    InMemoryPipelineStore, PipelineStore, PostgresPipelineStore, StoreError, StoreResult,
};
use insightforge_infra::Pipeline;

/// Everything the HTTP handlers need, shared behind an `Arc`.
pub struct AppServices {
    pub trigger: ManualTrigger,
    pub metrics: MetricsCollector,
    pub store: Arc<dyn PipelineStore>,
}

impl AppServices {
    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self {
            trigger: pipeline.trigger(),
            metrics: pipeline.metrics(),
            store: pipeline.store(),
        }
    }
}

/// Postgres when a database URL is configured, otherwise the in-memory store.
pub async fn select_store(
    database_url: Option<&str>,
    max_connections: u32,
) -> StoreResult<Arc<dyn PipelineStore>> {
    match database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(url)
                .await
                .map_err(|e| StoreError::Storage(format!("connect: {e}")))?;
            let store = PostgresPipelineStore::new(pool);
            store.migrate().await?;
            tracing::info!("using postgres pipeline store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory store (state is lost on exit)");
            Ok(Arc::new(InMemoryPipelineStore::new()))
        }
    }
}

/// HTTP analyzer when an endpoint is configured, otherwise the local heuristics.
pub fn select_analyzer(
    analyzer_url: Option<&str>,
    analyzer_token: Option<&str>,
    timeout: Duration,
) -> Result<Arc<dyn Analyzer>, AnalysisError> {
    match analyzer_url {
        Some(url) => {
            let mut analyzer = HttpAnalyzer::new(url, timeout)?;
            if let Some(token) = analyzer_token {
                analyzer = analyzer.with_bearer_token(token);
            }
            tracing::info!(endpoint = analyzer.endpoint(), "using http analyzer");
            Ok(Arc::new(analyzer))
        }
        None => {
            tracing::info!("no analyzer endpoint configured; using heuristic analyzer");
            Ok(Arc::new(HeuristicAnalyzer::new()))
        }
    }
}
