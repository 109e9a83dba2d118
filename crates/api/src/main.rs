use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use insightforge_api::app::{self, services, AppServices};
use insightforge_core::SystemClock;
use insightforge_infra::{Pipeline, PipelineConfig};
use insightforge_observability::LogFormat;

/// Batch analysis pipeline: seals behavior-event batches, analyzes them and
/// serves a small admin/metrics HTTP API.
#[derive(Parser, Debug)]
#[command(name = "insightforge", version)]
struct Cli {
    /// PostgreSQL URL; the in-memory store is used when unset
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    database_max_connections: u32,

    /// Analysis endpoint; local heuristics are used when unset
    #[arg(long, env = "ANALYZER_URL")]
    analyzer_url: Option<String>,

    #[arg(long, env = "ANALYZER_TOKEN", hide_env_values = true)]
    analyzer_token: Option<String>,

    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: SocketAddr,

    /// `json` or `pretty`
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(clap::Args, Debug)]
struct PipelineArgs {
    /// Events that seal a batch
    #[arg(long, env = "BATCH_SIZE_THRESHOLD", default_value_t = 100)]
    batch_size_threshold: u64,

    /// Age at which an OPEN batch is sealed
    #[arg(long, env = "BATCH_TIME_WINDOW_SECS", default_value_t = 600)]
    batch_time_window_secs: u64,

    #[arg(long, env = "SEALER_INTERVAL_SECS", default_value_t = 60)]
    sealer_interval_secs: u64,

    #[arg(long, env = "CREATOR_INTERVAL_SECS", default_value_t = 120)]
    creator_interval_secs: u64,

    #[arg(long, env = "WORKER_POLL_INTERVAL_SECS", default_value_t = 5)]
    worker_poll_interval_secs: u64,

    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 1)]
    worker_concurrency: usize,

    #[arg(long, env = "LOCK_TIMEOUT_SECS", default_value_t = 600)]
    lock_timeout_secs: u64,

    #[arg(long, env = "MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    #[arg(long, env = "BASE_RETRY_DELAY_SECS", default_value_t = 30)]
    base_retry_delay_secs: u64,

    /// Fraction of each backoff delay added as random jitter
    #[arg(long, env = "RETRY_JITTER", default_value_t = 0.1)]
    retry_jitter: f64,

    #[arg(long, env = "ANALYSIS_TIMEOUT_SECS", default_value_t = 120)]
    analysis_timeout_secs: u64,

    #[arg(long, env = "RECOVERY_INTERVAL_SECS", default_value_t = 60)]
    recovery_interval_secs: u64,

    #[arg(long, env = "STUCK_TIMEOUT_SECS", default_value_t = 900)]
    stuck_timeout_secs: u64,

    #[arg(long, env = "BREAKER_FAILURE_THRESHOLD", default_value_t = 5)]
    breaker_failure_threshold: u32,

    #[arg(long, env = "BREAKER_COOLDOWN_SECS", default_value_t = 600)]
    breaker_cooldown_secs: u64,

    #[arg(long, env = "BREAKER_HALF_OPEN_MAX", default_value_t = 1)]
    breaker_half_open_max: u32,
}

impl From<PipelineArgs> for PipelineConfig {
    fn from(args: PipelineArgs) -> Self {
        Self {
            batch_size_threshold: args.batch_size_threshold,
            batch_time_window_secs: args.batch_time_window_secs,
            sealer_interval_secs: args.sealer_interval_secs,
            creator_interval_secs: args.creator_interval_secs,
            worker_poll_interval_secs: args.worker_poll_interval_secs,
            worker_concurrency: args.worker_concurrency,
            lock_timeout_secs: args.lock_timeout_secs,
            max_attempts: args.max_attempts,
            base_retry_delay_secs: args.base_retry_delay_secs,
            retry_jitter: args.retry_jitter,
            analysis_timeout_secs: args.analysis_timeout_secs,
            recovery_interval_secs: args.recovery_interval_secs,
            stuck_timeout_secs: args.stuck_timeout_secs,
            breaker_failure_threshold: args.breaker_failure_threshold,
            breaker_cooldown_secs: args.breaker_cooldown_secs,
            breaker_half_open_max: args.breaker_half_open_max,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    insightforge_observability::init(cli.log_format);

    let config = PipelineConfig::from(cli.pipeline);
    config.validate().context("invalid pipeline configuration")?;

    let store = services::select_store(cli.database_url.as_deref(), cli.database_max_connections)
        .await
        .context("failed to open pipeline store")?;
    let analyzer = services::select_analyzer(
        cli.analyzer_url.as_deref(),
        cli.analyzer_token.as_deref(),
        Duration::from_secs(config.analysis_timeout_secs),
    )
    .context("failed to build analyzer")?;

    let pipeline = Pipeline::new(config, store, analyzer, SystemClock::shared())
        .context("failed to build pipeline")?;

    let shutdown = CancellationToken::new();
    let handle = pipeline.spawn(&shutdown);

    let app = app::build_app(Arc::new(AppServices::from_pipeline(&pipeline)));
    let listener = tokio::net::TcpListener::bind(cli.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind_addr))?;
    info!(addr = %listener.local_addr()?, "listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown.clone()));
    if let Err(e) = server.await {
        warn!(error = %e, "http server exited with error");
    }

    shutdown.cancel();
    for (worker, stats) in handle.shutdown().await {
        info!(
            worker = %worker,
            processed = stats.jobs_processed,
            succeeded = stats.jobs_succeeded,
            retried = stats.jobs_retried,
            dead_lettered = stats.jobs_dead_lettered,
            "worker stopped"
        );
    }

    Ok(())
}

/// Resolves on Ctrl-C, or when something else cancels `shutdown`.
async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("shutdown requested"),
                Err(e) => {
                    warn!(error = %e, "failed to listen for ctrl-c");
                    shutdown.cancelled().await;
                }
            }
        }
        _ = shutdown.cancelled() => {}
    }
}
