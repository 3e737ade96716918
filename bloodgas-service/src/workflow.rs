use anyhow::{Context, Result};
use bloodgas_flow::{
    AnalysisPipeline, FileSnapshotStorage, InMemorySnapshotStorage, LocalExtractor,
    PipelineConfig, PostgresSnapshotStorage, SnapshotStorage,
    providers::{
        ActionPlanProvider, HttpActionPlanClient, HttpEndpoint, HttpInterpreter, HttpVisionClient,
        InterpretationProvider, OpenRouterVision, RigActionPlanner, RigInterpreter,
        VisionProvider,
    },
};
use std::sync::Arc;
use tracing::{error, info};

/// Pipeline configuration from the YAML file named by `BLOODGAS_CONFIG`, or
/// defaults when the variable is unset.
pub async fn load_config() -> Result<PipelineConfig> {
    match std::env::var("BLOODGAS_CONFIG") {
        Ok(path) => {
            info!(path = %path, "Loading pipeline configuration");
            PipelineConfig::from_yaml_file(&path)
                .await
                .with_context(|| format!("invalid pipeline configuration in {path}"))
        }
        Err(_) => Ok(PipelineConfig::default()),
    }
}

/// Postgres when `DATABASE_URL` is set, a directory of JSON files when
/// `BLOODGAS_SNAPSHOT_DIR` is set, memory otherwise.
pub async fn create_snapshot_storage() -> Arc<dyn SnapshotStorage> {
    if let Ok(database_url) = std::env::var("DATABASE_URL") {
        match PostgresSnapshotStorage::connect(&database_url).await {
            Ok(storage) => return Arc::new(storage),
            Err(e) => error!(
                "Failed to connect to PostgreSQL: {}. Falling back to local storage.",
                e
            ),
        }
    }
    if let Ok(dir) = std::env::var("BLOODGAS_SNAPSHOT_DIR") {
        match FileSnapshotStorage::open(&dir).await {
            Ok(storage) => return Arc::new(storage),
            Err(e) => error!("Cannot use snapshot directory {}: {}", dir, e),
        }
    }
    info!("Using in-memory snapshot storage (set DATABASE_URL or BLOODGAS_SNAPSHOT_DIR to persist)");
    Arc::new(InMemorySnapshotStorage::new())
}

/// Wire the providers: an HTTP endpoint per provider when its URL variable is
/// set, OpenRouter otherwise.
pub fn create_pipeline(config: PipelineConfig) -> Result<AnalysisPipeline> {
    let retry = config.retry;

    let vision: Arc<dyn VisionProvider> = match std::env::var("BLOODGAS_VISION_URL") {
        Ok(url) => Arc::new(HttpVisionClient::new(
            HttpEndpoint::new(url, config.vision_timeout),
            retry,
        )),
        Err(_) => Arc::new(
            OpenRouterVision::from_env(config.vision_timeout, retry)
                .context("set BLOODGAS_VISION_URL or OPENROUTER_API_KEY")?,
        ),
    };

    let interpreter: Arc<dyn InterpretationProvider> =
        match std::env::var("BLOODGAS_INTERPRETATION_URL") {
            Ok(url) => Arc::new(HttpInterpreter::new(
                HttpEndpoint::new(url, config.interpretation_timeout),
                retry,
            )),
            Err(_) => Arc::new(
                RigInterpreter::from_env(None, config.interpretation_timeout, retry)
                    .context("set BLOODGAS_INTERPRETATION_URL or OPENROUTER_API_KEY")?,
            ),
        };

    let planner: Arc<dyn ActionPlanProvider> = match std::env::var("BLOODGAS_ACTION_PLAN_URL") {
        Ok(url) => Arc::new(HttpActionPlanClient::new(
            HttpEndpoint::new(url, config.action_plan_timeout),
            retry,
        )),
        Err(_) => Arc::new(
            RigActionPlanner::from_env(None, config.action_plan_timeout, retry)
                .context("set BLOODGAS_ACTION_PLAN_URL or OPENROUTER_API_KEY")?,
        ),
    };

    Ok(AnalysisPipeline::new(
        config,
        Arc::new(LocalExtractor::default()),
        vision,
        interpreter,
        planner,
    ))
}
