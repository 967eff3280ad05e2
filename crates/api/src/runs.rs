use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use extract::{
    CodingPipeline, CompletionBackend, DiscoveryMode, ExistingSchemas, ProgressSnapshot,
    RunProgress, RunSummary,
};
use graph::{ArtifactWriter, Neo4jImporter};

use crate::config::AppConfig;
use crate::metrics::{Metrics, TimedOperation};

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    /// Transcript file or directory
    pub path: String,
    /// Overrides the configured discovery mode for this run
    #[serde(default)]
    pub discovery_mode: Option<DiscoveryMode>,
    /// Schemas to preserve (mixed) or use verbatim (closed)
    #[serde(default)]
    pub existing: ExistingSchemas,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub progress: ProgressSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct RunRecord {
    status: RunStatus,
    progress: Arc<RunProgress>,
    summary: Option<RunSummary>,
    artifacts: Option<PathBuf>,
    error: Option<String>,
}

/// Everything a run needs, shared between HTTP handlers and background tasks.
pub struct RunService {
    config: Arc<AppConfig>,
    backend: Arc<dyn CompletionBackend>,
    importer: Option<Arc<Neo4jImporter>>,
    metrics: Arc<Metrics>,
    runs: DashMap<Uuid, RunRecord>,
}

impl RunService {
    pub fn new(
        config: Arc<AppConfig>,
        backend: Arc<dyn CompletionBackend>,
        importer: Option<Arc<Neo4jImporter>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            backend,
            importer,
            metrics,
            runs: DashMap::new(),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn has_importer(&self) -> bool {
        self.importer.is_some()
    }

    /// Register a run and execute it in the background.
    pub fn start(self: &Arc<Self>, request: RunRequest) -> Uuid {
        let (run_id, progress) = self.register();

        let service = self.clone();
        tokio::spawn(async move {
            let timer = TimedOperation::start();
            let outcome = service.execute(run_id, request, progress).await;
            service.finish(run_id, outcome, timer);
        });
        run_id
    }

    /// Run to completion in the caller's task.
    pub async fn run_to_completion(self: &Arc<Self>, request: RunRequest) -> Result<RunView> {
        let (run_id, progress) = self.register();

        let timer = TimedOperation::start();
        let outcome = self.execute(run_id, request, progress).await;
        self.finish(run_id, outcome, timer);
        self.get(run_id).context("Run record disappeared")
    }

    fn register(&self) -> (Uuid, Arc<RunProgress>) {
        let run_id = Uuid::new_v4();
        let progress = Arc::new(RunProgress::new());
        self.runs.insert(
            run_id,
            RunRecord {
                status: RunStatus::Running,
                progress: progress.clone(),
                summary: None,
                artifacts: None,
                error: None,
            },
        );
        self.metrics.record_run_started();
        (run_id, progress)
    }

    pub fn get(&self, run_id: Uuid) -> Option<RunView> {
        self.runs.get(&run_id).map(|record| RunView {
            run_id,
            status: record.status,
            progress: record.progress.snapshot(),
            summary: record.summary.clone(),
            artifacts: record.artifacts.clone(),
            error: record.error.clone(),
        })
    }

    /// Stop scheduling documents; returns false for unknown runs.
    pub fn stop(&self, run_id: Uuid) -> bool {
        match self.runs.get(&run_id) {
            Some(record) => {
                record.progress.request_stop();
                info!(run_id = %run_id, "Stop requested");
                true
            }
            None => false,
        }
    }

    async fn execute(
        &self,
        run_id: Uuid,
        request: RunRequest,
        progress: Arc<RunProgress>,
    ) -> Result<(RunSummary, PathBuf)> {
        let corpus = ingest::load_corpus(&PathBuf::from(&request.path)).await?;

        let mut pipeline_config = self.config.pipeline.clone();
        if let Some(mode) = request.discovery_mode {
            pipeline_config.discovery_mode = mode;
        }
        let pipeline =
            CodingPipeline::new(self.backend.clone(), pipeline_config)?.with_progress(progress);

        let run = pipeline
            .run_with_id(run_id, &corpus, &request.existing)
            .await
            .context("Coding run aborted")?;

        let artifacts = ArtifactWriter::new(&self.config.output.directory)
            .write_run(&run)
            .await?;

        if let Some(importer) = &self.importer {
            // Artifacts already hold the run; a failed import is not a failed run
            if let Err(e) = importer.import_run(&run).await {
                warn!(run_id = %run_id, error = %e, "Neo4j import failed");
            }
        }

        Ok((run.summary, artifacts))
    }

    fn finish(&self, run_id: Uuid, outcome: Result<(RunSummary, PathBuf)>, timer: TimedOperation) {
        let Some(mut record) = self.runs.get_mut(&run_id) else {
            return;
        };
        match outcome {
            Ok((summary, artifacts)) => {
                self.metrics.record_run_completed(&summary, timer.elapsed());
                record.status = RunStatus::Completed;
                record.summary = Some(summary);
                record.artifacts = Some(artifacts);
            }
            Err(e) => {
                error!(run_id = %run_id, error = %format!("{:#}", e), "Run failed");
                self.metrics.record_run_failed(timer.elapsed());
                record.status = RunStatus::Failed;
                record.error = Some(format!("{:#}", e));
            }
        }
    }
}
