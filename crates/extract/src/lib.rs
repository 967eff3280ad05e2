pub mod codebook;
pub mod config;
pub mod connections;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod llm;
pub mod normalizer;
pub mod prompt;
pub mod quality;
pub mod retry;
pub mod schema;
pub mod shape;

#[cfg(test)]
mod test_support;

pub use codebook::{
    Code, CodeTaxonomy, DiscoveredSchemas, EntityRelationshipSchema, ExistingSchemas,
    SpeakerPropertySchema,
};
pub use config::{DiscoveryMode, ModelSettings, PipelineConfig};
pub use connections::{DialogueConnectionDetector, Detection};
pub use discovery::{DiscoveryPhase, SchemaDiscoveryCoordinator};
pub use engine::{ConcurrentApplicationEngine, ProgressSnapshot, RunProgress};
pub use error::{OracleError, PipelineError};
pub use extractor::{QuoteExtractor, RawExtraction};
pub use llm::{CompletionBackend, CompletionRequest, OllamaClient, OracleTask, TextCompletionGateway};
pub use normalizer::EntityNormalizer;
pub use quality::{AlertKind, QualityAlert, QualityGate, QualityReport, RunQualitySummary};
pub use retry::{RetryConfig, RetryPolicy};
pub use schema::{
    DocumentFailure, DocumentOutcome, DocumentResult, Entity, Quote, RelationKind, Relationship,
    Speaker, ThematicConnection, ValidationWarning,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// What a run reports back: which documents made it, which did not and why, and
/// how the connection statistics look across the corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub succeeded: Vec<String>,
    pub failed: Vec<DocumentFailure>,
    pub quality: RunQualitySummary,
    pub warnings: usize,
    pub oracle_calls: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRun {
    pub run_id: Uuid,
    pub schemas: DiscoveredSchemas,
    pub outcomes: Vec<DocumentOutcome>,
    pub summary: RunSummary,
}

impl ExtractionRun {
    pub fn results(&self) -> impl Iterator<Item = &DocumentResult> {
        self.outcomes.iter().filter_map(DocumentOutcome::as_result)
    }

    pub fn failures(&self) -> impl Iterator<Item = &DocumentFailure> {
        self.outcomes.iter().filter_map(DocumentOutcome::as_failure)
    }
}

/// Discover-then-apply: three corpus-wide discovery passes, then every document
/// coded concurrently against the resulting schema snapshot.
pub struct CodingPipeline {
    config: Arc<PipelineConfig>,
    gateway: Arc<TextCompletionGateway>,
    progress: Arc<RunProgress>,
}

impl CodingPipeline {
    pub fn new(backend: Arc<dyn CompletionBackend>, config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let policy = RetryPolicy::from_config(&config.retry);
        Ok(Self {
            config: Arc::new(config),
            gateway: Arc::new(TextCompletionGateway::new(backend, policy)),
            progress: Arc::new(RunProgress::new()),
        })
    }

    pub fn with_progress(mut self, progress: Arc<RunProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> Arc<RunProgress> {
        self.progress.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Fails only when schema discovery fails; document failures are reported in
    /// the returned run.
    pub async fn run(
        &self,
        corpus: &ingest::Corpus,
        existing: &ExistingSchemas,
    ) -> Result<ExtractionRun, PipelineError> {
        self.run_with_id(Uuid::new_v4(), corpus, existing).await
    }

    pub async fn run_with_id(
        &self,
        run_id: Uuid,
        corpus: &ingest::Corpus,
        existing: &ExistingSchemas,
    ) -> Result<ExtractionRun, PipelineError> {
        info!(run_id = %run_id, documents = corpus.len(), "Starting coding run");

        let coordinator = SchemaDiscoveryCoordinator::new(self.gateway.clone(), self.config.clone());
        let schemas = Arc::new(coordinator.discover(corpus, existing).await?);

        let engine = ConcurrentApplicationEngine::new(self.gateway.clone(), &self.config)
            .with_progress(self.progress.clone());
        let outcomes = engine.apply_all(&corpus.documents, schemas.clone()).await;

        let summary = RunSummary {
            run_id,
            succeeded: outcomes
                .iter()
                .filter_map(DocumentOutcome::as_result)
                .map(|r| r.document_id.clone())
                .collect(),
            failed: outcomes
                .iter()
                .filter_map(DocumentOutcome::as_failure)
                .cloned()
                .collect(),
            quality: QualityGate::summarize(
                outcomes
                    .iter()
                    .filter_map(DocumentOutcome::as_result)
                    .map(|r| &r.quality_report),
            ),
            warnings: outcomes
                .iter()
                .filter_map(DocumentOutcome::as_result)
                .map(|r| r.warnings.len())
                .sum(),
            oracle_calls: self.gateway.calls_made(),
        };

        info!(
            run_id = %run_id,
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            over_connecting = summary.quality.over_connecting,
            under_connecting = summary.quality.under_connecting,
            narrow_confidence = summary.quality.narrow_confidence,
            oracle_calls = summary.oracle_calls,
            "Coding run complete"
        );

        Ok(ExtractionRun {
            run_id,
            schemas: Arc::unwrap_or_clone(schemas),
            outcomes,
            summary,
        })
    }
}
