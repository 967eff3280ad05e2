use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use ingest::Document;

use crate::codebook::DiscoveredSchemas;
use crate::config::PipelineConfig;
use crate::connections::DialogueConnectionDetector;
use crate::error::OracleError;
use crate::extractor::QuoteExtractor;
use crate::llm::TextCompletionGateway;
use crate::quality::QualityGate;
use crate::schema::{DocumentFailure, DocumentOutcome, DocumentResult, FailureKind};

/// Live counters for one run, shared with whoever started it.
#[derive(Debug, Default)]
pub struct RunProgress {
    total: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    stop_requested: AtomicBool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub stop_requested: bool,
}

impl RunProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Documents admitted after this call are reported as skipped; documents
    /// already running finish normally.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.completed.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            stop_requested: self.is_stop_requested(),
        }
    }

    fn record(&self, outcome: &DocumentOutcome) {
        match outcome {
            DocumentOutcome::Completed(_) => self.completed.fetch_add(1, Ordering::SeqCst),
            DocumentOutcome::Failed(_) => self.failed.fetch_add(1, Ordering::SeqCst),
        };
    }
}

/// Extraction, connection detection and quality assessment for one document.
pub struct DocumentProcessor {
    extractor: QuoteExtractor,
    detector: DialogueConnectionDetector,
    gate: QualityGate,
}

impl DocumentProcessor {
    pub fn new(gateway: Arc<TextCompletionGateway>, config: &PipelineConfig) -> Self {
        Self {
            extractor: QuoteExtractor::new(gateway.clone(), config.phases.quote_extraction.clone()),
            detector: DialogueConnectionDetector::new(gateway, config),
            gate: QualityGate::new(config.quality.clone()),
        }
    }

    pub async fn process(
        &self,
        document: &Document,
        schemas: &DiscoveredSchemas,
    ) -> Result<DocumentResult, OracleError> {
        let extraction = self.extractor.extract(document, schemas).await?;
        let detection = self
            .detector
            .detect(&document.doc_id, &extraction.quotes, &schemas.taxonomy)
            .await?;
        let quality_report = self.gate.assess(&extraction.quotes, &detection.connections);

        for alert in &quality_report.alerts {
            warn!(document_id = %document.doc_id, kind = ?alert.kind, "{}", alert.message);
        }

        let mut warnings = extraction.warnings;
        warnings.extend(detection.warnings);

        Ok(DocumentResult {
            document_id: document.doc_id.clone(),
            source: document.source.clone(),
            quotes: extraction.quotes,
            speakers: extraction.speakers,
            entities: extraction.entities,
            relationships: extraction.relationships,
            connections: detection.connections,
            pairs_compared: detection.pairs_compared,
            warnings,
            quality_report,
        })
    }
}

/// Fans documents out to tokio tasks, at most `max_concurrent_documents` at a time.
pub struct ConcurrentApplicationEngine {
    processor: Arc<DocumentProcessor>,
    permits: Arc<Semaphore>,
    document_timeout: Duration,
    progress: Arc<RunProgress>,
}

impl ConcurrentApplicationEngine {
    pub fn new(gateway: Arc<TextCompletionGateway>, config: &PipelineConfig) -> Self {
        Self {
            processor: Arc::new(DocumentProcessor::new(gateway, config)),
            permits: Arc::new(Semaphore::new(config.max_concurrent_documents.max(1))),
            document_timeout: Duration::from_secs(config.document_timeout_secs),
            progress: Arc::new(RunProgress::new()),
        }
    }

    pub fn with_progress(mut self, progress: Arc<RunProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_document_timeout(mut self, timeout: Duration) -> Self {
        self.document_timeout = timeout;
        self
    }

    pub fn progress(&self) -> Arc<RunProgress> {
        self.progress.clone()
    }

    /// Process every document against the shared schema snapshot. One outcome per
    /// input document, in input order. A failing document never affects another.
    pub async fn apply_all(
        &self,
        documents: &[Document],
        schemas: Arc<DiscoveredSchemas>,
    ) -> Vec<DocumentOutcome> {
        self.progress.total.store(documents.len(), Ordering::SeqCst);
        info!(
            documents = documents.len(),
            max_concurrent = self.permits.available_permits(),
            "Applying schemas to documents"
        );

        let handles: Vec<_> = documents
            .iter()
            .cloned()
            .map(|document| {
                let processor = self.processor.clone();
                let permits = self.permits.clone();
                let progress = self.progress.clone();
                let schemas = schemas.clone();
                let timeout = self.document_timeout;

                tokio::spawn(async move {
                    let outcome =
                        Self::run_one(processor, permits, &progress, &document, &schemas, timeout)
                            .await;
                    progress.record(&outcome);
                    outcome
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(documents.len());
        for (handle, document) in handles.into_iter().zip(documents) {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(document_id = %document.doc_id, error = %e, "Document task panicked");
                    let outcome = failure(document, FailureKind::Panicked, e.to_string());
                    self.progress.record(&outcome);
                    outcome
                }
            };
            outcomes.push(outcome);
        }

        let snapshot = self.progress.snapshot();
        info!(
            completed = snapshot.completed,
            failed = snapshot.failed,
            "All documents processed"
        );
        outcomes
    }

    async fn run_one(
        processor: Arc<DocumentProcessor>,
        permits: Arc<Semaphore>,
        progress: &RunProgress,
        document: &Document,
        schemas: &DiscoveredSchemas,
        timeout: Duration,
    ) -> DocumentOutcome {
        let _permit = match permits.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return failure(document, FailureKind::Skipped, "engine shut down".to_string());
            }
        };
        if progress.is_stop_requested() {
            return failure(
                document,
                FailureKind::Skipped,
                "run stopped before the document was scheduled".to_string(),
            );
        }

        info!(document_id = %document.doc_id, source = %document.source, "Coding document");
        match tokio::time::timeout(timeout, processor.process(document, schemas)).await {
            Ok(Ok(result)) => {
                info!(
                    document_id = %document.doc_id,
                    quotes = result.quotes.len(),
                    connections = result.connections.len(),
                    connection_rate = result.quality_report.connection_rate,
                    "Document coded"
                );
                DocumentOutcome::Completed(result)
            }
            Ok(Err(e)) => {
                warn!(document_id = %document.doc_id, error = %e, "Document failed");
                failure(document, FailureKind::Oracle, e.to_string())
            }
            Err(_) => {
                warn!(
                    document_id = %document.doc_id,
                    timeout_secs = timeout.as_secs(),
                    "Document timed out"
                );
                failure(
                    document,
                    FailureKind::Timeout,
                    format!("exceeded {:?} document timeout", timeout),
                )
            }
        }
    }
}

fn failure(document: &Document, kind: FailureKind, error: String) -> DocumentOutcome {
    DocumentOutcome::Failed(DocumentFailure {
        document_id: document.doc_id.clone(),
        source: document.source.clone(),
        kind,
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionRequest, OracleTask};
    use crate::retry::RetryPolicy;
    use crate::test_support::{ScriptedBackend, sample_schemas};
    use serde_json::json;

    fn documents(count: usize, lines: usize) -> Vec<Document> {
        (0..count)
            .map(|d| {
                let text = (1..=lines)
                    .map(|l| format!("P{}: line {}", d, l))
                    .collect::<Vec<_>>()
                    .join("\n");
                Document::new(format!("interviews/doc{}.txt", d), text)
            })
            .collect()
    }

    /// Extraction yields one quote per line; neighbouring quotes build on each other.
    fn answer(
        request: &CompletionRequest,
        quotes: usize,
        failing: Option<&str>,
    ) -> Result<String, OracleError> {
        match &request.task {
            OracleTask::QuoteExtraction { document_id } => {
                if Some(document_id.as_str()) == failing {
                    return Err(OracleError::Permanent("model refused".to_string()));
                }
                let quotes: Vec<_> = (1..=quotes)
                    .map(|i| {
                        json!({"text": format!("line {}", i), "line_start": i, "line_end": i,
                               "speaker_name": "P", "code_ids": ["WORK"], "confidence": 0.9})
                    })
                    .collect();
                Ok(json!({"quotes": quotes, "speakers": [], "entities": [], "relationships": []})
                    .to_string())
            }
            OracleTask::ConnectionClassification {
                target_position,
                candidate_position,
                ..
            } => {
                let kind = if target_position % 3 == 0 && target_position - candidate_position == 1 {
                    "builds_on"
                } else {
                    "none"
                };
                Ok(json!({"relation_kind": kind, "confidence": 0.55 + *target_position as f64 * 0.01})
                    .to_string())
            }
            other => Err(OracleError::Permanent(format!("unexpected task {}", other))),
        }
    }

    fn engine(backend: Arc<ScriptedBackend>, config: &PipelineConfig) -> ConcurrentApplicationEngine {
        let gateway = Arc::new(TextCompletionGateway::new(backend, RetryPolicy::new(0, 1, 1)));
        ConcurrentApplicationEngine::new(gateway, config)
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_order_preserved() {
        let docs = documents(4, 6);
        let failing = docs[1].doc_id.clone();
        let backend = Arc::new(ScriptedBackend::responder(move |request| {
            answer(request, 6, Some(&failing))
        }));
        let engine = engine(backend, &PipelineConfig::default());
        let progress = engine.progress();

        let outcomes = engine.apply_all(&docs, Arc::new(sample_schemas())).await;

        assert_eq!(outcomes.len(), 4);
        for (outcome, doc) in outcomes.iter().zip(&docs) {
            assert_eq!(outcome.document_id(), doc.doc_id);
        }
        let failure = outcomes[1].as_failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Oracle);
        assert!(failure.error.contains("model refused"));

        for index in [0, 2, 3] {
            let result = outcomes[index].as_result().unwrap();
            assert_eq!(result.quotes.len(), 6);
            // 1 + 2 + 3 + 4 + 5 pairs with the default window of 10
            assert_eq!(result.pairs_compared, 15);
            assert_eq!(result.connections.len(), 2);
            assert_eq!(result.quality_report.total_quotes, 6);
        }

        let snapshot = progress.snapshot();
        assert_eq!((snapshot.total, snapshot.completed, snapshot.failed), (4, 3, 1));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let backend = Arc::new(
            ScriptedBackend::responder(|request| answer(request, 3, None))
                .with_delay(Duration::from_millis(5)),
        );
        let config = PipelineConfig {
            max_concurrent_documents: 2,
            ..PipelineConfig::default()
        };

        let outcomes = engine(backend.clone(), &config)
            .apply_all(&documents(6, 3), Arc::new(sample_schemas()))
            .await;

        assert!(outcomes.iter().all(|o| o.as_result().is_some()));
        assert!(backend.max_in_flight() <= 2);
        assert!(backend.max_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_slow_documents_time_out() {
        let backend = Arc::new(
            ScriptedBackend::responder(|request| answer(request, 3, None))
                .with_delay(Duration::from_millis(200)),
        );
        let engine = engine(backend, &PipelineConfig::default())
            .with_document_timeout(Duration::from_millis(20));

        let outcomes = engine.apply_all(&documents(2, 3), Arc::new(sample_schemas())).await;

        for outcome in &outcomes {
            assert_eq!(outcome.as_failure().unwrap().kind, FailureKind::Timeout);
        }
    }

    #[tokio::test]
    async fn test_stop_skips_unscheduled_documents() {
        let backend = Arc::new(ScriptedBackend::responder(|request| answer(request, 3, None)));
        let progress = Arc::new(RunProgress::new());
        progress.request_stop();
        let engine = engine(backend.clone(), &PipelineConfig::default()).with_progress(progress.clone());

        let outcomes = engine.apply_all(&documents(3, 3), Arc::new(sample_schemas())).await;

        assert!(outcomes
            .iter()
            .all(|o| o.as_failure().is_some_and(|f| f.kind == FailureKind::Skipped)));
        assert!(backend.tasks().is_empty());
        assert_eq!(progress.finished(), 3);
    }
}
