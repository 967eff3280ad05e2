//! Dialogue-aware thematic connection detection.
//!
//! Quotes are compared only against earlier quotes inside a sliding window of
//! `connection_window_size` positions, so a document of `n` quotes costs at most
//! `n * W` oracle calls instead of `n * (n - 1) / 2`.

use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::codebook::CodeTaxonomy;
use crate::config::{ModelSettings, PipelineConfig};
use crate::error::OracleError;
use crate::llm::{CompletionRequest, OracleTask, TextCompletionGateway};
use crate::prompt;
use crate::schema::{Quote, RelationKind, ThematicConnection, ValidationWarning, WarningKind};
use crate::shape::{Field, OutputShape};

pub fn connection_shape() -> OutputShape {
    OutputShape::object(vec![
        Field::required("relation_kind", OutputShape::Enum(RelationKind::ALL.to_vec())),
        Field::required("confidence", OutputShape::Number),
        Field::optional("rationale", OutputShape::String),
    ])
}

#[derive(Debug, Deserialize)]
struct ConnectionResponse {
    relation_kind: String,
    confidence: f64,
    #[serde(default)]
    rationale: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub connections: Vec<ThematicConnection>,
    pub pairs_compared: usize,
    pub warnings: Vec<ValidationWarning>,
}

pub struct DialogueConnectionDetector {
    gateway: Arc<TextCompletionGateway>,
    settings: ModelSettings,
    window_size: usize,
    min_confidence: f64,
    max_connection_rate: Option<f64>,
}

impl DialogueConnectionDetector {
    pub fn new(gateway: Arc<TextCompletionGateway>, config: &PipelineConfig) -> Self {
        Self {
            gateway,
            settings: config.phases.connection_detection.clone(),
            window_size: config.connection_window_size,
            min_confidence: config.min_connection_confidence,
            max_connection_rate: config
                .enforce_connection_ceiling
                .then_some(config.max_connection_rate),
        }
    }

    /// Arena indices `(target, candidate)` to compare, in target order. Candidates
    /// are strictly earlier and at most `window` positions back.
    pub fn candidate_pairs(quotes: &[Quote], window: usize) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for target in 0..quotes.len() {
            let position = quotes[target].sequence_position;
            for candidate in (0..target).rev() {
                let earlier = quotes[candidate].sequence_position;
                if earlier >= position {
                    continue;
                }
                if position - earlier > window {
                    break;
                }
                pairs.push((target, candidate));
            }
        }
        pairs
    }

    /// Classify every in-window pair. Pairs run one at a time so a document holds at
    /// most one in-flight oracle call. Any permanent oracle failure fails the whole
    /// detection.
    pub async fn detect(
        &self,
        document_id: &str,
        quotes: &[Quote],
        taxonomy: &CodeTaxonomy,
    ) -> Result<Detection, OracleError> {
        let mut ordered: Vec<&Quote> = quotes.iter().collect();
        ordered.sort_by_key(|q| q.sequence_position);
        let arena: Vec<Quote> = ordered.into_iter().cloned().collect();

        let pairs = Self::candidate_pairs(&arena, self.window_size);
        let shape = connection_shape();
        let mut detection = Detection::default();

        debug!(
            document_id = %document_id,
            quotes = arena.len(),
            pairs = pairs.len(),
            window = self.window_size,
            "Detecting thematic connections"
        );

        for (target, candidate) in pairs {
            let (target, candidate) = (&arena[target], &arena[candidate]);
            let request = CompletionRequest {
                task: OracleTask::ConnectionClassification {
                    document_id: document_id.to_string(),
                    target_position: target.sequence_position,
                    candidate_position: candidate.sequence_position,
                },
                prompt: prompt::build_connection_prompt(target, candidate, taxonomy, &shape),
                shape: shape.clone(),
                settings: self.settings.clone(),
            };

            let response: ConnectionResponse = self.gateway.complete_as(&request).await?;
            detection.pairs_compared += 1;

            let Some(kind) = RelationKind::parse(&response.relation_kind) else {
                detection.warnings.push(ValidationWarning::new(
                    WarningKind::UnknownRelationKind,
                    format!(
                        "{} -> {}: '{}' treated as none",
                        target.id, candidate.id, response.relation_kind
                    ),
                ));
                continue;
            };
            let confidence = response.confidence.clamp(0.0, 1.0);
            if !kind.is_edge() || confidence < self.min_confidence {
                continue;
            }

            detection.connections.push(ThematicConnection {
                from_quote_id: target.id.clone(),
                to_quote_id: candidate.id.clone(),
                relation_kind: kind,
                confidence,
                rationale: response.rationale.filter(|r| !r.trim().is_empty()),
            });
        }

        if let Some(ceiling) = self.max_connection_rate {
            let dropped = apply_ceiling(&mut detection.connections, arena.len(), ceiling);
            if dropped > 0 {
                warn!(
                    document_id = %document_id,
                    dropped = dropped,
                    ceiling = ceiling,
                    "Dropped weakest connections to respect the connection-rate ceiling"
                );
                detection.warnings.push(ValidationWarning::new(
                    WarningKind::ConnectionCeiling,
                    format!(
                        "dropped {} lowest-confidence connection(s) to keep the connection rate at or below {:.0}%",
                        dropped,
                        ceiling * 100.0
                    ),
                ));
            }
        }

        info!(
            document_id = %document_id,
            pairs_compared = detection.pairs_compared,
            connections = detection.connections.len(),
            "Connection detection complete"
        );

        Ok(detection)
    }
}

fn connection_rate(connections: &[ThematicConnection], total_quotes: usize) -> f64 {
    if total_quotes == 0 {
        return 0.0;
    }
    let touched: HashSet<&str> = connections
        .iter()
        .flat_map(|c| [c.from_quote_id.as_str(), c.to_quote_id.as_str()])
        .collect();
    touched.len() as f64 / total_quotes as f64
}

/// Remove lowest-confidence connections until the rate is at or below `ceiling`.
/// Returns how many were removed.
fn apply_ceiling(connections: &mut Vec<ThematicConnection>, total_quotes: usize, ceiling: f64) -> usize {
    let mut dropped = 0;
    while !connections.is_empty() && connection_rate(connections, total_quotes) > ceiling {
        let weakest = connections
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.confidence.total_cmp(&b.confidence))
            .map(|(i, _)| i)
            .unwrap_or(0);
        connections.remove(weakest);
        dropped += 1;
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::test_support::{ScriptedBackend, sample_schemas};
    use serde_json::json;

    fn quotes(n: usize) -> Vec<Quote> {
        (1..=n)
            .map(|i| Quote {
                id: format!("doc:q{:04}", i),
                text: format!("quote {}", i),
                line_start: i,
                line_end: i,
                sequence_position: i,
                speaker_name: Some(if i % 2 == 0 { "P1" } else { "I" }.to_string()),
                code_ids: vec!["WORK".to_string()],
                confidence: 0.9,
            })
            .collect()
    }

    fn detector(backend: Arc<ScriptedBackend>, config: PipelineConfig) -> DialogueConnectionDetector {
        let gateway = Arc::new(TextCompletionGateway::new(backend, RetryPolicy::new(0, 1, 1)));
        DialogueConnectionDetector::new(gateway, &config)
    }

    fn positions(task: &OracleTask) -> (usize, usize) {
        match task {
            OracleTask::ConnectionClassification {
                target_position,
                candidate_position,
                ..
            } => (*target_position, *candidate_position),
            other => panic!("unexpected task {}", other),
        }
    }

    #[test]
    fn test_candidate_pairs_respect_window() {
        let quotes = quotes(50);
        let pairs = DialogueConnectionDetector::candidate_pairs(&quotes, 10);
        assert_eq!(pairs.len(), 445);
        for (target, candidate) in &pairs {
            let (t, c) = (quotes[*target].sequence_position, quotes[*candidate].sequence_position);
            assert!(c < t);
            assert!(t - c <= 10);
        }

        assert!(DialogueConnectionDetector::candidate_pairs(&quotes[..1], 10).is_empty());
        assert_eq!(DialogueConnectionDetector::candidate_pairs(&quotes[..5], 1).len(), 4);
    }

    #[tokio::test]
    async fn test_connections_point_backward_within_window() {
        let backend = Arc::new(ScriptedBackend::responder(|request| {
            let (target, candidate) = positions(&request.task);
            let kind = if target - candidate == 1 { "builds_on" } else { "none" };
            Ok(json!({"relation_kind": kind, "confidence": 0.8}).to_string())
        }));
        let config = PipelineConfig {
            connection_window_size: 3,
            ..PipelineConfig::default()
        };

        let detection = detector(backend.clone(), config)
            .detect("doc", &quotes(6), &sample_schemas().taxonomy)
            .await
            .unwrap();

        // 1 + 2 + 3 + 3 + 3
        assert_eq!(detection.pairs_compared, 12);
        assert_eq!(backend.tasks().len(), 12);
        assert_eq!(detection.connections.len(), 5);
        for connection in &detection.connections {
            let from: usize = connection.from_quote_id[5..].parse().unwrap();
            let to: usize = connection.to_quote_id[5..].parse().unwrap();
            assert_eq!(from, to + 1);
        }
        assert_eq!(backend.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_and_unknown_kinds_are_not_recorded() {
        let backend = Arc::new(ScriptedBackend::sequence(vec![Ok(
            json!({"relation_kind": "supports", "confidence": 0.2}).to_string(),
        )]));

        let detection = detector(backend, PipelineConfig::default())
            .detect("doc", &quotes(2), &sample_schemas().taxonomy)
            .await
            .unwrap();
        assert_eq!(detection.pairs_compared, 1);
        assert!(detection.connections.is_empty());

        let backend = Arc::new(ScriptedBackend::sequence(vec![Ok(
            json!({"relation_kind": "Challenges", "confidence": 1.7, "rationale": "disagrees"}).to_string(),
        )]));
        let detection = detector(backend, PipelineConfig::default())
            .detect("doc", &quotes(2), &sample_schemas().taxonomy)
            .await
            .unwrap();
        let connection = &detection.connections[0];
        assert_eq!(connection.relation_kind, RelationKind::Challenges);
        assert_eq!(connection.confidence, 1.0);
        assert_eq!(connection.rationale.as_deref(), Some("disagrees"));
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_detection() {
        let backend = Arc::new(ScriptedBackend::sequence(vec![
            Ok(json!({"relation_kind": "none", "confidence": 0.9}).to_string()),
            Err(OracleError::Permanent("model not found".to_string())),
        ]));

        let result = detector(backend, PipelineConfig::default())
            .detect("doc", &quotes(3), &sample_schemas().taxonomy)
            .await;
        assert!(matches!(result, Err(OracleError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_ceiling_drops_weakest_connections() {
        let backend = Arc::new(ScriptedBackend::responder(|request| {
            let (target, candidate) = positions(&request.task);
            if target - candidate == 1 {
                let confidence = 0.5 + target as f64 * 0.05;
                Ok(json!({"relation_kind": "supports", "confidence": confidence}).to_string())
            } else {
                Ok(json!({"relation_kind": "none", "confidence": 0.9}).to_string())
            }
        }));
        let config = PipelineConfig {
            connection_window_size: 2,
            enforce_connection_ceiling: true,
            max_connection_rate: 0.5,
            ..PipelineConfig::default()
        };

        let detection = detector(backend, config)
            .detect("doc", &quotes(6), &sample_schemas().taxonomy)
            .await
            .unwrap();

        assert!(connection_rate(&detection.connections, 6) <= 0.5);
        assert!(detection.connections.iter().any(|c| c.from_quote_id == "doc:q0006"));
        assert_eq!(detection.warnings[0].kind, WarningKind::ConnectionCeiling);
    }
}
