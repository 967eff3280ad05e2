//! Corpus-wide schema discovery: codes, then speaker properties, then entity and
//! relationship types. Each pass sees the whole corpus plus the schemas of the
//! passes before it; any failure aborts the run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::codebook::{
    Code, CodeTaxonomy, DiscoveredSchemas, EntityRelationshipSchema, EntityType,
    ExistingSchemas, PropertyDefinition, RelationshipType, SpeakerPropertySchema,
};
use crate::config::{DiscoveryMode, ModelSettings, PipelineConfig};
use crate::error::PipelineError;
use crate::llm::{CompletionRequest, OracleTask, TextCompletionGateway};
use crate::prompt;
use crate::shape::{Field, OutputShape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryPhase {
    Codes,
    SpeakerProperties,
    Entities,
}

impl fmt::Display for DiscoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryPhase::Codes => write!(f, "code taxonomy"),
            DiscoveryPhase::SpeakerProperties => write!(f, "speaker property"),
            DiscoveryPhase::Entities => write!(f, "entity/relationship"),
        }
    }
}

#[derive(Deserialize)]
struct CodeDiscoveryResponse {
    codes: Vec<Code>,
}

#[derive(Deserialize)]
struct SpeakerDiscoveryResponse {
    properties: Vec<PropertyDefinition>,
}

#[derive(Deserialize)]
struct EntityDiscoveryResponse {
    entity_types: Vec<EntityType>,
    #[serde(default)]
    relationship_types: Vec<RelationshipType>,
}

pub fn code_discovery_shape() -> OutputShape {
    OutputShape::object(vec![Field::required(
        "codes",
        OutputShape::array_of(OutputShape::object(vec![
            Field::required("id", OutputShape::String),
            Field::required("name", OutputShape::String),
            Field::required("description", OutputShape::String),
            Field::optional("parent_id", OutputShape::String),
        ])),
    )])
}

pub fn speaker_discovery_shape() -> OutputShape {
    OutputShape::object(vec![Field::required(
        "properties",
        OutputShape::array_of(OutputShape::object(vec![
            Field::required("name", OutputShape::String),
            Field::required("property_type", OutputShape::String),
            Field::optional("description", OutputShape::String),
            Field::optional("possible_values", OutputShape::array_of(OutputShape::String)),
        ])),
    )])
}

pub fn entity_discovery_shape() -> OutputShape {
    OutputShape::object(vec![
        Field::required(
            "entity_types",
            OutputShape::array_of(OutputShape::object(vec![
                Field::required("name", OutputShape::String),
                Field::optional("description", OutputShape::String),
            ])),
        ),
        Field::required(
            "relationship_types",
            OutputShape::array_of(OutputShape::object(vec![
                Field::required("name", OutputShape::String),
                Field::optional("description", OutputShape::String),
                Field::required("source_types", OutputShape::array_of(OutputShape::String)),
                Field::required("target_types", OutputShape::array_of(OutputShape::String)),
            ])),
        ),
    ])
}

pub struct SchemaDiscoveryCoordinator {
    gateway: Arc<TextCompletionGateway>,
    config: Arc<PipelineConfig>,
}

impl SchemaDiscoveryCoordinator {
    pub fn new(gateway: Arc<TextCompletionGateway>, config: Arc<PipelineConfig>) -> Self {
        Self { gateway, config }
    }

    /// Run the three passes in order. `existing` is consulted in mixed and closed
    /// modes and ignored in open mode.
    pub async fn discover(
        &self,
        corpus: &ingest::Corpus,
        existing: &ExistingSchemas,
    ) -> Result<DiscoveredSchemas, PipelineError> {
        if corpus.is_empty() {
            return Err(PipelineError::EmptyCorpus);
        }

        let mode = self.config.discovery_mode;
        let tokens = corpus.estimated_tokens();
        if tokens > self.config.max_corpus_tokens {
            warn!(
                estimated_tokens = tokens,
                limit = self.config.max_corpus_tokens,
                "Corpus may exceed the model context window"
            );
        }
        info!(
            mode = ?mode,
            documents = corpus.len(),
            estimated_tokens = tokens,
            "Starting schema discovery"
        );

        let text = corpus.concatenated();

        let taxonomy = self
            .discover_codes(&text, mode, existing.taxonomy.as_ref())
            .await?;
        let speaker_schema = self
            .discover_speaker_properties(&text, &taxonomy, mode, existing.speaker_schema.as_ref())
            .await?;
        let entity_schema = self
            .discover_entities(
                &text,
                &taxonomy,
                &speaker_schema,
                mode,
                existing.entity_schema.as_ref(),
            )
            .await?;

        info!(
            codes = taxonomy.len(),
            depth = taxonomy.depth(),
            speaker_properties = speaker_schema.len(),
            entity_types = entity_schema.entity_types.len(),
            relationship_types = entity_schema.relationship_types.len(),
            "Schema discovery complete"
        );

        Ok(DiscoveredSchemas {
            taxonomy,
            speaker_schema,
            entity_schema,
        })
    }

    /// Decide what a pass should do with a supplied schema: `Ok(Some(s))` means use
    /// `s` without asking the oracle.
    fn supplied<'a, T>(
        phase: DiscoveryPhase,
        mode: DiscoveryMode,
        existing: Option<&'a T>,
        validate: impl Fn(&T) -> Result<(), String>,
    ) -> Result<Option<&'a T>, PipelineError> {
        if mode == DiscoveryMode::Open {
            return Ok(None);
        }
        match existing {
            Some(schema) => {
                validate(schema)
                    .map_err(|reason| PipelineError::UnusableSchema { phase, reason })?;
                Ok(Some(schema))
            }
            None if mode == DiscoveryMode::Closed => Err(PipelineError::UnusableSchema {
                phase,
                reason: "closed discovery requires a supplied schema".to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn ask<T: serde::de::DeserializeOwned>(
        &self,
        phase: DiscoveryPhase,
        task: OracleTask,
        prompt: String,
        shape: OutputShape,
        settings: &ModelSettings,
    ) -> Result<T, PipelineError> {
        let request = CompletionRequest {
            task,
            prompt,
            shape,
            settings: settings.clone(),
        };
        self.gateway
            .complete_as::<T>(&request)
            .await
            .map_err(|source| PipelineError::SchemaDiscovery { phase, source })
    }

    fn report(phase: DiscoveryPhase, warnings: &[String]) {
        for warning in warnings {
            warn!(phase = %phase, "{}", warning);
        }
    }

    async fn discover_codes(
        &self,
        corpus: &str,
        mode: DiscoveryMode,
        existing: Option<&CodeTaxonomy>,
    ) -> Result<CodeTaxonomy, PipelineError> {
        let phase = DiscoveryPhase::Codes;
        let max_depth = self.config.code_hierarchy_depth;
        let existing = Self::supplied(phase, mode, existing, CodeTaxonomy::validate)?;

        if mode == DiscoveryMode::Closed {
            if let Some(taxonomy) = existing {
                info!(phase = %phase, codes = taxonomy.len(), "Using supplied taxonomy");
                return Ok(taxonomy.clone());
            }
        }

        let shape = code_discovery_shape();
        let prompt = prompt::build_code_discovery_prompt(corpus, max_depth, existing, &shape);
        let response: CodeDiscoveryResponse = self
            .ask(phase, OracleTask::CodeDiscovery, prompt, shape, &self.config.phases.code_discovery)
            .await?;

        let mut warnings = Vec::new();
        let taxonomy = match existing {
            Some(existing) => existing.merge_additional(response.codes, max_depth, &mut warnings),
            None => CodeTaxonomy::build(response.codes, max_depth, &mut warnings),
        };
        Self::report(phase, &warnings);

        if taxonomy.is_empty() {
            return Err(PipelineError::UnusableSchema {
                phase,
                reason: "no codes were discovered".to_string(),
            });
        }

        info!(phase = %phase, codes = taxonomy.len(), depth = taxonomy.depth(), "Discovery pass complete");
        Ok(taxonomy)
    }

    async fn discover_speaker_properties(
        &self,
        corpus: &str,
        taxonomy: &CodeTaxonomy,
        mode: DiscoveryMode,
        existing: Option<&SpeakerPropertySchema>,
    ) -> Result<SpeakerPropertySchema, PipelineError> {
        let phase = DiscoveryPhase::SpeakerProperties;
        let existing = Self::supplied(phase, mode, existing, SpeakerPropertySchema::validate)?;

        if mode == DiscoveryMode::Closed {
            if let Some(schema) = existing {
                info!(phase = %phase, properties = schema.len(), "Using supplied speaker schema");
                return Ok(schema.clone());
            }
        }

        let shape = speaker_discovery_shape();
        let prompt = prompt::build_speaker_discovery_prompt(corpus, taxonomy, existing, &shape);
        let response: SpeakerDiscoveryResponse = self
            .ask(
                phase,
                OracleTask::SpeakerDiscovery,
                prompt,
                shape,
                &self.config.phases.speaker_discovery,
            )
            .await?;

        let mut warnings = Vec::new();
        let schema = match existing {
            Some(existing) => existing.merge_additional(response.properties, &mut warnings),
            None => SpeakerPropertySchema::build(response.properties, &mut warnings),
        };
        Self::report(phase, &warnings);

        if schema.is_empty() {
            warn!(phase = %phase, "No speaker properties discovered");
        }
        info!(phase = %phase, properties = schema.len(), "Discovery pass complete");
        Ok(schema)
    }

    async fn discover_entities(
        &self,
        corpus: &str,
        taxonomy: &CodeTaxonomy,
        speakers: &SpeakerPropertySchema,
        mode: DiscoveryMode,
        existing: Option<&EntityRelationshipSchema>,
    ) -> Result<EntityRelationshipSchema, PipelineError> {
        let phase = DiscoveryPhase::Entities;
        let existing = Self::supplied(phase, mode, existing, EntityRelationshipSchema::validate)?;

        if mode == DiscoveryMode::Closed {
            if let Some(schema) = existing {
                info!(phase = %phase, entity_types = schema.entity_types.len(), "Using supplied entity schema");
                return Ok(schema.clone());
            }
        }

        let shape = entity_discovery_shape();
        let prompt =
            prompt::build_entity_discovery_prompt(corpus, taxonomy, speakers, existing, &shape);
        let response: EntityDiscoveryResponse = self
            .ask(
                phase,
                OracleTask::EntityDiscovery,
                prompt,
                shape,
                &self.config.phases.entity_discovery,
            )
            .await?;

        let mut warnings = Vec::new();
        let schema = match existing {
            Some(existing) => existing.merge_additional(
                response.entity_types,
                response.relationship_types,
                &mut warnings,
            ),
            None => EntityRelationshipSchema::build(
                response.entity_types,
                response.relationship_types,
                &mut warnings,
            ),
        };
        Self::report(phase, &warnings);

        info!(
            phase = %phase,
            entity_types = schema.entity_types.len(),
            relationship_types = schema.relationship_types.len(),
            "Discovery pass complete"
        );
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OracleError;
    use crate::retry::RetryPolicy;
    use crate::test_support::ScriptedBackend;
    use ingest::{Corpus, Document};

    const CODES: &str = r#"{"codes": [
        {"id": "WORK", "name": "Work", "description": "work", "parent_id": null},
        {"id": "PAY", "name": "Pay", "description": "pay", "parent_id": "WORK"}
    ]}"#;
    const DEEP_CODES: &str = r#"{"codes": [
        {"id": "PAY", "name": "Pay", "description": "pay", "parent_id": "WORK"},
        {"id": "LOWPAY", "name": "Low pay", "description": "low pay", "parent_id": "PAY"}
    ]}"#;
    const PROPERTIES: &str = r#"{"properties": [
        {"name": "role", "property_type": "categorical", "possible_values": ["nurse", "doctor"]}
    ]}"#;
    const ENTITIES: &str = r#"{"entity_types": [{"name": "Organization"}, {"name": "Person"}],
        "relationship_types": [{"name": "WORKS_FOR", "source_types": ["Person"], "target_types": ["Organization"]}]}"#;

    fn corpus() -> Corpus {
        Corpus::new(vec![
            Document::new("a.txt".to_string(), "I: how is work?\nP: tiring".to_string()),
            Document::new("b.txt".to_string(), "I: pay?\nP: too low".to_string()),
        ])
    }

    fn coordinator(backend: Arc<ScriptedBackend>, mode: DiscoveryMode) -> SchemaDiscoveryCoordinator {
        let gateway = Arc::new(TextCompletionGateway::new(backend, RetryPolicy::new(1, 1, 2)));
        let config = PipelineConfig {
            discovery_mode: mode,
            code_hierarchy_depth: 2,
            ..PipelineConfig::default()
        };
        SchemaDiscoveryCoordinator::new(gateway, Arc::new(config))
    }

    #[tokio::test]
    async fn test_open_discovery_runs_three_passes_in_order() {
        let backend = Arc::new(ScriptedBackend::sequence(vec![
            Ok(CODES.to_string()),
            Ok(PROPERTIES.to_string()),
            Ok(ENTITIES.to_string()),
        ]));
        let schemas = coordinator(backend.clone(), DiscoveryMode::Open)
            .discover(&corpus(), &ExistingSchemas::default())
            .await
            .unwrap();

        assert_eq!(
            backend.tasks(),
            vec![OracleTask::CodeDiscovery, OracleTask::SpeakerDiscovery, OracleTask::EntityDiscovery]
        );
        assert_eq!(schemas.taxonomy.len(), 2);
        assert_eq!(schemas.speaker_schema.len(), 1);
        assert_eq!(schemas.entity_schema.relationship_types.len(), 1);

        // Every pass sees the whole corpus; later passes see earlier schemas
        let prompts = backend.prompts();
        for prompt in &prompts {
            assert!(prompt.contains("P: tiring") && prompt.contains("P: too low"));
        }
        assert!(prompts[1].contains("[PAY] Pay"));
        assert!(prompts[2].contains("role"));
    }

    #[tokio::test]
    async fn test_failure_in_second_pass_aborts() {
        let backend = Arc::new(ScriptedBackend::sequence(vec![
            Ok(CODES.to_string()),
            Err(OracleError::Permanent("refused".to_string())),
        ]));
        let err = coordinator(backend.clone(), DiscoveryMode::Open)
            .discover(&corpus(), &ExistingSchemas::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::SchemaDiscovery { phase: DiscoveryPhase::SpeakerProperties, .. }
        ));
        assert_eq!(backend.tasks().len(), 2);
    }

    #[tokio::test]
    async fn test_mixed_mode_preserves_existing_codes() {
        let mut warnings = Vec::new();
        let existing_taxonomy = CodeTaxonomy::build(
            vec![Code {
                id: "WORK".to_string(),
                name: "Work".to_string(),
                description: "Original description".to_string(),
                level: 0,
                parent_id: None,
            }],
            2,
            &mut warnings,
        );
        let existing = ExistingSchemas {
            taxonomy: Some(existing_taxonomy.clone()),
            ..ExistingSchemas::default()
        };

        let backend = Arc::new(ScriptedBackend::sequence(vec![
            Ok(CODES.to_string()),
            Ok(PROPERTIES.to_string()),
            Ok(ENTITIES.to_string()),
        ]));
        let schemas = coordinator(backend.clone(), DiscoveryMode::Mixed)
            .discover(&corpus(), &existing)
            .await
            .unwrap();

        assert_eq!(schemas.taxonomy.codes[0], existing_taxonomy.codes[0]);
        assert_eq!(schemas.taxonomy.codes[0].description, "Original description");
        assert!(schemas.taxonomy.contains("PAY"));
        assert!(backend.prompts()[0].contains("EXISTING CODES"));
    }

    #[tokio::test]
    async fn test_mixed_mode_respects_configured_depth() {
        let existing_taxonomy: CodeTaxonomy =
            serde_json::from_str(r#"{"codes": [{"id": "WORK", "name": "Work", "level": 1}]}"#)
                .unwrap();
        let existing = ExistingSchemas {
            taxonomy: Some(existing_taxonomy),
            ..ExistingSchemas::default()
        };

        let backend = Arc::new(ScriptedBackend::sequence(vec![
            Ok(DEEP_CODES.to_string()),
            Ok(PROPERTIES.to_string()),
            Ok(ENTITIES.to_string()),
        ]));
        let schemas = coordinator(backend, DiscoveryMode::Mixed)
            .discover(&corpus(), &existing)
            .await
            .unwrap();

        assert!(schemas.taxonomy.contains("PAY"));
        assert!(!schemas.taxonomy.contains("LOWPAY"));
        assert!(schemas.taxonomy.depth() <= 2);
        assert_eq!(schemas.taxonomy.max_depth, 2);
    }

    #[tokio::test]
    async fn test_closed_mode_skips_oracle_for_supplied_schemas() {
        let mut warnings = Vec::new();
        let existing = ExistingSchemas {
            taxonomy: Some(CodeTaxonomy::build(
                vec![Code {
                    id: "WORK".to_string(),
                    name: "Work".to_string(),
                    description: String::new(),
                    level: 0,
                    parent_id: None,
                }],
                2,
                &mut warnings,
            )),
            speaker_schema: Some(SpeakerPropertySchema::default()),
            entity_schema: Some(EntityRelationshipSchema::default()),
        };
        let backend = Arc::new(ScriptedBackend::sequence(vec![]));

        let schemas = coordinator(backend.clone(), DiscoveryMode::Closed)
            .discover(&corpus(), &existing)
            .await
            .unwrap();

        assert!(backend.tasks().is_empty());
        assert_eq!(schemas.taxonomy.len(), 1);

        let missing = coordinator(backend, DiscoveryMode::Closed)
            .discover(&corpus(), &ExistingSchemas::default())
            .await;
        assert!(matches!(missing, Err(PipelineError::UnusableSchema { .. })));
    }

    #[tokio::test]
    async fn test_empty_taxonomy_is_fatal() {
        let backend = Arc::new(ScriptedBackend::sequence(vec![Ok(r#"{"codes": []}"#.to_string())]));
        let err = coordinator(backend, DiscoveryMode::Open)
            .discover(&corpus(), &ExistingSchemas::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnusableSchema { phase: DiscoveryPhase::Codes, .. }));
    }
}
