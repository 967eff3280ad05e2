//! Per-document extraction: one oracle call for quotes, codes, speakers, entities
//! and relationships, followed by validation against the discovered schemas.

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::codebook::{DiscoveredSchemas, PropertyDefinition, PropertyType};
use crate::config::ModelSettings;
use crate::error::OracleError;
use crate::llm::{CompletionRequest, OracleTask, TextCompletionGateway};
use crate::normalizer::EntityNormalizer;
use crate::prompt;
use crate::schema::{
    Entity, EntityScope, Quote, Relationship, Speaker, ValidationWarning, WarningKind,
};
use crate::shape::{Field, OutputShape};

/// Accepts 12, 12.0 or "12"
fn lenient_usize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    let value = Value::deserialize(deserializer)?;
    let parsed = match &value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed
        .map(|n| n as usize)
        .ok_or_else(|| serde::de::Error::custom(format!("expected a line number, got {}", value)))
}

fn lenient_usize_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<usize>, D::Error> {
    let values = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(values
        .iter()
        .filter_map(|v| match v {
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            Value::String(s) => s.trim().trim_start_matches(['Q', 'q', '#']).parse().ok(),
            _ => None,
        })
        .collect())
}

fn default_confidence() -> f64 {
    0.5
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    quotes: Vec<RawQuote>,
    #[serde(default)]
    speakers: Vec<RawSpeaker>,
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    relationships: Vec<RawRelationship>,
}

#[derive(Debug, Deserialize)]
struct RawQuote {
    text: String,
    #[serde(deserialize_with = "lenient_usize")]
    line_start: usize,
    #[serde(deserialize_with = "lenient_usize")]
    line_end: usize,
    #[serde(default)]
    speaker_name: Option<String>,
    #[serde(default)]
    code_ids: Vec<String>,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct RawSpeaker {
    name: String,
    #[serde(default)]
    properties: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    name: String,
    #[serde(rename = "type")]
    entity_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRelationship {
    source: String,
    #[serde(rename = "type")]
    relationship_type: String,
    target: String,
    #[serde(default, deserialize_with = "lenient_usize_list")]
    evidence_quotes: Vec<usize>,
}

pub fn extraction_shape() -> OutputShape {
    OutputShape::object(vec![
        Field::required(
            "quotes",
            OutputShape::array_of(OutputShape::object(vec![
                Field::required("text", OutputShape::String),
                Field::required("line_start", OutputShape::Integer),
                Field::required("line_end", OutputShape::Integer),
                Field::optional("speaker_name", OutputShape::String),
                Field::required("code_ids", OutputShape::array_of(OutputShape::String)),
                Field::required("confidence", OutputShape::Number),
            ])),
        ),
        Field::required(
            "speakers",
            OutputShape::array_of(OutputShape::object(vec![
                Field::required("name", OutputShape::String),
                Field::optional("properties", OutputShape::Any),
            ])),
        ),
        Field::required(
            "entities",
            OutputShape::array_of(OutputShape::object(vec![
                Field::required("name", OutputShape::String),
                Field::required("type", OutputShape::String),
                Field::optional("description", OutputShape::String),
                Field::optional("scope", OutputShape::Enum(vec!["document", "global"])),
            ])),
        ),
        Field::required(
            "relationships",
            OutputShape::array_of(OutputShape::object(vec![
                Field::required("source", OutputShape::String),
                Field::required("type", OutputShape::String),
                Field::required("target", OutputShape::String),
                Field::optional("evidence_quotes", OutputShape::array_of(OutputShape::Any)),
            ])),
        ),
    ])
}

/// Validated extraction for one document, before connection detection.
#[derive(Debug, Clone, Default)]
pub struct RawExtraction {
    pub quotes: Vec<Quote>,
    pub speakers: Vec<Speaker>,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub warnings: Vec<ValidationWarning>,
}

pub struct QuoteExtractor {
    gateway: Arc<TextCompletionGateway>,
    settings: ModelSettings,
}

impl QuoteExtractor {
    pub fn new(gateway: Arc<TextCompletionGateway>, settings: ModelSettings) -> Self {
        Self { gateway, settings }
    }

    pub async fn extract(
        &self,
        document: &ingest::Document,
        schemas: &DiscoveredSchemas,
    ) -> Result<RawExtraction, OracleError> {
        let shape = extraction_shape();
        let request = CompletionRequest {
            task: OracleTask::QuoteExtraction {
                document_id: document.doc_id.clone(),
            },
            prompt: prompt::build_extraction_prompt(
                &document.numbered_text(),
                &schemas.taxonomy,
                &schemas.speaker_schema,
                &schemas.entity_schema,
                &shape,
            ),
            shape,
            settings: self.settings.clone(),
        };

        let response: ExtractionResponse = self.gateway.complete_as(&request).await?;
        let extraction = validate_extraction(document, response, schemas);

        for warning in &extraction.warnings {
            warn!(
                document_id = %document.doc_id,
                kind = ?warning.kind,
                "Dropped invalid reference: {}",
                warning.detail
            );
        }
        debug!(
            document_id = %document.doc_id,
            quotes = extraction.quotes.len(),
            speakers = extraction.speakers.len(),
            entities = extraction.entities.len(),
            relationships = extraction.relationships.len(),
            "Extraction validated"
        );

        Ok(extraction)
    }
}

fn validate_extraction(
    document: &ingest::Document,
    response: ExtractionResponse,
    schemas: &DiscoveredSchemas,
) -> RawExtraction {
    let mut warnings = Vec::new();
    let doc_id = &document.doc_id;
    let line_count = document.line_count().max(1);

    // Quotes: keep the oracle's index so relationship evidence can be resolved
    let mut kept: Vec<(usize, Quote)> = Vec::new();
    for (index, raw) in response.quotes.into_iter().enumerate() {
        let text = raw.text.trim().to_string();
        if text.is_empty() {
            warnings.push(ValidationWarning::new(
                WarningKind::InvalidQuote,
                format!("quote {} has no text", index + 1),
            ));
            continue;
        }

        let mut line_start = raw.line_start.clamp(1, line_count);
        let mut line_end = raw.line_end.clamp(1, line_count);
        if line_end < line_start {
            warnings.push(ValidationWarning::new(
                WarningKind::InvalidQuote,
                format!("quote {} ends before it starts; lines swapped", index + 1),
            ));
            std::mem::swap(&mut line_start, &mut line_end);
        }

        let mut code_ids: Vec<String> = Vec::new();
        for code in raw.code_ids {
            match schemas.taxonomy.resolve(&code) {
                Some(resolved) => {
                    if !code_ids.contains(&resolved.id) {
                        code_ids.push(resolved.id.clone());
                    }
                }
                None => warnings.push(ValidationWarning::new(
                    WarningKind::UnknownCode,
                    format!("quote {} references unknown code '{}'", index + 1, code),
                )),
            }
        }

        let speaker_name = raw
            .speaker_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        kept.push((
            index + 1,
            Quote {
                id: String::new(),
                text,
                line_start,
                line_end,
                sequence_position: 0,
                speaker_name,
                code_ids,
                confidence: raw.confidence.clamp(0.0, 1.0),
            },
        ));
    }

    // Conversational order follows the transcript
    kept.sort_by_key(|(_, q)| (q.line_start, q.line_end));
    let mut quote_ids: HashMap<usize, String> = HashMap::new();
    let quotes: Vec<Quote> = kept
        .into_iter()
        .enumerate()
        .map(|(i, (original_index, mut quote))| {
            quote.sequence_position = i + 1;
            quote.id = format!("{}:q{:04}", doc_id, i + 1);
            quote_ids.insert(original_index, quote.id.clone());
            quote
        })
        .collect();

    let speakers = validate_speakers(&quotes, response.speakers, schemas, &mut warnings);

    // Entities, merged by canonical name
    let mut normalizer = EntityNormalizer::new();
    let mut entities: Vec<Entity> = Vec::new();
    let mut by_canonical: HashMap<String, usize> = HashMap::new();
    for raw in response.entities {
        let Some(entity_type) = schemas.entity_schema.entity_type(&raw.entity_type) else {
            warnings.push(ValidationWarning::new(
                WarningKind::UnknownEntityType,
                format!("entity '{}' has undeclared type '{}'", raw.name, raw.entity_type),
            ));
            continue;
        };
        let canonical = normalizer.normalize(&raw.name);
        if canonical.is_empty() {
            continue;
        }
        let global = raw
            .scope
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case("global"));

        match by_canonical.get(&canonical) {
            Some(&existing) => {
                if global {
                    entities[existing].scope = EntityScope::Global;
                }
            }
            None => {
                by_canonical.insert(canonical.clone(), entities.len());
                entities.push(Entity {
                    id: String::new(),
                    name: raw.name.trim().to_string(),
                    entity_type: entity_type.name.clone(),
                    description: raw.description,
                    scope: if global { EntityScope::Global } else { EntityScope::Document },
                });
            }
        }
    }
    for (canonical, &index) in &by_canonical {
        let slug = EntityNormalizer::slug(canonical);
        entities[index].id = match entities[index].scope {
            EntityScope::Global => format!("entity:{}", slug),
            EntityScope::Document => format!("{}:entity:{}", doc_id, slug),
        };
    }

    // Relationships must connect listed entities with a compatible declared type
    let mut relationships: Vec<Relationship> = Vec::new();
    for raw in response.relationships {
        let Some(relationship_type) = schemas.entity_schema.relationship_type(&raw.relationship_type)
        else {
            warnings.push(ValidationWarning::new(
                WarningKind::UnknownRelationshipType,
                format!("relationship type '{}' is not declared", raw.relationship_type),
            ));
            continue;
        };

        let source = by_canonical.get(&normalizer.normalize(&raw.source)).copied();
        let target = by_canonical.get(&normalizer.normalize(&raw.target)).copied();
        let (Some(source), Some(target)) = (source, target) else {
            warnings.push(ValidationWarning::new(
                WarningKind::UnknownEntity,
                format!(
                    "relationship {} -[{}]-> {} references an entity not in the entity list",
                    raw.source, raw.relationship_type, raw.target
                ),
            ));
            continue;
        };

        let (source, target) = (&entities[source], &entities[target]);
        if !schemas
            .entity_schema
            .allows(&relationship_type.name, &source.entity_type, &target.entity_type)
        {
            warnings.push(ValidationWarning::new(
                WarningKind::IncompatibleRelationship,
                format!(
                    "{} cannot connect {} ({}) to {} ({})",
                    relationship_type.name,
                    source.name,
                    source.entity_type,
                    target.name,
                    target.entity_type
                ),
            ));
            continue;
        }

        let mut evidence: Vec<String> = Vec::new();
        for index in raw.evidence_quotes {
            match quote_ids.get(&index) {
                Some(id) if !evidence.contains(id) => evidence.push(id.clone()),
                Some(_) => {}
                None => warnings.push(ValidationWarning::new(
                    WarningKind::InvalidQuote,
                    format!("relationship evidence refers to unknown quote {}", index),
                )),
            }
        }

        if let Some(existing) = relationships.iter_mut().find(|r| {
            r.source_entity_id == source.id
                && r.target_entity_id == target.id
                && r.relationship_type == relationship_type.name
        }) {
            for id in evidence {
                if !existing.evidence_quote_ids.contains(&id) {
                    existing.evidence_quote_ids.push(id);
                }
            }
            continue;
        }

        relationships.push(Relationship {
            id: format!("{}:rel:{}", doc_id, relationships.len() + 1),
            source_entity_id: source.id.clone(),
            relationship_type: relationship_type.name.clone(),
            target_entity_id: target.id.clone(),
            evidence_quote_ids: evidence,
        });
    }

    RawExtraction {
        quotes,
        speakers,
        entities,
        relationships,
        warnings,
    }
}

fn validate_speakers(
    quotes: &[Quote],
    raw_speakers: Vec<RawSpeaker>,
    schemas: &DiscoveredSchemas,
    warnings: &mut Vec<ValidationWarning>,
) -> Vec<Speaker> {
    let mut speakers: Vec<Speaker> = Vec::new();

    for raw in raw_speakers {
        let name = raw.name.trim().to_string();
        if name.is_empty() {
            continue;
        }
        let index = match speakers.iter().position(|s| s.name.eq_ignore_ascii_case(&name)) {
            Some(index) => index,
            None => {
                speakers.push(Speaker {
                    name: name.clone(),
                    properties: Map::new(),
                });
                speakers.len() - 1
            }
        };

        for (key, value) in raw.properties {
            if value.is_null() {
                continue;
            }
            let Some(definition) = schemas.speaker_schema.get(&key) else {
                warnings.push(ValidationWarning::new(
                    WarningKind::UnknownProperty,
                    format!("speaker '{}' has undeclared property '{}'", name, key),
                ));
                continue;
            };
            match coerce_property(definition, value) {
                Ok(coerced) => {
                    speakers[index]
                        .properties
                        .insert(definition.name.clone(), coerced);
                }
                Err(detail) => warnings.push(ValidationWarning::new(
                    WarningKind::InvalidPropertyValue,
                    format!("speaker '{}': {}", name, detail),
                )),
            }
        }
    }

    // Everyone who speaks gets a speaker record
    for quote in quotes {
        if let Some(name) = &quote.speaker_name {
            if !speakers.iter().any(|s| s.name.eq_ignore_ascii_case(name)) {
                speakers.push(Speaker {
                    name: name.clone(),
                    properties: Map::new(),
                });
            }
        }
    }

    speakers
}

fn coerce_property(definition: &PropertyDefinition, value: Value) -> Result<Value, String> {
    let name = &definition.name;
    match definition.property_type {
        PropertyType::Text => Ok(match value {
            Value::String(s) => Value::String(s),
            other => Value::String(other.to_string()),
        }),
        PropertyType::Numeric => match &value {
            Value::Number(_) => Ok(value),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("'{}' is not numeric for '{}'", s, name)),
            other => Err(format!("{} is not numeric for '{}'", other, name)),
        },
        PropertyType::List => Ok(match value {
            Value::Array(items) => Value::Array(items),
            scalar => Value::Array(vec![scalar]),
        }),
        PropertyType::Categorical => {
            let raw = match &value {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            };
            match &definition.possible_values {
                None => Ok(Value::String(raw)),
                Some(allowed) => allowed
                    .iter()
                    .find(|v| v.eq_ignore_ascii_case(&raw))
                    .map(|v| Value::String(v.clone()))
                    .ok_or_else(|| format!("'{}' is not an allowed value of '{}'", raw, name)),
            }
        }
    }
}
