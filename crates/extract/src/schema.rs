use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::quality::QualityReport;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    pub id: String,
    pub text: String,
    pub line_start: usize,
    pub line_end: usize,
    /// Strictly increasing within a document; the conversational order
    pub sequence_position: usize,
    pub speaker_name: Option<String>,
    pub code_ids: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Speaker {
    pub name: String,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntityScope {
    #[default]
    Document,
    /// Candidate for cross-document identity; never merged here
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub description: String,
    pub scope: EntityScope,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    pub id: String,
    pub source_entity_id: String,
    #[serde(rename = "type")]
    pub relationship_type: String,
    pub target_entity_id: String,
    pub evidence_quote_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    BuildsOn,
    Supports,
    Challenges,
    Clarifies,
    /// No relation recorded; never an edge
    None,
}

impl RelationKind {
    pub const ALL: [&'static str; 5] = ["builds_on", "supports", "challenges", "clarifies", "none"];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "builds_on" => Some(RelationKind::BuildsOn),
            "supports" => Some(RelationKind::Supports),
            "challenges" => Some(RelationKind::Challenges),
            "clarifies" => Some(RelationKind::Clarifies),
            "none" => Some(RelationKind::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::BuildsOn => "builds_on",
            RelationKind::Supports => "supports",
            RelationKind::Challenges => "challenges",
            RelationKind::Clarifies => "clarifies",
            RelationKind::None => "none",
        }
    }

    pub fn is_edge(&self) -> bool {
        *self != RelationKind::None
    }
}

/// A backward-pointing thematic link: `from` is the later quote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThematicConnection {
    pub from_quote_id: String,
    pub to_quote_id: String,
    pub relation_kind: RelationKind,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    UnknownCode,
    UnknownEntity,
    UnknownEntityType,
    UnknownRelationshipType,
    IncompatibleRelationship,
    UnknownProperty,
    InvalidPropertyValue,
    InvalidQuote,
    UnknownRelationKind,
    ConnectionCeiling,
}

/// A dangling or invalid reference that was dropped. Never escalates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationWarning {
    pub kind: WarningKind,
    pub detail: String,
}

impl ValidationWarning {
    pub fn new(kind: WarningKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentResult {
    pub document_id: String,
    pub source: String,
    pub quotes: Vec<Quote>,
    pub speakers: Vec<Speaker>,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub connections: Vec<ThematicConnection>,
    pub pairs_compared: usize,
    pub warnings: Vec<ValidationWarning>,
    pub quality_report: QualityReport,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Oracle,
    Timeout,
    /// The run stopped before the document was scheduled
    Skipped,
    Panicked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentFailure {
    pub document_id: String,
    pub source: String,
    pub kind: FailureKind,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocumentOutcome {
    Completed(DocumentResult),
    Failed(DocumentFailure),
}

impl DocumentOutcome {
    pub fn document_id(&self) -> &str {
        match self {
            DocumentOutcome::Completed(result) => &result.document_id,
            DocumentOutcome::Failed(failure) => &failure.document_id,
        }
    }

    pub fn as_result(&self) -> Option<&DocumentResult> {
        match self {
            DocumentOutcome::Completed(result) => Some(result),
            DocumentOutcome::Failed(_) => None,
        }
    }

    pub fn as_failure(&self) -> Option<&DocumentFailure> {
        match self {
            DocumentOutcome::Completed(_) => None,
            DocumentOutcome::Failed(failure) => Some(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_kind_parse() {
        assert_eq!(RelationKind::parse("Builds On"), Some(RelationKind::BuildsOn));
        assert_eq!(RelationKind::parse("builds-on"), Some(RelationKind::BuildsOn));
        assert_eq!(RelationKind::parse("NONE"), Some(RelationKind::None));
        assert_eq!(RelationKind::parse("contradicts"), None);
        assert!(!RelationKind::None.is_edge());
        for raw in RelationKind::ALL {
            assert_eq!(RelationKind::parse(raw).unwrap().as_str(), raw);
        }
    }

    #[test]
    fn test_outcome_is_tagged() {
        let outcome = DocumentOutcome::Failed(DocumentFailure {
            document_id: "d1".to_string(),
            source: "d1.txt".to_string(),
            kind: FailureKind::Timeout,
            error: "timed out".to_string(),
        });
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "timeout");
    }
}
