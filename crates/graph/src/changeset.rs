use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

use extract::{DiscoveredSchemas, DocumentResult, EntityNormalizer};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub enum NodeLabel {
    Document,
    Quote,
    Speaker,
    Entity,
    Code,
}

impl NodeLabel {
    pub const ALL: [NodeLabel; 5] = [
        NodeLabel::Document,
        NodeLabel::Quote,
        NodeLabel::Speaker,
        NodeLabel::Entity,
        NodeLabel::Code,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLabel::Document => "Document",
            NodeLabel::Quote => "Quote",
            NodeLabel::Speaker => "Speaker",
            NodeLabel::Entity => "Entity",
            NodeLabel::Code => "Code",
        }
    }
}

pub const HAS_CODE: &str = "HAS_CODE";
pub const SPOKEN_BY: &str = "SPOKEN_BY";
pub const FROM_DOCUMENT: &str = "FROM_DOCUMENT";
pub const THEMATIC_CONNECTION: &str = "THEMATIC_CONNECTION";
pub const SUBCODE_OF: &str = "SUBCODE_OF";

pub type Properties = BTreeMap<String, Value>;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GraphNode {
    pub label: NodeLabel,
    pub id: String,
    pub properties: Properties,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GraphEdge {
    pub edge_type: String,
    pub from_label: NodeLabel,
    pub from_id: String,
    pub to_label: NodeLabel,
    pub to_id: String,
    pub properties: Properties,
}

/// Nodes and edges keyed by stable ids, safe to apply more than once.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphChangeSet {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Relationship types become edge types, which Cypher cannot parameterise.
pub fn sanitize_edge_type(raw: &str) -> String {
    let mut sanitized: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    sanitized = sanitized.trim_matches('_').to_string();
    if sanitized.is_empty() {
        return "RELATED_TO".to_string();
    }
    if sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert_str(0, "REL_");
    }
    sanitized
}

pub fn speaker_node_id(document_id: &str, speaker_name: &str) -> String {
    format!(
        "{}:speaker:{}",
        document_id,
        EntityNormalizer::slug(&EntityNormalizer::clean(speaker_name))
    )
}

impl GraphChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, label: NodeLabel, id: impl Into<String>, properties: Properties) {
        self.nodes.push(GraphNode {
            label,
            id: id.into(),
            properties,
        });
    }

    pub fn add_edge(
        &mut self,
        edge_type: impl Into<String>,
        from: (NodeLabel, &str),
        to: (NodeLabel, &str),
        properties: Properties,
    ) {
        self.edges.push(GraphEdge {
            edge_type: edge_type.into(),
            from_label: from.0,
            from_id: from.1.to_string(),
            to_label: to.0,
            to_id: to.1.to_string(),
            properties,
        });
    }

    /// The codebook: one Code node per code, SUBCODE_OF pointing at the parent.
    pub fn for_schemas(schemas: &DiscoveredSchemas) -> Self {
        let mut changes = Self::new();
        for code in &schemas.taxonomy.codes {
            changes.add_node(
                NodeLabel::Code,
                code.id.as_str(),
                props([
                    ("name", json!(code.name)),
                    ("description", json!(code.description)),
                    ("level", json!(code.level)),
                ]),
            );
        }
        for code in &schemas.taxonomy.codes {
            if let Some(parent) = &code.parent_id {
                changes.add_edge(
                    SUBCODE_OF,
                    (NodeLabel::Code, &code.id),
                    (NodeLabel::Code, parent),
                    Properties::new(),
                );
            }
        }
        changes
    }

    pub fn for_document(result: &DocumentResult) -> Self {
        let mut changes = Self::new();
        let doc = (NodeLabel::Document, result.document_id.as_str());

        changes.add_node(
            NodeLabel::Document,
            result.document_id.as_str(),
            props([
                ("source", json!(result.source)),
                ("quote_count", json!(result.quotes.len())),
                ("connection_rate", json!(result.quality_report.connection_rate)),
            ]),
        );

        for speaker in &result.speakers {
            let id = speaker_node_id(&result.document_id, &speaker.name);
            let mut properties = props([("name", json!(speaker.name))]);
            for (key, value) in &speaker.properties {
                properties.insert(key.clone(), value.clone());
            }
            changes.add_node(NodeLabel::Speaker, id.as_str(), properties);
            changes.add_edge(FROM_DOCUMENT, (NodeLabel::Speaker, &id), doc, Properties::new());
        }

        for quote in &result.quotes {
            changes.add_node(
                NodeLabel::Quote,
                quote.id.as_str(),
                props([
                    ("text", json!(quote.text)),
                    ("line_start", json!(quote.line_start)),
                    ("line_end", json!(quote.line_end)),
                    ("sequence_position", json!(quote.sequence_position)),
                    ("confidence", json!(quote.confidence)),
                ]),
            );
            let from = (NodeLabel::Quote, quote.id.as_str());
            changes.add_edge(FROM_DOCUMENT, from, doc, Properties::new());
            for code in &quote.code_ids {
                changes.add_edge(HAS_CODE, from, (NodeLabel::Code, code), Properties::new());
            }
            if let Some(name) = &quote.speaker_name {
                let speaker = speaker_node_id(&result.document_id, name);
                changes.add_edge(SPOKEN_BY, from, (NodeLabel::Speaker, &speaker), Properties::new());
            }
        }

        for entity in &result.entities {
            changes.add_node(
                NodeLabel::Entity,
                entity.id.as_str(),
                props([
                    ("name", json!(entity.name)),
                    ("type", json!(entity.entity_type)),
                    ("description", json!(entity.description)),
                    ("scope", json!(entity.scope)),
                ]),
            );
            changes.add_edge(
                FROM_DOCUMENT,
                (NodeLabel::Entity, &entity.id),
                doc,
                Properties::new(),
            );
        }

        for relationship in &result.relationships {
            changes.add_edge(
                sanitize_edge_type(&relationship.relationship_type),
                (NodeLabel::Entity, &relationship.source_entity_id),
                (NodeLabel::Entity, &relationship.target_entity_id),
                props([
                    ("id", json!(relationship.id)),
                    ("evidence_quote_ids", json!(relationship.evidence_quote_ids)),
                ]),
            );
        }

        for connection in result.connections.iter().filter(|c| c.relation_kind.is_edge()) {
            let mut properties = props([
                ("relation_kind", json!(connection.relation_kind.as_str())),
                ("confidence", json!(connection.confidence)),
            ]);
            if let Some(rationale) = &connection.rationale {
                properties.insert("rationale".to_string(), json!(rationale));
            }
            changes.add_edge(
                THEMATIC_CONNECTION,
                (NodeLabel::Quote, &connection.from_quote_id),
                (NodeLabel::Quote, &connection.to_quote_id),
                properties,
            );
        }

        changes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

fn props<const N: usize>(entries: [(&str, Value); N]) -> Properties {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
