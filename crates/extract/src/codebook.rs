//! Corpus-wide schemas produced by discovery and read by every document worker.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

fn default_max_depth() -> usize {
    3
}

fn same_name(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Derive an id from a display name: "Work-life balance" -> "WORK_LIFE_BALANCE"
pub fn code_id_for(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    let mut last_underscore = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            id.push(c.to_ascii_uppercase());
            last_underscore = false;
        } else if !last_underscore {
            id.push('_');
            last_underscore = true;
        }
    }
    id.trim_end_matches('_').to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Code {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub level: usize,
    #[serde(default)]
    pub parent_id: Option<String>,
}

/// Hierarchical thematic codes. Parents always precede their children and no code
/// sits deeper than `max_depth` (roots are level 1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeTaxonomy {
    pub codes: Vec<Code>,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl CodeTaxonomy {
    pub fn empty(max_depth: usize) -> Self {
        Self {
            codes: Vec::new(),
            max_depth,
        }
    }

    /// Build a taxonomy from unvetted candidates, repairing what can be repaired and
    /// dropping the rest. Every adjustment is reported in `warnings`.
    pub fn build(candidates: Vec<Code>, max_depth: usize, warnings: &mut Vec<String>) -> Self {
        let mut taxonomy = Self::empty(max_depth);
        taxonomy.place(candidates, warnings);
        taxonomy
    }

    /// Structural merge for mixed mode: existing codes are kept untouched and in order,
    /// proposals that duplicate an existing id or name are skipped, the rest are
    /// appended no deeper than the tighter of `max_depth` and the supplied limit.
    pub fn merge_additional(
        &self,
        proposed: Vec<Code>,
        max_depth: usize,
        warnings: &mut Vec<String>,
    ) -> Self {
        let mut merged = self.clone();
        merged.max_depth = self.max_depth.min(max_depth);
        merged.place(proposed, warnings);
        // Supplied codes are never dropped, so they may keep the taxonomy deeper
        merged.max_depth = max_depth.max(self.depth());
        merged
    }

    fn place(&mut self, candidates: Vec<Code>, warnings: &mut Vec<String>) {
        let mut pending: Vec<Code> = Vec::new();

        for mut code in candidates {
            code.name = code.name.trim().to_string();
            code.id = code.id.trim().to_string();
            if code.name.is_empty() && code.id.is_empty() {
                warnings.push("Dropped code with neither id nor name".to_string());
                continue;
            }
            if code.id.is_empty() {
                code.id = code_id_for(&code.name);
            }
            if code.name.is_empty() {
                code.name = code.id.clone();
            }

            let duplicate = self
                .codes
                .iter()
                .chain(pending.iter())
                .any(|c| c.id == code.id || same_name(&c.name, &code.name));
            if duplicate {
                warnings.push(format!("Skipped duplicate code '{}' ({})", code.name, code.id));
                continue;
            }
            pending.push(code);
        }

        // Parents may be referenced by name instead of id
        let mut name_to_id: HashMap<String, String> = HashMap::new();
        for code in self.codes.iter().chain(pending.iter()) {
            name_to_id.insert(code.name.to_lowercase(), code.id.clone());
        }
        let known: HashSet<String> = self
            .codes
            .iter()
            .chain(pending.iter())
            .map(|c| c.id.clone())
            .collect();

        for code in &mut pending {
            let Some(parent) = code.parent_id.take() else {
                continue;
            };
            let parent = parent.trim().to_string();
            if parent.is_empty() {
                continue;
            }
            let resolved = if known.contains(&parent) {
                Some(parent.clone())
            } else {
                name_to_id.get(&parent.to_lowercase()).cloned()
            };
            match resolved {
                Some(id) if id == code.id => {
                    warnings.push(format!("Code '{}' listed itself as parent; made root", code.id));
                }
                Some(id) => code.parent_id = Some(id),
                None => warnings.push(format!(
                    "Code '{}' references unknown parent '{}'; made root",
                    code.id, parent
                )),
            }
        }

        let mut levels: HashMap<String, usize> =
            self.codes.iter().map(|c| (c.id.clone(), c.level)).collect();
        let mut dropped: HashSet<String> = HashSet::new();
        let max_depth = self.max_depth;

        while !pending.is_empty() {
            let before = pending.len();
            let mut placed = Vec::new();

            pending.retain(|code| {
                let level = match &code.parent_id {
                    None => 1,
                    Some(parent) if dropped.contains(parent) => {
                        warnings.push(format!(
                            "Dropped code '{}' because its parent was dropped",
                            code.id
                        ));
                        dropped.insert(code.id.clone());
                        return false;
                    }
                    Some(parent) => match levels.get(parent) {
                        Some(parent_level) => parent_level + 1,
                        None => return true,
                    },
                };

                if level > max_depth {
                    warnings.push(format!(
                        "Dropped code '{}' at level {} beyond max depth {}",
                        code.id, level, max_depth
                    ));
                    dropped.insert(code.id.clone());
                    return false;
                }

                let mut code = code.clone();
                code.level = level;
                levels.insert(code.id.clone(), level);
                placed.push(code);
                false
            });

            self.codes.extend(placed);

            if pending.len() == before {
                // Parent cycle: break it by promoting the first remaining code
                let mut code = pending.remove(0);
                warnings.push(format!("Code '{}' is part of a parent cycle; made root", code.id));
                code.parent_id = None;
                pending.insert(0, code);
            }
        }
    }

    /// Check the structural invariants. Supplied (closed/mixed) taxonomies are
    /// checked before use.
    pub fn validate(&self) -> Result<(), String> {
        let mut levels: HashMap<&str, usize> = HashMap::new();
        for code in &self.codes {
            if levels.contains_key(code.id.as_str()) {
                return Err(format!("duplicate code id '{}'", code.id));
            }
            let expected = match &code.parent_id {
                None => 1,
                Some(parent) => match levels.get(parent.as_str()) {
                    Some(level) => level + 1,
                    None => {
                        return Err(format!(
                            "code '{}' appears before its parent '{}' or the parent is missing",
                            code.id, parent
                        ));
                    }
                },
            };
            if code.level != expected {
                return Err(format!(
                    "code '{}' has level {} but its position implies {}",
                    code.id, code.level, expected
                ));
            }
            if expected > self.max_depth {
                return Err(format!(
                    "code '{}' exceeds max depth {}",
                    code.id, self.max_depth
                ));
            }
            levels.insert(code.id.as_str(), expected);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&Code> {
        self.codes.iter().find(|c| c.id == id)
    }

    /// Look a code up by id, falling back to a case-insensitive name match
    pub fn resolve(&self, id_or_name: &str) -> Option<&Code> {
        let key = id_or_name.trim();
        self.get(key)
            .or_else(|| self.codes.iter().find(|c| same_name(&c.name, key)))
    }

    pub fn roots(&self) -> impl Iterator<Item = &Code> {
        self.codes.iter().filter(|c| c.parent_id.is_none())
    }

    pub fn children<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Code> {
        self.codes
            .iter()
            .filter(move |c| c.parent_id.as_deref() == Some(id))
    }

    pub fn depth(&self) -> usize {
        self.codes.iter().map(|c| c.level).max().unwrap_or(0)
    }

    /// "Root > Child > Code" breadcrumb of names
    pub fn path(&self, id: &str) -> String {
        let mut names = Vec::new();
        let mut current = self.get(id);
        while let Some(code) = current {
            names.push(code.name.as_str());
            current = code.parent_id.as_deref().and_then(|p| self.get(p));
        }
        names.reverse();
        names.join(" > ")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    #[serde(alias = "string", alias = "free_text")]
    Text,
    #[serde(alias = "category", alias = "enum")]
    Categorical,
    #[serde(alias = "array")]
    List,
    #[serde(alias = "number", alias = "integer", alias = "float")]
    Numeric,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropertyDefinition {
    pub name: String,
    pub property_type: PropertyType,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub possible_values: Option<Vec<String>>,
}

/// Speaker attributes to extract per document. Property names are unique
/// (case-insensitive).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpeakerPropertySchema {
    pub properties: Vec<PropertyDefinition>,
}

impl SpeakerPropertySchema {
    pub fn build(candidates: Vec<PropertyDefinition>, warnings: &mut Vec<String>) -> Self {
        let mut schema = Self::default();
        schema.insert_all(candidates, warnings);
        schema
    }

    pub fn merge_additional(
        &self,
        proposed: Vec<PropertyDefinition>,
        warnings: &mut Vec<String>,
    ) -> Self {
        let mut merged = self.clone();
        merged.insert_all(proposed, warnings);
        merged
    }

    fn insert_all(&mut self, candidates: Vec<PropertyDefinition>, warnings: &mut Vec<String>) {
        for mut property in candidates {
            property.name = property.name.trim().to_string();
            if property.name.is_empty() {
                warnings.push("Dropped speaker property without a name".to_string());
                continue;
            }
            if self.get(&property.name).is_some() {
                warnings.push(format!("Skipped duplicate speaker property '{}'", property.name));
                continue;
            }
            if let Some(values) = &mut property.possible_values {
                values.retain(|v| !v.trim().is_empty());
                if values.is_empty() {
                    property.possible_values = None;
                }
            }
            if property.property_type == PropertyType::Categorical
                && property.possible_values.is_none()
            {
                warnings.push(format!(
                    "Categorical property '{}' has no possible values; any value accepted",
                    property.name
                ));
            }
            self.properties.push(property);
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for property in &self.properties {
            if !seen.insert(property.name.to_lowercase()) {
                return Err(format!("duplicate speaker property '{}'", property.name));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| same_name(&p.name, name))
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityType {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipType {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub source_types: Vec<String>,
    pub target_types: Vec<String>,
}

/// Entity and relationship types. Every relationship endpoint type is a declared
/// entity type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntityRelationshipSchema {
    pub entity_types: Vec<EntityType>,
    pub relationship_types: Vec<RelationshipType>,
}

impl EntityRelationshipSchema {
    pub fn build(
        entity_types: Vec<EntityType>,
        relationship_types: Vec<RelationshipType>,
        warnings: &mut Vec<String>,
    ) -> Self {
        let mut schema = Self::default();
        schema.insert_all(entity_types, relationship_types, warnings);
        schema
    }

    pub fn merge_additional(
        &self,
        entity_types: Vec<EntityType>,
        relationship_types: Vec<RelationshipType>,
        warnings: &mut Vec<String>,
    ) -> Self {
        let mut merged = self.clone();
        merged.insert_all(entity_types, relationship_types, warnings);
        merged
    }

    fn insert_all(
        &mut self,
        entity_types: Vec<EntityType>,
        relationship_types: Vec<RelationshipType>,
        warnings: &mut Vec<String>,
    ) {
        for mut entity_type in entity_types {
            entity_type.name = entity_type.name.trim().to_string();
            if entity_type.name.is_empty() {
                continue;
            }
            if self.entity_type(&entity_type.name).is_some() {
                warnings.push(format!("Skipped duplicate entity type '{}'", entity_type.name));
                continue;
            }
            self.entity_types.push(entity_type);
        }

        for mut relationship in relationship_types {
            relationship.name = relationship.name.trim().to_string();
            if relationship.name.is_empty() {
                continue;
            }
            if self.relationship_type(&relationship.name).is_some() {
                warnings.push(format!(
                    "Skipped duplicate relationship type '{}'",
                    relationship.name
                ));
                continue;
            }

            relationship.source_types = self.canonical_types(&relationship.name, relationship.source_types, warnings);
            relationship.target_types = self.canonical_types(&relationship.name, relationship.target_types, warnings);

            if relationship.source_types.is_empty() || relationship.target_types.is_empty() {
                warnings.push(format!(
                    "Dropped relationship type '{}' without declared endpoint types",
                    relationship.name
                ));
                continue;
            }
            self.relationship_types.push(relationship);
        }
    }

    fn canonical_types(
        &self,
        relationship: &str,
        types: Vec<String>,
        warnings: &mut Vec<String>,
    ) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for name in types {
            match self.entity_type(&name) {
                Some(declared) => {
                    if !out.contains(&declared.name) {
                        out.push(declared.name.clone());
                    }
                }
                None => warnings.push(format!(
                    "Relationship type '{}' references undeclared entity type '{}'",
                    relationship, name
                )),
            }
        }
        out
    }

    pub fn validate(&self) -> Result<(), String> {
        for relationship in &self.relationship_types {
            for name in relationship.source_types.iter().chain(&relationship.target_types) {
                if self.entity_type(name).is_none() {
                    return Err(format!(
                        "relationship type '{}' references undeclared entity type '{}'",
                        relationship.name, name
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn entity_type(&self, name: &str) -> Option<&EntityType> {
        self.entity_types.iter().find(|t| same_name(&t.name, name))
    }

    pub fn relationship_type(&self, name: &str) -> Option<&RelationshipType> {
        self.relationship_types.iter().find(|t| same_name(&t.name, name))
    }

    /// Whether `relationship` may connect an entity of `source_type` to one of
    /// `target_type`
    pub fn allows(&self, relationship: &str, source_type: &str, target_type: &str) -> bool {
        self.relationship_type(relationship).is_some_and(|r| {
            r.source_types.iter().any(|t| same_name(t, source_type))
                && r.target_types.iter().any(|t| same_name(t, target_type))
        })
    }
}

/// The immutable snapshot shared by every document worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveredSchemas {
    pub taxonomy: CodeTaxonomy,
    pub speaker_schema: SpeakerPropertySchema,
    pub entity_schema: EntityRelationshipSchema,
}

/// Schemas supplied by the caller for mixed or closed discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExistingSchemas {
    #[serde(default)]
    pub taxonomy: Option<CodeTaxonomy>,
    #[serde(default)]
    pub speaker_schema: Option<SpeakerPropertySchema>,
    #[serde(default)]
    pub entity_schema: Option<EntityRelationshipSchema>,
}
