use crate::codebook::{CodeTaxonomy, EntityRelationshipSchema, SpeakerPropertySchema};
use crate::shape::OutputShape;
use crate::schema::Quote;

pub fn render_taxonomy(taxonomy: &CodeTaxonomy) -> String {
    if taxonomy.is_empty() {
        return "(no codes)\n".to_string();
    }
    let mut out = String::new();
    for code in &taxonomy.codes {
        out.push_str(&format!(
            "{}- [{}] {}: {}\n",
            "  ".repeat(code.level.saturating_sub(1)),
            code.id,
            code.name,
            code.description
        ));
    }
    out
}

pub fn render_speaker_schema(schema: &SpeakerPropertySchema) -> String {
    if schema.is_empty() {
        return "(no speaker properties)\n".to_string();
    }
    let mut out = String::new();
    for property in &schema.properties {
        let values = property
            .possible_values
            .as_ref()
            .map(|v| format!(" (one of: {})", v.join(", ")))
            .unwrap_or_default();
        out.push_str(&format!(
            "- {} [{:?}]{}: {}\n",
            property.name, property.property_type, values, property.description
        ));
    }
    out
}

pub fn render_entity_schema(schema: &EntityRelationshipSchema) -> String {
    let mut out = String::from("ENTITY TYPES:\n");
    for entity_type in &schema.entity_types {
        out.push_str(&format!("- {}: {}\n", entity_type.name, entity_type.description));
    }
    out.push_str("RELATIONSHIP TYPES:\n");
    for relationship in &schema.relationship_types {
        out.push_str(&format!(
            "- {} ({} -> {}): {}\n",
            relationship.name,
            relationship.source_types.join("|"),
            relationship.target_types.join("|"),
            relationship.description
        ));
    }
    out
}

fn output_contract(shape: &OutputShape) -> String {
    let schema = serde_json::to_string_pretty(&shape.to_json_schema()).unwrap_or_default();
    format!(
        "OUTPUT FORMAT:\nRespond with ONLY a JSON object matching this JSON schema. \
         No markdown, no code fences, no commentary.\n{}\n",
        schema
    )
}

fn preserve_block(kind: &str, existing: &str) -> String {
    format!(
        r#"EXISTING {kind} (keep exactly as written):
{existing}
Do NOT repeat, rename, or reword any existing item. Propose ONLY additional {kind}
that the existing list does not already cover. Return an empty list if nothing is
missing. New items may reference existing items as parents where applicable.

"#
    )
}

pub fn build_code_discovery_prompt(
    corpus: &str,
    max_depth: usize,
    existing: Option<&CodeTaxonomy>,
    shape: &OutputShape,
) -> String {
    let mut prompt = format!(
        r#"You are an experienced qualitative researcher performing thematic analysis.
Read ALL of the interview transcripts below and develop a hierarchical codebook of
themes that recur across the corpus.

INSTRUCTIONS:
1. Codes must capture patterns visible across the corpus, not one-off remarks
2. Organise codes into a hierarchy at most {max_depth} level(s) deep
3. Top-level codes have "parent_id": null; sub-codes reference their parent's id
4. Use short uppercase snake_case ids (e.g. "WORK_LIFE_BALANCE")
5. Give every code a one-sentence description explaining when to apply it

"#
    );

    if let Some(existing) = existing {
        prompt.push_str(&preserve_block("CODES", &render_taxonomy(existing)));
    }

    prompt.push_str(&output_contract(shape));
    prompt.push_str("\nTRANSCRIPTS:\n");
    prompt.push_str(corpus);
    prompt
}

pub fn build_speaker_discovery_prompt(
    corpus: &str,
    taxonomy: &CodeTaxonomy,
    existing: Option<&SpeakerPropertySchema>,
    shape: &OutputShape,
) -> String {
    let mut prompt = format!(
        r#"You are an experienced qualitative researcher. Read ALL of the transcripts below
and define the speaker properties worth recording for every participant (for example
role, organisation, years of experience, stance).

INSTRUCTIONS:
1. Only include properties that can be determined for most speakers in the corpus
2. property_type is one of: text, categorical, list, numeric
3. Categorical properties must list their possible_values
4. Property names are lowercase snake_case and unique

THEMATIC CODEBOOK ALREADY DISCOVERED (for context):
{}
"#,
        render_taxonomy(taxonomy)
    );

    if let Some(existing) = existing {
        prompt.push_str(&preserve_block("PROPERTIES", &render_speaker_schema(existing)));
    }

    prompt.push_str(&output_contract(shape));
    prompt.push_str("\nTRANSCRIPTS:\n");
    prompt.push_str(corpus);
    prompt
}

pub fn build_entity_discovery_prompt(
    corpus: &str,
    taxonomy: &CodeTaxonomy,
    speakers: &SpeakerPropertySchema,
    existing: Option<&EntityRelationshipSchema>,
    shape: &OutputShape,
) -> String {
    let mut prompt = format!(
        r#"You are building a knowledge graph from interview transcripts. Read ALL of the
transcripts below and define the entity types and relationship types that matter for
this corpus (people, organisations, programmes, tools, places, policies, ...).

INSTRUCTIONS:
1. Entity type names are singular PascalCase (e.g. "Organization")
2. Relationship type names are UPPER_SNAKE_CASE verbs (e.g. "WORKS_FOR")
3. Every relationship lists source_types and target_types drawn ONLY from the entity
   types you define (or the existing ones)

THEMATIC CODEBOOK (context):
{}
SPEAKER PROPERTIES (context):
{}
"#,
        render_taxonomy(taxonomy),
        render_speaker_schema(speakers)
    );

    if let Some(existing) = existing {
        prompt.push_str(&preserve_block(
            "ENTITY AND RELATIONSHIP TYPES",
            &render_entity_schema(existing),
        ));
    }

    prompt.push_str(&output_contract(shape));
    prompt.push_str("\nTRANSCRIPTS:\n");
    prompt.push_str(corpus);
    prompt
}

pub fn build_extraction_prompt(
    numbered_transcript: &str,
    taxonomy: &CodeTaxonomy,
    speakers: &SpeakerPropertySchema,
    entities: &EntityRelationshipSchema,
    shape: &OutputShape,
) -> String {
    format!(
        r#"You are coding one interview transcript against a fixed codebook.

INSTRUCTIONS:
1. Segment the transcript into quotes at semantic boundaries. Every substantive
   speaker turn must appear as at least one quote. Prefer splitting over merging.
2. For each quote give line_start and line_end using the line numbers shown.
3. Assign EVERY code that applies (zero, one or many) using the code ids below. Be
   comprehensive: over-coding is preferred to missing a code. Never invent codes.
4. Record the speaker_name of each quote exactly as it appears in the transcript.
5. For each speaker, fill in the speaker properties below when the transcript
   supports a value. Omit properties you cannot determine.
6. Extract entities using ONLY the entity types below. Mark an entity scope "global"
   when it refers to something that exists outside this interview (a named
   organisation, place or programme), otherwise "document".
7. Extract relationships using ONLY the relationship types below. source and target
   are entity names from your entity list. evidence_quotes lists the 1-based indexes
   of the quotes that support the relationship.
8. confidence is your confidence (0.0-1.0) in the codes assigned to the quote.

CODEBOOK:
{}
SPEAKER PROPERTIES:
{}
{}
{}
TRANSCRIPT:
{}"#,
        render_taxonomy(taxonomy),
        render_speaker_schema(speakers),
        render_entity_schema(entities),
        output_contract(shape),
        numbered_transcript
    )
}

fn describe_quote(quote: &Quote, taxonomy: &CodeTaxonomy) -> String {
    let codes: Vec<String> = quote
        .code_ids
        .iter()
        .map(|id| taxonomy.get(id).map(|c| c.name.clone()).unwrap_or_else(|| id.clone()))
        .collect();
    format!(
        "#{} {} said: \"{}\"\n   codes: {}",
        quote.sequence_position,
        quote.speaker_name.as_deref().unwrap_or("Unknown speaker"),
        quote.text,
        if codes.is_empty() { "(none)".to_string() } else { codes.join(", ") }
    )
}

pub fn build_connection_prompt(
    target: &Quote,
    candidate: &Quote,
    taxonomy: &CodeTaxonomy,
    shape: &OutputShape,
) -> String {
    format!(
        r#"You are analysing the flow of a conversation. The LATER quote may or may not
connect thematically to the EARLIER quote.

EARLIER QUOTE:
{}

LATER QUOTE:
{}

Classify how the LATER quote relates to the EARLIER one:
- builds_on: extends or develops the same idea further
- supports: agrees with or gives evidence for it
- challenges: disagrees with, contradicts or questions it
- clarifies: explains, corrects or makes it more precise
- none: no meaningful thematic connection

BE CONSERVATIVE. Sharing a topic or being adjacent in the transcript is NOT enough;
the later quote must respond to the earlier one's substance. Across a typical
interview between 30% and 70% of quotes have NO connection at all, so answer "none"
whenever in doubt. The same speaker may connect to their own earlier quote.

confidence is your confidence (0.0-1.0) in the relation you chose.

{}"#,
        describe_quote(candidate, taxonomy),
        describe_quote(target, taxonomy),
        output_contract(shape)
    )
}

pub fn build_repair_prompt(invalid_output: &str, problem: &str, shape: &OutputShape) -> String {
    format!(
        r#"The following output was rejected: {}

{}

Fix it so that it matches the schema below. Keep every piece of information that
fits the schema. Output only valid JSON with no markdown formatting, no code blocks,
no explanations. Just the raw JSON object.

{}"#,
        problem,
        invalid_output,
        output_contract(shape)
    )
}
