//! Analyze stage.
//!
//! [`ModelAnalyzer`] asks the inference collaborator for a JSON analysis of
//! the parsed text and converts the reply into an [`Analysis`]. The reply is
//! untrusted input: it must parse as the expected JSON shape, every entity
//! needs a name and a known kind, and every relation must name entities
//! that exist. Anything else is rejected as a whole; no partial analysis
//! leaves this module.
//!
//! Fields the pipeline can derive itself are filled in here rather than
//! trusted from the model: entity spans and mention counts come from the raw
//! text, and sections fall back to the parser's heading hints when the model
//! returns none.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use documind_core::models::{
    Analysis, Concept, Difficulty, Entity, EntityKind, LearningStep, ParsedDocument, Relation,
    RelationKind, Section, Span,
};
use serde::Deserialize;
use thiserror::Error;

use crate::inference::{CompletionRequest, InferenceClient, InferenceError, Message};

/// Longest document excerpt sent to the model, in characters.
pub const MAX_PROMPT_CHARS: usize = 120_000;

/// Cap on recorded spans per entity.
const MAX_SPANS: usize = 64;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("analysis response is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("analysis response rejected: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait SemanticAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        document: &ParsedDocument,
        instructions: Option<&str>,
    ) -> Result<Analysis, AnalysisError>;
}

pub struct ModelAnalyzer {
    client: Arc<dyn InferenceClient>,
}

impl ModelAnalyzer {
    pub fn new(client: Arc<dyn InferenceClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SemanticAnalyzer for ModelAnalyzer {
    async fn analyze(
        &self,
        document: &ParsedDocument,
        instructions: Option<&str>,
    ) -> Result<Analysis, AnalysisError> {
        let request = CompletionRequest {
            system: Some(SYSTEM_PROMPT.to_string()),
            messages: vec![Message::user(build_prompt(document, instructions))],
            json: true,
        };
        let reply = self.client.complete(&request).await?;
        parse_analysis(&reply, document)
    }
}

const SYSTEM_PROMPT: &str = "You analyze technical documents for AI coding agents. \
Reply with a single JSON object and nothing else.";

fn build_prompt(document: &ParsedDocument, instructions: Option<&str>) -> String {
    let text = truncate_chars(&document.raw_text, MAX_PROMPT_CHARS);
    let mut prompt = format!(
        "Analyze the document titled \"{}\".\n\n\
         Return JSON with these keys:\n\
         - entities: [{{name, type (class|function|api|concept|tool|framework), description, importance (0-1), mentions}}]\n\
         - sections: [{{title, content, level (1-6), importance (0-1)}}] in document order\n\
         - relations: [{{source, target, type (uses|extends|implements|requires|contains|similar), strength (0-1), description}}] where source and target are entity names\n\
         - concepts: [{{name, definition, difficulty (beginner|intermediate|advanced)}}]\n\
         - learningPath: [{{title, description, estimatedMinutes}}]\n",
        document.title()
    );
    if let Some(extra) = instructions.filter(|s| !s.trim().is_empty()) {
        prompt.push_str("\nAdditional instructions from the user:\n");
        prompt.push_str(extra.trim());
        prompt.push('\n');
    }
    prompt.push_str("\nDocument:\n");
    prompt.push_str(text);
    prompt
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============ Wire shape ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAnalysis {
    entities: Vec<RawEntity>,
    #[serde(default)]
    sections: Vec<RawSection>,
    relations: Vec<RawRelation>,
    #[serde(default)]
    concepts: Vec<RawConcept>,
    #[serde(default)]
    learning_path: Vec<RawStep>,
}

#[derive(Deserialize)]
struct RawEntity {
    name: String,
    #[serde(alias = "kind")]
    r#type: String,
    #[serde(default)]
    description: String,
    importance: Option<f64>,
    mentions: Option<u32>,
}

#[derive(Deserialize)]
struct RawSection {
    title: String,
    #[serde(alias = "text")]
    content: String,
    level: Option<u8>,
    importance: Option<f64>,
}

#[derive(Deserialize)]
struct RawRelation {
    source: String,
    target: String,
    #[serde(alias = "kind")]
    r#type: String,
    strength: Option<f64>,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct RawConcept {
    name: String,
    #[serde(default)]
    definition: String,
    difficulty: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    title: String,
    #[serde(default)]
    description: String,
    estimated_minutes: Option<u32>,
}

/// Validate a model reply and turn it into an [`Analysis`].
pub fn parse_analysis(reply: &str, document: &ParsedDocument) -> Result<Analysis, AnalysisError> {
    let raw: RawAnalysis = serde_json::from_str(strip_code_fence(reply))
        .map_err(|e| AnalysisError::InvalidJson(e.to_string()))?;

    let mut entities: Vec<Entity> = Vec::with_capacity(raw.entities.len());
    let mut by_name: HashMap<String, String> = HashMap::new();
    for e in raw.entities {
        let name = e.name.trim().to_string();
        if name.is_empty() {
            return Err(AnalysisError::Invalid("entity with empty name".into()));
        }
        let key = name.to_lowercase();
        if by_name.contains_key(&key) {
            continue;
        }
        let kind = entity_kind(&e.r#type).ok_or_else(|| {
            AnalysisError::Invalid(format!("entity '{}' has unknown type '{}'", name, e.r#type))
        })?;
        let spans = find_spans(&document.raw_text, &name);
        let id = format!("entity:{}", entities.len());
        by_name.insert(key, id.clone());
        entities.push(Entity {
            id,
            kind,
            description: e.description.trim().to_string(),
            importance: unit(e.importance, 0.5),
            mentions: e.mentions.unwrap_or(0).max(spans.len() as u32),
            spans,
            name,
        });
    }

    let mut relations = Vec::with_capacity(raw.relations.len());
    for r in raw.relations {
        let lookup = |name: &str| {
            by_name.get(&name.trim().to_lowercase()).cloned().ok_or_else(|| {
                AnalysisError::Invalid(format!("relation references unknown entity '{}'", name))
            })
        };
        let kind = relation_kind(&r.r#type).ok_or_else(|| {
            AnalysisError::Invalid(format!("relation has unknown type '{}'", r.r#type))
        })?;
        relations.push(Relation {
            source: lookup(&r.source)?,
            target: lookup(&r.target)?,
            kind,
            strength: unit(r.strength, 0.5),
            description: r.description.trim().to_string(),
        });
    }

    let mut sections: Vec<Section> = raw
        .sections
        .into_iter()
        .filter(|s| !s.title.trim().is_empty() || !s.content.trim().is_empty())
        .map(|s| Section {
            title: s.title.trim().to_string(),
            text: s.content.trim().to_string(),
            level: s.level.unwrap_or(1).clamp(1, 6),
            importance: s.importance.map(|i| i.clamp(0.0, 1.0)),
        })
        .collect();
    if sections.is_empty() {
        sections = sections_from_hints(document);
    }

    let concepts = raw
        .concepts
        .into_iter()
        .enumerate()
        .map(|(i, c)| Concept {
            id: format!("concept:{}", i),
            name: c.name.trim().to_string(),
            definition: c.definition.trim().to_string(),
            difficulty: match c.difficulty.as_deref().map(str::to_ascii_lowercase).as_deref() {
                Some("beginner") => Difficulty::Beginner,
                Some("advanced") => Difficulty::Advanced,
                _ => Difficulty::Intermediate,
            },
        })
        .collect();

    let learning_path = raw
        .learning_path
        .into_iter()
        .enumerate()
        .map(|(i, s)| LearningStep {
            id: format!("step:{}", i + 1),
            title: s.title.trim().to_string(),
            description: s.description.trim().to_string(),
            estimated_minutes: s.estimated_minutes.unwrap_or(15),
        })
        .collect();

    Ok(Analysis {
        entities,
        sections,
        relations,
        concepts,
        learning_path,
    })
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.trim_start_matches("json");
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn unit(value: Option<f64>, default: f64) -> f64 {
    match value {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => default,
    }
}

fn entity_kind(s: &str) -> Option<EntityKind> {
    Some(match s.trim().to_ascii_lowercase().as_str() {
        "class" | "type" | "struct" => EntityKind::Class,
        "function" | "method" => EntityKind::Function,
        "api" | "endpoint" => EntityKind::Api,
        "concept" => EntityKind::Concept,
        "tool" | "library" => EntityKind::Tool,
        "framework" => EntityKind::Framework,
        _ => return None,
    })
}

fn relation_kind(s: &str) -> Option<RelationKind> {
    Some(match s.trim().to_ascii_lowercase().as_str() {
        "uses" => RelationKind::Uses,
        "extends" => RelationKind::Extends,
        "implements" => RelationKind::Implements,
        "requires" | "depends_on" => RelationKind::Requires,
        "contains" => RelationKind::Contains,
        "similar" | "related" => RelationKind::Similar,
        _ => return None,
    })
}

/// Byte ranges of exact occurrences of `needle` in `text`.
pub fn find_spans(text: &str, needle: &str) -> Vec<Span> {
    if needle.is_empty() {
        return Vec::new();
    }
    text.match_indices(needle)
        .take(MAX_SPANS)
        .map(|(start, m)| Span {
            start,
            end: start + m.len(),
        })
        .collect()
}

/// One section per heading hint, or the whole text as a single section.
pub fn sections_from_hints(document: &ParsedDocument) -> Vec<Section> {
    let text = &document.raw_text;
    let hints = &document.hints.sections;
    if hints.is_empty() {
        return vec![Section {
            title: document.title().to_string(),
            text: text.trim().to_string(),
            level: 1,
            importance: None,
        }];
    }

    let mut sections = Vec::with_capacity(hints.len() + 1);
    let preamble = text[..hints[0].offset].trim();
    if !preamble.is_empty() {
        sections.push(Section {
            title: document.title().to_string(),
            text: preamble.to_string(),
            level: 1,
            importance: None,
        });
    }
    for (i, hint) in hints.iter().enumerate() {
        let end = hints.get(i + 1).map(|h| h.offset).unwrap_or(text.len());
        let body = &text[hint.offset..end];
        // drop the heading line itself
        let body = body.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
        sections.push(Section {
            title: hint.title.clone(),
            text: body.trim().to_string(),
            level: hint.level,
            importance: None,
        });
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::build_document;
    use documind_core::models::SourceKind;

    fn doc(text: &str) -> ParsedDocument {
        build_document(
            "doc",
            SourceKind::Text,
            "inline".into(),
            text.into(),
            "text/markdown".into(),
            None,
            text.len(),
        )
        .unwrap()
    }

    #[test]
    fn converts_a_well_formed_reply() {
        let d = doc("# Guide\nThe Client uses the Pool. Client is cheap to clone.\n");
        let reply = r#"```json
{
  "entities": [
    {"name": "Client", "type": "class", "description": "HTTP client", "importance": 0.9},
    {"name": "Pool", "type": "Class", "importance": 7},
    {"name": "client", "type": "class"}
  ],
  "sections": [],
  "relations": [{"source": "client", "target": "Pool", "type": "uses"}],
  "concepts": [{"name": "pooling", "difficulty": "advanced"}],
  "learningPath": [{"title": "Read the guide"}]
}
```"#;
        let analysis = parse_analysis(reply, &d).unwrap();
        assert_eq!(analysis.entities.len(), 2);
        let client = &analysis.entities[0];
        assert_eq!(client.mentions, 2);
        assert_eq!(client.spans[0], Span { start: 12, end: 18 });
        assert_eq!(analysis.entities[1].importance, 1.0);
        assert_eq!(analysis.relations[0].source, "entity:0");
        assert_eq!(analysis.relations[0].target, "entity:1");
        assert_eq!(analysis.sections[0].title, "Guide");
        assert_eq!(analysis.concepts[0].difficulty, Difficulty::Advanced);
        assert_eq!(analysis.learning_path[0].id, "step:1");
    }

    #[test]
    fn rejects_malformed_replies() {
        let d = doc("text");
        assert!(matches!(
            parse_analysis("not json", &d),
            Err(AnalysisError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_analysis(r#"{"entities": []}"#, &d),
            Err(AnalysisError::InvalidJson(_))
        ));
        let dangling = r#"{"entities": [{"name": "A", "type": "tool"}],
            "relations": [{"source": "A", "target": "B", "type": "uses"}]}"#;
        assert!(matches!(
            parse_analysis(dangling, &d),
            Err(AnalysisError::Invalid(_))
        ));
        let bad_kind = r#"{"entities": [{"name": "A", "type": "planet"}], "relations": []}"#;
        assert!(matches!(
            parse_analysis(bad_kind, &d),
            Err(AnalysisError::Invalid(_))
        ));
    }

    #[test]
    fn hint_sections_split_on_headings() {
        let d = doc("intro line\n# One\nfirst body\n## Two\nsecond body\n");
        let sections = sections_from_hints(&d);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].text, "intro line");
        assert_eq!(sections[1].title, "One");
        assert_eq!(sections[1].text, "first body");
        assert_eq!(sections[2].level, 2);
        assert_eq!(sections[2].text, "second body");
    }

    #[test]
    fn prompt_is_bounded_and_carries_instructions() {
        let d = doc(&"é".repeat(MAX_PROMPT_CHARS + 10));
        let prompt = build_prompt(&d, Some("focus on errors"));
        assert!(prompt.contains("focus on errors"));
        assert!(prompt.chars().filter(|c| *c == 'é').count() == MAX_PROMPT_CHARS);
    }
}
