//! Stage contracts shared by every phase of the pipeline.
//!
//! Each stage consumes the previous stage's output by reference and produces
//! a new, immutable value. Serialized field names are camelCase because these
//! types are returned verbatim by the HTTP API.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============ Parse stage ============

/// Where a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Url,
    Text,
}

/// A heading detected while parsing. `offset` is a byte offset into
/// [`ParsedDocument::raw_text`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionHint {
    pub title: String,
    pub level: u8,
    pub offset: usize,
}

/// Structure the parser could detect without any model help.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuralHints {
    pub title: Option<String>,
    pub content_type: String,
    pub sections: Vec<SectionHint>,
}

/// Canonical record produced by the parse stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedDocument {
    pub id: String,
    pub source_kind: SourceKind,
    /// Filename, URL, or `"inline"` for text sources.
    pub source_name: String,
    pub raw_text: String,
    pub hints: StructuralHints,
    pub size_bytes: usize,
    /// SHA-256 of the extracted text, hex encoded.
    pub checksum: String,
    pub timestamp: DateTime<Utc>,
}

impl ParsedDocument {
    /// Human title: the detected title, falling back to the source name.
    pub fn title(&self) -> &str {
        self.hints
            .title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.source_name)
    }
}

// ============ Analyze stage ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Class,
    Function,
    Api,
    Concept,
    Tool,
    Framework,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Class => "class",
            EntityKind::Function => "function",
            EntityKind::Api => "api",
            EntityKind::Concept => "concept",
            EntityKind::Tool => "tool",
            EntityKind::Framework => "framework",
        }
    }
}

/// Byte range in the parsed text where an entity is mentioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub kind: EntityKind,
    pub description: String,
    /// Analyzer-tagged importance in `[0, 1]`.
    pub importance: f64,
    pub mentions: u32,
    pub spans: Vec<Span>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Uses,
    Extends,
    Implements,
    Requires,
    Contains,
    Similar,
}

impl RelationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RelationKind::Uses => "uses",
            RelationKind::Extends => "extends",
            RelationKind::Implements => "implements",
            RelationKind::Requires => "requires",
            RelationKind::Contains => "contains",
            RelationKind::Similar => "similar",
        }
    }
}

/// Directed relation between two entities, by entity id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub source: String,
    pub target: String,
    pub kind: RelationKind,
    pub strength: f64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub title: String,
    pub text: String,
    pub level: u8,
    /// Analyzer-tagged importance; derived from `level` when absent.
    pub importance: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Concept {
    pub id: String,
    pub name: String,
    pub definition: String,
    pub difficulty: Difficulty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningStep {
    pub id: String,
    pub title: String,
    pub description: String,
    pub estimated_minutes: u32,
}

/// Output of the analyze stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub entities: Vec<Entity>,
    pub sections: Vec<Section>,
    pub relations: Vec<Relation>,
    pub concepts: Vec<Concept>,
    pub learning_path: Vec<LearningStep>,
}

// ============ Graph stage ============

/// Node kind label used for section nodes; entity nodes carry their
/// [`EntityKind`] label.
pub const SECTION_KIND: &str = "section";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub label: String,
    pub kind: String,
    pub importance: f64,
    /// Section body or entity description.
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub label: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: String,
    pub nodes: Vec<String>,
}

/// Graph derived from an [`Analysis`]. Nodes keep insertion order, which is
/// the tie-breaker wherever ordering matters downstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeGraph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub clusters: Vec<Cluster>,
    pub central_nodes: Vec<String>,
}

impl KnowledgeGraph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ============ Optimize stage ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFragment {
    /// Id of the graph node this fragment was serialized from.
    pub id: String,
    pub text: String,
    pub tokens: usize,
    pub importance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedContext {
    pub content: Vec<ContextFragment>,
    pub total_tokens: usize,
    pub compression_ratio: f64,
    pub target_model: String,
    /// Effective budget after context-window and compression adjustments.
    pub token_budget: usize,
    pub quality_score: f64,
}

impl OptimizedContext {
    /// All fragments joined with blank lines, as handed to chat sessions.
    pub fn render_text(&self) -> String {
        self.content
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

// ============ Generate stage ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputFormat {
    #[serde(rename = "agents.md")]
    AgentsMd,
    #[serde(rename = "copilot-instructions.md")]
    CopilotInstructions,
    #[serde(rename = "custom-context")]
    CustomContext,
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "xml")]
    Xml,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 5] = [
        OutputFormat::AgentsMd,
        OutputFormat::CopilotInstructions,
        OutputFormat::CustomContext,
        OutputFormat::Json,
        OutputFormat::Xml,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::AgentsMd => "agents.md",
            OutputFormat::CopilotInstructions => "copilot-instructions.md",
            OutputFormat::CustomContext => "custom-context",
            OutputFormat::Json => "json",
            OutputFormat::Xml => "xml",
        }
    }

    pub fn filename(self) -> &'static str {
        match self {
            OutputFormat::AgentsMd => "AGENTS.md",
            OutputFormat::CopilotInstructions => "copilot-instructions.md",
            OutputFormat::CustomContext => "custom-context.md",
            OutputFormat::Json => "documind-result.json",
            OutputFormat::Xml => "documind-context.xml",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutputFormat::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedFile {
    pub format: OutputFormat,
    pub filename: String,
    pub content: String,
    pub size_bytes: usize,
    pub token_count: usize,
    pub target_model: String,
    pub generated_at: DateTime<Utc>,
}

// ============ Result ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetrics {
    pub processing_time_ms: u64,
    pub token_count: usize,
    pub compression_ratio: f64,
}

/// Everything a successful run produced. Only ever built once every stage,
/// including validation, has succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub id: String,
    pub document: ParsedDocument,
    pub analysis: Analysis,
    pub knowledge_graph: KnowledgeGraph,
    pub optimized_context: OptimizedContext,
    pub generated_files: Vec<GeneratedFile>,
    /// Formats skipped in best-effort mode.
    pub warnings: Vec<String>,
    pub metrics: ProcessingMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_format_round_trips_identifiers() {
        for format in OutputFormat::ALL {
            assert_eq!(format.as_str().parse::<OutputFormat>(), Ok(format));
        }
        assert_eq!(
            "docx".parse::<OutputFormat>(),
            Err("docx".to_string())
        );
    }

    #[test]
    fn output_format_serializes_as_identifier() {
        let json = serde_json::to_string(&OutputFormat::AgentsMd).unwrap();
        assert_eq!(json, "\"agents.md\"");
    }

    #[test]
    fn title_falls_back_to_source_name() {
        let doc = ParsedDocument {
            id: "d".into(),
            source_kind: SourceKind::File,
            source_name: "notes.md".into(),
            raw_text: String::new(),
            hints: StructuralHints {
                title: Some("  ".into()),
                ..Default::default()
            },
            size_bytes: 0,
            checksum: String::new(),
            timestamp: Utc::now(),
        };
        assert_eq!(doc.title(), "notes.md");
    }
}
