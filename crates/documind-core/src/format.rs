//! Output format rendering.
//!
//! Every requested format is rendered independently from the same
//! [`RenderInput`]; no format reads another's output. What happens when one
//! format fails depends on [`Atomicity`]:
//!
//! - `best-effort`: the failed format is omitted and a warning recorded.
//! - `all-or-nothing`: the first failure aborts the whole call.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    Analysis, Entity, EntityKind, GeneratedFile, KnowledgeGraph, OptimizedContext, OutputFormat,
};
use crate::tokens::estimate_tokens;

/// Multi-format failure policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Atomicity {
    #[default]
    BestEffort,
    AllOrNothing,
}

impl FromStr for Atomicity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best-effort" => Ok(Atomicity::BestEffort),
            "all-or-nothing" => Ok(Atomicity::AllOrNothing),
            other => Err(format!(
                "unknown atomicity '{other}' (expected best-effort or all-or-nothing)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("unsupported output format '{0}'")]
    UnsupportedFormat(String),
    #[error("failed to render {format}: {message}")]
    Render { format: OutputFormat, message: String },
    #[error("no output formats requested")]
    NoFormats,
}

/// Everything a renderer may read.
#[derive(Debug, Clone, Copy)]
pub struct RenderInput<'a> {
    pub document_id: &'a str,
    pub title: &'a str,
    pub context: &'a OptimizedContext,
    pub graph: &'a KnowledgeGraph,
    pub analysis: &'a Analysis,
    pub instructions: Option<&'a str>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub files: Vec<GeneratedFile>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FormatGenerator {
    atomicity: Atomicity,
}

impl FormatGenerator {
    pub fn new(atomicity: Atomicity) -> Self {
        Self { atomicity }
    }

    pub fn atomicity(&self) -> Atomicity {
        self.atomicity
    }

    /// Render each requested format. Repeated identifiers are rendered once.
    pub fn generate(&self, input: &RenderInput<'_>, formats: &[String]) -> Result<Generation, FormatError> {
        if formats.is_empty() {
            return Err(FormatError::NoFormats);
        }

        let mut seen: Vec<&str> = Vec::new();
        let mut generation = Generation::default();

        for requested in formats {
            if seen.contains(&requested.as_str()) {
                continue;
            }
            seen.push(requested.as_str());

            let outcome = requested
                .parse::<OutputFormat>()
                .map_err(FormatError::UnsupportedFormat)
                .and_then(|format| render(format, input));

            match (outcome, self.atomicity) {
                (Ok(file), _) => generation.files.push(file),
                (Err(e), Atomicity::AllOrNothing) => return Err(e),
                (Err(e), Atomicity::BestEffort) => generation.warnings.push(e.to_string()),
            }
        }

        Ok(generation)
    }
}

/// Render a single format.
pub fn render(format: OutputFormat, input: &RenderInput<'_>) -> Result<GeneratedFile, FormatError> {
    let content = match format {
        OutputFormat::AgentsMd => render_agents_md(input),
        OutputFormat::CopilotInstructions => render_copilot(input),
        OutputFormat::CustomContext => render_custom_context(input),
        OutputFormat::Json => render_json(input),
        OutputFormat::Xml => render_xml(input),
    }
    .map_err(|message| FormatError::Render { format, message })?;

    Ok(GeneratedFile {
        format,
        filename: format.filename().to_string(),
        size_bytes: content.len(),
        token_count: estimate_tokens(&content),
        target_model: input.context.target_model.clone(),
        generated_at: input.generated_at,
        content,
    })
}

/// Entities by importance, highest first, stable on ties.
fn ranked_entities(analysis: &Analysis) -> Vec<&Entity> {
    let mut entities: Vec<_> = analysis.entities.iter().collect();
    entities.sort_by(|a, b| b.importance.total_cmp(&a.importance));
    entities
}

fn summary_topics(input: &RenderInput<'_>, limit: usize) -> String {
    let from_concepts: Vec<&str> = input
        .analysis
        .concepts
        .iter()
        .take(limit)
        .map(|c| c.name.as_str())
        .collect();
    if !from_concepts.is_empty() {
        return from_concepts.join(", ");
    }
    let from_graph: Vec<&str> = input
        .graph
        .central_nodes
        .iter()
        .filter_map(|id| input.graph.node(id))
        .take(limit)
        .map(|n| n.label.as_str())
        .collect();
    if from_graph.is_empty() {
        "its main subject".to_string()
    } else {
        from_graph.join(", ")
    }
}

fn render_agents_md(input: &RenderInput<'_>) -> Result<String, String> {
    let mut out = format!("# AGENTS.md for {}\n\n", input.title);

    out.push_str("## Top-Level Summary\n\n");
    out.push_str(&format!(
        "This document provides an overview of {}, covering {}.\n\n",
        input.title,
        summary_topics(input, 3)
    ));

    let entities = ranked_entities(input.analysis);
    if !entities.is_empty() {
        out.push_str("## Key Concepts & Entities\n\n");
        for entity in entities.iter().take(5) {
            out.push_str(&format!(
                "* **{} ({}):** {}\n",
                entity.name,
                entity.kind.as_str(),
                entity.description
            ));
        }
        out.push('\n');
    }

    if !input.analysis.learning_path.is_empty() {
        out.push_str("## Learning Path\n\n");
        for (i, step) in input.analysis.learning_path.iter().enumerate() {
            out.push_str(&format!("{}. **{}**: {}\n", i + 1, step.title, step.description));
        }
        out.push('\n');
    }

    if let Some(instructions) = input.instructions.filter(|s| !s.trim().is_empty()) {
        out.push_str("## Project Instructions\n\n");
        out.push_str(instructions.trim());
        out.push_str("\n\n");
    }

    out.push_str("## Context\n\n");
    out.push_str(&input.context.render_text());
    out.push('\n');
    Ok(out)
}

fn render_copilot(input: &RenderInput<'_>) -> Result<String, String> {
    let mut out = format!("# Copilot Instructions for {}\n\n", input.title);

    out.push_str("## Core Purpose\n\n");
    out.push_str(&format!(
        "This material describes {}. It focuses on {}.\n\n",
        input.title,
        summary_topics(input, 2)
    ));

    let components: Vec<_> = ranked_entities(input.analysis)
        .into_iter()
        .filter(|e| matches!(e.kind, EntityKind::Class | EntityKind::Function | EntityKind::Api))
        .take(4)
        .collect();
    if !components.is_empty() {
        out.push_str("## Key Files & Components\n\n");
        for entity in components {
            out.push_str(&format!(
                "* `{}`: a key {} responsible for {}\n",
                entity.name,
                entity.kind.as_str(),
                entity.description
            ));
        }
        out.push('\n');
    }

    if let Some(instructions) = input.instructions.filter(|s| !s.trim().is_empty()) {
        out.push_str("## Guidelines\n\n");
        out.push_str(instructions.trim());
        out.push_str("\n\n");
    }

    out.push_str("## Reference Context\n\n");
    out.push_str(&input.context.render_text());
    out.push('\n');
    Ok(out)
}

fn render_custom_context(input: &RenderInput<'_>) -> Result<String, String> {
    let ctx = input.context;
    let mut out = format!("# {}: Custom Context\n\n", input.title);
    out.push_str(&format!(
        "> Target model: {} | Tokens: {}/{} | Compression: {:.2} | Quality: {:.2}\n\n",
        ctx.target_model, ctx.total_tokens, ctx.token_budget, ctx.compression_ratio, ctx.quality_score
    ));

    if let Some(instructions) = input.instructions.filter(|s| !s.trim().is_empty()) {
        out.push_str("## Instructions\n\n");
        out.push_str(instructions.trim());
        out.push_str("\n\n");
    }

    out.push_str("## Fragments\n\n");
    for fragment in &ctx.content {
        out.push_str(&format!(
            "<!-- fragment {} importance {:.2} tokens {} -->\n{}\n\n",
            fragment.id, fragment.importance, fragment.tokens, fragment.text
        ));
    }

    if !input.graph.central_nodes.is_empty() {
        out.push_str("## Central Topics\n\n");
        for id in &input.graph.central_nodes {
            if let Some(node) = input.graph.node(id) {
                out.push_str(&format!("- {} ({})\n", node.label, node.kind));
            }
        }
        out.push('\n');
    }

    if !input.graph.clusters.is_empty() {
        out.push_str("## Clusters\n\n");
        for cluster in &input.graph.clusters {
            let labels: Vec<&str> = cluster
                .nodes
                .iter()
                .filter_map(|id| input.graph.node(id))
                .map(|n| n.label.as_str())
                .collect();
            out.push_str(&format!("- {}: {}\n", cluster.id, labels.join(", ")));
        }
    }

    Ok(out)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonExport<'a> {
    document_id: &'a str,
    title: &'a str,
    generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_instructions: Option<&'a str>,
    analysis: &'a Analysis,
    knowledge_graph: &'a KnowledgeGraph,
    optimized_context: &'a OptimizedContext,
}

fn render_json(input: &RenderInput<'_>) -> Result<String, String> {
    let export = JsonExport {
        document_id: input.document_id,
        title: input.title,
        generated_at: input.generated_at,
        custom_instructions: input.instructions,
        analysis: input.analysis,
        knowledge_graph: input.graph,
        optimized_context: input.context,
    };
    serde_json::to_string_pretty(&export).map_err(|e| e.to_string())
}

struct XmlOut {
    writer: Writer<Vec<u8>>,
}

impl XmlOut {
    fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        }
    }

    fn event(&mut self, event: Event<'_>) -> Result<(), String> {
        self.writer.write_event(event).map_err(|e| e.to_string())
    }

    fn start(&mut self, name: &str, attrs: &[(&str, String)]) -> Result<(), String> {
        let mut elem = BytesStart::new(name);
        for (key, value) in attrs {
            elem.push_attribute((*key, value.as_str()));
        }
        self.event(Event::Start(elem))
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, String)]) -> Result<(), String> {
        let mut elem = BytesStart::new(name);
        for (key, value) in attrs {
            elem.push_attribute((*key, value.as_str()));
        }
        self.event(Event::Empty(elem))
    }

    fn end(&mut self, name: &str) -> Result<(), String> {
        self.event(Event::End(BytesEnd::new(name)))
    }

    fn text_element(&mut self, name: &str, attrs: &[(&str, String)], text: &str) -> Result<(), String> {
        self.start(name, attrs)?;
        self.event(Event::Text(BytesText::new(text)))?;
        self.end(name)
    }

    fn finish(self) -> Result<String, String> {
        String::from_utf8(self.writer.into_inner()).map_err(|e| e.to_string())
    }
}

fn render_xml(input: &RenderInput<'_>) -> Result<String, String> {
    let ctx = input.context;
    let mut xml = XmlOut::new();
    xml.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    xml.start(
        "documind",
        &[
            ("id", input.document_id.to_string()),
            ("title", input.title.to_string()),
            ("targetModel", ctx.target_model.clone()),
            ("totalTokens", ctx.total_tokens.to_string()),
            ("compressionRatio", format!("{:.4}", ctx.compression_ratio)),
            ("generatedAt", input.generated_at.to_rfc3339()),
        ],
    )?;

    if let Some(instructions) = input.instructions.filter(|s| !s.trim().is_empty()) {
        xml.text_element("instructions", &[], instructions.trim())?;
    }

    xml.start("context", &[])?;
    for fragment in &ctx.content {
        xml.text_element(
            "fragment",
            &[
                ("id", fragment.id.clone()),
                ("importance", format!("{:.2}", fragment.importance)),
                ("tokens", fragment.tokens.to_string()),
            ],
            &fragment.text,
        )?;
    }
    xml.end("context")?;

    xml.start("graph", &[])?;
    xml.start("nodes", &[])?;
    for node in &input.graph.nodes {
        xml.text_element(
            "node",
            &[
                ("id", node.id.clone()),
                ("kind", node.kind.clone()),
                ("importance", format!("{:.2}", node.importance)),
            ],
            &node.label,
        )?;
    }
    xml.end("nodes")?;
    xml.start("edges", &[])?;
    for edge in &input.graph.edges {
        xml.empty(
            "edge",
            &[
                ("source", edge.source.clone()),
                ("target", edge.target.clone()),
                ("label", edge.label.clone()),
                ("weight", format!("{:.2}", edge.weight)),
            ],
        )?;
    }
    xml.end("edges")?;
    xml.end("graph")?;

    xml.end("documind")?;
    xml.finish()
}
