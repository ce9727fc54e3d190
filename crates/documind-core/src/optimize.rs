//! Token-budgeted context compression.
//!
//! # Algorithm
//!
//! 1. Resolve the effective budget for the target model (see [`crate::catalog`]).
//! 2. Serialize every graph node into one fragment, applying the model's
//!    fragment framing before counting tokens.
//! 3. Rank fragments by importance (desc), ties by graph insertion order.
//! 4. Walk the ranking, accumulating whole fragments while the running total
//!    stays within budget. The first fragment that would overflow ends the
//!    walk; fragments are never truncated.
//! 5. Emit the included fragments in graph insertion order.
//!
//! `compressionRatio = included tokens ÷ serialized tokens`, so a graph that
//! fits entirely has a ratio of exactly `1.0`.

use thiserror::Error;

use crate::catalog::{BudgetRequest, CatalogError, ModelCatalog, ModelProfile};
use crate::models::{ContextFragment, KnowledgeGraph, OptimizedContext, SECTION_KIND};
use crate::tokens::estimate_tokens;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptimizeError {
    #[error(transparent)]
    Model(#[from] CatalogError),
    #[error("highest-priority fragment needs {needed} tokens but the budget is {budget}")]
    BudgetTooSmall { budget: usize, needed: usize },
}

#[derive(Debug, Clone, Default)]
pub struct ContextOptimizer {
    catalog: ModelCatalog,
}

impl ContextOptimizer {
    pub fn new(catalog: ModelCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Effective budget for `target_model`, without touching any graph.
    pub fn budget_for(&self, target_model: &str, request: &BudgetRequest) -> Result<usize, OptimizeError> {
        Ok(self.catalog.resolve(target_model, request)?.1)
    }

    pub fn optimize(
        &self,
        graph: &KnowledgeGraph,
        target_model: &str,
        request: &BudgetRequest,
    ) -> Result<OptimizedContext, OptimizeError> {
        let (profile, budget) = self.catalog.resolve(target_model, request)?;
        let fragments = serialize_fragments(graph, profile);
        let original: usize = fragments.iter().map(|f| f.tokens).sum();

        let mut ranked: Vec<usize> = (0..fragments.len()).collect();
        // stable sort keeps insertion order among equal importance
        ranked.sort_by(|&a, &b| fragments[b].importance.total_cmp(&fragments[a].importance));

        let mut keep = vec![false; fragments.len()];
        let mut total = 0usize;
        for &i in &ranked {
            let tokens = fragments[i].tokens;
            if total + tokens > budget {
                break;
            }
            total += tokens;
            keep[i] = true;
        }

        if total == 0 {
            if let Some(&first) = ranked.first() {
                return Err(OptimizeError::BudgetTooSmall {
                    budget,
                    needed: fragments[first].tokens,
                });
            }
        }

        let content: Vec<ContextFragment> = fragments
            .into_iter()
            .zip(keep)
            .filter_map(|(f, kept)| kept.then_some(f))
            .collect();

        let quality_score = if content.is_empty() {
            0.0
        } else {
            content.iter().map(|f| f.importance).sum::<f64>() / content.len() as f64
        };

        let compression_ratio = if original == 0 {
            1.0
        } else {
            total as f64 / original as f64
        };

        Ok(OptimizedContext {
            content,
            total_tokens: total,
            compression_ratio,
            target_model: profile.name.clone(),
            token_budget: budget,
            quality_score,
        })
    }
}

/// One fragment per node, in node order.
///
/// Sections render as a Markdown heading plus body. Entities render as a
/// bold name with kind and description, followed by one line per outgoing
/// relation (structural `contains` edges are implied by section bodies).
pub fn serialize_fragments(graph: &KnowledgeGraph, profile: &ModelProfile) -> Vec<ContextFragment> {
    graph
        .nodes
        .iter()
        .map(|node| {
            let mut text = if node.kind == SECTION_KIND {
                if node.text.trim().is_empty() {
                    format!("## {}", node.label)
                } else {
                    format!("## {}\n\n{}", node.label, node.text.trim())
                }
            } else {
                format!("**{}** ({}): {}", node.label, node.kind, node.text.trim())
            };

            if node.kind != SECTION_KIND {
                for edge in graph
                    .edges
                    .iter()
                    .filter(|e| e.source == node.id && e.label != "contains")
                {
                    let target = graph
                        .node(&edge.target)
                        .map(|n| n.label.as_str())
                        .unwrap_or(edge.target.as_str());
                    text.push_str(&format!("\n- {} {}", edge.label, target));
                }
            }

            let text = profile.wrap(&text);
            ContextFragment {
                id: node.id.clone(),
                tokens: estimate_tokens(&text),
                text,
                importance: node.importance,
            }
        })
        .collect()
}
