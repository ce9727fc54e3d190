//! # DocuMind Core
//!
//! Runtime-free logic for DocuMind: the typed contracts that flow between
//! pipeline stages, and the purely structural stages themselves.
//!
//! This crate contains no tokio, no network clients and no filesystem I/O.
//! Everything here is deterministic given its inputs, which is what lets the
//! orchestrator in the `documind` crate treat these stages as plain function
//! calls.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Stage contracts: `ParsedDocument`, `Analysis`, `KnowledgeGraph`, ... |
//! | [`stage`] | Stage identifiers and the per-run state machine |
//! | [`tokens`] | Token estimation |
//! | [`catalog`] | Target model profiles and token budgets |
//! | [`graph`] | Analysis → knowledge graph projection |
//! | [`optimize`] | Greedy, priority-ordered context compression |
//! | [`format`] | Output format rendering |
//! | [`validate`] | Post-generation sanity checks |

pub mod catalog;
pub mod format;
pub mod graph;
pub mod models;
pub mod optimize;
pub mod stage;
pub mod tokens;
pub mod validate;

pub use catalog::{BudgetRequest, CompressionLevel, ModelCatalog, ModelProfile};
pub use format::{Atomicity, FormatError, FormatGenerator, Generation, RenderInput};
pub use graph::{build_knowledge_graph, GraphError};
pub use optimize::{ContextOptimizer, OptimizeError};
pub use stage::{RunState, Stage};
pub use validate::{validate_output, ValidationError, ValidationLimits};
