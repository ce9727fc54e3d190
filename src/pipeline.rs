//! Pipeline orchestrator.
//!
//! Runs one document through the six stages in strict order:
//!
//! ```text
//! parse → analyze → buildKnowledgeGraph → optimizeContext → generate → validate
//! ```
//!
//! Each run gets a fresh document id. Every stage is bounded by its own
//! timeout, advances the [`Ledger`] before it starts, and has its failure
//! wrapped into a [`PipelineFailure`] naming the stage. The first failure
//! ends the run; no partial [`ProcessingResult`] is ever returned.
//!
//! Caller mistakes that need no document (unknown target model, and unknown
//! formats in all-or-nothing mode) are rejected by [`Pipeline::preflight`]
//! before a run is opened, so they never reach the ledger.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use documind_core::catalog::{BudgetRequest, CompressionLevel, ModelCatalog};
use documind_core::format::{Atomicity, FormatGenerator, RenderInput};
use documind_core::graph::build_knowledge_graph;
use documind_core::models::{OutputFormat, ProcessingMetrics, ProcessingResult};
use documind_core::optimize::ContextOptimizer;
use documind_core::stage::Stage;
use documind_core::validate::{validate_output, ValidationLimits};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::analyzer::SemanticAnalyzer;
use crate::config::{Config, TimeoutConfig};
use crate::error::{FailureKind, PipelineFailure};
use crate::ledger::Ledger;
use crate::metrics::Metrics;
use crate::parser::{DocumentParser, Source};

/// Caller-supplied run options. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessOptions {
    pub target_model: Option<String>,
    pub output_formats: Vec<String>,
    /// Caps the target model's token budget.
    pub context_window: Option<usize>,
    pub compression_level: CompressionLevel,
    pub custom_instructions: Option<String>,
}

/// Options resolved against configured defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub target_model: String,
    pub budget: BudgetRequest,
    pub token_budget: usize,
    pub formats: Vec<String>,
    pub instructions: Option<String>,
}

pub struct Pipeline {
    parser: Arc<dyn DocumentParser>,
    analyzer: Arc<dyn SemanticAnalyzer>,
    optimizer: ContextOptimizer,
    generator: FormatGenerator,
    limits: ValidationLimits,
    timeouts: TimeoutConfig,
    default_model: String,
    default_formats: Vec<String>,
    ledger: Arc<Ledger>,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        parser: Arc<dyn DocumentParser>,
        analyzer: Arc<dyn SemanticAnalyzer>,
    ) -> Self {
        Self {
            parser,
            analyzer,
            optimizer: ContextOptimizer::new(config.model_catalog()),
            generator: FormatGenerator::new(config.pipeline.atomicity),
            limits: config.pipeline.validation_limits(),
            timeouts: config.timeouts.clone(),
            default_model: config.pipeline.default_model.clone(),
            default_formats: config.pipeline.default_formats.clone(),
            ledger: Arc::new(Ledger::new(Duration::from_secs(
                config.pipeline.ledger_ttl_secs,
            ))),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn catalog(&self) -> &ModelCatalog {
        self.optimizer.catalog()
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Resolve `options` and reject what can be rejected without a document.
    pub fn preflight(&self, document_id: &str, options: &ProcessOptions) -> Result<RunPlan, PipelineFailure> {
        let target_model = options
            .target_model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.default_model.clone());
        let budget = BudgetRequest {
            context_window: options.context_window,
            compression: options.compression_level,
        };
        let token_budget = self
            .optimizer
            .budget_for(&target_model, &budget)
            .map_err(|e| {
                PipelineFailure::new(Stage::Optimize, (&e).into(), document_id, e.to_string())
            })?;

        let formats = if options.output_formats.is_empty() {
            self.default_formats.clone()
        } else {
            options.output_formats.clone()
        };
        if self.generator.atomicity() == Atomicity::AllOrNothing {
            if let Some(bad) = formats.iter().find(|f| f.parse::<OutputFormat>().is_err()) {
                return Err(PipelineFailure::new(
                    Stage::Generate,
                    FailureKind::UnsupportedFormat,
                    document_id,
                    format!("unsupported output format '{}'", bad),
                ));
            }
        }

        Ok(RunPlan {
            target_model,
            budget,
            token_budget,
            formats,
            instructions: options
                .custom_instructions
                .clone()
                .filter(|s| !s.trim().is_empty()),
        })
    }

    /// Run `source` through every stage under a freshly allocated id.
    pub async fn run(&self, source: Source, options: &ProcessOptions) -> Result<ProcessingResult, PipelineFailure> {
        let document_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let plan = self.preflight(&document_id, options).inspect_err(|f| {
            info!(document_id = %f.document_id, code = f.kind.code(), "rejected before run: {}", f.message);
        })?;

        self.metrics.record_start();
        self.ledger.open(&document_id);
        info!(
            document_id = %document_id,
            source = source.describe(),
            model = %plan.target_model,
            budget = plan.token_budget,
            "pipeline run started"
        );

        match self.execute(&document_id, source, &plan, started).await {
            Ok(result) => {
                self.ledger.advance(&document_id);
                self.metrics.record_success(
                    result.metrics.processing_time_ms,
                    result.metrics.token_count,
                    result.metrics.compression_ratio,
                );
                info!(
                    document_id = %document_id,
                    ms = result.metrics.processing_time_ms,
                    tokens = result.metrics.token_count,
                    files = result.generated_files.len(),
                    "pipeline run completed"
                );
                Ok(result)
            }
            Err(failure) => {
                self.ledger.fail(&failure);
                self.metrics.record_failure(failure.kind);
                if failure.kind == FailureKind::InvariantViolation {
                    error!(document_id = %document_id, stage = %failure.stage, "invariant violated: {}", failure.message);
                } else {
                    warn!(document_id = %document_id, stage = %failure.stage, code = failure.kind.code(), "pipeline run failed: {}", failure.message);
                }
                Err(failure)
            }
        }
    }

    async fn execute(
        &self,
        id: &str,
        source: Source,
        plan: &RunPlan,
        started: Instant,
    ) -> Result<ProcessingResult, PipelineFailure> {
        let document = self
            .stage(id, Stage::Parse, async {
                self.parser
                    .parse(id, source)
                    .await
                    .map_err(|e| {
                        let caller_error = e.is_caller_error();
                        let failure = fail(Stage::Parse, FailureKind::ParseFailure, id, e);
                        if caller_error {
                            failure
                        } else {
                            failure.with_internal_detail()
                        }
                    })
            })
            .await?;

        let analysis = self
            .stage(id, Stage::Analyze, async {
                self.analyzer
                    .analyze(&document, plan.instructions.as_deref())
                    .await
                    .map_err(|e| fail(Stage::Analyze, FailureKind::AnalysisFailure, id, e))
            })
            .await?;

        let graph = self
            .stage(id, Stage::BuildGraph, async {
                build_knowledge_graph(&analysis)
                    .map_err(|e| fail(Stage::BuildGraph, (&e).into(), id, e))
            })
            .await?;

        let context = self
            .stage(id, Stage::Optimize, async {
                self.optimizer
                    .optimize(&graph, &plan.target_model, &plan.budget)
                    .map_err(|e| fail(Stage::Optimize, (&e).into(), id, e))
            })
            .await?;

        let generation = self
            .stage(id, Stage::Generate, async {
                let input = RenderInput {
                    document_id: id,
                    title: document.title(),
                    context: &context,
                    graph: &graph,
                    analysis: &analysis,
                    instructions: plan.instructions.as_deref(),
                    generated_at: Utc::now(),
                };
                let generation = self
                    .generator
                    .generate(&input, &plan.formats)
                    .map_err(|e| fail(Stage::Generate, (&e).into(), id, e))?;
                if generation.files.is_empty() {
                    return Err(fail(
                        Stage::Generate,
                        FailureKind::UnsupportedFormat,
                        id,
                        format!(
                            "no requested format could be generated: {}",
                            generation.warnings.join("; ")
                        ),
                    ));
                }
                Ok(generation)
            })
            .await?;

        self.stage(id, Stage::Validate, async {
            validate_output(&context, &generation.files, &self.limits)
                .map_err(|e| fail(Stage::Validate, (&e).into(), id, e))
        })
        .await?;

        let metrics = ProcessingMetrics {
            processing_time_ms: started.elapsed().as_millis() as u64,
            token_count: context.total_tokens,
            compression_ratio: context.compression_ratio,
        };

        Ok(ProcessingResult {
            id: id.to_string(),
            document,
            analysis,
            knowledge_graph: graph,
            optimized_context: context,
            generated_files: generation.files,
            warnings: generation.warnings,
            metrics,
        })
    }

    /// Advance the ledger into `stage` and run `work` under its time bound.
    async fn stage<T, F>(&self, id: &str, stage: Stage, work: F) -> Result<T, PipelineFailure>
    where
        F: Future<Output = Result<T, PipelineFailure>>,
    {
        self.ledger.advance(id);
        debug!(document_id = %id, stage = stage.name(), "stage started");
        let limit = self.timeouts.for_stage(stage);
        match tokio::time::timeout(limit, work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PipelineFailure::new(
                stage,
                FailureKind::StageTimeout,
                id,
                format!("{} did not finish within {}s", stage, limit.as_secs()),
            )),
        }
    }
}

fn fail(stage: Stage, kind: FailureKind, id: &str, err: impl std::fmt::Display) -> PipelineFailure {
    PipelineFailure::new(stage, kind, id, err.to_string())
}
