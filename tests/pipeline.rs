//! End-to-end pipeline runs with a scripted inference client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use documind::analyzer::{AnalysisError, ModelAnalyzer, SemanticAnalyzer};
use documind::config::Config;
use documind::error::FailureKind;
use documind::ledger::ProgressEvent;
use documind::inference::{CompletionRequest, InferenceClient, InferenceError};
use documind::parser::{DefaultParser, Source};
use documind::pipeline::{Pipeline, ProcessOptions};
use documind_core::format::Atomicity;
use documind_core::models::{Analysis, OutputFormat, ParsedDocument};
use documind_core::stage::{RunState, Stage};

const GUIDE: &str = "# Pool Guide\n\nThe Client borrows connections from the Pool.\n\n\
## Configuration\n\nSet max_size on the Pool before handing it to the Client. \
Idle connections are reaped after thirty seconds.\n\n\
## Troubleshooting\n\nIf the Client stalls, the Pool is exhausted. Raise max_size or \
shorten the time each request holds a connection.\n";

const ANALYSIS_REPLY: &str = r#"{
  "entities": [
    {"name": "Client", "type": "class", "description": "Issues requests", "importance": 0.9},
    {"name": "Pool", "type": "class", "description": "Owns connections", "importance": 0.8},
    {"name": "max_size", "type": "concept", "description": "Pool capacity", "importance": 0.4}
  ],
  "relations": [
    {"source": "Client", "target": "Pool", "type": "uses", "strength": 0.9},
    {"source": "Pool", "target": "max_size", "type": "requires"}
  ],
  "concepts": [{"name": "connection pooling", "definition": "Reusing connections", "difficulty": "intermediate"}],
  "learningPath": [{"title": "Configure the pool", "estimatedMinutes": 10}]
}"#;

/// Replies with the same canned text every time.
struct Scripted(&'static str);

#[async_trait]
impl InferenceClient for Scripted {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String, InferenceError> {
        Ok(self.0.to_string())
    }
}

/// Never finishes within any reasonable stage timeout.
struct Stalled;

#[async_trait]
impl SemanticAnalyzer for Stalled {
    async fn analyze(
        &self,
        _document: &ParsedDocument,
        _instructions: Option<&str>,
    ) -> Result<Analysis, AnalysisError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Analysis::default())
    }
}

fn pipeline_with(config: &Config, analyzer: Arc<dyn SemanticAnalyzer>) -> Pipeline {
    let parser = Arc::new(
        DefaultParser::new(config.server.max_upload_bytes(), Duration::from_secs(5)).unwrap(),
    );
    Pipeline::new(config, parser, analyzer)
}

fn pipeline(config: &Config) -> Pipeline {
    pipeline_with(
        config,
        Arc::new(ModelAnalyzer::new(Arc::new(Scripted(ANALYSIS_REPLY)))),
    )
}

/// Every event already broadcast for `document_id`, in order.
fn drain_events(
    events: &mut tokio::sync::broadcast::Receiver<ProgressEvent>,
    document_id: &str,
) -> Vec<ProgressEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.document_id == document_id {
            seen.push(event);
        }
    }
    seen
}

fn guide() -> Source {
    Source::Text {
        text: GUIDE.to_string(),
        title: None,
    }
}

fn options(model: &str, formats: &[&str]) -> ProcessOptions {
    ProcessOptions {
        target_model: Some(model.to_string()),
        output_formats: formats.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn full_run_produces_every_requested_file() {
    let p = pipeline(&Config::default());
    let result = p
        .run(guide(), &options("gpt-4", &["agents.md", "json", "xml"]))
        .await
        .unwrap();

    assert_eq!(result.document.title(), "Pool Guide");
    assert_eq!(result.analysis.entities.len(), 3);
    assert!(!result.knowledge_graph.nodes.is_empty());
    assert_eq!(result.optimized_context.target_model, "gpt-4");
    assert!(result.optimized_context.total_tokens <= result.optimized_context.token_budget);
    assert_eq!(result.optimized_context.compression_ratio, 1.0);

    let formats: Vec<OutputFormat> = result.generated_files.iter().map(|f| f.format).collect();
    assert_eq!(
        formats,
        vec![OutputFormat::AgentsMd, OutputFormat::Json, OutputFormat::Xml]
    );
    for file in &result.generated_files {
        assert!(file.size_bytes > 0);
        assert_eq!(file.target_model, "gpt-4");
    }

    let status = p.ledger().status(&result.id).unwrap();
    assert_eq!(status.state, RunState::Done);
    assert_eq!(status.state.progress(), 100);

    let snapshot = p.metrics().snapshot();
    assert_eq!(snapshot.runs_started, 1);
    assert_eq!(snapshot.runs_completed, 1);
    assert_eq!(snapshot.total_tokens, result.metrics.token_count as u64);
}

#[tokio::test]
async fn run_pushes_one_progress_event_per_transition() {
    let p = pipeline(&Config::default());
    let mut events = p.ledger().subscribe();
    let result = p
        .run(guide(), &options("gpt-4", &["json"]))
        .await
        .unwrap();

    let seen = drain_events(&mut events, &result.id);
    let labels: Vec<(&str, Option<&str>)> = seen.iter().map(|e| (e.status, e.stage)).collect();
    assert_eq!(
        labels,
        vec![
            ("queued", None),
            ("running", Some("parse")),
            ("running", Some("analyze")),
            ("running", Some("buildKnowledgeGraph")),
            ("running", Some("optimizeContext")),
            ("running", Some("generate")),
            ("running", Some("validate")),
            ("completed", None),
        ]
    );
    assert!(seen.windows(2).all(|w| w[0].progress <= w[1].progress));
    assert_eq!(seen.last().unwrap().progress, 100);
}

#[tokio::test]
async fn failed_run_pushes_failure_at_the_failing_stage() {
    let config = Config::default();
    let p = pipeline_with(
        &config,
        Arc::new(ModelAnalyzer::new(Arc::new(Scripted("not json")))),
    );
    let mut events = p.ledger().subscribe();
    let failure = p
        .run(guide(), &options("gpt-4", &["json"]))
        .await
        .unwrap_err();

    let seen = drain_events(&mut events, &failure.document_id);
    let labels: Vec<(&str, Option<&str>)> = seen.iter().map(|e| (e.status, e.stage)).collect();
    assert_eq!(
        labels,
        vec![
            ("queued", None),
            ("running", Some("parse")),
            ("running", Some("analyze")),
            ("failed", Some("analyze")),
        ]
    );
    assert!(seen.windows(2).all(|w| w[0].progress <= w[1].progress));
}

#[tokio::test]
async fn unknown_model_is_rejected_before_the_run_opens() {
    let p = pipeline(&Config::default());
    let failure = p
        .run(guide(), &options("gpt-17", &["json"]))
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::UnsupportedModel);
    assert_eq!(failure.stage, Stage::Optimize);
    assert!(p.ledger().status(&failure.document_id).is_none());
    assert_eq!(p.metrics().snapshot().runs_started, 0);
}

#[tokio::test]
async fn best_effort_skips_unknown_formats_with_a_warning() {
    let p = pipeline(&Config::default());
    let result = p
        .run(guide(), &options("gpt-4", &["json", "pdf"]))
        .await
        .unwrap();
    assert_eq!(result.generated_files.len(), 1);
    assert!(result.warnings.iter().any(|w| w.contains("pdf")));
}

#[tokio::test]
async fn best_effort_fails_when_no_format_survives() {
    let p = pipeline(&Config::default());
    let failure = p
        .run(guide(), &options("gpt-4", &["pdf"]))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::UnsupportedFormat);
    assert_eq!(failure.stage, Stage::Generate);

    let status = p.ledger().status(&failure.document_id).unwrap();
    assert_eq!(status.state, RunState::Failed(Stage::Generate));
    assert_eq!(
        p.metrics().snapshot().failures_by_code.get("UNSUPPORTED_FORMAT"),
        Some(&1)
    );
}

#[tokio::test]
async fn all_or_nothing_rejects_unknown_formats_up_front() {
    let mut config = Config::default();
    config.pipeline.atomicity = Atomicity::AllOrNothing;
    let p = pipeline(&config);
    let failure = p
        .run(guide(), &options("gpt-4", &["json", "pdf"]))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::UnsupportedFormat);
    assert!(p.ledger().status(&failure.document_id).is_none());
}

#[tokio::test]
async fn small_window_keeps_the_most_important_fragments() {
    let p = pipeline(&Config::default());
    let mut opts = options("custom", &["json"]);
    opts.context_window = Some(60);
    let result = p.run(guide(), &opts).await.unwrap();

    let ctx = &result.optimized_context;
    assert_eq!(ctx.token_budget, 60);
    assert!(ctx.total_tokens <= 60);
    assert!(ctx.compression_ratio < 1.0);
    assert!(!ctx.content.is_empty());
}

#[tokio::test]
async fn budget_below_every_fragment_overflows() {
    let p = pipeline(&Config::default());
    let mut opts = options("custom", &["json"]);
    opts.context_window = Some(1);
    let failure = p.run(guide(), &opts).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::ContextOverflow);
    assert_eq!(failure.stage, Stage::Optimize);
}

#[tokio::test]
async fn custom_model_without_window_is_unsupported() {
    let p = pipeline(&Config::default());
    let failure = p
        .run(guide(), &options("custom", &["json"]))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::UnsupportedModel);
}

#[tokio::test]
async fn malformed_analysis_fails_the_analyze_stage() {
    let config = Config::default();
    let p = pipeline_with(
        &config,
        Arc::new(ModelAnalyzer::new(Arc::new(Scripted("I cannot help with that")))),
    );
    let failure = p
        .run(guide(), &options("gpt-4", &["json"]))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::AnalysisFailure);
    assert_eq!(failure.stage, Stage::Analyze);
}

#[tokio::test]
async fn empty_text_fails_the_parse_stage() {
    let p = pipeline(&Config::default());
    let failure = p
        .run(
            Source::Text {
                text: "   \n".into(),
                title: None,
            },
            &ProcessOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::ParseFailure);
    assert_eq!(failure.stage, Stage::Parse);
}

#[tokio::test]
async fn extractor_and_fetch_detail_stay_out_of_production_messages() {
    let p = pipeline(&Config::default());

    let failure = p
        .run(
            Source::File {
                filename: "broken.pdf".into(),
                bytes: b"not a pdf at all".to_vec(),
                content_type: Some("application/pdf".into()),
            },
            &options("gpt-4", &["json"]),
        )
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::ParseFailure);
    assert!(failure.public_message(false).contains("PDF"));
    assert_eq!(failure.public_message(true), "The document could not be parsed");

    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let url = format!("http://127.0.0.1:{}/internal", port);
    let failure = p
        .run(Source::Url(url), &options("gpt-4", &["json"]))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::ParseFailure);
    assert!(failure.public_message(false).contains("127.0.0.1"));
    assert_eq!(failure.public_message(true), "The document could not be parsed");

    // caller-caused boundary errors keep their detail
    let failure = p
        .run(
            Source::Text {
                text: "  ".into(),
                title: None,
            },
            &options("gpt-4", &["json"]),
        )
        .await
        .unwrap_err();
    assert_eq!(failure.public_message(true), "document contains no text");
}

#[tokio::test]
async fn slow_stage_times_out() {
    let mut config = Config::default();
    config.timeouts.analyze = 1;
    let p = pipeline_with(&config, Arc::new(Stalled));

    let started = std::time::Instant::now();
    let failure = p
        .run(guide(), &options("gpt-4", &["json"]))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(failure.kind, FailureKind::StageTimeout);
    assert_eq!(failure.stage, Stage::Analyze);
    assert_eq!(
        p.ledger().status(&failure.document_id).unwrap().state,
        RunState::Failed(Stage::Analyze)
    );
}

#[tokio::test]
async fn concurrent_runs_get_distinct_ids() {
    let p = Arc::new(pipeline(&Config::default()));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let p = p.clone();
        handles.push(tokio::spawn(async move {
            p.run(guide(), &options("gpt-4", &["json"])).await.unwrap().id
        }));
    }
    let mut ids = Vec::new();
    for h in handles {
        ids.push(h.await.unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert_eq!(p.metrics().snapshot().runs_completed, 8);
}
