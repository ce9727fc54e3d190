//! The assembled service shared by every transport.
//!
//! The HTTP API, the WebSocket channel and the MCP agent server are thin
//! adapters over one [`DocuMind`] value: the pipeline, the chat manager and
//! the two admission controllers. Completed runs seed the chat session for
//! their document with the optimized context.

use std::sync::Arc;
use std::time::{Duration, Instant};

use documind_core::models::ProcessingResult;

use crate::admission::AdmissionController;
use crate::analyzer::{ModelAnalyzer, SemanticAnalyzer};
use crate::chat::ChatManager;
use crate::config::Config;
use crate::error::PipelineFailure;
use crate::inference::{GeminiClient, InferenceClient};
use crate::parser::{DefaultParser, DocumentParser, Source};
use crate::pipeline::{Pipeline, ProcessOptions};

/// How often expired ledger entries, admission windows and chat sessions
/// are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct DocuMind {
    pub config: Arc<Config>,
    pub pipeline: Arc<Pipeline>,
    pub chat: Arc<ChatManager>,
    /// Pipeline-initiating requests.
    pub admission: Arc<AdmissionController>,
    /// Every request.
    pub general_limiter: Arc<AdmissionController>,
    model: String,
    started: Instant,
}

impl DocuMind {
    /// Production wiring: default parser plus Gemini for analysis and chat.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let api_key = config.require_api_key()?;
        let client: Arc<dyn InferenceClient> = Arc::new(GeminiClient::new(&config.inference, api_key)?);
        let parser = Arc::new(DefaultParser::new(
            config.server.max_upload_bytes(),
            config.timeouts.for_stage(documind_core::stage::Stage::Parse),
        )?);
        let analyzer = Arc::new(ModelAnalyzer::new(client.clone()));
        Ok(Self::with_collaborators(config, parser, analyzer, client))
    }

    /// Wire the service around caller-supplied collaborators.
    pub fn with_collaborators(
        config: &Config,
        parser: Arc<dyn DocumentParser>,
        analyzer: Arc<dyn SemanticAnalyzer>,
        chat_model: Arc<dyn InferenceClient>,
    ) -> Self {
        let window = Duration::from_secs(config.rate_limit.window_secs);
        Self {
            config: Arc::new(config.clone()),
            pipeline: Arc::new(Pipeline::new(config, parser, analyzer)),
            model: chat_model.model().to_string(),
            chat: Arc::new(ChatManager::new(
                chat_model,
                Duration::from_secs(config.chat.session_ttl_secs),
                config.chat.max_history_turns,
            )),
            admission: Arc::new(AdmissionController::new(config.rate_limit.points, window)),
            general_limiter: Arc::new(AdmissionController::new(
                config.rate_limit.general_points,
                window,
            )),
            started: Instant::now(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.config.server.is_production()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Inference model used for analysis and chat.
    pub fn inference_model(&self) -> &str {
        &self.model
    }

    /// Run the pipeline and, on success, make the result chat-ready.
    pub async fn process(
        &self,
        source: Source,
        options: &ProcessOptions,
    ) -> Result<ProcessingResult, PipelineFailure> {
        let result = self.pipeline.run(source, options).await?;
        self.chat
            .attach_context(&result.id, result.optimized_context.render_text())
            .await;
        Ok(result)
    }

    /// Remove expired state once.
    pub fn sweep(&self, now: Instant) {
        let runs = self.pipeline.ledger().sweep(now);
        let sessions = self.chat.sweep(now);
        let callers = self.admission.sweep(now) + self.general_limiter.sweep(now);
        if runs + sessions + callers > 0 {
            tracing::debug!(runs, sessions, callers, "swept expired state");
        }
    }

    /// Periodic background sweep for the lifetime of the process.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                service.sweep(Instant::now());
            }
        })
    }
}
