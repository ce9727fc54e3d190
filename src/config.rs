use anyhow::{bail, Context, Result};
use documind_core::catalog::{ModelCatalog, ModelProfile};
use documind_core::format::Atomicity;
use documind_core::stage::Stage;
use documind_core::validate::ValidationLimits;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Shortest accepted inference API key.
pub const MIN_API_KEY_LEN: usize = 10;
/// Largest accepted `server.max_upload_mb`.
pub const MAX_UPLOAD_MB: usize = 4096;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub models: BTreeMap<String, ModelProfileConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
            environment: Environment::Development,
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
    ]
}
fn default_max_upload_mb() -> usize {
    50
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    /// Pipeline-initiating requests allowed per caller per window.
    #[serde(default = "default_points")]
    pub points: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Requests of any kind allowed per caller per window.
    #[serde(default = "default_general_points")]
    pub general_points: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            points: default_points(),
            window_secs: default_window_secs(),
            general_points: default_general_points(),
        }
    }
}

fn default_points() -> u32 {
    10
}
fn default_window_secs() -> u64 {
    60
}
fn default_general_points() -> u32 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_formats")]
    pub default_formats: Vec<String>,
    #[serde(default)]
    pub atomicity: Atomicity,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: usize,
    #[serde(default = "default_ledger_ttl_secs")]
    pub ledger_ttl_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            default_formats: default_formats(),
            atomicity: Atomicity::default(),
            max_file_bytes: default_max_file_bytes(),
            max_total_bytes: default_max_total_bytes(),
            ledger_ttl_secs: default_ledger_ttl_secs(),
        }
    }
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_formats() -> Vec<String> {
    vec!["agents.md".to_string()]
}
fn default_max_file_bytes() -> usize {
    ValidationLimits::default().max_file_bytes
}
fn default_max_total_bytes() -> usize {
    ValidationLimits::default().max_total_bytes
}
fn default_ledger_ttl_secs() -> u64 {
    3600
}

impl PipelineConfig {
    pub fn validation_limits(&self) -> ValidationLimits {
        ValidationLimits {
            max_file_bytes: self.max_file_bytes,
            max_total_bytes: self.max_total_bytes,
        }
    }
}

/// Per-stage time bounds, in seconds.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    #[serde(default = "default_parse_secs")]
    pub parse: u64,
    #[serde(default = "default_analyze_secs")]
    pub analyze: u64,
    #[serde(default = "default_fast_stage_secs")]
    pub graph: u64,
    #[serde(default = "default_fast_stage_secs")]
    pub optimize: u64,
    #[serde(default = "default_generate_secs")]
    pub generate: u64,
    #[serde(default = "default_fast_stage_secs")]
    pub validate: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            parse: default_parse_secs(),
            analyze: default_analyze_secs(),
            graph: default_fast_stage_secs(),
            optimize: default_fast_stage_secs(),
            generate: default_generate_secs(),
            validate: default_fast_stage_secs(),
        }
    }
}

fn default_parse_secs() -> u64 {
    60
}
fn default_analyze_secs() -> u64 {
    180
}
fn default_fast_stage_secs() -> u64 {
    10
}
fn default_generate_secs() -> u64 {
    30
}

impl TimeoutConfig {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::Parse => self.parse,
            Stage::Analyze => self.analyze,
            Stage::BuildGraph => self.graph,
            Stage::Optimize => self.optimize,
            Stage::Generate => self.generate,
            Stage::Validate => self.validate,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    /// Usually supplied through `GEMINI_API_KEY` rather than the file.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_inference_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_inference_model(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_inference_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            max_history_turns: default_max_history_turns(),
        }
    }
}

fn default_session_ttl_secs() -> u64 {
    3600
}
fn default_max_history_turns() -> usize {
    40
}

#[derive(Debug, Deserialize, Clone)]
pub struct McpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mcp_port")]
    pub port: u16,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_mcp_port(),
        }
    }
}

fn default_mcp_port() -> u16 {
    3001
}

/// Extra target model declared in `[models.<name>]`.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelProfileConfig {
    pub token_budget: Option<usize>,
    #[serde(default)]
    pub fragment_prefix: Option<String>,
    #[serde(default)]
    pub fragment_suffix: Option<String>,
}

impl Config {
    /// Built-in target models plus any declared under `[models]`.
    pub fn model_catalog(&self) -> ModelCatalog {
        let mut catalog = ModelCatalog::builtin();
        for (name, profile) in &self.models {
            let mut entry = ModelProfile::new(name.clone(), profile.token_budget);
            if let (Some(prefix), Some(suffix)) = (&profile.fragment_prefix, &profile.fragment_suffix) {
                entry = entry.with_wrapper(prefix, suffix);
            }
            catalog.register(entry);
        }
        catalog
    }

    /// The inference API key, or an error explaining how to provide one.
    pub fn require_api_key(&self) -> Result<&str> {
        match self.inference.api_key.as_deref() {
            Some(key) if key.len() >= MIN_API_KEY_LEN => Ok(key),
            Some(_) => bail!(
                "GEMINI_API_KEY must be at least {} characters",
                MIN_API_KEY_LEN
            ),
            None => bail!("GEMINI_API_KEY is required (set it in the environment or [inference].api_key)"),
        }
    }
}

/// Read `path` if it exists (a missing file means all defaults), apply
/// environment overrides, then validate.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    apply_env(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{} has an invalid value: '{}'", key, value))
}

/// Overlay environment variables onto `config`. `lookup` is injectable so
/// tests don't have to mutate the process environment.
pub fn apply_env(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(key) = lookup("GEMINI_API_KEY").filter(|k| !k.is_empty()) {
        config.inference.api_key = Some(key);
    }
    if let Some(v) = lookup("PORT") {
        config.server.port = parse_var("PORT", &v)?;
    }
    if let Some(v) = lookup("CORS_ORIGINS") {
        config.server.cors_origins = v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(v) = lookup("RATE_LIMIT_POINTS") {
        config.rate_limit.points = parse_var("RATE_LIMIT_POINTS", &v)?;
    }
    if let Some(v) = lookup("RATE_LIMIT_WINDOW_SECS") {
        config.rate_limit.window_secs = parse_var("RATE_LIMIT_WINDOW_SECS", &v)?;
    }
    if let Some(v) = lookup("MAX_FILE_SIZE") {
        config.server.max_upload_mb = parse_var("MAX_FILE_SIZE", &v)?;
    }
    if let Some(v) = lookup("ENABLE_MCP") {
        config.mcp.enabled = v.trim().eq_ignore_ascii_case("true");
    }
    if let Some(v) = lookup("MCP_SERVER_PORT") {
        config.mcp.port = parse_var("MCP_SERVER_PORT", &v)?;
    }
    if let Some(v) = lookup("DOCUMIND_ENV") {
        config.server.environment = match v.trim() {
            "production" => Environment::Production,
            "development" => Environment::Development,
            other => bail!(
                "DOCUMIND_ENV must be production or development, got '{}'",
                other
            ),
        };
    }
    Ok(())
}

pub fn validate(config: &Config) -> Result<()> {
    if config.rate_limit.points == 0 {
        bail!("rate_limit.points must be > 0");
    }
    if config.rate_limit.general_points == 0 {
        bail!("rate_limit.general_points must be > 0");
    }
    if config.rate_limit.window_secs == 0 {
        bail!("rate_limit.window_secs must be > 0");
    }
    if config.server.max_upload_mb == 0 || config.server.max_upload_mb > MAX_UPLOAD_MB {
        bail!("server.max_upload_mb must be between 1 and {}", MAX_UPLOAD_MB);
    }
    if config.pipeline.default_formats.is_empty() {
        bail!("pipeline.default_formats must not be empty");
    }
    if config.pipeline.max_file_bytes == 0 || config.pipeline.max_total_bytes == 0 {
        bail!("pipeline.max_file_bytes and pipeline.max_total_bytes must be > 0");
    }
    if config.pipeline.max_file_bytes > config.pipeline.max_total_bytes {
        bail!("pipeline.max_file_bytes must not exceed pipeline.max_total_bytes");
    }
    if config.chat.max_history_turns == 0 {
        bail!("chat.max_history_turns must be > 0");
    }
    for stage in Stage::ALL {
        if config.timeouts.for_stage(stage).is_zero() {
            bail!("timeouts.{} must be > 0", stage.name());
        }
    }
    if config.mcp.enabled && config.mcp.port == config.server.port {
        bail!("mcp.port must differ from server.port");
    }

    let catalog = config.model_catalog();
    if catalog.get(&config.pipeline.default_model).is_none() {
        bail!(
            "pipeline.default_model '{}' is not a known target model",
            config.pipeline.default_model
        );
    }
    for (name, profile) in &config.models {
        if profile.token_budget == Some(0) {
            bail!("models.{}.token_budget must be > 0", name);
        }
        if profile.fragment_prefix.is_some() != profile.fragment_suffix.is_some() {
            bail!(
                "models.{} needs both fragment_prefix and fragment_suffix, or neither",
                name
            );
        }
    }

    Ok(())
}
