//! # DocuMind CLI (`documind`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `documind serve` | Start the HTTP/WebSocket API (and the MCP agent server if enabled) |
//! | `documind process <file-or-url>` | Run the pipeline once and write the context files |
//! | `documind models` | List target models and their token budgets |
//!
//! ## Examples
//!
//! ```bash
//! documind serve --config ./config/documind.toml
//! documind process ./docs/guide.pdf --model gpt-4 --format agents.md --format json --out ./context
//! documind process https://example.com/docs --compression moderate
//! documind models
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use documind::config::{self, Config};
use documind::extract;
use documind::parser::Source;
use documind::pipeline::ProcessOptions;
use documind::server;
use documind::service::DocuMind;
use documind_core::catalog::CompressionLevel;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// DocuMind turns documentation into token-budgeted context files for AI
/// coding agents.
///
/// All commands accept `--config`; a missing file falls back to defaults
/// plus environment overrides. See `config/documind.example.toml`.
#[derive(Parser)]
#[command(
    name = "documind",
    about = "DocuMind: documentation in, AI-agent context files out",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "./config/documind.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server.
    Serve,

    /// Process one document and write the generated files.
    Process {
        /// Local file path, or an http(s) URL.
        input: String,

        /// Target model (see `documind models`).
        #[arg(long)]
        model: Option<String>,

        /// Output format; repeat for several. Defaults to the configured set.
        #[arg(long = "format")]
        formats: Vec<String>,

        /// Cap on the model's context window, in tokens.
        #[arg(long)]
        context_window: Option<usize>,

        #[arg(long, value_enum, default_value_t = Compression::None)]
        compression: Compression,

        /// Extra guidance passed to the analyzer.
        #[arg(long)]
        instructions: Option<String>,

        /// Directory for the generated files.
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },

    /// List target models.
    Models,
}

#[derive(Clone, Copy, ValueEnum)]
enum Compression {
    None,
    Light,
    Moderate,
    Aggressive,
}

impl From<Compression> for CompressionLevel {
    fn from(c: Compression) -> Self {
        match c {
            Compression::None => CompressionLevel::None,
            Compression::Light => CompressionLevel::Light,
            Compression::Moderate => CompressionLevel::Moderate,
            Compression::Aggressive => CompressionLevel::Aggressive,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "documind=info,tower_http=info".into()),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Process {
            input,
            model,
            formats,
            context_window,
            compression,
            instructions,
            out,
        } => {
            let options = ProcessOptions {
                target_model: model,
                output_formats: formats,
                context_window,
                compression_level: compression.into(),
                custom_instructions: instructions,
            };
            run_process(&cfg, &input, &options, &out).await?;
        }
        Commands::Models => {
            list_models(&cfg);
        }
    }

    Ok(())
}

async fn run_process(
    cfg: &Config,
    input: &str,
    options: &ProcessOptions,
    out: &Path,
) -> anyhow::Result<()> {
    let service = Arc::new(DocuMind::from_config(cfg)?);
    let source = source_for(input, cfg.server.max_upload_bytes())?;

    let result = match service.process(source, options).await {
        Ok(result) => result,
        Err(failure) => bail!(
            "{} failed ({}): {}",
            failure.stage,
            failure.kind.code(),
            failure.message
        ),
    };

    std::fs::create_dir_all(out)
        .with_context(|| format!("Failed to create output directory: {}", out.display()))?;
    for file in &result.generated_files {
        let path = out.join(&file.filename);
        std::fs::write(&path, &file.content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!(
            "{:<28} {:>8} bytes {:>7} tokens  {}",
            file.format.as_str(),
            file.size_bytes,
            file.token_count,
            path.display()
        );
    }
    for warning in &result.warnings {
        eprintln!("warning: {}", warning);
    }
    println!(
        "\n{} → {} ({} tokens, ratio {:.2}, {} ms)",
        result.document.title(),
        result.optimized_context.target_model,
        result.metrics.token_count,
        result.metrics.compression_ratio,
        result.metrics.processing_time_ms
    );
    Ok(())
}

fn source_for(input: &str, max_bytes: usize) -> anyhow::Result<Source> {
    if input.starts_with("http://") || input.starts_with("https://") {
        return Ok(Source::Url(input.to_string()));
    }

    let path = Path::new(input);
    let size = std::fs::metadata(path)
        .with_context(|| format!("Failed to read {}", path.display()))?
        .len();
    if size as usize > max_bytes {
        bail!("{} is {} bytes; the limit is {}", path.display(), size, max_bytes);
    }
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| input.to_string());
    let mime = extract::resolve_mime(&filename, None);
    if !extract::is_allowed_mime(&mime) {
        bail!("unsupported file type '{}' for {}", mime, filename);
    }
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Source::File {
        filename,
        bytes,
        content_type: Some(mime),
    })
}

fn list_models(cfg: &Config) {
    let catalog = cfg.model_catalog();
    println!("{:<24} {:>12}", "MODEL", "TOKEN BUDGET");
    for profile in catalog.profiles() {
        let budget = profile
            .token_budget
            .map(|b| b.to_string())
            .unwrap_or_else(|| "contextWindow".to_string());
        let marker = if profile.name == cfg.pipeline.default_model {
            " (default)"
        } else {
            ""
        };
        println!("{:<24} {:>12}{}", profile.name, budget, marker);
    }
}
