//! MCP agent server.
//!
//! An optional second listener that exposes the pipeline and chat to MCP
//! clients (Cursor, Claude Desktop, ...) over the Streamable HTTP transport
//! at `/mcp`. It is a thin adapter: every tool call goes through the same
//! [`DocuMind`] service as the HTTP API.
//!
//! | Tool | Description |
//! |------|-------------|
//! | `process_document` | Run the pipeline on inline text, a URL or a base64 file |
//! | `chat` | Chat about a processed document |
//! | `get_status` | Ledger status of a run |
//! | `list_models` | Target models and their token budgets |
//!
//! The server only exists when `[mcp].enabled` is set; [`AgentServer::from_config`]
//! returns `None` otherwise.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use base64::Engine;
use rmcp::model::*;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpService,
};
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::parser::Source;
use crate::pipeline::ProcessOptions;
use crate::server::file_source;
use crate::service::DocuMind;

/// Admission key shared by all agent callers.
const AGENT_CALLER: &str = "mcp-agent";

#[derive(Debug, Clone)]
pub struct AgentServer {
    host: String,
    port: u16,
}

impl AgentServer {
    pub fn from_config(config: &Config) -> Option<Self> {
        config.mcp.enabled.then(|| Self {
            host: config.server.host.clone(),
            port: config.mcp.port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind the listener and serve in the background. Returns the bound
    /// address once the socket is open.
    pub async fn spawn(self, service: Arc<DocuMind>) -> anyhow::Result<SocketAddr> {
        let bridge = AgentBridge::new(service);
        let mcp = StreamableHttpService::new(
            move || Ok(bridge.clone()),
            LocalSessionManager::default().into(),
            Default::default(),
        );
        let app = Router::new().nest_service("/mcp", mcp);

        let listener = tokio::net::TcpListener::bind((self.host.as_str(), self.port)).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "agent server stopped");
            }
        });
        Ok(addr)
    }
}

/// Bridges MCP tool calls to the service. Each MCP session receives a clone.
#[derive(Clone)]
pub struct AgentBridge {
    service: Arc<DocuMind>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessArgs {
    text: Option<String>,
    title: Option<String>,
    url: Option<String>,
    filename: Option<String>,
    content_base64: Option<String>,
    #[serde(flatten)]
    options: ProcessOptions,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatArgs {
    message: String,
    document_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusArgs {
    document_id: String,
}

impl AgentBridge {
    pub fn new(service: Arc<DocuMind>) -> Self {
        Self { service }
    }

    fn tools() -> Vec<Tool> {
        vec![
            tool(
                "process_document",
                "Turn a document into context files for AI coding agents. Provide exactly one of text, url or contentBase64 (with filename).",
                json!({
                    "type": "object",
                    "properties": {
                        "text": { "type": "string", "description": "Inline Markdown or plain text" },
                        "title": { "type": "string" },
                        "url": { "type": "string", "description": "http(s) URL to fetch" },
                        "filename": { "type": "string" },
                        "contentBase64": { "type": "string", "description": "Base64 file content" },
                        "targetModel": { "type": "string" },
                        "outputFormats": { "type": "array", "items": { "type": "string" } },
                        "contextWindow": { "type": "integer", "minimum": 1 },
                        "compressionLevel": { "type": "string", "enum": ["none", "light", "moderate", "aggressive"] },
                        "customInstructions": { "type": "string" }
                    }
                }),
                false,
            ),
            tool(
                "chat",
                "Ask a question about a processed document, or start a new conversation.",
                json!({
                    "type": "object",
                    "properties": {
                        "message": { "type": "string" },
                        "documentId": { "type": "string" }
                    },
                    "required": ["message"]
                }),
                false,
            ),
            tool(
                "get_status",
                "Status and progress of a pipeline run.",
                json!({
                    "type": "object",
                    "properties": { "documentId": { "type": "string" } },
                    "required": ["documentId"]
                }),
                true,
            ),
            tool(
                "list_models",
                "Target models and their token budgets.",
                json!({ "type": "object", "properties": {} }),
                true,
            ),
        ]
    }

    async fn dispatch(&self, name: &str, args: Value) -> Result<Value, String> {
        match name {
            "process_document" => self.process(parse_args(args)?).await,
            "chat" => {
                let args: ChatArgs = parse_args(args)?;
                let reply = self
                    .service
                    .chat
                    .send_message(args.document_id.as_deref(), &args.message)
                    .await
                    .map_err(|e| {
                        crate::server::AppError::from_chat(&e, self.service.is_production())
                            .message()
                            .to_string()
                    })?;
                serde_json::to_value(reply).map_err(|e| e.to_string())
            }
            "get_status" => {
                let args: StatusArgs = parse_args(args)?;
                let status = self
                    .service
                    .pipeline
                    .ledger()
                    .status(&args.document_id)
                    .ok_or_else(|| format!("no run with id {}", args.document_id))?;
                let production = self.service.is_production();
                Ok(json!({
                    "documentId": status.document_id,
                    "status": status.state.status(),
                    "phase": status.state.phase(),
                    "progress": status.state.progress(),
                    "error": status.failure.map(|f| json!({
                        "code": f.kind.code(),
                        "message": f.public_message(production),
                    })),
                }))
            }
            "list_models" => {
                let models: Vec<Value> = self
                    .service
                    .pipeline
                    .catalog()
                    .profiles()
                    .map(|p| json!({ "name": p.name, "tokenBudget": p.token_budget }))
                    .collect();
                Ok(json!({
                    "defaultModel": self.service.pipeline.default_model(),
                    "models": models,
                }))
            }
            other => Err(format!("no tool registered with name: {}", other)),
        }
    }

    async fn process(&self, args: ProcessArgs) -> Result<Value, String> {
        let source = match (args.text, args.url, args.content_base64) {
            (Some(text), None, None) => Source::Text {
                text,
                title: args.title,
            },
            (None, Some(url), None) => Source::Url(url),
            (None, None, Some(encoded)) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| format!("contentBase64: {}", e))?;
                let filename = args.filename.unwrap_or_else(|| "upload.txt".to_string());
                file_source(filename, bytes, None).map_err(|e| e.message().to_string())?
            }
            _ => return Err("provide exactly one of text, url or contentBase64".to_string()),
        };

        self.service
            .admission
            .check(AGENT_CALLER)
            .map_err(|e| e.to_string())?;

        let result = self
            .service
            .process(source, &args.options)
            .await
            .map_err(|f| {
                format!(
                    "{} ({}): {}",
                    f.stage,
                    f.kind.code(),
                    f.public_message(self.service.is_production())
                )
            })?;

        let files: Vec<Value> = result
            .generated_files
            .iter()
            .map(|f| {
                json!({
                    "format": f.format,
                    "filename": f.filename,
                    "sizeBytes": f.size_bytes,
                    "tokenCount": f.token_count,
                    "content": f.content,
                })
            })
            .collect();
        Ok(json!({
            "documentId": result.id,
            "title": result.document.title(),
            "targetModel": result.optimized_context.target_model,
            "tokenCount": result.metrics.token_count,
            "compressionRatio": result.metrics.compression_ratio,
            "processingTimeMs": result.metrics.processing_time_ms,
            "warnings": result.warnings,
            "files": files,
        }))
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("invalid arguments: {}", e))
}

fn tool(name: &'static str, description: &'static str, schema: Value, read_only: bool) -> Tool {
    let input_schema = match schema {
        Value::Object(map) => Arc::new(map),
        _ => Arc::new(serde_json::Map::new()),
    };
    Tool {
        name: Cow::Borrowed(name),
        title: None,
        description: Some(Cow::Borrowed(description)),
        input_schema,
        output_schema: None,
        annotations: Some(ToolAnnotations::new().read_only(read_only)),
        execution: None,
        icons: None,
        meta: None,
    }
}

impl ServerHandler for AgentBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "documind".to_string(),
                title: Some("DocuMind".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "DocuMind turns documentation into context files for AI coding agents. \
                 Call process_document, then chat with the returned documentId to refine."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult::with_all_items(Self::tools())))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        Self::tools().into_iter().find(|t| t.name == name)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if self.get_tool(&request.name).is_none() {
            return Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            ));
        }

        let args = request
            .arguments
            .map(Value::Object)
            .unwrap_or(Value::Object(serde_json::Map::new()));

        match self.dispatch(&request.name, args).await {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(message) => Ok(CallToolResult::error(vec![Content::text(message)])),
        }
    }
}
