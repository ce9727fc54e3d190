//! # DocuMind
//!
//! Turns documentation (PDF, Word, HTML, Markdown, plain text or a URL) into
//! token-budgeted context files for AI coding agents.
//!
//! Every document runs through a fixed six-stage pipeline. The pure stages
//! live in `documind-core`; this crate supplies the I/O stages, the
//! orchestration and the transports.
//!
//! ```text
//!  ┌────────┐  ┌─────────┐  ┌───────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐
//!  │ parse  │─▶│ analyze │─▶│ graph │─▶│ optimize │─▶│ generate │─▶│ validate │
//!  └────────┘  └─────────┘  └───────┘  └──────────┘  └──────────┘  └──────────┘
//!       │            │
//!   extract      inference
//!
//!        ┌──────────── DocuMind service ────────────┐
//!        ▼                 ▼                         ▼
//!   HTTP + WS API     MCP agent server              CLI
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration plus environment overrides |
//! | [`error`] | Stage-tagged pipeline failures and their codes |
//! | [`extract`] | Text extraction per MIME type |
//! | [`parser`] | The parse stage: files, URLs and inline text |
//! | [`inference`] | Inference client abstraction and the Gemini client |
//! | [`analyzer`] | The analyze stage |
//! | [`pipeline`] | Stage orchestration, timeouts and preflight |
//! | [`ledger`] | Per-run status and progress broadcast |
//! | [`metrics`] | Aggregate run counters |
//! | [`admission`] | Fixed-window request admission per caller |
//! | [`chat`] | Per-document chat sessions |
//! | [`service`] | The assembled service shared by every transport |
//! | [`server`] | HTTP API |
//! | [`ws`] | WebSocket progress and chat channel |
//! | [`mcp`] | MCP agent server |

pub mod admission;
pub mod analyzer;
pub mod chat;
pub mod config;
pub mod error;
pub mod extract;
pub mod inference;
pub mod ledger;
pub mod mcp;
pub mod metrics;
pub mod parser;
pub mod pipeline;
pub mod server;
pub mod service;
pub mod ws;
