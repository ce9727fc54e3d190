//! Failure taxonomy.
//!
//! Every stage failure crosses the public boundary as a [`PipelineFailure`]
//! carrying the failing stage, a stable [`FailureKind`] code, the document id
//! and a message. Collaborator errors never escape raw: they are classified
//! here and their detail kept for server-side logs.

use documind_core::format::FormatError;
use documind_core::graph::GraphError;
use documind_core::optimize::OptimizeError;
use documind_core::stage::Stage;
use documind_core::validate::ValidationError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Caller exceeded its admission budget.
    RateLimitExceeded,
    ParseFailure,
    AnalysisFailure,
    /// Structural contract broken inside the pipeline. Always a defect.
    InvariantViolation,
    UnsupportedModel,
    UnsupportedFormat,
    StageTimeout,
    ValidationFailure,
    /// Nothing in the graph fits the effective token budget.
    ContextOverflow,
}

impl FailureKind {
    pub fn code(self) -> &'static str {
        match self {
            FailureKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            FailureKind::ParseFailure => "PARSE_FAILURE",
            FailureKind::AnalysisFailure => "ANALYSIS_FAILURE",
            FailureKind::InvariantViolation => "INVARIANT_VIOLATION",
            FailureKind::UnsupportedModel => "UNSUPPORTED_MODEL",
            FailureKind::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            FailureKind::StageTimeout => "STAGE_TIMEOUT",
            FailureKind::ValidationFailure => "VALIDATION_FAILURE",
            FailureKind::ContextOverflow => "CONTEXT_OVERFLOW",
        }
    }

    /// Whether the failure stems from caller input rather than the service.
    pub fn is_caller_error(self) -> bool {
        matches!(
            self,
            FailureKind::RateLimitExceeded
                | FailureKind::ParseFailure
                | FailureKind::UnsupportedModel
                | FailureKind::UnsupportedFormat
                | FailureKind::ContextOverflow
        )
    }

    /// Message shown to callers when internal detail must not leak.
    pub fn generic_message(self) -> &'static str {
        match self {
            FailureKind::RateLimitExceeded => "Too many requests, please try again later",
            FailureKind::ParseFailure => "The document could not be parsed",
            FailureKind::AnalysisFailure => "Document analysis failed",
            FailureKind::InvariantViolation => "Internal processing error",
            FailureKind::UnsupportedModel => "Unsupported target model",
            FailureKind::UnsupportedFormat => "Unsupported output format",
            FailureKind::StageTimeout => "Processing timed out",
            FailureKind::ValidationFailure => "Generated output failed validation",
            FailureKind::ContextOverflow => "Document does not fit the target model's budget",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{stage} failed for document {document_id} ({}): {message}", .kind.code())]
pub struct PipelineFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub document_id: String,
    pub message: String,
    /// Set when `message` carries collaborator internals (fetch errors,
    /// extractor output) even though the kind is a caller error.
    pub internal_detail: bool,
}

impl PipelineFailure {
    pub fn new(stage: Stage, kind: FailureKind, document_id: &str, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            document_id: document_id.to_string(),
            message: message.into(),
            internal_detail: false,
        }
    }

    /// Keep the message out of production responses regardless of kind.
    pub fn with_internal_detail(mut self) -> Self {
        self.internal_detail = true;
        self
    }

    /// Caller-facing message. Outside production, or for caller errors whose
    /// message is the caller's own input, the full message is returned;
    /// otherwise only the generic text.
    pub fn public_message(&self, production: bool) -> String {
        if production && (self.internal_detail || !self.kind.is_caller_error()) {
            self.kind.generic_message().to_string()
        } else {
            self.message.clone()
        }
    }
}

impl From<&GraphError> for FailureKind {
    fn from(_: &GraphError) -> Self {
        FailureKind::InvariantViolation
    }
}

impl From<&OptimizeError> for FailureKind {
    fn from(err: &OptimizeError) -> Self {
        match err {
            OptimizeError::Model(_) => FailureKind::UnsupportedModel,
            OptimizeError::BudgetTooSmall { .. } => FailureKind::ContextOverflow,
        }
    }
}

impl From<&FormatError> for FailureKind {
    fn from(err: &FormatError) -> Self {
        match err {
            FormatError::UnsupportedFormat(_) | FormatError::NoFormats => {
                FailureKind::UnsupportedFormat
            }
            FormatError::Render { .. } => FailureKind::InvariantViolation,
        }
    }
}

impl From<&ValidationError> for FailureKind {
    fn from(_: &ValidationError) -> Self {
        FailureKind::ValidationFailure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use documind_core::catalog::CatalogError;

    #[test]
    fn codes_are_stable() {
        assert_eq!(FailureKind::UnsupportedModel.code(), "UNSUPPORTED_MODEL");
        assert_eq!(
            serde_json::to_value(FailureKind::StageTimeout).unwrap(),
            "STAGE_TIMEOUT"
        );
    }

    #[test]
    fn core_errors_classify() {
        let err = OptimizeError::Model(CatalogError::UnknownModel("x".into()));
        assert_eq!(FailureKind::from(&err), FailureKind::UnsupportedModel);
        let err = OptimizeError::BudgetTooSmall { budget: 1, needed: 2 };
        assert_eq!(FailureKind::from(&err), FailureKind::ContextOverflow);
        let err = GraphError::DanglingEdge {
            from: "a".into(),
            to: "b".into(),
        };
        assert_eq!(FailureKind::from(&err), FailureKind::InvariantViolation);
    }

    #[test]
    fn production_hides_internal_detail() {
        let failure = PipelineFailure::new(
            Stage::Analyze,
            FailureKind::AnalysisFailure,
            "doc",
            "upstream returned 503: backend exploded at line 42",
        );
        assert_eq!(failure.public_message(true), "Document analysis failed");
        assert!(failure.public_message(false).contains("503"));

        let caller = PipelineFailure::new(
            Stage::Optimize,
            FailureKind::UnsupportedModel,
            "doc",
            "unsupported target model 'x'",
        );
        assert!(caller.public_message(true).contains("'x'"));
    }

    #[test]
    fn production_hides_collaborator_detail_on_parse_failures() {
        let fetch = PipelineFailure::new(
            Stage::Parse,
            FailureKind::ParseFailure,
            "doc",
            "failed to fetch http://10.0.0.9:6379/internal: connection refused",
        )
        .with_internal_detail();
        assert_eq!(fetch.public_message(true), "The document could not be parsed");
        assert!(fetch.public_message(false).contains("10.0.0.9"));

        let boundary = PipelineFailure::new(
            Stage::Parse,
            FailureKind::ParseFailure,
            "doc",
            "document contains no text",
        );
        assert_eq!(boundary.public_message(true), "document contains no text");
    }

    #[test]
    fn display_names_stage_and_code() {
        let failure = PipelineFailure::new(Stage::Parse, FailureKind::ParseFailure, "d1", "bad pdf");
        assert_eq!(
            failure.to_string(),
            "parse failed for document d1 (PARSE_FAILURE): bad pdf"
        );
    }
}
