//! Post-generation sanity checks.
//!
//! Runs after every format has rendered and before a result is assembled. A
//! failure here aborts the run just like an upstream stage failure.

use thiserror::Error;

use crate::models::{GeneratedFile, OptimizedContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    /// Largest allowed single generated file, in bytes.
    pub max_file_bytes: usize,
    /// Largest allowed sum over all generated files, in bytes.
    pub max_total_bytes: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 10 * 1024 * 1024,
            max_total_bytes: 25 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no output files were generated")]
    NoFiles,
    #[error("{0} has empty content")]
    EmptyFile(String),
    #[error("{filename} is {size} bytes, over the {limit}-byte limit")]
    FileTooLarge {
        filename: String,
        size: usize,
        limit: usize,
    },
    #[error("generated files total {size} bytes, over the {limit}-byte limit")]
    TotalTooLarge { size: usize, limit: usize },
    #[error("context uses {total} tokens, over the {budget}-token budget")]
    OverBudget { total: usize, budget: usize },
}

pub fn validate_output(
    context: &OptimizedContext,
    files: &[GeneratedFile],
    limits: &ValidationLimits,
) -> Result<(), ValidationError> {
    if context.total_tokens > context.token_budget {
        return Err(ValidationError::OverBudget {
            total: context.total_tokens,
            budget: context.token_budget,
        });
    }

    if files.is_empty() {
        return Err(ValidationError::NoFiles);
    }

    let mut total = 0usize;
    for file in files {
        if file.content.trim().is_empty() {
            return Err(ValidationError::EmptyFile(file.filename.clone()));
        }
        if file.size_bytes > limits.max_file_bytes {
            return Err(ValidationError::FileTooLarge {
                filename: file.filename.clone(),
                size: file.size_bytes,
                limit: limits.max_file_bytes,
            });
        }
        total += file.size_bytes;
    }

    if total > limits.max_total_bytes {
        return Err(ValidationError::TotalTooLarge {
            size: total,
            limit: limits.max_total_bytes,
        });
    }

    Ok(())
}
