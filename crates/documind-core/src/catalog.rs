//! Target model profiles and effective token budgets.
//!
//! A [`ModelCatalog`] maps a target model identifier to its declared token
//! budget and any model-specific fragment framing. The effective budget for a
//! run is:
//!
//! ```text
//! budget = floor(min(model_budget, contextWindow) × compression_factor)
//! ```
//!
//! The `custom` profile declares no budget of its own, so callers must supply
//! `contextWindow` for it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Text placed around every serialized fragment for a given model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentWrapper {
    pub prefix: String,
    pub suffix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelProfile {
    pub name: String,
    /// Declared context budget in tokens. `None` means the caller supplies it.
    pub token_budget: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrapper: Option<FragmentWrapper>,
}

impl ModelProfile {
    pub fn new(name: impl Into<String>, token_budget: Option<usize>) -> Self {
        Self {
            name: name.into(),
            token_budget,
            wrapper: None,
        }
    }

    pub fn with_wrapper(mut self, prefix: &str, suffix: &str) -> Self {
        self.wrapper = Some(FragmentWrapper {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        });
        self
    }

    /// Apply the model's fragment framing, if any.
    pub fn wrap(&self, text: &str) -> String {
        match &self.wrapper {
            Some(w) => format!("{}\n{}\n{}", w.prefix, text, w.suffix),
            None => text.to_string(),
        }
    }
}

/// How aggressively to shrink the budget below the model's window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    #[default]
    None,
    Light,
    Moderate,
    Aggressive,
}

impl CompressionLevel {
    pub fn factor(self) -> f64 {
        match self {
            CompressionLevel::None => 1.0,
            CompressionLevel::Light => 0.9,
            CompressionLevel::Moderate => 0.75,
            CompressionLevel::Aggressive => 0.5,
        }
    }
}

/// Caller-side budget adjustments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetRequest {
    pub context_window: Option<usize>,
    pub compression: CompressionLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("unsupported target model '{0}'")]
    UnknownModel(String),
    #[error("target model '{0}' requires an explicit contextWindow")]
    MissingContextWindow(String),
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    profiles: BTreeMap<String, ModelProfile>,
}

impl ModelCatalog {
    /// Catalog with the built-in target models.
    pub fn builtin() -> Self {
        let mut catalog = Self {
            profiles: BTreeMap::new(),
        };
        catalog.register(
            ModelProfile::new("gemini-2.5-pro", Some(1_048_576))
                .with_wrapper("[START_CHUNK]", "[END_CHUNK]"),
        );
        catalog.register(ModelProfile::new("gemini-2.5-flash", Some(1_048_576)));
        catalog.register(ModelProfile::new("gpt-4", Some(8_192)));
        catalog.register(ModelProfile::new("claude-3.5", Some(200_000)));
        catalog.register(ModelProfile::new("custom", None));
        catalog
    }

    /// Add or replace a profile.
    pub fn register(&mut self, profile: ModelProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    pub fn get(&self, name: &str) -> Option<&ModelProfile> {
        self.profiles.get(name)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &ModelProfile> {
        self.profiles.values()
    }

    /// Look up `model` and compute its effective budget for `request`.
    pub fn resolve(
        &self,
        model: &str,
        request: &BudgetRequest,
    ) -> Result<(&ModelProfile, usize), CatalogError> {
        let profile = self
            .get(model)
            .ok_or_else(|| CatalogError::UnknownModel(model.to_string()))?;

        let window = match (profile.token_budget, request.context_window) {
            (Some(declared), Some(requested)) => declared.min(requested),
            (Some(declared), None) => declared,
            (None, Some(requested)) => requested,
            (None, None) => return Err(CatalogError::MissingContextWindow(model.to_string())),
        };

        let budget = (window as f64 * request.compression.factor()).floor() as usize;
        Ok((profile, budget))
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
