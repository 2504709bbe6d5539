//! Provider selection logic.

use std::sync::Arc;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};

/// Router for selecting providers.
#[derive(Debug, Clone)]
pub struct Router {
    providers: Vec<Arc<ProviderConfig>>,
}

impl Router {
    /// Create a new router over the configured providers.
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self {
            providers: providers.into_iter().map(Arc::new).collect(),
        }
    }

    /// Select the provider serving `model`.
    ///
    /// A model matches a provider listing it, or the provider's own name.
    /// The first match in configuration order wins.
    pub fn select(&self, model: &str) -> Result<Arc<ProviderConfig>> {
        let selected = self
            .providers
            .iter()
            .find(|p| p.serves(model))
            .cloned()
            .ok_or_else(|| Error::UnknownModel {
                model: model.to_string(),
            })?;
        tracing::debug!(model = %model, provider = %selected.name, "Selected provider");
        Ok(selected)
    }

    /// Get all configured providers.
    pub fn providers(&self) -> &[Arc<ProviderConfig>] {
        &self.providers
    }

    /// Every exposed model name with the provider serving it, in
    /// configuration order. Providers without a model list expose their
    /// own name.
    pub fn models(&self) -> Vec<(String, Arc<ProviderConfig>)> {
        let mut seen = std::collections::HashSet::new();
        let mut models = Vec::new();
        for provider in &self.providers {
            let names: Vec<String> = if provider.models.is_empty() {
                vec![provider.name.clone()]
            } else {
                provider.models.clone()
            };
            for name in names {
                if seen.insert(name.clone()) {
                    models.push((name, provider.clone()));
                }
            }
        }
        models
    }
}
