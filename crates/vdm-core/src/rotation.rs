use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use crate::config::ProviderConfig;
use crate::registry::ProviderRegistry;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RotationError {
    #[error("All provider API keys exhausted")]
    Exhausted,
    #[error("provider '{0}' has no API keys to rotate")]
    NoKeys(String),
}

/// Round-robin API key selection, one mutex-guarded cursor per provider.
/// The cursor is process-wide: every `next` call advances it, including the
/// call that hands out a replacement key during retry.
pub struct KeyRotator {
    cursors: HashMap<String, Mutex<usize>>,
}

impl KeyRotator {
    pub fn new(registry: &ProviderRegistry) -> Self {
        let cursors = registry
            .list()
            .into_iter()
            .filter(|provider| !provider.api_keys.is_empty())
            .map(|provider| (provider.name.clone(), Mutex::new(0)))
            .collect();
        Self { cursors }
    }

    /// Next key for `provider`, skipping anything in `exclude`. Fails with
    /// `Exhausted` once the exclusion set covers every configured key.
    pub fn next(
        &self,
        provider: &ProviderConfig,
        exclude: &HashSet<String>,
    ) -> Result<String, RotationError> {
        let keys = &provider.api_keys;
        if keys.is_empty() {
            return Err(RotationError::NoKeys(provider.name.clone()));
        }
        if exclude.len() >= keys.len() {
            return Err(RotationError::Exhausted);
        }

        let cursor = self
            .cursors
            .get(&provider.name)
            .ok_or_else(|| RotationError::NoKeys(provider.name.clone()))?;
        let mut cursor = cursor.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            let key = keys[*cursor % keys.len()].clone();
            *cursor = (*cursor + 1) % keys.len();
            if !exclude.contains(&key) {
                return Ok(key);
            }
        }
    }

    /// Test isolation only; production cursors are never reset.
    pub fn reset(&self, provider_name: &str) {
        if let Some(cursor) = self.cursors.get(provider_name) {
            *cursor.lock().unwrap_or_else(PoisonError::into_inner) = 0;
        }
    }
}
