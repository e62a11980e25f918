use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::TranscriptionError;
use crate::config::ModelVariantConfig;
use crate::runtime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded { variant: String },
    Failed { reason: String },
}

#[derive(Debug)]
struct Inner {
    state: ModelState,
    /// Variants before this index are never selected again. Raised by [`ModelManager::degrade`].
    floor: usize,
}

/// Chooses which model variant the speech engine runs with.
///
/// Variants are ordered from most to least capable. Selection skips variants
/// whose memory requirement exceeds what the host currently has available,
/// and a resource failure at run time permanently steps down one variant.
#[derive(Debug)]
pub struct ModelManager {
    variants: Vec<ModelVariantConfig>,
    memory_reader: fn() -> Option<u64>,
    inner: Mutex<Inner>,
}

impl ModelManager {
    pub fn new(variants: Vec<ModelVariantConfig>) -> Self {
        Self::with_memory_reader(variants, runtime::available_memory_mb)
    }

    pub fn with_memory_reader(
        variants: Vec<ModelVariantConfig>,
        memory_reader: fn() -> Option<u64>,
    ) -> Self {
        Self {
            variants,
            memory_reader,
            inner: Mutex::new(Inner {
                state: ModelState::Unloaded,
                floor: 0,
            }),
        }
    }

    pub async fn state(&self) -> ModelState {
        self.inner.lock().await.state.clone()
    }

    /// Returns the active variant, selecting one first if none is loaded.
    pub async fn acquire(&self) -> Result<ModelVariantConfig, TranscriptionError> {
        let mut inner = self.inner.lock().await;
        if let ModelState::Loaded { variant } = &inner.state {
            if let Some(found) = self.variants.iter().find(|v| &v.name == variant) {
                return Ok(found.clone());
            }
        }

        inner.state = ModelState::Loading;
        let available_mb = (self.memory_reader)();
        let mut missing = Vec::new();

        for candidate in self.variants.iter().skip(inner.floor) {
            if let Some(available) = available_mb {
                if candidate.min_available_memory_mb > available {
                    info!(
                        model = %candidate.name,
                        required_mb = candidate.min_available_memory_mb,
                        available_mb = available,
                        "Skipping model variant, not enough memory"
                    );
                    continue;
                }
            }
            if !tokio::fs::try_exists(&candidate.path).await.unwrap_or(false) {
                missing.push(candidate.path.display().to_string());
                continue;
            }

            info!(model = %candidate.name, path = %candidate.path.display(), "Speech model selected");
            inner.state = ModelState::Loaded {
                variant: candidate.name.clone(),
            };
            return Ok(candidate.clone());
        }

        let reason = if missing.is_empty() {
            "no model variant fits the available memory".to_string()
        } else {
            format!("no usable model file (missing: {})", missing.join(", "))
        };
        warn!(%reason, "Speech model unavailable");
        inner.state = ModelState::Failed {
            reason: reason.clone(),
        };
        Err(TranscriptionError::EngineUnavailable(reason))
    }

    /// Steps below `failed_variant` after it exhausted resources.
    ///
    /// Returns the next variant to try, or `None` when there is nothing smaller.
    pub async fn degrade(
        &self,
        failed_variant: &str,
    ) -> Result<Option<ModelVariantConfig>, TranscriptionError> {
        {
            let mut inner = self.inner.lock().await;
            let Some(index) = self.variants.iter().position(|v| v.name == failed_variant) else {
                return Ok(None);
            };
            if index + 1 >= self.variants.len() {
                inner.state = ModelState::Failed {
                    reason: format!("smallest model variant '{failed_variant}' exhausted resources"),
                };
                return Ok(None);
            }
            inner.floor = inner.floor.max(index + 1);
            inner.state = ModelState::Unloaded;
            warn!(from = failed_variant, "Degrading speech model after resource failure");
        }
        self.acquire().await.map(Some)
    }
}
