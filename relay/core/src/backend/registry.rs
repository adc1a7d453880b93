//! Backend selection by name

use std::collections::HashMap;
use std::sync::Arc;

use super::traits::BackendExecutor;
use crate::error::BackendError;

/// Named backends plus the default used when a job names none
#[derive(Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn BackendExecutor>>,
    default: String,
}

impl BackendRegistry {
    /// Empty registry with the given default name
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            backends: HashMap::new(),
            default: default.into(),
        }
    }

    /// Register a backend under its own name, replacing any previous one
    pub fn register(&mut self, backend: Arc<dyn BackendExecutor>) {
        let name = backend.name().to_string();
        if self.backends.insert(name.clone(), backend).is_some() {
            tracing::warn!(backend = %name, "Backend replaced");
        } else {
            tracing::debug!(backend = %name, "Backend registered");
        }
    }

    /// Builder form of [`register`](Self::register)
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn BackendExecutor>) -> Self {
        self.register(backend);
        self
    }

    /// Change the default name
    pub fn set_default(&mut self, name: impl Into<String>) {
        self.default = name.into();
    }

    /// Default backend name
    #[must_use]
    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// Look a backend up; `None` selects the default
    ///
    /// # Errors
    ///
    /// [`BackendError::NotConfigured`] when nothing is registered under the name.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn BackendExecutor>, BackendError> {
        let name = name.unwrap_or(&self.default);
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::NotConfigured(name.to_string()))
    }

    /// Whether a name is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .field("default", &self.default)
            .finish()
    }
}
