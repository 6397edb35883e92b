pub mod command;
pub mod stream_json;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use conclave_core::config::AppConfig;
use conclave_core::error::{ConclaveError, Result};
use conclave_core::traits::AgentBackend;

pub use command::CommandBackend;

/// Named execution backends. An agent's `config.runtime` picks one.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn AgentBackend>>,
    default_runtime: String,
}

impl BackendRegistry {
    pub fn new(default_runtime: impl Into<String>) -> Self {
        Self {
            backends: HashMap::new(),
            default_runtime: default_runtime.into(),
        }
    }

    /// One command backend per `[runtimes.*]` section.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::new(config.launcher.default_runtime.clone());
        for (name, runtime) in &config.runtimes {
            registry.register(Arc::new(CommandBackend::new(name.clone(), runtime.clone())));
        }
        registry
    }

    /// Register a backend under its own name, replacing any previous one.
    pub fn register(&mut self, backend: Arc<dyn AgentBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn default_runtime(&self) -> &str {
        &self.default_runtime
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Backend for a runtime name, falling back to the default runtime.
    pub fn resolve(&self, runtime: Option<&str>) -> Result<Arc<dyn AgentBackend>> {
        let name = runtime.unwrap_or(self.default_runtime.as_str());
        if let Some(backend) = self.backends.get(name) {
            return Ok(backend.clone());
        }
        match self.backends.get(&self.default_runtime) {
            Some(backend) => {
                warn!(
                    runtime = %name,
                    fallback = %self.default_runtime,
                    "Unknown runtime, using default"
                );
                Ok(backend.clone())
            }
            None => Err(ConclaveError::UnknownRuntime(name.to_string())),
        }
    }
}
