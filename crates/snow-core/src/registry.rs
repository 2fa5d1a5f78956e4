//! Backend registry
//!
//! Maps `backend.name` values to factories. `local`, `github` and `example`
//! are built in; custom backends register their own factory at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::backend::github::auth::CallbackParams;
use crate::backend::{Backend, ExampleBackend, GitHubBackend, GitHubConnector, LocalBackend};
use crate::config::Config;
use crate::error::{BackendError, BackendResult};
use crate::picker::FilePicker;
use crate::preview::PreviewRegistry;
use crate::state::StateStore;

/// Everything a factory may hand to a backend it creates
#[derive(Clone)]
pub struct BackendContext {
    pub config: Arc<Config>,
    pub picker: Arc<dyn FilePicker>,
    pub previews: PreviewRegistry,
    pub state_store: Arc<dyn StateStore>,
    /// Parameters of the OAuth return URL, if the process was started from one
    pub callback: CallbackParams,
}

pub type BackendFactory =
    Box<dyn Fn(&BackendContext) -> BackendResult<Arc<dyn Backend>> + Send + Sync>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Backend name must not be empty")]
    EmptyName,

    #[error("A backend named '{0}' is already registered")]
    Duplicate(String),
}

#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in backends
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.insert("local", |ctx| {
            let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(
                Arc::clone(&ctx.config),
                Arc::clone(&ctx.picker),
                ctx.previews.clone(),
            )?);
            Ok(backend)
        });
        registry.insert("github", |ctx| {
            let connector = GitHubConnector::from_config(&ctx.config.backend)?;
            let backend = GitHubBackend::new(
                Arc::clone(&ctx.config),
                Arc::new(connector),
                Arc::clone(&ctx.state_store),
                Arc::clone(&ctx.picker),
                ctx.previews.clone(),
            )?;
            let backend: Arc<dyn Backend> = Arc::new(backend.with_callback(ctx.callback.clone()));
            Ok(backend)
        });
        registry.insert("example", |ctx| {
            let backend: Arc<dyn Backend> = Arc::new(ExampleBackend::new(
                Arc::clone(&ctx.config),
                Arc::clone(&ctx.picker),
                ctx.previews.clone(),
            ));
            Ok(backend)
        });
        registry
    }

    fn insert<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&BackendContext) -> BackendResult<Arc<dyn Backend>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Register a custom backend
    ///
    /// Names must be non-empty and not already taken.
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&BackendContext) -> BackendResult<Arc<dyn Backend>> + Send + Sync + 'static,
    {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.factories.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        debug!(%name, "Registered backend");
        self.insert(name, factory);
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Create the backend named by `backend.name`
    pub fn create(&self, ctx: &BackendContext) -> BackendResult<Arc<dyn Backend>> {
        let name = &ctx.config.backend.name;
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| BackendError::Configuration {
                key: "backend.name".to_string(),
                details: format!(
                    "unknown backend '{}' (available: {})",
                    name,
                    self.names().join(", ")
                ),
            })?;
        factory(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picker::NoPicker;
    use crate::state::MemoryStateStore;

    fn context(name: &str) -> BackendContext {
        let mut config = Config::default();
        config.backend.name = name.to_string();
        BackendContext {
            config: Arc::new(config),
            picker: Arc::new(NoPicker),
            previews: PreviewRegistry::new(),
            state_store: Arc::new(MemoryStateStore::new()),
            callback: CallbackParams::default(),
        }
    }

    #[test]
    fn test_builtin_names() {
        let registry = BackendRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["example", "github", "local"]);
    }

    #[test]
    fn test_register_validates_names() {
        let mut registry = BackendRegistry::with_builtin();
        let factory = |ctx: &BackendContext| -> BackendResult<Arc<dyn Backend>> {
            let backend: Arc<dyn Backend> = Arc::new(ExampleBackend::new(
                Arc::clone(&ctx.config),
                Arc::clone(&ctx.picker),
                ctx.previews.clone(),
            ));
            Ok(backend)
        };

        assert_eq!(registry.register("  ", factory), Err(RegistryError::EmptyName));
        assert_eq!(
            registry.register("local", factory),
            Err(RegistryError::Duplicate("local".to_string()))
        );
        assert!(registry.register("custom", factory).is_ok());
        assert!(registry.contains("custom"));

        let backend = registry.create(&context("custom")).unwrap();
        assert_eq!(backend.name(), "example");
    }

    #[test]
    fn test_unknown_backend_is_configuration_error() {
        let registry = BackendRegistry::with_builtin();
        match registry.create(&context("dropbox")) {
            Err(BackendError::Configuration { key, details }) => {
                assert_eq!(key, "backend.name");
                assert!(details.contains("dropbox"));
            }
            _ => panic!("expected configuration error"),
        }
    }

    #[test]
    fn test_builtin_factories_check_required_keys() {
        let registry = BackendRegistry::with_builtin();
        match registry.create(&context("local")) {
            Err(BackendError::Configuration { key, .. }) => assert_eq!(key, "backend.repo_folder"),
            _ => panic!("expected configuration error"),
        }
        match registry.create(&context("github")) {
            Err(BackendError::Configuration { key, .. }) => assert_eq!(key, "backend.repo"),
            _ => panic!("expected configuration error"),
        }
    }
}
