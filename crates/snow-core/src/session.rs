//! CMS session
//!
//! Holds the loaded configuration and the active backend in a
//! [`tokio::sync::watch`] cell so front ends can observe both. A backend
//! that needs a login is kept pending until the login completes; only then
//! does it become active. Activating a backend retires the previous one.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::backend::github::auth::CallbackParams;
use crate::backend::{Backend, InitOutcome, LoginForm, LoginOutcome};
use crate::config::Config;
use crate::error::{BackendError, BackendResult};
use crate::models::{ContentDocument, Document};
use crate::picker::FilePicker;
use crate::preview::PreviewRegistry;
use crate::registry::{BackendContext, BackendRegistry};
use crate::state::StateStore;

/// Published session state
#[derive(Clone, Default)]
pub struct SessionState {
    pub config: Option<Arc<Config>>,
    pub backend: Option<Arc<dyn Backend>>,
}

impl SessionState {
    pub fn backend_name(&self) -> Option<&str> {
        self.backend.as_deref().map(|b| b.name())
    }
}

/// Site-supplied hooks run after successful operations
///
/// Hooks only run when `custom_actions` is enabled in the configuration.
/// A failing hook is logged; the operation it follows has already succeeded.
#[async_trait]
pub trait CmsActions: Send + Sync {
    async fn on_save(&self, _doc: &ContentDocument) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_delete(&self, _docs: &[Document]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn logout(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct Session {
    registry: BackendRegistry,
    picker: Arc<dyn FilePicker>,
    state_store: Arc<dyn StateStore>,
    previews: PreviewRegistry,
    callback: Mutex<CallbackParams>,
    actions: Option<Arc<dyn CmsActions>>,
    state: watch::Sender<SessionState>,
    pending: Mutex<Option<Arc<dyn Backend>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Session {
    pub fn new(
        registry: BackendRegistry,
        picker: Arc<dyn FilePicker>,
        state_store: Arc<dyn StateStore>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            registry,
            picker,
            state_store,
            previews: PreviewRegistry::new(),
            callback: Mutex::new(CallbackParams::default()),
            actions: None,
            state,
            pending: Mutex::new(None),
        }
    }

    /// OAuth return parameters for the next backend started
    pub fn with_callback(self, params: CallbackParams) -> Self {
        *lock(&self.callback) = params;
        self
    }

    pub fn with_actions(mut self, actions: Arc<dyn CmsActions>) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn previews(&self) -> &PreviewRegistry {
        &self.previews
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Publish the configuration. Loaded once per session.
    pub fn load_config(&self, config: Config) -> Arc<Config> {
        let config = Arc::new(config);
        self.state.send_modify(|state| state.config = Some(Arc::clone(&config)));
        info!(backend = %config.backend.name, collections = config.collections.len(), "Configuration loaded");
        config
    }

    pub fn config(&self) -> BackendResult<Arc<Config>> {
        self.state
            .borrow()
            .config
            .clone()
            .ok_or_else(|| BackendError::Configuration {
                key: "config".to_string(),
                details: "no configuration loaded".to_string(),
            })
    }

    /// The active backend
    pub fn backend(&self) -> BackendResult<Arc<dyn Backend>> {
        self.state
            .borrow()
            .backend
            .clone()
            .ok_or(BackendError::NoActiveBackend)
    }

    /// Create and initialize the configured backend
    ///
    /// `Ready` activates it. Otherwise it is held until
    /// [`submit_login`](Session::submit_login) completes.
    pub async fn start(&self) -> BackendResult<InitOutcome> {
        let config = self.config()?;
        let ctx = BackendContext {
            config,
            picker: Arc::clone(&self.picker),
            previews: self.previews.clone(),
            state_store: Arc::clone(&self.state_store),
            callback: std::mem::take(&mut *lock(&self.callback)),
        };

        let backend = self.registry.create(&ctx)?;
        let outcome = backend.initialize().await?;
        let abandoned = match &outcome {
            InitOutcome::Ready => {
                let abandoned = lock(&self.pending).take();
                self.activate(backend);
                abandoned
            }
            InitOutcome::LoginRequired(_) | InitOutcome::Redirect(_) => {
                info!(backend = %backend.name(), "Backend waiting for login");
                lock(&self.pending).replace(backend)
            }
        };

        // A backend replaced before finishing login never becomes active
        if let Some(old) = abandoned {
            info!(backend = %old.name(), "Dropping backend that was waiting for login");
            old.retire();
        }
        Ok(outcome)
    }

    /// Run the pending backend's login action
    pub async fn submit_login(&self, form: LoginForm) -> BackendResult<LoginOutcome> {
        let backend = lock(&self.pending)
            .clone()
            .ok_or(BackendError::NoActiveBackend)?;

        let outcome = backend.login(form).await?;
        if outcome == LoginOutcome::Ready {
            lock(&self.pending).take();
            self.activate(backend);
        }
        Ok(outcome)
    }

    /// Make `backend` the active backend, retiring the one it replaces
    pub fn activate(&self, backend: Arc<dyn Backend>) {
        let name = backend.name().to_string();
        let mut replaced = None;
        self.state.send_modify(|state| {
            replaced = state.backend.replace(backend);
        });

        if let Some(old) = replaced {
            info!(old = %old.name(), new = %name, "Replacing active backend");
            old.retire();
        } else {
            info!(backend = %name, "Backend active");
        }
    }

    fn actions(&self) -> Option<&Arc<dyn CmsActions>> {
        let enabled = self
            .state
            .borrow()
            .config
            .as_ref()
            .is_some_and(|c| c.custom_actions);
        self.actions.as_ref().filter(|_| enabled)
    }

    /// Save through the active backend, then run `on_save`
    pub async fn save_entry(
        &self,
        collection: &str,
        doc: ContentDocument,
    ) -> BackendResult<ContentDocument> {
        let config = self.config()?;
        let collection = config
            .collection(collection)
            .ok_or_else(|| BackendError::Configuration {
                key: "collections".to_string(),
                details: format!("no collection named '{}'", collection),
            })?;

        let saved = self.backend()?.save_entry(collection, doc).await?;
        if let Some(actions) = self.actions() {
            if let Err(e) = actions.on_save(&saved).await {
                warn!(error = %e, "on_save hook failed");
            }
        }
        Ok(saved)
    }

    /// Delete through the active backend, then run `on_delete`
    pub async fn delete_entries(&self, docs: &[Document]) -> BackendResult<()> {
        self.backend()?.delete_entries(docs).await?;
        if let Some(actions) = self.actions() {
            if let Err(e) = actions.on_delete(docs).await {
                warn!(error = %e, "on_delete hook failed");
            }
        }
        Ok(())
    }

    /// Log out of the active backend, then run the `logout` hook
    ///
    /// A backend still waiting on login is logged out instead, so stale
    /// credentials can be dropped without completing the flow.
    pub async fn logout(&self) -> BackendResult<()> {
        let backend = match self.backend() {
            Ok(backend) => backend,
            Err(e) => lock(&self.pending).take().ok_or(e)?,
        };
        backend.logout().await?;
        if let Some(actions) = self.actions() {
            if let Err(e) = actions.logout().await {
                warn!(error = %e, "logout hook failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front_matter::Fields;
    use crate::picker::ScriptedPicker;
    use crate::state::MemoryStateStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingActions {
        saves: AtomicUsize,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl CmsActions for CountingActions {
        async fn on_save(&self, _doc: &ContentDocument) -> anyhow::Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_delete(&self, _docs: &[Document]) -> anyhow::Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn session() -> Session {
        Session::new(
            BackendRegistry::with_builtin(),
            Arc::new(ScriptedPicker::new()),
            Arc::new(MemoryStateStore::new()),
        )
    }

    fn example_config() -> Config {
        let mut config = Config::load_from_str(
            r#"
            custom_actions = true

            [[collections]]
            name = "posts"
            folder = "content/posts"
            "#,
        )
        .unwrap();
        config.backend.name = "example".to_string();
        config
    }

    fn fields(yaml: &str) -> ContentDocument {
        let fields: Fields = serde_yaml::from_str(yaml).unwrap();
        let collection = crate::config::Collection::new("posts", "content/posts");
        ContentDocument::from_form(&collection, fields).unwrap()
    }

    #[tokio::test]
    async fn test_start_without_config() {
        let session = session();
        assert!(matches!(
            session.start().await,
            Err(BackendError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_login_gates_activation() {
        let session = session();
        let mut rx = session.subscribe();
        session.load_config(example_config());

        let outcome = session.start().await.unwrap();
        assert!(matches!(outcome, InitOutcome::LoginRequired(_)));
        assert!(matches!(session.backend(), Err(BackendError::NoActiveBackend)));

        assert_eq!(session.submit_login(LoginForm::new()).await.unwrap(), LoginOutcome::Ready);
        assert_eq!(session.backend().unwrap().name(), "example");

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().backend_name(), Some("example"));
    }

    #[tokio::test]
    async fn test_logout_reaches_pending_backend() {
        let session = session();
        assert!(matches!(session.logout().await, Err(BackendError::NoActiveBackend)));

        session.load_config(example_config());
        session.start().await.unwrap();
        session.logout().await.unwrap();

        // The pending backend is dropped with its credentials
        assert!(matches!(
            session.submit_login(LoginForm::new()).await,
            Err(BackendError::NoActiveBackend)
        ));
    }

    #[tokio::test]
    async fn test_restart_retires_pending_backend() {
        let session = session();
        session.load_config(example_config());

        session.start().await.unwrap();
        let first = lock(&session.pending).clone().unwrap();
        session.start().await.unwrap();
        let second = lock(&session.pending).clone().unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(matches!(
            first.login(LoginForm::new()).await,
            Err(BackendError::Retired("example"))
        ));
        assert_eq!(session.submit_login(LoginForm::new()).await.unwrap(), LoginOutcome::Ready);
        assert!(Arc::ptr_eq(&session.backend().unwrap(), &second));
    }

    #[tokio::test]
    async fn test_activation_retires_previous_backend() {
        let temp = TempDir::new().unwrap();
        let session = session();
        let mut config = example_config();
        config.data_dir = temp.path().to_path_buf();
        config.backend.name = "local".to_string();
        config.backend.repo_folder = Some("site".to_string());
        session.load_config(config);

        assert_eq!(session.start().await.unwrap(), InitOutcome::Ready);
        let local = session.backend().unwrap();
        assert_eq!(local.name(), "local");

        let replacement: Arc<dyn Backend> = Arc::new(crate::backend::ExampleBackend::new(
            session.config().unwrap(),
            Arc::new(ScriptedPicker::new()),
            session.previews().clone(),
        ));
        session.activate(replacement);

        assert_eq!(session.backend().unwrap().name(), "example");
        assert!(matches!(
            local.list_entries("posts").await,
            Err(BackendError::Retired("local"))
        ));
    }

    #[tokio::test]
    async fn test_hooks_run_only_after_success() {
        let actions = Arc::new(CountingActions::default());
        let session = session().with_actions(actions.clone());
        session.load_config(example_config());
        session.start().await.unwrap();
        session.submit_login(LoginForm::new()).await.unwrap();

        let saved = session
            .save_entry("posts", fields("title: Hello\ndate: 2024-01-01"))
            .await
            .unwrap();
        assert_eq!(actions.saves.load(Ordering::SeqCst), 1);

        // Unknown collection: nothing saved, no hook
        assert!(session.save_entry("missing", fields("title: Nope")).await.is_err());
        assert_eq!(actions.saves.load(Ordering::SeqCst), 1);

        session.delete_entries(&[Document::from(saved)]).await.unwrap();
        assert_eq!(actions.deletes.load(Ordering::SeqCst), 1);

        // Failed operation on a logged-out backend: no hook
        session.logout().await.unwrap();
        assert!(session.delete_entries(&[]).await.is_err());
        assert_eq!(actions.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hooks_disabled_by_config() {
        let actions = Arc::new(CountingActions::default());
        let session = session().with_actions(actions.clone());
        let mut config = example_config();
        config.custom_actions = false;
        session.load_config(config);
        session.start().await.unwrap();
        session.submit_login(LoginForm::new()).await.unwrap();

        session
            .save_entry("posts", fields("title: Hello"))
            .await
            .unwrap();
        assert_eq!(actions.saves.load(Ordering::SeqCst), 0);
    }
}
