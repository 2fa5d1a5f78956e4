//! GitHub storage backend
//!
//! Documents live in a repository branch. Every write is one commit made
//! against the branch tip read just before it, so a concurrent writer makes
//! the later save fail with a conflict instead of overwriting.
//!
//! Login is an OAuth round trip through the forge (see [`auth`]). The
//! backend only reports `Ready` once it holds a token and the configured
//! app is installed for the user.

pub mod api;
pub mod auth;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::backend::{
    log_failure, sort_by_date_desc, Backend, InitOutcome, LoginConfig, LoginForm, LoginOutcome,
    Retirement,
};
use crate::config::{require, Collection, Config};
use crate::error::{BackendError, BackendResult};
use crate::front_matter::sentinel_date;
use crate::links;
use crate::models::{asset_mime, extension_of, AssetDocument, ContentDocument, Document};
use crate::picker::FilePicker;
use crate::preview::{LeaseTable, PreviewRegistry};
use crate::state::StateStore;

use self::api::{ChangeSet, EntryKind, ForgeApi, ForgeConnector, ForgeError};
use self::auth::{AuthPhase, CallbackAction, CallbackParams, STATE_KEY, TOKEN_KEY};

pub use self::api::GitHubConnector;
#[cfg(any(test, feature = "test-util"))]
pub use self::memory::MemoryForge;

const NAME: &str = "github";

/// Media listed from the branch, with the leases behind their previews
#[derive(Debug, Default)]
struct MediaCache {
    /// Set once the media folder has been listed
    loaded: bool,
    assets: Vec<AssetDocument>,
    /// Keyed by repository path
    leases: LeaseTable,
}

impl MediaCache {
    fn remove(&mut self, path: &str) {
        self.leases.release(path);
        self.assets.retain(|a| a.file_path() != path);
    }
}

/// Backend over a GitHub repository branch
pub struct GitHubBackend {
    config: Arc<Config>,
    app_slug: String,
    client_id: String,
    connector: Arc<dyn ForgeConnector>,
    state_store: Arc<dyn StateStore>,
    picker: Arc<dyn FilePicker>,
    previews: PreviewRegistry,
    callback: Mutex<CallbackParams>,
    api: RwLock<Option<Arc<dyn ForgeApi>>>,
    phase: Mutex<AuthPhase>,
    media: Mutex<MediaCache>,
    retirement: Retirement,
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Wrap a commit failure, surfacing a moved branch tip as a conflict
fn commit_error(err: ForgeError) -> crate::error::BoxError {
    match err {
        ForgeError::StaleHead { .. } => Box::new(BackendError::Conflict(err.to_string())),
        other => Box::new(other),
    }
}

fn auth_error(err: ForgeError) -> BackendError {
    BackendError::Auth(err.to_string())
}

impl GitHubBackend {
    /// Create the backend
    ///
    /// Fails if `backend.repo`, `backend.app_name` or `backend.client_id`
    /// is missing.
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn ForgeConnector>,
        state_store: Arc<dyn StateStore>,
        picker: Arc<dyn FilePicker>,
        previews: PreviewRegistry,
    ) -> BackendResult<Self> {
        config.backend.repo_parts()?;
        let app_slug = config.backend.app_slug()?;
        let client_id = require(&config.backend.client_id, "backend.client_id")?.to_string();

        Ok(Self {
            config,
            app_slug,
            client_id,
            connector,
            state_store,
            picker,
            previews,
            callback: Mutex::new(CallbackParams::default()),
            api: RwLock::new(None),
            phase: Mutex::new(AuthPhase::Unauthenticated),
            media: Mutex::new(MediaCache::default()),
            retirement: Retirement::default(),
        })
    }

    /// Parameters of the OAuth return URL, handled by the next `initialize`
    pub fn with_callback(self, params: CallbackParams) -> Self {
        *lock(&self.callback) = params;
        self
    }

    pub fn phase(&self) -> AuthPhase {
        *lock(&self.phase)
    }

    fn set_phase(&self, phase: AuthPhase) {
        debug!(?phase, "GitHub login phase");
        *lock(&self.phase) = phase;
    }

    fn branch(&self) -> &str {
        &self.config.backend.branch
    }

    fn media_folder(&self) -> &str {
        self.config.media_folder.trim_matches('/')
    }

    fn api(&self) -> BackendResult<Arc<dyn ForgeApi>> {
        self.api
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| BackendError::Auth("not logged in to GitHub".to_string()))
    }

    fn set_api(&self, api: Option<Arc<dyn ForgeApi>>) {
        *self.api.write().unwrap_or_else(|e| e.into_inner()) = api;
    }

    fn login_form(&self) -> LoginConfig {
        LoginConfig {
            title: "GitHub Log in".to_string(),
            message: String::new(),
            button: "Log in with GitHub".to_string(),
            fields: Vec::new(),
        }
    }

    /// Store a fresh state token and return the authorize URL
    fn start_login(&self) -> BackendResult<String> {
        let state = auth::generate_state();
        self.state_store
            .set(STATE_KEY, &state)
            .map_err(|e| BackendError::Auth(format!("failed to store login state: {}", e)))?;
        let url = auth::authorize_url(&self.client_id, &self.config.backend.redirect_uri, &state)?;
        self.set_phase(AuthPhase::AwaitingCallback);
        Ok(url)
    }

    async fn exchange(&self, code: &str) -> BackendResult<InitOutcome> {
        self.set_phase(AuthPhase::ExchangingCode);
        let token = match self.connector.exchange_code(code).await {
            Ok(token) => token,
            Err(e) => {
                self.set_phase(AuthPhase::Invalid);
                return Err(auth_error(e));
            }
        };

        if let Err(e) = self.state_store.remove(STATE_KEY) {
            warn!(error = %e, "Failed to clear OAuth state");
        }
        if let Err(e) = self.state_store.set(TOKEN_KEY, &token) {
            warn!(error = %e, "Failed to persist access token");
        }
        self.connect(&token).await
    }

    /// Use a token: check the app installation and activate the API client
    async fn connect(&self, token: &str) -> BackendResult<InitOutcome> {
        let api = self.connector.connect(token).map_err(auth_error)?;
        self.set_phase(AuthPhase::AuthenticatedNoInstall);

        let installations = api.list_installations().await.map_err(auth_error)?;
        if installations.iter().any(|i| i.app_slug == self.app_slug) {
            self.set_api(Some(api));
            self.set_phase(AuthPhase::Active);
            info!(repo = ?self.config.backend.repo, branch = %self.branch(), "GitHub backend active");
            Ok(InitOutcome::Ready)
        } else {
            self.set_phase(AuthPhase::AwaitingAppInstall);
            info!(app = %self.app_slug, "GitHub app not installed, redirecting");
            Ok(InitOutcome::Redirect(auth::install_url(&self.app_slug)))
        }
    }

    /// Pick up a token persisted by an earlier session
    async fn resume(&self) -> BackendResult<InitOutcome> {
        let Some(token) = self.state_store.get(TOKEN_KEY) else {
            self.set_phase(AuthPhase::Unauthenticated);
            return Ok(InitOutcome::LoginRequired(self.login_form()));
        };

        match self.connect(&token).await {
            Err(BackendError::Auth(message)) => {
                warn!(%message, "Stored GitHub token rejected, logging in again");
                if let Err(e) = self.state_store.remove(TOKEN_KEY) {
                    warn!(error = %e, "Failed to clear access token");
                }
                self.set_phase(AuthPhase::Unauthenticated);
                Ok(InitOutcome::LoginRequired(self.login_form()))
            }
            other => other,
        }
    }

    async fn update_branch(
        &self,
        api: &dyn ForgeApi,
        headline: &str,
        changes: &ChangeSet,
    ) -> Result<String, ForgeError> {
        let tip = api.branch_tip(self.branch()).await?;
        let commit = api.create_commit(self.branch(), headline, &tip, changes).await?;
        debug!(%headline, %tip, %commit, "Committed to branch");
        Ok(commit)
    }

    async fn entries(&self, name: &str) -> BackendResult<Vec<ContentDocument>> {
        let collection = self
            .config
            .collection(name)
            .ok_or_else(|| BackendError::Configuration {
                key: "collections".to_string(),
                details: format!("no collection named '{}'", name),
            })?;
        let api = self.api()?;
        let folder = collection.folder_path();

        let tree = api
            .list_tree(self.branch(), folder)
            .await
            .map_err(|e| BackendError::retrieval(format!("collection '{}'", name), e))?;

        let mut docs = Vec::new();
        for entry in tree {
            if entry.kind != EntryKind::Blob
                || is_hidden(&entry.name)
                || !collection.extension.eq_ignore_ascii_case(&extension_of(&entry.name))
            {
                continue;
            }
            let Some(text) = entry.text else {
                debug!(name = %entry.name, "Skipping binary entry");
                continue;
            };
            let mut doc = ContentDocument::from_raw(&collection.name, folder, &entry.name, text)
                .map_err(|e| {
                    BackendError::retrieval(format!("entry '{}/{}'", folder, entry.name), e)
                })?;
            doc.id = Some(entry.id);
            docs.push(doc);
        }

        sort_by_date_desc(&mut docs);
        debug!(collection = %name, count = docs.len(), "Listed entries");
        Ok(docs)
    }

    async fn save(
        &self,
        collection: &Collection,
        mut doc: ContentDocument,
    ) -> BackendResult<ContentDocument> {
        doc.prepare(collection)
            .map_err(|e| BackendError::persist(doc.name.clone(), e))?;
        let api = self.api()?;
        let path = doc.file_path();

        self.update_branch(
            api.as_ref(),
            &format!("Update {}", doc.name),
            &ChangeSet::add(path.clone(), doc.raw.as_bytes()),
        )
        .await
        .map_err(|e| BackendError::Persist {
            name: doc.name.clone(),
            source: commit_error(e),
        })?;

        info!(%path, "Saved entry");
        Ok(doc)
    }

    /// Paths of `docs` that are still files on the branch, deduplicated
    async fn existing_paths(
        &self,
        api: &dyn ForgeApi,
        docs: &[Document],
    ) -> Result<Vec<String>, ForgeError> {
        let mut requested: Vec<String> = Vec::new();
        for path in docs.iter().map(Document::file_path) {
            if !requested.contains(&path) {
                requested.push(path);
            }
        }

        let folders: BTreeSet<&str> = requested
            .iter()
            .map(|path| path.rsplit_once('/').map_or("", |(folder, _)| folder))
            .collect();
        let mut present = HashSet::new();
        for folder in folders {
            for entry in api.list_tree(self.branch(), folder).await? {
                if entry.kind != EntryKind::Blob {
                    continue;
                }
                present.insert(if folder.is_empty() {
                    entry.name
                } else {
                    format!("{}/{}", folder, entry.name)
                });
            }
        }

        Ok(requested.into_iter().filter(|p| present.contains(p)).collect())
    }

    async fn delete(&self, docs: &[Document]) -> BackendResult<()> {
        let count = docs.len();
        let api = self.api()?;

        let paths = self
            .existing_paths(api.as_ref(), docs)
            .await
            .map_err(|e| BackendError::deletion(count, e))?;

        if !paths.is_empty() {
            self.update_branch(
                api.as_ref(),
                &format!("Delete {} file(s)", paths.len()),
                &ChangeSet::delete(paths.clone()),
            )
            .await
            .map_err(|e| BackendError::Deletion {
                count,
                source: commit_error(e),
            })?;
        }

        {
            let mut media = lock(&self.media);
            for doc in docs.iter().filter_map(Document::as_asset) {
                media.remove(&doc.file_path());
            }
        }

        if paths.is_empty() {
            debug!(requested = count, "Nothing left to delete");
        } else {
            info!(count, removed = paths.len(), "Deleted documents");
        }
        Ok(())
    }

    async fn media_files(&self) -> BackendResult<Vec<AssetDocument>> {
        let api = self.api()?;
        let folder = self.media_folder().to_string();

        let tree = api
            .list_tree(self.branch(), &folder)
            .await
            .map_err(|e| BackendError::retrieval("media files", e))?;
        let blobs: Vec<_> = tree
            .into_iter()
            .filter(|e| e.kind == EntryKind::Blob && !is_hidden(&e.name))
            .collect();

        let fetched = join_all(blobs.iter().map(|entry| api.get_blob(&entry.oid))).await;

        let mut leases = LeaseTable::new();
        let mut assets = Vec::with_capacity(blobs.len());
        for (entry, bytes) in blobs.into_iter().zip(fetched) {
            let mime = asset_mime(&extension_of(&entry.name));
            let mut asset = AssetDocument {
                id: Some(entry.id),
                public: self.config.public_url(&entry.name),
                preview: String::new(),
                name: entry.name,
                date: sentinel_date(),
                path: folder.clone(),
                mime: mime.to_string(),
                handle: None,
                rev: None,
            };
            asset.preview = match bytes {
                Ok(bytes) => {
                    let lease = self.previews.create(mime, bytes);
                    let url = lease.url().to_string();
                    leases.insert(asset.file_path(), lease);
                    url
                }
                Err(e) => {
                    warn!(name = %asset.name, error = %e, "Media blob unavailable, previewing by public URL");
                    asset.public.clone()
                }
            };
            assets.push(asset);
        }

        let replaced = std::mem::replace(
            &mut *lock(&self.media),
            MediaCache {
                loaded: true,
                assets: assets.clone(),
                leases,
            },
        );
        drop(replaced);

        debug!(count = assets.len(), "Listed media files");
        Ok(assets)
    }

    async fn upload(&self) -> BackendResult<AssetDocument> {
        let api = self.api()?;
        let source = self
            .picker
            .open_file()
            .await?
            .ok_or(BackendError::Cancelled)?;
        let name = source.name().unwrap_or("upload").to_string();
        let bytes = source
            .read_bytes()
            .await
            .map_err(|e| BackendError::persist(name.clone(), e))?;

        // The upload joins the listed media, so list it first
        let loaded = lock(&self.media).loaded;
        if !loaded {
            self.media_files().await?;
        }

        let mime = asset_mime(&extension_of(&name));
        let mut asset = AssetDocument {
            id: None,
            public: self.config.public_url(&name),
            preview: String::new(),
            name: name.clone(),
            date: Utc::now(),
            path: self.media_folder().to_string(),
            mime: mime.to_string(),
            handle: None,
            rev: None,
        };
        let path = asset.file_path();

        self.update_branch(
            api.as_ref(),
            &format!("Upload {}", name),
            &ChangeSet::add(path.clone(), bytes.clone()),
        )
        .await
        .map_err(|e| BackendError::Persist {
            name: name.clone(),
            source: commit_error(e),
        })?;

        let lease = self.previews.create(mime, bytes);
        asset.preview = lease.url().to_string();

        {
            let mut media = lock(&self.media);
            media.remove(&path);
            media.leases.insert(path.clone(), lease);
            media.assets.push(asset.clone());
        }

        info!(%path, "Uploaded media file");
        Ok(asset)
    }

    /// Swap link URLs using the media cache, listing media first if needed
    async fn rewrite(&self, text: &str, to_preview: bool) -> BackendResult<String> {
        let loaded = lock(&self.media).loaded;
        if !loaded {
            self.media_files().await?;
        }
        let media = lock(&self.media);
        links::rewrite(text, |url| -> BackendResult<Option<String>> {
            Ok(media.assets.iter().find_map(|asset| {
                if to_preview && asset.public == url {
                    Some(asset.preview.clone())
                } else if !to_preview && asset.preview == url {
                    Some(asset.public.clone())
                } else {
                    None
                }
            }))
        })
    }
}

#[async_trait]
impl Backend for GitHubBackend {
    fn name(&self) -> &str {
        NAME
    }

    async fn initialize(&self) -> BackendResult<InitOutcome> {
        self.retirement.check(NAME)?;
        let callback = std::mem::take(&mut *lock(&self.callback));

        let action = match auth::check_callback(&callback, self.state_store.as_ref()) {
            Ok(action) => action,
            Err(e) => {
                self.set_phase(AuthPhase::Invalid);
                return Err(log_failure("initialize", e));
            }
        };

        let outcome = match action {
            CallbackAction::Exchange { code } => self.exchange(&code).await,
            CallbackAction::Installed if self.state_store.get(TOKEN_KEY).is_none() => {
                self.start_login().map(InitOutcome::Redirect)
            }
            CallbackAction::Installed | CallbackAction::None => self.resume().await,
        };
        outcome.map_err(|e| log_failure("initialize", e))
    }

    fn login_config(&self) -> Option<LoginConfig> {
        Some(self.login_form())
    }

    async fn login(&self, _form: LoginForm) -> BackendResult<LoginOutcome> {
        self.retirement.check(NAME)?;
        self.start_login()
            .map(LoginOutcome::Redirect)
            .map_err(|e| log_failure("login", e))
    }

    async fn logout(&self) -> BackendResult<()> {
        for key in [TOKEN_KEY, STATE_KEY] {
            if let Err(e) = self.state_store.remove(key) {
                warn!(%key, error = %e, "Failed to clear login state");
            }
        }
        self.set_api(None);
        *lock(&self.media) = MediaCache::default();
        self.set_phase(AuthPhase::Unauthenticated);
        info!("Logged out of GitHub");
        Ok(())
    }

    async fn list_entries(&self, collection: &str) -> BackendResult<Vec<ContentDocument>> {
        self.retirement.check(NAME)?;
        self.entries(collection)
            .await
            .map_err(|e| log_failure("list_entries", e))
    }

    async fn save_entry(
        &self,
        collection: &Collection,
        doc: ContentDocument,
    ) -> BackendResult<ContentDocument> {
        self.retirement.check(NAME)?;
        self.save(collection, doc)
            .await
            .map_err(|e| log_failure("save_entry", e))
    }

    async fn delete_entries(&self, docs: &[Document]) -> BackendResult<()> {
        self.retirement.check(NAME)?;
        self.delete(docs)
            .await
            .map_err(|e| log_failure("delete_entries", e))
    }

    async fn list_media_files(&self) -> BackendResult<Vec<AssetDocument>> {
        self.retirement.check(NAME)?;
        self.media_files()
            .await
            .map_err(|e| log_failure("list_media_files", e))
    }

    async fn upload_media_file(&self) -> BackendResult<AssetDocument> {
        self.retirement.check(NAME)?;
        self.upload()
            .await
            .map_err(|e| log_failure("upload_media_file", e))
    }

    async fn resolve_public_to_preview(&self, text: &str) -> BackendResult<String> {
        self.retirement.check(NAME)?;
        self.rewrite(text, true)
            .await
            .map_err(|e| log_failure("resolve_public_to_preview", e))
    }

    async fn resolve_preview_to_public(&self, text: &str) -> BackendResult<String> {
        self.retirement.check(NAME)?;
        self.rewrite(text, false)
            .await
            .map_err(|e| log_failure("resolve_preview_to_public", e))
    }

    fn retire(&self) {
        if self.retirement.retire() {
            self.set_api(None);
            *lock(&self.media) = MediaCache::default();
            debug!("Retired GitHub backend");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::front_matter::Fields;
    use crate::picker::ScriptedPicker;
    use crate::state::MemoryStateStore;
    use std::fs;
    use tempfile::TempDir;
    use url::Url;

    fn config() -> Arc<Config> {
        Arc::new(Config {
            collections: vec![Collection::new("posts", "content/posts")],
            backend: BackendConfig {
                name: "github".to_string(),
                repo: Some("octo/site".to_string()),
                app_name: Some("Snow CMS".to_string()),
                client_id: Some("Iv1.abc".to_string()),
                ..BackendConfig::default()
            },
            ..Config::default()
        })
    }

    fn posts() -> Collection {
        Collection::new("posts", "content/posts")
    }

    fn form(yaml: &str) -> ContentDocument {
        let fields: Fields = serde_yaml::from_str(yaml).unwrap();
        ContentDocument::from_form(&posts(), fields).unwrap()
    }

    struct Fixture {
        forge: MemoryForge,
        store: Arc<MemoryStateStore>,
        picker: Arc<ScriptedPicker>,
        previews: PreviewRegistry,
    }

    impl Fixture {
        fn new(forge: MemoryForge) -> Self {
            Self {
                forge,
                store: Arc::new(MemoryStateStore::new()),
                picker: Arc::new(ScriptedPicker::new()),
                previews: PreviewRegistry::new(),
            }
        }

        fn backend(&self, callback: CallbackParams) -> GitHubBackend {
            GitHubBackend::new(
                config(),
                Arc::new(self.forge.clone()),
                self.store.clone(),
                self.picker.clone(),
                self.previews.clone(),
            )
            .unwrap()
            .with_callback(callback)
        }

        async fn active(&self) -> GitHubBackend {
            self.store.set(TOKEN_KEY, "token-1").unwrap();
            self.forge.install_app("snow-cms");
            let backend = self.backend(CallbackParams::default());
            assert_eq!(backend.initialize().await.unwrap(), InitOutcome::Ready);
            backend
        }
    }

    #[test]
    fn test_requires_repo_and_app_name() {
        let fixture = Fixture::new(MemoryForge::new());
        for strip in ["repo", "app_name", "client_id"] {
            let mut config = (*config()).clone();
            match strip {
                "repo" => config.backend.repo = None,
                "app_name" => config.backend.app_name = None,
                _ => config.backend.client_id = None,
            }
            let result = GitHubBackend::new(
                Arc::new(config),
                Arc::new(fixture.forge.clone()),
                fixture.store.clone(),
                fixture.picker.clone(),
                fixture.previews.clone(),
            );
            match result {
                Err(BackendError::Configuration { key, .. }) => assert!(key.ends_with(strip)),
                _ => panic!("expected configuration error for {}", strip),
            }
        }
    }

    #[tokio::test]
    async fn test_login_round_trip() {
        let fixture = Fixture::new(MemoryForge::new());
        fixture.forge.install_app("snow-cms");
        fixture.forge.grant("code-1", "token-1");

        let backend = fixture.backend(CallbackParams::default());
        match backend.initialize().await.unwrap() {
            InitOutcome::LoginRequired(config) => {
                assert_eq!(config.title, "GitHub Log in");
                assert_eq!(config.button, "Log in with GitHub");
            }
            other => panic!("expected login form, got {:?}", other),
        }

        let LoginOutcome::Redirect(url) = backend.login(LoginForm::new()).await.unwrap() else {
            panic!("expected redirect");
        };
        assert_eq!(backend.phase(), AuthPhase::AwaitingCallback);
        let state = Url::parse(&url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert_eq!(fixture.store.get(STATE_KEY), Some(state.clone()));

        let returned = fixture.backend(CallbackParams {
            code: Some("code-1".to_string()),
            state: Some(state),
            setup_action: None,
        });
        assert_eq!(returned.initialize().await.unwrap(), InitOutcome::Ready);
        assert_eq!(returned.phase(), AuthPhase::Active);
        assert_eq!(fixture.store.get(TOKEN_KEY).as_deref(), Some("token-1"));
        assert!(fixture.store.get(STATE_KEY).is_none());
    }

    #[tokio::test]
    async fn test_state_mismatch_is_rejected() {
        let fixture = Fixture::new(MemoryForge::new());
        fixture.forge.grant("code-1", "token-1");
        fixture.store.set(STATE_KEY, "expected").unwrap();

        let backend = fixture.backend(CallbackParams {
            code: Some("code-1".to_string()),
            state: Some("forged".to_string()),
            setup_action: None,
        });
        let err = backend.initialize().await.unwrap_err();
        assert!(matches!(err, BackendError::AuthState));
        assert!(fixture.store.get(STATE_KEY).is_none());
        assert!(fixture.store.get(TOKEN_KEY).is_none());
        assert_eq!(backend.phase(), AuthPhase::Invalid);
    }

    #[tokio::test]
    async fn test_missing_installation_redirects() {
        let fixture = Fixture::new(MemoryForge::new());
        fixture.store.set(TOKEN_KEY, "token-1").unwrap();
        fixture.forge.install_app("some-other-app");

        let backend = fixture.backend(CallbackParams::default());
        assert_eq!(
            backend.initialize().await.unwrap(),
            InitOutcome::Redirect("https://github.com/apps/snow-cms/installations/new".to_string())
        );
        assert_eq!(backend.phase(), AuthPhase::AwaitingAppInstall);
        assert!(backend.list_entries("posts").await.is_err());
    }

    #[tokio::test]
    async fn test_list_entries_newest_first() {
        let fixture = Fixture::new(MemoryForge::new());
        fixture
            .forge
            .seed("content/posts/old.md", "---\ntitle: Old\ndate: 2023-01-01\n---\n\nold");
        fixture
            .forge
            .seed("content/posts/new.md", "---\ntitle: New\ndate: 2024-06-01\n---\n\nnew");
        fixture.forge.seed("content/posts/_draft.md", "draft");
        fixture.forge.seed("content/posts/.hidden.md", "hidden");
        fixture.forge.seed("content/posts/notes.txt", "notes");
        fixture.forge.seed("content/posts/2024/nested.md", "nested");
        let backend = fixture.active().await;

        let entries = backend.list_entries("posts").await.unwrap();
        let names: Vec<_> = entries.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["new.md", "old.md"]);
        assert_eq!(entries[0].title(), Some("New"));
        assert_eq!(entries[0].path, "content/posts");
        assert!(entries.iter().all(|d| d.id.is_some()));

        assert!(matches!(
            backend.list_entries("missing").await,
            Err(BackendError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_saves_one_conflicts() {
        let fixture = Fixture::new(MemoryForge::new().with_tip_barrier(2));
        let backend = fixture.active().await;
        let collection = posts();

        let (first, second) = tokio::join!(
            backend.save_entry(&collection, form("title: First\ndate: 2024-01-01")),
            backend.save_entry(&collection, form("title: Second\ndate: 2024-01-02")),
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results.into_iter().find_map(Result::err).unwrap();
        assert!(err.is_persist_failure());
        assert!(err.is_conflict());
        assert_eq!(fixture.forge.commits().len(), 1);
    }

    #[tokio::test]
    async fn test_save_then_delete() {
        let fixture = Fixture::new(MemoryForge::new());
        let backend = fixture.active().await;

        let saved = backend
            .save_entry(&posts(), form("title: Hello World\ndate: 2024-01-01\nbody: Hi there"))
            .await
            .unwrap();
        assert_eq!(saved.name, "hello-world.md");
        let commits = fixture.forge.commits();
        assert_eq!(commits[0].headline, "Update hello-world.md");
        let stored =
            String::from_utf8(fixture.forge.file("content/posts/hello-world.md").unwrap()).unwrap();
        assert!(stored.starts_with("---\n"));
        assert!(stored.ends_with("Hi there"));

        let listed = backend.list_entries("posts").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title(), Some("Hello World"));

        let docs = vec![Document::from(listed[0].clone())];
        backend.delete_entries(&docs).await.unwrap();
        assert_eq!(fixture.forge.commits()[1].headline, "Delete 1 file(s)");
        assert!(backend.list_entries("posts").await.unwrap().is_empty());

        // A second delete of the same document is a no-op
        backend.delete_entries(&docs).await.unwrap();
        assert_eq!(fixture.forge.commits().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_skips_files_gone_from_branch() {
        let fixture = Fixture::new(MemoryForge::new());
        fixture.forge.seed("content/posts/hello.md", "---\ntitle: Hello\n---\n\nHi");
        fixture.forge.seed("content/posts/other.md", "---\ntitle: Other\n---\n\nYo");
        let first = fixture.active().await;
        let second = fixture.active().await;

        let loaded: Vec<Document> = second
            .list_entries("posts")
            .await
            .unwrap()
            .into_iter()
            .map(Document::from)
            .collect();
        let hello: Vec<Document> = loaded
            .iter()
            .filter(|d| d.file_path() == "content/posts/hello.md")
            .cloned()
            .collect();

        first.delete_entries(&hello).await.unwrap();
        second.delete_entries(&hello).await.unwrap();
        assert_eq!(fixture.forge.commits().len(), 1);

        // Only the file still on the branch is committed
        second.delete_entries(&loaded).await.unwrap();
        let commits = fixture.forge.commits();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[1].deleted, vec!["content/posts/other.md".to_string()]);
        assert!(fixture.forge.file("content/posts/other.md").is_none());
    }

    #[tokio::test]
    async fn test_resolve_lists_media_when_needed() {
        let fixture = Fixture::new(MemoryForge::new());
        fixture.forge.seed("static/media/photo.png", vec![1u8, 2, 3]);
        let backend = fixture.active().await;

        let text = "![photo](/media/photo.png)";
        let preview = backend.resolve_public_to_preview(text).await.unwrap();
        assert_ne!(preview, text);
        let url = preview
            .trim_start_matches("![photo](")
            .trim_end_matches(')')
            .to_string();
        assert!(fixture.previews.is_live(&url));
        assert_eq!(backend.resolve_preview_to_public(&preview).await.unwrap(), text);

        // The listing is reused rather than repeated
        assert_eq!(backend.resolve_public_to_preview(text).await.unwrap(), preview);
        assert_eq!(fixture.previews.stats().live, 1);
    }

    #[tokio::test]
    async fn test_media_listing_degrades_and_replaces_previews() {
        let fixture = Fixture::new(MemoryForge::new());
        fixture.forge.seed("static/media/photo.png", vec![1u8, 2, 3]);
        fixture.forge.seed("static/media/broken.png", vec![4u8]);
        fixture.forge.break_blob("static/media/broken.png");
        let backend = fixture.active().await;

        let assets = backend.list_media_files().await.unwrap();
        assert_eq!(assets.len(), 2);
        let broken = assets.iter().find(|a| a.name == "broken.png").unwrap();
        assert_eq!(broken.preview, "/media/broken.png");
        assert_eq!(broken.preview, broken.public);
        let photo = assets.iter().find(|a| a.name == "photo.png").unwrap();
        assert_ne!(photo.preview, photo.public);
        assert!(fixture.previews.is_live(&photo.preview));
        assert_eq!(photo.date, sentinel_date());
        assert_eq!(photo.mime, "image/png");

        let again = backend.list_media_files().await.unwrap();
        let photo_again = again.iter().find(|a| a.name == "photo.png").unwrap();
        assert!(!fixture.previews.is_live(&photo.preview));
        assert!(fixture.previews.is_live(&photo_again.preview));
        let stats = fixture.previews.stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.revoked, 1);
        assert_eq!(stats.unknown_revocations, 0);
    }

    #[tokio::test]
    async fn test_upload_and_resolve_links() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("photo.png");
        fs::write(&source, [9u8, 9, 9]).unwrap();

        let fixture = Fixture::new(MemoryForge::new());
        let backend = fixture.active().await;
        fixture.picker.push_open(Some(source));

        let asset = backend.upload_media_file().await.unwrap();
        assert_eq!(asset.public, "/media/photo.png");
        assert!(fixture.previews.is_live(&asset.preview));
        assert_eq!(fixture.forge.commits()[0].headline, "Upload photo.png");
        assert_eq!(fixture.forge.file("static/media/photo.png").unwrap(), vec![9u8, 9, 9]);

        let text = "Look: ![photo](/media/photo.png) and [other](/media/other.png)";
        let preview = backend.resolve_public_to_preview(text).await.unwrap();
        assert!(preview.contains(&asset.preview));
        assert!(preview.contains("/media/other.png"));
        assert_eq!(backend.resolve_preview_to_public(&preview).await.unwrap(), text);

        // Deleting the asset releases its preview
        backend
            .delete_entries(&[Document::from(asset.clone())])
            .await
            .unwrap();
        assert!(!fixture.previews.is_live(&asset.preview));
    }

    #[tokio::test]
    async fn test_upload_cancelled() {
        let fixture = Fixture::new(MemoryForge::new());
        let backend = fixture.active().await;
        fixture.picker.push_open(None);
        assert!(matches!(
            backend.upload_media_file().await,
            Err(BackendError::Cancelled)
        ));
        assert!(fixture.forge.commits().is_empty());
    }

    #[tokio::test]
    async fn test_logout_forgets_token() {
        let fixture = Fixture::new(MemoryForge::new());
        let backend = fixture.active().await;
        backend.logout().await.unwrap();
        assert!(fixture.store.get(TOKEN_KEY).is_none());
        assert_eq!(backend.phase(), AuthPhase::Unauthenticated);
        assert!(matches!(
            backend.list_media_files().await,
            Err(BackendError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_retired_backend_rejects_operations() {
        let fixture = Fixture::new(MemoryForge::new());
        fixture.forge.seed("static/media/photo.png", vec![1u8]);
        let backend = fixture.active().await;
        let assets = backend.list_media_files().await.unwrap();

        backend.retire();
        assert!(!fixture.previews.is_live(&assets[0].preview));
        assert!(matches!(
            backend.list_entries("posts").await,
            Err(BackendError::Retired("github"))
        ));
    }
}
