//! Example backend
//!
//! Keeps everything in memory for the life of the process. Shows the
//! minimum a custom backend implements, including an interactive login
//! that must complete before the backend is ready.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::backend::{
    log_failure, sort_by_date_desc, Backend, FieldKind, InitOutcome, LoginConfig, LoginField,
    LoginForm, LoginOutcome, Retirement,
};
use crate::config::{Collection, Config};
use crate::error::{BackendError, BackendResult};
use crate::links;
use crate::models::{asset_mime, extension_of, AssetDocument, ContentDocument, Document};
use crate::picker::FilePicker;
use crate::preview::{LeaseTable, PreviewRegistry};

const NAME: &str = "example";

#[derive(Debug, Default)]
struct Store {
    entries: Vec<ContentDocument>,
    assets: Vec<AssetDocument>,
    /// Keyed by asset id
    leases: LeaseTable,
    next_id: u64,
}

impl Store {
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("example-{}", self.next_id)
    }
}

fn login_form() -> LoginConfig {
    LoginConfig {
        title: "Example Backend Enabled".to_string(),
        message: "This is an example login.".to_string(),
        button: "Log in".to_string(),
        fields: vec![
            LoginField::new("username", FieldKind::Text),
            LoginField::new("email", FieldKind::Email),
            LoginField::new("password", FieldKind::Password),
        ],
    }
}

/// In-memory backend behind a demonstration login form
pub struct ExampleBackend {
    config: Arc<Config>,
    picker: Arc<dyn FilePicker>,
    previews: PreviewRegistry,
    store: Mutex<Store>,
    logged_in: AtomicBool,
    retirement: Retirement,
}

impl ExampleBackend {
    pub fn new(
        config: Arc<Config>,
        picker: Arc<dyn FilePicker>,
        previews: PreviewRegistry,
    ) -> Self {
        Self {
            config,
            picker,
            previews,
            store: Mutex::new(Store::default()),
            logged_in: AtomicBool::new(false),
            retirement: Retirement::default(),
        }
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> BackendResult<()> {
        self.retirement.check(NAME)?;
        if self.logged_in.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Auth("log in to the example backend first".to_string()))
        }
    }

    fn rewrite(&self, text: &str, to_preview: bool) -> BackendResult<String> {
        let store = self.store();
        links::rewrite(text, |url| -> BackendResult<Option<String>> {
            Ok(store.assets.iter().find_map(|asset| match to_preview {
                true if asset.public == url => Some(asset.preview.clone()),
                false if asset.preview == url => Some(asset.public.clone()),
                _ => None,
            }))
        })
    }
}

#[async_trait]
impl Backend for ExampleBackend {
    fn name(&self) -> &str {
        NAME
    }

    async fn initialize(&self) -> BackendResult<InitOutcome> {
        self.retirement.check(NAME)?;
        if self.logged_in.load(Ordering::SeqCst) {
            return Ok(InitOutcome::Ready);
        }
        info!("Using example backend");
        Ok(InitOutcome::LoginRequired(login_form()))
    }

    fn login_config(&self) -> Option<LoginConfig> {
        Some(login_form())
    }

    async fn login(&self, form: LoginForm) -> BackendResult<LoginOutcome> {
        self.retirement.check(NAME)?;
        let mut keys: Vec<&str> = form.keys().map(String::as_str).collect();
        keys.sort_unstable();
        info!(fields = ?keys, "Example login submitted");
        self.logged_in.store(true, Ordering::SeqCst);
        Ok(LoginOutcome::Ready)
    }

    async fn logout(&self) -> BackendResult<()> {
        self.logged_in.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn list_entries(&self, collection: &str) -> BackendResult<Vec<ContentDocument>> {
        self.check()?;
        let mut docs: Vec<ContentDocument> = self
            .store()
            .entries
            .iter()
            .filter(|d| d.collection == collection)
            .cloned()
            .collect();
        sort_by_date_desc(&mut docs);
        Ok(docs)
    }

    async fn save_entry(
        &self,
        collection: &Collection,
        mut doc: ContentDocument,
    ) -> BackendResult<ContentDocument> {
        self.check()?;
        doc.prepare(collection)
            .map_err(|e| log_failure("save_entry", BackendError::persist(doc.name.clone(), e)))?;

        let mut store = self.store();
        if doc.id.is_none() {
            doc.id = Some(store.allocate_id());
        }
        store.entries.retain(|d| d.id != doc.id);
        store.entries.push(doc.clone());
        debug!(id = ?doc.id, name = %doc.name, "Saved entry");
        Ok(doc)
    }

    async fn delete_entries(&self, docs: &[Document]) -> BackendResult<()> {
        self.check()?;
        let ids: Vec<&str> = docs.iter().filter_map(Document::id).collect();

        let mut store = self.store();
        store
            .entries
            .retain(|d| !d.id.as_deref().is_some_and(|id| ids.contains(&id)));
        store
            .assets
            .retain(|a| !a.id.as_deref().is_some_and(|id| ids.contains(&id)));
        for id in &ids {
            store.leases.release(id);
        }
        debug!(count = ids.len(), "Deleted documents");
        Ok(())
    }

    async fn list_media_files(&self) -> BackendResult<Vec<AssetDocument>> {
        self.check()?;
        Ok(self.store().assets.clone())
    }

    async fn upload_media_file(&self) -> BackendResult<AssetDocument> {
        self.check()?;
        let file = self
            .picker
            .open_file()
            .await?
            .ok_or(BackendError::Cancelled)?;
        let name = file.name().unwrap_or("upload").to_string();
        let bytes = file
            .read_bytes()
            .await
            .map_err(|e| log_failure("upload_media_file", BackendError::persist(name.clone(), e)))?;

        let mime = asset_mime(&extension_of(&name));
        let lease = self.previews.create(mime, bytes);

        let mut store = self.store();
        let id = store.allocate_id();
        let asset = AssetDocument {
            id: Some(id.clone()),
            public: self.config.public_url(&name),
            preview: lease.url().to_string(),
            name,
            date: Utc::now(),
            path: self.config.media_folder.trim_matches('/').to_string(),
            mime: mime.to_string(),
            handle: Some(file),
            rev: None,
        };
        store.leases.insert(id, lease);
        store.assets.push(asset.clone());
        Ok(asset)
    }

    async fn resolve_public_to_preview(&self, text: &str) -> BackendResult<String> {
        self.retirement.check(NAME)?;
        self.rewrite(text, true)
    }

    async fn resolve_preview_to_public(&self, text: &str) -> BackendResult<String> {
        self.retirement.check(NAME)?;
        self.rewrite(text, false)
    }

    fn retire(&self) {
        if self.retirement.retire() {
            self.store().leases.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front_matter::Fields;
    use crate::picker::ScriptedPicker;
    use std::fs;
    use tempfile::TempDir;

    fn backend(picker: Arc<ScriptedPicker>, previews: PreviewRegistry) -> ExampleBackend {
        ExampleBackend::new(Arc::new(Config::default()), picker, previews)
    }

    fn entry(title: &str, date: &str) -> ContentDocument {
        let fields: Fields =
            serde_yaml::from_str(&format!("title: {}\ndate: {}", title, date)).unwrap();
        ContentDocument::from_form(&Collection::new("posts", "content/posts"), fields).unwrap()
    }

    #[tokio::test]
    async fn test_requires_login() {
        let backend = backend(Arc::new(ScriptedPicker::new()), PreviewRegistry::new());

        match backend.initialize().await.unwrap() {
            InitOutcome::LoginRequired(config) => {
                assert_eq!(config.title, "Example Backend Enabled");
                let fields: Vec<_> = config
                    .fields
                    .iter()
                    .map(|f| (f.name.as_str(), f.kind))
                    .collect();
                assert_eq!(
                    fields,
                    vec![
                        ("username", FieldKind::Text),
                        ("email", FieldKind::Email),
                        ("password", FieldKind::Password),
                    ]
                );
            }
            other => panic!("expected login form, got {:?}", other),
        }
        assert!(matches!(backend.list_entries("posts").await, Err(BackendError::Auth(_))));

        let mut form = LoginForm::new();
        form.insert("username".to_string(), "ada".to_string());
        assert_eq!(backend.login(form).await.unwrap(), LoginOutcome::Ready);
        assert_eq!(backend.initialize().await.unwrap(), InitOutcome::Ready);
        assert!(backend.list_entries("posts").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_list_delete() {
        let backend = backend(Arc::new(ScriptedPicker::new()), PreviewRegistry::new());
        backend.login(LoginForm::new()).await.unwrap();
        let posts = Collection::new("posts", "content/posts");

        let old = backend.save_entry(&posts, entry("Old", "2023-01-01")).await.unwrap();
        let new = backend.save_entry(&posts, entry("New", "2024-01-01")).await.unwrap();
        assert_ne!(old.id, new.id);

        // Saving again with the same id replaces
        let again = backend.save_entry(&posts, new.clone()).await.unwrap();
        assert_eq!(again.id, new.id);

        let listed = backend.list_entries("posts").await.unwrap();
        let titles: Vec<_> = listed.iter().filter_map(|d| d.title()).collect();
        assert_eq!(titles, vec!["New", "Old"]);

        backend.delete_entries(&[Document::from(old)]).await.unwrap();
        assert_eq!(backend.list_entries("posts").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_resolve_and_delete_twice() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cat.gif");
        fs::write(&path, b"GIF89a").unwrap();

        let picker = Arc::new(ScriptedPicker::new());
        picker.push_open(Some(path));
        let previews = PreviewRegistry::new();
        let backend = backend(picker, previews.clone());
        backend.login(LoginForm::new()).await.unwrap();

        let asset = backend.upload_media_file().await.unwrap();
        assert_eq!(asset.public, "/media/cat.gif");
        assert_eq!(asset.mime, "image/gif");

        let text = "![cat](/media/cat.gif)";
        let preview = backend.resolve_public_to_preview(text).await.unwrap();
        assert_eq!(preview, format!("![cat]({})", asset.preview));
        assert_eq!(backend.resolve_preview_to_public(&preview).await.unwrap(), text);

        let docs = vec![Document::from(asset.clone())];
        backend.delete_entries(&docs).await.unwrap();
        backend.delete_entries(&docs).await.unwrap();
        assert!(!previews.is_live(&asset.preview));
        let stats = previews.stats();
        assert_eq!(stats.revoked, 1);
        assert_eq!(stats.unknown_revocations, 0);
        assert!(backend.list_media_files().await.unwrap().is_empty());
    }
}
