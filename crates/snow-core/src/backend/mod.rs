//! Backend Contract
//!
//! Every storage implementation exposes the same operations through the
//! [`Backend`] trait, so callers never need to know whether documents live
//! in a local directory or a remote repository.
//!
//! An empty listing is `Ok(vec![])`. A failed listing is an error; callers
//! must never treat one as the other.

pub mod example;
pub mod github;
pub mod local;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;

use crate::config::Collection;
use crate::error::{BackendError, BackendResult};
use crate::models::{AssetDocument, ContentDocument, Document};

pub use example::ExampleBackend;
pub use github::{GitHubBackend, GitHubConnector};
pub use local::LocalBackend;

/// Submitted login form values, keyed by field name
pub type LoginForm = HashMap<String, String>;

/// Input type of a login form field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Email,
    Password,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginField {
    pub name: String,
    pub kind: FieldKind,
}

impl LoginField {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Describes the interactive login a backend needs before first use
///
/// The action to run with the submitted values is [`Backend::login`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginConfig {
    pub title: String,
    pub message: String,
    pub button: String,
    pub fields: Vec<LoginField>,
}

/// Result of [`Backend::initialize`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// The backend can serve requests and should be activated
    Ready,
    /// The user must complete the login form first
    LoginRequired(LoginConfig),
    /// The user must visit this URL to continue
    Redirect(String),
}

/// Result of [`Backend::login`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Ready,
    Redirect(String),
}

/// Counts from a directory scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub root: PathBuf,
    pub entries: usize,
    pub media: usize,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Registered name of this backend
    fn name(&self) -> &str;

    /// Prepare the backend. Backends with a [`login_config`](Backend::login_config)
    /// only return `Ready` once login has completed.
    async fn initialize(&self) -> BackendResult<InitOutcome>;

    /// Login form, for backends that need interactive setup
    fn login_config(&self) -> Option<LoginConfig> {
        None
    }

    /// Run the login action with submitted form values
    async fn login(&self, _form: LoginForm) -> BackendResult<LoginOutcome> {
        Err(BackendError::Unsupported("login"))
    }

    /// Forget any persisted credentials
    async fn logout(&self) -> BackendResult<()> {
        Ok(())
    }

    /// Choose and index a site directory
    async fn select_directory(&self) -> BackendResult<ScanReport> {
        Err(BackendError::Unsupported("select_directory"))
    }

    /// Entries of a collection, newest first
    async fn list_entries(&self, collection: &str) -> BackendResult<Vec<ContentDocument>>;

    /// Create or update an entry and return it with refreshed storage tokens
    async fn save_entry(
        &self,
        collection: &Collection,
        doc: ContentDocument,
    ) -> BackendResult<ContentDocument>;

    /// Remove documents and release their preview URLs
    async fn delete_entries(&self, docs: &[Document]) -> BackendResult<()>;

    async fn list_media_files(&self) -> BackendResult<Vec<AssetDocument>>;

    /// Ask for a file, store it in the media folder and return its asset
    async fn upload_media_file(&self) -> BackendResult<AssetDocument>;

    /// Replace known public asset URLs in link targets with preview URLs
    async fn resolve_public_to_preview(&self, text: &str) -> BackendResult<String>;

    /// Replace known preview asset URLs in link targets with public URLs
    async fn resolve_preview_to_public(&self, text: &str) -> BackendResult<String>;

    /// Stop serving requests and release held resources
    fn retire(&self) {}
}

/// Tracks whether a backend has been replaced in its session
#[derive(Debug, Default)]
pub struct Retirement {
    retired: AtomicBool,
}

impl Retirement {
    /// Mark retired. Returns `true` the first time.
    pub fn retire(&self) -> bool {
        !self.retired.swap(true, Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Fail with `Retired` once retired
    pub fn check(&self, name: &'static str) -> BackendResult<()> {
        if self.is_retired() {
            Err(BackendError::Retired(name))
        } else {
            Ok(())
        }
    }
}

/// Newest first
pub(crate) fn sort_by_date_desc(docs: &mut [ContentDocument]) {
    docs.sort_by(|a, b| b.date.cmp(&a.date));
}

/// Log a failure at the contract boundary and hand it back
pub(crate) fn log_failure(operation: &str, err: BackendError) -> BackendError {
    tracing::error!(operation, error = %err, "Backend operation failed");
    err
}
