//! Snow Core Library
//!
//! This crate provides the storage side of Snow, a headless CMS for
//! static sites: content entries and media files served through a common
//! backend contract, whether they live in a local site directory or in a
//! GitHub repository.
//!
//! # Architecture
//!
//! - **Backends** implement [`Backend`]: list, save and delete entries,
//!   list and upload media, and rewrite links between public and preview URLs
//! - **Session** owns the active backend and publishes it to observers
//!
//! # Quick Start
//!
//! ```text
//! let session = Session::new(BackendRegistry::with_builtin(), picker, state_store);
//! session.load_config(Config::load()?);
//!
//! match session.start().await? {
//!     InitOutcome::Ready => {}
//!     InitOutcome::LoginRequired(form) => { /* show form, then submit_login */ }
//!     InitOutcome::Redirect(url) => { /* send the user to url */ }
//! }
//!
//! let posts = session.backend()?.list_entries("posts").await?;
//! ```
//!
//! # Modules
//!
//! - `backend`: Backend contract and the local, GitHub and example backends
//! - `models`: Content and asset documents
//! - `front_matter`: YAML front matter parsing and serialization
//! - `links`: Markdown link extraction and rewriting
//! - `preview`: Session-scoped preview URLs
//! - `registry`: Backend factories by name
//! - `session`: Active backend and CMS action hooks
//! - `config`: Application configuration

pub mod backend;
pub mod config;
pub mod error;
pub mod front_matter;
pub mod links;
pub mod models;
pub mod picker;
pub mod preview;
pub mod registry;
pub mod session;
pub mod state;

pub use backend::github::auth::CallbackParams;
pub use backend::{Backend, InitOutcome, LoginConfig, LoginForm, LoginOutcome, ScanReport};
pub use config::{Collection, Config};
pub use error::{BackendError, BackendResult};
pub use models::{AssetDocument, ContentDocument, Document, FileHandle};
pub use picker::FilePicker;
pub use preview::PreviewRegistry;
pub use registry::{BackendContext, BackendRegistry};
pub use session::{CmsActions, Session, SessionState};
pub use state::{FileStateStore, StateStore};
