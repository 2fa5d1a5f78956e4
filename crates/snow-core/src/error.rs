//! Backend error handling
//!
//! Every Backend Contract operation fails with a [`BackendError`]. The
//! variants separate "the backend is broken" from "there is nothing here":
//! an empty listing is `Ok(vec![])`, never an error.

use std::path::PathBuf;
use thiserror::Error;

/// Boxed error used as the `source` of wrapped failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced at the backend boundary
#[derive(Error, Debug)]
pub enum BackendError {
    /// A required configuration key is missing or malformed
    #[error("Configuration error: '{key}' {details}")]
    Configuration { key: String, details: String },

    /// OAuth state token mismatch; the stored token has been cleared
    #[error("Invalid auth state: the login response does not match this session. Log in again.")]
    AuthState,

    /// Token exchange or installation lookup failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Listing or reading failed
    #[error("Failed to retrieve {what}: {source}")]
    Retrieval {
        what: String,
        #[source]
        source: BoxError,
    },

    /// Saving failed; nothing was persisted
    #[error("Failed to save '{name}': {source}")]
    Persist {
        name: String,
        #[source]
        source: BoxError,
    },

    /// The file was written but the index write failed
    #[error("Saved '{path}' but failed to update the index: {source}")]
    IndexOutOfSync {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    /// Deleting failed
    #[error("Failed to delete {count} document(s): {source}")]
    Deletion {
        count: usize,
        #[source]
        source: BoxError,
    },

    /// Documents were logically deleted but some files could not be removed
    #[error("Deleted {} document(s) from the index but left orphaned files: {}", .paths.len(), display_paths(.paths))]
    Orphaned { paths: Vec<PathBuf> },

    /// Lookup failure while rewriting links
    #[error("Failed to resolve links: {source}")]
    LinkResolution {
        #[source]
        source: BoxError,
    },

    /// Stale revision token or branch tip
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No backend has been activated in the session yet
    #[error("No active backend")]
    NoActiveBackend,

    /// A local write was attempted before any site directory was indexed
    #[error("No site directory selected")]
    NoSiteDirectory,

    /// The backend was replaced by another one in the session
    #[error("Backend '{0}' has been replaced and no longer accepts operations")]
    Retired(&'static str),

    /// The user dismissed a file dialog
    #[error("Cancelled")]
    Cancelled,

    /// The backend does not provide this operation
    #[error("Operation '{0}' is not supported by this backend")]
    Unsupported(&'static str),
}

impl BackendError {
    pub fn retrieval(what: impl Into<String>, source: impl Into<BoxError>) -> Self {
        BackendError::Retrieval {
            what: what.into(),
            source: source.into(),
        }
    }

    pub fn persist(name: impl Into<String>, source: impl Into<BoxError>) -> Self {
        BackendError::Persist {
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn deletion(count: usize, source: impl Into<BoxError>) -> Self {
        BackendError::Deletion {
            count,
            source: source.into(),
        }
    }

    pub fn link_resolution(source: impl Into<BoxError>) -> Self {
        BackendError::LinkResolution {
            source: source.into(),
        }
    }

    /// Whether this error ends the current login attempt
    pub fn is_fatal_to_login(&self) -> bool {
        matches!(
            self,
            BackendError::AuthState | BackendError::Auth(_) | BackendError::Configuration { .. }
        )
    }

    /// Whether a save failed, including saves rejected for a stale tip or revision
    pub fn is_persist_failure(&self) -> bool {
        matches!(
            self,
            BackendError::Persist { .. }
                | BackendError::IndexOutOfSync { .. }
                | BackendError::Conflict(_)
        )
    }

    /// Whether the failure was caused by a concurrent writer
    pub fn is_conflict(&self) -> bool {
        match self {
            BackendError::Conflict(_) => true,
            BackendError::Persist { source, .. } | BackendError::Deletion { source, .. } => source
                .downcast_ref::<BackendError>()
                .is_some_and(|e| e.is_conflict()),
            _ => false,
        }
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            BackendError::Configuration { .. } => {
                Some("Check the [backend] section of the configuration file.")
            }
            BackendError::AuthState => Some("Start the login again from the beginning."),
            BackendError::IndexOutOfSync { .. } => {
                Some("The file is on disk. Select the directory again to re-index it.")
            }
            BackendError::Orphaned { .. } => {
                Some("Remove the listed files by hand; they are no longer tracked.")
            }
            _ if self.is_conflict() => {
                Some("Someone else changed the content. Reload and apply your edit again.")
            }
            BackendError::NoActiveBackend => Some("Log in or select a directory first."),
            BackendError::NoSiteDirectory => Some("Select the site directory to index it first."),
            _ => None,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_display_names_key() {
        let err = BackendError::Configuration {
            key: "backend.repo_folder".to_string(),
            details: "missing required value".to_string(),
        };
        assert!(err.to_string().contains("backend.repo_folder"));
        assert!(err.is_fatal_to_login());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_conflict_detected_through_persist_wrapper() {
        let err = BackendError::persist(
            "hello.md",
            BackendError::Conflict("branch tip moved".to_string()),
        );
        assert!(err.is_conflict());
        assert!(err.is_persist_failure());
        assert!(err.to_string().contains("hello.md"));
    }

    #[test]
    fn test_orphaned_display_lists_paths() {
        let err = BackendError::Orphaned {
            paths: vec![PathBuf::from("/site/a.md"), PathBuf::from("/site/b.md")],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 document(s)"));
        assert!(msg.contains("/site/a.md"));
        assert!(msg.contains("/site/b.md"));
    }

    #[test]
    fn test_auth_state_is_fatal() {
        assert!(BackendError::AuthState.is_fatal_to_login());
        assert!(!BackendError::NoActiveBackend.is_fatal_to_login());
    }
}
