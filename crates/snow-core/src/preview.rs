//! Session-scoped preview URLs
//!
//! A preview URL names bytes held in memory for the current session, the
//! way `blob:` object URLs do in a browser. Each URL is owned by a
//! [`PreviewLease`]; releasing or dropping the lease revokes the URL.
//! Revoking an unknown URL is logged and otherwise ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};
use uuid::Uuid;

const URL_PREFIX: &str = "blob:snow/";

#[derive(Debug, Default)]
struct Inner {
    blobs: HashMap<String, Blob>,
    created: u64,
    revoked: u64,
    unknown_revocations: u64,
}

#[derive(Debug, Clone)]
struct Blob {
    mime: String,
    bytes: Arc<Vec<u8>>,
}

/// Counters for diagnostics and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreviewStats {
    pub live: usize,
    pub created: u64,
    pub revoked: u64,
    pub unknown_revocations: u64,
}

/// Registry of live preview URLs, shared by all backends in a session
#[derive(Debug, Clone, Default)]
pub struct PreviewRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hold `bytes` in memory and return the lease owning their URL
    pub fn create(&self, mime: impl Into<String>, bytes: Vec<u8>) -> PreviewLease {
        let url = format!("{}{}", URL_PREFIX, Uuid::new_v4());
        let mut inner = self.lock();
        inner.blobs.insert(
            url.clone(),
            Blob {
                mime: mime.into(),
                bytes: Arc::new(bytes),
            },
        );
        inner.created += 1;
        debug!(%url, "Created preview URL");

        PreviewLease {
            url,
            registry: self.clone(),
            released: false,
        }
    }

    /// Revoke a URL. Returns `false` if it was not live.
    fn revoke(&self, url: &str) -> bool {
        let mut inner = self.lock();
        if inner.blobs.remove(url).is_some() {
            inner.revoked += 1;
            debug!(%url, "Revoked preview URL");
            true
        } else {
            inner.unknown_revocations += 1;
            warn!(%url, "Tried to revoke a preview URL that is not live");
            false
        }
    }

    /// MIME type and bytes behind a live URL
    pub fn get(&self, url: &str) -> Option<(String, Arc<Vec<u8>>)> {
        self.lock()
            .blobs
            .get(url)
            .map(|b| (b.mime.clone(), Arc::clone(&b.bytes)))
    }

    pub fn is_live(&self, url: &str) -> bool {
        self.lock().blobs.contains_key(url)
    }

    pub fn stats(&self) -> PreviewStats {
        let inner = self.lock();
        PreviewStats {
            live: inner.blobs.len(),
            created: inner.created,
            revoked: inner.revoked,
            unknown_revocations: inner.unknown_revocations,
        }
    }
}

/// Owns one preview URL until released
///
/// Not `Clone`: exactly one owner releases each URL.
#[derive(Debug)]
pub struct PreviewLease {
    url: String,
    registry: PreviewRegistry,
    released: bool,
}

impl PreviewLease {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Revoke the URL now
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.revoke(&self.url);
        }
    }
}

impl Drop for PreviewLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Leases keyed by the asset that owns them
///
/// Replacing or removing an entry releases the old lease exactly once.
#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: HashMap<String, PreviewLease>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a lease for `key`, releasing any lease it replaces
    pub fn insert(&mut self, key: impl Into<String>, lease: PreviewLease) {
        if let Some(old) = self.leases.insert(key.into(), lease) {
            old.release();
        }
    }

    /// Release the lease for `key`. Returns `false` if there was none.
    pub fn release(&mut self, key: &str) -> bool {
        match self.leases.remove(key) {
            Some(lease) => {
                lease.release();
                true
            }
            None => false,
        }
    }

    /// Release everything
    pub fn clear(&mut self) {
        for (_, lease) in self.leases.drain() {
            lease.release();
        }
    }

    /// URL held for `key`
    pub fn url(&self, key: &str) -> Option<&str> {
        self.leases.get(key).map(PreviewLease::url)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_release() {
        let registry = PreviewRegistry::new();
        let lease = registry.create("image/png", vec![1, 2, 3]);
        let url = lease.url().to_string();

        assert!(url.starts_with("blob:snow/"));
        let (mime, bytes) = registry.get(&url).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(*bytes, vec![1, 2, 3]);

        lease.release();
        assert!(!registry.is_live(&url));
        assert_eq!(
            registry.stats(),
            PreviewStats {
                live: 0,
                created: 1,
                revoked: 1,
                unknown_revocations: 0
            }
        );
    }

    #[test]
    fn test_drop_releases() {
        let registry = PreviewRegistry::new();
        {
            let _lease = registry.create("image/gif", Vec::new());
            assert_eq!(registry.stats().live, 1);
        }
        assert_eq!(registry.stats().live, 0);
        assert_eq!(registry.stats().revoked, 1);
    }

    #[test]
    fn test_urls_are_unique() {
        let registry = PreviewRegistry::new();
        let a = registry.create("image/png", vec![0]);
        let b = registry.create("image/png", vec![0]);
        assert_ne!(a.url(), b.url());
    }

    #[test]
    fn test_lease_table_replaces_and_releases_once() {
        let registry = PreviewRegistry::new();
        let mut table = LeaseTable::new();

        table.insert("a", registry.create("image/png", vec![1]));
        let first = table.url("a").unwrap().to_string();
        table.insert("a", registry.create("image/png", vec![2]));
        assert!(!registry.is_live(&first));
        assert_eq!(table.len(), 1);

        assert!(table.release("a"));
        assert!(!table.release("a"));

        let stats = registry.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.revoked, 2);
        assert_eq!(stats.unknown_revocations, 0);
        assert_eq!(stats.live, 0);
    }

    #[test]
    fn test_clear_releases_everything() {
        let registry = PreviewRegistry::new();
        let mut table = LeaseTable::new();
        table.insert("a", registry.create("image/png", vec![1]));
        table.insert("b", registry.create("image/png", vec![2]));

        table.clear();
        assert!(table.is_empty());
        assert_eq!(registry.stats().live, 0);
    }
}
