//! In-memory forge
//!
//! A single-branch repository held in memory, implementing both
//! [`ForgeApi`] and [`ForgeConnector`]. Commits are checked against the
//! expected tip exactly like the real API.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Barrier;

use super::api::{
    ChangeSet, EntryKind, ForgeApi, ForgeConnector, ForgeError, Installation, TreeEntry,
};

/// A recorded commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub oid: String,
    pub headline: String,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
}

#[derive(Debug, Clone)]
struct Blob {
    oid: String,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct ForgeState {
    head: String,
    files: BTreeMap<String, Blob>,
    commits: Vec<Commit>,
    installations: Vec<String>,
    codes: HashMap<String, String>,
    broken_blobs: HashSet<String>,
    next_object: u64,
}

impl ForgeState {
    fn next_oid(&mut self, prefix: &str) -> String {
        self.next_object += 1;
        format!("{}{:08x}", prefix, self.next_object)
    }
}

/// Shared handle to an in-memory repository
#[derive(Clone)]
pub struct MemoryForge {
    state: Arc<Mutex<ForgeState>>,
    tip_barrier: Option<Arc<Barrier>>,
}

impl Default for MemoryForge {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryForge {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ForgeState {
                head: "c00000000".to_string(),
                ..ForgeState::default()
            })),
            tip_barrier: None,
        }
    }

    /// Make `parties` concurrent `branch_tip` calls wait for each other
    /// after reading the tip
    pub fn with_tip_barrier(mut self, parties: usize) -> Self {
        self.tip_barrier = Some(Arc::new(Barrier::new(parties)));
        self
    }

    fn state(&self) -> MutexGuard<'_, ForgeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Put a file on the branch without recording a commit
    pub fn seed(&self, path: &str, contents: impl Into<Vec<u8>>) {
        let mut state = self.state();
        let oid = state.next_oid("b");
        state.files.insert(
            path.to_string(),
            Blob {
                oid,
                bytes: contents.into(),
            },
        );
    }

    pub fn install_app(&self, slug: &str) {
        self.state().installations.push(slug.to_string());
    }

    /// Accept `code` in exchange for `token`
    pub fn grant(&self, code: &str, token: &str) {
        self.state().codes.insert(code.to_string(), token.to_string());
    }

    /// Make blob reads for `path` fail
    pub fn break_blob(&self, path: &str) {
        let mut state = self.state();
        if let Some(oid) = state.files.get(path).map(|b| b.oid.clone()) {
            state.broken_blobs.insert(oid);
        }
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).map(|b| b.bytes.clone())
    }

    pub fn commits(&self) -> Vec<Commit> {
        self.state().commits.clone()
    }

    pub fn head(&self) -> String {
        self.state().head.clone()
    }
}

fn parent_and_name(path: &str) -> (&str, &str) {
    path.rsplit_once('/').unwrap_or(("", path))
}

#[async_trait]
impl ForgeApi for MemoryForge {
    async fn list_tree(&self, _branch: &str, path: &str) -> Result<Vec<TreeEntry>, ForgeError> {
        let folder = path.trim_matches('/');
        let state = self.state();

        let mut entries = Vec::new();
        let mut subtrees = HashSet::new();
        for (file, blob) in &state.files {
            let (parent, name) = parent_and_name(file);
            if parent == folder {
                entries.push(TreeEntry {
                    name: name.to_string(),
                    kind: EntryKind::Blob,
                    id: format!("B_{}", blob.oid),
                    oid: blob.oid.clone(),
                    text: String::from_utf8(blob.bytes.clone()).ok(),
                });
            } else if let Some(rest) = parent
                .strip_prefix(folder)
                .and_then(|r| r.strip_prefix('/'))
            {
                let child = rest.split('/').next().unwrap_or(rest);
                if subtrees.insert(child.to_string()) {
                    entries.push(TreeEntry {
                        name: child.to_string(),
                        kind: EntryKind::Tree,
                        id: format!("T_{}/{}", folder, child),
                        oid: format!("t{}/{}", folder, child),
                        text: None,
                    });
                }
            }
        }
        Ok(entries)
    }

    async fn get_blob(&self, oid: &str) -> Result<Vec<u8>, ForgeError> {
        let state = self.state();
        if state.broken_blobs.contains(oid) {
            return Err(ForgeError::Api(format!("blob {} unavailable", oid)));
        }
        state
            .files
            .values()
            .find(|b| b.oid == oid)
            .map(|b| b.bytes.clone())
            .ok_or_else(|| ForgeError::Api(format!("blob {} not found", oid)))
    }

    async fn branch_tip(&self, _branch: &str) -> Result<String, ForgeError> {
        let tip = self.head();
        if let Some(barrier) = &self.tip_barrier {
            barrier.wait().await;
        }
        Ok(tip)
    }

    async fn create_commit(
        &self,
        branch: &str,
        headline: &str,
        expected_head: &str,
        changes: &ChangeSet,
    ) -> Result<String, ForgeError> {
        let mut state = self.state();
        if state.head != expected_head {
            return Err(ForgeError::StaleHead {
                branch: branch.to_string(),
                expected: expected_head.to_string(),
            });
        }
        if let Some(missing) = changes.deletions.iter().find(|p| !state.files.contains_key(*p)) {
            return Err(ForgeError::Api(format!(
                "A path was requested for deletion which does not exist: {}",
                missing
            )));
        }

        for path in &changes.deletions {
            state.files.remove(path);
        }
        for addition in &changes.additions {
            let oid = state.next_oid("b");
            state.files.insert(
                addition.path.clone(),
                Blob {
                    oid,
                    bytes: addition.contents.clone(),
                },
            );
        }

        let oid = state.next_oid("c");
        state.head = oid.clone();
        state.commits.push(Commit {
            oid: oid.clone(),
            headline: headline.to_string(),
            added: changes.additions.iter().map(|a| a.path.clone()).collect(),
            deleted: changes.deletions.clone(),
        });
        Ok(oid)
    }

    async fn list_installations(&self) -> Result<Vec<Installation>, ForgeError> {
        Ok(self
            .state()
            .installations
            .iter()
            .map(|slug| Installation {
                app_slug: slug.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl ForgeConnector for MemoryForge {
    async fn exchange_code(&self, code: &str) -> Result<String, ForgeError> {
        self.state()
            .codes
            .remove(code)
            .ok_or_else(|| ForgeError::TokenExchange("bad_verification_code".to_string()))
    }

    fn connect(&self, _token: &str) -> Result<Arc<dyn ForgeApi>, ForgeError> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_tree_shows_direct_children() {
        let forge = MemoryForge::new();
        forge.seed("content/posts/a.md", "a");
        forge.seed("content/posts/2024/b.md", "b");
        forge.seed("content/pages/c.md", "c");

        let entries = forge.list_tree("main", "content/posts").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.kind)).collect();
        assert_eq!(names, vec![("2024", EntryKind::Tree), ("a.md", EntryKind::Blob)]);
        assert_eq!(entries[1].text.as_deref(), Some("a"));

        assert!(forge.list_tree("main", "missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_requires_current_tip() {
        let forge = MemoryForge::new();
        let tip = forge.branch_tip("main").await.unwrap();

        let first = forge
            .create_commit("main", "Update a.md", &tip, &ChangeSet::add("a.md", "1"))
            .await
            .unwrap();
        assert_eq!(forge.head(), first);

        let stale = forge
            .create_commit("main", "Update a.md", &tip, &ChangeSet::add("a.md", "2"))
            .await;
        assert!(matches!(stale, Err(ForgeError::StaleHead { .. })));
        assert_eq!(forge.file("a.md").unwrap(), b"1");
        assert_eq!(forge.commits().len(), 1);
    }

    #[tokio::test]
    async fn test_code_is_single_use() {
        let forge = MemoryForge::new();
        forge.grant("code-1", "token-1");
        assert_eq!(forge.exchange_code("code-1").await.unwrap(), "token-1");
        assert!(forge.exchange_code("code-1").await.is_err());
    }
}
