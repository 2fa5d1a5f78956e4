//! GitHub API client
//!
//! Reads go through the GraphQL API (tree listings, branch tips) and the
//! REST API (blobs, installations). Writes are a single
//! `createCommitOnBranch` mutation conditioned on the expected branch tip.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::BackendConfig;
use crate::error::BackendError;

const API_ROOT: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("snow-cms/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Branch '{branch}' moved: expected tip {expected}")]
    StaleHead { branch: String, expected: String },

    #[error("GitHub API error: {0}")]
    Api(String),

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Invalid blob content: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// Kind of a tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Blob,
    Tree,
    #[serde(other)]
    Other,
}

/// One entry of a repository folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Global node id
    pub id: String,
    /// Git object id
    pub oid: String,
    /// Text of the blob, when it is valid UTF-8
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAddition {
    pub path: String,
    pub contents: Vec<u8>,
}

/// Files to add or replace and paths to delete, committed together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub additions: Vec<FileAddition>,
    pub deletions: Vec<String>,
}

impl ChangeSet {
    pub fn add(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            additions: vec![FileAddition {
                path: path.into(),
                contents: contents.into(),
            }],
            deletions: Vec::new(),
        }
    }

    pub fn delete(paths: Vec<String>) -> Self {
        Self {
            additions: Vec::new(),
            deletions: paths,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Installation {
    pub app_slug: String,
}

/// Operations against one repository, as one authenticated user
#[async_trait]
pub trait ForgeApi: Send + Sync {
    /// Entries of `path` at `branch`. A missing folder is empty.
    async fn list_tree(&self, branch: &str, path: &str) -> Result<Vec<TreeEntry>, ForgeError>;

    /// Decoded bytes of a blob
    async fn get_blob(&self, oid: &str) -> Result<Vec<u8>, ForgeError>;

    /// Commit id at the tip of `branch`
    async fn branch_tip(&self, branch: &str) -> Result<String, ForgeError>;

    /// Commit `changes` on `branch` if its tip is still `expected_head`.
    /// Returns the new commit id.
    async fn create_commit(
        &self,
        branch: &str,
        headline: &str,
        expected_head: &str,
        changes: &ChangeSet,
    ) -> Result<String, ForgeError>;

    /// App installations visible to the user
    async fn list_installations(&self) -> Result<Vec<Installation>, ForgeError>;
}

/// Turns OAuth codes into tokens and tokens into API clients
#[async_trait]
pub trait ForgeConnector: Send + Sync {
    async fn exchange_code(&self, code: &str) -> Result<String, ForgeError>;

    fn connect(&self, token: &str) -> Result<Arc<dyn ForgeApi>, ForgeError>;
}

// ==================== Wire types ====================

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct RepositoryData<T> {
    repository: Option<T>,
}

#[derive(Deserialize)]
struct TreeRepository {
    object: Option<TreeObject>,
}

#[derive(Deserialize)]
struct TreeObject {
    #[serde(default)]
    entries: Vec<WireEntry>,
}

#[derive(Deserialize)]
struct WireEntry {
    name: String,
    #[serde(rename = "type")]
    kind: EntryKind,
    object: Option<WireObject>,
}

#[derive(Deserialize)]
struct WireObject {
    id: String,
    oid: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct RefRepository {
    #[serde(rename = "ref")]
    reference: Option<RefTarget>,
}

#[derive(Deserialize)]
struct RefTarget {
    target: Oid,
}

#[derive(Deserialize)]
struct Oid {
    oid: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitData {
    create_commit_on_branch: Option<CommitPayload>,
}

#[derive(Deserialize)]
struct CommitPayload {
    commit: Oid,
}

#[derive(Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

#[derive(Deserialize)]
struct InstallationsResponse {
    #[serde(default)]
    installations: Vec<Installation>,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    code: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    authentication: Option<Authentication>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct Authentication {
    token: String,
}

const TREE_QUERY: &str = r#"
query ($owner: String!, $name: String!, $expression: String!) {
  repository(owner: $owner, name: $name) {
    object(expression: $expression) {
      ... on Tree {
        entries {
          name
          type
          object {
            id
            oid
            ... on Blob { text }
          }
        }
      }
    }
  }
}
"#;

const REF_QUERY: &str = r#"
query ($owner: String!, $name: String!, $qualifiedName: String!) {
  repository(owner: $owner, name: $name) {
    ref(qualifiedName: $qualifiedName) {
      target { oid }
    }
  }
}
"#;

const COMMIT_MUTATION: &str = r#"
mutation ($input: CreateCommitOnBranchInput!) {
  createCommitOnBranch(input: $input) {
    commit { oid }
  }
}
"#;

/// GitHub reports a stale `expectedHeadOid` with this message
fn is_stale_head(message: &str) -> bool {
    message.contains("Expected branch to point to")
}

fn http_client(timeout_secs: u64) -> Result<Client, ForgeError> {
    Ok(Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

// ==================== Client ====================

/// Authenticated client for one repository
pub struct GitHubClient {
    http: Client,
    token: String,
    owner: String,
    repo: String,
    api_root: String,
}

impl GitHubClient {
    pub fn new(
        token: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self, ForgeError> {
        Ok(Self {
            http: http_client(timeout_secs)?,
            token: token.into(),
            owner: owner.into(),
            repo: repo.into(),
            api_root: API_ROOT.to_string(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<T, ForgeError> {
        let response: GraphQlResponse<T> = self
            .authorized(self.http.post(format!("{}/graphql", self.api_root)))
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.errors.into_iter().next() {
            return Err(ForgeError::Api(error.message));
        }
        response
            .data
            .ok_or_else(|| ForgeError::Api("response carried no data".to_string()))
    }

    async fn rest<T: DeserializeOwned>(&self, path: &str) -> Result<T, ForgeError> {
        Ok(self
            .authorized(self.http.get(format!("{}{}", self.api_root, path)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

#[async_trait]
impl ForgeApi for GitHubClient {
    async fn list_tree(&self, branch: &str, path: &str) -> Result<Vec<TreeEntry>, ForgeError> {
        let expression = format!("{}:{}", branch, path.trim_matches('/'));
        debug!(%expression, "Listing repository tree");

        let data: RepositoryData<TreeRepository> = self
            .graphql(
                TREE_QUERY,
                json!({ "owner": self.owner, "name": self.repo, "expression": expression }),
            )
            .await?;

        let repository = data.repository.ok_or_else(|| {
            ForgeError::Api(format!("repository {}/{} not found", self.owner, self.repo))
        })?;

        Ok(repository
            .object
            .map(|tree| tree.entries)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| {
                let object = entry.object?;
                Some(TreeEntry {
                    name: entry.name,
                    kind: entry.kind,
                    id: object.id,
                    oid: object.oid,
                    text: object.text,
                })
            })
            .collect())
    }

    async fn get_blob(&self, oid: &str) -> Result<Vec<u8>, ForgeError> {
        let blob: BlobResponse = self
            .rest(&format!("/repos/{}/{}/git/blobs/{}", self.owner, self.repo, oid))
            .await?;

        if blob.encoding == "base64" {
            let compact: String = blob.content.split_whitespace().collect();
            Ok(BASE64.decode(compact)?)
        } else {
            Ok(blob.content.into_bytes())
        }
    }

    async fn branch_tip(&self, branch: &str) -> Result<String, ForgeError> {
        let data: RepositoryData<RefRepository> = self
            .graphql(
                REF_QUERY,
                json!({
                    "owner": self.owner,
                    "name": self.repo,
                    "qualifiedName": format!("refs/heads/{}", branch),
                }),
            )
            .await?;

        data.repository
            .and_then(|r| r.reference)
            .map(|r| r.target.oid)
            .ok_or_else(|| ForgeError::Api(format!("branch '{}' not found", branch)))
    }

    async fn create_commit(
        &self,
        branch: &str,
        headline: &str,
        expected_head: &str,
        changes: &ChangeSet,
    ) -> Result<String, ForgeError> {
        let additions: Vec<Value> = changes
            .additions
            .iter()
            .map(|a| json!({ "path": a.path, "contents": BASE64.encode(&a.contents) }))
            .collect();
        let deletions: Vec<Value> = changes
            .deletions
            .iter()
            .map(|path| json!({ "path": path }))
            .collect();

        let input = json!({
            "branch": {
                "repositoryNameWithOwner": format!("{}/{}", self.owner, self.repo),
                "branchName": branch,
            },
            "message": { "headline": headline },
            "expectedHeadOid": expected_head,
            "fileChanges": { "additions": additions, "deletions": deletions },
        });

        let data: CommitData = match self
            .graphql(COMMIT_MUTATION, json!({ "input": input }))
            .await
        {
            Ok(data) => data,
            Err(ForgeError::Api(message)) if is_stale_head(&message) => {
                return Err(ForgeError::StaleHead {
                    branch: branch.to_string(),
                    expected: expected_head.to_string(),
                })
            }
            Err(e) => return Err(e),
        };

        data.create_commit_on_branch
            .map(|payload| payload.commit.oid)
            .ok_or_else(|| ForgeError::Api("commit was not created".to_string()))
    }

    async fn list_installations(&self) -> Result<Vec<Installation>, ForgeError> {
        let response: InstallationsResponse = self.rest("/user/installations").await?;
        Ok(response.installations)
    }
}

// ==================== Connector ====================

/// Exchanges codes through the configured token endpoint
pub struct GitHubConnector {
    http: Client,
    token_url: Url,
    owner: String,
    repo: String,
    timeout_secs: u64,
}

impl GitHubConnector {
    /// Build from the `[backend]` section
    ///
    /// The token endpoint is `api_root + auth_endpoint`; without an
    /// `api_root` the origin of `redirect_uri` is used.
    pub fn from_config(backend: &BackendConfig) -> Result<Self, BackendError> {
        let (owner, repo) = backend.repo_parts()?;

        let api_root = match backend.api_root.as_deref() {
            Some(root) if !root.trim().is_empty() => root.trim_end_matches('/').to_string(),
            _ => {
                let url =
                    Url::parse(&backend.redirect_uri).map_err(|e| BackendError::Configuration {
                        key: "backend.redirect_uri".to_string(),
                        details: e.to_string(),
                    })?;
                url.origin().ascii_serialization()
            }
        };

        let token_url = Url::parse(&format!("{}{}", api_root, backend.auth_endpoint)).map_err(|e| {
            BackendError::Configuration {
                key: "backend.api_root".to_string(),
                details: e.to_string(),
            }
        })?;

        let http = http_client(backend.timeout_secs).map_err(|e| BackendError::Configuration {
            key: "backend.timeout_secs".to_string(),
            details: e.to_string(),
        })?;

        Ok(Self {
            http,
            token_url,
            owner,
            repo,
            timeout_secs: backend.timeout_secs,
        })
    }

    pub fn token_url(&self) -> &Url {
        &self.token_url
    }
}

#[async_trait]
impl ForgeConnector for GitHubConnector {
    async fn exchange_code(&self, code: &str) -> Result<String, ForgeError> {
        let response = self
            .http
            .post(self.token_url.clone())
            .json(&TokenRequest { code })
            .send()
            .await?;

        let ok = response.status().is_success();
        let body: TokenResponse = response.json().await?;

        match (ok, body.authentication, body.error) {
            (true, Some(auth), _) => Ok(auth.token),
            (_, _, Some(error)) => Err(ForgeError::TokenExchange(error)),
            _ => Err(ForgeError::TokenExchange("Token error".to_string())),
        }
    }

    fn connect(&self, token: &str) -> Result<Arc<dyn ForgeApi>, ForgeError> {
        Ok(Arc::new(GitHubClient::new(
            token,
            self.owner.clone(),
            self.repo.clone(),
            self.timeout_secs,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(api_root: Option<&str>) -> BackendConfig {
        BackendConfig {
            repo: Some("octo/site".to_string()),
            api_root: api_root.map(str::to_string),
            ..BackendConfig::default()
        }
    }

    #[test]
    fn test_token_url_from_api_root() {
        let connector =
            GitHubConnector::from_config(&backend(Some("https://cms.example.com/"))).unwrap();
        assert_eq!(
            connector.token_url().as_str(),
            "https://cms.example.com/api/github/oauth/token"
        );
    }

    #[test]
    fn test_token_url_defaults_to_redirect_origin() {
        let connector = GitHubConnector::from_config(&backend(None)).unwrap();
        assert_eq!(
            connector.token_url().as_str(),
            "http://localhost:5173/api/github/oauth/token"
        );
    }

    #[test]
    fn test_connector_requires_repo() {
        let config = BackendConfig::default();
        assert!(matches!(
            GitHubConnector::from_config(&config),
            Err(BackendError::Configuration { .. })
        ));
    }

    #[test]
    fn test_tree_response_parsing() {
        let body = r#"{
            "data": {
                "repository": {
                    "object": {
                        "entries": [
                            {"name": "hello.md", "type": "blob", "object": {"id": "B_1", "oid": "abc", "text": "---\ntitle: Hi\n---\n\nx"}},
                            {"name": "img", "type": "tree", "object": {"id": "T_1", "oid": "def"}},
                            {"name": "link", "type": "commit", "object": {"id": "C_1", "oid": "123"}}
                        ]
                    }
                }
            }
        }"#;
        let response: GraphQlResponse<RepositoryData<TreeRepository>> =
            serde_json::from_str(body).unwrap();
        let entries = response.data.unwrap().repository.unwrap().object.unwrap().entries;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, EntryKind::Blob);
        assert_eq!(entries[1].kind, EntryKind::Tree);
        assert_eq!(entries[2].kind, EntryKind::Other);
        assert!(entries[1].object.as_ref().unwrap().text.is_none());
    }

    #[test]
    fn test_missing_tree_is_null_object() {
        let body = r#"{"data": {"repository": {"object": null}}}"#;
        let response: GraphQlResponse<RepositoryData<TreeRepository>> =
            serde_json::from_str(body).unwrap();
        assert!(response.data.unwrap().repository.unwrap().object.is_none());
    }

    #[test]
    fn test_stale_head_detection() {
        assert!(is_stale_head(
            "Expected branch to point to \"abc\" but it did not. Pull and try again."
        ));
        assert!(!is_stale_head("Something else"));
    }

    #[test]
    fn test_token_response_shapes() {
        let ok: TokenResponse =
            serde_json::from_str(r#"{"authentication": {"token": "gho_1"}}"#).unwrap();
        assert_eq!(ok.authentication.unwrap().token, "gho_1");

        let err: TokenResponse =
            serde_json::from_str(r#"{"error": "bad_verification_code"}"#).unwrap();
        assert_eq!(err.error.as_deref(), Some("bad_verification_code"));
    }
}
