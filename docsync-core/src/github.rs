//! GitHub REST implementation of [`SourceClient`].
//!
//! Endpoints used (all relative to `{api_base}/repos/{owner}/{repo}`):
//! - `GET /commits/{branch}`: head commit SHA
//! - `GET /git/trees/{ref}?recursive=1`: full blob listing, filtered client-side
//! - `GET /contents/{path}?ref={ref}`: base64 encoded blob
//! - `GET /compare/{base}...{head}`: per-file status with `previous_filename` for renames
//!
//! Every request carries the bearer token and is bounded by the configured
//! timeout. Nothing is retried or cached.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::GitHubConfig;
use crate::contract::{FileDiff, RenamedFile, SourceClient, TreeEntry};
use crate::error::{ConfigError, SourceError};

static REPO_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[a-zA-Z][a-zA-Z0-9+.-]*://(?:[^@/\s]+@)?[^/\s]+/|[^@/\s]+@[^:/\s]+:)([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)(?:\.git)?(?:/.*)?$",
    )
    .expect("repository URL pattern is valid")
});

/// Extract `(owner, repo)` from an HTTPS or SSH repository URL.
pub fn parse_repo_url(url: &str) -> Result<(String, String), ConfigError> {
    let caps = REPO_URL
        .captures(url.trim())
        .ok_or_else(|| ConfigError::MalformedRepoUrl(url.to_string()))?;
    let owner = caps[1].to_string();
    let repo = caps[2].to_string();
    if repo.is_empty() || repo == "." || repo == ".." {
        return Err(ConfigError::MalformedRepoUrl(url.to_string()));
    }
    Ok((owner, repo))
}

/// Maximum number of files GitHub returns for one compare.
const COMPARE_FILE_LIMIT: usize = 300;

pub struct GitHubClient {
    http: reqwest::Client,
    api_base: Url,
    token: String,
    extension: String,
}

impl GitHubClient {
    /// Build a client; refuses to start without a token.
    pub fn new(config: &GitHubConfig, extension: &str) -> Result<Self, ConfigError> {
        let token = config
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken)?
            .to_string();

        let api_base = Url::parse(&config.api_base).map_err(|e| {
            ConfigError::Invalid(format!("github.api_base '{}': {e}", config.api_base))
        })?;
        if api_base.cannot_be_a_base() {
            return Err(ConfigError::Invalid(format!(
                "github.api_base '{}' cannot carry a path",
                config.api_base
            )));
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static("2022-11-28"),
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {e}")))?;

        info!(
            api_base = %api_base,
            timeout_secs = config.timeout_secs,
            "Initialised GitHub source client"
        );
        Ok(Self {
            http,
            api_base,
            token,
            extension: extension.to_string(),
        })
    }

    fn endpoint(&self, owner: &str, repo: &str, segments: &[&str]) -> Result<Url, SourceError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::Transport(format!("bad API base {}", self.api_base)))?
            .pop_if_empty()
            .extend(["repos", owner, repo])
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, SourceError> {
        debug!(url = %url, "GitHub API request");
        let resp = self
            .http
            .get(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| {
                error!(error = ?e, url = %url, "GitHub request failed");
                SourceError::Transport(format!("{url}: {e}"))
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(status = %status, url = %url, body = %body, "GitHub API returned error");
            return Err(match status {
                StatusCode::NOT_FOUND => SourceError::NotFound(url.to_string()),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::Unauthorized {
                    status: status.as_u16(),
                    message: body,
                },
                _ => SourceError::Transport(format!("{status} from {url}")),
            });
        }

        let text = resp.text().await.map_err(|e| {
            error!(error = ?e, url = %url, "Failed to read GitHub response body");
            SourceError::Transport(format!("{url}: {e}"))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            error!(error = ?e, url = %url, "Failed to parse GitHub response JSON");
            SourceError::MalformedPayload(format!("{url}: {e}"))
        })
    }
}

#[async_trait]
impl SourceClient for GitHubClient {
    async fn latest_commit(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<String, SourceError> {
        let url = self.endpoint(owner, repo, &["commits", branch])?;
        let commit: CommitResponse = self.get_json(url).await?;
        if commit.sha.trim().is_empty() {
            return Err(SourceError::NotFound(format!(
                "no commit for {owner}/{repo}@{branch}"
            )));
        }
        info!(owner, repo, branch, sha = %commit.sha, "Resolved latest commit");
        Ok(commit.sha)
    }

    async fn tree(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<BTreeMap<String, TreeEntry>, SourceError> {
        let mut url = self.endpoint(owner, repo, &["git", "trees", reference])?;
        url.query_pairs_mut().append_pair("recursive", "1");
        let tree: TreeResponse = self.get_json(url).await?;
        ensure_complete_tree(&tree, owner, repo, reference)?;
        let entries = filter_tree(tree, path, &self.extension);
        info!(owner, repo, reference, files = entries.len(), "Listed repository tree");
        Ok(entries)
    }

    async fn content(
        &self,
        owner: &str,
        repo: &str,
        blob_path: &str,
        reference: &str,
    ) -> Result<Vec<u8>, SourceError> {
        let mut segments = vec!["contents"];
        segments.extend(blob_path.split('/').filter(|s| !s.is_empty()));
        let mut url = self.endpoint(owner, repo, &segments)?;
        url.query_pairs_mut().append_pair("ref", reference);
        let payload: ContentResponse = self.get_json(url).await?;
        decode_content(payload, blob_path)
    }

    async fn diff(
        &self,
        owner: &str,
        repo: &str,
        base_sha: &str,
        head_sha: &str,
        path: &str,
    ) -> Result<FileDiff, SourceError> {
        let range = format!("{base_sha}...{head_sha}");
        let url = self.endpoint(owner, repo, &["compare", range.as_str()])?;
        let compare: CompareResponse = self.get_json(url).await?;
        ensure_complete_compare(&compare, &range)?;
        let diff = classify_compare(compare.files, path, &self.extension);
        info!(
            owner,
            repo,
            base = base_sha,
            head = head_sha,
            added = diff.added.len(),
            modified = diff.modified.len(),
            removed = diff.removed.len(),
            renamed = diff.renamed.len(),
            "Compared commits"
        );
        Ok(diff)
    }
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompareResponse {
    #[serde(default)]
    files: Vec<CompareFile>,
}

#[derive(Debug, Deserialize)]
struct CompareFile {
    filename: String,
    status: String,
    #[serde(default)]
    previous_filename: Option<String>,
    #[serde(default)]
    sha: Option<String>,
}

/// A truncated tree would make every unlisted record look orphaned.
fn ensure_complete_tree(
    tree: &TreeResponse,
    owner: &str,
    repo: &str,
    reference: &str,
) -> Result<(), SourceError> {
    if tree.truncated {
        warn!(owner, repo, reference, "GitHub truncated the tree listing");
        return Err(SourceError::Truncated(format!(
            "tree of {owner}/{repo}@{reference} exceeds the API listing limit"
        )));
    }
    Ok(())
}

/// The compare endpoint lists at most [`COMPARE_FILE_LIMIT`] files.
fn ensure_complete_compare(compare: &CompareResponse, range: &str) -> Result<(), SourceError> {
    if compare.files.len() >= COMPARE_FILE_LIMIT {
        warn!(range, files = compare.files.len(), "Compare hit the file limit");
        return Err(SourceError::Truncated(format!(
            "compare {range} lists {} files, the API maximum",
            compare.files.len()
        )));
    }
    Ok(())
}

/// Strip `dir/` from `path`; `None` when the path lies outside `dir`.
fn relative_to<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    let dir = dir.trim_matches('/');
    if dir.is_empty() || dir == "." {
        return Some(path);
    }
    path.strip_prefix(dir)?.strip_prefix('/')
}

fn has_extension(path: &str, extension: &str) -> bool {
    path.to_ascii_lowercase()
        .ends_with(&extension.to_ascii_lowercase())
}

/// Relative document path for `path`, if it is a document under `dir`.
fn document_path(path: &str, dir: &str, extension: &str) -> Option<String> {
    relative_to(path, dir)
        .filter(|rel| !rel.is_empty() && has_extension(rel, extension))
        .map(str::to_string)
}

fn filter_tree(tree: TreeResponse, dir: &str, extension: &str) -> BTreeMap<String, TreeEntry> {
    tree.tree
        .into_iter()
        .filter(|item| item.kind == "blob")
        .filter_map(|item| {
            let rel = document_path(&item.path, dir, extension)?;
            Some((
                rel,
                TreeEntry {
                    blob_path: item.path,
                    content_hash: item.sha,
                    size: item.size.unwrap_or(0),
                },
            ))
        })
        .collect()
}

fn classify_compare(files: Vec<CompareFile>, dir: &str, extension: &str) -> FileDiff {
    let mut diff = FileDiff::default();
    for file in files {
        let current = document_path(&file.filename, dir, extension);
        if let (Some(path), Some(sha)) = (&current, &file.sha) {
            diff.blob_shas.insert(path.clone(), sha.clone());
        }
        match file.status.as_str() {
            "added" | "copied" => diff.added.extend(current),
            "modified" | "changed" => diff.modified.extend(current),
            "removed" => diff.removed.extend(current),
            "renamed" => {
                let previous = file
                    .previous_filename
                    .as_deref()
                    .and_then(|p| document_path(p, dir, extension));
                match (previous, current) {
                    (Some(previous), Some(new)) => diff.renamed.push(RenamedFile { previous, new }),
                    (None, Some(new)) => diff.added.push(new),
                    (Some(previous), None) => diff.removed.push(previous),
                    (None, None) => {}
                }
            }
            "unchanged" => {}
            other => {
                warn!(status = other, file = %file.filename, "Unknown compare status, ignoring");
            }
        }
    }
    diff
}

fn decode_content(payload: ContentResponse, blob_path: &str) -> Result<Vec<u8>, SourceError> {
    let encoding = payload.encoding.as_deref().unwrap_or("");
    if encoding != "base64" {
        return Err(SourceError::MalformedPayload(format!(
            "{blob_path}: unsupported content encoding '{encoding}'"
        )));
    }
    let content = payload
        .content
        .ok_or_else(|| SourceError::NotFound(format!("{blob_path}: empty content")))?;
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| SourceError::MalformedPayload(format!("{blob_path}: {e}")))
}
