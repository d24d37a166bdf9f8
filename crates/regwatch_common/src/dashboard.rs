//! Dashboard API Client
//!
//! Fetches JSON documents from the KernelCI dashboard REST API with a flat
//! on-disk cache in front: one file per distinct request URL, keyed by the
//! SHA-256 of the full URL. Cache entries never expire; a caller-side
//! policy decides when a fresh fetch is required (summaries for commits
//! younger than three hours are always refetched).

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;
use tracing::{debug, error};

/// Commits younger than this always bypass the cache: their results are
/// still in flux on the dashboard side.
const SUMMARY_FRESHNESS_HOURS: i64 = 3;

/// Dashboard client errors
#[derive(Debug, thiserror::Error)]
pub enum DashboardError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Non-JSON response: {0}")]
    Parse(String),

    #[error("Cache error: {0}")]
    Cache(String),
}

/// Dashboard API client with URL-keyed disk cache
pub struct DashboardClient {
    base_url: reqwest::Url,
    cache_dir: PathBuf,
    http: reqwest::blocking::Client,
}

/// Hashed cache file name for a request URL
fn cache_file_name(url: &str) -> String {
    format!("{}.json", hex::encode(Sha256::digest(url.as_bytes())))
}

/// Whether a summary for a commit of the given age may be served from cache
pub fn summary_cache_allowed(commit_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    commit_time <= now - Duration::hours(SUMMARY_FRESHNESS_HOURS)
}

impl DashboardClient {
    /// Create a client for `base_url`, caching under `cache_dir`
    pub fn new(base_url: &str, cache_dir: &Path) -> Result<Self, DashboardError> {
        let base_url = reqwest::Url::parse(base_url)
            .map_err(|e| DashboardError::Network(format!("Invalid base URL '{base_url}': {e}")))?;

        fs::create_dir_all(cache_dir).map_err(|e| {
            DashboardError::Cache(format!(
                "Failed to create cache dir {}: {e}",
                cache_dir.display()
            ))
        })?;

        let http = reqwest::blocking::Client::builder()
            .timeout(StdDuration::from_secs(30))
            .user_agent(concat!("regwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DashboardError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            cache_dir: cache_dir.to_path_buf(),
            http,
        })
    }

    fn cache_path(&self, url: &str) -> PathBuf {
        self.cache_dir.join(cache_file_name(url))
    }

    /// Store a document under its request URL (last writer wins)
    pub fn cache_store(&self, url: &str, doc: &Value) -> Result<(), DashboardError> {
        let path = self.cache_path(url);
        let body = serde_json::to_string_pretty(doc)
            .map_err(|e| DashboardError::Cache(format!("Failed to serialize document: {e}")))?;
        fs::write(&path, body)
            .map_err(|e| DashboardError::Cache(format!("Failed to write {}: {e}", path.display())))
    }

    /// Retrieve a cached document; `None` means absent, not an error
    pub fn cache_retrieve(&self, url: &str) -> Result<Option<Value>, DashboardError> {
        let path = self.cache_path(url);
        if !path.exists() {
            return Ok(None);
        }

        let body = fs::read_to_string(&path)
            .map_err(|e| DashboardError::Cache(format!("Failed to read {}: {e}", path.display())))?;
        let doc = serde_json::from_str(&body).map_err(|e| {
            DashboardError::Cache(format!("Corrupt cache entry {}: {e}", path.display()))
        })?;
        Ok(Some(doc))
    }

    /// Fetch a JSON document from `endpoint` with query `params`.
    ///
    /// With `use_cache`, a previously stored response for the same full URL
    /// is returned without touching the network. Misses (and `use_cache =
    /// false`) fetch and overwrite the cache entry.
    pub fn fetch(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        use_cache: bool,
    ) -> Result<Value, DashboardError> {
        let mut url = self.base_url.join(endpoint).map_err(|e| {
            DashboardError::Network(format!("Invalid endpoint '{endpoint}': {e}"))
        })?;
        for (key, value) in params {
            url.query_pairs_mut().append_pair(key, value);
        }
        let url = url.to_string();

        if use_cache {
            if let Some(doc) = self.cache_retrieve(&url)? {
                debug!("Dashboard cache hit for {url}");
                return Ok(doc);
            }
        }

        debug!("Fetching {url}");
        let response = self
            .http
            .get(&url)
            .send()
            .map_err(|e| DashboardError::Network(format!("Failed to fetch from {url}: {e}")))?;

        let body = response
            .text()
            .map_err(|e| DashboardError::Network(format!("Failed to read body from {url}: {e}")))?;

        let doc: Value = serde_json::from_str(&body).map_err(|e| {
            error!("Non-JSON response from {url}: {body}");
            DashboardError::Parse(e.to_string())
        })?;

        self.cache_store(&url, &doc)?;
        Ok(doc)
    }

    /// Full results for a tree at a commit
    pub fn fetch_full_results(
        &self,
        origin: &str,
        giturl: &str,
        branch: &str,
        commit: &str,
    ) -> Result<Value, DashboardError> {
        let endpoint = format!("tree/{commit}/full");
        let params = [
            ("origin", origin),
            ("git_url", giturl),
            ("git_branch", branch),
            ("commit", commit),
        ];
        self.fetch(&endpoint, &params, true)
    }

    /// Result summary for a tree at a commit.
    ///
    /// Summaries for commits younger than three hours bypass the cache so
    /// stale in-progress data is never served.
    pub fn fetch_summary(
        &self,
        origin: &str,
        giturl: &str,
        branch: &str,
        commit: &str,
        commit_time: DateTime<Utc>,
    ) -> Result<Value, DashboardError> {
        let use_cache = summary_cache_allowed(commit_time, Utc::now());

        let endpoint = format!("tree/{commit}/summary");
        let params = [
            ("origin", origin),
            ("git_url", giturl),
            ("git_branch", branch),
            ("commit", commit),
        ];
        self.fetch(&endpoint, &params, use_cache)
    }

    /// Commit history for a tree at a commit
    pub fn fetch_commits(
        &self,
        origin: &str,
        giturl: &str,
        branch: &str,
        commit: &str,
    ) -> Result<Value, DashboardError> {
        let endpoint = format!("tree/{commit}/commits");
        let params = [
            ("origin", origin),
            ("git_url", giturl),
            ("git_branch", branch),
            ("commit", commit),
        ];
        self.fetch(&endpoint, &params, true)
    }

    /// A single test execution
    pub fn fetch_test(&self, test_id: &str) -> Result<Value, DashboardError> {
        self.fetch(&format!("test/{test_id}"), &[], true)
    }

    /// A single build
    pub fn fetch_build(&self, build_id: &str) -> Result<Value, DashboardError> {
        self.fetch(&format!("build/{build_id}"), &[], true)
    }

    /// A single issue version
    pub fn fetch_issue(&self, issue_id: &str, version: i64) -> Result<Value, DashboardError> {
        self.fetch(&format!("issue/{issue_id}/version/{version}"), &[], true)
    }

    /// Tests linked to an issue version
    pub fn fetch_issue_tests(&self, issue_id: &str, version: i64) -> Result<Value, DashboardError> {
        self.fetch(&format!("issue/{issue_id}/version/{version}/tests"), &[], true)
    }

    /// Builds linked to an issue version
    pub fn fetch_issue_builds(
        &self,
        issue_id: &str,
        version: i64,
    ) -> Result<Value, DashboardError> {
        self.fetch(&format!("issue/{issue_id}/version/{version}/builds"), &[], true)
    }

    /// Tree listing; always fetched fresh
    pub fn fetch_tree_fast(&self, origin: &str) -> Result<Value, DashboardError> {
        self.fetch("tree-fast", &[("origin", origin)], false)
    }
}
