//! k3s releases published on GitHub.

use std::time::Duration;

use regex::Regex;
use reqwest::Client;
use semver::Version;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// GitHub REST API.
const GITHUB_API_URL: &str = "https://api.github.com";

/// Repository k3s is released from.
const K3S_REPOSITORY: &str = "k3s-io/k3s";

const PER_PAGE: usize = 100;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct Release {
    #[serde(default)]
    name: Option<String>,
}

/// Sort release names by semantic version, oldest first.
///
/// Names that are not versions are dropped; the rest come back with a
/// `v` prefix.
#[must_use]
pub fn sort_versions<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let mut versions: Vec<Version> = names
        .iter()
        .filter_map(|name| Version::parse(name.as_ref().trim_start_matches('v')).ok())
        .collect();
    versions.sort();
    versions.into_iter().map(|v| format!("v{v}")).collect()
}

/// Lists k3s releases.
#[derive(Clone)]
pub struct ReleaseClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    per_page: usize,
}

impl ReleaseClient {
    /// Client for the public GitHub API, authenticated with `token` if given.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(token: Option<String>) -> Result<Self> {
        Self::with_base_url(token, GITHUB_API_URL)
    }

    /// Client against a different API endpoint.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_base_url(token: Option<String>, base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent(concat!("hk3s/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Releases(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            per_page: PER_PAGE,
        })
    }

    /// Override the page size.
    #[must_use]
    pub fn with_page_size(mut self, per_page: usize) -> Self {
        self.per_page = per_page.max(1);
        self
    }

    /// Every release name, in API order.
    async fn fetch(&self) -> Result<Vec<String>> {
        let url = format!("{}/repos/{K3S_REPOSITORY}/releases", self.base_url);
        let mut names = Vec::new();
        let mut page = 1;

        loop {
            debug!(url = %url, page, "Fetching releases");
            let mut request = self
                .client
                .get(&url)
                .header("Accept", "application/vnd.github+json")
                .query(&[("per_page", self.per_page), ("page", page)]);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let releases: Vec<Release> = request
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| Error::Releases(e.to_string()))?
                .json()
                .await
                .map_err(|e| Error::Releases(e.to_string()))?;

            let count = releases.len();
            names.extend(releases.into_iter().filter_map(|r| r.name).filter(|n| !n.is_empty()));

            if count < self.per_page {
                break;
            }
            page += 1;
        }

        Ok(names)
    }

    /// Available releases matching `filter`, sorted oldest first; only the
    /// newest one with `latest`.
    ///
    /// # Errors
    /// Returns an error if the filter is not a valid regex, the listing
    /// fails, or `latest` is requested and nothing matches.
    pub async fn available(&self, filter: Option<&str>, latest: bool) -> Result<Vec<String>> {
        let filter = filter
            .filter(|f| !f.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::Releases(format!("invalid filter: {e}")))?;

        info!("Fetching available k3s releases");
        let names: Vec<String> = self
            .fetch()
            .await?
            .into_iter()
            .filter(|name| filter.as_ref().map_or(true, |re| re.is_match(name)))
            .collect();

        let mut sorted = sort_versions(&names);
        if latest {
            let newest = sorted
                .pop()
                .ok_or_else(|| Error::Releases("no release matches".into()))?;
            return Ok(vec![newest]);
        }
        Ok(sorted)
    }

    /// Whether `version` is a published release.
    ///
    /// # Errors
    /// Returns an error if the listing fails.
    pub async fn exists(&self, version: &str) -> Result<bool> {
        Ok(self.available(None, false).await?.iter().any(|v| v == version))
    }
}
