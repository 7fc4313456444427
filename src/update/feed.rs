//! Release feed client
//!
//! Queries the GitHub "latest release" endpoint and turns the response into a
//! [`ReleaseDescriptor`] for the one asset this installation can use.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{UpdateError, Version};

/// Metadata of the latest published release, narrowed to the expected asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    /// Raw tag as published (`v1.0.5`)
    pub tag: String,
    pub version: Version,
    pub title: String,
    pub notes: String,
    pub asset_url: String,
    pub asset_name: String,
    /// Declared byte length of the asset, when the feed reports one
    pub asset_size: Option<u64>,
    /// SHA-256 published inline with the asset (lowercase hex)
    pub sha256: Option<String>,
    /// Sibling `<asset>.sha256` file, fetched when no inline digest exists
    pub checksum_url: Option<String>,
}

impl ReleaseDescriptor {
    pub fn has_checksum(&self) -> bool {
        self.sha256.is_some() || self.checksum_url.is_some()
    }
}

/// Source of release metadata
#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    /// Fetch the latest release; one request, no retries
    async fn fetch_latest(&self) -> Result<ReleaseDescriptor, UpdateError>;

    /// Fetch a published checksum file and return its SHA-256 hex digest
    async fn fetch_checksum(&self, url: &str) -> Result<String, UpdateError>;
}

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    digest: Option<String>,
}

/// HTTP client for a GitHub-style releases endpoint
pub struct GitHubReleaseFeed {
    client: reqwest::Client,
    url: String,
    asset_name: String,
}

impl GitHubReleaseFeed {
    pub fn new(
        url: impl Into<String>,
        asset_name: impl Into<String>,
        user_agent: &str,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .user_agent(user_agent)
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| UpdateError::Network(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            asset_name: asset_name.into(),
        })
    }

    pub fn asset_name(&self) -> &str {
        &self.asset_name
    }
}

#[async_trait]
impl ReleaseFeed for GitHubReleaseFeed {
    async fn fetch_latest(&self) -> Result<ReleaseDescriptor, UpdateError> {
        tracing::debug!(url = %self.url, "fetching latest release");

        let response = self
            .client
            .get(&self.url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| UpdateError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(UpdateError::NotFound(format!(
                "{} returned 404, no releases published",
                self.url
            )));
        }
        if !status.is_success() {
            return Err(UpdateError::Network(format!(
                "release feed returned status {}",
                status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| UpdateError::Network(e.to_string()))?;

        parse_release(&body, &self.asset_name)
    }

    async fn fetch_checksum(&self, url: &str) -> Result<String, UpdateError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UpdateError::Network(format!(
                "checksum download returned status {}",
                response.status()
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| UpdateError::Network(e.to_string()))?;

        parse_checksum_file(&text)
    }
}

/// Parse a release feed body and select the asset named `asset_name`
pub fn parse_release(body: &[u8], asset_name: &str) -> Result<ReleaseDescriptor, UpdateError> {
    let release: GitHubRelease =
        serde_json::from_slice(body).map_err(|e| UpdateError::Parse(e.to_string()))?;

    let version = Version::parse(&release.tag_name).ok_or_else(|| {
        UpdateError::Parse(format!("release tag '{}' is not a version", release.tag_name))
    })?;

    let asset = release
        .assets
        .iter()
        .find(|a| a.name == asset_name)
        .ok_or_else(|| {
            let published: Vec<&str> = release.assets.iter().map(|a| a.name.as_str()).collect();
            UpdateError::IncompatibleAsset(format!(
                "release {} has no '{}' (assets: {:?})",
                release.tag_name, asset_name, published
            ))
        })?;

    let sha256 = asset.digest.as_deref().and_then(parse_digest_field);

    let checksum_name = format!("{}.sha256", asset_name);
    let checksum_url = release
        .assets
        .iter()
        .find(|a| a.name == checksum_name)
        .map(|a| a.browser_download_url.clone());

    Ok(ReleaseDescriptor {
        tag: release.tag_name.clone(),
        version,
        title: release.name.clone().unwrap_or_else(|| release.tag_name.clone()),
        notes: release.body.clone().unwrap_or_default(),
        asset_url: asset.browser_download_url.clone(),
        asset_name: asset.name.clone(),
        asset_size: asset.size,
        sha256,
        checksum_url,
    })
}

/// `sha256:<hex>` as reported in a GitHub asset's `digest` field
fn parse_digest_field(digest: &str) -> Option<String> {
    let hex = digest.strip_prefix("sha256:")?;
    is_sha256_hex(hex).then(|| hex.to_ascii_lowercase())
}

/// First token of a `sha256sum`-style file
pub fn parse_checksum_file(text: &str) -> Result<String, UpdateError> {
    let token = text
        .split_whitespace()
        .next()
        .ok_or_else(|| UpdateError::Parse("checksum file is empty".to_string()))?;

    if !is_sha256_hex(token) {
        return Err(UpdateError::Parse(format!(
            "checksum file does not start with a SHA-256 digest: '{}'",
            token
        )));
    }
    Ok(token.to_ascii_lowercase())
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
