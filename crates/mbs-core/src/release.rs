use log::{debug, info};
use serde::Deserialize;
use thiserror::Error;

use crate::version::Version;

pub const GITHUB_API_URL: &str = "https://api.github.com";

const ACCEPT_GITHUB_V3: &str = "application/vnd.github.v3+json";

/// Asset name fragments for Windows installers, most specific first.
const INSTALLER_PATTERNS: [&str; 4] = ["setup.exe", "installer.exe", ".exe", ".zip"];

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubAsset {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRelease {
    pub tag_name: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("no releases have been published for {repository} yet")]
    NoReleasesPublished { repository: String },
    #[error("network error while checking for updates: {0}")]
    Network(#[source] reqwest::Error),
    #[error("update check failed with HTTP {status}{body_snippet}")]
    HttpStatus {
        status: reqwest::StatusCode,
        body_snippet: String,
    },
    #[error("invalid response from release feed: {0}")]
    MalformedResponse(String),
}

impl FeedError {
    /// Whether the failure came from the transport or a non-success status,
    /// as opposed to the feed content.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::HttpStatus { .. })
    }
}

/// Downloadable file picked from a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub name: String,
    pub download_url: String,
    pub size: u64,
    pub sha256: Option<String>,
}

/// The latest published release, as read from the feed.
#[derive(Debug, Clone)]
pub struct ReleaseDescriptor {
    pub tag_version: String,
    pub normalized_version: Version,
    pub notes: String,
    pub asset: Option<ReleaseAsset>,
    pub html_page_url: String,
}

impl ReleaseDescriptor {
    /// Build a descriptor from a decoded feed response.
    ///
    /// # Errors
    /// Returns [`FeedError::MalformedResponse`] when the value is not a JSON
    /// object, has no usable `tag_name`, or does not match the release shape.
    pub fn from_json(
        value: serde_json::Value,
        selector: &AssetSelector,
    ) -> Result<Self, FeedError> {
        if !value.is_object() {
            return Err(FeedError::MalformedResponse(
                "expected a JSON object".to_string(),
            ));
        }

        let has_tag = value
            .get("tag_name")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|tag| !tag.trim().is_empty());
        if !has_tag {
            return Err(FeedError::MalformedResponse(
                "no release tag found".to_string(),
            ));
        }

        let release: GitHubRelease = serde_json::from_value(value)
            .map_err(|error| FeedError::MalformedResponse(error.to_string()))?;

        Ok(Self::from_release(release, selector))
    }

    #[must_use]
    pub fn from_release(release: GitHubRelease, selector: &AssetSelector) -> Self {
        let asset = selector.select(&release.assets).map(|asset| ReleaseAsset {
            name: asset.name.clone(),
            download_url: asset.browser_download_url.clone(),
            size: asset.size,
            sha256: asset.digest.as_deref().and_then(parse_sha256_digest),
        });

        Self {
            normalized_version: Version::parse(&release.tag_name),
            tag_version: release.tag_name,
            notes: release.body.unwrap_or_default(),
            asset,
            html_page_url: release.html_url,
        }
    }

    #[must_use]
    pub fn asset_url(&self) -> Option<&str> {
        self.asset.as_ref().map(|asset| asset.download_url.as_str())
    }

    /// The asset URL, or the release page when the release has no assets.
    #[must_use]
    pub fn download_url(&self) -> &str {
        self.asset_url().unwrap_or(&self.html_page_url)
    }

    /// The tag without its leading non-digit prefix, for display.
    #[must_use]
    pub fn display_version(&self) -> &str {
        let stripped = self
            .tag_version
            .trim_start_matches(|ch: char| !ch.is_ascii_digit());
        if stripped.is_empty() {
            &self.tag_version
        } else {
            stripped
        }
    }
}

/// Picks the release asset to install.
///
/// Patterns are matched case-insensitively against asset names in order; the
/// first pattern with any match wins. Without a match the first listed asset
/// is used.
#[derive(Debug, Clone)]
pub struct AssetSelector {
    patterns: Vec<String>,
}

impl Default for AssetSelector {
    fn default() -> Self {
        Self::with_patterns(INSTALLER_PATTERNS)
    }
}

impl AssetSelector {
    pub fn with_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|pattern| pattern.into().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Selector for the platform this binary was built for. Windows uses the
    /// installer list; other targets prefer their own tagged archive.
    #[must_use]
    pub fn for_current_platform() -> Self {
        match platform_archive_suffix() {
            Some(suffix) => {
                let mut patterns = vec![suffix.to_string(), ".zip".to_string()];
                patterns.dedup();
                Self::with_patterns(patterns)
            }
            None => Self::default(),
        }
    }

    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    #[must_use]
    pub fn select<'a>(&self, assets: &'a [GitHubAsset]) -> Option<&'a GitHubAsset> {
        let usable = || {
            assets
                .iter()
                .filter(|asset| !asset.browser_download_url.is_empty())
        };

        self.patterns
            .iter()
            .find_map(|pattern| {
                usable().find(|asset| asset.name.to_ascii_lowercase().contains(pattern.as_str()))
            })
            .or_else(|| usable().next())
    }
}

fn platform_archive_suffix() -> Option<&'static str> {
    if cfg!(target_os = "windows") {
        None
    } else if cfg!(target_os = "macos") && cfg!(target_arch = "aarch64") {
        Some("macos-arm64.zip")
    } else if cfg!(target_os = "macos") {
        Some("macos-x64.zip")
    } else if cfg!(target_os = "linux") && cfg!(target_arch = "aarch64") {
        Some("linux-arm64.zip")
    } else if cfg!(target_os = "linux") {
        Some("linux-x64.zip")
    } else {
        Some(".zip")
    }
}

/// A newer release the user can install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppUpdate {
    pub current_version: String,
    pub latest_version: String,
    pub release_url: String,
    pub release_notes: Option<String>,
    pub download_url: String,
    pub asset: Option<ReleaseAsset>,
}

impl AppUpdate {
    /// Whether there is a package to download, as opposed to only a release
    /// page to visit.
    #[must_use]
    pub fn has_package(&self) -> bool {
        self.asset.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    Available(AppUpdate),
    UpToDate { latest: String },
}

/// Client for the "latest release" endpoint of a GitHub-compatible API.
#[derive(Debug, Clone)]
pub struct ReleaseFeed {
    client: reqwest::Client,
    base_url: String,
    selector: AssetSelector,
}

impl ReleaseFeed {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, GITHUB_API_URL)
    }

    #[must_use]
    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            selector: AssetSelector::for_current_platform(),
        }
    }

    #[must_use]
    pub fn with_selector(mut self, selector: AssetSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Fetch the latest published release of `repository` (`owner/repo`).
    ///
    /// # Errors
    /// Returns [`FeedError::NoReleasesPublished`] on HTTP 404, a network error
    /// for other failures, or [`FeedError::MalformedResponse`] when the body is
    /// not a release object.
    pub async fn fetch_latest(&self, repository: &str) -> Result<ReleaseDescriptor, FeedError> {
        let url = format!("{}/repos/{repository}/releases/latest", self.base_url);
        debug!("Fetching latest release from {url}");

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, user_agent())
            .header(reqwest::header::ACCEPT, ACCEPT_GITHUB_V3)
            .send()
            .await
            .map_err(FeedError::Network)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FeedError::NoReleasesPublished {
                repository: repository.to_string(),
            });
        }
        if !status.is_success() {
            let body_snippet = response
                .text()
                .await
                .ok()
                .map(|body| response_snippet(&body, 160))
                .unwrap_or_default();
            return Err(FeedError::HttpStatus {
                status,
                body_snippet,
            });
        }

        let bytes = response.bytes().await.map_err(FeedError::Network)?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|error| FeedError::MalformedResponse(error.to_string()))?;

        ReleaseDescriptor::from_json(value, &self.selector)
    }

    /// Compare the latest release against `current_version`.
    ///
    /// # Errors
    /// Propagates [`ReleaseFeed::fetch_latest`] failures.
    pub async fn check_for_update(
        &self,
        repository: &str,
        current_version: &str,
    ) -> Result<UpdateCheck, FeedError> {
        let release = self.fetch_latest(repository).await?;
        let current = Version::parse(current_version);

        if !release.normalized_version.is_newer_than(&current) {
            debug!(
                "Latest release {} is not newer than {current_version}",
                release.tag_version
            );
            return Ok(UpdateCheck::UpToDate {
                latest: release.display_version().to_string(),
            });
        }

        info!(
            "Update available: {current_version} -> {}",
            release.tag_version
        );
        let latest_version = release.display_version().to_string();
        Ok(UpdateCheck::Available(AppUpdate {
            current_version: current_version
                .trim_start_matches(['v', 'V'])
                .to_string(),
            latest_version,
            download_url: release.download_url().to_string(),
            release_url: release.html_page_url,
            release_notes: Some(release.notes).filter(|notes| !notes.trim().is_empty()),
            asset: release.asset,
        }))
    }
}

fn user_agent() -> String {
    format!("mbs-updater/{}", env!("CARGO_PKG_VERSION"))
}

fn response_snippet(body: &str, max_chars: usize) -> String {
    let snippet: String = body.chars().take(max_chars).collect();
    if snippet.is_empty() {
        String::new()
    } else {
        format!(": {snippet}")
    }
}

fn parse_sha256_digest(digest: &str) -> Option<String> {
    let (algorithm, hash) = digest.split_once(':')?;
    if !algorithm.eq_ignore_ascii_case("sha256") {
        return None;
    }
    if hash.len() != 64 || !hash.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    Some(hash.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AssetSelector, FeedError, ReleaseDescriptor, parse_sha256_digest};

    fn asset(name: &str) -> serde_json::Value {
        json!({
            "name": name,
            "browser_download_url": format!("https://example.com/download/{name}"),
            "size": 1024
        })
    }

    #[test]
    fn setup_executable_wins_over_archive() {
        let value = json!({
            "tag_name": "v1.4.0",
            "html_url": "https://example.com/releases/v1.4.0",
            "assets": [asset("app.zip"), asset("app-setup.exe")]
        });

        let release = ReleaseDescriptor::from_json(value, &AssetSelector::default())
            .expect("release should parse");

        assert_eq!(
            release.asset_url(),
            Some("https://example.com/download/app-setup.exe")
        );
    }

    #[test]
    fn unmatched_assets_fall_back_to_first_listed() {
        let value = json!({
            "tag_name": "1.0.0",
            "html_url": "https://example.com/releases/1.0.0",
            "assets": [asset("notes.txt"), asset("checksums.sha256")]
        });

        let release = ReleaseDescriptor::from_json(value, &AssetSelector::default())
            .expect("release should parse");

        assert_eq!(
            release.asset_url(),
            Some("https://example.com/download/notes.txt")
        );
    }

    #[test]
    fn release_without_assets_points_at_release_page() {
        let value = json!({
            "tag_name": "v2.3.0",
            "html_url": "https://example.com/releases/v2.3.0",
            "body": "## Changes\n- fixes"
        });

        let release = ReleaseDescriptor::from_json(value, &AssetSelector::default())
            .expect("release should parse");

        assert!(release.asset_url().is_none());
        assert_eq!(release.html_page_url, "https://example.com/releases/v2.3.0");
        assert_eq!(release.download_url(), "https://example.com/releases/v2.3.0");
        assert_eq!(release.normalized_version.components(), &[2, 3, 0]);
        assert_eq!(release.display_version(), "2.3.0");
        assert_eq!(release.notes, "## Changes\n- fixes");
    }

    #[test]
    fn non_object_and_missing_tag_are_malformed() {
        let selector = AssetSelector::default();

        for value in [
            json!([1, 2, 3]),
            json!("v1.0.0"),
            json!({ "html_url": "https://example.com" }),
            json!({ "tag_name": "" }),
            json!({ "tag_name": 12 }),
        ] {
            let result = ReleaseDescriptor::from_json(value.clone(), &selector);
            assert!(
                matches!(result, Err(FeedError::MalformedResponse(_))),
                "{value} should be rejected"
            );
        }
    }

    #[test]
    fn selector_ignores_case_and_custom_order() {
        let value = json!({
            "tag_name": "1.0.0",
            "assets": [asset("MBS-Installer.EXE"), asset("mbs-linux-x64.zip")]
        });

        let windows = ReleaseDescriptor::from_json(value.clone(), &AssetSelector::default())
            .expect("release should parse");
        assert_eq!(
            windows.asset.map(|asset| asset.name).as_deref(),
            Some("MBS-Installer.EXE")
        );

        let linux = ReleaseDescriptor::from_json(
            value,
            &AssetSelector::with_patterns(["linux-x64.zip", ".zip"]),
        )
        .expect("release should parse");
        assert_eq!(
            linux.asset.map(|asset| asset.name).as_deref(),
            Some("mbs-linux-x64.zip")
        );
    }

    #[test]
    fn asset_digest_is_carried_when_valid() {
        let value = json!({
            "tag_name": "1.0.0",
            "assets": [{
                "name": "mbs.zip",
                "browser_download_url": "https://example.com/mbs.zip",
                "size": 10,
                "digest": "sha256:BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD"
            }]
        });

        let release = ReleaseDescriptor::from_json(value, &AssetSelector::default())
            .expect("release should parse");

        assert_eq!(
            release.asset.and_then(|asset| asset.sha256).as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn parse_sha256_digest_rejects_invalid_values() {
        assert!(parse_sha256_digest("sha1:abc").is_none());
        assert!(parse_sha256_digest("sha256:not-hex").is_none());
        assert!(parse_sha256_digest("sha256:abcd").is_none());
    }

    #[test]
    fn platform_selector_always_accepts_archives() {
        let selector = AssetSelector::for_current_platform();
        assert!(
            selector
                .patterns()
                .iter()
                .any(|pattern| pattern.ends_with(".zip"))
        );
    }
}
