//! Public package mirrors.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{DepsError, DepsResult};
use crate::registry::PackageVersions;

/// Abbreviated metadata format understood by npm-compatible registries.
const ABBREVIATED_ACCEPT: &str = "application/vnd.npm.install-v1+json";

/// A read-only source of package version listings.
#[async_trait]
pub trait PublicMirror: Send + Sync {
    /// Label used in logs and combined error messages.
    fn name(&self) -> &str;

    async fn versions(&self, package: &str) -> DepsResult<PackageVersions>;
}

/// Mirror reached over HTTP at `{base_url}/{package}`.
#[derive(Clone)]
pub struct HttpMirror {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct Packument {
    #[serde(default)]
    versions: BTreeMap<String, serde_json::Value>,
    #[serde(default, rename = "dist-tags")]
    dist_tags: BTreeMap<String, String>,
}

impl HttpMirror {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    fn package_url(&self, package: &str) -> String {
        // Scoped names keep the `@` but escape the separator.
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            package.replace('/', "%2f")
        )
    }
}

#[async_trait]
impl PublicMirror for HttpMirror {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn versions(&self, package: &str) -> DepsResult<PackageVersions> {
        let url = self.package_url(package);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, ABBREVIATED_ACCEPT)
            .send()
            .await
            .map_err(|e| DepsError::Mirror(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DepsError::Mirror(format!("{url}: HTTP {status}")));
        }
        let packument: Packument = response
            .json()
            .await
            .map_err(|e| DepsError::Mirror(format!("{url}: invalid package metadata: {e}")))?;
        debug!(%url, versions = packument.versions.len(), "package metadata fetched");

        Ok(PackageVersions {
            versions: packument.versions.into_keys().collect(),
            dist_tags: packument.dist_tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_abbreviated_packument() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/left-pad"))
            .and(header("accept", ABBREVIATED_ACCEPT))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "left-pad",
                "dist-tags": { "latest": "1.3.0" },
                "versions": { "1.0.0": {}, "1.3.0": {} }
            })))
            .mount(&mock_server)
            .await;

        let mirror = HttpMirror::new(mock_server.uri(), Duration::from_secs(5));
        let versions = mirror.versions("left-pad").await.unwrap();
        assert_eq!(versions.versions, vec!["1.0.0".to_string(), "1.3.0".to_string()]);
        assert_eq!(versions.dist_tags["latest"], "1.3.0");
    }

    #[tokio::test]
    async fn scoped_names_are_escaped() {
        let mirror = HttpMirror::new("https://registry.example.com/", Duration::from_secs(1));
        assert_eq!(
            mirror.package_url("@acme/utils"),
            "https://registry.example.com/@acme%2futils"
        );
    }

    #[tokio::test]
    async fn http_errors_are_reported() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let mirror = HttpMirror::new(mock_server.uri(), Duration::from_secs(5));
        let err = mirror.versions("missing").await.unwrap_err();
        assert!(matches!(err, DepsError::Mirror(msg) if msg.contains("404")));
    }
}
