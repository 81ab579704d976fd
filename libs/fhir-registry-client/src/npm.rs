//! NPM-protocol package server.

use crate::ci::CI_SCOPE;
use crate::error::{Error, Result};
use crate::models::PackageListing;
use crate::server::{resolve_version, PackageServer};
use async_trait::async_trait;
use cuprum_package::{split_scoped_name, PackageDependency, PackageReference};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Canonical public NPM registry.
pub const NPM_REGISTRY_ROOT: &str = "https://registry.npmjs.org";

/// Client for NPM-protocol registries (registry.npmjs.org and mirrors).
pub struct NpmServer {
    root: String,
    client: Client,
}

impl NpmServer {
    /// Client for the public NPM registry.
    pub fn new() -> Result<Self> {
        Self::with_root(NPM_REGISTRY_ROOT)
    }

    /// Client for an NPM-protocol registry at a custom root. Trailing
    /// slashes are stripped.
    pub fn with_root(root: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self::with_client(root, client))
    }

    pub fn with_client(root: impl Into<String>, client: Client) -> Self {
        let root = root.into().trim_end_matches('/').to_string();
        Self { root, client }
    }

    /// Listing URL; the scope separator of scoped names is URL-encoded.
    pub fn listing_url(&self, name: &str) -> String {
        match split_scoped_name(name) {
            Some((scope, base)) => format!(
                "{}/@{}%2F{}",
                self.root,
                urlencoding::encode(scope),
                urlencoding::encode(base)
            ),
            None => format!("{}/{}", self.root, name),
        }
    }

    pub fn tarball_url(&self, name: &str, version: &str) -> String {
        match split_scoped_name(name) {
            Some((scope, base)) => {
                format!("{}/@{}/{}/-/{}-{}.tgz", self.root, scope, base, base, version)
            }
            None => format!("{}/{}/-/{}-{}.tgz", self.root, name, name, version),
        }
    }
}

#[async_trait]
impl PackageServer for NpmServer {
    fn root(&self) -> &str {
        &self.root
    }

    async fn download_listing(&self, name: &str) -> Result<Option<PackageListing>> {
        let url = self.listing_url(name);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::Registry {
                server: self.root.clone(),
                url,
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let listing =
            serde_json::from_str::<PackageListing>(&body).map_err(|e| Error::InvalidListing {
                name: name.to_string(),
                server: self.root.clone(),
                message: e.to_string(),
            })?;
        Ok(Some(listing))
    }

    async fn resolve(&self, dependency: &PackageDependency) -> Result<Option<PackageReference>> {
        let Some(listing) = self.download_listing(&dependency.name).await? else {
            return Ok(None);
        };

        let Some(version) = resolve_version(&listing, dependency)? else {
            return Ok(None);
        };

        debug!(package = %dependency.name, %version, server = %self.root, "resolved");
        Ok(Some(PackageReference::from_npm_name(
            &dependency.name,
            version,
        )))
    }

    async fn get_package(&self, reference: &PackageReference) -> Result<Vec<u8>> {
        if reference.is_scoped(CI_SCOPE) {
            return Err(Error::MisroutedReference {
                moniker: reference.moniker(),
                server: self.root.clone(),
            });
        }
        let Some(version) = reference.version.as_deref() else {
            return Err(Error::PackageNotFound {
                name: reference.full_name(),
                range: String::new(),
            });
        };

        let url = self.tarball_url(&reference.full_name(), version);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(Error::PackageNotFound {
                name: reference.full_name(),
                range: version.to_string(),
            });
        }
        if !status.is_success() {
            return Err(Error::Registry {
                server: self.root.clone(),
                url,
                status: status.as_u16(),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}
