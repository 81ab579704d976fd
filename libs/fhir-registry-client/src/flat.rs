//! Flat-scheme FHIR package server.
//!
//! FHIR-flavored registries such as Simplifier use the NPM listing document
//! but a flatter URL scheme: `{root}/{name}` for listings and
//! `{root}/{name}/{version}` for tarballs.

use crate::ci::CI_SCOPE;
use crate::error::{Error, Result};
use crate::models::PackageListing;
use crate::server::{resolve_version, PackageServer};
use async_trait::async_trait;
use cuprum_package::{PackageDependency, PackageReference};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// The Simplifier package registry.
pub const SIMPLIFIER_ROOT: &str = "https://packages.simplifier.net";

/// Client for flat-scheme FHIR registries.
pub struct FlatServer {
    root: String,
    client: Client,
}

/// One row of a registry catalog response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "FHIRVersion", default)]
    pub fhir_version: String,
    #[serde(default)]
    pub version: String,
}

/// Filters accepted by the registry catalog endpoint.
#[derive(Debug, Clone, Default)]
pub struct CatalogQuery {
    pub name: Option<String>,
    pub canonical: Option<String>,
    pub fhir_version: Option<String>,
    pub prerelease: Option<bool>,
}

impl FlatServer {
    /// Client for the Simplifier registry.
    pub fn new() -> Result<Self> {
        Self::with_root(SIMPLIFIER_ROOT)
    }

    /// Client for a flat registry at a custom root. Trailing slashes are
    /// stripped.
    pub fn with_root(root: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self::with_client(root, client))
    }

    pub fn with_client(root: impl Into<String>, client: Client) -> Self {
        let root = root.into().trim_end_matches('/').to_string();
        Self { root, client }
    }

    pub fn listing_url(&self, name: &str) -> String {
        format!("{}/{}", self.root, name)
    }

    pub fn tarball_url(&self, name: &str, version: &str) -> String {
        format!("{}/{}/{}", self.root, name, version)
    }

    /// Search the registry catalog.
    pub async fn catalog(&self, query: &CatalogQuery) -> Result<Vec<CatalogEntry>> {
        let mut url = format!("{}/catalog", self.root);
        let mut params = Vec::new();

        if let Some(name) = &query.name {
            params.push(format!("name={}", urlencoding::encode(name)));
        }
        if let Some(canonical) = &query.canonical {
            params.push(format!("canonical={}", urlencoding::encode(canonical)));
        }
        if let Some(fhir_version) = &query.fhir_version {
            params.push(format!("fhirversion={}", urlencoding::encode(fhir_version)));
        }
        if let Some(prerelease) = query.prerelease {
            params.push(format!("prerelease={}", prerelease));
        }

        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Registry {
                server: self.root.clone(),
                url,
                status: status.as_u16(),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl PackageServer for FlatServer {
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
        Ok(Some(PackageReference::new(&dependency.name, version)))
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

        let url = self.tarball_url(&reference.name, version);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(Error::PackageNotFound {
                name: reference.name.clone(),
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
