//! Uniform interface over package servers.
//!
//! The resolver treats servers as an ordered chain with identical failure
//! semantics: `Ok(None)` means "this server does not know the package",
//! transport errors mean "this server cannot answer right now".

use crate::error::Result;
use crate::models::PackageListing;
use crate::versions::VersionSet;
use async_trait::async_trait;
use cuprum_package::{PackageDependency, PackageReference};

/// A source of package listings and tarballs.
#[async_trait]
pub trait PackageServer: Send + Sync {
    /// Server identity used in logs and error context.
    fn root(&self) -> &str;

    /// Download the listing document for a package; `None` when the server
    /// does not know the package.
    async fn download_listing(&self, name: &str) -> Result<Option<PackageListing>>;

    /// Every version the server offers for a package.
    async fn get_versions(&self, name: &str) -> Result<VersionSet> {
        match self.download_listing(name).await? {
            Some(listing) => listing.version_set(),
            None => Ok(VersionSet::new()),
        }
    }

    /// Resolve a requirement to a concrete reference; `None` when the server
    /// cannot satisfy it.
    async fn resolve(&self, dependency: &PackageDependency) -> Result<Option<PackageReference>>;

    /// Fetch the tarball bytes for a resolved reference.
    async fn get_package(&self, reference: &PackageReference) -> Result<Vec<u8>>;
}

/// Resolve a requirement against a listing: dist-tags take precedence, then
/// the range is matched against the version set, stable releases first.
pub(crate) fn resolve_version(
    listing: &PackageListing,
    dependency: &PackageDependency,
) -> Result<Option<String>> {
    let range = dependency.range.trim();
    if !range.is_empty() {
        if let Some(version) = listing.tag(range) {
            return Ok(Some(version.to_string()));
        }
    }

    let versions = listing.version_set()?;
    Ok(versions.select(range)?.map(|version| version.to_string()))
}
