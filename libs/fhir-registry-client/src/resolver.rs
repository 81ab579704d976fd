//! Dependency resolution across an ordered server chain.

use crate::cache::PackageCache;
use crate::error::{Error, Result};
use crate::server::PackageServer;
use crate::versions::VersionSet;
use cuprum_package::{PackageDependency, PackageReference};
use semver::Version;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves requirements against a prioritized server chain, falling back to
/// the versions already installed in the local cache.
pub struct PackageResolver {
    servers: Vec<Arc<dyn PackageServer>>,
    cache: Option<Arc<dyn PackageCache>>,
}

impl PackageResolver {
    pub fn new(servers: Vec<Arc<dyn PackageServer>>, cache: Option<Arc<dyn PackageCache>>) -> Self {
        Self { servers, cache }
    }

    pub fn servers(&self) -> &[Arc<dyn PackageServer>] {
        &self.servers
    }

    /// Resolve a requirement to a concrete reference. Servers are consulted
    /// in priority order; the first hit wins. When no server knows the
    /// package the installed versions are consulted. A transport error from
    /// the final server is surfaced only if the cache cannot answer either.
    pub async fn resolve(&self, dependency: &PackageDependency) -> Result<Option<PackageReference>> {
        let mut last_error: Option<Error> = None;

        for server in &self.servers {
            match server.resolve(dependency).await {
                Ok(Some(reference)) => {
                    debug!(dependency = %dependency, resolved = %reference, server = server.root(), "resolved");
                    return Ok(Some(reference));
                }
                Ok(None) => {
                    last_error = None;
                }
                Err(e) if e.is_transport() || matches!(e, Error::MisroutedReference { .. }) => {
                    warn!(dependency = %dependency, server = server.root(), error = %e, "server cannot answer");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(cache) = &self.cache {
            if let Some(reference) = resolve_installed(cache.as_ref(), dependency).await? {
                debug!(dependency = %dependency, resolved = %reference, "resolved from cache");
                return Ok(Some(reference));
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// The numerically greatest version any server offers for a package;
    /// ties keep the earlier server's answer.
    pub async fn get_latest(&self, name: &str) -> Result<Option<PackageReference>> {
        let dependency = PackageDependency::latest(name);
        let mut best: Option<(Version, PackageReference)> = None;

        for server in &self.servers {
            let resolved = match server.resolve(&dependency).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(package = name, server = server.root(), error = %e, "server cannot answer");
                    continue;
                }
            };
            let Some(reference) = resolved else { continue };
            let Some(version) = reference
                .version
                .as_deref()
                .and_then(|raw| Version::parse(raw).ok())
            else {
                continue;
            };

            let replace = best
                .as_ref()
                .map(|(current, _)| version > *current)
                .unwrap_or(true);
            if replace {
                best = Some((version, reference));
            }
        }

        Ok(best.map(|(_, reference)| reference))
    }

    /// Fetch tarball bytes for a resolved reference from the first server
    /// able to serve it.
    pub async fn get_package(&self, reference: &PackageReference) -> Result<Vec<u8>> {
        let mut last_error: Option<Error> = None;

        for server in &self.servers {
            match server.get_package(reference).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    debug!(package = %reference, server = server.root(), error = %e, "fetch failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::PackageNotFound {
            name: reference.full_name(),
            range: reference.version.clone().unwrap_or_default(),
        }))
    }
}

/// Resolve a requirement against the versions already installed locally.
async fn resolve_installed(
    cache: &dyn PackageCache,
    dependency: &PackageDependency,
) -> Result<Option<PackageReference>> {
    let installed = cache.installed_versions(&dependency.name).await?;
    if installed.is_empty() {
        return Ok(None);
    }

    let mut versions = VersionSet::new();
    for reference in &installed {
        let Some(raw) = reference.version.as_deref() else {
            continue;
        };
        match Version::parse(raw) {
            Ok(version) => versions.insert(version, true),
            Err(_) => warn!(package = %reference, "ignoring unparseable installed version"),
        }
    }

    let Some(selected) = versions.select(&dependency.range)? else {
        return Ok(None);
    };
    let selected = selected.to_string();
    Ok(installed
        .into_iter()
        .find(|reference| reference.version.as_deref() == Some(selected.as_str())))
}
