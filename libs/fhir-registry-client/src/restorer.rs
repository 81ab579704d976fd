//! Transitive package restoration.

use crate::cache::PackageCache;
use crate::closure::PackageClosure;
use crate::error::{Error, Result};
use crate::resolver::PackageResolver;
use crate::server::PackageServer;
use async_trait::async_trait;
use cuprum_package::{PackageManifest, PackageReference};
use std::sync::Arc;
use tracing::{debug, info};

/// Callback invoked once per fresh install during a restore, after the
/// package lands in the cache and before its dependencies are walked.
#[async_trait]
pub trait InstallListener: Send + Sync {
    async fn on_installed(&self, reference: &PackageReference);
}

/// Server chain, cache, and restore orchestration for one environment.
pub struct PackageContext {
    resolver: PackageResolver,
    cache: Arc<dyn PackageCache>,
    listener: Option<Arc<dyn InstallListener>>,
}

impl PackageContext {
    pub fn new(servers: Vec<Arc<dyn PackageServer>>, cache: Arc<dyn PackageCache>) -> Self {
        let resolver = PackageResolver::new(servers, Some(cache.clone()));
        Self {
            resolver,
            cache,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn InstallListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn resolver(&self) -> &PackageResolver {
        &self.resolver
    }

    pub fn cache(&self) -> &Arc<dyn PackageCache> {
        &self.cache
    }

    /// Restore the transitive dependency closure of a manifest, installing
    /// whatever is not cached yet.
    ///
    /// The walk is depth-first over an explicit work list. A name already
    /// accepted at an equal-or-higher version is not re-walked, which breaks
    /// dependency cycles. Requirements no source can satisfy are recorded as
    /// missing, unless some version is already installed locally (the
    /// bootstrapping case, accepted silently).
    pub async fn restore(&self, manifest: &PackageManifest) -> Result<PackageClosure> {
        let mut closure = PackageClosure::new();
        let mut pending = vec![manifest.clone()];

        while let Some(current) = pending.pop() {
            for dependency in current.dependencies() {
                match self.resolver.resolve(&dependency).await? {
                    Some(reference) => {
                        if closure.add(reference.clone()) {
                            let installed = self.ensure_installed(&reference).await?;
                            pending.push(installed);
                        }
                    }
                    None => {
                        let installed = self.cache.installed_versions(&dependency.name).await?;
                        if installed.is_empty() {
                            debug!(dependency = %dependency, "unresolvable, recording as missing");
                            closure.add_missing(dependency);
                        }
                    }
                }
            }
        }

        Ok(closure)
    }

    /// Resolve a single requirement and make sure it is installed, returning
    /// the installed manifest.
    pub async fn load_or_install(&self, name: &str, range: &str) -> Result<PackageManifest> {
        let dependency = cuprum_package::PackageDependency::new(name, range);
        match self.resolver.resolve(&dependency).await? {
            Some(reference) => self.ensure_installed(&reference).await,
            None => Err(Error::PackageNotFound {
                name: name.to_string(),
                range: range.to_string(),
            }),
        }
    }

    async fn ensure_installed(&self, reference: &PackageReference) -> Result<PackageManifest> {
        if self.cache.is_installed(reference).await? {
            return self.cache.read_manifest(reference).await;
        }

        let bytes = self.resolver.get_package(reference).await?;
        let manifest = self.cache.install(reference, &bytes).await?;
        info!(package = %reference, "installed");

        if let Some(listener) = &self.listener {
            listener.on_installed(reference).await;
        }

        Ok(manifest)
    }
}
