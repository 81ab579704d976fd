//! FHIR Package Registry Client
//!
//! This crate resolves and restores FHIR Implementation Guide packages
//! across a prioritized chain of registries: NPM-protocol servers, flat
//! FHIR registries such as Simplifier, and the `build.fhir.org` CI build
//! server, with the local package cache as last resort.
//!
//! # Examples
//!
//! ## Restore a dependency closure
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cuprum_registry_client::{CiServer, FileSystemCache, FlatServer, PackageContext, PackageServer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let servers: Vec<Arc<dyn PackageServer>> =
//!     vec![Arc::new(FlatServer::new()?), Arc::new(CiServer::new()?)];
//! let cache = Arc::new(FileSystemCache::new(None));
//!
//! let context = PackageContext::new(servers, cache);
//! let manifest = context.load_or_install("hl7.fhir.us.core", "6.1.0").await?;
//! let closure = context.restore(&manifest).await?;
//!
//! for package in closure.packages() {
//!     println!("{package}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Resolve a CI build by branch
//!
//! ```rust,no_run
//! use cuprum_registry_client::CiServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ci = CiServer::new()?;
//! if let Some(build) = ci.get_references("hl7.fhir.us.core", Some("master")).await? {
//!     println!("{} -> {}", build.tagged, build.resolved);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod ci;
pub mod closure;
pub mod error;
pub mod flat;
pub mod models;
pub mod npm;
pub mod resolver;
pub mod restorer;
pub mod server;
pub mod versions;

pub use cache::{FileSystemCache, PackageCache};
pub use ci::{
    cibuild_version, clean_for_semver, BuildReferences, CatalogFilter, CiQaRecord, CiServer,
    CiServerOptions, RepoBranch, CI_ROOT, CI_SCOPE, CURRENT_TAG,
};
pub use closure::PackageClosure;
pub use error::{Error, Result};
pub use flat::{CatalogEntry, CatalogQuery, FlatServer, SIMPLIFIER_ROOT};
pub use models::{Dist, PackageListing, PackageRelease};
pub use npm::{NpmServer, NPM_REGISTRY_ROOT};
pub use resolver::PackageResolver;
pub use restorer::{InstallListener, PackageContext};
pub use server::PackageServer;
pub use versions::VersionSet;

// Re-export the package data model for convenience
pub use cuprum_package::{PackageDependency, PackageManifest, PackageReference};
