//! Local package cache.
//!
//! The cache is the last-resort resolver source and the destination of
//! restored packages. `FileSystemCache` implements the standard FHIR layout,
//! `~/.fhir/packages/<name>#<version>/package/...`.

use crate::error::{Error, Result};
use async_trait::async_trait;
use cuprum_package::{unpack_tar_gz, PackageManifest, PackageReference};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Store of installed packages, keyed by (name, version).
#[async_trait]
pub trait PackageCache: Send + Sync {
    /// Whether the referenced package is installed.
    async fn is_installed(&self, reference: &PackageReference) -> Result<bool>;

    /// Manifest of an installed package.
    async fn read_manifest(&self, reference: &PackageReference) -> Result<PackageManifest>;

    /// Unpack tarball bytes and record the reference as installed. The
    /// package either becomes fully installed or the cache is unchanged.
    async fn install(
        &self,
        reference: &PackageReference,
        bytes: &[u8],
    ) -> Result<PackageManifest>;

    /// Every installed version of a package, for resolver fallback.
    async fn installed_versions(&self, name: &str) -> Result<Vec<PackageReference>>;
}

/// Package cache on the local filesystem.
pub struct FileSystemCache {
    root: PathBuf,
}

impl FileSystemCache {
    /// Cache at the standard location (`~/.fhir/packages`) or a custom root.
    pub fn new(root: Option<PathBuf>) -> Self {
        let root = root.unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".fhir")
                .join("packages")
        });
        Self { root }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn package_dir(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(format!("{}#{}", name, version))
    }

    fn manifest_path(&self, name: &str, version: &str) -> PathBuf {
        self.package_dir(name, version)
            .join("package")
            .join("package.json")
    }

    fn versioned(reference: &PackageReference) -> Result<(&str, &str)> {
        match reference.version.as_deref() {
            Some(version) => Ok((reference.name.as_str(), version)),
            None => Err(Error::PackageNotFound {
                name: reference.name.clone(),
                range: String::new(),
            }),
        }
    }
}

#[async_trait]
impl PackageCache for FileSystemCache {
    async fn is_installed(&self, reference: &PackageReference) -> Result<bool> {
        let Ok((name, version)) = Self::versioned(reference) else {
            return Ok(false);
        };
        Ok(self.manifest_path(name, version).exists())
    }

    async fn read_manifest(&self, reference: &PackageReference) -> Result<PackageManifest> {
        let (name, version) = Self::versioned(reference)?;
        Ok(PackageManifest::from_file(&self.manifest_path(name, version))?)
    }

    async fn install(
        &self,
        reference: &PackageReference,
        bytes: &[u8],
    ) -> Result<PackageManifest> {
        let (name, version) = Self::versioned(reference)?;
        let target = self.package_dir(name, version);
        if target.exists() {
            return self.read_manifest(reference).await;
        }

        fs::create_dir_all(&self.root)?;

        // Unpack next to the target, then rename, so a crashed install never
        // leaves a half-written package dir behind.
        let staging = self.root.join(format!(".stage-{}#{}", name, version));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }

        let unpacked = unpack_tar_gz(bytes, &staging);
        if let Err(e) = unpacked {
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }

        let manifest = match PackageManifest::from_file(&staging.join("package").join("package.json"))
        {
            Ok(manifest) => manifest,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(e.into());
            }
        };
        if let Err(e) = manifest.validate() {
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }

        fs::rename(&staging, &target)?;
        debug!(package = %reference, path = %target.display(), "installed into cache");
        Ok(manifest)
    }

    async fn installed_versions(&self, name: &str) -> Result<Vec<PackageReference>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };

        let mut references = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Ok(dir_name) = entry.file_name().into_string() else {
                continue;
            };
            let Some((installed_name, version)) = dir_name.split_once('#') else {
                continue;
            };
            if installed_name.starts_with('.') {
                continue;
            }
            if !installed_name.eq_ignore_ascii_case(name) {
                continue;
            }
            if version.is_empty() {
                warn!(dir = %dir_name, "ignoring cache entry without version");
                continue;
            }
            references.push(PackageReference::new(installed_name, version));
        }
        Ok(references)
    }
}
