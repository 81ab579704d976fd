//! Data model for FHIR Implementation Guide packages.
//!
//! Provides serde-friendly representations of `package.json` manifests as
//! shipped inside NPM-style `.tgz` archives, together with the reference and
//! dependency types used to identify packages across registries.

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;
use tar::Archive;
use thiserror::Error;

pub type PackageName = String;
pub type Version = String;
pub type VersionReference = String;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid structure: {0}")]
    InvalidStructure(String),
    #[error("Missing file: {0}")]
    MissingFile(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type PackageResult<T> = Result<T, PackageError>;

/// Identity of a concrete package artifact: optional scope, name, and an
/// optional version (a concrete semver or a tag such as `current`).
///
/// Package names are compared case-insensitively throughout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageReference {
    pub scope: Option<String>,
    pub name: PackageName,
    pub version: Option<Version>,
}

impl PackageReference {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            scope: None,
            name: name.into(),
            version: Some(version.into()),
        }
    }

    pub fn scoped(
        scope: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            scope: Some(scope.into()),
            name: name.into(),
            version: Some(version.into()),
        }
    }

    pub fn unversioned(name: impl Into<String>) -> Self {
        Self {
            scope: None,
            name: name.into(),
            version: None,
        }
    }

    /// Parse an NPM-style name, splitting a leading `@scope/` off if present.
    pub fn from_npm_name(name: &str, version: impl Into<String>) -> Self {
        match split_scoped_name(name) {
            Some((scope, base)) => Self::scoped(scope, base, version),
            None => Self::new(name, version),
        }
    }

    /// Full NPM-style name, with the `@scope/` prefix when scoped.
    pub fn full_name(&self) -> String {
        match &self.scope {
            Some(scope) => format!("@{}/{}", scope, self.name),
            None => self.name.clone(),
        }
    }

    /// Stable `name@version` identity used for logging and closure keys.
    pub fn moniker(&self) -> String {
        match &self.version {
            Some(version) => format!("{}@{}", self.full_name(), version),
            None => self.full_name(),
        }
    }

    /// Case-insensitive name match.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Whether the reference belongs to the given scope.
    pub fn is_scoped(&self, scope: &str) -> bool {
        self.scope.as_deref() == Some(scope)
    }
}

impl fmt::Display for PackageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.moniker())
    }
}

/// Split `@scope/name` into its parts; plain names return `None`.
pub fn split_scoped_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix('@')?;
    rest.split_once('/')
}

/// A requirement on a package: a name plus a semver range expression.
///
/// An empty range, or the literal `latest`, means the latest stable release.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageDependency {
    pub name: PackageName,
    pub range: VersionReference,
}

impl PackageDependency {
    pub fn new(name: impl Into<String>, range: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            range: range.into(),
        }
    }

    /// Requirement on the latest stable release.
    pub fn latest(name: impl Into<String>) -> Self {
        Self::new(name, "")
    }

    /// Whether the range asks for the latest stable release.
    pub fn wants_latest(&self) -> bool {
        let range = self.range.trim();
        range.is_empty() || range.eq_ignore_ascii_case("latest")
    }
}

impl fmt::Display for PackageDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.range.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}@{}", self.name, self.range)
        }
    }
}

/// FHIR NPM package manifest (`package/package.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub name: PackageName,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fhir_versions: Vec<String>,
    #[serde(default)]
    pub dependencies: HashMap<PackageName, VersionReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl PackageManifest {
    /// Minimal manifest with just a name and version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            canonical: None,
            url: None,
            title: None,
            description: String::new(),
            fhir_versions: Vec::new(),
            dependencies: HashMap::new(),
            author: None,
            license: None,
            extra: Map::new(),
        }
    }

    /// The declared dependencies as resolvable requirements.
    pub fn dependencies(&self) -> Vec<PackageDependency> {
        self.dependencies
            .iter()
            .map(|(name, range)| PackageDependency::new(name.clone(), range.clone()))
            .collect()
    }

    /// Reference to the package this manifest describes.
    pub fn reference(&self) -> PackageReference {
        PackageReference::from_npm_name(&self.name, self.version.clone())
    }

    /// Check required fields are present.
    pub fn validate(&self) -> PackageResult<()> {
        if self.name.is_empty() {
            return Err(PackageError::ValidationError(
                "Package name required".into(),
            ));
        }
        if self.version.is_empty() {
            return Err(PackageError::ValidationError(
                "Package version required".into(),
            ));
        }
        Ok(())
    }

    /// Parse a manifest from raw bytes, tolerating BOMs and stray control
    /// characters as published by some registries.
    pub fn from_bytes(bytes: &[u8]) -> PackageResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| PackageError::InvalidStructure(format!("Invalid UTF-8: {}", e)))?;
        let cleaned: String = text
            .trim_start_matches('\u{feff}')
            .chars()
            .filter(|c| matches!(c, '\t' | '\n' | '\r') || !c.is_control())
            .collect();
        Ok(serde_json::from_str(cleaned.trim())?)
    }

    /// Read a manifest from a `package.json` file on disk.
    pub fn from_file(path: &Path) -> PackageResult<Self> {
        if !path.exists() {
            return Err(PackageError::MissingFile(path.to_string_lossy().into()));
        }
        Self::from_bytes(&fs::read(path)?)
    }

    /// Extract `package/package.json` from gzipped tar bytes.
    pub fn from_tar_gz_bytes(bytes: &[u8]) -> PackageResult<Self> {
        let mut decoder = GzDecoder::new(bytes);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;

        let mut archive = Archive::new(std::io::Cursor::new(decompressed));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().to_string();
            if path == "package/package.json" {
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents)?;
                return Self::from_bytes(&contents);
            }
        }

        Err(PackageError::MissingFile("package/package.json".into()))
    }
}

/// Unpack gzipped tar bytes into a directory.
pub fn unpack_tar_gz(bytes: &[u8], dest: &Path) -> PackageResult<()> {
    let mut decoder = GzDecoder::new(bytes);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;

    let mut archive = Archive::new(std::io::Cursor::new(decompressed));
    archive.unpack(dest)?;
    Ok(())
}
