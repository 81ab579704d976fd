//! Listing documents returned by package registries.

use crate::error::Result;
use crate::versions::VersionSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// NPM-style package listing: every published release of one package plus
/// the dist-tag aliases pointing into them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageListing {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub versions: BTreeMap<String, PackageRelease>,
    #[serde(rename = "dist-tags", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// One release record inside a listing's `versions` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRelease {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fhir_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<Dist>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlisted: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl PackageRelease {
    /// Registries mark retracted releases with a non-empty `unlisted` field.
    pub fn is_unlisted(&self) -> bool {
        self.unlisted
            .as_deref()
            .is_some_and(|value| !value.is_empty() && !value.eq_ignore_ascii_case("false"))
    }
}

/// Distribution block of a release record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dist {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tarball: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
}

impl PackageListing {
    /// Empty listing for a named package.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: Some(name.clone()),
            name,
            ..Self::default()
        }
    }

    /// The version a dist-tag points at, if the tag exists.
    pub fn tag(&self, tag: &str) -> Option<&str> {
        self.dist_tags.get(tag).map(String::as_str)
    }

    /// The release record for a concrete version.
    pub fn release(&self, version: &str) -> Option<&PackageRelease> {
        self.versions.get(version)
    }

    /// Convert the `versions` map into a semver set. Unlisted releases keep
    /// their membership but are excluded from selection.
    pub fn version_set(&self) -> Result<VersionSet> {
        let mut set = VersionSet::new();
        for (version, release) in &self.versions {
            set.parse_insert(&self.name, version, !release.is_unlisted())?;
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING_JSON: &str = r#"{
        "_id": "de.basisprofil.r4",
        "name": "de.basisprofil.r4",
        "description": "German base profiles",
        "dist-tags": { "latest": "1.5.4" },
        "versions": {
            "0.9.0": {
                "name": "de.basisprofil.r4",
                "version": "0.9.0",
                "fhirVersion": "4.0.1",
                "dist": { "tarball": "https://packages.simplifier.net/de.basisprofil.r4/0.9.0" },
                "unlisted": "true"
            },
            "1.5.3": {
                "name": "de.basisprofil.r4",
                "version": "1.5.3",
                "dist": { "tarball": "https://packages.simplifier.net/de.basisprofil.r4/1.5.3" }
            },
            "1.5.4": {
                "name": "de.basisprofil.r4",
                "version": "1.5.4",
                "dist": { "tarball": "https://packages.simplifier.net/de.basisprofil.r4/1.5.4" }
            }
        }
    }"#;

    #[test]
    fn listing_deserializes() {
        let listing: PackageListing = serde_json::from_str(LISTING_JSON).expect("deserializes");

        assert_eq!(listing.id.as_deref(), Some("de.basisprofil.r4"));
        assert_eq!(listing.versions.len(), 3);
        assert_eq!(listing.tag("latest"), Some("1.5.4"));
        assert_eq!(listing.tag("next"), None);

        let release = listing.release("0.9.0").expect("release exists");
        assert!(release.is_unlisted());
        assert_eq!(release.fhir_version.as_deref(), Some("4.0.1"));
        assert!(!listing.release("1.5.3").unwrap().is_unlisted());
    }

    #[test]
    fn dist_tags_point_at_existing_versions() {
        let listing: PackageListing = serde_json::from_str(LISTING_JSON).expect("deserializes");
        for version in listing.dist_tags.values() {
            assert!(listing.versions.contains_key(version));
        }
    }

    #[test]
    fn version_set_honors_unlisted_markers() {
        let listing: PackageListing = serde_json::from_str(LISTING_JSON).expect("deserializes");
        let set = listing.version_set().expect("converts");

        assert_eq!(set.len(), 3);
        // 0.9.0 is unlisted, so selection never returns it
        assert_eq!(set.resolve("0.9.x", false).unwrap(), None);
        assert_eq!(set.latest(true).unwrap().to_string(), "1.5.4");
    }

    #[test]
    fn version_set_rejects_garbage_versions() {
        let listing: PackageListing = serde_json::from_str(
            r#"{ "name": "bad.pkg", "versions": { "not-semver": { "version": "not-semver" } } }"#,
        )
        .expect("deserializes");

        assert!(listing.version_set().is_err());
    }
}
