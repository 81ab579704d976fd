//! Semver version sets and range resolution.

use crate::error::{Error, Result};
use semver::{Version, VersionReq};

/// Ordered set of semver versions offered for one package, partitioned into
/// listed and unlisted members. Unlisted versions stay enumerable but are
/// never selected by [`VersionSet::latest`] or [`VersionSet::resolve`].
#[derive(Debug, Clone, Default)]
pub struct VersionSet {
    entries: Vec<VersionEntry>,
}

#[derive(Debug, Clone)]
struct VersionEntry {
    version: Version,
    listed: bool,
}

impl VersionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a version, keeping the set ordered. Re-inserting an existing
    /// version only upgrades it from unlisted to listed.
    pub fn insert(&mut self, version: Version, listed: bool) {
        match self
            .entries
            .binary_search_by(|entry| entry.version.cmp(&version))
        {
            Ok(index) => self.entries[index].listed |= listed,
            Err(index) => self.entries.insert(index, VersionEntry { version, listed }),
        }
    }

    /// Parse and insert a raw version string.
    pub fn parse_insert(&mut self, name: &str, raw: &str, listed: bool) -> Result<()> {
        let version = Version::parse(raw).map_err(|_| Error::InvalidVersion {
            name: name.to_string(),
            version: raw.to_string(),
        })?;
        self.insert(version, listed);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, version: &Version) -> bool {
        self.entries
            .binary_search_by(|entry| entry.version.cmp(version))
            .is_ok()
    }

    /// All members, ascending.
    pub fn iter(&self) -> impl Iterator<Item = &Version> {
        self.entries.iter().map(|entry| &entry.version)
    }

    /// The greatest listed member; with `stable`, prereleases are excluded.
    pub fn latest(&self, stable: bool) -> Option<&Version> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| entry.listed)
            .map(|entry| &entry.version)
            .find(|version| !stable || version.pre.is_empty())
    }

    /// The greatest listed member matching `range`; with `stable`, the
    /// non-prerelease subset. An empty range or `latest` maps to
    /// [`VersionSet::latest`].
    pub fn resolve(&self, range: &str, stable: bool) -> Result<Option<&Version>> {
        let range = range.trim();
        if range.is_empty() || range.eq_ignore_ascii_case("latest") {
            return Ok(self.latest(stable));
        }

        let requirement = VersionReq::parse(range).map_err(|e| Error::InvalidRange {
            range: range.to_string(),
            message: e.to_string(),
        })?;

        Ok(self
            .entries
            .iter()
            .rev()
            .filter(|entry| entry.listed)
            .map(|entry| &entry.version)
            .find(|version| {
                (!stable || version.pre.is_empty()) && requirement.matches(version)
            }))
    }

    /// Stable-preferred selection: try the stable subset first, then fall
    /// back to prereleases.
    pub fn select(&self, range: &str) -> Result<Option<&Version>> {
        match self.resolve(range, true)? {
            Some(version) => Ok(Some(version)),
            None => self.resolve(range, false),
        }
    }
}

impl FromIterator<(Version, bool)> for VersionSet {
    fn from_iter<I: IntoIterator<Item = (Version, bool)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (version, listed) in iter {
            set.insert(version, listed);
        }
        set
    }
}
