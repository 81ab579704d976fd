//! Accumulated result of a restore operation.

use cuprum_package::{PackageDependency, PackageReference};
use semver::Version;
use std::collections::BTreeMap;

/// The set of references accepted during a restore, one per package name,
/// plus the requirements nothing could satisfy.
///
/// On conflicting versions for the same name the highest semver wins; ties
/// keep the incumbent. Names compare case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct PackageClosure {
    resolved: BTreeMap<String, PackageReference>,
    missing: Vec<PackageDependency>,
}

impl PackageClosure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a reference to the closure. Returns `true` iff it was newly
    /// accepted — the caller must then walk the package's own dependencies.
    pub fn add(&mut self, reference: PackageReference) -> bool {
        let key = reference.name.to_ascii_lowercase();
        let accepted = match self.resolved.get(&key) {
            None => true,
            Some(incumbent) => wins_over(&reference, incumbent),
        };
        if accepted {
            self.resolved.insert(key, reference);
        }
        accepted
    }

    /// Record a requirement nothing could satisfy. Does not displace an
    /// accepted reference of the same name.
    pub fn add_missing(&mut self, dependency: PackageDependency) {
        if !self.missing.contains(&dependency) {
            self.missing.push(dependency);
        }
    }

    /// The accepted reference for a name, if any.
    pub fn get(&self, name: &str) -> Option<&PackageReference> {
        self.resolved.get(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Accepted references, ordered by name.
    pub fn packages(&self) -> impl Iterator<Item = &PackageReference> {
        self.resolved.values()
    }

    pub fn missing(&self) -> &[PackageDependency] {
        &self.missing
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}

/// Whether `candidate` displaces `incumbent`: strictly higher semver wins,
/// everything else keeps the incumbent.
fn wins_over(candidate: &PackageReference, incumbent: &PackageReference) -> bool {
    match (parse_version(candidate), parse_version(incumbent)) {
        (Some(new), Some(old)) => new > old,
        (Some(_), None) => true,
        _ => false,
    }
}

fn parse_version(reference: &PackageReference) -> Option<Version> {
    Version::parse(reference.version.as_deref()?).ok()
}
