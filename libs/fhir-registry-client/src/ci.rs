//! Adapter for the FHIR CI build server (`build.fhir.org`).
//!
//! The build server is not a registry: it exposes a single JSON listing
//! (`qas.json`) describing the current CI build of every Implementation
//! Guide. This module synthesizes NPM-style listings from those records,
//! maps tag discriminators (`current`, `current$<branch>`, bare branch
//! names) onto concrete semver versions, and serves tarballs from the
//! per-build site layout.

use crate::error::{Error, Result};
use crate::models::{Dist, PackageListing, PackageRelease};
use crate::server::PackageServer;
use crate::versions::VersionSet;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use cuprum_package::{PackageDependency, PackageReference};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Scope sentinel that routes a reference to the CI build server.
pub const CI_SCOPE: &str = "build.fhir.org";

/// Root of the CI build site.
pub const CI_ROOT: &str = "https://build.fhir.org/ig";

/// Dist-tag pointing at the default-branch build.
pub const CURRENT_TAG: &str = "current";

const BUILD_STAMP_FORMAT: &str = "%Y%m%d-%H%M%SZ";
const BUILD_DATE_FORMAT: &str = "%a, %d %b, %Y %H:%M:%S %z";
const DEFAULT_BRANCHES: [&str; 2] = ["main", "master"];
const BRANCH_MARKERS: [&str; 2] = ["branches/", "tree/"];

/// One row of `qas.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CiQaRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "package-id", default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<String>,
    #[serde(rename = "ig-ver", default, skip_serializing_if = "Option::is_none")]
    pub package_version: Option<String>,
    #[serde(rename = "date", default, skip_serializing_if = "Option::is_none")]
    pub build_date: Option<String>,
    #[serde(rename = "dateISO8601", default, skip_serializing_if = "Option::is_none")]
    pub build_date_iso: Option<String>,
    #[serde(rename = "version", default, skip_serializing_if = "Option::is_none")]
    pub fhir_version: Option<String>,
    #[serde(rename = "repo", default, skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Branch component of a repository URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoBranch {
    pub name: String,
    pub is_default: bool,
}

impl CiQaRecord {
    /// Build timestamp in UTC, preferring the ISO 8601 encoding.
    pub fn build_timestamp(&self) -> Option<DateTime<Utc>> {
        if let Some(iso) = self.build_date_iso.as_deref() {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(iso) {
                return Some(parsed.with_timezone(&Utc));
            }
        }
        let raw = self.build_date.as_deref()?;
        DateTime::parse_from_str(raw, BUILD_DATE_FORMAT)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc))
    }

    /// Branch named in the repository URL after a `branches/` or `tree/`
    /// marker. `None` means no marker is present and the build belongs to
    /// the default branch.
    pub fn branch(&self) -> Option<RepoBranch> {
        let repo = self.repository_url.as_deref()?;
        let start = BRANCH_MARKERS
            .iter()
            .find_map(|marker| repo.find(marker).map(|index| index + marker.len()))?;
        let name = repo[start..].split('/').next().unwrap_or_default();
        if name.is_empty() {
            return None;
        }
        Some(RepoBranch {
            name: name.to_string(),
            is_default: DEFAULT_BRANCHES.contains(&name),
        })
    }

    /// Site URL with any `/ImplementationGuide/...` suffix stripped.
    pub fn site_url(&self) -> Option<String> {
        let url = self.url.as_deref()?;
        let stripped = match url.find("/ImplementationGuide/") {
            Some(index) => &url[..index],
            None => url,
        };
        Some(stripped.trim_end_matches('/').to_string())
    }

    /// Tarball URL for this build: `{site}/package.tgz`, with a
    /// `branches/{name}` segment for non-default branches.
    pub fn tarball_url(&self) -> Option<String> {
        let site = self.site_url()?;
        match self.branch() {
            Some(branch) if !branch.is_default => {
                Some(format!("{}/branches/{}/package.tgz", site, branch.name))
            }
            _ => Some(format!("{}/package.tgz", site)),
        }
    }
}

/// Replace every non-alphanumeric character with `-`; length is preserved.
pub fn clean_for_semver(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Synthesize the semver-compliant version string for one build record.
///
/// `{ig-ver}[-cibuild[.b-{branch}]]+{meta}` where `meta` is the UTC build
/// timestamp when the record carries one, else a sanitized repository prefix
/// or the literal `ci`. The `-cibuild` prerelease is omitted when the
/// declared version already carries one, and the branch component only
/// appears for dateless builds of non-default branches.
pub fn cibuild_version(record: &CiQaRecord) -> String {
    let package_version = record.package_version.as_deref().unwrap_or("0.0.0");
    let mut prerelease = if package_version.contains('-') {
        String::new()
    } else {
        "-cibuild".to_string()
    };

    let meta = match record.build_timestamp() {
        Some(timestamp) => timestamp.format(BUILD_STAMP_FORMAT).to_string(),
        None => {
            if let Some(branch) = record.branch() {
                if !branch.is_default {
                    prerelease.push_str(".b-");
                    prerelease.push_str(&clean_for_semver(&branch.name));
                }
            }
            repo_prefix(record.repository_url.as_deref()).unwrap_or_else(|| "ci".to_string())
        }
    };

    format!(
        "{}{}+{}",
        package_version,
        prerelease,
        clean_for_semver(&meta)
    )
}

/// First two path components of the repository URL, joined by `.`.
fn repo_prefix(repository_url: Option<&str>) -> Option<String> {
    let mut parts = repository_url?.split('/').filter(|part| !part.is_empty());
    let org = parts.next()?;
    let name = parts.next()?;
    Some(format!("{}.{}", org, name))
}

/// Configuration for the CI build server client.
#[derive(Debug, Clone)]
pub struct CiServerOptions {
    /// `-1` never refreshes a loaded listing, `0` disables caching entirely,
    /// positive values refresh after that many seconds.
    pub listing_invalidation_seconds: i64,
    /// Accept invalid TLS certificates (testing only).
    pub insecure: bool,
}

impl Default for CiServerOptions {
    fn default() -> Self {
        Self {
            listing_invalidation_seconds: -1,
            insecure: false,
        }
    }
}

/// A resolved CI build: the tag-style reference and the concrete version it
/// maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReferences {
    pub tagged: PackageReference,
    pub resolved: PackageReference,
}

/// Filters for searching the CI build catalog.
#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    /// Exact package id.
    pub package_id: Option<String>,
    /// Exact FHIR version.
    pub fhir_version: Option<String>,
    /// Exact site URL (after stripping any `/ImplementationGuide/...`).
    pub site_url: Option<String>,
    /// Repository prefix; a leading GitHub host is stripped before matching.
    pub repository: Option<String>,
    /// Bare branch name, matched as a `/branches/{name}/qa.json` suffix.
    pub branch: Option<String>,
}

#[derive(Debug, Default)]
struct QasSnapshot {
    records: Vec<CiQaRecord>,
    by_package_id: HashMap<String, Vec<CiQaRecord>>,
    updated_at: DateTime<Utc>,
}

impl QasSnapshot {
    fn build(records: Vec<CiQaRecord>) -> Self {
        let mut by_package_id: HashMap<String, Vec<CiQaRecord>> = HashMap::new();
        for record in &records {
            if let Some(package_id) = &record.package_id {
                by_package_id
                    .entry(package_id.clone())
                    .or_default()
                    .push(record.clone());
            }
        }
        Self {
            records,
            by_package_id,
            updated_at: Utc::now(),
        }
    }
}

/// Client for the FHIR CI build server.
///
/// The `qas.json` listing is cached in-memory with a configurable TTL;
/// refreshes build the new snapshot off to the side and publish it
/// atomically, so concurrent readers always see a complete snapshot.
pub struct CiServer {
    root: String,
    client: Client,
    options: CiServerOptions,
    snapshot: RwLock<Option<Arc<QasSnapshot>>>,
    refresh_lock: Mutex<()>,
}

impl CiServer {
    /// Client for `build.fhir.org` with default options.
    pub fn new() -> Result<Self> {
        Self::with_options(CiServerOptions::default())
    }

    pub fn with_options(options: CiServerOptions) -> Result<Self> {
        Self::with_root(CI_ROOT, options)
    }

    /// Client for a CI build site at a custom root. Trailing slashes are
    /// stripped.
    pub fn with_root(root: impl Into<String>, options: CiServerOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(options.insecure)
            .build()?;
        Ok(Self {
            root: root.into().trim_end_matches('/').to_string(),
            client,
            options,
            snapshot: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Client seeded with an already-loaded record set; nothing is
    /// downloaded until the TTL expires. Intended for tests and offline use.
    pub fn from_records(records: Vec<CiQaRecord>) -> Result<Self> {
        let mut server = Self::new()?;
        *server.snapshot.get_mut() = Some(Arc::new(QasSnapshot::build(records)));
        Ok(server)
    }

    fn qas_url(&self) -> String {
        format!("{}/qas.json", self.root)
    }

    fn is_fresh(&self, snapshot: &QasSnapshot) -> bool {
        match self.options.listing_invalidation_seconds {
            ttl if ttl < 0 => true,
            0 => false,
            ttl => {
                Utc::now()
                    .signed_duration_since(snapshot.updated_at)
                    .num_seconds()
                    <= ttl
            }
        }
    }

    async fn current_snapshot(&self) -> Option<Arc<QasSnapshot>> {
        self.snapshot.read().await.clone()
    }

    async fn snapshot(&self) -> Result<Arc<QasSnapshot>> {
        if let Some(snapshot) = self.current_snapshot().await {
            if self.is_fresh(&snapshot) {
                return Ok(snapshot);
            }
        }
        self.refresh(false).await
    }

    /// Force a refresh of the `qas.json` cache regardless of TTL.
    pub async fn update_listing_cache(&self) -> Result<()> {
        self.refresh(true).await.map(|_| ())
    }

    async fn refresh(&self, force: bool) -> Result<Arc<QasSnapshot>> {
        let _guard = self.refresh_lock.lock().await;
        if !force {
            if let Some(snapshot) = self.current_snapshot().await {
                if self.is_fresh(&snapshot) {
                    return Ok(snapshot);
                }
            }
        }

        let records = self.download_qas().await?;
        debug!(records = records.len(), "refreshed CI build listing");
        let snapshot = Arc::new(QasSnapshot::build(records));
        if self.options.listing_invalidation_seconds != 0 {
            *self.snapshot.write().await = Some(snapshot.clone());
        }
        Ok(snapshot)
    }

    async fn download_qas(&self) -> Result<Vec<CiQaRecord>> {
        let url = self.qas_url();
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Registry {
                server: self.root.clone(),
                url,
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| Error::InvalidListing {
            name: "qas.json".to_string(),
            server: self.root.clone(),
            message: e.to_string(),
        })
    }

    /// Resolve a version discriminator (`current`, `current$<branch>`, a
    /// bare branch name, or a concrete synthesized version) for a package.
    pub async fn get_references(
        &self,
        name: &str,
        discriminator: Option<&str>,
    ) -> Result<Option<BuildReferences>> {
        let snapshot = self.snapshot().await?;
        let Some(records) = snapshot.by_package_id.get(name) else {
            return Ok(None);
        };

        let listing = synthesize_listing(name, records);
        let Some((tag, version)) = discriminate(&listing, discriminator) else {
            return Ok(None);
        };

        Ok(Some(BuildReferences {
            tagged: PackageReference::scoped(CI_SCOPE, name, tag),
            resolved: PackageReference::scoped(CI_SCOPE, name, version),
        }))
    }

    /// Tarball URL for a CI reference; the version may be a tag
    /// discriminator or a concrete synthesized version.
    pub async fn tarball_url_for(&self, reference: &PackageReference) -> Result<String> {
        let snapshot = self.snapshot().await?;
        let not_found = || Error::PackageNotFound {
            name: reference.name.clone(),
            range: reference.version.clone().unwrap_or_default(),
        };

        let Some(records) = snapshot.by_package_id.get(&reference.name) else {
            return Err(not_found());
        };
        let listing = synthesize_listing(&reference.name, records);
        let Some((_, version)) = discriminate(&listing, reference.version.as_deref()) else {
            return Err(not_found());
        };
        let Some(record) = record_for_version(records, &version) else {
            return Err(not_found());
        };

        record.tarball_url().ok_or_else(|| Error::InvalidListing {
            name: reference.name.clone(),
            server: self.root.clone(),
            message: "build record has no site url".to_string(),
        })
    }

    /// Search the CI catalog; records are deduplicated by package id, first
    /// hit wins.
    pub async fn catalog_packages(&self, filter: &CatalogFilter) -> Result<Vec<CiQaRecord>> {
        let snapshot = self.snapshot().await?;
        let repository = filter.repository.as_deref().map(strip_github_host);
        let branch_suffix = filter
            .branch
            .as_ref()
            .map(|branch| format!("/branches/{}/qa.json", branch));

        let mut seen = HashSet::new();
        let mut hits = Vec::new();
        for record in &snapshot.records {
            let Some(package_id) = record.package_id.as_deref() else {
                continue;
            };
            if let Some(want) = filter.package_id.as_deref() {
                if package_id != want {
                    continue;
                }
            }
            if let Some(want) = filter.fhir_version.as_deref() {
                if record.fhir_version.as_deref() != Some(want) {
                    continue;
                }
            }
            if let Some(want) = filter.site_url.as_deref() {
                if record.site_url().as_deref() != Some(want) {
                    continue;
                }
            }
            if let Some(prefix) = repository.as_deref() {
                if !record
                    .repository_url
                    .as_deref()
                    .is_some_and(|repo| repo.starts_with(prefix))
                {
                    continue;
                }
            }
            if let Some(suffix) = branch_suffix.as_deref() {
                if !record
                    .repository_url
                    .as_deref()
                    .is_some_and(|repo| repo.ends_with(suffix))
                {
                    continue;
                }
            }
            if seen.insert(package_id.to_string()) {
                hits.push(record.clone());
            }
        }
        Ok(hits)
    }
}

/// Synthesize an NPM-style listing from the build records of one package.
///
/// Versions are inserted in status order (so `active` records win over
/// `retired` duplicates); dist-tags are written in build-date order so later
/// builds overwrite earlier ones, except `current`, which the first
/// default-branch build claims.
fn synthesize_listing(package_id: &str, records: &[CiQaRecord]) -> PackageListing {
    let mut listing = PackageListing::new(package_id);
    listing.description = records.first().and_then(|record| record.description.clone());

    let mut by_status: Vec<&CiQaRecord> = records.iter().collect();
    by_status.sort_by(|a, b| a.status.cmp(&b.status));
    for record in by_status {
        let version = cibuild_version(record);
        if listing.versions.contains_key(&version) {
            continue;
        }
        let site = record.site_url();
        listing.versions.insert(
            version.clone(),
            PackageRelease {
                name: package_id.to_string(),
                version,
                description: record.description.clone(),
                fhir_version: record.fhir_version.clone(),
                url: site.clone(),
                dist: Some(Dist {
                    tarball: site,
                    shasum: None,
                }),
                unlisted: None,
                extra: Map::new(),
            },
        );
    }

    let mut by_date: Vec<&CiQaRecord> = records.iter().collect();
    by_date.sort_by_key(|record| record.build_timestamp());
    for record in by_date {
        let version = cibuild_version(record);
        match record.branch() {
            None => {
                listing.dist_tags.insert(CURRENT_TAG.to_string(), version);
            }
            Some(branch) => {
                listing
                    .dist_tags
                    .insert(format!("{}${}", CURRENT_TAG, branch.name), version.clone());
                if branch.is_default {
                    listing
                        .dist_tags
                        .entry(CURRENT_TAG.to_string())
                        .or_insert(version);
                }
            }
        }
    }

    listing
}

/// Map a discriminator onto `(tag, concrete version)` against a synthesized
/// listing. An empty discriminator means `current`; values without `+` are
/// tried as a dist-tag, then as `current$<value>`; concrete versions pass
/// through when the listing contains them.
fn discriminate(
    listing: &PackageListing,
    discriminator: Option<&str>,
) -> Option<(String, String)> {
    let discriminator = discriminator.unwrap_or("").trim();
    let discriminator = if discriminator.is_empty() {
        CURRENT_TAG
    } else {
        discriminator
    };

    if discriminator.contains('+') {
        if !listing.versions.contains_key(discriminator) {
            return None;
        }
        let tag = listing
            .dist_tags
            .iter()
            .find(|(_, version)| version.as_str() == discriminator)
            .map(|(tag, _)| tag.clone())
            .unwrap_or_else(|| discriminator.to_string());
        return Some((tag, discriminator.to_string()));
    }

    if let Some(version) = listing.tag(discriminator) {
        return Some((discriminator.to_string(), version.to_string()));
    }

    let branch_tag = format!("{}${}", CURRENT_TAG, discriminator);
    listing
        .tag(&branch_tag)
        .map(|version| (branch_tag, version.to_string()))
}

/// Find the record a concrete synthesized version came from, by matching
/// the build-metadata timestamp; dateless versions fall back to re-running
/// the synthesis.
fn record_for_version<'a>(records: &'a [CiQaRecord], version: &str) -> Option<&'a CiQaRecord> {
    if let Some((_, meta)) = version.rsplit_once('+') {
        if let Ok(stamp) = NaiveDateTime::parse_from_str(meta, BUILD_STAMP_FORMAT) {
            let stamp = stamp.and_utc();
            return records
                .iter()
                .find(|record| record.build_timestamp() == Some(stamp));
        }
    }
    records.iter().find(|record| cibuild_version(record) == version)
}

fn strip_github_host(value: &str) -> String {
    let stripped = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))
        .unwrap_or(value);
    stripped
        .strip_prefix("github.com/")
        .unwrap_or(stripped)
        .trim_start_matches('/')
        .to_string()
}

#[async_trait]
impl PackageServer for CiServer {
    fn root(&self) -> &str {
        &self.root
    }

    async fn download_listing(&self, name: &str) -> Result<Option<PackageListing>> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot
            .by_package_id
            .get(name)
            .map(|records| synthesize_listing(name, records)))
    }

    async fn get_versions(&self, name: &str) -> Result<VersionSet> {
        let Some(listing) = self.download_listing(name).await? else {
            return Ok(VersionSet::new());
        };
        let versions = listing.version_set()?;
        if versions.len() != listing.versions.len() {
            return Err(Error::VersionCountMismatch {
                name: name.to_string(),
                listed: listing.versions.len(),
                resolved: versions.len(),
            });
        }
        Ok(versions)
    }

    async fn resolve(&self, dependency: &PackageDependency) -> Result<Option<PackageReference>> {
        if let Some(references) = self
            .get_references(&dependency.name, Some(dependency.range.as_str()))
            .await?
        {
            debug!(package = %dependency.name, resolved = %references.resolved, "resolved CI build");
            return Ok(Some(references.resolved));
        }

        // Not a tag discriminator; fall back to range resolution against the
        // synthesized listing.
        let Some(listing) = self.download_listing(&dependency.name).await? else {
            return Ok(None);
        };
        let versions = listing.version_set()?;
        let selected = match versions.select(&dependency.range) {
            Ok(selected) => selected,
            Err(Error::InvalidRange { .. }) => None,
            Err(e) => return Err(e),
        };
        Ok(selected.map(|version| {
            PackageReference::scoped(CI_SCOPE, &dependency.name, version.to_string())
        }))
    }

    async fn get_package(&self, reference: &PackageReference) -> Result<Vec<u8>> {
        if !reference.is_scoped(CI_SCOPE) {
            return Err(Error::MisroutedReference {
                moniker: reference.moniker(),
                server: self.root.clone(),
            });
        }

        let url = self.tarball_url_for(reference).await?;
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(Error::PackageNotFound {
                name: reference.name.clone(),
                range: reference.version.clone().unwrap_or_default(),
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
