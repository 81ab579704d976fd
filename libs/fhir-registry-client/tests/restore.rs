//! Restore orchestration tests against in-memory server and cache doubles.

use async_trait::async_trait;
use cuprum_registry_client::{
    Error, InstallListener, PackageCache, PackageClosure, PackageContext, PackageDependency,
    PackageListing, PackageManifest, PackageReference, PackageRelease, PackageResolver,
    PackageServer, Result,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

fn manifest(name: &str, version: &str, deps: &[(&str, &str)]) -> PackageManifest {
    let mut manifest = PackageManifest::new(name, version);
    for (dep, range) in deps {
        manifest
            .dependencies
            .insert(dep.to_string(), range.to_string());
    }
    manifest
}

fn tgz(manifest: &PackageManifest) -> Vec<u8> {
    let json = serde_json::to_string(manifest).expect("serializes");
    let bytes = json.as_bytes();

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "package/package.json", bytes)
        .expect("appends manifest");
    let tar_bytes = builder.into_inner().expect("finishes archive");

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    std::io::Write::write_all(&mut encoder, &tar_bytes).expect("compresses");
    encoder.finish().expect("finishes gzip")
}

/// In-memory package server double.
struct MockServer {
    root: String,
    packages: HashMap<String, Vec<PackageManifest>>,
    failing: bool,
}

impl MockServer {
    fn new(root: &str, manifests: Vec<PackageManifest>) -> Arc<dyn PackageServer> {
        let mut packages: HashMap<String, Vec<PackageManifest>> = HashMap::new();
        for manifest in manifests {
            packages
                .entry(manifest.name.clone())
                .or_default()
                .push(manifest);
        }
        Arc::new(Self {
            root: root.to_string(),
            packages,
            failing: false,
        })
    }

    fn failing(root: &str) -> Arc<dyn PackageServer> {
        Arc::new(Self {
            root: root.to_string(),
            packages: HashMap::new(),
            failing: true,
        })
    }

    fn transport_error(&self) -> Error {
        Error::Registry {
            server: self.root.clone(),
            url: format!("{}/qas.json", self.root),
            status: 503,
        }
    }
}

#[async_trait]
impl PackageServer for MockServer {
    fn root(&self) -> &str {
        &self.root
    }

    async fn download_listing(&self, name: &str) -> Result<Option<PackageListing>> {
        if self.failing {
            return Err(self.transport_error());
        }
        let Some(manifests) = self.packages.get(name) else {
            return Ok(None);
        };

        let mut listing = PackageListing::new(name);
        for manifest in manifests {
            listing.versions.insert(
                manifest.version.clone(),
                PackageRelease {
                    name: name.to_string(),
                    version: manifest.version.clone(),
                    ..PackageRelease::default()
                },
            );
        }
        Ok(Some(listing))
    }

    async fn resolve(&self, dependency: &PackageDependency) -> Result<Option<PackageReference>> {
        let Some(listing) = self.download_listing(&dependency.name).await? else {
            return Ok(None);
        };
        let versions = listing.version_set()?;
        Ok(versions
            .select(&dependency.range)?
            .map(|version| PackageReference::new(&dependency.name, version.to_string())))
    }

    async fn get_package(&self, reference: &PackageReference) -> Result<Vec<u8>> {
        if self.failing {
            return Err(self.transport_error());
        }
        let not_found = || Error::PackageNotFound {
            name: reference.name.clone(),
            range: reference.version.clone().unwrap_or_default(),
        };

        let manifests = self.packages.get(&reference.name).ok_or_else(not_found)?;
        let manifest = manifests
            .iter()
            .find(|manifest| Some(manifest.version.as_str()) == reference.version.as_deref())
            .ok_or_else(not_found)?;
        Ok(tgz(manifest))
    }
}

/// In-memory cache double.
#[derive(Default)]
struct MemoryCache {
    installed: Mutex<HashMap<String, PackageManifest>>,
}

impl MemoryCache {
    fn key(name: &str, version: &str) -> String {
        format!("{}@{}", name.to_ascii_lowercase(), version)
    }

    fn seed(&self, manifest: PackageManifest) {
        let key = Self::key(&manifest.name, &manifest.version);
        self.installed.lock().unwrap().insert(key, manifest);
    }
}

#[async_trait]
impl PackageCache for MemoryCache {
    async fn is_installed(&self, reference: &PackageReference) -> Result<bool> {
        let Some(version) = reference.version.as_deref() else {
            return Ok(false);
        };
        Ok(self
            .installed
            .lock()
            .unwrap()
            .contains_key(&Self::key(&reference.name, version)))
    }

    async fn read_manifest(&self, reference: &PackageReference) -> Result<PackageManifest> {
        let version = reference.version.as_deref().unwrap_or_default();
        self.installed
            .lock()
            .unwrap()
            .get(&Self::key(&reference.name, version))
            .cloned()
            .ok_or_else(|| Error::PackageNotFound {
                name: reference.name.clone(),
                range: version.to_string(),
            })
    }

    async fn install(
        &self,
        reference: &PackageReference,
        bytes: &[u8],
    ) -> Result<PackageManifest> {
        let manifest = PackageManifest::from_tar_gz_bytes(bytes)?;
        let version = reference.version.as_deref().unwrap_or(&manifest.version);
        self.installed
            .lock()
            .unwrap()
            .insert(Self::key(&reference.name, version), manifest.clone());
        Ok(manifest)
    }

    async fn installed_versions(&self, name: &str) -> Result<Vec<PackageReference>> {
        Ok(self
            .installed
            .lock()
            .unwrap()
            .values()
            .filter(|manifest| manifest.name.eq_ignore_ascii_case(name))
            .map(|manifest| PackageReference::new(&manifest.name, &manifest.version))
            .collect())
    }
}

/// Records every on-installed callback.
#[derive(Default)]
struct Recorder {
    installed: Mutex<Vec<String>>,
}

#[async_trait]
impl InstallListener for Recorder {
    async fn on_installed(&self, reference: &PackageReference) {
        self.installed.lock().unwrap().push(reference.moniker());
    }
}

fn version_of(closure: &PackageClosure, name: &str) -> Option<String> {
    closure
        .get(name)
        .and_then(|reference| reference.version.clone())
}

#[tokio::test]
async fn restores_transitive_closure() {
    let server = MockServer::new(
        "https://mock.registry",
        vec![
            manifest("pkg.a", "1.0.0", &[("pkg.b", "^1.0")]),
            manifest("pkg.b", "1.0.0", &[]),
            manifest("pkg.b", "1.2.0", &[]),
        ],
    );
    let cache = Arc::new(MemoryCache::default());
    let recorder = Arc::new(Recorder::default());
    let context =
        PackageContext::new(vec![server], cache.clone()).with_listener(recorder.clone());

    let root = manifest("my.root", "0.1.0", &[("pkg.a", "1.0.0")]);
    let closure = context.restore(&root).await.expect("restores");

    assert_eq!(closure.len(), 2);
    assert_eq!(version_of(&closure, "pkg.a").as_deref(), Some("1.0.0"));
    assert_eq!(version_of(&closure, "pkg.b").as_deref(), Some("1.2.0"));
    assert!(closure.missing().is_empty());

    assert!(cache
        .is_installed(&PackageReference::new("pkg.b", "1.2.0"))
        .await
        .unwrap());

    let mut installed = recorder.installed.lock().unwrap().clone();
    installed.sort();
    assert_eq!(installed, vec!["pkg.a@1.0.0", "pkg.b@1.2.0"]);
}

#[tokio::test]
async fn conflicting_requirements_keep_highest_version() {
    let server = MockServer::new(
        "https://mock.registry",
        vec![
            manifest("pkg.c", "1.0.0", &[("pkg.shared", "1.0.0")]),
            manifest("pkg.d", "1.0.0", &[("pkg.shared", "2.0.0")]),
            manifest("pkg.shared", "1.0.0", &[]),
            manifest("pkg.shared", "2.0.0", &[]),
        ],
    );
    let cache = Arc::new(MemoryCache::default());
    let context = PackageContext::new(vec![server], cache.clone());

    let root = manifest(
        "my.root",
        "0.1.0",
        &[("pkg.c", "1.0.0"), ("pkg.d", "1.0.0")],
    );
    let closure = context.restore(&root).await.expect("restores");

    assert_eq!(closure.len(), 3);
    assert_eq!(version_of(&closure, "pkg.shared").as_deref(), Some("2.0.0"));
    assert!(cache
        .is_installed(&PackageReference::new("pkg.shared", "2.0.0"))
        .await
        .unwrap());
}

#[tokio::test]
async fn unresolvable_dependencies_are_recorded_as_missing() {
    let server = MockServer::new("https://mock.registry", Vec::new());
    let cache = Arc::new(MemoryCache::default());
    let context = PackageContext::new(vec![server], cache);

    let root = manifest("my.root", "0.1.0", &[("pkg.ghost", "1.0.0")]);
    let closure = context.restore(&root).await.expect("restores");

    assert!(closure.is_empty());
    assert_eq!(closure.missing().len(), 1);
    assert_eq!(closure.missing()[0].name, "pkg.ghost");
}

#[tokio::test]
async fn installed_but_unresolvable_is_accepted_silently() {
    let server = MockServer::new("https://mock.registry", Vec::new());
    let cache = Arc::new(MemoryCache::default());
    cache.seed(manifest("pkg.ghost", "0.9.0", &[]));
    let context = PackageContext::new(vec![server], cache);

    // no source satisfies 2.0.0, but some version is installed locally
    let root = manifest("my.root", "0.1.0", &[("pkg.ghost", "2.0.0")]);
    let closure = context.restore(&root).await.expect("restores");

    assert!(closure.is_empty());
    assert!(closure.missing().is_empty());
}

#[tokio::test]
async fn dependency_cycles_terminate() {
    let server = MockServer::new(
        "https://mock.registry",
        vec![
            manifest("pkg.a", "1.0.0", &[("pkg.b", "1.0.0")]),
            manifest("pkg.b", "1.0.0", &[("pkg.a", "1.0.0")]),
        ],
    );
    let cache = Arc::new(MemoryCache::default());
    let context = PackageContext::new(vec![server], cache);

    let root = manifest("my.root", "0.1.0", &[("pkg.a", "1.0.0")]);
    let closure = context.restore(&root).await.expect("terminates");

    assert_eq!(closure.len(), 2);
    assert!(closure.contains("pkg.a"));
    assert!(closure.contains("pkg.b"));
}

#[tokio::test]
async fn already_cached_packages_are_not_reinstalled() {
    let server = MockServer::new(
        "https://mock.registry",
        vec![
            manifest("pkg.a", "1.0.0", &[]),
            manifest("pkg.b", "1.0.0", &[]),
        ],
    );
    let cache = Arc::new(MemoryCache::default());
    cache.seed(manifest("pkg.a", "1.0.0", &[]));
    let recorder = Arc::new(Recorder::default());
    let context =
        PackageContext::new(vec![server], cache).with_listener(recorder.clone());

    let root = manifest(
        "my.root",
        "0.1.0",
        &[("pkg.a", "1.0.0"), ("pkg.b", "1.0.0")],
    );
    let closure = context.restore(&root).await.expect("restores");

    assert_eq!(closure.len(), 2);
    let installed = recorder.installed.lock().unwrap().clone();
    assert_eq!(installed, vec!["pkg.b@1.0.0"]);
}

#[tokio::test]
async fn later_servers_answer_when_earlier_ones_cannot() {
    let empty = MockServer::new("https://first.registry", Vec::new());
    let failing = MockServer::failing("https://second.registry");
    let answering = MockServer::new(
        "https://third.registry",
        vec![manifest("pkg.a", "1.0.0", &[])],
    );
    let resolver = PackageResolver::new(vec![empty, failing, answering], None);

    let resolved = resolver
        .resolve(&PackageDependency::new("pkg.a", "1.0.0"))
        .await
        .expect("resolves")
        .expect("found");
    assert_eq!(resolved.version.as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn transport_error_from_final_source_surfaces() {
    let failing = MockServer::failing("https://only.registry");
    let resolver = PackageResolver::new(vec![failing], None);

    let result = resolver
        .resolve(&PackageDependency::new("pkg.a", "1.0.0"))
        .await;
    assert!(matches!(result, Err(Error::Registry { .. })));
}

#[tokio::test]
async fn load_or_install_returns_the_installed_manifest() {
    let server = MockServer::new(
        "https://mock.registry",
        vec![manifest("pkg.a", "1.0.0", &[("pkg.b", "1.0.0")])],
    );
    let cache = Arc::new(MemoryCache::default());
    let context = PackageContext::new(vec![server], cache);

    let installed = context
        .load_or_install("pkg.a", "1.0.0")
        .await
        .expect("installs");
    assert_eq!(installed.name, "pkg.a");
    assert_eq!(installed.dependencies.len(), 1);

    assert!(matches!(
        context.load_or_install("pkg.ghost", "1.0.0").await,
        Err(Error::PackageNotFound { .. })
    ));
}

#[tokio::test]
async fn get_latest_picks_greatest_across_servers() {
    let older = MockServer::new(
        "https://first.registry",
        vec![manifest("pkg.a", "1.0.0", &[])],
    );
    let newer = MockServer::new(
        "https://second.registry",
        vec![manifest("pkg.a", "2.0.0", &[])],
    );
    let resolver = PackageResolver::new(vec![older, newer], None);

    let latest = resolver
        .get_latest("pkg.a")
        .await
        .expect("resolves")
        .expect("found");
    assert_eq!(latest.version.as_deref(), Some("2.0.0"));
}
