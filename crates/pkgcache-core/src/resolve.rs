//! Named package resolution: exact versions, ranges and dist-tags.

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::paths::{check_package_id, registry_url, tarball_path};
use crate::range::{parse_version_loose, VersionRange};
use crate::registry::{GetOptions, Manifest, Packument};
use crate::service::CacheService;
use semver::Version;
use tracing::{debug, trace};
use url::Url;

/// How a version specifier is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    Exact(String),
    Range(String),
    /// `None` means the configured default tag.
    Tag(Option<String>),
}

impl VersionSpec {
    /// Classify `spec`: empty → default tag, semver literal, range, else tag.
    #[must_use]
    pub fn classify(spec: &str) -> Self {
        let spec = spec.trim();
        if spec.is_empty() {
            return Self::Tag(None);
        }
        if let Some(version) = parse_version_loose(spec) {
            return Self::Exact(version.to_string());
        }
        if VersionRange::parse(spec).is_ok() {
            return Self::Range(spec.to_string());
        }
        Self::Tag(Some(spec.to_string()))
    }
}

/// A version in a package document with its engine eligibility.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Key in `versions`.
    pub key: String,
    pub version: Version,
    /// False when `engines` excludes the running node/npm.
    pub eligible: bool,
}

/// Parse every version of `doc` and mark the ones whose `engines` the
/// configured node/npm versions fail. Checks are skipped under `force`.
#[must_use]
pub fn candidates(doc: &Packument, config: &CacheConfig) -> Vec<Candidate> {
    doc.versions
        .iter()
        .filter_map(|(key, manifest)| {
            let version = parse_version_loose(key)?;
            let eligible = config.force || engines_allow(manifest, config);
            Some(Candidate {
                key: key.clone(),
                version,
                eligible,
            })
        })
        .collect()
}

fn engines_allow(manifest: &Manifest, config: &CacheConfig) -> bool {
    let check = |engine: &str, running: Option<&Version>| match (manifest.engine(engine), running) {
        (Some(range), Some(running)) => VersionRange::parse(range)
            .map(|r| r.matches(running))
            // Unparseable engine ranges do not exclude a version
            .unwrap_or(true),
        _ => true,
    };
    check("node", config.node_version.as_ref()) && check("npm", config.npm_version.as_ref())
}

/// Pick the version a range resolves to.
///
/// The default tag wins when it satisfies the range; otherwise the highest
/// eligible satisfying version. A match-anything range falls back to the
/// default tag when nothing else matched (e.g. only prereleases exist).
#[must_use]
pub fn select_range(
    doc: &Packument,
    candidates: &[Candidate],
    range: &VersionRange,
    default_tag: &str,
) -> Option<String> {
    let eligible = || candidates.iter().filter(|c| c.eligible);

    if let Some(tagged) = doc.tag(default_tag) {
        if let Some(c) = eligible().find(|c| c.key == tagged) {
            if range.matches(&c.version) {
                trace!(tag = default_tag, version = %c.key, "tag satisfies range");
                return Some(c.key.clone());
            }
        }
    }

    if let Some(best) = range.max_satisfying(eligible().map(|c| &c.version)) {
        return eligible().find(|c| &c.version == best).map(|c| c.key.clone());
    }

    if range.is_any() && !candidates.is_empty() {
        if let Some(tagged) = doc.tag(default_tag) {
            if doc.versions.contains_key(tagged) {
                return Some(tagged.to_string());
            }
        }
    }
    None
}

fn no_target(name: &str, spec: &str, doc: &Packument) -> CacheError {
    CacheError::NoTarget {
        name: name.to_string(),
        spec: spec.to_string(),
        available: doc.versions.keys().cloned().collect(),
    }
}

/// Use the registry's scheme for tarballs hosted on the registry's host.
#[must_use]
pub fn align_tarball_scheme(tarball: &str, registry: &Url) -> String {
    let Ok(mut url) = Url::parse(tarball) else {
        return tarball.to_string();
    };
    if url.host_str() == registry.host_str() && url.scheme() != registry.scheme() {
        let default_port = url.port().is_none();
        if url.set_scheme(registry.scheme()).is_ok() {
            if default_port {
                let _ = url.set_port(registry.port());
            }
            return url.to_string();
        }
    }
    tarball.to_string()
}

impl CacheService {
    /// Fetch the package document for `name` through the metadata cache.
    ///
    /// Returns the document and the response status (`304` when served from
    /// or revalidated against the cache).
    ///
    /// # Errors
    /// Registry and JSON errors.
    pub async fn packument(&self, name: &str) -> Result<(Packument, u16)> {
        let registry = self.config().registry_for(name);
        let uri = registry_url(registry, name, None)?;
        let response = self.registry().get(uri.as_str(), GetOptions::default()).await?;
        let doc = Packument::from_value(response.data)
            .map_err(|e| CacheError::json(uri.as_str(), &e))?;
        Ok((doc, response.status))
    }

    /// Resolve `name@spec` to a version manifest without fetching the tarball.
    ///
    /// # Errors
    /// [`CacheError::NoTarget`] when nothing matches; registry errors.
    pub async fn resolve(&self, name: &str, spec: &str) -> Result<Manifest> {
        let (doc, _) = self.packument(name).await?;
        let version = self.select(name, spec, &doc)?;
        doc.version(&version)
            .cloned()
            .ok_or_else(|| no_target(name, spec, &doc))
    }

    /// Choose the version key `spec` selects from `doc`.
    fn select(&self, name: &str, spec: &str, doc: &Packument) -> Result<String> {
        match VersionSpec::classify(spec) {
            VersionSpec::Exact(version) => {
                if doc.versions.contains_key(&version) {
                    Ok(version)
                } else {
                    Err(version_not_found(name, &version))
                }
            }
            VersionSpec::Range(range) => self.select_in_range(name, &range, doc),
            VersionSpec::Tag(tag) => self.select_tag(name, tag.as_deref(), doc),
        }
    }

    fn select_in_range(&self, name: &str, range: &str, doc: &Packument) -> Result<String> {
        let parsed = VersionRange::parse(range)?;
        let candidates = candidates(doc, self.config());
        select_range(doc, &candidates, &parsed, &self.config().tag)
            .ok_or_else(|| no_target(name, range, doc))
    }

    fn select_tag(&self, name: &str, tag: Option<&str>, doc: &Packument) -> Result<String> {
        let explicit = tag.is_some();
        let tag = tag.unwrap_or(&self.config().tag);

        if let Some(version) = doc.tag(tag) {
            if doc.versions.contains_key(version) {
                return Ok(version.to_string());
            }
        }
        if !explicit && !doc.versions.is_empty() {
            debug!(name = %name, tag = %tag, "default tag missing, falling back to *");
            return self.select_in_range(name, "*", doc);
        }
        Err(no_target(name, tag, doc))
    }

    /// Resolve `name@spec` and make sure its tarball is cached.
    ///
    /// # Errors
    /// [`CacheError::NoTarget`], registry, download and integrity errors.
    pub async fn add_named(&self, name: &str, spec: &str) -> Result<Manifest> {
        let key = format!("named:{name}@{spec}");
        self.inner()
            .named
            .run(&key, || async {
                match VersionSpec::classify(spec) {
                    VersionSpec::Exact(version) => self.add_name_version(name, &version).await,
                    VersionSpec::Range(range) => self.add_name_range(name, &range).await,
                    VersionSpec::Tag(tag) => self.add_name_tag(name, tag.as_deref()).await,
                }
            })
            .await
    }

    /// Cache an exact version.
    ///
    /// # Errors
    /// `E404` when the version does not exist; see [`Self::add_named`].
    pub async fn add_name_version(&self, name: &str, version: &str) -> Result<Manifest> {
        let (doc, status) = self.packument(name).await?;
        if !doc.versions.contains_key(version) {
            return Err(version_not_found(name, version));
        }
        self.add_from_document(name, version, &doc, status).await
    }

    /// Cache the version a range resolves to.
    ///
    /// # Errors
    /// See [`Self::add_named`].
    pub async fn add_name_range(&self, name: &str, range: &str) -> Result<Manifest> {
        let (doc, status) = self.packument(name).await?;
        let version = self.select_in_range(name, range, &doc)?;
        debug!(name = %name, range = %range, version = %version, "range resolved");
        self.add_from_document(name, &version, &doc, status).await
    }

    /// Cache the version a dist-tag points to.
    ///
    /// # Errors
    /// See [`Self::add_named`].
    pub async fn add_name_tag(&self, name: &str, tag: Option<&str>) -> Result<Manifest> {
        let (doc, status) = self.packument(name).await?;
        let version = self.select_tag(name, tag, &doc)?;
        debug!(name = %name, tag = ?tag, version = %version, "tag resolved");
        self.add_from_document(name, &version, &doc, status).await
    }

    async fn add_from_document(
        &self,
        name: &str,
        version: &str,
        doc: &Packument,
        status: u16,
    ) -> Result<Manifest> {
        let mut manifest = doc
            .version(version)
            .cloned()
            .ok_or_else(|| version_not_found(name, version))?;
        if manifest.name.is_empty() {
            manifest.name = name.to_string();
        }
        if manifest.version.is_empty() {
            manifest.version = version.to_string();
        }
        manifest.version = check_package_id(&manifest.name, &manifest.version)?;
        manifest.ensure_id();

        let Some(tarball) = manifest.tarball_url().map(str::to_string) else {
            return Err(CacheError::bad_package(format!(
                "{} has no dist.tarball",
                manifest.spec_id()
            )));
        };
        let registry = self.config().registry_for(name).clone();
        let tarball = align_tarball_scheme(&tarball, &registry);
        let expected = manifest.dist_shasum().map(str::to_string);
        let force = self.config().force;

        if status == 304 && !force {
            if let Some(cached) = self.fully_cached(&manifest.name, &manifest.version) {
                match (&cached.shasum, &expected) {
                    (Some(have), Some(want)) if have != want => {
                        debug!(id = %manifest.spec_id(), "cached shasum differs, refetching");
                    }
                    _ => {
                        debug!(id = %manifest.spec_id(), "already cached");
                        return Ok(cached);
                    }
                }
            }
        }

        if expected.is_none() && !force {
            return Err(CacheError::MissingShasum {
                id: manifest.spec_id(),
            });
        }

        self.add_remote_tarball(&tarball, Some(manifest), expected)
            .await
    }

    /// Manifest of a version whose tarball and `package.json` are both present.
    fn fully_cached(&self, name: &str, version: &str) -> Option<Manifest> {
        if !tarball_path(&self.config().cache_root, name, version).is_ok_and(|p| p.is_file()) {
            return None;
        }
        self.cached_manifest(name, version)
    }
}

fn version_not_found(name: &str, version: &str) -> CacheError {
    CacheError::Http {
        uri: format!("{name}@{version}"),
        status: 404,
        message: "version not found".to_string(),
    }
}
