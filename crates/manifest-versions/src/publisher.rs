use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, PublishError, Result};
use crate::manifest;
use crate::repository::SourceRepository;
use crate::store::SpecStore;
use crate::version::{IncrType, VersionInfo};

/// Default bound for the resync-and-recompute loops. Each loop makes
/// `retries + 1` attempts in total.
pub const NUM_RETRIES: usize = 3;

/// Build flavor of a publisher. Downstream consumers hard-code the
/// resulting bucket names, so this mapping must not drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildType {
    AndroidPfq,
    Toolchain,
    Full,
    Incremental,
    Pfq,
}

impl BuildType {
    pub fn subdir(self) -> &'static str {
        match self {
            BuildType::AndroidPfq => "android-LKGM-candidates",
            BuildType::Toolchain => "toolchain",
            BuildType::Full => "full",
            BuildType::Incremental => "incremental",
            BuildType::Pfq => "LKGM-candidates",
        }
    }
}

impl Default for BuildType {
    fn default() -> Self {
        BuildType::Pfq
    }
}

/// One published (or to-be-published) candidate spec.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub version: VersionInfo,
    /// Path of the spec file relative to the store root.
    pub rel_path: String,
}

impl Candidate {
    pub fn local_path(&self, store_root: &std::path::Path) -> std::path::PathBuf {
        store_root.join(&self.rel_path)
    }
}

/// State observed by one refresh-and-scan pass. Computed fresh on every
/// publish attempt so racing writers converge instead of acting on stale
/// numbers.
#[derive(Debug, Clone)]
pub struct CandidateScan {
    /// Version read from the source checkout's version file.
    pub version_info: VersionInfo,
    /// Highest already-published version in the same family, if any.
    pub latest: Option<VersionInfo>,
    /// Every published version in the family, unordered.
    pub published: Vec<VersionInfo>,
}

/// Coordinates candidate creation and publishing against the shared spec
/// remote. The only cross-writer discipline is optimistic: publish, detect
/// the rejected write, resync, recompute, retry.
pub struct SpecPublisher {
    source: Box<dyn SourceRepository>,
    store: Box<dyn SpecStore>,
    build_name: String,
    build_type: BuildType,
    incr_type: IncrType,
    version_file: String,
    force: bool,
}

impl SpecPublisher {
    pub fn new(
        source: Box<dyn SourceRepository>,
        store: Box<dyn SpecStore>,
        build_name: String,
        build_type: BuildType,
        incr_type: IncrType,
        version_file: String,
        force: bool,
    ) -> Self {
        Self {
            source,
            store,
            build_name,
            build_type,
            incr_type,
            version_file,
            force,
        }
    }

    pub fn build_name(&self) -> &str {
        &self.build_name
    }

    pub fn store(&self) -> &dyn SpecStore {
        self.store.as_ref()
    }

    /// The bucket all of this publisher's candidates live in, relative to
    /// the store root.
    pub fn specs_dir_rel(&self) -> String {
        format!("{}/{}", self.build_type.subdir(), self.build_name)
    }

    pub fn spec_rel_path(&self, version: &VersionInfo) -> String {
        format!("{}/{}.xml", self.specs_dir_rel(), version.version_string())
    }

    pub fn refresh(&mut self) -> Result<()> {
        self.store.refresh()
    }

    pub fn sync_source(&mut self) -> Result<()> {
        self.source.sync()
    }

    /// The authoritative version comes from the source checkout's version
    /// file, never from the spec store.
    pub fn current_version_info(&self) -> Result<VersionInfo> {
        let path = self.source.root().join(&self.version_file);
        VersionInfo::from_version_file(&path, self.incr_type)
    }

    /// Scan the bucket for already-published versions in `version_info`'s
    /// family. Files with unrelated names are ignored.
    pub fn scan(&self, version_info: VersionInfo) -> Result<CandidateScan> {
        let mut published = Vec::new();
        for stem in self.store.list_versions(&self.specs_dir_rel())? {
            let parsed = match VersionInfo::parse(&stem, None) {
                Ok(v) => v,
                Err(_) => {
                    warn!("ignoring unparseable spec name '{stem}' in {}", self.specs_dir_rel());
                    continue;
                }
            };
            if parsed.family() == version_info.family() {
                published.push(parsed);
            }
        }
        let latest = published.iter().max().cloned();
        Ok(CandidateScan {
            version_info,
            latest,
            published,
        })
    }

    /// Whether the current source checkout already has a published spec
    /// with the same content. A root-revision change counts as new content.
    pub fn has_checkout_been_built(&self, scan: &CandidateScan) -> Result<bool> {
        let Some(latest) = &scan.latest else {
            return Ok(false);
        };
        let spec_path = self.store.root().join(self.spec_rel_path(latest));
        if !spec_path.is_file() {
            return Ok(false);
        }
        Ok(!self.source.is_manifest_different(&spec_path)?)
    }

    /// Next version to publish. The maximum observed remote version wins
    /// over the caller's local one, so a racer that lost always lands
    /// strictly above the version it raced against. Numeric order, never
    /// string order.
    pub fn next_version(&self, scan: &CandidateScan) -> VersionInfo {
        match &scan.latest {
            Some(latest) if *latest >= scan.version_info => latest.incremented(),
            _ => scan.version_info.clone(),
        }
    }

    /// Publish one spec at its deterministic path. A spec already present
    /// at that path is a conflict unless `allow_identical` and the content
    /// matches byte-for-byte (republish of the same manifest).
    pub fn publish_spec(
        &mut self,
        version: &VersionInfo,
        content: &str,
        build_id: Option<u64>,
        allow_identical: bool,
    ) -> std::result::Result<String, PublishError> {
        let rel_path = self.spec_rel_path(version);
        if self.store.has_spec(&rel_path) {
            if allow_identical {
                let existing = self
                    .store
                    .read_spec(&rel_path)
                    .map_err(|e| PublishError::Fatal(e.to_string()))?;
                if existing == content {
                    info!("spec {rel_path} already published with identical content");
                    return Ok(rel_path);
                }
            }
            return Err(PublishError::Conflict(format!(
                "spec already exists at {rel_path}"
            )));
        }

        let fingerprint = manifest::fingerprint(content, &[])
            .map_err(|e| PublishError::Fatal(e.to_string()))?;
        self.store
            .write_spec(&rel_path, content)
            .map_err(|e| PublishError::Fatal(e.to_string()))?;
        let message = candidate_commit_message(&self.build_name, version, build_id, &fingerprint);
        self.store.push(&message)?;
        Ok(rel_path)
    }

    /// Drive the full candidate flow: sync the source once, then up to
    /// `retries + 1` rounds of refresh, scan, decide, publish. Returns
    /// `None` when the checkout has already been built and `force` is off;
    /// that is a non-error "nothing to build" outcome.
    pub fn create_new_candidate(
        &mut self,
        retries: usize,
        build_id: Option<u64>,
        annotate: &dyn Fn(&str) -> Result<String>,
    ) -> Result<Option<Candidate>> {
        self.source.sync()?;

        let attempts = retries + 1;
        let mut last = String::new();
        for attempt in 1..=attempts {
            self.store.refresh()?;
            let version_info = self.current_version_info()?;
            let scan = self.scan(version_info)?;

            if !self.force && self.has_checkout_been_built(&scan)? {
                info!(
                    "checkout matches latest published spec for {}; nothing to build",
                    self.specs_dir_rel()
                );
                return Ok(None);
            }

            let version = self.next_version(&scan);
            let exported = self.source.export_manifest(true)?;
            let content = annotate(&exported)?;

            match self.publish_spec(&version, &content, build_id, false) {
                Ok(rel_path) => {
                    info!("published candidate {} at {rel_path}", version);
                    return Ok(Some(Candidate { version, rel_path }));
                }
                Err(PublishError::Fatal(m)) => {
                    return Err(Error::msg(format!("publish failed: {m}")));
                }
                Err(err) => {
                    warn!(attempt, attempts, "publish attempt failed: {err}");
                    last = err.message().to_string();
                }
            }
        }
        Err(Error::GenerateBuildSpec { attempts, last })
    }

    /// Publish an externally-supplied manifest under a fixed version (the
    /// mirror-to-another-store flow). Same retry discipline as
    /// [`create_new_candidate`], but the version never moves and
    /// republishing identical content succeeds.
    pub fn create_from_manifest(
        &mut self,
        version: &VersionInfo,
        content: &str,
        retries: usize,
        build_id: Option<u64>,
    ) -> Result<Candidate> {
        let attempts = retries + 1;
        let mut last = String::new();
        for attempt in 1..=attempts {
            self.store.refresh()?;
            match self.publish_spec(version, content, build_id, true) {
                Ok(rel_path) => {
                    info!("published mirrored spec {} at {rel_path}", version);
                    return Ok(Candidate {
                        version: version.clone(),
                        rel_path,
                    });
                }
                Err(PublishError::Fatal(m)) => {
                    return Err(Error::msg(format!("publish failed: {m}")));
                }
                Err(err) => {
                    warn!(attempt, attempts, "publish attempt failed: {err}");
                    last = err.message().to_string();
                }
            }
        }
        Err(Error::GenerateBuildSpec { attempts, last })
    }

    /// Point at an already-published spec, e.g. to promote from a separate
    /// process than the one that created the candidate.
    pub fn bootstrap_from_version(&mut self, version: &str) -> Result<Candidate> {
        self.store.refresh()?;
        let version = VersionInfo::parse(version, None)?;
        let rel_path = self.spec_rel_path(&version);
        if !self.store.has_spec(&rel_path) {
            return Err(Error::msg(format!(
                "no published spec at {rel_path}; cannot bootstrap from {version}"
            )));
        }
        Ok(Candidate { version, rel_path })
    }

    /// Promote `candidate` by replacing the symlink at `link_rel` and
    /// pushing that single change.
    pub fn promote(
        &mut self,
        link_rel: &str,
        candidate: &Candidate,
        message: &str,
    ) -> std::result::Result<(), PublishError> {
        if !self.store.has_spec(&candidate.rel_path) {
            return Err(PublishError::Fatal(format!(
                "candidate spec {} is missing from the store",
                candidate.rel_path
            )));
        }
        self.store
            .set_symlink(link_rel, &candidate.rel_path)
            .map_err(|e| PublishError::Fatal(e.to_string()))?;
        self.store.push(message)
    }
}

pub fn candidate_commit_message(
    build_name: &str,
    version: &VersionInfo,
    build_id: Option<u64>,
    fingerprint: &str,
) -> String {
    let mut message = format!(
        "Automatic: Start {build_name} {version}\n\nManifest-Fingerprint: {fingerprint}"
    );
    if let Some(id) = build_id {
        message.push_str(&format!("\nBuild-Id: {id}"));
    }
    message
}

pub fn promote_commit_message(build_name: &str, version: &VersionInfo) -> String {
    format!("Automatic: {build_name} promoting {version} to LKGM")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> VersionInfo {
        VersionInfo::parse(s, None).unwrap()
    }

    fn scan_with(version_info: &str, published: &[&str]) -> CandidateScan {
        let published: Vec<VersionInfo> = published.iter().map(|s| v(s)).collect();
        CandidateScan {
            version_info: v(version_info),
            latest: published.iter().max().cloned(),
            published,
        }
    }

    fn publisher() -> SpecPublisher {
        // Collaborators are never touched by the pure helpers under test.
        struct NoSource;
        impl crate::repository::SourceRepository for NoSource {
            fn sync(&mut self) -> Result<()> {
                unreachable!()
            }
            fn export_manifest(&self, _mark_revision: bool) -> Result<String> {
                unreachable!()
            }
            fn is_manifest_different(&self, _other: &std::path::Path) -> Result<bool> {
                unreachable!()
            }
            fn root(&self) -> &std::path::Path {
                std::path::Path::new("/nonexistent")
            }
        }
        struct NoStore;
        impl crate::store::SpecStore for NoStore {
            fn refresh(&mut self) -> Result<()> {
                unreachable!()
            }
            fn root(&self) -> &std::path::Path {
                std::path::Path::new("/nonexistent")
            }
            fn list_versions(&self, _rel_dir: &str) -> Result<Vec<String>> {
                unreachable!()
            }
            fn has_spec(&self, _rel_path: &str) -> bool {
                unreachable!()
            }
            fn read_spec(&self, _rel_path: &str) -> Result<String> {
                unreachable!()
            }
            fn write_spec(&self, _rel_path: &str, _content: &str) -> Result<()> {
                unreachable!()
            }
            fn set_symlink(&self, _link_rel: &str, _target_rel: &str) -> Result<()> {
                unreachable!()
            }
            fn symlink_target(&self, _link_rel: &str) -> Result<Option<String>> {
                unreachable!()
            }
            fn push(&mut self, _message: &str) -> std::result::Result<(), PublishError> {
                unreachable!()
            }
        }
        SpecPublisher::new(
            Box::new(NoSource),
            Box::new(NoStore),
            "amd64-generic".into(),
            BuildType::Pfq,
            IncrType::Build,
            "VERSION.toml".into(),
            false,
        )
    }

    #[test]
    fn build_type_routing_is_exact() {
        assert_eq!(BuildType::AndroidPfq.subdir(), "android-LKGM-candidates");
        assert_eq!(BuildType::Toolchain.subdir(), "toolchain");
        assert_eq!(BuildType::Full.subdir(), "full");
        assert_eq!(BuildType::Incremental.subdir(), "incremental");
        assert_eq!(BuildType::Pfq.subdir(), "LKGM-candidates");
    }

    #[test]
    fn spec_paths_are_deterministic() {
        let p = publisher();
        assert_eq!(p.specs_dir_rel(), "LKGM-candidates/amd64-generic");
        assert_eq!(
            p.spec_rel_path(&v("1.2.3-rc4")),
            "LKGM-candidates/amd64-generic/1.2.3-rc4.xml"
        );
    }

    #[test]
    fn next_version_uses_maximum_observed_remote() {
        let p = publisher();
        // Local info says rc1 but the remote already has rc2; the next
        // publish must land at rc3.
        let scan = scan_with("1.2.3-rc1", &["1.2.3-rc1", "1.2.3-rc2"]);
        assert_eq!(p.next_version(&scan).version_string(), "1.2.3-rc3");
    }

    #[test]
    fn next_version_starts_fresh_families_at_rc1() {
        let p = publisher();
        let scan = scan_with("1.3.0", &["1.2.3-rc1", "1.2.3-rc2"]);
        // Published versions from an older family don't apply.
        let scan = CandidateScan {
            latest: None,
            published: Vec::new(),
            ..scan
        };
        assert_eq!(p.next_version(&scan).version_string(), "1.3.0-rc1");
    }

    #[test]
    fn next_version_orders_revisions_numerically() {
        let p = publisher();
        let scan = scan_with("1.2.3", &["1.2.3-rc9", "1.2.3-rc10"]);
        assert_eq!(p.next_version(&scan).version_string(), "1.2.3-rc11");
    }

    #[test]
    fn commit_messages_are_structured() {
        assert_eq!(
            candidate_commit_message("amd64-generic", &v("1.2.3-rc4"), None, "ab12"),
            "Automatic: Start amd64-generic 1.2.3-rc4\n\nManifest-Fingerprint: ab12"
        );
        assert_eq!(
            candidate_commit_message("amd64-generic", &v("1.2.3-rc4"), Some(77), "ab12"),
            "Automatic: Start amd64-generic 1.2.3-rc4\n\nManifest-Fingerprint: ab12\nBuild-Id: 77"
        );
        assert_eq!(
            promote_commit_message("amd64-generic", &v("1.2.3-rc4")),
            "Automatic: amd64-generic promoting 1.2.3-rc4 to LKGM"
        );
    }
}
