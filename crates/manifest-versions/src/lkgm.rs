use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, PublishError, Result};
use crate::gitcmd::{GitRunner, RetryPolicy};
use crate::manifest::{self, AnnotationKind};
use crate::publisher::{Candidate, SpecPublisher, promote_commit_message};
use crate::repository::GitSourceRepository;
use crate::store::GitSpecStore;
use crate::version::VersionInfo;

/// Default location of the LKGM pointer inside the spec store.
pub const LKGM_MANIFEST: &str = "LKGM/lkgm.xml";

/// Extension point for consumers that track per-build pass/fail status in
/// some external system. The core protocol carries no such state.
pub trait BuildStatusSource {
    /// Version string of the newest spec in `specs_dir_rel` whose build
    /// passed, if any.
    fn latest_passing(&self, specs_dir_rel: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct CandidateOptions {
    pub android_version: Option<String>,
    pub chrome_version: Option<String>,
    pub build_id: Option<u64>,
}

/// What the LKGM pointer currently names.
#[derive(Debug, Clone)]
pub struct LkgmPointer {
    pub version: VersionInfo,
    pub rel_path: String,
    pub android_version: Option<String>,
    pub chrome_version: Option<String>,
}

/// Candidate generation with Android/Chrome annotation, plus promotion of a
/// validated candidate to the canonical LKGM pointer. Built by composition:
/// the publish/retry machinery lives in [`SpecPublisher`]; this type only
/// supplies the annotator and the symlink discipline.
pub struct LkgmManager {
    publisher: SpecPublisher,
    lkgm_rel: String,
    filter_remotes: Vec<String>,
    retries: usize,
    status_source: Option<Box<dyn BuildStatusSource>>,
    current: Option<Candidate>,
}

impl LkgmManager {
    pub fn new(publisher: SpecPublisher, lkgm_rel: String, retries: usize) -> Self {
        Self {
            publisher,
            lkgm_rel,
            filter_remotes: Vec::new(),
            retries,
            status_source: None,
            current: None,
        }
    }

    /// Wire up the real git-backed collaborators from a loaded config.
    pub fn from_config(cfg: &Config) -> Self {
        let runner = GitRunner::new(RetryPolicy::default());
        let source = GitSourceRepository::new(
            runner.clone(),
            cfg.source.checkout_dir.clone().into(),
            cfg.source.remote.clone(),
            cfg.source.branch.clone(),
            cfg.source.manifest_file.clone(),
            cfg.source.ignored_prefixes.clone(),
        );
        let store = GitSpecStore::new(
            runner,
            cfg.store.checkout_dir.clone().into(),
            cfg.store.remote.clone(),
            cfg.store.branch.clone(),
            cfg.publish.dry_run,
        );
        let publisher = SpecPublisher::new(
            Box::new(source),
            Box::new(store),
            cfg.build.name.clone(),
            cfg.build.build_type,
            cfg.publish.incr_type,
            cfg.source.version_file.clone(),
            cfg.publish.force,
        );
        let mut manager = Self::new(publisher, cfg.store.lkgm_path.clone(), cfg.publish.retries);
        manager.filter_remotes = cfg.source.filter_remotes.clone();
        manager
    }

    pub fn with_status_source(mut self, source: Box<dyn BuildStatusSource>) -> Self {
        self.status_source = Some(source);
        self
    }

    pub fn publisher(&self) -> &SpecPublisher {
        &self.publisher
    }

    pub fn publisher_mut(&mut self) -> &mut SpecPublisher {
        &mut self.publisher
    }

    pub fn current_candidate(&self) -> Option<&Candidate> {
        self.current.as_ref()
    }

    /// Generate and publish the next candidate, annotated with the supplied
    /// Android/Chrome versions. Returns `None` when there is nothing new to
    /// build.
    pub fn create_new_candidate(&mut self, opts: CandidateOptions) -> Result<Option<Candidate>> {
        if let Some(v) = &opts.android_version {
            info!("adding Android version {v} to new candidate manifest");
        }
        if let Some(v) = &opts.chrome_version {
            info!("adding Chrome version {v} to new candidate manifest");
        }
        let annotate = |xml: &str| -> Result<String> {
            let mut out = xml.to_string();
            if let Some(v) = &opts.android_version {
                out = manifest::annotate(&out, AnnotationKind::Android, v)?;
            }
            if let Some(v) = &opts.chrome_version {
                out = manifest::annotate(&out, AnnotationKind::Chrome, v)?;
            }
            Ok(out)
        };

        let made = self
            .publisher
            .create_new_candidate(self.retries, opts.build_id, &annotate)?;
        if let Some(candidate) = &made {
            self.current = Some(candidate.clone());
        }
        Ok(made)
    }

    /// Mirror an externally-created manifest into this manager's store under
    /// the version named by the file stem, filtered to the allow-listed
    /// remotes.
    pub fn create_from_manifest(
        &mut self,
        manifest_path: &Path,
        build_id: Option<u64>,
    ) -> Result<Candidate> {
        let stem = manifest_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                Error::msg(format!(
                    "manifest path {} has no usable file name",
                    manifest_path.display()
                ))
            })?;
        let version = VersionInfo::parse(stem, None)?;
        let raw = fs::read_to_string(manifest_path).map_err(|e| {
            Error::msg(format!(
                "failed to read manifest {}: {e}",
                manifest_path.display()
            ))
        })?;
        let filtered = manifest::filter_by_remote(&raw, &self.filter_remotes)?;

        let candidate =
            self.publisher
                .create_from_manifest(&version, &filtered, self.retries, build_id)?;
        self.current = Some(candidate.clone());
        Ok(candidate)
    }

    /// Re-adopt an already-published candidate (e.g. in a separate promote
    /// process, or when forcing a specific version).
    pub fn bootstrap_from_version(&mut self, version: &str) -> Result<Candidate> {
        let candidate = self.publisher.bootstrap_from_version(version)?;
        self.current = Some(candidate.clone());
        Ok(candidate)
    }

    /// Adopt the highest-numbered published candidate in the current
    /// version family.
    pub fn bootstrap_latest(&mut self) -> Result<Candidate> {
        self.publisher.refresh()?;
        let version_info = self.publisher.current_version_info()?;
        let scan = self.publisher.scan(version_info)?;
        let latest = scan.latest.ok_or_else(|| {
            Error::msg(format!(
                "no published candidates under {}",
                self.publisher.specs_dir_rel()
            ))
        })?;
        self.bootstrap_from_version(&latest.version_string())
    }

    /// Publish the LKGM symlink for the current candidate. Calling this
    /// without a current candidate is a programming error and panics before
    /// any store operation is attempted.
    pub fn promote_candidate(&mut self) -> Result<()> {
        let Some(candidate) = self.current.clone() else {
            panic!(
                "promote_candidate requires a current candidate; \
                 call create_new_candidate or bootstrap_from_version first"
            );
        };

        let message = promote_commit_message(self.publisher.build_name(), &candidate.version);
        let attempts = self.retries + 1;
        let mut last = String::new();
        for attempt in 1..=attempts {
            self.publisher.refresh()?;
            match self.publisher.promote(&self.lkgm_rel, &candidate, &message) {
                Ok(()) => {
                    info!("promoted {} to LKGM at {}", candidate.version, self.lkgm_rel);
                    return Ok(());
                }
                Err(PublishError::Fatal(m)) => {
                    return Err(Error::msg(format!("promotion failed: {m}")));
                }
                Err(err) => {
                    warn!(attempt, attempts, "promotion attempt failed: {err}");
                    last = err.message().to_string();
                }
            }
        }
        Err(Error::PromoteCandidate { attempts, last })
    }

    /// Resolve the LKGM pointer to the candidate it names, including any
    /// annotation versions embedded in the spec.
    pub fn latest_candidate(&self) -> Result<Option<LkgmPointer>> {
        let Some(rel_path) = self.publisher.store().symlink_target(&self.lkgm_rel)? else {
            return Ok(None);
        };
        let stem = Path::new(&rel_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::msg(format!("LKGM pointer names an odd path: {rel_path}")))?;
        let version = VersionInfo::parse(stem, None)?;
        let content = self.publisher.store().read_spec(&rel_path)?;
        Ok(Some(LkgmPointer {
            version,
            rel_path,
            android_version: manifest::extract_annotation(&content, AnnotationKind::Android)?,
            chrome_version: manifest::extract_annotation(&content, AnnotationKind::Chrome)?,
        }))
    }

    /// Newest spec whose build passed, per the configured status source.
    pub fn get_latest_passing_spec(&self) -> Result<Option<String>> {
        match &self.status_source {
            Some(source) => source.latest_passing(&self.publisher.specs_dir_rel()),
            None => Err(Error::msg(
                "no build status source configured; latest-passing lookup is unavailable",
            )),
        }
    }
}
