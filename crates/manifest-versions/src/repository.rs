use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Error, Result};
use crate::gitcmd::{GitRunner, sync_checkout};
use crate::manifest;

/// The source checkout a build runs against. The publisher only needs to
/// sync it, export its project manifest, and ask whether that manifest
/// meaningfully differs from an already-published spec.
pub trait SourceRepository {
    fn sync(&mut self) -> Result<()>;
    /// Render the checkout's manifest; `mark_revision` stamps the root
    /// element with the checkout's HEAD commit.
    fn export_manifest(&self, mark_revision: bool) -> Result<String>;
    fn is_manifest_different(&self, other_spec: &Path) -> Result<bool>;
    fn root(&self) -> &Path;
}

pub struct GitSourceRepository {
    runner: GitRunner,
    root: PathBuf,
    remote: Option<String>,
    branch: String,
    manifest_file: String,
    ignored_prefixes: Vec<String>,
}

impl GitSourceRepository {
    pub fn new(
        runner: GitRunner,
        root: PathBuf,
        remote: Option<String>,
        branch: String,
        manifest_file: String,
        ignored_prefixes: Vec<String>,
    ) -> Self {
        Self {
            runner,
            root,
            remote,
            branch,
            manifest_file,
            ignored_prefixes,
        }
    }

    fn head_revision(&self) -> Result<String> {
        self.runner.git(&self.root, &["rev-parse", "HEAD"])
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(&self.manifest_file)
    }
}

impl SourceRepository for GitSourceRepository {
    fn sync(&mut self) -> Result<()> {
        match &self.remote {
            Some(remote) => {
                info!(
                    "syncing source checkout {} from {remote}",
                    self.root.display()
                );
                sync_checkout(&self.runner, &self.root, remote, &self.branch)
            }
            // A pinned local checkout (e.g. one some outer tool manages) is
            // used as-is.
            None => Ok(()),
        }
    }

    fn export_manifest(&self, mark_revision: bool) -> Result<String> {
        let path = self.manifest_path();
        let raw = fs::read_to_string(&path)
            .map_err(|e| Error::msg(format!("failed to read manifest {}: {e}", path.display())))?;
        if !mark_revision {
            return Ok(raw);
        }
        let head = self.head_revision()?;
        manifest::set_root_revision(&raw, &head)
    }

    fn is_manifest_different(&self, other_spec: &Path) -> Result<bool> {
        let other = fs::read_to_string(other_spec).map_err(|e| {
            Error::msg(format!(
                "failed to read spec {}: {e}",
                other_spec.display()
            ))
        })?;
        let ours = self.export_manifest(true)?;
        Ok(!manifest::manifests_equivalent(
            &ours,
            &other,
            &self.ignored_prefixes,
        )?)
    }

    fn root(&self) -> &Path {
        &self.root
    }
}
