use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::info;
use walkdir::WalkDir;

use crate::error::{Error, PublishError, Result};
use crate::gitcmd::{GitRunner, sync_checkout};
use crate::util::{atomic_write_text, ensure_dir};

/// Local checkout of the shared manifest-versions remote. All writes stay
/// local until `push`; `refresh` throws away anything a previous failed
/// attempt left behind.
pub trait SpecStore {
    fn refresh(&mut self) -> Result<()>;
    fn root(&self) -> &Path;
    /// Version stems (`{version}` of `{version}.xml`) published under a
    /// bucket directory, in no particular order.
    fn list_versions(&self, rel_dir: &str) -> Result<Vec<String>>;
    fn has_spec(&self, rel_path: &str) -> bool;
    fn read_spec(&self, rel_path: &str) -> Result<String>;
    fn write_spec(&self, rel_path: &str, content: &str) -> Result<()>;
    /// Replace `link_rel` with a symlink to `target_rel` (both relative to
    /// the store root).
    fn set_symlink(&self, link_rel: &str, target_rel: &str) -> Result<()>;
    /// Root-relative target of the symlink at `link_rel`, if it exists.
    fn symlink_target(&self, link_rel: &str) -> Result<Option<String>>;
    /// Commit the working tree and push it to the shared remote.
    fn push(&mut self, message: &str) -> std::result::Result<(), PublishError>;
}

pub struct GitSpecStore {
    runner: GitRunner,
    root: PathBuf,
    remote: String,
    branch: String,
    dry_run: bool,
}

impl GitSpecStore {
    pub fn new(
        runner: GitRunner,
        root: PathBuf,
        remote: String,
        branch: String,
        dry_run: bool,
    ) -> Self {
        Self {
            runner,
            root,
            remote,
            branch,
            dry_run,
        }
    }
}

impl SpecStore for GitSpecStore {
    fn refresh(&mut self) -> Result<()> {
        info!(
            "refreshing manifest-versions checkout {} from {}",
            self.root.display(),
            self.remote
        );
        sync_checkout(&self.runner, &self.root, &self.remote, &self.branch)
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn list_versions(&self, rel_dir: &str) -> Result<Vec<String>> {
        let dir = self.root.join(rel_dir);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("xml") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                out.push(stem.to_string());
            }
        }
        Ok(out)
    }

    fn has_spec(&self, rel_path: &str) -> bool {
        self.root.join(rel_path).is_file()
    }

    fn read_spec(&self, rel_path: &str) -> Result<String> {
        let path = self.root.join(rel_path);
        fs::read_to_string(&path)
            .map_err(|e| Error::msg(format!("failed to read spec {}: {e}", path.display())))
    }

    fn write_spec(&self, rel_path: &str, content: &str) -> Result<()> {
        atomic_write_text(&self.root.join(rel_path), content)
    }

    fn set_symlink(&self, link_rel: &str, target_rel: &str) -> Result<()> {
        let link = self.root.join(link_rel);
        if let Some(parent) = link.parent() {
            ensure_dir(parent)?;
        }
        remove_existing(&link)?;
        let target = relative_link_target(link_rel, target_rel)?;
        create_symlink(&target, &link)
    }

    fn symlink_target(&self, link_rel: &str) -> Result<Option<String>> {
        let link = self.root.join(link_rel);
        let target = match fs::read_link(&link) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::msg(format!(
                    "failed to read symlink {}: {e}",
                    link.display()
                )));
            }
        };
        let target = target.to_string_lossy().to_string();
        Ok(Some(resolve_link_target(link_rel, &target)?))
    }

    fn push(&mut self, message: &str) -> std::result::Result<(), PublishError> {
        let status = self
            .runner
            .git(&self.root, &["status", "--porcelain"])
            .map_err(|e| PublishError::Fatal(e.to_string()))?;
        if status.is_empty() {
            info!("spec store has no changes to push");
            return Ok(());
        }
        self.runner
            .git(&self.root, &["add", "-A"])
            .map_err(|e| PublishError::Fatal(e.to_string()))?;
        self.runner
            .git(&self.root, &["commit", "-m", message])
            .map_err(|e| PublishError::Fatal(e.to_string()))?;
        if self.dry_run {
            info!("dry run: skipping push of '{message}'");
            return Ok(());
        }
        let refspec = format!("HEAD:{}", self.branch);
        self.runner
            .push(&self.root, &["push", "origin", refspec.as_str()])
    }
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_dir() {
                fs::remove_dir_all(path).map_err(|e| {
                    Error::msg(format!("failed to remove directory {}: {e}", path.display()))
                })
            } else {
                fs::remove_file(path)
                    .map_err(|e| Error::msg(format!("failed to remove {}: {e}", path.display())))
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::msg(format!(
            "failed to inspect {}: {e}",
            path.display()
        ))),
    }
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| {
        Error::msg(format!(
            "failed to create symlink {} -> {}: {e}",
            link.display(),
            target.display()
        ))
    })
}

#[cfg(not(unix))]
fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    // Same representation git uses for symlinks when the filesystem can't
    // make one: a plain file holding the target path.
    crate::util::write_text(link, &target.to_string_lossy())
}

/// Symlink target for `target_rel` as seen from `link_rel`'s directory,
/// both being store-root-relative.
fn relative_link_target(link_rel: &str, target_rel: &str) -> Result<PathBuf> {
    let link_parent = Path::new(link_rel).parent().unwrap_or_else(|| Path::new(""));
    let ups = link_parent.components().count();
    let mut out = PathBuf::new();
    for _ in 0..ups {
        out.push("..");
    }
    out.push(target_rel);
    Ok(out)
}

/// Inverse of [`relative_link_target`]: resolve a link-relative target back
/// to a store-root-relative path.
fn resolve_link_target(link_rel: &str, target: &str) -> Result<String> {
    let link_parent = Path::new(link_rel).parent().unwrap_or_else(|| Path::new(""));
    let joined = link_parent.join(target);
    let mut out = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::ParentDir => {
                if !out.pop() {
                    return Err(Error::msg(format!(
                        "symlink at '{link_rel}' escapes the store root: '{target}'"
                    )));
                }
            }
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            other => {
                return Err(Error::msg(format!(
                    "unexpected component {other:?} in symlink target '{target}'"
                )));
            }
        }
    }
    Ok(out.to_string_lossy().to_string())
}
