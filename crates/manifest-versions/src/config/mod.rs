use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

use crate::error::{Error, Result};
use crate::lkgm::LKGM_MANIFEST;
use crate::publisher::{BuildType, NUM_RETRIES};
use crate::version::IncrType;

fn default_branch() -> String {
    "main".into()
}

fn default_manifest_file() -> String {
    "default.xml".into()
}

fn default_version_file() -> String {
    "VERSION.toml".into()
}

fn default_lkgm_path() -> String {
    LKGM_MANIFEST.into()
}

fn default_retries() -> usize {
    NUM_RETRIES
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BuildConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub build_type: BuildType,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub checkout_dir: String,
    /// Optional: when unset, the checkout is used as-is and never synced.
    pub remote: Option<String>,
    pub branch: String,
    pub manifest_file: String,
    pub version_file: String,
    /// Project path prefixes excluded from change detection.
    pub ignored_prefixes: Vec<String>,
    /// Remotes kept when mirroring an external manifest; empty keeps all.
    pub filter_remotes: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            checkout_dir: String::new(),
            remote: None,
            branch: default_branch(),
            manifest_file: default_manifest_file(),
            version_file: default_version_file(),
            ignored_prefixes: Vec::new(),
            filter_remotes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub checkout_dir: String,
    pub remote: String,
    pub branch: String,
    pub lkgm_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            checkout_dir: String::new(),
            remote: String::new(),
            branch: default_branch(),
            lkgm_path: default_lkgm_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub retries: usize,
    pub force: bool,
    pub dry_run: bool,
    pub incr_type: IncrType,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            force: false,
            dry_run: false,
            incr_type: IncrType::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub build: BuildConfig,
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub publish: PublishConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.build.name.trim().is_empty() {
            return Err(Error::msg("[build].name must be set"));
        }
        if self.source.checkout_dir.trim().is_empty() {
            return Err(Error::msg("[source].checkout_dir must be set"));
        }
        if self.store.checkout_dir.trim().is_empty() {
            return Err(Error::msg("[store].checkout_dir must be set"));
        }
        if self.store.remote.trim().is_empty() {
            return Err(Error::msg("[store].remote must be set"));
        }
        if self.store.lkgm_path.trim().is_empty() {
            return Err(Error::msg("[store].lkgm_path must be set"));
        }
        Ok(())
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

// Single-parent `extends` chain: the named base loads first, the local file
// overlays it.
fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config extends cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        let base_path = resolve_ref_path(path, ext);
        out = load_value_inner(&base_path, stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<Config> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    let cfg: Config = value
        .try_into()
        .map_err(|e| Error::msg(format!("invalid config {}: {e}", path.display())))?;
    cfg.validate()?;
    Ok(cfg)
}
