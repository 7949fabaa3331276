use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::atomic_write_text;

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)\.(\d+)(?:-rc(\d+))?$").expect("version regex"));

/// Which component of the release triple a version bump advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrType {
    Build,
    Branch,
    Patch,
}

impl Default for IncrType {
    fn default() -> Self {
        IncrType::Branch
    }
}

/// A `major.branch.patch[-rcN]` build version.
///
/// The release triple is fixed for the lifetime of the value; only the
/// candidate revision moves, and only upward. Ordering is numeric over the
/// 4-tuple of components, never lexicographic.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    build: u32,
    branch: u32,
    patch: u32,
    revision: u32,
    chrome_branch: Option<u32>,
    incr_type: IncrType,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct VersionFileDoc {
    build: u32,
    branch: u32,
    patch: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chrome_branch: Option<u32>,
}

impl VersionInfo {
    /// Parse `major.branch.patch` or `major.branch.patch-rcN`. A missing
    /// `-rc` suffix normalizes to revision 1.
    pub fn parse(version: &str, chrome_branch: Option<u32>) -> Result<Self> {
        let caps = VERSION_RE
            .captures(version.trim())
            .ok_or_else(|| Error::VersionParse(version.to_string()))?;
        let num = |i: usize| -> Result<u32> {
            caps.get(i)
                .map(|m| m.as_str())
                .unwrap_or("1")
                .parse::<u32>()
                .map_err(|_| Error::VersionParse(version.to_string()))
        };
        Ok(Self {
            build: num(1)?,
            branch: num(2)?,
            patch: num(3)?,
            revision: num(4)?,
            chrome_branch,
            incr_type: IncrType::default(),
        })
    }

    /// Read the release triple from the authoritative version file in a
    /// source checkout. Candidates never write this file back; the file of
    /// record always lives in the source tree, not the spec store.
    pub fn from_version_file(path: &Path, incr_type: IncrType) -> Result<Self> {
        let raw =
            fs::read_to_string(path).map_err(|_| Error::MissingVersionFile(path.to_path_buf()))?;
        let doc: VersionFileDoc = toml::from_str(&raw).map_err(|e| {
            Error::msg(format!("bad version file {}: {e}", path.display()))
        })?;
        Ok(Self {
            build: doc.build,
            branch: doc.branch,
            patch: doc.patch,
            revision: 1,
            chrome_branch: doc.chrome_branch,
            incr_type,
        })
    }

    pub fn build_number(&self) -> u32 {
        self.build
    }

    pub fn branch_build_number(&self) -> u32 {
        self.branch
    }

    pub fn patch_number(&self) -> u32 {
        self.patch
    }

    pub fn revision_number(&self) -> u32 {
        self.revision
    }

    pub fn chrome_branch(&self) -> Option<u32> {
        self.chrome_branch
    }

    /// `"{build}.{branch}.{patch}"`, the family shared by every candidate
    /// revision of one source version.
    pub fn family(&self) -> String {
        format!("{}.{}.{}", self.build, self.branch, self.patch)
    }

    pub fn version_string(&self) -> String {
        format!(
            "{}.{}.{}-rc{}",
            self.build, self.branch, self.patch, self.revision
        )
    }

    pub fn version_components(&self) -> (u32, u32, u32, u32) {
        (self.build, self.branch, self.patch, self.revision)
    }

    /// Bump the candidate revision by exactly one and return the new
    /// rendering. Purely in-memory; no I/O happens here.
    pub fn increment_version(&mut self) -> String {
        self.revision += 1;
        self.version_string()
    }

    /// Non-mutating form of [`increment_version`](Self::increment_version).
    pub fn incremented(&self) -> Self {
        let mut next = self.clone();
        next.revision += 1;
        next
    }

    /// Advance the release triple per the configured increment type,
    /// zeroing the lower components and resetting the revision.
    pub fn bumped(&self) -> Self {
        let (build, branch, patch) = match self.incr_type {
            IncrType::Build => (self.build + 1, 0, 0),
            IncrType::Branch => (self.build, self.branch + 1, 0),
            IncrType::Patch => (self.build, self.branch, self.patch + 1),
        };
        Self {
            build,
            branch,
            patch,
            revision: 1,
            chrome_branch: self.chrome_branch,
            incr_type: self.incr_type,
        }
    }

    /// Persist the release triple. Only release-flavor flows call this;
    /// candidate versions are never written back to any version file.
    pub fn write_version_file(&self, path: &Path) -> Result<()> {
        let doc = VersionFileDoc {
            build: self.build,
            branch: self.branch,
            patch: self.patch,
            chrome_branch: self.chrome_branch,
        };
        let body = toml::to_string(&doc)
            .map_err(|e| Error::msg(format!("failed to encode version file: {e}")))?;
        atomic_write_text(path, &body)
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.version_string())
    }
}

impl PartialEq for VersionInfo {
    fn eq(&self, other: &Self) -> bool {
        self.version_components() == other.version_components()
    }
}

impl Eq for VersionInfo {}

impl PartialOrd for VersionInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version_components().cmp(&other.version_components())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_rc_versions() {
        let v = VersionInfo::parse("123.4.5-rc7", None).unwrap();
        assert_eq!(v.version_string(), "123.4.5-rc7");
        assert_eq!(v.version_components(), (123, 4, 5, 7));
    }

    #[test]
    fn parse_normalizes_missing_rc_to_one() {
        let v = VersionInfo::parse("123.4.5", None).unwrap();
        assert_eq!(v.version_string(), "123.4.5-rc1");
    }

    #[test]
    fn parse_rejects_malformed_strings() {
        for bad in ["", "1.2", "1.2.3.4", "a.b.c", "1.2.3-rc", "1.2.3rc4"] {
            assert!(
                VersionInfo::parse(bad, None).is_err(),
                "'{bad}' should not parse"
            );
        }
    }

    #[test]
    fn ordering_is_numeric_not_lexicographic() {
        let nine = VersionInfo::parse("1.2.9", None).unwrap();
        let ten = VersionInfo::parse("1.2.10", None).unwrap();
        assert!(ten > nine);

        let rc9 = VersionInfo::parse("1.2.3-rc9", None).unwrap();
        let rc10 = VersionInfo::parse("1.2.3-rc10", None).unwrap();
        assert!(rc10 > rc9);
    }

    #[test]
    fn increment_moves_only_the_revision() {
        let mut v = VersionInfo::parse("5.0.2-rc3", None).unwrap();
        let rendered = v.increment_version();
        assert_eq!(rendered, "5.0.2-rc4");
        assert_eq!(v.version_components(), (5, 0, 2, 4));
    }

    #[test]
    fn bumped_zeroes_lower_components() {
        let base = VersionInfo::parse("15.3.2", None).unwrap();
        let mut by_build = base.clone();
        by_build.incr_type = IncrType::Build;
        assert_eq!(by_build.bumped().version_string(), "16.0.0-rc1");

        let mut by_branch = base.clone();
        by_branch.incr_type = IncrType::Branch;
        assert_eq!(by_branch.bumped().version_string(), "15.4.0-rc1");

        let mut by_patch = base;
        by_patch.incr_type = IncrType::Patch;
        assert_eq!(by_patch.bumped().version_string(), "15.3.3-rc1");
    }

    #[test]
    fn version_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("VERSION.toml");
        let v = VersionInfo::parse("42.1.0", Some(120)).unwrap();
        v.write_version_file(&path).unwrap();

        let read = VersionInfo::from_version_file(&path, IncrType::Build).unwrap();
        assert_eq!(read.version_components(), (42, 1, 0, 1));
        assert_eq!(read.chrome_branch(), Some(120));
    }

    #[test]
    fn missing_version_file_is_a_distinct_error() {
        let err = VersionInfo::from_version_file(Path::new("/nonexistent/VERSION.toml"), IncrType::Build)
            .unwrap_err();
        assert!(matches!(err, Error::MissingVersionFile(_)));
    }
}
