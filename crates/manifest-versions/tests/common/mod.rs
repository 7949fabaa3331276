use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use manifest_versions::error::{PublishError, Result};
use manifest_versions::publisher::{BuildType, SpecPublisher};
use manifest_versions::repository::SourceRepository;
use manifest_versions::store::SpecStore;
use manifest_versions::util::write_text;
use manifest_versions::version::IncrType;

pub const MANIFEST: &str = r#"<manifest revision="abc123">
  <remote name="origin" fetch="https://example.com"/>
  <default remote="origin" revision="refs/heads/main"/>
  <project name="platform/core" path="core" revision="1111"/>
</manifest>
"#;

#[derive(Default)]
pub struct SourceState {
    pub syncs: usize,
    pub manifest: String,
    pub different: bool,
}

/// Scripted source checkout. `different` drives no-op detection; the
/// manifest text is returned verbatim by `export_manifest`.
pub struct FakeSource {
    pub root: PathBuf,
    pub state: Arc<Mutex<SourceState>>,
}

impl SourceRepository for FakeSource {
    fn sync(&mut self) -> Result<()> {
        self.state.lock().unwrap().syncs += 1;
        Ok(())
    }

    fn export_manifest(&self, _mark_revision: bool) -> Result<String> {
        Ok(self.state.lock().unwrap().manifest.clone())
    }

    fn is_manifest_different(&self, _other_spec: &Path) -> Result<bool> {
        Ok(self.state.lock().unwrap().different)
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

#[derive(Default)]
pub struct StoreState {
    pub refreshes: usize,
    pub pushes: usize,
    pub push_messages: Vec<String>,
    /// Scripted outcomes for successive pushes; empty means success.
    pub push_results: VecDeque<std::result::Result<(), PublishError>>,
    /// Files "committed" on the shared remote, materialized at refresh.
    pub remote_files: BTreeMap<String, String>,
    /// Files another writer lands when a push comes back as a conflict.
    pub on_conflict_remote_adds: Vec<(String, String)>,
    /// Committed symlinks (link -> root-relative target).
    pub symlinks: BTreeMap<String, String>,
    pending_files: BTreeMap<String, String>,
    pending_symlinks: BTreeMap<String, String>,
}

/// In-memory spec store with a real scratch directory so path probes
/// behave. Local writes stay pending until a successful push; refresh
/// drops pending state and re-materializes the remote, like a hard reset.
pub struct FakeStore {
    pub root: PathBuf,
    pub state: Arc<Mutex<StoreState>>,
}

impl FakeStore {
    fn materialize(&self, files: &BTreeMap<String, String>) {
        if self.root.exists() {
            fs::remove_dir_all(&self.root).unwrap();
        }
        fs::create_dir_all(&self.root).unwrap();
        for (rel, content) in files {
            write_text(&self.root.join(rel), content).unwrap();
        }
    }
}

impl SpecStore for FakeStore {
    fn refresh(&mut self) -> Result<()> {
        let files = {
            let mut s = self.state.lock().unwrap();
            s.refreshes += 1;
            s.pending_files.clear();
            s.pending_symlinks.clear();
            s.remote_files.clone()
        };
        self.materialize(&files);
        Ok(())
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn list_versions(&self, rel_dir: &str) -> Result<Vec<String>> {
        let dir = self.root.join(rel_dir);
        let mut out = Vec::new();
        if let Ok(entries) = fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) == Some("xml") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        out.push(stem.to_string());
                    }
                }
            }
        }
        Ok(out)
    }

    fn has_spec(&self, rel_path: &str) -> bool {
        self.root.join(rel_path).is_file()
    }

    fn read_spec(&self, rel_path: &str) -> Result<String> {
        Ok(fs::read_to_string(self.root.join(rel_path)).unwrap())
    }

    fn write_spec(&self, rel_path: &str, content: &str) -> Result<()> {
        write_text(&self.root.join(rel_path), content)?;
        self.state
            .lock()
            .unwrap()
            .pending_files
            .insert(rel_path.to_string(), content.to_string());
        Ok(())
    }

    fn set_symlink(&self, link_rel: &str, target_rel: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .pending_symlinks
            .insert(link_rel.to_string(), target_rel.to_string());
        Ok(())
    }

    fn symlink_target(&self, link_rel: &str) -> Result<Option<String>> {
        let s = self.state.lock().unwrap();
        Ok(s.pending_symlinks
            .get(link_rel)
            .or_else(|| s.symlinks.get(link_rel))
            .cloned())
    }

    fn push(&mut self, message: &str) -> std::result::Result<(), PublishError> {
        let mut s = self.state.lock().unwrap();
        s.pushes += 1;
        s.push_messages.push(message.to_string());
        let outcome = s.push_results.pop_front().unwrap_or(Ok(()));
        match outcome {
            Ok(()) => {
                for (rel, content) in std::mem::take(&mut s.pending_files) {
                    s.remote_files.insert(rel, content);
                }
                for (link, target) in std::mem::take(&mut s.pending_symlinks) {
                    s.symlinks.insert(link, target);
                }
                Ok(())
            }
            Err(err) => {
                if matches!(err, PublishError::Conflict(_)) {
                    let adds = std::mem::take(&mut s.on_conflict_remote_adds);
                    for (rel, content) in adds {
                        s.remote_files.insert(rel, content);
                    }
                }
                Err(err)
            }
        }
    }
}

pub struct Fixture {
    pub publisher: SpecPublisher,
    pub source_state: Arc<Mutex<SourceState>>,
    pub store_state: Arc<Mutex<StoreState>>,
    // Held for the lifetime of the test so the scratch paths stay valid.
    pub _tmp: tempfile::TempDir,
}

/// A publisher over fake collaborators, with `VERSION.toml` seeded to
/// `version` in the fake source checkout.
pub fn fixture(version: &str) -> Fixture {
    fixture_with(version, false)
}

pub fn fixture_with(version: &str, force: bool) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let source_root = tmp.path().join("src");
    let store_root = tmp.path().join("manifest-versions");
    fs::create_dir_all(&source_root).unwrap();
    fs::create_dir_all(&store_root).unwrap();

    let parts: Vec<&str> = version.split('.').collect();
    assert_eq!(parts.len(), 3, "seed version must be major.branch.patch");
    write_text(
        &source_root.join("VERSION.toml"),
        &format!(
            "build = {}\nbranch = {}\npatch = {}\n",
            parts[0], parts[1], parts[2]
        ),
    )
    .unwrap();

    let source_state = Arc::new(Mutex::new(SourceState {
        manifest: MANIFEST.to_string(),
        different: true,
        ..SourceState::default()
    }));
    let store_state = Arc::new(Mutex::new(StoreState::default()));

    let publisher = SpecPublisher::new(
        Box::new(FakeSource {
            root: source_root,
            state: source_state.clone(),
        }),
        Box::new(FakeStore {
            root: store_root,
            state: store_state.clone(),
        }),
        "amd64-generic".into(),
        BuildType::Pfq,
        IncrType::Build,
        "VERSION.toml".into(),
        force,
    );

    Fixture {
        publisher,
        source_state,
        store_state,
        _tmp: tmp,
    }
}

pub fn remote_spec(state: &Arc<Mutex<StoreState>>, version: &str) {
    state.lock().unwrap().remote_files.insert(
        format!("LKGM-candidates/amd64-generic/{version}.xml"),
        MANIFEST.to_string(),
    );
}
