use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::model::{spec::matches_patterns, Build, ProjectId};
use crate::store::ArtifactStore;

/// Artifacts kept on the local filesystem under
/// `<root>/<project>/<build number>/artifacts`.
///
/// Every build directory is guarded by its own read/write lock so cleaning a
/// resubmitted build never races with dependents copying from it.
#[derive(Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
    locks: Mutex<HashMap<(ProjectId, u64), Arc<RwLock<()>>>>,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn build_dir(&self, project_id: ProjectId, build_number: u64) -> PathBuf {
        self.root
            .join(project_id.to_string())
            .join(build_number.to_string())
    }

    pub fn artifacts_dir(&self, project_id: ProjectId, build_number: u64) -> PathBuf {
        self.build_dir(project_id, build_number).join("artifacts")
    }

    fn lock(&self, project_id: ProjectId, build_number: u64) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .entry((project_id, build_number))
            .or_default()
            .clone()
    }

    /// Stores files (relative path to content) as artifacts of a build.
    pub fn publish(
        &self,
        project_id: ProjectId,
        build_number: u64,
        files: &BTreeMap<String, Vec<u8>>,
    ) -> Result<usize> {
        let lock = self.lock(project_id, build_number);
        let _guard = lock.write();
        let dir = self.artifacts_dir(project_id, build_number);
        for (relative, content) in files {
            let target = dir.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, content)?;
        }
        Ok(files.len())
    }
}

impl ArtifactStore for FsArtifactStore {
    fn clean_build_dir(&self, project_id: ProjectId, build_number: u64) -> Result<()> {
        let lock = self.lock(project_id, build_number);
        let _guard = lock.write();
        let dir = self.build_dir(project_id, build_number);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            tracing::debug!(project_id = %project_id, build_number, "Cleaned build directory");
        }
        Ok(())
    }

    fn copy_artifacts(&self, build: &Build, patterns: &str, target: &Path) -> Result<usize> {
        let lock = self.lock(build.project_id, build.number);
        let _guard = lock.read();
        let source = self.artifacts_dir(build.project_id, build.number);
        if !source.exists() {
            return Ok(0);
        }
        let mut copied = 0;
        for relative in list_files(&source)? {
            if !matches_patterns(patterns, &relative) {
                continue;
            }
            let destination = target.join(&relative);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(source.join(&relative), destination)?;
            copied += 1;
        }
        Ok(copied)
    }
}

/// Relative paths (with `/` separators) of every file below `dir`.
pub fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        for entry in fs::read_dir(dir.join(&relative))? {
            let entry = entry?;
            let path = relative.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                pending.push(path);
            } else {
                let parts: Vec<String> = path
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                files.push(parts.join("/"));
            }
        }
    }
    files.sort();
    Ok(files)
}
