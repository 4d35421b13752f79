use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use parking_lot::{Mutex, RwLock};

use crate::error::{MeshError, Result};
use crate::model::{
    Build, BuildId, BuildKey, BuildSelector, BuildSpec, BuildStatus, NodeId, ParamMap, Project,
    ProjectId, PullRequest, RequestId,
};
use crate::store::{BuildStore, ProjectStore};

const DEFAULT_MAX_BUILDS: usize = 100_000;

#[derive(Debug, Default)]
struct BuildTable {
    builds: BTreeMap<BuildId, Build>,
    next_id: u64,
    next_numbers: HashMap<ProjectId, u64>,
}

/// Build records held in memory.
#[derive(Debug)]
pub struct MemoryBuildStore {
    table: Mutex<BuildTable>,
    max_builds: usize,
}

impl Default for MemoryBuildStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBuildStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_BUILDS)
    }

    pub fn with_capacity(max_builds: usize) -> Self {
        Self {
            table: Mutex::new(BuildTable::default()),
            max_builds,
        }
    }

    pub fn all(&self) -> Vec<Build> {
        self.table.lock().builds.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().builds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().builds.is_empty()
    }
}

impl BuildStore for MemoryBuildStore {
    fn create(&self, mut build: Build) -> Build {
        let mut table = self.table.lock();
        if table.builds.len() >= self.max_builds {
            // Oldest finished build makes room; unfinished ones are never evicted.
            let oldest = table
                .builds
                .values()
                .find(|b| b.is_finished())
                .map(|b| b.id);
            if let Some(id) = oldest {
                table.builds.remove(&id);
            }
        }
        table.next_id += 1;
        build.id = BuildId(table.next_id);
        let number = table.next_numbers.entry(build.project_id).or_insert(0);
        *number += 1;
        build.number = *number;
        table.builds.insert(build.id, build.clone());
        build
    }

    fn get(&self, id: BuildId) -> Option<Build> {
        self.table.lock().builds.get(&id).cloned()
    }

    fn update(&self, build: &Build) -> Result<()> {
        let mut table = self.table.lock();
        match table.builds.get_mut(&build.id) {
            Some(existing) => {
                *existing = build.clone();
                Ok(())
            }
            None => Err(MeshError::BuildNotFound(build.id)),
        }
    }

    fn delete(&self, id: BuildId) {
        self.table.lock().builds.remove(&id);
    }

    fn modify(&self, id: BuildId, change: &mut dyn FnMut(&mut Build)) -> Result<Build> {
        let mut table = self.table.lock();
        let build = table
            .builds
            .get_mut(&id)
            .ok_or(MeshError::BuildNotFound(id))?;
        change(build);
        Ok(build.clone())
    }

    fn find_equivalent(&self, key: &BuildKey, pipeline: &str) -> Option<Build> {
        self.table
            .lock()
            .builds
            .values()
            .find(|b| &b.key() == key && (b.pipeline == pipeline || !b.is_finished()))
            .cloned()
    }

    fn query_unfinished(&self) -> Vec<(BuildId, ProjectId)> {
        self.table
            .lock()
            .builds
            .values()
            .filter(|b| !b.is_finished())
            .map(|b| (b.id, b.project_id))
            .collect()
    }

    fn query_unfinished_matching(
        &self,
        project_id: ProjectId,
        job_name: &str,
        ref_name: &str,
        request: Option<RequestId>,
        params: &ParamMap,
    ) -> Vec<Build> {
        self.table
            .lock()
            .builds
            .values()
            .filter(|b| {
                !b.is_finished()
                    && b.project_id == project_id
                    && b.job_name == job_name
                    && b.ref_name == ref_name
                    && b.request == request
                    && &b.public_param_map() == params
            })
            .cloned()
            .collect()
    }

    fn find_by_selector(&self, project_id: ProjectId, selector: &BuildSelector) -> Option<Build> {
        let table = self.table.lock();
        let mut builds = table.builds.values().filter(|b| b.project_id == project_id);
        match selector {
            BuildSelector::Number { number } => builds.find(|b| b.number == *number).cloned(),
            BuildSelector::LastSuccessful { job_name, ref_name } => builds
                .filter(|b| {
                    b.status == BuildStatus::Successful
                        && &b.job_name == job_name
                        && ref_name.as_ref().map_or(true, |r| &b.ref_name == r)
                })
                .max_by_key(|b| b.number)
                .cloned(),
        }
    }
}

#[derive(Debug, Default)]
struct ProjectTable {
    projects: HashMap<ProjectId, Project>,
    specs: HashMap<(ProjectId, String), BuildSpec>,
    refs: HashMap<(ProjectId, String), String>,
    parents: HashMap<(ProjectId, String), Vec<String>>,
    storage: HashMap<ProjectId, NodeId>,
    requests: HashMap<RequestId, PullRequest>,
}

/// Projects, commit graph and build specs held in memory.
#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    table: RwLock<ProjectTable>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_project(&self, project: Project, storage_node: NodeId) {
        let mut table = self.table.write();
        table.storage.insert(project.id, storage_node);
        table.projects.insert(project.id, project);
    }

    pub fn set_storage_node(&self, project_id: ProjectId, node: NodeId) {
        self.table.write().storage.insert(project_id, node);
    }

    /// Records a commit with its parents and the spec it carries.
    pub fn add_commit(
        &self,
        project_id: ProjectId,
        commit: &str,
        parents: &[&str],
        spec: Option<BuildSpec>,
    ) {
        let mut table = self.table.write();
        table.parents.insert(
            (project_id, commit.to_string()),
            parents.iter().map(|p| p.to_string()).collect(),
        );
        match spec {
            Some(spec) => {
                table.specs.insert((project_id, commit.to_string()), spec);
            }
            None => {
                table.specs.remove(&(project_id, commit.to_string()));
            }
        }
    }

    pub fn set_ref(&self, project_id: ProjectId, ref_name: &str, commit: &str) {
        self.table
            .write()
            .refs
            .insert((project_id, ref_name.to_string()), commit.to_string());
    }

    pub fn add_pull_request(&self, request: PullRequest) {
        self.table.write().requests.insert(request.id, request);
    }
}

impl ProjectStore for MemoryProjectStore {
    fn project(&self, id: ProjectId) -> Option<Project> {
        self.table.read().projects.get(&id).cloned()
    }

    fn find_by_path(&self, path: &str) -> Option<Project> {
        self.table
            .read()
            .projects
            .values()
            .find(|p| p.path == path)
            .cloned()
    }

    fn build_spec(&self, project_id: ProjectId, commit: &str) -> Option<BuildSpec> {
        self.table
            .read()
            .specs
            .get(&(project_id, commit.to_string()))
            .cloned()
    }

    fn resolve_ref(&self, project_id: ProjectId, ref_name: &str) -> Option<String> {
        self.table
            .read()
            .refs
            .get(&(project_id, ref_name.to_string()))
            .cloned()
    }

    fn is_merged_into(&self, project_id: ProjectId, base: &str, tip: &str) -> bool {
        let table = self.table.read();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([tip.to_string()]);
        while let Some(commit) = queue.pop_front() {
            if commit == base {
                return true;
            }
            if !seen.insert(commit.clone()) {
                continue;
            }
            if let Some(parents) = table.parents.get(&(project_id, commit)) {
                queue.extend(parents.iter().cloned());
            }
        }
        false
    }

    fn storage_node(&self, project_id: ProjectId) -> Option<NodeId> {
        self.table.read().storage.get(&project_id).copied()
    }

    fn projects(&self) -> Vec<ProjectId> {
        self.table.read().projects.keys().copied().collect()
    }

    fn pull_request(&self, id: RequestId) -> Option<PullRequest> {
        self.table.read().requests.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_store() -> MemoryProjectStore {
        let store = MemoryProjectStore::new();
        store.add_project(
            Project {
                id: ProjectId(1),
                path: "acme/app".to_string(),
                default_branch: Some("main".to_string()),
            },
            NodeId(1),
        );
        store.add_commit(ProjectId(1), "c1", &[], None);
        store.add_commit(ProjectId(1), "c2", &["c1"], None);
        store.add_commit(ProjectId(1), "c3", &["c2"], None);
        store.add_commit(ProjectId(1), "side", &["c1"], None);
        store
    }

    #[test]
    fn ancestry() {
        let store = project_store();
        assert!(store.is_merged_into(ProjectId(1), "c1", "c3"));
        assert!(store.is_merged_into(ProjectId(1), "c3", "c3"));
        assert!(!store.is_merged_into(ProjectId(1), "c3", "c1"));
        assert!(!store.is_merged_into(ProjectId(1), "side", "c3"));
    }

    #[test]
    fn create_assigns_ids_and_numbers_per_project() {
        let store = MemoryBuildStore::new();
        let a = store.create(Build::new(ProjectId(1), "c1", "test", "refs/heads/main", "p"));
        let b = store.create(Build::new(ProjectId(1), "c2", "test", "refs/heads/main", "p"));
        let c = store.create(Build::new(ProjectId(2), "c1", "test", "refs/heads/main", "p"));
        assert_eq!((a.id, a.number), (BuildId(1), 1));
        assert_eq!((b.id, b.number), (BuildId(2), 2));
        assert_eq!((c.id, c.number), (BuildId(3), 1));
    }

    #[test]
    fn deleted_build_is_gone_and_its_number_not_reused() {
        let store = MemoryBuildStore::new();
        let a = store.create(Build::new(ProjectId(1), "c1", "test", "refs/heads/main", "p"));
        store.delete(a.id);
        assert!(store.get(a.id).is_none());
        assert!(store.is_empty());
        let b = store.create(Build::new(ProjectId(1), "c1", "test", "refs/heads/main", "p"));
        assert_eq!(b.number, 2);
    }

    #[test]
    fn equivalent_build_respects_pipeline_for_finished_builds() {
        let store = MemoryBuildStore::new();
        let build = store.create(Build::new(ProjectId(1), "c1", "test", "refs/heads/main", "p1"));
        let key = build.key();
        assert!(store.find_equivalent(&key, "p2").is_some());

        store
            .modify(build.id, &mut |b| b.finish(BuildStatus::Successful))
            .unwrap();
        assert!(store.find_equivalent(&key, "p1").is_some());
        assert!(store.find_equivalent(&key, "p2").is_none());
    }

    #[test]
    fn last_successful_selector() {
        let store = MemoryBuildStore::new();
        for commit in ["c1", "c2", "c3"] {
            let build = store.create(Build::new(ProjectId(1), commit, "release", "refs/heads/main", "p"));
            if commit != "c3" {
                store
                    .modify(build.id, &mut |b| b.finish(BuildStatus::Successful))
                    .unwrap();
            }
        }
        let found = store
            .find_by_selector(
                ProjectId(1),
                &BuildSelector::LastSuccessful {
                    job_name: "release".to_string(),
                    ref_name: None,
                },
            )
            .unwrap();
        assert_eq!(found.commit_hash, "c2");
    }
}
