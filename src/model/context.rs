use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::spec::{CacheSpec, Service};
use crate::model::{BuildId, ProjectId};

/// Executor configuration carried inside a [`JobContext`] so that any node
/// can reason about the executor without holding its runtime backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSettings {
    pub name: String,
    pub enabled: bool,
    pub shell_access_enabled: bool,
    /// Days an unused cache slot is kept before it is evicted.
    pub cache_ttl_days: u32,
    pub job_requirement: Option<crate::worker::executor::JobMatch>,
}

impl ExecutorSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            shell_access_enabled: false,
            cache_ttl_days: 7,
            job_requirement: None,
        }
    }

    pub fn cache_ttl_millis(&self) -> i64 {
        i64::from(self.cache_ttl_days) * 24 * 3600 * 1000
    }
}

/// An interpolated step, ready to be run by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Command {
        image: Option<String>,
        commands: String,
    },
    Server {
        step_type: String,
        properties: BTreeMap<String, String>,
    },
    Composite {
        actions: Vec<Action>,
    },
}

impl Action {
    /// Finds the leaf action at `position`, descending into composites.
    pub fn locate<'a>(actions: &'a [Action], position: &[usize]) -> Option<&'a Action> {
        let (first, rest) = position.split_first()?;
        let action = actions.get(*first)?;
        if rest.is_empty() {
            return Some(action);
        }
        match &action.kind {
            ActionKind::Composite { actions } => Action::locate(actions, rest),
            _ => None,
        }
    }
}

/// Cluster-visible descriptor of one in-flight job attempt, keyed by its
/// job token in the shared job context map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    pub job_token: String,
    pub executor: ExecutorSettings,
    pub project_id: ProjectId,
    pub project_path: String,
    pub build_id: BuildId,
    pub build_number: u64,
    pub job_name: String,
    pub ref_name: String,
    pub commit_hash: String,
    pub actions: Vec<Action>,
    pub cache_specs: Vec<CacheSpec>,
    pub services: Vec<Service>,
    pub retried: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(name: &str) -> Action {
        Action {
            name: name.to_string(),
            kind: ActionKind::Command {
                image: None,
                commands: "true".to_string(),
            },
        }
    }

    #[test]
    fn locate_nested_action() {
        let actions = vec![
            command("checkout"),
            Action {
                name: "group".to_string(),
                kind: ActionKind::Composite {
                    actions: vec![command("inner-a"), command("inner-b")],
                },
            },
        ];
        assert_eq!(Action::locate(&actions, &[0]).unwrap().name, "checkout");
        assert_eq!(Action::locate(&actions, &[1, 1]).unwrap().name, "inner-b");
        assert!(Action::locate(&actions, &[0, 1]).is_none());
        assert!(Action::locate(&actions, &[5]).is_none());
        assert!(Action::locate(&actions, &[]).is_none());
    }

    #[test]
    fn cache_ttl_in_millis() {
        let settings = ExecutorSettings::new("docker");
        assert_eq!(settings.cache_ttl_millis(), 7 * 24 * 3600 * 1000);
    }
}
