//! Authorization and secret lookup consumed by submission and execution.
//!
//! Permission checks take an explicit [`Subject`] instead of relying on any
//! ambient "current user".

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::model::{ProjectId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Anonymous,
    User(UserId),
}

pub trait AccessControl: Send + Sync {
    fn user_by_access_token(&self, token: &str) -> Option<UserId>;

    /// Whether `subject` may read builds (and their artifacts) of a project.
    fn can_access_build(&self, subject: &Subject, project_id: ProjectId) -> bool;
}

pub trait SecretResolver: Send + Sync {
    fn secret(&self, project_id: ProjectId, name: &str) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct MemoryAccessControl {
    tokens: RwLock<HashMap<String, UserId>>,
    grants: RwLock<HashSet<(UserId, ProjectId)>>,
    public: RwLock<HashSet<ProjectId>>,
}

impl MemoryAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_access_token(&self, token: impl Into<String>, user: UserId) {
        self.tokens.write().insert(token.into(), user);
    }

    pub fn grant(&self, user: UserId, project_id: ProjectId) {
        self.grants.write().insert((user, project_id));
    }

    /// Builds of a public project are readable by anonymous subjects.
    pub fn make_public(&self, project_id: ProjectId) {
        self.public.write().insert(project_id);
    }
}

impl AccessControl for MemoryAccessControl {
    fn user_by_access_token(&self, token: &str) -> Option<UserId> {
        self.tokens.read().get(token).copied()
    }

    fn can_access_build(&self, subject: &Subject, project_id: ProjectId) -> bool {
        if self.public.read().contains(&project_id) {
            return true;
        }
        match subject {
            Subject::Anonymous => false,
            Subject::User(user) => self.grants.read().contains(&(*user, project_id)),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemorySecretResolver {
    secrets: RwLock<HashMap<(ProjectId, String), String>>,
}

impl MemorySecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, project_id: ProjectId, name: impl Into<String>, value: impl Into<String>) {
        self.secrets
            .write()
            .insert((project_id, name.into()), value.into());
    }
}

impl SecretResolver for MemorySecretResolver {
    fn secret(&self, project_id: ProjectId, name: &str) -> Option<String> {
        self.secrets
            .read()
            .get(&(project_id, name.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_and_public_projects() {
        let access = MemoryAccessControl::new();
        access.grant(UserId(7), ProjectId(1));
        access.make_public(ProjectId(2));

        assert!(access.can_access_build(&Subject::User(UserId(7)), ProjectId(1)));
        assert!(!access.can_access_build(&Subject::Anonymous, ProjectId(1)));
        assert!(access.can_access_build(&Subject::Anonymous, ProjectId(2)));
        assert!(!access.can_access_build(&Subject::User(UserId(8)), ProjectId(1)));
    }

    #[test]
    fn access_token_lookup() {
        let access = MemoryAccessControl::new();
        access.add_access_token("tok-123", UserId(4));
        assert_eq!(access.user_by_access_token("tok-123"), Some(UserId(4)));
        assert_eq!(access.user_by_access_token("nope"), None);
    }
}
