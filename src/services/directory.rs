use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{error, info};
use uuid::Uuid;

use crate::model::error::{ServiceError, ServiceResult};
use crate::model::identity::{self, AuthToken, GroupInfo, UserInfo};
use crate::persist::write_atomic;

#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryState {
    #[serde(default)]
    users: Vec<UserInfo>,
    #[serde(default)]
    groups: Vec<GroupInfo>,
    #[serde(default)]
    tokens: Vec<AuthToken>,
}

/// The identity substrate: users, groups, and one-shot auth tokens, mirrored
/// to a single JSON document after every mutation.
pub struct Directory {
    file_path: PathBuf,
    state: RwLock<DirectoryState>,
}

impl Directory {
    /// Load `users.json`, or seed the reserved users and groups when the file
    /// does not exist yet.
    pub fn load(file_path: PathBuf) -> Result<Self> {
        let state = if file_path.exists() {
            info!("reading users file {}", file_path.display());
            let bytes = std::fs::read(&file_path)
                .with_context(|| format!("read {}", file_path.display()))?;
            serde_json::from_slice(&bytes)
                .with_context(|| format!("parse {}", file_path.display()))?
        } else {
            let state = DirectoryState {
                users: vec![
                    UserInfo::new(identity::ROOT_USER, vec![identity::ROOT_GROUP.to_string()]),
                    UserInfo::new(identity::GUEST_USER, vec![identity::GUEST_GROUP.to_string()]),
                ],
                groups: vec![
                    GroupInfo::new(identity::ROOT_GROUP),
                    GroupInfo::new(identity::GUEST_GROUP),
                    GroupInfo::new(identity::USER_GROUP),
                ],
                tokens: Vec::new(),
            };
            info!("seeding users file {}", file_path.display());
            let bytes = serde_json::to_vec_pretty(&state).context("serialize users")?;
            write_atomic(&file_path, &bytes)?;
            state
        };

        Ok(Self {
            file_path,
            state: RwLock::new(state),
        })
    }

    pub fn contains_user(&self, name: &str) -> bool {
        self.state.read().unwrap().users.iter().any(|u| u.name == name)
    }

    pub fn find_user(&self, name: &str) -> Option<UserInfo> {
        self.state
            .read()
            .unwrap()
            .users
            .iter()
            .find(|u| u.name == name)
            .cloned()
    }

    pub fn users(&self) -> Vec<UserInfo> {
        self.state.read().unwrap().users.clone()
    }

    pub fn contains_group(&self, name: &str) -> bool {
        self.state.read().unwrap().groups.iter().any(|g| g.name == name)
    }

    pub fn find_group(&self, name: &str) -> Option<GroupInfo> {
        self.state
            .read()
            .unwrap()
            .groups
            .iter()
            .find(|g| g.name == name)
            .cloned()
    }

    pub fn groups(&self) -> Vec<GroupInfo> {
        self.state.read().unwrap().groups.clone()
    }

    pub fn tokens(&self) -> Vec<AuthToken> {
        self.state.read().unwrap().tokens.clone()
    }

    /// Self-service record for a new user: member of `users` only.
    pub fn create_user(name: &str) -> UserInfo {
        UserInfo::new(name, vec![identity::USER_GROUP.to_string()])
    }

    pub fn add_user(&self, user: UserInfo) -> ServiceResult<()> {
        let mut state = self.state.write().unwrap();
        Self::validate_user(&state, &user)?;
        if state.users.iter().any(|u| u.name == user.name) {
            return Err(ServiceError::invalid_input(format!(
                "User \"{}\" already exists.",
                user.name
            )));
        }
        info!("add user \"{}\"", user.name);
        state.users.push(user);
        self.persist(&state);
        Ok(())
    }

    pub fn set_user(&self, name: &str, user: UserInfo) -> ServiceResult<()> {
        let mut state = self.state.write().unwrap();
        Self::validate_user(&state, &user)?;
        if user.name != name && state.users.iter().any(|u| u.name == user.name) {
            return Err(ServiceError::invalid_input(format!(
                "User \"{}\" already exists.",
                user.name
            )));
        }
        let Some(existing) = state.users.iter_mut().find(|u| u.name == name) else {
            return Err(ServiceError::invalid_input(format!(
                "User \"{name}\" does not exist."
            )));
        };
        info!("set user \"{}\"", name);
        *existing = user;
        self.persist(&state);
        Ok(())
    }

    pub fn remove_user(&self, name: &str) -> ServiceResult<()> {
        let mut state = self.state.write().unwrap();
        let Some(position) = state.users.iter().position(|u| u.name == name) else {
            return Err(ServiceError::invalid_input(format!(
                "User \"{name}\" does not exist."
            )));
        };
        info!("remove user \"{}\"", name);
        state.users.remove(position);
        self.persist(&state);
        Ok(())
    }

    pub fn add_group(&self, group: GroupInfo) -> ServiceResult<()> {
        let mut state = self.state.write().unwrap();
        if !identity::is_name_valid(&group.name) {
            return Err(ServiceError::invalid_input(format!(
                "Group name \"{}\" is not valid.",
                group.name
            )));
        }
        if state.groups.iter().any(|g| g.name == group.name) {
            return Err(ServiceError::invalid_input(format!(
                "Group \"{}\" already exists.",
                group.name
            )));
        }
        info!("add group \"{}\"", group.name);
        state.groups.push(group);
        self.persist(&state);
        Ok(())
    }

    pub fn set_group(&self, group: GroupInfo) -> ServiceResult<()> {
        let mut state = self.state.write().unwrap();
        if !identity::is_name_valid(&group.name) {
            return Err(ServiceError::invalid_input(format!(
                "Group name \"{}\" is not valid.",
                group.name
            )));
        }
        let Some(existing) = state.groups.iter_mut().find(|g| g.name == group.name) else {
            return Err(ServiceError::invalid_input(format!(
                "Group \"{}\" does not exist.",
                group.name
            )));
        };
        info!("set group \"{}\"", group.name);
        *existing = group;
        self.persist(&state);
        Ok(())
    }

    /// Remove a group and drop it from every member's group list. Each
    /// affected user counts as a user change and rides the same write.
    pub fn remove_group(&self, name: &str) -> ServiceResult<()> {
        let mut state = self.state.write().unwrap();
        let Some(position) = state.groups.iter().position(|g| g.name == name) else {
            return Err(ServiceError::invalid_input(format!(
                "Group \"{name}\" does not exist."
            )));
        };
        info!("remove group \"{}\"", name);
        state.groups.remove(position);
        for user in state.users.iter_mut() {
            if user.has_group(name) {
                user.group_names.retain(|g| g != name);
                info!("user \"{}\" changed: dropped group \"{}\"", user.name, name);
            }
        }
        self.persist(&state);
        Ok(())
    }

    pub fn find_token(&self, id: Uuid) -> Option<AuthToken> {
        self.state
            .read()
            .unwrap()
            .tokens
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub fn contains_token(&self, resource_name: &str, content: &str) -> bool {
        self.state
            .read()
            .unwrap()
            .tokens
            .iter()
            .any(|t| t.resource_name == resource_name && t.content == content)
    }

    pub fn add_token(&self, token: AuthToken) -> ServiceResult<()> {
        let mut state = self.state.write().unwrap();
        if token.resource_name.is_empty() || token.content.is_empty() {
            return Err(ServiceError::invalid_input("Token is not valid."));
        }
        if state.tokens.iter().any(|t| t.id == token.id) {
            return Err(ServiceError::invalid_input(
                "Token with given ID already exists.",
            ));
        }
        if state
            .tokens
            .iter()
            .any(|t| t.resource_name == token.resource_name && t.content == token.content)
        {
            return Err(ServiceError::invalid_input(
                "Token with given resource name and content already exists.",
            ));
        }
        info!(
            "add token id=\"{}\" resource=\"{}\"",
            token.id, token.resource_name
        );
        state.tokens.push(token);
        self.persist(&state);
        Ok(())
    }

    pub fn remove_token(&self, id: Uuid) -> ServiceResult<()> {
        let mut state = self.state.write().unwrap();
        let Some(position) = state.tokens.iter().position(|t| t.id == id) else {
            return Err(ServiceError::invalid_input(format!(
                "Token \"{id}\" does not exist."
            )));
        };
        info!("remove token id=\"{}\"", id);
        state.tokens.remove(position);
        self.persist(&state);
        Ok(())
    }

    /// Single-shot validation: the token matching `(resource_name, content)`
    /// is removed whether or not it is still valid, so a credential can be
    /// tried at most once.
    pub fn validate_token(&self, resource_name: &str, content: &str) -> bool {
        let mut state = self.state.write().unwrap();
        let Some(position) = state
            .tokens
            .iter()
            .position(|t| t.resource_name == resource_name && t.content == content)
        else {
            return false;
        };
        let token = state.tokens.remove(position);
        self.persist(&state);
        let valid = token.validity_date > OffsetDateTime::now_utc().unix_timestamp();
        info!(
            "consumed token id=\"{}\" resource=\"{}\" valid={}",
            token.id, token.resource_name, valid
        );
        valid
    }

    pub fn statistics_json(&self) -> serde_json::Value {
        let state = self.state.read().unwrap();
        serde_json::json!({
            "name": "users",
            "users": state.users.len(),
            "groups": state.groups.len(),
        })
    }

    /// Flush the whole directory; used at shutdown.
    pub fn write_file(&self) -> Result<()> {
        let state = self.state.read().unwrap();
        let bytes = serde_json::to_vec_pretty(&*state).context("serialize users")?;
        write_atomic(&self.file_path, &bytes)
    }

    fn validate_user(state: &DirectoryState, user: &UserInfo) -> ServiceResult<()> {
        if !identity::is_name_valid(&user.name) {
            return Err(ServiceError::invalid_input(format!(
                "User name \"{}\" is not valid.",
                user.name
            )));
        }
        for group in &user.group_names {
            if !state.groups.iter().any(|g| &g.name == group) {
                return Err(ServiceError::invalid_input(format!(
                    "User group \"{group}\" does not exist."
                )));
            }
        }
        Ok(())
    }

    /// Persistence failures are logged, not fatal: the in-memory state is
    /// authoritative and the next mutation retries the write.
    fn persist(&self, state: &DirectoryState) {
        let bytes = match serde_json::to_vec_pretty(state) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("failed to serialize users file: {err}");
                return;
            }
        };
        if let Err(err) = write_atomic(&self.file_path, &bytes) {
            error!(
                "failed to write users file {}: {err:#}",
                self.file_path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> (tempfile::TempDir, Directory) {
        let dir = tempfile::tempdir().unwrap();
        let directory = Directory::load(dir.path().join("users.json")).unwrap();
        (dir, directory)
    }

    #[test]
    fn seeds_reserved_users_and_groups() {
        let (_dir, directory) = directory();
        assert!(directory.contains_user("root"));
        assert!(directory.contains_user("guest"));
        for group in ["root", "users", "guest"] {
            assert!(directory.contains_group(group));
        }
    }

    #[test]
    fn reload_round_trips_every_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let directory = Directory::load(path.clone()).unwrap();
        directory.add_group(GroupInfo::new("staff")).unwrap();
        directory
            .add_user(UserInfo::new("alice", vec!["users".into(), "staff".into()]))
            .unwrap();
        let token = AuthToken::generate("alice").unwrap();
        directory.add_token(token.clone()).unwrap();

        let reloaded = Directory::load(path).unwrap();
        assert_eq!(
            reloaded.find_user("alice").unwrap().group_names,
            vec!["users".to_string(), "staff".to_string()]
        );
        assert_eq!(reloaded.find_token(token.id).unwrap(), token);
    }

    #[test]
    fn rejects_invalid_and_duplicate_users() {
        let (_dir, directory) = directory();
        assert!(directory.add_user(UserInfo::new("bad name", vec![])).is_err());
        assert!(
            directory
                .add_user(UserInfo::new("alice", vec!["missing".into()]))
                .is_err()
        );
        directory.add_user(Directory::create_user("alice")).unwrap();
        assert!(directory.add_user(Directory::create_user("alice")).is_err());
    }

    #[test]
    fn group_removal_cascades_to_members() {
        let (_dir, directory) = directory();
        directory.add_group(GroupInfo::new("g1")).unwrap();
        directory
            .add_user(UserInfo::new("u1", vec!["users".into(), "g1".into()]))
            .unwrap();
        directory.remove_group("g1").unwrap();
        assert_eq!(
            directory.find_user("u1").unwrap().group_names,
            vec!["users".to_string()]
        );
        assert!(!directory.contains_group("g1"));
    }

    #[test]
    fn set_group_requires_an_existing_group() {
        let (_dir, directory) = directory();
        assert!(directory.set_group(GroupInfo::new("missing")).is_err());
        directory.add_group(GroupInfo::new("staff")).unwrap();
        assert!(directory.set_group(GroupInfo::new("staff")).is_ok());
    }

    #[test]
    fn tokens_are_found_by_pair_and_by_id() {
        let (_dir, directory) = directory();
        let token = AuthToken::generate("alice").unwrap();
        directory.add_token(token.clone()).unwrap();
        assert!(directory.contains_token("alice", &token.content));
        assert!(!directory.contains_token("bob", &token.content));
        assert_eq!(directory.find_token(token.id).unwrap().content, token.content);
    }

    #[test]
    fn token_validates_at_most_once() {
        let (_dir, directory) = directory();
        let token = AuthToken::generate("alice").unwrap();
        directory.add_token(token.clone()).unwrap();

        assert!(directory.validate_token("alice", &token.content));
        // Consumed: second attempt fails and the token is gone.
        assert!(!directory.validate_token("alice", &token.content));
        assert!(directory.find_token(token.id).is_none());
    }

    #[test]
    fn expired_token_fails_but_is_still_consumed() {
        let (_dir, directory) = directory();
        let mut token = AuthToken::generate("alice").unwrap();
        token.validity_date = 0;
        directory.add_token(token.clone()).unwrap();

        assert!(!directory.validate_token("alice", &token.content));
        assert!(directory.find_token(token.id).is_none());
    }

    #[test]
    fn duplicate_token_pairs_are_rejected() {
        let (_dir, directory) = directory();
        let token = AuthToken::generate("alice").unwrap();
        directory.add_token(token.clone()).unwrap();
        let mut duplicate = AuthToken::generate("alice").unwrap();
        duplicate.content = token.content.clone();
        assert!(directory.add_token(duplicate).is_err());
    }
}
