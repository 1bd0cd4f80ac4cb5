use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::access::{
    AccessMasks, AccessOwner, AccessQuery, AccessRights, MODE_EXECUTE, authorize_user_access,
};
use crate::model::action::{ALL_ACTIONS, ActionInfo, names};
use crate::model::error::{ServiceError, ServiceResult};
use crate::model::identity::{ROOT_GROUP, ROOT_USER, USER_GROUP, UserInfo};
use crate::persist::write_atomic;

/// Actions whose default owning group is `root` rather than `users`.
const ADMIN_ACTIONS: &[&str] = &[
    names::FILE_UPDATE_ACCESS_OWNER,
    names::STOP,
    names::STATISTICS,
    names::PROCESS,
    names::USER_ADD,
    names::USER_UPDATE,
    names::USER_REMOVE,
    names::GROUP_ADD,
    names::GROUP_REMOVE,
    names::ACTION_UPDATE_ACCESS_OWNER,
    names::ACTION_UPDATE_ACCESS_MODE,
    names::PROCESS_UPDATE_ACCESS_OWNER,
    names::PROCESS_UPDATE_ACCESS_MODE,
];

/// Actions that default to world-executable (`other = x`).
const PUBLIC_ACTIONS: &[&str] = &[
    names::TEST,
    names::FILE_LIST,
    names::FILE_INFO,
    names::FILE_DOWNLOAD,
    names::USER_REGISTER,
    names::PROCESS,
    names::REPORT_SUBMIT,
];

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    actions: Vec<ActionInfo>,
}

/// The persisted per-action access policy. Missing entries get the built-in
/// default on startup; on-disk entries always win.
pub struct ActionCatalog {
    file_path: PathBuf,
    actions: RwLock<Vec<ActionInfo>>,
}

impl ActionCatalog {
    pub fn load(file_path: PathBuf) -> Result<Self> {
        let mut actions = if file_path.exists() {
            info!("reading actions file {}", file_path.display());
            let bytes = std::fs::read(&file_path)
                .with_context(|| format!("read {}", file_path.display()))?;
            let document: CatalogDocument = serde_json::from_slice(&bytes)
                .with_context(|| format!("parse {}", file_path.display()))?;
            document.actions
        } else {
            Vec::new()
        };

        let loaded: HashSet<String> = actions.iter().map(|a| a.name.clone()).collect();
        for name in ALL_ACTIONS {
            if !loaded.contains(*name) {
                actions.push(ActionInfo {
                    name: name.to_string(),
                    access_rights: default_rights(name),
                });
            }
        }

        let catalog = Self {
            file_path,
            actions: RwLock::new(actions),
        };
        catalog.write_file()?;
        Ok(catalog)
    }

    pub fn actions(&self) -> Vec<ActionInfo> {
        self.actions.read().unwrap().clone()
    }

    pub fn find_action(&self, name: &str) -> Option<ActionInfo> {
        self.actions
            .read()
            .unwrap()
            .iter()
            .find(|a| a.name == name)
            .cloned()
    }

    /// May `user` execute the named action?
    pub fn authorize_user(&self, user: &UserInfo, name: &str) -> bool {
        match self.find_action(name) {
            Some(action) => authorize_user_access(user, &action.access_rights, AccessQuery::Execute),
            None => false,
        }
    }

    pub fn update_access_rights(
        &self,
        name: &str,
        access_rights: AccessRights,
    ) -> ServiceResult<ActionInfo> {
        if !access_rights.is_valid() {
            return Err(ServiceError::invalid_input("Invalid access rights."));
        }
        let mut actions = self.actions.write().unwrap();
        let Some(action) = actions.iter_mut().find(|a| a.name == name) else {
            return Err(ServiceError::invalid_input(format!(
                "Action \"{name}\" does not exist."
            )));
        };
        info!("updating action \"{}\" access rights", name);
        action.access_rights = access_rights;
        let updated = action.clone();
        drop(actions);
        if let Err(err) = self.write_file() {
            tracing::error!("failed to write actions file: {err:#}");
        }
        Ok(updated)
    }

    pub fn write_file(&self) -> Result<()> {
        let actions = self.actions.read().unwrap();
        let document = CatalogDocument {
            actions: actions.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&document).context("serialize actions")?;
        write_atomic(&self.file_path, &bytes)
    }

    pub fn statistics_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": "actions",
            "size": self.actions.read().unwrap().len(),
        })
    }
}

fn default_rights(name: &str) -> AccessRights {
    let group = if ADMIN_ACTIONS.contains(&name) {
        ROOT_GROUP
    } else {
        USER_GROUP
    };
    let other = if PUBLIC_ACTIONS.contains(&name) {
        MODE_EXECUTE
    } else {
        0
    };
    AccessRights::new(
        AccessOwner::new(ROOT_USER, group),
        AccessMasks::new(MODE_EXECUTE, MODE_EXECUTE, other),
    )
}
