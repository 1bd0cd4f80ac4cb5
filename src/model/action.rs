use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::access::AccessRights;
use super::error::ErrorKind;

/// The closed action namespace. Every inbound request names exactly one of
/// these keys.
pub mod names {
    pub const TEST: &str = "test";

    pub const FILE_LIST: &str = "file.list";
    pub const FILE_INFO: &str = "file.info";
    pub const FILE_UPLOAD: &str = "file.upload";
    pub const FILE_UPDATE: &str = "file.update";
    pub const FILE_UPDATE_ACCESS_OWNER: &str = "file.update-access-owner";
    pub const FILE_UPDATE_ACCESS_MODE: &str = "file.update-access-mode";
    pub const FILE_UPDATE_VERSION: &str = "file.update-version";
    pub const FILE_UPDATE_TAGS: &str = "file.update-tags";
    pub const FILE_DOWNLOAD: &str = "file.download";
    pub const FILE_REMOVE: &str = "file.remove";

    pub const USER_LIST: &str = "user.list";
    pub const USER_INFO: &str = "user.info";
    pub const USER_ADD: &str = "user.add";
    pub const USER_UPDATE: &str = "user.update";
    pub const USER_REMOVE: &str = "user.remove";
    pub const USER_REGISTER: &str = "user.register";

    pub const USER_TOKENS_LIST: &str = "user.tokens.list";
    pub const USER_TOKEN_GENERATE: &str = "user.token.generate";
    pub const USER_TOKEN_REMOVE: &str = "user.token.remove";

    pub const GROUP_LIST: &str = "group.list";
    pub const GROUP_INFO: &str = "group.info";
    pub const GROUP_ADD: &str = "group.add";
    pub const GROUP_REMOVE: &str = "group.remove";

    pub const ACTION_LIST: &str = "action.list";
    pub const ACTION_UPDATE_ACCESS_OWNER: &str = "action.update-access-owner";
    pub const ACTION_UPDATE_ACCESS_MODE: &str = "action.update-access-mode";

    pub const PROCESS_LIST: &str = "process.list";
    pub const PROCESS: &str = "process";
    pub const PROCESS_UPDATE_ACCESS_OWNER: &str = "process.update-access-owner";
    pub const PROCESS_UPDATE_ACCESS_MODE: &str = "process.update-access-mode";

    pub const STATISTICS: &str = "statistics";
    pub const STOP: &str = "stop";
    pub const REPORT_SUBMIT: &str = "report.submit";
}

pub const ALL_ACTIONS: &[&str] = &[
    names::TEST,
    names::FILE_LIST,
    names::FILE_INFO,
    names::FILE_UPLOAD,
    names::FILE_UPDATE,
    names::FILE_UPDATE_ACCESS_OWNER,
    names::FILE_UPDATE_ACCESS_MODE,
    names::FILE_UPDATE_VERSION,
    names::FILE_UPDATE_TAGS,
    names::FILE_DOWNLOAD,
    names::FILE_REMOVE,
    names::USER_LIST,
    names::USER_INFO,
    names::USER_ADD,
    names::USER_UPDATE,
    names::USER_REMOVE,
    names::USER_REGISTER,
    names::USER_TOKENS_LIST,
    names::USER_TOKEN_GENERATE,
    names::USER_TOKEN_REMOVE,
    names::GROUP_LIST,
    names::GROUP_INFO,
    names::GROUP_ADD,
    names::GROUP_REMOVE,
    names::ACTION_LIST,
    names::ACTION_UPDATE_ACCESS_OWNER,
    names::ACTION_UPDATE_ACCESS_MODE,
    names::PROCESS_LIST,
    names::PROCESS,
    names::PROCESS_UPDATE_ACCESS_OWNER,
    names::PROCESS_UPDATE_ACCESS_MODE,
    names::STATISTICS,
    names::STOP,
    names::REPORT_SUBMIT,
];

/// One inbound request, or its resolved reply. `resource_id` uses the nil
/// UUID when the action carries none.
#[derive(Clone, Debug)]
pub struct CloudAction {
    pub id: Uuid,
    pub executor: String,
    pub action: String,
    pub resource_name: String,
    pub resource_id: Uuid,
    pub data: Vec<u8>,
    pub error: ErrorKind,
}

impl CloudAction {
    pub fn reply(&self, error: ErrorKind, data: Vec<u8>) -> CloudAction {
        CloudAction {
            id: self.id,
            executor: self.executor.clone(),
            action: self.action.clone(),
            resource_name: self.resource_name.clone(),
            resource_id: self.resource_id,
            data,
            error,
        }
    }
}

/// One action-catalog entry: a name from the closed namespace and the rights
/// governing who may execute it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInfo {
    pub name: String,
    pub access_rights: AccessRights,
}
