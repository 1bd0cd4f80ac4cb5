use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::access::AccessRights;
use super::error::ErrorKind;
use super::identity::UserInfo;

/// One process-catalog entry. `executable` may reference the configured
/// processes directory with the literal `<processes>`; arguments may carry
/// `<key>` placeholders filled from the request's argument values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub name: String,
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub access_rights: AccessRights,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    pub name: String,
    #[serde(default)]
    pub argument_values: BTreeMap<String, String>,
    /// Resolved server-side from the action's executor; never trusted from
    /// the wire.
    #[serde(skip)]
    pub executor: UserInfo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub request: ProcessRequest,
    pub message: String,
}

/// Outcome of one finished child: captured output buffers and the error
/// classification (`None` only for a normal exit with code 0).
#[derive(Clone, Debug)]
pub struct ProcessResult {
    pub request: ProcessRequest,
    pub output: String,
    pub errors: String,
    pub error: ErrorKind,
}

impl ProcessResult {
    pub fn response_message(&self) -> &str {
        if self.error == ErrorKind::None {
            &self.output
        } else {
            &self.errors
        }
    }
}
