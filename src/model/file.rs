use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::access::AccessRights;

pub const MAX_PATH_LENGTH: usize = 4096;
pub const MAX_TAGS: usize = 8;
pub const MAX_TAG_LENGTH: usize = 64;

/// Paths are store-relative: no leading slash, no `..` components.
pub fn is_path_valid(path: &str) -> bool {
    !path.is_empty()
        && path.len() <= MAX_PATH_LENGTH
        && !path.starts_with('/')
        && !path.split('/').any(|part| part == "..")
}

pub fn is_tag_valid(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= MAX_TAG_LENGTH
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

/// Metadata for one stored file. The blob on disk is named by `id` without
/// braces; `md5_checksum` is 32 hex characters over the blob's bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub id: Uuid,
    pub path: String,
    pub size: i64,
    pub md5_checksum: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub access_rights: AccessRights,
    pub created_at: i64,
    pub updated_at: i64,
}

/// In-memory carrier for a file-service task: metadata plus content bytes
/// travelling in whichever direction the task needs.
#[derive(Clone, Debug, Default)]
pub struct FileObject {
    pub info: FileInfo,
    pub content: Vec<u8>,
}
