use serde::{Deserialize, Serialize};

use super::identity::{ROOT_GROUP, ROOT_USER, UserInfo};

pub const MODE_READ: u8 = 1;
pub const MODE_WRITE: u8 = 2;
pub const MODE_EXECUTE: u8 = 4;
const MODE_ALL: u8 = MODE_READ | MODE_WRITE | MODE_EXECUTE;

/// The access a caller asks for. `Ownership` is the mask-less variant used
/// when only the owner (or root) may act, e.g. changing a file's mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessQuery {
    Ownership,
    Read,
    Write,
    Execute,
}

impl AccessQuery {
    fn mask(self) -> u8 {
        match self {
            AccessQuery::Ownership => 0,
            AccessQuery::Read => MODE_READ,
            AccessQuery::Write => MODE_WRITE,
            AccessQuery::Execute => MODE_EXECUTE,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessOwner {
    pub user: String,
    pub group: String,
}

impl AccessOwner {
    pub fn new(user: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            group: group.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.user.is_empty() && !self.group.is_empty()
    }
}

/// rwx masks for the owning user, the owning group, and everyone else.
/// Serialized as three integers in `[0,7]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessMasks {
    pub user: u8,
    pub group: u8,
    pub other: u8,
}

impl AccessMasks {
    pub fn new(user: u8, group: u8, other: u8) -> Self {
        Self { user, group, other }
    }

    pub fn is_valid(&self) -> bool {
        self.user <= MODE_ALL && self.group <= MODE_ALL && self.other <= MODE_ALL
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRights {
    pub owner: AccessOwner,
    pub mode: AccessMasks,
}

impl AccessRights {
    pub fn new(owner: AccessOwner, mode: AccessMasks) -> Self {
        Self { owner, mode }
    }

    pub fn is_valid(&self) -> bool {
        self.owner.is_valid() && self.mode.is_valid()
    }

    fn grants(&self, user: &UserInfo, mask: u8) -> bool {
        (user.name == self.owner.user && self.mode.user & mask != 0)
            || (user.has_group(&self.owner.group) && self.mode.group & mask != 0)
            || self.mode.other & mask != 0
    }
}

/// The one policy function every service consults.
///
/// `Ownership` checks pass only for `root` and the owning user. Mask checks
/// additionally short-circuit for `root` and members of the `root` group.
pub fn authorize_user_access(user: &UserInfo, rights: &AccessRights, query: AccessQuery) -> bool {
    if query == AccessQuery::Ownership {
        return user.name == ROOT_USER || user.name == rights.owner.user;
    }
    user.name == ROOT_USER || user.has_group(ROOT_GROUP) || rights.grants(user, query.mask())
}
