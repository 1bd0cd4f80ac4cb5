use anyhow::Result;
use base64::Engine;
use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

pub const ROOT_USER: &str = "root";
pub const GUEST_USER: &str = "guest";
pub const ROOT_GROUP: &str = "root";
pub const USER_GROUP: &str = "users";
pub const GUEST_GROUP: &str = "guest";

/// Names are restricted to `[a-zA-Z0-9_.-]+` for users and groups alike.
pub fn is_name_valid(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub name: String,
    #[serde(default)]
    pub group_names: Vec<String>,
}

impl UserInfo {
    pub fn new(name: impl Into<String>, group_names: Vec<String>) -> Self {
        Self {
            name: name.into(),
            group_names,
        }
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.group_names.iter().any(|g| g == group)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
}

impl GroupInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// One-shot bearer credential. `content` is Base64 of 32 random bytes and
/// `validity_date` is a unix timestamp (UTC seconds).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
    pub id: Uuid,
    pub resource_name: String,
    pub content: String,
    pub validity_date: i64,
}

impl AuthToken {
    pub fn generate(resource_name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            resource_name: resource_name.into(),
            content: generate_token_content()?,
            validity_date: validity_months_from_now(1),
        })
    }
}

pub fn generate_token_content() -> Result<String> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes).map_err(|e| anyhow::anyhow!("getrandom: {:?}", e))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Unix timestamp `months` calendar months from now, with the day-of-month
/// clamped to the target month's length.
pub fn validity_months_from_now(months: u32) -> i64 {
    let now = OffsetDateTime::now_utc();
    let mut year = now.year();
    let mut month = now.month();
    for _ in 0..months {
        if month == Month::December {
            year += 1;
        }
        month = month.next();
    }
    let day = now.day().min(time::util::days_in_year_month(year, month));
    let date = Date::from_calendar_date(year, month, day).unwrap_or(now.date());
    PrimitiveDateTime::new(date, now.time())
        .assume_utc()
        .unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(is_name_valid("alice"));
        assert!(is_name_valid("alice.bob-01_x"));
        assert!(!is_name_valid(""));
        assert!(!is_name_valid("alice bob"));
        assert!(!is_name_valid("alice@example"));
    }

    #[test]
    fn token_content_is_unique_and_base64() {
        let a = generate_token_content().unwrap();
        let b = generate_token_content().unwrap();
        assert_ne!(a, b);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(a.as_bytes())
            .unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn validity_is_in_the_future() {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let validity = validity_months_from_now(1);
        // A calendar month is between 28 and 31 days.
        assert!(validity >= now + 28 * 24 * 3600);
        assert!(validity <= now + 31 * 24 * 3600 + 1);
    }
}
