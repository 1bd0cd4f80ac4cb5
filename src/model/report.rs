use serde::{Deserialize, Serialize};

/// A user-submitted report: free-text report body, an optional comment, and
/// the client-side creation timestamp (unix seconds).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    #[serde(default)]
    pub report: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub creation_date_time: i64,
}
