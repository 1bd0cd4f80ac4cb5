use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;
use uuid::Uuid;

use crate::model::error::{ErrorKind, ServiceError, ServiceResult};
use crate::model::report::ReportRecord;

const RULE_HEAVY: &str =
    "================================================================================";
const RULE_LIGHT: &str =
    "--------------------------------------------------------------------------------";

/// Append-only archive of user reports, one flat file per submission.
pub struct ReportArchive {
    reports_dir: PathBuf,
    max_report_length: i64,
    max_comment_length: i64,
    submitted: AtomicI64,
}

impl ReportArchive {
    pub fn new(reports_dir: PathBuf, max_report_length: i64, max_comment_length: i64) -> Self {
        Self {
            reports_dir,
            max_report_length,
            max_comment_length,
            submitted: AtomicI64::new(0),
        }
    }

    pub fn submit_report(&self, from: &str, record: &ReportRecord) -> ServiceResult<Uuid> {
        if self.max_report_length >= 0 && record.report.len() as i64 > self.max_report_length {
            return Err(ServiceError::invalid_input(format!(
                "Report length '{}' is bigger than maximum allowed '{}'.",
                record.report.len(),
                self.max_report_length
            )));
        }
        if self.max_comment_length >= 0 && record.comment.len() as i64 > self.max_comment_length {
            return Err(ServiceError::invalid_input(format!(
                "Comment length '{}' is bigger than maximum allowed '{}'.",
                record.comment.len(),
                self.max_comment_length
            )));
        }

        let id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let file_path = self
            .reports_dir
            .join(format!("{}-{}.rpt", file_stamp(now), id));
        info!("writing report file {}", file_path.display());

        let mut file = std::fs::File::create(&file_path).map_err(|err| {
            ServiceError::new(
                ErrorKind::OpenFile,
                format!(
                    "Failed to open report file \"{}\" for writing. {err}.",
                    file_path.display()
                ),
            )
        })?;

        let created = OffsetDateTime::from_unix_timestamp(record.creation_date_time)
            .unwrap_or(now)
            .format(&Rfc3339)
            .unwrap_or_else(|_| record.creation_date_time.to_string());
        let recorded = now.format(&Rfc3339).unwrap_or_default();

        let body = format!(
            "ID: {id}\n\
             FROM: {from}\n\
             CREATED: {created}\n\
             RECORDED: {recorded}\n\
             {RULE_HEAVY}\n\
             \n\
             REPORT BEGIN\n\
             {RULE_LIGHT}\n\
             {report}\n\
             {RULE_LIGHT}\n\
             REPORT END\n\
             \n\
             {RULE_HEAVY}\n\
             \n\
             COMMENT BEGIN\n\
             {RULE_LIGHT}\n\
             {comment}\n\
             {RULE_LIGHT}\n\
             COMMENT END\n",
            report = record.report,
            comment = record.comment,
        );

        file.write_all(body.as_bytes()).map_err(|err| {
            ServiceError::new(
                ErrorKind::WriteFile,
                format!(
                    "Failed to write report file \"{}\". {err}.",
                    file_path.display()
                ),
            )
        })?;

        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    pub fn statistics_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": "reports",
            "reports": self.submitted.load(Ordering::Relaxed),
        })
    }
}

/// `YYYYMMDD-HHMMSS` stamp used in report file names.
fn file_stamp(now: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_is_written_with_fixed_layout() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ReportArchive::new(dir.path().to_path_buf(), 1000, 1000);
        let record = ReportRecord {
            report: "something broke".into(),
            comment: "during upload".into(),
            creation_date_time: 1_700_000_000,
        };
        let id = archive.submit_report("alice@203.0.113.7", &record).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with(&format!("{id}.rpt")), "{name}");

        let contents = std::fs::read_to_string(&entries[0]).unwrap();
        assert!(contents.starts_with(&format!("ID: {id}\nFROM: alice@203.0.113.7\n")));
        assert!(contents.contains("REPORT BEGIN"));
        assert!(contents.contains("something broke"));
        assert!(contents.contains("COMMENT BEGIN"));
        assert!(contents.contains("during upload"));
    }

    #[test]
    fn length_caps_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ReportArchive::new(dir.path().to_path_buf(), 10, 5);
        let too_long = ReportRecord {
            report: "x".repeat(11),
            ..Default::default()
        };
        assert!(archive.submit_report("a@b", &too_long).is_err());

        let long_comment = ReportRecord {
            comment: "y".repeat(6),
            ..Default::default()
        };
        assert!(archive.submit_report("a@b", &long_comment).is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
