//! Remote file naming.
//!
//! Main payloads and attachment archives share a `YYYY-MM-DD` date token.
//! That token is the pairing key for files that predate the explicit
//! `attachments_file_id` link.

use chrono::{DateTime, NaiveDate, Utc};

pub const BACKUP_MIME: &str = "application/octet-stream";
pub const METADATA_MIME: &str = "application/json";

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATE_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupNaming {
    prefix: String,
}

impl BackupNaming {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn main_stem(&self) -> String {
        format!("{}-backup-", self.prefix)
    }

    fn attachments_stem(&self) -> String {
        format!("{}-attachments-", self.prefix)
    }

    /// `<prefix>-backup-<YYYY-MM-DD>.enc`
    pub fn main_file_name(&self, at: DateTime<Utc>) -> String {
        format!("{}{}.enc", self.main_stem(), at.format(DATE_FORMAT))
    }

    /// `<prefix>-attachments-<YYYY-MM-DD>.zip.enc`
    pub fn attachments_file_name(&self, at: DateTime<Utc>) -> String {
        format!("{}{}.zip.enc", self.attachments_stem(), at.format(DATE_FORMAT))
    }

    /// `<prefix>-metadata.json`
    pub fn metadata_file_name(&self) -> String {
        format!("{}-metadata.json", self.prefix)
    }

    pub fn is_main_backup(&self, name: &str) -> bool {
        name.strip_prefix(&self.main_stem())
            .and_then(|rest| rest.strip_suffix(".enc"))
            .map(is_date)
            .unwrap_or(false)
    }

    pub fn is_attachments(&self, name: &str) -> bool {
        name.strip_prefix(&self.attachments_stem())
            .and_then(|rest| rest.strip_suffix(".zip.enc"))
            .map(is_date)
            .unwrap_or(false)
    }

    /// Date token of a main or attachments file name
    pub fn date_token<'a>(&self, name: &'a str) -> Option<&'a str> {
        let rest = name
            .strip_prefix(&self.main_stem())
            .or_else(|| name.strip_prefix(&self.attachments_stem()))?;
        let token = rest.get(..DATE_LEN)?;
        is_date(token).then_some(token)
    }

    /// Attachments file name sharing the main file's date token
    pub fn paired_attachments_name(&self, main_name: &str) -> Option<String> {
        if !self.is_main_backup(main_name) {
            return None;
        }
        let token = self.date_token(main_name)?;
        Some(format!("{}{}.zip.enc", self.attachments_stem(), token))
    }
}

impl Default for BackupNaming {
    fn default() -> Self {
        Self::new("rapport")
    }
}

fn is_date(s: &str) -> bool {
    s.len() == DATE_LEN && NaiveDate::parse_from_str(s, DATE_FORMAT).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 22, 15, 0).unwrap()
    }

    #[test]
    fn test_file_names() {
        let naming = BackupNaming::default();
        assert_eq!(naming.main_file_name(day()), "rapport-backup-2024-03-09.enc");
        assert_eq!(
            naming.attachments_file_name(day()),
            "rapport-attachments-2024-03-09.zip.enc"
        );
        assert_eq!(naming.metadata_file_name(), "rapport-metadata.json");
    }

    #[test]
    fn test_main_backup_detection() {
        let naming = BackupNaming::default();
        assert!(naming.is_main_backup("rapport-backup-2024-03-09.enc"));
        assert!(!naming.is_main_backup("rapport-attachments-2024-03-09.zip.enc"));
        assert!(!naming.is_main_backup("rapport-metadata.json"));
        assert!(!naming.is_main_backup("rapport-backup-latest.enc"));
        assert!(!naming.is_main_backup("other-backup-2024-03-09.enc"));
        assert!(naming.is_attachments("rapport-attachments-2024-03-09.zip.enc"));
    }

    #[test]
    fn test_pairing_by_date_token() {
        let naming = BackupNaming::new("crm");
        let main = naming.main_file_name(day());
        assert_eq!(naming.date_token(&main), Some("2024-03-09"));
        assert_eq!(
            naming.paired_attachments_name(&main).as_deref(),
            Some("crm-attachments-2024-03-09.zip.enc")
        );
        assert_eq!(
            naming.date_token("crm-attachments-2024-03-09.zip.enc"),
            Some("2024-03-09")
        );
        assert_eq!(naming.paired_attachments_name("crm-metadata.json"), None);
    }
}
