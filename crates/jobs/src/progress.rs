// crates/jobs/src/progress.rs
//! Mapping of backup-script output lines to log severity and progress.

use crate::types::LogLevel;

/// Ordered keyword → percentage milestones emitted by the backup script.
///
/// Scanned top to bottom and the first case-insensitive substring hit wins,
/// so an earlier, shorter keyword shadows any later one it overlaps with.
pub const MILESTONES: &[(&str, u8)] = &[
    ("Logging out", 25),
    ("Checking for required dependencies", 30),
    ("Validating environment", 35),
    ("Configuring Bitwarden server", 40),
    ("Logging into Bitwarden", 45),
    ("Unlocking vault", 50),
    ("Exporting vault data", 55),
    ("Syncing vault data", 60),
    ("Performing secure compression", 65),
    ("Validating the encrypted backup", 70),
    ("Checking for changes", 75),
    ("Uploading backup", 80),
    ("Pruning old backups", 90),
    ("completed successfully", 100),
];

/// Severity of a script output line: `ERROR`, then `WARN`, then `SUCCESS`,
/// matched case-sensitively anywhere in the line. Anything else is INFO.
pub fn classify_line(line: &str) -> LogLevel {
    if line.contains("ERROR") {
        LogLevel::Error
    } else if line.contains("WARN") {
        LogLevel::Warn
    } else if line.contains("SUCCESS") {
        LogLevel::Success
    } else {
        LogLevel::Info
    }
}

/// First milestone whose keyword occurs in `line`, ignoring case.
pub fn match_milestone(line: &str) -> Option<(&'static str, u8)> {
    let haystack = line.to_lowercase();
    MILESTONES
        .iter()
        .find(|(keyword, _)| haystack.contains(&keyword.to_lowercase()))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_line() {
        assert_eq!(classify_line("[ERROR] upload failed"), LogLevel::Error);
        assert_eq!(classify_line("WARNING: low disk"), LogLevel::Warn);
        assert_eq!(classify_line("[SUCCESS] done"), LogLevel::Success);
        assert_eq!(classify_line("Uploading backup to gdrive"), LogLevel::Info);
        // Case-sensitive tokens.
        assert_eq!(classify_line("error: lowercase is plain info"), LogLevel::Info);
    }

    #[test]
    fn test_classify_line_first_match_wins() {
        assert_eq!(classify_line("[WARN] retry after ERROR"), LogLevel::Error);
        assert_eq!(classify_line("[SUCCESS] with WARN"), LogLevel::Warn);
    }

    #[test]
    fn test_unlocking_vault_is_fifty() {
        assert_eq!(match_milestone("[INFO] Unlocking vault..."), Some(("Unlocking vault", 50)));
    }

    #[test]
    fn test_match_is_case_insensitive() {
        assert_eq!(match_milestone("UPLOADING BACKUP to s3"), Some(("Uploading backup", 80)));
        assert_eq!(
            match_milestone("Backup Completed Successfully"),
            Some(("completed successfully", 100))
        );
    }

    #[test]
    fn test_earlier_keyword_shadows_later() {
        // "Logging out" sits above "Logging into Bitwarden" and wins on overlap.
        assert_eq!(
            match_milestone("Logging out of Bitwarden, then Logging into Bitwarden"),
            Some(("Logging out", 25))
        );
        assert_eq!(
            match_milestone("Checking for changes after Uploading backup"),
            Some(("Checking for changes", 75))
        );
    }

    #[test]
    fn test_no_match() {
        assert_eq!(match_milestone("rclone: Transferred 3 files"), None);
    }

    #[test]
    fn test_milestones_are_ordered_by_progress() {
        assert!(MILESTONES.windows(2).all(|w| w[0].1 < w[1].1));
    }
}
