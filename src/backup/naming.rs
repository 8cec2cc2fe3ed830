// Artifact file names

use crate::codec::SEALED_SUFFIX;
use crate::ledger::BackupType;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// `<type>[_<tenant>]_<YYYYMMDDTHHMMSSZ>_<id8>.dump.gz.enc`
pub fn backup_filename(
    backup_type: BackupType,
    tenant_id: Option<Uuid>,
    backup_id: Uuid,
    at: DateTime<Utc>,
) -> String {
    let mut name = backup_type.as_str().to_lowercase();
    if let Some(tenant_id) = tenant_id {
        name.push('_');
        name.push_str(&tenant_id.simple().to_string());
    }
    let short_id = backup_id.simple().to_string();
    format!(
        "{}_{}_{}.dump{}",
        name,
        at.format("%Y%m%dT%H%M%SZ"),
        &short_id[..8],
        SEALED_SUFFIX
    )
}

/// Name of the plaintext dump that seals into `filename`
pub fn dump_filename(filename: &str) -> String {
    filename
        .strip_suffix(SEALED_SUFFIX)
        .unwrap_or(filename)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_filename_layout() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 2, 30, 5).unwrap();
        let id = Uuid::parse_str("0a1b2c3d-0000-0000-0000-000000000000").unwrap();

        assert_eq!(
            backup_filename(BackupType::FullDatabase, None, id, at),
            "full_database_20260301T023005Z_0a1b2c3d.dump.gz.enc"
        );

        let tenant = Uuid::nil();
        assert_eq!(
            backup_filename(BackupType::TenantBackup, Some(tenant), id, at),
            "tenant_backup_00000000000000000000000000000000_20260301T023005Z_0a1b2c3d.dump.gz.enc"
        );
    }

    #[test]
    fn test_dump_filename_strips_sealing_suffix() {
        assert_eq!(dump_filename("wal_archive_20260301T023005Z_0a1b2c3d.dump.gz.enc"), "wal_archive_20260301T023005Z_0a1b2c3d.dump");
    }
}
