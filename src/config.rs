//! Server settings.
//!
//! Settings live in the catalog `settings` table as key/value rows;
//! `clientid = 0` holds the global configuration and per-client rows
//! override single keys. The retention and quota knobs here are the
//! ones the cleanup controller consults.

use std::path::PathBuf;

use anyhow::{format_err, Error};
use rusqlite::Connection;

use crate::tools::timespan::{self, TimeSpan};

pub const GLOBAL_CLIENTID: i64 = 0;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub backupfolder: PathBuf,

    pub max_file_full: i64,
    pub max_file_incr: i64,
    pub min_file_full: i64,
    pub min_file_incr: i64,

    pub max_image_full: i64,
    pub max_image_incr: i64,
    pub min_image_full: i64,
    pub min_image_incr: i64,

    /// Per-client quota: absolute bytes, a percentage of the backup
    /// volume (`"95%"`), or `-`/empty for none.
    pub client_quota: String,
    /// Global soft quota over the whole backup volume, same grammar.
    pub global_soft_fs_quota: String,

    pub backup_database: bool,
    pub update_stats_interruptible: bool,
    pub image_compress: bool,

    /// Minimum free space required before an image transfer starts.
    pub min_free_space: i64,

    pub cleanup_window: Vec<TimeSpan>,

    pub mount_ttl_secs: i64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            backupfolder: PathBuf::from("/var/blockbackup"),
            max_file_full: 10,
            max_file_incr: 100,
            min_file_full: 2,
            min_file_incr: 40,
            max_image_full: 5,
            max_image_incr: 30,
            min_image_full: 2,
            min_image_incr: 4,
            client_quota: String::new(),
            global_soft_fs_quota: String::new(),
            backup_database: true,
            update_stats_interruptible: false,
            image_compress: true,
            min_free_space: 1000 * 1024 * 1024,
            cleanup_window: Vec::new(),
            mount_ttl_secs: 5 * 60,
        }
    }
}

impl ServerSettings {
    /// Load the global settings, then apply the per-client overrides.
    pub fn load(conn: &Connection, clientid: i64) -> Result<Self, Error> {
        let mut settings = Self::default();
        settings.apply_rows(conn, GLOBAL_CLIENTID)?;
        if clientid != GLOBAL_CLIENTID {
            settings.apply_rows(conn, clientid)?;
        }
        Ok(settings)
    }

    fn apply_rows(&mut self, conn: &Connection, clientid: i64) -> Result<(), Error> {
        let mut stmt = conn.prepare_cached("SELECT key, value FROM settings WHERE clientid=?")?;
        let mut rows = stmt.query(rusqlite::params![clientid])?;
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let value: String = row.get(1)?;
            self.apply(&key, &value)?;
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), Error> {
        let int = || -> Result<i64, Error> {
            value
                .trim()
                .parse()
                .map_err(|_| format_err!("setting '{}' has non-numeric value '{}'", key, value))
        };
        let flag = || value.trim() == "true" || value.trim() == "1";

        match key {
            "backupfolder" => self.backupfolder = PathBuf::from(value),
            "max_file_full" => self.max_file_full = int()?,
            "max_file_incr" => self.max_file_incr = int()?,
            "min_file_full" => self.min_file_full = int()?,
            "min_file_incr" => self.min_file_incr = int()?,
            "max_image_full" => self.max_image_full = int()?,
            "max_image_incr" => self.max_image_incr = int()?,
            "min_image_full" => self.min_image_full = int()?,
            "min_image_incr" => self.min_image_incr = int()?,
            "client_quota" => self.client_quota = value.trim().to_string(),
            "global_soft_fs_quota" => self.global_soft_fs_quota = value.trim().to_string(),
            "backup_database" => self.backup_database = flag(),
            "update_stats_interruptible" => self.update_stats_interruptible = flag(),
            "image_compress" => self.image_compress = flag(),
            "min_free_space" => self.min_free_space = int()?,
            "mount_ttl_secs" => self.mount_ttl_secs = int()?,
            "cleanup_window" => self.cleanup_window = timespan::parse_window(value)?,
            _ => log::debug!("ignoring unknown setting '{}'", key),
        }
        Ok(())
    }

    pub fn set(conn: &Connection, clientid: i64, key: &str, value: &str) -> Result<(), Error> {
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, clientid) VALUES (?, ?, ?)",
            rusqlite::params![key, value, clientid],
        )?;
        Ok(())
    }
}

/// Resolve a quota string against the total size of the backup volume.
///
/// Returns `None` when no quota is configured (`""`, `"-"` or `"100%"`).
pub fn cleanup_amount(quota: &str, total_space: i64) -> Option<i64> {
    let quota = quota.trim();
    if quota.is_empty() || quota == "-" || quota == "100%" {
        return None;
    }
    if let Some(percent) = quota.strip_suffix('%') {
        let percent: f64 = percent.trim().parse().ok()?;
        if !(0.0..=100.0).contains(&percent) {
            return None;
        }
        return Some((total_space as f64 * percent / 100.0) as i64);
    }
    quota.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE settings (key TEXT, value TEXT, clientid INTEGER,
                 PRIMARY KEY (key, clientid))",
        )
        .unwrap();
        conn
    }

    #[test]
    fn per_client_override_wins() {
        let conn = test_conn();
        ServerSettings::set(&conn, 0, "max_image_full", "7").unwrap();
        ServerSettings::set(&conn, 0, "min_image_incr", "2").unwrap();
        ServerSettings::set(&conn, 3, "max_image_full", "1").unwrap();

        let global = ServerSettings::load(&conn, 0).unwrap();
        assert_eq!(global.max_image_full, 7);

        let client = ServerSettings::load(&conn, 3).unwrap();
        assert_eq!(client.max_image_full, 1);
        assert_eq!(client.min_image_incr, 2);
    }

    #[test]
    fn quota_amounts() {
        assert_eq!(cleanup_amount("", 1000), None);
        assert_eq!(cleanup_amount("-", 1000), None);
        assert_eq!(cleanup_amount("100%", 1000), None);
        assert_eq!(cleanup_amount("95%", 1000), Some(950));
        assert_eq!(cleanup_amount("12345", 1000), Some(12345));
        assert_eq!(cleanup_amount("garbage", 1000), None);
    }
}
