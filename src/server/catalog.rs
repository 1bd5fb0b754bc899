//! Relational backup catalog.
//!
//! SQLite in WAL mode holds all durable metadata: clients, file and
//! image backups, the file-entry dedup graph, directory-pool link
//! references and their journal, settings, logs and statistics. Every
//! thread opens its own connection; write transactions are short, long
//! scans run on cursors without an open write.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{format_err, Error};
use rusqlite::Connection;

mod backup_dao;
pub use backup_dao::*;

mod cleanup_dao;
pub use cleanup_dao::*;

mod files_dao;
pub use files_dao::*;

mod link_dao;
pub use link_dao::*;

mod link_journal_dao;
pub use link_journal_dao::*;

pub const CATALOG_DB_NAME: &str = "backup_server.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS clients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    created INTEGER NOT NULL,
    lastbackup INTEGER NOT NULL DEFAULT 0,
    lastbackup_image INTEGER NOT NULL DEFAULT 0,
    delete_pending INTEGER NOT NULL DEFAULT 0,
    bytes_used_files INTEGER NOT NULL DEFAULT 0,
    bytes_used_images INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS backups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    clientid INTEGER NOT NULL REFERENCES clients(id),
    path TEXT NOT NULL,
    complete INTEGER NOT NULL DEFAULT 0,
    incremental INTEGER NOT NULL DEFAULT 0,
    backuptime INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS backups_clientid ON backups (clientid);

CREATE TABLE IF NOT EXISTS backup_images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    clientid INTEGER NOT NULL REFERENCES clients(id),
    letter TEXT NOT NULL,
    path TEXT NOT NULL,
    incremental INTEGER NOT NULL DEFAULT 0,
    incremental_ref INTEGER,
    complete INTEGER NOT NULL DEFAULT 0,
    backuptime INTEGER NOT NULL,
    running INTEGER NOT NULL DEFAULT 0,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    mounttime INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS backup_images_clientid ON backup_images (clientid);
CREATE INDEX IF NOT EXISTS backup_images_ref ON backup_images (incremental_ref);

CREATE TABLE IF NOT EXISTS assoc_images (
    img_id INTEGER NOT NULL REFERENCES backup_images(id),
    assoc_id INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS assoc_images_img ON assoc_images (img_id);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    backupid INTEGER NOT NULL,
    clientid INTEGER NOT NULL,
    fullpath TEXT NOT NULL,
    shahash BLOB NOT NULL,
    filesize INTEGER NOT NULL,
    next_entry INTEGER NOT NULL DEFAULT 0,
    prev_entry INTEGER NOT NULL DEFAULT 0,
    pointed_to INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS files_backupid ON files (backupid);
CREATE INDEX IF NOT EXISTS files_hash ON files (shahash, filesize);

CREATE TABLE IF NOT EXISTS directory_links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    clientid INTEGER NOT NULL,
    name TEXT NOT NULL,
    target TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS directory_links_name ON directory_links (clientid, name);
CREATE INDEX IF NOT EXISTS directory_links_target ON directory_links (clientid, target);

CREATE TABLE IF NOT EXISTS directory_link_journal (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    linkname TEXT NOT NULL,
    linktarget TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    clientid INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (key, clientid)
);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    clientid INTEGER NOT NULL DEFAULT 0,
    backupid INTEGER,
    loglevel INTEGER NOT NULL DEFAULT 0,
    logtime INTEGER NOT NULL,
    message TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS del_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    backupid INTEGER NOT NULL,
    clientid INTEGER NOT NULL,
    image INTEGER NOT NULL,
    delsize INTEGER NOT NULL,
    incremental INTEGER NOT NULL DEFAULT 0,
    stoptime INTEGER
);

CREATE TABLE IF NOT EXISTS processes_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    clientid INTEGER NOT NULL,
    action TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT '',
    started INTEGER NOT NULL,
    finished INTEGER NOT NULL,
    success INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created INTEGER NOT NULL,
    clientid INTEGER NOT NULL,
    name TEXT NOT NULL,
    bytes_used_files INTEGER NOT NULL DEFAULT 0,
    bytes_used_images INTEGER NOT NULL DEFAULT 0
);
";

/// Handle to the catalog database; hand out one connection per thread.
#[derive(Clone)]
pub struct Catalog {
    path: PathBuf,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format_err!("unable to create {:?} - {}", parent, err))?;
        }
        let catalog = Self {
            path: path.to_path_buf(),
        };
        let conn = catalog.connect()?;
        conn.execute_batch(SCHEMA)
            .map_err(|err| format_err!("unable to create catalog schema - {}", err))?;
        Ok(catalog)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connect(&self) -> Result<Connection, Error> {
        let conn = Connection::open(&self.path)
            .map_err(|err| format_err!("unable to open catalog {:?} - {}", self.path, err))?;
        conn.busy_timeout(Duration::from_secs(120))?;
        conn.query_row("PRAGMA journal_mode=WAL", rusqlite::params![], |_| Ok(()))?;
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA synchronous=NORMAL;")?;
        Ok(conn)
    }
}

pub fn add_log(
    conn: &Connection,
    clientid: i64,
    backupid: Option<i64>,
    loglevel: i32,
    message: &str,
) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO logs (clientid, backupid, loglevel, logtime, message)
             VALUES (?, ?, ?, ?, ?)",
        rusqlite::params![
            clientid,
            backupid,
            loglevel,
            crate::tools::epoch_secs(),
            message
        ],
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_catalog() -> (tempfile::TempDir, Catalog) {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Catalog::open(&dir.path().join(CATALOG_DB_NAME)).unwrap();
    (dir, catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_and_reopens() {
        let (_dir, catalog) = test_catalog();
        let conn = catalog.connect().unwrap();
        add_log(&conn, 0, None, 0, "startup").unwrap();

        // reopening does not clobber data
        let catalog2 = Catalog::open(catalog.path()).unwrap();
        let conn2 = catalog2.connect().unwrap();
        let count: i64 = conn2
            .query_row("SELECT count(*) FROM logs", rusqlite::params![], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
