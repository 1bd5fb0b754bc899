//! Queries the cleanup & quota controller runs against the catalog.

use anyhow::Error;
use rusqlite::{params, Connection, OptionalExtension};

use crate::tools::epoch_secs;

/// Incomplete transfers younger than this are considered in flight and
/// are skipped by the sweep.
const RUNNING_GRACE_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ImageBackupInfo {
    pub id: i64,
    pub backuptime: i64,
    pub path: String,
    pub letter: String,
}

#[derive(Debug, Clone)]
pub struct ImageLetter {
    pub id: i64,
    pub letter: String,
}

#[derive(Debug, Clone)]
pub struct ImageRef {
    pub id: i64,
    pub complete: bool,
}

#[derive(Debug, Clone)]
pub struct IncompleteImage {
    pub id: i64,
    pub path: String,
    pub clientid: i64,
    pub clientname: String,
}

#[derive(Debug, Clone)]
pub struct FileBackupInfo {
    pub id: i64,
    pub clientid: i64,
    pub backuptime: i64,
    pub path: String,
}

pub struct CleanupDao<'a> {
    conn: &'a Connection,
}

impl<'a> CleanupDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn conn(&self) -> &Connection {
        self.conn
    }

    pub fn get_clients(&self) -> Result<Vec<ClientInfo>, Error> {
        self.client_query("SELECT id, name FROM clients")
    }

    pub fn get_delete_pending_clients(&self) -> Result<Vec<ClientInfo>, Error> {
        self.client_query("SELECT id, name FROM clients WHERE delete_pending=1")
    }

    fn client_query(&self, sql: &str) -> Result<Vec<ClientInfo>, Error> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![], |row| {
            Ok(ClientInfo {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        let mut clients = Vec::new();
        for row in rows {
            clients.push(row?);
        }
        Ok(clients)
    }

    pub fn get_client_name(&self, clientid: i64) -> Result<Option<String>, Error> {
        let name = self
            .conn
            .query_row(
                "SELECT name FROM clients WHERE id=?",
                params![clientid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    /// Clients in descending order of file-backup storage use.
    pub fn get_clients_sort_filebackups(&self) -> Result<Vec<i64>, Error> {
        self.id_query("SELECT id FROM clients ORDER BY bytes_used_files DESC")
    }

    /// Clients in descending order of image storage use.
    pub fn get_clients_sort_imagebackups(&self) -> Result<Vec<i64>, Error> {
        self.id_query("SELECT id FROM clients ORDER BY bytes_used_images DESC")
    }

    fn id_query(&self, sql: &str) -> Result<Vec<i64>, Error> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn get_incomplete_images(&self) -> Result<Vec<IncompleteImage>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT b.id, b.path, b.clientid, c.name
                 FROM backup_images b JOIN clients c ON b.clientid = c.id
                 WHERE b.complete=0 AND b.running < ?",
        )?;
        let rows = stmt.query_map(params![epoch_secs() - RUNNING_GRACE_SECS], |row| {
            Ok(IncompleteImage {
                id: row.get(0)?,
                path: row.get(1)?,
                clientid: row.get(2)?,
                clientname: row.get(3)?,
            })
        })?;
        let mut images = Vec::new();
        for row in rows {
            images.push(row?);
        }
        Ok(images)
    }

    /// Complete full images of one client, oldest first.
    pub fn get_full_num_images(&self, clientid: i64) -> Result<Vec<ImageLetter>, Error> {
        self.image_letter_query(clientid, 0)
    }

    /// Complete incremental images of one client, oldest first.
    pub fn get_incr_num_images(&self, clientid: i64) -> Result<Vec<ImageLetter>, Error> {
        self.image_letter_query(clientid, 1)
    }

    fn image_letter_query(&self, clientid: i64, incremental: i64) -> Result<Vec<ImageLetter>, Error> {
        let sql = if incremental == 0 {
            "SELECT id, letter FROM backup_images
                 WHERE clientid=? AND complete=1 AND incremental=0
                 ORDER BY backuptime ASC"
        } else {
            "SELECT id, letter FROM backup_images
                 WHERE clientid=? AND complete=1 AND incremental<>0
                 ORDER BY backuptime ASC"
        };
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![clientid], |row| {
            Ok(ImageLetter {
                id: row.get(0)?,
                letter: row.get(1)?,
            })
        })?;
        let mut images = Vec::new();
        for row in rows {
            images.push(row?);
        }
        Ok(images)
    }

    /// Children referencing `backupid` as their parent.
    pub fn get_image_refs(&self, backupid: i64) -> Result<Vec<ImageRef>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, complete FROM backup_images WHERE incremental_ref=?",
        )?;
        let rows = stmt.query_map(params![backupid], |row| {
            Ok(ImageRef {
                id: row.get(0)?,
                complete: row.get::<_, i64>(1)? != 0,
            })
        })?;
        let mut refs = Vec::new();
        for row in rows {
            refs.push(row?);
        }
        Ok(refs)
    }

    /// Complete incremental siblings sharing this image's parent.
    pub fn get_incr_num_images_for_backup(&self, backupid: i64) -> Result<i64, Error> {
        let count = self.conn.query_row(
            "SELECT count(*) FROM backup_images
                 WHERE complete=1 AND incremental<>0 AND incremental_ref=
                     (SELECT incremental_ref FROM backup_images WHERE id=?)",
            params![backupid],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn get_image_path(&self, backupid: i64) -> Result<Option<String>, Error> {
        let path = self
            .conn
            .query_row(
                "SELECT path FROM backup_images WHERE id=?",
                params![backupid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path)
    }

    pub fn get_image_clientname(&self, backupid: i64) -> Result<Option<String>, Error> {
        let name = self
            .conn
            .query_row(
                "SELECT c.name FROM backup_images b JOIN clients c ON b.clientid=c.id
                     WHERE b.id=?",
                params![backupid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    pub fn get_image_clientid(&self, backupid: i64) -> Result<Option<i64>, Error> {
        let id = self
            .conn
            .query_row(
                "SELECT clientid FROM backup_images WHERE id=?",
                params![backupid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn get_image_backup_info(&self, backupid: i64) -> Result<Option<ImageBackupInfo>, Error> {
        let info = self
            .conn
            .query_row(
                "SELECT id, backuptime, path, letter FROM backup_images WHERE id=?",
                params![backupid],
                image_info,
            )
            .optional()?;
        Ok(info)
    }

    pub fn get_image_size(&self, backupid: i64) -> Result<Option<i64>, Error> {
        let size = self
            .conn
            .query_row(
                "SELECT size_bytes FROM backup_images WHERE id=?",
                params![backupid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(size)
    }

    pub fn remove_image(&self, backupid: i64) -> Result<(), Error> {
        self.conn.execute(
            "DELETE FROM assoc_images WHERE img_id=? OR assoc_id=?",
            params![backupid, backupid],
        )?;
        self.conn.execute(
            "DELETE FROM backup_images WHERE id=?",
            params![backupid],
        )?;
        Ok(())
    }

    pub fn get_assoc_image_backups(&self, img_id: i64) -> Result<Vec<i64>, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT assoc_id FROM assoc_images WHERE img_id=?")?;
        let rows = stmt.query_map(params![img_id], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Whether another image claims this one as an associated system
    /// image (SYSVOL / ESP captured alongside the volume image).
    pub fn image_has_assoc_parent(&self, backupid: i64) -> Result<bool, Error> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM assoc_images WHERE assoc_id=?",
            params![backupid],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_image_backups_of_client(&self, clientid: i64) -> Result<Vec<ImageBackupInfo>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, backuptime, path, letter FROM backup_images WHERE clientid=?",
        )?;
        let rows = stmt.query_map(params![clientid], image_info)?;
        let mut images = Vec::new();
        for row in rows {
            images.push(row?);
        }
        Ok(images)
    }

    /// Images older than 24 h, used by the system-image sweep.
    pub fn get_old_image_backups_of_client(
        &self,
        clientid: i64,
    ) -> Result<Vec<ImageBackupInfo>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, backuptime, path, letter FROM backup_images
                 WHERE clientid=? AND backuptime < ?",
        )?;
        let rows = stmt.query_map(params![clientid, epoch_secs() - 24 * 3600], image_info)?;
        let mut images = Vec::new();
        for row in rows {
            images.push(row?);
        }
        Ok(images)
    }

    /// Complete full file backups of one client, oldest first.
    pub fn get_full_num_files(&self, clientid: i64) -> Result<Vec<i64>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id FROM backups WHERE clientid=? AND complete=1 AND incremental=0
                 ORDER BY backuptime ASC",
        )?;
        let rows = stmt.query_map(params![clientid], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Complete incremental file backups of one client, oldest first.
    pub fn get_incr_num_files(&self, clientid: i64) -> Result<Vec<i64>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id FROM backups WHERE clientid=? AND complete=1 AND incremental<>0
                 ORDER BY backuptime ASC",
        )?;
        let rows = stmt.query_map(params![clientid], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn get_file_backup_path(&self, backupid: i64) -> Result<Option<String>, Error> {
        let path = self
            .conn
            .query_row(
                "SELECT path FROM backups WHERE id=?",
                params![backupid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path)
    }

    pub fn get_file_backup_info(&self, backupid: i64) -> Result<Option<FileBackupInfo>, Error> {
        let info = self
            .conn
            .query_row(
                "SELECT id, clientid, backuptime, path FROM backups WHERE id=?",
                params![backupid],
                file_info,
            )
            .optional()?;
        Ok(info)
    }

    pub fn remove_file_backup(&self, backupid: i64) -> Result<(), Error> {
        self.conn
            .execute("DELETE FROM backups WHERE id=?", params![backupid])?;
        Ok(())
    }

    pub fn get_incomplete_file_backups(&self) -> Result<Vec<FileBackupInfo>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, clientid, backuptime, path FROM backups WHERE complete=0",
        )?;
        let rows = stmt.query_map(params![], file_info)?;
        let mut backups = Vec::new();
        for row in rows {
            backups.push(row?);
        }
        Ok(backups)
    }

    pub fn get_file_backups_of_client(&self, clientid: i64) -> Result<Vec<FileBackupInfo>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, clientid, backuptime, path FROM backups WHERE clientid=?",
        )?;
        let rows = stmt.query_map(params![clientid], file_info)?;
        let mut backups = Vec::new();
        for row in rows {
            backups.push(row?);
        }
        Ok(backups)
    }

    pub fn find_file_backup(&self, clientid: i64, path: &str) -> Result<Option<i64>, Error> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM backups WHERE clientid=? AND path=?",
                params![clientid, path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn get_used_storage(&self, clientid: i64) -> Result<Option<i64>, Error> {
        let used = self
            .conn
            .query_row(
                "SELECT bytes_used_files + bytes_used_images FROM clients WHERE id=?",
                params![clientid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(used)
    }

    /// Record the deleted size before the physical delete; finished
    /// afterwards via [`update_del_image_stats`](Self::update_del_image_stats).
    pub fn add_to_image_stats(
        &self,
        clientid: i64,
        backupid: i64,
        delsize: i64,
        incremental: i64,
    ) -> Result<i64, Error> {
        self.conn.execute(
            "INSERT INTO del_stats (backupid, clientid, image, delsize, incremental)
                 VALUES (?, ?, 1, ?, ?)",
            params![backupid, clientid, delsize, incremental],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_del_image_stats(&self, rowid: i64) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE del_stats SET stoptime=? WHERE id=?",
            params![epoch_secs(), rowid],
        )?;
        Ok(())
    }

    pub fn remove_client(&self, clientid: i64) -> Result<(), Error> {
        self.conn.execute(
            "DELETE FROM settings WHERE clientid=?",
            params![clientid],
        )?;
        self.conn
            .execute("DELETE FROM clients WHERE id=?", params![clientid])?;
        Ok(())
    }

    /// Trim logs, process logs and history older than the given ages.
    pub fn cleanup_other(&self, log_days: i64, history_days: i64) -> Result<(), Error> {
        let now = epoch_secs();
        self.conn.execute(
            "DELETE FROM logs WHERE logtime < ?",
            params![now - log_days * 24 * 3600],
        )?;
        self.conn.execute(
            "DELETE FROM processes_log WHERE finished < ?",
            params![now - log_days * 24 * 3600],
        )?;
        self.conn.execute(
            "DELETE FROM history WHERE created < ?",
            params![now - history_days * 24 * 3600],
        )?;
        self.conn.execute(
            "DELETE FROM del_stats WHERE stoptime IS NOT NULL AND stoptime < ?",
            params![now - history_days * 24 * 3600],
        )?;
        Ok(())
    }

    /// Snapshot per-client usage into the history table.
    pub fn write_history(&self) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO history (created, clientid, name, bytes_used_files, bytes_used_images)
                 SELECT ?, id, name, bytes_used_files, bytes_used_images FROM clients",
            params![epoch_secs()],
        )?;
        Ok(())
    }
}

fn image_info(row: &rusqlite::Row) -> rusqlite::Result<ImageBackupInfo> {
    Ok(ImageBackupInfo {
        id: row.get(0)?,
        backuptime: row.get(1)?,
        path: row.get(2)?,
        letter: row.get(3)?,
    })
}

fn file_info(row: &rusqlite::Row) -> rusqlite::Result<FileBackupInfo> {
    Ok(FileBackupInfo {
        id: row.get(0)?,
        clientid: row.get(1)?,
        backuptime: row.get(2)?,
        path: row.get(3)?,
    })
}
