//! Client and backup-row accessors used by the ingest paths and the
//! mount layer.

use anyhow::Error;
use rusqlite::{params, Connection, OptionalExtension};

use crate::tools::epoch_secs;

#[derive(Debug, Clone)]
pub struct ImageRow {
    pub id: i64,
    pub clientid: i64,
    pub letter: String,
    pub path: String,
    pub incremental: i64,
    pub incremental_ref: Option<i64>,
    pub complete: bool,
    pub backuptime: i64,
    pub size_bytes: i64,
    pub mounttime: i64,
}

#[derive(Debug, Clone)]
pub struct MountedImage {
    pub id: i64,
    pub path: String,
    pub mounttime: i64,
}

pub struct BackupDao<'a> {
    conn: &'a Connection,
}

impl<'a> BackupDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn conn(&self) -> &Connection {
        self.conn
    }

    pub fn get_client_id(&self, name: &str) -> Result<Option<i64>, Error> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM clients WHERE name=?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn get_or_create_client(&self, name: &str) -> Result<i64, Error> {
        if let Some(id) = self.get_client_id(name)? {
            return Ok(id);
        }
        self.conn.execute(
            "INSERT INTO clients (name, created) VALUES (?, ?)",
            params![name, epoch_secs()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_client_delete_pending(&self, clientid: i64, pending: bool) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE clients SET delete_pending=? WHERE id=?",
            params![pending as i64, clientid],
        )?;
        Ok(())
    }

    pub fn create_image_backup(
        &self,
        clientid: i64,
        letter: &str,
        path: &str,
        incremental: i64,
        incremental_ref: Option<i64>,
    ) -> Result<i64, Error> {
        let now = epoch_secs();
        self.conn.execute(
            "INSERT INTO backup_images
                 (clientid, letter, path, incremental, incremental_ref, complete, backuptime, running)
                 VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
            params![clientid, letter, path, incremental, incremental_ref, now, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Heartbeat for an in-flight transfer; incomplete images with a
    /// stale heartbeat are fair game for the cleanup sweep.
    pub fn update_image_running(&self, backupid: i64) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE backup_images SET running=? WHERE id=?",
            params![epoch_secs(), backupid],
        )?;
        Ok(())
    }

    /// Record size and completion in one transaction, and refresh the
    /// client's aggregate image usage.
    pub fn finish_image_backup(&self, backupid: i64, size_bytes: i64) -> Result<(), Error> {
        self.conn.execute_batch("BEGIN")?;
        let result = (|| -> Result<(), Error> {
            self.conn.execute(
                "UPDATE backup_images SET size_bytes=?, complete=1 WHERE id=?",
                params![size_bytes, backupid],
            )?;
            self.conn.execute(
                "UPDATE clients SET lastbackup_image=?, bytes_used_images=
                     (SELECT COALESCE(SUM(size_bytes), 0) FROM backup_images
                          WHERE clientid=clients.id AND complete=1)
                 WHERE id=(SELECT clientid FROM backup_images WHERE id=?)",
                params![epoch_secs(), backupid],
            )?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(())
            }
            Err(err) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    }

    pub fn get_image(&self, backupid: i64) -> Result<Option<ImageRow>, Error> {
        let row = self
            .conn
            .query_row(
                "SELECT id, clientid, letter, path, incremental, incremental_ref,
                        complete, backuptime, size_bytes, mounttime
                     FROM backup_images WHERE id=?",
                params![backupid],
                image_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Latest complete image of a volume, used as the parent of the
    /// next incremental.
    pub fn find_last_complete_image(
        &self,
        clientid: i64,
        letter: &str,
    ) -> Result<Option<ImageRow>, Error> {
        let row = self
            .conn
            .query_row(
                "SELECT id, clientid, letter, path, incremental, incremental_ref,
                        complete, backuptime, size_bytes, mounttime
                     FROM backup_images
                     WHERE clientid=? AND letter=? AND complete=1
                     ORDER BY backuptime DESC LIMIT 1",
                params![clientid, letter],
                image_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn add_assoc_image(&self, img_id: i64, assoc_id: i64) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO assoc_images (img_id, assoc_id) VALUES (?, ?)",
            params![img_id, assoc_id],
        )?;
        Ok(())
    }

    pub fn create_file_backup(
        &self,
        clientid: i64,
        path: &str,
        incremental: i64,
    ) -> Result<i64, Error> {
        self.conn.execute(
            "INSERT INTO backups (clientid, path, incremental, complete, backuptime)
                 VALUES (?, ?, ?, 0, ?)",
            params![clientid, path, incremental, epoch_secs()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_file_backup_complete(&self, backupid: i64, size_bytes: i64) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE backups SET complete=1, size_bytes=? WHERE id=?",
            params![size_bytes, backupid],
        )?;
        self.conn.execute(
            "UPDATE clients SET lastbackup=?, bytes_used_files=
                 (SELECT COALESCE(SUM(size_bytes), 0) FROM backups
                      WHERE clientid=clients.id AND complete=1)
             WHERE id=(SELECT clientid FROM backups WHERE id=?)",
            params![epoch_secs(), backupid],
        )?;
        Ok(())
    }

    pub fn get_mounted_image(&self, backupid: i64) -> Result<Option<MountedImage>, Error> {
        let row = self
            .conn
            .query_row(
                "SELECT id, path, mounttime FROM backup_images WHERE id=? AND complete=1",
                params![backupid],
                |row| {
                    Ok(MountedImage {
                        id: row.get(0)?,
                        path: row.get(1)?,
                        mounttime: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn set_image_mounted(&self, backupid: i64) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE backup_images SET mounttime=? WHERE id=?",
            params![epoch_secs(), backupid],
        )?;
        Ok(())
    }

    pub fn set_image_unmounted(&self, backupid: i64) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE backup_images SET mounttime=0 WHERE id=?",
            params![backupid],
        )?;
        Ok(())
    }

    pub fn get_old_mounted_images(&self, older_than_secs: i64) -> Result<Vec<MountedImage>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, path, mounttime FROM backup_images
                 WHERE mounttime != 0 AND mounttime < ?",
        )?;
        let rows = stmt.query_map(params![epoch_secs() - older_than_secs], |row| {
            Ok(MountedImage {
                id: row.get(0)?,
                path: row.get(1)?,
                mounttime: row.get(2)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn add_processes_log(
        &self,
        clientid: i64,
        action: &str,
        details: &str,
        started: i64,
        success: bool,
    ) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO processes_log (clientid, action, details, started, finished, success)
                 VALUES (?, ?, ?, ?, ?, ?)",
            params![clientid, action, details, started, epoch_secs(), success as i64],
        )?;
        Ok(())
    }
}

fn image_row(row: &rusqlite::Row) -> rusqlite::Result<ImageRow> {
    Ok(ImageRow {
        id: row.get(0)?,
        clientid: row.get(1)?,
        letter: row.get(2)?,
        path: row.get(3)?,
        incremental: row.get(4)?,
        incremental_ref: row.get(5)?,
        complete: row.get::<_, i64>(6)? != 0,
        backuptime: row.get(7)?,
        size_bytes: row.get(8)?,
        mounttime: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::catalog::test_catalog;

    #[test]
    fn image_backup_lifecycle() {
        let (_dir, catalog) = test_catalog();
        let conn = catalog.connect().unwrap();
        let dao = BackupDao::new(&conn);

        let clientid = dao.get_or_create_client("workstation1").unwrap();
        assert_eq!(dao.get_or_create_client("workstation1").unwrap(), clientid);

        let full = dao
            .create_image_backup(clientid, "C", "/backups/ws1/Image_C_1/image.vhd", 0, None)
            .unwrap();
        assert!(!dao.get_image(full).unwrap().unwrap().complete);
        assert!(dao.find_last_complete_image(clientid, "C").unwrap().is_none());

        dao.finish_image_backup(full, 1234).unwrap();
        let row = dao.get_image(full).unwrap().unwrap();
        assert!(row.complete);
        assert_eq!(row.size_bytes, 1234);

        let parent = dao.find_last_complete_image(clientid, "C").unwrap().unwrap();
        assert_eq!(parent.id, full);

        let usage: i64 = conn
            .query_row(
                "SELECT bytes_used_images FROM clients WHERE id=?",
                params![clientid],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(usage, 1234);
    }

    #[test]
    fn mount_bookkeeping() {
        let (_dir, catalog) = test_catalog();
        let conn = catalog.connect().unwrap();
        let dao = BackupDao::new(&conn);

        let clientid = dao.get_or_create_client("ws2").unwrap();
        let image = dao
            .create_image_backup(clientid, "C", "/backups/ws2/Image_C_1/image.vhd", 0, None)
            .unwrap();
        // incomplete images are not mountable
        assert!(dao.get_mounted_image(image).unwrap().is_none());

        dao.finish_image_backup(image, 1).unwrap();
        assert_eq!(dao.get_mounted_image(image).unwrap().unwrap().mounttime, 0);

        dao.set_image_mounted(image).unwrap();
        assert!(dao.get_mounted_image(image).unwrap().unwrap().mounttime > 0);
        assert!(dao.get_old_mounted_images(3600).unwrap().is_empty());
        assert_eq!(dao.get_old_mounted_images(-3600).unwrap().len(), 1);

        dao.set_image_unmounted(image).unwrap();
        assert_eq!(dao.get_mounted_image(image).unwrap().unwrap().mounttime, 0);
    }
}
