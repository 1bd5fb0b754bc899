//! File-entry dedup graph.
//!
//! Entries sharing one content hash form a circular doubly-linked list
//! inside the `files` table; exactly one entry per hash carries
//! `pointed_to` and is the on-disk representative. Batch deletion never
//! rewrites rows per element: neighbour corrections accumulate in an
//! in-memory map that is consulted before every read and flushed in the
//! same transaction that drops the rows. Per-row rewriting corrupts the
//! lists as soon as two neighbours die in the same batch.

use std::collections::HashMap;

use anyhow::Error;
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub id: i64,
    pub backupid: i64,
    pub clientid: i64,
    pub fullpath: String,
    pub shahash: Vec<u8>,
    pub filesize: i64,
    pub next_entry: i64,
    pub prev_entry: i64,
    pub pointed_to: bool,
}

#[derive(Default)]
struct Correction {
    next_entries: HashMap<i64, i64>,
    prev_entries: HashMap<i64, i64>,
    pointed_to: HashMap<i64, i64>,
}

pub struct FilesDao<'a> {
    conn: &'a Connection,
}

impl<'a> FilesDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert a file entry, linking it into the ring of its content
    /// hash. The new entry becomes the representative.
    pub fn add_file_entry(
        &self,
        backupid: i64,
        clientid: i64,
        fullpath: &str,
        shahash: &[u8],
        filesize: i64,
    ) -> Result<i64, Error> {
        let head: Option<(i64, i64)> = self
            .conn
            .query_row(
                "SELECT id, prev_entry FROM files
                     WHERE shahash=? AND filesize=? AND pointed_to=1",
                params![shahash, filesize],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        self.conn.execute(
            "INSERT INTO files
                 (backupid, clientid, fullpath, shahash, filesize,
                  next_entry, prev_entry, pointed_to)
                 VALUES (?, ?, ?, ?, ?, 0, 0, 1)",
            params![backupid, clientid, fullpath, shahash, filesize],
        )?;
        let id = self.conn.last_insert_rowid();

        match head {
            None => {
                // ring of one
                self.conn.execute(
                    "UPDATE files SET next_entry=?, prev_entry=? WHERE id=?",
                    params![id, id, id],
                )?;
            }
            Some((head_id, tail_id)) => {
                self.conn.execute(
                    "UPDATE files SET next_entry=? WHERE id=?",
                    params![id, tail_id],
                )?;
                self.conn.execute(
                    "UPDATE files SET prev_entry=?, pointed_to=0 WHERE id=?",
                    params![id, head_id],
                )?;
                self.conn.execute(
                    "UPDATE files SET next_entry=?, prev_entry=? WHERE id=?",
                    params![head_id, tail_id, id],
                )?;
            }
        }
        Ok(id)
    }

    /// Drop every file entry of one backup in a single transaction,
    /// splicing the survivors' rings through the correction map.
    pub fn remove_backup_files(&self, backupid: i64) -> Result<usize, Error> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match self.remove_backup_files_locked(backupid) {
            Ok(removed) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(removed)
            }
            Err(err) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    }

    fn remove_backup_files_locked(&self, backupid: i64) -> Result<usize, Error> {
        let mut correction = Correction::default();

        let mut stmt = self.conn.prepare_cached(
            "SELECT id, next_entry, prev_entry, pointed_to FROM files WHERE backupid=?",
        )?;
        let mut rows = stmt.query(params![backupid])?;
        let mut removed = 0usize;

        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let mut next: i64 = row.get(1)?;
            let mut prev: i64 = row.get(2)?;
            let mut pointed_to: bool = row.get::<_, i64>(3)? != 0;

            // the batch's view of this row supersedes the database's
            if let Some(corrected) = correction.next_entries.remove(&id) {
                next = corrected;
            }
            if let Some(corrected) = correction.prev_entries.remove(&id) {
                prev = corrected;
            }
            if let Some(corrected) = correction.pointed_to.remove(&id) {
                pointed_to = corrected != 0;
            }

            if next != id {
                correction.next_entries.insert(prev, next);
                correction.prev_entries.insert(next, prev);
                if pointed_to {
                    correction.pointed_to.insert(next, 1);
                }
            }
            removed += 1;
        }
        drop(rows);
        drop(stmt);

        for (id, next) in &correction.next_entries {
            self.conn.execute(
                "UPDATE files SET next_entry=? WHERE id=?",
                params![next, id],
            )?;
        }
        for (id, prev) in &correction.prev_entries {
            self.conn.execute(
                "UPDATE files SET prev_entry=? WHERE id=?",
                params![prev, id],
            )?;
        }
        for (id, pointed_to) in &correction.pointed_to {
            self.conn.execute(
                "UPDATE files SET pointed_to=? WHERE id=?",
                params![pointed_to, id],
            )?;
        }

        self.conn
            .execute("DELETE FROM files WHERE backupid=?", params![backupid])?;

        Ok(removed)
    }

    /// Remove entries whose backup no longer exists in the catalog.
    pub fn remove_dangling_files(&self) -> Result<usize, Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT DISTINCT backupid FROM files
                 WHERE backupid NOT IN (SELECT id FROM backups)",
        )?;
        let dangling: Vec<i64> = stmt
            .query_map(params![], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let mut removed = 0;
        for backupid in dangling {
            removed += self.remove_backup_files(backupid)?;
        }
        Ok(removed)
    }

    pub fn entries_for_hash(&self, shahash: &[u8], filesize: i64) -> Result<Vec<FileEntry>, Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, backupid, clientid, fullpath, shahash, filesize,
                    next_entry, prev_entry, pointed_to
                 FROM files WHERE shahash=? AND filesize=?",
        )?;
        let rows = stmt.query_map(params![shahash, filesize], |row| {
            Ok(FileEntry {
                id: row.get(0)?,
                backupid: row.get(1)?,
                clientid: row.get(2)?,
                fullpath: row.get(3)?,
                shahash: row.get(4)?,
                filesize: row.get(5)?,
                next_entry: row.get(6)?,
                prev_entry: row.get(7)?,
                pointed_to: row.get::<_, i64>(8)? != 0,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn backup_file_count(&self, backupid: i64) -> Result<i64, Error> {
        let count = self.conn.query_row(
            "SELECT count(*) FROM files WHERE backupid=?",
            params![backupid],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

/// Check the ring invariant for one hash class: exactly one
/// representative, and `next`/`prev` describe one closed cycle over all
/// entries. Used by tests and the remove-unknown verification pass.
pub fn verify_hash_ring(entries: &[FileEntry]) -> Result<(), Error> {
    if entries.is_empty() {
        return Ok(());
    }

    let pointed: Vec<&FileEntry> = entries.iter().filter(|entry| entry.pointed_to).collect();
    if pointed.len() != 1 {
        anyhow::bail!("hash class has {} representatives", pointed.len());
    }

    let by_id: HashMap<i64, &FileEntry> = entries.iter().map(|entry| (entry.id, entry)).collect();
    let start = pointed[0].id;
    let mut seen = 0usize;
    let mut current = start;
    loop {
        let entry = by_id
            .get(&current)
            .ok_or_else(|| anyhow::format_err!("ring points at missing entry {}", current))?;
        let next = by_id
            .get(&entry.next_entry)
            .ok_or_else(|| anyhow::format_err!("entry {} has dangling next", current))?;
        if next.prev_entry != current {
            anyhow::bail!("entry {} prev does not match {} next", next.id, current);
        }
        seen += 1;
        if seen > entries.len() {
            anyhow::bail!("ring is longer than the hash class");
        }
        current = entry.next_entry;
        if current == start {
            break;
        }
    }
    if seen != entries.len() {
        anyhow::bail!("ring covers {} of {} entries", seen, entries.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::catalog::test_catalog;

    const HASH_A: &[u8] = &[0xaa; 32];
    const HASH_B: &[u8] = &[0xbb; 32];

    #[test]
    fn insert_builds_valid_rings() {
        let (_dir, catalog) = test_catalog();
        let conn = catalog.connect().unwrap();
        let dao = FilesDao::new(&conn);

        for i in 0..5 {
            dao.add_file_entry(1, 1, &format!("/a/file{}", i), HASH_A, 100)
                .unwrap();
        }
        dao.add_file_entry(1, 1, "/a/other", HASH_B, 200).unwrap();

        let ring = dao.entries_for_hash(HASH_A, 100).unwrap();
        assert_eq!(ring.len(), 5);
        verify_hash_ring(&ring).unwrap();

        let other = dao.entries_for_hash(HASH_B, 200).unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].next_entry, other[0].id);
        assert_eq!(other[0].prev_entry, other[0].id);
        verify_hash_ring(&other).unwrap();
    }

    #[test]
    fn delete_backup_splices_survivors() {
        let (_dir, catalog) = test_catalog();
        let conn = catalog.connect().unwrap();
        let dao = FilesDao::new(&conn);

        // interleaved backups sharing one hash
        for i in 0..10 {
            let backupid = if i % 2 == 0 { 1 } else { 2 };
            dao.add_file_entry(backupid, 1, &format!("/f{}", i), HASH_A, 42)
                .unwrap();
        }

        let removed = dao.remove_backup_files(1).unwrap();
        assert_eq!(removed, 5);

        let ring = dao.entries_for_hash(HASH_A, 42).unwrap();
        assert_eq!(ring.len(), 5);
        assert!(ring.iter().all(|entry| entry.backupid == 2));
        verify_hash_ring(&ring).unwrap();
    }

    #[test]
    fn delete_whole_hash_class() {
        let (_dir, catalog) = test_catalog();
        let conn = catalog.connect().unwrap();
        let dao = FilesDao::new(&conn);

        for i in 0..4 {
            dao.add_file_entry(7, 1, &format!("/x{}", i), HASH_A, 1).unwrap();
        }
        dao.remove_backup_files(7).unwrap();
        assert!(dao.entries_for_hash(HASH_A, 1).unwrap().is_empty());
    }

    #[test]
    fn representative_migrates_on_delete() {
        let (_dir, catalog) = test_catalog();
        let conn = catalog.connect().unwrap();
        let dao = FilesDao::new(&conn);

        dao.add_file_entry(1, 1, "/old", HASH_A, 9).unwrap();
        // newest entry (backup 2) is the representative
        dao.add_file_entry(2, 1, "/new", HASH_A, 9).unwrap();

        dao.remove_backup_files(2).unwrap();
        let ring = dao.entries_for_hash(HASH_A, 9).unwrap();
        assert_eq!(ring.len(), 1);
        assert!(ring[0].pointed_to, "pointed_to migrated to the survivor");
        verify_hash_ring(&ring).unwrap();
    }

    #[test]
    fn bulk_delete_of_large_shared_class() {
        let (_dir, catalog) = test_catalog();
        let conn = catalog.connect().unwrap();
        let dao = FilesDao::new(&conn);

        conn.execute_batch("BEGIN").unwrap();
        for i in 0..10_000 {
            // the newest entry carries pointed_to and sits in backup 2
            let backupid = if i == 9_999 { 2 } else { 1 };
            dao.add_file_entry(backupid, 1, &format!("/bulk/{}", i), HASH_A, 77)
                .unwrap();
        }
        conn.execute_batch("COMMIT").unwrap();

        // deleting the representative's backup leaves 9 999 entries
        let removed = dao.remove_backup_files(2).unwrap();
        assert_eq!(removed, 1);
        let ring = dao.entries_for_hash(HASH_A, 77).unwrap();
        assert_eq!(ring.len(), 9_999);
        verify_hash_ring(&ring).unwrap();

        // and the bulk delete of the rest leaves nothing behind
        let removed = dao.remove_backup_files(1).unwrap();
        assert_eq!(removed, 9_999);
        assert!(dao.entries_for_hash(HASH_A, 77).unwrap().is_empty());
    }

    #[test]
    fn dangling_sweep_respects_rings() {
        let (_dir, catalog) = test_catalog();
        let conn = catalog.connect().unwrap();

        // backup 1 exists in the catalog, backup 99 does not
        conn.execute(
            "INSERT INTO clients (id, name, created) VALUES (1, 'c', 0)",
            params![],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO backups (id, clientid, path, backuptime) VALUES (1, 1, 'b1', 0)",
            params![],
        )
        .unwrap();

        let dao = FilesDao::new(&conn);
        dao.add_file_entry(1, 1, "/keep", HASH_A, 5).unwrap();
        dao.add_file_entry(99, 1, "/gone", HASH_A, 5).unwrap();

        let removed = dao.remove_dangling_files().unwrap();
        assert_eq!(removed, 1);

        let ring = dao.entries_for_hash(HASH_A, 5).unwrap();
        assert_eq!(ring.len(), 1);
        assert_eq!(ring[0].fullpath, "/keep");
        verify_hash_ring(&ring).unwrap();
    }
}
