//! Crash journal for the rename-and-symlink step that moves a subtree
//! into the directory pool. Committed synchronously before the rename;
//! replayed on startup.

use anyhow::Error;
use rusqlite::{params, Connection};

#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub id: i64,
    pub linkname: String,
    pub linktarget: String,
}

pub struct LinkJournalDao<'a> {
    conn: &'a Connection,
}

impl<'a> LinkJournalDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn add_journal_entry(&self, linkname: &str, linktarget: &str) -> Result<i64, Error> {
        self.conn.execute(
            "INSERT INTO directory_link_journal (linkname, linktarget) VALUES (?, ?)",
            params![linkname, linktarget],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn remove_journal_entry(&self, id: i64) -> Result<(), Error> {
        self.conn.execute(
            "DELETE FROM directory_link_journal WHERE id=?",
            params![id],
        )?;
        Ok(())
    }

    pub fn get_journal_entries(&self) -> Result<Vec<JournalEntry>, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, linkname, linktarget FROM directory_link_journal")?;
        let rows = stmt.query_map(params![], |row| {
            Ok(JournalEntry {
                id: row.get(0)?,
                linkname: row.get(1)?,
                linktarget: row.get(2)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn clear_journal(&self) -> Result<(), Error> {
        self.conn
            .execute("DELETE FROM directory_link_journal", params![])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::catalog::test_catalog;

    #[test]
    fn journal_rows_round_trip() {
        let (_dir, catalog) = test_catalog();
        let conn = catalog.connect().unwrap();
        let dao = LinkJournalDao::new(&conn);

        let id = dao.add_journal_entry("/b/c/dir", "/b/c/.directory_pool/ab/abc").unwrap();
        assert_eq!(dao.get_journal_entries().unwrap().len(), 1);

        dao.remove_journal_entry(id).unwrap();
        assert!(dao.get_journal_entries().unwrap().is_empty());

        dao.add_journal_entry("/x", "/y").unwrap();
        dao.add_journal_entry("/z", "/w").unwrap();
        dao.clear_journal().unwrap();
        assert!(dao.get_journal_entries().unwrap().is_empty());
    }
}
