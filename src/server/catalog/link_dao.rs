//! Directory-pool link references.
//!
//! One row per symbolic link on disk that points into a client's
//! directory pool; the row count per pool name is the entry's refcount.

use anyhow::Error;
use rusqlite::{params, Connection};

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryLinkEntry {
    pub id: i64,
    pub name: String,
    pub target: String,
}

/// Escape `%`, `_` and the escape character for a SQL LIKE pattern.
pub fn escape_like_pattern(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == '%' || ch == '_' || ch == '\\' {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

pub struct LinkDao<'a> {
    conn: &'a Connection,
}

impl<'a> LinkDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn conn(&self) -> &Connection {
        self.conn
    }

    pub fn add_directory_link(
        &self,
        clientid: i64,
        name: &str,
        target: &str,
    ) -> Result<i64, Error> {
        self.conn.execute(
            "INSERT INTO directory_links (clientid, name, target) VALUES (?, ?, ?)",
            params![clientid, name, target],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Remove the reference rows for one link target. Returns the
    /// number of removed rows so callers can detect unknown links.
    pub fn remove_directory_link(&self, clientid: i64, target: &str) -> Result<usize, Error> {
        let changed = self.conn.execute(
            "DELETE FROM directory_links WHERE clientid=? AND target=?",
            params![clientid, target],
        )?;
        Ok(changed)
    }

    /// Remove every reference below a directory prefix.
    pub fn remove_directory_link_glob(
        &self,
        clientid: i64,
        target_prefix: &str,
    ) -> Result<usize, Error> {
        let pattern = format!("{}%", escape_like_pattern(target_prefix));
        let changed = self.conn.execute(
            "DELETE FROM directory_links
                 WHERE clientid=? AND target LIKE ? ESCAPE '\\'",
            params![clientid, pattern],
        )?;
        Ok(changed)
    }

    pub fn get_directory_refcount(&self, clientid: i64, name: &str) -> Result<i64, Error> {
        let count = self.conn.query_row(
            "SELECT count(*) FROM directory_links WHERE clientid=? AND name=?",
            params![clientid, name],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// All references whose target lies below `dir`.
    pub fn get_links_in_directory(
        &self,
        clientid: i64,
        dir: &str,
    ) -> Result<Vec<DirectoryLinkEntry>, Error> {
        let pattern = format!("{}%", escape_like_pattern(dir));
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, name, target FROM directory_links
                 WHERE clientid=? AND target LIKE ? ESCAPE '\\'",
        )?;
        let rows = stmt.query_map(params![clientid, pattern], link_entry)?;
        collect(rows)
    }

    pub fn get_client_links(&self, clientid: i64) -> Result<Vec<DirectoryLinkEntry>, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, name, target FROM directory_links WHERE clientid=?")?;
        let rows = stmt.query_map(params![clientid], link_entry)?;
        collect(rows)
    }

    pub fn delete_link_ref_entry(&self, id: i64) -> Result<(), Error> {
        self.conn
            .execute("DELETE FROM directory_links WHERE id=?", params![id])?;
        Ok(())
    }

    pub fn update_link_ref_target(&self, id: i64, new_target: &str) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE directory_links SET target=? WHERE id=?",
            params![new_target, id],
        )?;
        Ok(())
    }
}

fn link_entry(row: &rusqlite::Row) -> rusqlite::Result<DirectoryLinkEntry> {
    Ok(DirectoryLinkEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        target: row.get(2)?,
    })
}

fn collect(
    rows: rusqlite::MappedRows<impl FnMut(&rusqlite::Row) -> rusqlite::Result<DirectoryLinkEntry>>,
) -> Result<Vec<DirectoryLinkEntry>, Error> {
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::catalog::test_catalog;

    #[test]
    fn refcount_follows_rows() {
        let (_dir, catalog) = test_catalog();
        let conn = catalog.connect().unwrap();
        let dao = LinkDao::new(&conn);

        dao.add_directory_link(1, "pool_a", "/b/1/dir").unwrap();
        dao.add_directory_link(1, "pool_a", "/b/2/dir").unwrap();
        dao.add_directory_link(2, "pool_a", "/b/other").unwrap();

        assert_eq!(dao.get_directory_refcount(1, "pool_a").unwrap(), 2);
        assert_eq!(dao.get_directory_refcount(2, "pool_a").unwrap(), 1);

        assert_eq!(dao.remove_directory_link(1, "/b/1/dir").unwrap(), 1);
        assert_eq!(dao.get_directory_refcount(1, "pool_a").unwrap(), 1);
        assert_eq!(dao.remove_directory_link(1, "/b/1/dir").unwrap(), 0);
    }

    #[test]
    fn glob_removal_only_hits_subtree() {
        let (_dir, catalog) = test_catalog();
        let conn = catalog.connect().unwrap();
        let dao = LinkDao::new(&conn);

        dao.add_directory_link(1, "a", "/b/backup1/sub/x").unwrap();
        dao.add_directory_link(1, "b", "/b/backup1/sub/y").unwrap();
        dao.add_directory_link(1, "c", "/b/backup10/z").unwrap();

        let removed = dao.remove_directory_link_glob(1, "/b/backup1/").unwrap();
        assert_eq!(removed, 2);
        assert_eq!(dao.get_client_links(1).unwrap().len(), 1);
    }

    #[test]
    fn like_escaping_is_literal() {
        let (_dir, catalog) = test_catalog();
        let conn = catalog.connect().unwrap();
        let dao = LinkDao::new(&conn);

        dao.add_directory_link(1, "a", "/b/100%_done/x").unwrap();
        dao.add_directory_link(1, "b", "/b/100Xdone/y").unwrap();

        let found = dao.get_links_in_directory(1, "/b/100%_done/").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].target, "/b/100%_done/x");
    }
}
