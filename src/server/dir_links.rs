//! Content-addressed directory pool.
//!
//! Repeated captures of an unchanged subtree share bytes on disk: the
//! first capture is renamed into the per-client pool under
//! `.directory_pool/<XX>/<name>/` and replaced by a symlink, later
//! captures only add symlinks. The catalog's `directory_links` rows are
//! an exact refcount of the symlinks pointing at each pool entry; the
//! rename-and-symlink step is guarded by a journal row committed before
//! the rename and replayed on startup.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{format_err, Error};
use log::{debug, error, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::Connection;
use thiserror::Error as ThisError;

use super::catalog::{LinkDao, LinkJournalDao};
use crate::tools;

pub const DIRECTORY_POOL_NAME: &str = ".directory_pool";

#[derive(Debug, ThisError)]
pub enum DirLinkError {
    #[error("source directory {0:?} does not exist")]
    SourceMissing(PathBuf),
    #[error(transparent)]
    Other(#[from] Error),
}

/// Pool root of one client.
pub fn pool_root(backupfolder: &Path, clientname: &str) -> PathBuf {
    backupfolder.join(clientname).join(DIRECTORY_POOL_NAME)
}

/// Full path of a pool entry, sharded by the two-character prefix.
pub fn pool_entry_path(pool_root: &Path, pool_name: &str) -> PathBuf {
    let shard = pool_name.get(0..2).unwrap_or(pool_name);
    pool_root.join(shard).join(pool_name)
}

fn generate_pool_name() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("{}{}{}", token, tools::epoch_secs(), tools::epoch_millis() % 1000)
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Whether `path` is a symlink into some directory pool.
pub fn is_directory_link(path: &Path) -> bool {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return false,
    };
    if !meta.file_type().is_symlink() {
        return false;
    }
    let target = match std::fs::read_link(path) {
        Ok(target) => target,
        Err(_) => return false,
    };
    target
        .parent()
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .map(|name| name == DIRECTORY_POOL_NAME)
        .unwrap_or(false)
}

/// Serializes journal writes and the renames they cover.
pub struct DirectoryPool {
    journal_mutex: Mutex<()>,
}

impl DirectoryPool {
    pub fn new() -> Self {
        Self {
            journal_mutex: Mutex::new(()),
        }
    }

    /// Register the sub-tree links below `src` for a second referrer.
    fn reference_all_sublinks(
        &self,
        link_dao: &LinkDao,
        clientid: i64,
        src: &Path,
        new_target: &Path,
    ) -> Result<(), Error> {
        let src_prefix = format!("{}/", path_str(src));
        for entry in link_dao.get_links_in_directory(clientid, &src_prefix)? {
            let subpath = entry.target[path_str(src).len()..].to_string();
            let new_link_path = format!("{}{}", path_str(new_target), subpath);
            link_dao.add_directory_link(clientid, &entry.name, &new_link_path)?;
        }
        Ok(())
    }

    /// Materialize `target_dir` as a symlink into the pool, entering
    /// `src_dir` into the pool first if it is still a real directory.
    pub fn link_directory_pool(
        &self,
        conn: &Connection,
        clientid: i64,
        target_dir: &Path,
        src_dir: &Path,
        pool_root: &Path,
    ) -> Result<(), DirLinkError> {
        let link_dao = LinkDao::new(conn);
        let journal_dao = LinkJournalDao::new(conn);

        let _guard = self.journal_mutex.lock().unwrap();

        let src_meta = std::fs::symlink_metadata(src_dir).ok();

        let (pool_path, refcount_bigger_one) = if src_meta
            .as_ref()
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false)
        {
            let pool_path = std::fs::read_link(src_dir)
                .map_err(|err| format_err!("unable to read symlink {:?} - {}", src_dir, err))?;
            let pool_name = tools::file_name_string(&pool_path)
                .ok_or_else(|| format_err!("no pool name in link target {:?}", pool_path))?;

            link_dao
                .add_directory_link(clientid, &pool_name, &path_str(target_dir))
                .map_err(DirLinkError::Other)?;
            self.reference_all_sublinks(&link_dao, clientid, src_dir, target_dir)?;
            (pool_path, true)
        } else if src_meta.as_ref().map(|meta| meta.is_dir()).unwrap_or(false) {
            let (pool_name, pool_path) = loop {
                let pool_name = generate_pool_name();
                let pool_path = pool_entry_path(pool_root, &pool_name);
                if !pool_path.exists() {
                    break (pool_name, pool_path);
                }
            };
            let shard_dir = tools::parent_path(&pool_path);
            std::fs::create_dir_all(&shard_dir)
                .map_err(|err| format_err!("unable to create pool shard {:?} - {}", shard_dir, err))?;

            link_dao
                .add_directory_link(clientid, &pool_name, &path_str(src_dir))
                .map_err(DirLinkError::Other)?;
            self.reference_all_sublinks(&link_dao, clientid, src_dir, target_dir)?;
            link_dao
                .add_directory_link(clientid, &pool_name, &path_str(target_dir))
                .map_err(DirLinkError::Other)?;

            // journal row lands on disk before the non-atomic
            // rename-and-symlink sequence it repairs
            let journal_id = journal_dao
                .add_journal_entry(&path_str(src_dir), &path_str(pool_path.as_path()))
                .map_err(DirLinkError::Other)?;

            if let Err(err) = std::fs::rename(src_dir, &pool_path) {
                error!(
                    "unable to move {:?} into the directory pool at {:?} - {}",
                    src_dir, pool_path, err
                );
                link_dao.remove_directory_link(clientid, &path_str(src_dir))?;
                link_dao.remove_directory_link(clientid, &path_str(target_dir))?;
                journal_dao.remove_journal_entry(journal_id)?;
                return Err(DirLinkError::Other(err.into()));
            }

            if let Err(err) = std::os::unix::fs::symlink(&pool_path, src_dir) {
                error!(
                    "unable to create pool symlink at {:?} to {:?} - {}",
                    src_dir, pool_path, err
                );
                let _ = std::fs::rename(&pool_path, src_dir);
                link_dao.remove_directory_link(clientid, &path_str(src_dir))?;
                link_dao.remove_directory_link(clientid, &path_str(target_dir))?;
                journal_dao.remove_journal_entry(journal_id)?;
                return Err(DirLinkError::Other(err.into()));
            }

            journal_dao
                .remove_journal_entry(journal_id)
                .map_err(DirLinkError::Other)?;
            (pool_path, false)
        } else {
            debug!(
                "cannot link {:?}, source directory {:?} does not exist",
                target_dir, src_dir
            );
            return Err(DirLinkError::SourceMissing(src_dir.to_path_buf()));
        };

        if let Err(err) = std::os::unix::fs::symlink(&pool_path, target_dir) {
            error!(
                "unable to create symlink at {:?} to {:?} - {}",
                target_dir, pool_path, err
            );
            link_dao.remove_directory_link(clientid, &path_str(target_dir))?;
            if refcount_bigger_one {
                link_dao
                    .remove_directory_link_glob(clientid, &format!("{}/", path_str(target_dir)))?;
            }
            return Err(DirLinkError::Other(err.into()));
        }

        Ok(())
    }

    /// Replay the journal: complete or roll forward every interrupted
    /// rename-and-symlink sequence. Idempotent.
    pub fn replay_journal(&self, conn: &Connection) -> Result<bool, Error> {
        let _guard = self.journal_mutex.lock().unwrap();
        let journal_dao = LinkJournalDao::new(conn);

        let mut had_error = false;
        for entry in journal_dao.get_journal_entries()? {
            let linkname = PathBuf::from(&entry.linkname);
            let linktarget = PathBuf::from(&entry.linktarget);

            let current_target = std::fs::read_link(&linkname).ok();
            if current_target.as_deref() == Some(linktarget.as_path()) {
                continue; // sequence completed before the crash
            }

            if linktarget.is_dir() {
                // rename happened, symlink did not
                if linkname.symlink_metadata().is_ok() {
                    let _ = std::fs::remove_file(&linkname);
                }
                if let Err(err) = std::os::unix::fs::symlink(&linktarget, &linkname) {
                    error!(
                        "journal replay: unable to create link at {:?} to {:?} - {}",
                        linkname, linktarget, err
                    );
                    had_error = true;
                }
            } else if linkname.is_dir() && std::fs::symlink_metadata(&linkname)
                .map(|meta| !meta.file_type().is_symlink())
                .unwrap_or(false)
            {
                // crash before the rename; roll the sequence forward
                let shard_dir = tools::parent_path(&linktarget);
                if let Err(err) = std::fs::create_dir_all(&shard_dir)
                    .map_err(Error::from)
                    .and_then(|_| std::fs::rename(&linkname, &linktarget).map_err(Error::from))
                    .and_then(|_| {
                        std::os::unix::fs::symlink(&linktarget, &linkname).map_err(Error::from)
                    })
                {
                    error!(
                        "journal replay: unable to roll forward {:?} -> {:?} - {}",
                        linkname, linktarget, err
                    );
                    had_error = true;
                }
            } else {
                warn!(
                    "journal replay: neither {:?} nor {:?} usable, dropping entry",
                    linkname, linktarget
                );
            }
        }

        journal_dao.clear_journal()?;
        Ok(!had_error)
    }

    /// Drop one symlink into the pool, decrement its reference and
    /// garbage-collect the pool entry at refcount zero.
    pub fn remove_directory_link(
        &self,
        conn: &Connection,
        clientid: i64,
        path: &Path,
    ) -> Result<(), Error> {
        let link_dao = LinkDao::new(conn);

        let pool_path = std::fs::read_link(path)
            .map_err(|err| format_err!("unable to read pool symlink {:?} - {}", path, err))?;
        let pool_name = tools::file_name_string(&pool_path)
            .ok_or_else(|| format_err!("no pool name in {:?}", pool_path))?;

        let in_pool = pool_path
            .parent()
            .and_then(Path::parent)
            .and_then(Path::file_name)
            .map(|name| name == DIRECTORY_POOL_NAME)
            .unwrap_or(false);
        if !in_pool {
            // some other symlink, nothing to account
            std::fs::remove_file(path)
                .map_err(|err| format_err!("unable to remove symlink {:?} - {}", path, err))?;
            return Ok(());
        }

        let removed = link_dao.remove_directory_link(clientid, &path_str(path))?;
        if removed > 0 {
            if link_dao.get_directory_refcount(clientid, &pool_name)? == 0 {
                self.remove_tree(conn, clientid, &pool_path, true)?;
            } else {
                link_dao.remove_directory_link_glob(clientid, &format!("{}/", path_str(path)))?;
            }
        } else {
            warn!(
                "directory link {:?} (pool path {:?}) not in the catalog, deleting symlink only",
                path, pool_path
            );
        }

        std::fs::remove_file(path)
            .map_err(|err| format_err!("unable to remove symlink {:?} - {}", path, err))?;
        Ok(())
    }

    /// Remove a backup directory tree, treating every contained pool
    /// symlink as a reference decrement.
    pub fn remove_directory_link_dir(
        &self,
        conn: &Connection,
        clientid: i64,
        path: &Path,
    ) -> Result<(), Error> {
        let _guard = self.journal_mutex.lock().unwrap();
        self.remove_tree(conn, clientid, path, true)
    }

    fn remove_tree(
        &self,
        conn: &Connection,
        clientid: i64,
        path: &Path,
        delete_root: bool,
    ) -> Result<(), Error> {
        tools::remove_dir_recursive(
            path,
            &mut |link| self.remove_directory_link(conn, clientid, link),
            false,
        )?;
        if delete_root {
            let meta = std::fs::symlink_metadata(path)?;
            if meta.file_type().is_symlink() {
                std::fs::remove_file(path)?;
            } else {
                std::fs::remove_dir(path)?;
            }
        }
        Ok(())
    }

    /// GC every pool entry of the client whose refcount dropped to 0.
    pub fn cleanup_pool_entries(
        &self,
        conn: &Connection,
        clientid: i64,
        pool_root: &Path,
    ) -> Result<(), Error> {
        if !pool_root.is_dir() {
            return Ok(());
        }
        let link_dao = LinkDao::new(conn);
        for shard in std::fs::read_dir(pool_root)? {
            let shard = shard?.path();
            if !shard.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&shard)? {
                let entry = entry?.path();
                if !entry.is_dir() {
                    continue;
                }
                let pool_name = match tools::file_name_string(&entry) {
                    Some(name) => name,
                    None => continue,
                };
                if link_dao.get_directory_refcount(clientid, &pool_name)? == 0 {
                    info!("refcount of {:?} is zero, deleting pool entry", entry);
                    if let Err(err) = self.remove_tree(conn, clientid, &entry, true) {
                        error!("unable to remove pool entry {:?} - {}", entry, err);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for DirectoryPool {
    fn default() -> Self {
        Self::new()
    }
}
