//! Cleanup & quota controller.
//!
//! Enforces per-client retention counts and quotas, serves explicit
//! "free N bytes" requests, reconciles the catalog against the disk on
//! demand and backs up the catalog database. Image chains are deleted
//! bottom-up: a parent is only removed once every child referencing it
//! could be removed. Per-backup failures are logged and skipped; only a
//! database-level failure aborts a batch.
//!
//! Freed bytes are accounted against an in-memory running total, so a
//! free-space run does not re-query the filesystem after every delete.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Error};
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;

use super::catalog::{add_log, Catalog, CleanupDao, FilesDao, ImageBackupInfo, LinkDao};
use super::dir_links::{pool_root, DirectoryPool};
use super::image_mount::CleanupLocks;
use super::status::{ProcessAction, ScopedProcess, ServerStatus};
use crate::config::{cleanup_amount, ServerSettings};
use crate::tools;

const LOG_RETENTION_DAYS: i64 = 30;
const HISTORY_RETENTION_DAYS: i64 = 365;

const IMAGE_EXTENSIONS: &[&str] = &["vhd", "vhdz", "raw"];

/// Image backup directories as created by the protocol engine,
/// e.g. `Image_C_210407-0301`.
static IMAGE_DIR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Image_").unwrap());

/// Mail hook for operator alerts; wired in at program start.
pub trait AdminNotifier: Send + Sync {
    fn send(&self, subject: &str, body: &str);
}

type SpaceSource = Box<dyn Fn(&Path) -> Result<i64, Error> + Send + Sync>;

pub struct CleanupController {
    catalog: Catalog,
    pool: Arc<DirectoryPool>,
    cleanup_locks: CleanupLocks,
    notifier: Option<Box<dyn AdminNotifier>>,
    /// Process-wide cleanup-active lock; outermost in the lock order.
    active: Mutex<()>,
    free_space_fn: SpaceSource,
}

impl CleanupController {
    pub fn new(
        catalog: Catalog,
        pool: Arc<DirectoryPool>,
        cleanup_locks: CleanupLocks,
        notifier: Option<Box<dyn AdminNotifier>>,
    ) -> Self {
        Self {
            catalog,
            pool,
            cleanup_locks,
            notifier,
            active: Mutex::new(()),
            free_space_fn: Box::new(|path| tools::free_space(path)),
        }
    }

    /// Replace the free-space probe (tests).
    pub fn with_free_space_fn(mut self, free_space_fn: SpaceSource) -> Self {
        self.free_space_fn = free_space_fn;
        self
    }

    pub fn notify_admins(&self, subject: &str, body: &str) {
        if let Some(notifier) = &self.notifier {
            notifier.send(subject, body);
        }
    }

    /// Explicit "free N bytes" request. Returns whether the target was
    /// reached.
    pub fn free_space(&self, minspace: i64) -> Result<bool, Error> {
        let _active = self.active.lock().unwrap();
        let _proc = ScopedProcess::new("", ProcessAction::EmergencyCleanup, String::new());
        ServerStatus::increment_nospc_stalled(1);

        let result = (|| {
            let conn = self.catalog.connect()?;
            let mut task = CleanupTask::new(self, &conn)?;
            task.delete_pending_clients()?;

            info!("space to free: {}", tools::pretty_print_bytes(minspace));
            task.cleanup_images(Some(minspace))?;
            task.cleanup_files(Some(minspace))?;
            task.cleanup_images(None)?;
            task.cleanup_files(None)?;
            task.update_stats()?;

            Ok(task.has_enough_free_space(Some(minspace)))
        })();

        ServerStatus::increment_nospc_stalled(-1);
        match &result {
            Ok(true) => ServerStatus::set_nospc_fatal(false),
            Ok(false) => ServerStatus::set_nospc_fatal(true),
            Err(_) => {}
        }
        result
    }

    /// Nightly batch: retention, tombstones, quotas, statistics, trims.
    pub fn nightly_cleanup(&self) -> Result<(), Error> {
        let _active = self.active.lock().unwrap();
        let _proc = ScopedProcess::new("", ProcessAction::NightlyCleanup, String::new());

        let conn = self.catalog.connect()?;
        let mut task = CleanupTask::new(self, &conn)?;

        task.delete_pending_clients()?;
        task.cleanup_images(None)?;
        task.cleanup_files(None)?;

        // global soft quota over the whole backup volume
        let settings = task.settings.clone();
        if let Ok(total) = tools::total_space(&settings.backupfolder) {
            if let Some(allowed) = cleanup_amount(&settings.global_soft_fs_quota, total) {
                if allowed < total {
                    let minspace = total - allowed;
                    info!(
                        "global quota: space to free: {}",
                        tools::pretty_print_bytes(minspace)
                    );
                    task.cleanup_images(Some(minspace))?;
                    task.cleanup_files(Some(minspace))?;
                }
            }
        }

        task.update_stats()?;
        task.write_history()?;
        task.enforce_quotas()?;
        task.cleanup_other()?;
        Ok(())
    }

    /// Reconcile every on-disk backup against the catalog and repair
    /// the directory-pool bookkeeping. Running it twice in a row makes
    /// no changes on the second run.
    pub fn remove_unknown(&self) -> Result<(), Error> {
        let _active = self.active.lock().unwrap();
        let _proc = ScopedProcess::new("", ProcessAction::RemoveUnknown, String::new());

        let conn = self.catalog.connect()?;
        self.pool.replay_journal(&conn)?;

        let mut task = CleanupTask::new(self, &conn)?;
        task.do_remove_unknown()
    }

    /// Integrity-check and copy the catalog database (and its WAL) to
    /// `<backup_root>/blockbackup/`, with checkpointing paused.
    pub fn backup_database(&self) -> Result<bool, Error> {
        let conn = self.catalog.connect()?;
        let settings = ServerSettings::load(&conn, 0)?;
        if !settings.backup_database {
            return Ok(true);
        }

        {
            let _proc = ScopedProcess::new("", ProcessAction::CheckIntegrity, String::new());
            info!("checking integrity of the catalog database");
            let ok: String =
                conn.query_row("PRAGMA quick_check", rusqlite::params![], |row| row.get(0))?;
            if ok != "ok" {
                error!("database integrity check failed, skipping database backup");
                self.notify_admins(
                    "Database integrity check failed",
                    "The integrity check failed before the database backup. Restore the \
                     catalog from a backup or repair it.",
                );
                return Ok(false);
            }
        }

        let _proc = ScopedProcess::new("", ProcessAction::DatabaseBackup, String::new());
        let bfolder = settings.backupfolder.join("blockbackup");
        std::fs::create_dir_all(&bfolder)
            .map_err(|err| format_err!("unable to create {:?} - {}", bfolder, err))?;

        let db_path = self.catalog.path().to_path_buf();
        let name = tools::file_name_string(&db_path)
            .ok_or_else(|| format_err!("catalog path {:?} has no file name", db_path))?;

        // pause checkpointing and block writers while the files are
        // copied, so db and WAL stay consistent with each other
        conn.query_row(
            "PRAGMA wal_autocheckpoint=0",
            rusqlite::params![],
            |_| Ok(()),
        )?;
        conn.execute_batch("BEGIN IMMEDIATE")?;

        let copy_result = (|| -> Result<(), Error> {
            copy_db_file(&db_path, &bfolder.join(format!("{}~", name)))?;
            let wal_path = PathBuf::from(format!("{}-wal", db_path.display()));
            if wal_path.exists() {
                copy_db_file(&wal_path, &bfolder.join(format!("{}-wal~", name)))?;
            }
            Ok(())
        })();

        let _ = conn.execute_batch("COMMIT");
        let _ = conn.query_row(
            "PRAGMA wal_autocheckpoint=1000",
            rusqlite::params![],
            |_| Ok(()),
        );

        match copy_result {
            Ok(()) => {
                rename_backup_files(&bfolder)?;
                info!("database backup done");
                Ok(true)
            }
            Err(err) => {
                error!("database backup failed - {}", err);
                Ok(false)
            }
        }
    }

    /// Recompute the per-client usage aggregates.
    pub fn refresh_statistics(&self) -> Result<(), Error> {
        let _active = self.active.lock().unwrap();
        let _proc = ScopedProcess::new("", ProcessAction::UpdateStats, String::new());
        let conn = self.catalog.connect()?;
        let task = CleanupTask::new(self, &conn)?;
        task.update_stats()
    }

    pub fn lock_image(&self, backupid: i64) {
        self.cleanup_locks.lock(backupid);
    }

    pub fn unlock_image(&self, backupid: i64) {
        self.cleanup_locks.unlock(backupid);
    }
}

fn copy_db_file(src: &Path, dst: &Path) -> Result<(), Error> {
    std::fs::copy(src, dst)
        .map_err(|err| format_err!("unable to copy {:?} to {:?} - {}", src, dst, err))?;
    let file = std::fs::File::open(dst)?;
    file.sync_all()?;
    Ok(())
}

/// Second phase of the database backup: atomically move the `~` copies
/// over the previous generation.
fn rename_backup_files(bfolder: &Path) -> Result<(), Error> {
    let entries: Vec<PathBuf> = std::fs::read_dir(bfolder)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect();

    for path in entries.iter().filter(|path| {
        path.is_file() && !path.to_string_lossy().ends_with('~')
    }) {
        let _ = std::fs::remove_file(path);
    }

    for path in entries.iter().filter(|path| {
        path.is_file() && path.to_string_lossy().ends_with('~')
    }) {
        let name = path.to_string_lossy();
        let target = PathBuf::from(name.trim_end_matches('~').to_string());
        std::fs::rename(path, &target)
            .map_err(|err| format_err!("unable to rename {:?} to {:?} - {}", path, target, err))?;
    }
    Ok(())
}

/// One cleanup run; holds the per-run error list and space accounting.
struct CleanupTask<'a> {
    ctrl: &'a CleanupController,
    conn: &'a Connection,
    settings: ServerSettings,
    /// Backups that failed to delete in this run; excluded from the
    /// retention counting so the run terminates.
    remove_errors: Vec<i64>,
    /// Free bytes at run start plus bytes freed so far.
    space_base: i64,
    space_freed: i64,
}

impl<'a> CleanupTask<'a> {
    fn new(ctrl: &'a CleanupController, conn: &'a Connection) -> Result<Self, Error> {
        let settings = ServerSettings::load(conn, 0)?;
        let space_base = (ctrl.free_space_fn)(&settings.backupfolder).unwrap_or(0);
        Ok(Self {
            ctrl,
            conn,
            settings,
            remove_errors: Vec::new(),
            space_base,
            space_freed: 0,
        })
    }

    fn cleanup_dao(&self) -> CleanupDao<'a> {
        CleanupDao::new(self.conn)
    }

    fn has_enough_free_space(&self, minspace: Option<i64>) -> bool {
        match minspace {
            Some(minspace) => self.space_base + self.space_freed >= minspace,
            None => false,
        }
    }

    fn account_freed(&mut self, bytes: i64) {
        if bytes > 0 {
            self.space_freed += bytes;
        }
    }

    // ---- images ----------------------------------------------------

    fn cleanup_images(&mut self, minspace: Option<i64>) -> Result<(), Error> {
        let dao = self.cleanup_dao();

        for incomplete in dao.get_incomplete_images()? {
            if self.ctrl.cleanup_locks.is_locked(incomplete.id) {
                continue;
            }
            info!("deleting incomplete image file {:?}", incomplete.path);
            if !self.delete_image_files(&incomplete.clientname, &incomplete.path) {
                warn!("deleting incomplete image {:?} failed", incomplete.path);
            }
            dao.remove_image(incomplete.id)?;
        }

        self.cleanup_all_system_images()?;
        if self.has_enough_free_space(minspace) {
            return Ok(());
        }

        for clientid in dao.get_clients_sort_imagebackups()? {
            let mut imageids = Vec::new();
            if self.cleanup_images_client(clientid, minspace, &mut imageids, false)?
                && minspace.is_some()
            {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Enforce the image retention bound for one client. Returns true
    /// when the space target was reached.
    fn cleanup_images_client(
        &mut self,
        clientid: i64,
        minspace: Option<i64>,
        imageids: &mut Vec<i64>,
        cleanup_only_one: bool,
    ) -> Result<bool, Error> {
        let settings = ServerSettings::load(self.conn, clientid)?;

        let max_image_full = if minspace.is_some() {
            settings.min_image_full
        } else {
            settings.max_image_full
        };

        let mut notit: Vec<i64> = Vec::new();
        loop {
            let (full_num, top) = self.count_images(clientid, false, &notit)?;
            debug!(
                "client {} has {} full image backups, max={}",
                clientid, full_num, max_image_full
            );
            if full_num as i64 <= max_image_full || full_num == 0 {
                break;
            }
            let backupid = match top {
                Some(id) => id,
                None => break,
            };

            self.log_image_delete(clientid, backupid, "full")?;

            if self.ctrl.cleanup_locks.is_locked(backupid) {
                info!("image backup {} is locked for mount", backupid);
                notit.push(backupid);
            } else if self.find_incomplete_image_ref(backupid)? {
                info!("image backup {} has an incomplete dependent image", backupid);
                notit.push(backupid);
            } else if self.remove_image(backupid, true, false, true, true)? {
                imageids.push(backupid);
                if cleanup_only_one {
                    return Ok(true);
                }
            } else {
                notit.push(backupid);
            }

            if self.has_enough_free_space(minspace) {
                return Ok(true);
            }
        }

        notit.clear();

        let max_image_incr = if minspace.is_some() {
            settings.min_image_incr
        } else {
            settings.max_image_incr
        };

        loop {
            let (incr_num, top) = self.count_images(clientid, true, &notit)?;
            debug!(
                "client {} has {} incremental image backups, max={}",
                clientid, incr_num, max_image_incr
            );
            if incr_num as i64 <= max_image_incr || incr_num == 0 {
                break;
            }
            let backupid = match top {
                Some(id) => id,
                None => break,
            };

            self.log_image_delete(clientid, backupid, "incremental")?;

            if self.ctrl.cleanup_locks.is_locked(backupid) {
                info!("image backup {} is locked for mount", backupid);
                notit.push(backupid);
            } else if self.find_incomplete_image_ref(backupid)? {
                info!("image backup {} has an incomplete dependent image", backupid);
                notit.push(backupid);
            } else if self.remove_image(backupid, true, false, true, true)? {
                imageids.push(backupid);
                if cleanup_only_one {
                    return Ok(true);
                }
            } else {
                notit.push(backupid);
            }

            if self.has_enough_free_space(minspace) {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn log_image_delete(&self, clientid: i64, backupid: i64, kind: &str) -> Result<(), Error> {
        let dao = self.cleanup_dao();
        if let (Some(info), Some(clientname)) = (
            dao.get_image_backup_info(backupid)?,
            dao.get_client_name(clientid)?,
        ) {
            info!(
                "deleting {} image backup (id={}, backuptime={}, path={:?}, letter={}) from client \"{}\"",
                kind, info.id, info.backuptime, info.path, info.letter, clientname
            );
        }
        Ok(())
    }

    /// Per-volume image counts: the volume letter with the most images
    /// wins, its oldest image is the removal candidate.
    fn count_images(
        &self,
        clientid: i64,
        incremental: bool,
        notit: &[i64],
    ) -> Result<(usize, Option<i64>), Error> {
        let dao = self.cleanup_dao();
        let images = if incremental {
            dao.get_incr_num_images(clientid)?
        } else {
            dao.get_full_num_images(clientid)?
        };

        let mut by_letter: Vec<(String, Vec<i64>)> = Vec::new();
        for image in images {
            if notit.contains(&image.id) {
                continue;
            }
            match by_letter.iter_mut().find(|(letter, _)| *letter == image.letter) {
                Some((_, ids)) => ids.push(image.id),
                None => by_letter.push((image.letter.clone(), vec![image.id])),
            }
        }

        let mut max_count = 0;
        let mut top = None;
        for (_, ids) in &by_letter {
            if ids.len() > max_count {
                max_count = ids.len();
                top = Some(ids[0]);
            }
        }
        Ok((max_count, top))
    }

    /// How many complete incremental siblings of `backupid` could still
    /// be removed without violating `min_image_incr`.
    fn max_removable_incr_images(&self, backupid: i64) -> Result<i64, Error> {
        let dao = self.cleanup_dao();
        let clientid = dao
            .get_image_clientid(backupid)?
            .ok_or_else(|| format_err!("image backup {} vanished", backupid))?;
        let settings = ServerSettings::load(self.conn, clientid)?;
        let siblings = dao.get_incr_num_images_for_backup(backupid)?;
        Ok((siblings - settings.min_image_incr).max(0))
    }

    fn find_incomplete_image_ref(&self, backupid: i64) -> Result<bool, Error> {
        let dao = self.cleanup_dao();
        for image_ref in dao.get_image_refs(backupid)? {
            if !image_ref.complete || self.find_incomplete_image_ref(image_ref.id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Delete one image backup; with `remove_references`, children are
    /// deleted first (bottom of the chain upwards), with
    /// `remove_associated` the captured SYSVOL/ESP images go with it.
    fn remove_image(
        &mut self,
        backupid: i64,
        update_stat: bool,
        force_remove: bool,
        remove_associated: bool,
        remove_references: bool,
    ) -> Result<bool, Error> {
        let dao = self.cleanup_dao();
        let mut deleted_size = dao.get_image_size(backupid)?.unwrap_or(0);
        let mut all_ok = true;

        if remove_references {
            for image_ref in dao.get_image_refs(backupid)? {
                if self.max_removable_incr_images(image_ref.id)? <= 0 {
                    info!(
                        "cannot delete image backup {}: referencing incremental images may not be removed",
                        backupid
                    );
                    return Ok(false);
                }
                if !self.remove_image(
                    image_ref.id,
                    true,
                    force_remove,
                    remove_associated,
                    remove_references,
                )? {
                    all_ok = false;
                }
            }
        } else if !force_remove && !dao.get_image_refs(backupid)?.is_empty() {
            info!(
                "cannot delete image backup {}: incremental images referencing it exist",
                backupid
            );
            return Ok(false);
        }

        if remove_associated {
            for assoc in dao.get_assoc_image_backups(backupid)? {
                if let Some(size) = dao.get_image_size(assoc)? {
                    deleted_size += size.max(0);
                }
                self.remove_image(assoc, false, force_remove, remove_associated, remove_references)?;
            }
        }

        let path = dao.get_image_path(backupid)?;
        let clientname = dao.get_image_clientname(backupid)?;
        let clientid = dao.get_image_clientid(backupid)?;
        let (path, clientname, clientid) = match (path, clientname, clientid) {
            (Some(path), Some(clientname), Some(clientid)) => (path, clientname, clientid),
            _ => return Ok(false),
        };

        info!("deleting image backup (id={}, path={:?})", backupid, path);

        let stat_id = if update_stat {
            Some(dao.add_to_image_stats(clientid, backupid, deleted_size, 0)?)
        } else {
            None
        };

        let removed = self.delete_image_files(&clientname, &path);
        if removed || force_remove {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = dao.remove_image(backupid);
            match result {
                Ok(()) => self.conn.execute_batch("COMMIT")?,
                Err(err) => {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    return Err(err);
                }
            }
            self.account_freed(deleted_size);
        } else {
            info!("deleting image backup {} failed", backupid);
            all_ok = false;
        }

        if let Some(stat_id) = stat_id {
            dao.update_del_image_stats(stat_id)?;
        }

        Ok(all_ok && (removed || force_remove))
    }

    /// Remove container and sidecars; truncate what cannot be deleted.
    fn delete_image_files(&self, clientname: &str, path: &str) -> bool {
        let path = Path::new(path);
        let mut ok = true;

        ok &= delete_and_truncate(path);
        ok &= delete_and_truncate(&suffixed(path, ".hash"));
        ok &= delete_and_truncate(&suffixed(path, ".mbr"));
        delete_and_truncate(&suffixed(path, ".bitmap"));
        delete_and_truncate(&suffixed(path, ".cbitmap"));
        let _ = std::fs::remove_file(suffixed(path, ".sync"));

        let dir = tools::parent_path(path);
        if ok && tools::file_name_string(&dir).as_deref() != Some(clientname) {
            if let Err(err) = std::fs::remove_dir(&dir) {
                debug!("unable to remove image directory {:?} - {}", dir, err);
                ok = false;
            }
        }
        ok
    }

    fn cleanup_all_system_images(&mut self) -> Result<(), Error> {
        let clients = self.cleanup_dao().get_clients()?;
        for client in clients {
            self.cleanup_system_images(client.id, &client.name)?;
        }
        Ok(())
    }

    /// System-reserved / EFI images older than 24 h without an owning
    /// volume image are always removable.
    fn cleanup_system_images(&mut self, clientid: i64, clientname: &str) -> Result<(), Error> {
        let old_images: Vec<ImageBackupInfo> = self
            .cleanup_dao()
            .get_old_image_backups_of_client(clientid)?;
        for image in old_images {
            if image.letter != "SYSVOL" && image.letter != "ESP" {
                continue;
            }
            let dao = self.cleanup_dao();
            if dao.image_has_assoc_parent(image.id)? || self.ctrl.cleanup_locks.is_locked(image.id)
            {
                continue;
            }
            info!(
                "image backup {} ({:?}) of client \"{}\" is an unreferenced system partition image older than 24h, deleting it",
                image.id, image.path, clientname
            );
            if !self.remove_image(image.id, false, false, true, false)? {
                error!("unable to remove system image backup {}", image.id);
            }
        }
        Ok(())
    }

    // ---- file backups ----------------------------------------------

    fn cleanup_files(&mut self, minspace: Option<i64>) -> Result<(), Error> {
        self.delete_incomplete_file_backups()?;

        let mut deleted_something = true;
        while deleted_something {
            deleted_something = false;

            if self.has_enough_free_space(minspace) {
                return Ok(());
            }

            for clientid in self.cleanup_dao().get_clients_sort_filebackups()? {
                if self.cleanup_one_filebackup_client(clientid, minspace)?.is_some() {
                    if self.has_enough_free_space(minspace) {
                        return Ok(());
                    }
                    deleted_something = true;
                }
            }
        }
        Ok(())
    }

    /// Delete at most one file backup of the client; returns its id.
    fn cleanup_one_filebackup_client(
        &mut self,
        clientid: i64,
        minspace: Option<i64>,
    ) -> Result<Option<i64>, Error> {
        let settings = ServerSettings::load(self.conn, clientid)?;

        let (max_file_full, max_file_incr) = if minspace.is_some() {
            (settings.min_file_full, settings.min_file_incr)
        } else {
            (settings.max_file_full, settings.max_file_incr)
        };

        loop {
            let candidates = self.files_not_errored(self.cleanup_dao().get_full_num_files(clientid)?);
            debug!(
                "client {} has {} full file backups, max={}",
                clientid,
                candidates.len(),
                max_file_full
            );
            if candidates.len() as i64 <= max_file_full || candidates.is_empty() {
                break;
            }
            let backupid = candidates[0];
            if self.delete_file_backup(clientid, backupid, false)? {
                return Ok(Some(backupid));
            }
        }

        loop {
            let candidates = self.files_not_errored(self.cleanup_dao().get_incr_num_files(clientid)?);
            debug!(
                "client {} has {} incremental file backups, max={}",
                clientid,
                candidates.len(),
                max_file_incr
            );
            if candidates.len() as i64 <= max_file_incr || candidates.is_empty() {
                break;
            }
            let backupid = candidates[0];
            if self.delete_file_backup(clientid, backupid, false)? {
                return Ok(Some(backupid));
            }
        }

        Ok(None)
    }

    fn files_not_errored(&self, ids: Vec<i64>) -> Vec<i64> {
        if self.remove_errors.is_empty() {
            return ids;
        }
        ids.into_iter()
            .filter(|id| !self.remove_errors.contains(id))
            .collect()
    }

    fn delete_incomplete_file_backups(&mut self) -> Result<(), Error> {
        let incomplete = self.cleanup_dao().get_incomplete_file_backups()?;
        for backup in incomplete {
            info!(
                "deleting incomplete file backup (id={}, path={:?})",
                backup.id, backup.path
            );
            if !self.delete_file_backup(backup.clientid, backup.id, false)? {
                warn!("error deleting incomplete file backup {}", backup.id);
            }
        }
        Ok(())
    }

    fn delete_file_backup(
        &mut self,
        clientid: i64,
        backupid: i64,
        force_remove: bool,
    ) -> Result<bool, Error> {
        let dao = self.cleanup_dao();
        let clientname = dao
            .get_client_name(clientid)?
            .ok_or_else(|| format_err!("client {} vanished", clientid))?;
        let backuppath = dao
            .get_file_backup_path(backupid)?
            .ok_or_else(|| format_err!("file backup {} vanished", backupid))?;
        if backuppath.is_empty() {
            bail!("file backup {} has an empty path", backupid);
        }
        let size = self
            .conn
            .query_row(
                "SELECT size_bytes FROM backups WHERE id=?",
                rusqlite::params![backupid],
                |row| row.get::<_, i64>(0),
            )
            .unwrap_or(0);

        let path = self
            .settings
            .backupfolder
            .join(&clientname)
            .join(&backuppath);

        let removed = match self
            .ctrl
            .pool
            .remove_directory_link_dir(self.conn, clientid, &path)
        {
            Ok(()) => true,
            Err(err) => {
                debug!("removing file backup tree {:?} - {}", path, err);
                false
            }
        };

        let mut deletable = true;
        let mut had_error = false;
        if !removed {
            if !path.is_dir() {
                warn!("file backup directory {:?} does not exist", path);
            } else {
                deletable = false;
                had_error = true;
                self.remove_errors.push(backupid);
                error!("unable to remove file backup directory {:?}", path);
            }
        }
        if path.is_dir() {
            deletable = false;
            if !had_error {
                had_error = true;
                self.remove_errors.push(backupid);
            }
            error!("file backup directory {:?} still exists", path);
        }

        if deletable || force_remove {
            self.remove_file_backup_sql(backupid)?;
            self.account_freed(size);
        }

        Ok(!had_error)
    }

    /// Drop the catalog rows of one file backup; the file-entry rings
    /// are spliced inside the files transaction.
    fn remove_file_backup_sql(&self, backupid: i64) -> Result<(), Error> {
        FilesDao::new(self.conn).remove_backup_files(backupid)?;
        self.cleanup_dao().remove_file_backup(backupid)?;
        Ok(())
    }

    // ---- clients ---------------------------------------------------

    fn delete_pending_clients(&mut self) -> Result<(), Error> {
        let pending = self.cleanup_dao().get_delete_pending_clients()?;
        for client in pending {
            self.remove_client(client.id, &client.name)?;
        }
        Ok(())
    }

    fn remove_client(&mut self, clientid: i64, clientname: &str) -> Result<(), Error> {
        info!("deleting client {} (\"{}\")", clientid, clientname);
        let dao = self.cleanup_dao();

        for image in dao.get_image_backups_of_client(clientid)? {
            self.remove_image(image.id, false, true, false, false)?;
        }
        for backup in self.cleanup_dao().get_file_backups_of_client(clientid)? {
            self.delete_file_backup(clientid, backup.id, true)?;
        }

        let client_dir = self.settings.backupfolder.join(clientname);
        if client_dir.is_dir() {
            if let Err(err) = self.ctrl.pool.remove_directory_link_dir(
                self.conn,
                clientid,
                &client_dir,
            ) {
                error!("unable to remove client directory {:?} - {}", client_dir, err);
            }
        }

        self.cleanup_dao().remove_client(clientid)?;
        add_log(
            self.conn,
            clientid,
            None,
            1,
            &format!("client \"{}\" deleted", clientname),
        )?;
        Ok(())
    }

    // ---- quotas ----------------------------------------------------

    fn enforce_quotas(&mut self) -> Result<(), Error> {
        let clients = self.cleanup_dao().get_clients()?;
        for client in clients {
            info!("enforcing quota for client \"{}\" (id={})", client.name, client.id);
            let mut report = format!(
                "Quota enforcement report for client \"{}\" (id={})\n",
                client.name, client.id
            );
            if !self.enforce_quota(client.id, &mut report)? {
                self.ctrl.notify_admins("Quota enforcement failed", &report);
                error!("{}", report);
            } else {
                debug!("{}", report);
            }
        }
        Ok(())
    }

    /// Alternate one image and one file-backup deletion until the
    /// client fits its quota; two consecutive misses stop the round.
    fn enforce_quota(&mut self, clientid: i64, report: &mut String) -> Result<bool, Error> {
        let settings = ServerSettings::load(self.conn, clientid)?;
        let quota_str = settings.client_quota.trim().to_string();
        if quota_str.is_empty() || quota_str == "100%" || quota_str == "-" {
            report.push_str("Client does not have a quota or the quota is 100%\n");
            return Ok(true);
        }

        let total = tools::total_space(&self.settings.backupfolder).unwrap_or(i64::MAX);
        let quota = match cleanup_amount(&quota_str, total) {
            Some(quota) => quota,
            None => {
                report.push_str("Client quota could not be parsed\n");
                return Ok(false);
            }
        };

        loop {
            let used = match self.cleanup_dao().get_used_storage(clientid)? {
                Some(used) if used >= 0 => used,
                _ => {
                    report.push_str("Error getting used storage of client\n");
                    return Ok(false);
                }
            };

            report.push_str(&format!(
                "Client uses {} and has a quota of {}\n",
                tools::pretty_print_bytes(used),
                tools::pretty_print_bytes(quota)
            ));

            if used <= quota {
                report.push_str("Client within assigned quota.\n");
                return Ok(true);
            }
            report.push_str("This requires enforcement of the quota.\n");

            let mut did_remove = false;
            let mut state = 0;
            let mut misses = 0;
            while misses < 2 {
                let available = self.space_base + self.space_freed;
                let space_to_free = used - quota;
                let target = available + space_to_free;

                if state == 0 {
                    let mut imageids = Vec::new();
                    self.cleanup_images_client(clientid, Some(target), &mut imageids, true)?;
                    if !imageids.is_empty() {
                        report.push_str(&format!("Removed image backups {:?}\n", imageids));
                        did_remove = true;
                        break;
                    }
                    misses += 1;
                } else {
                    match self.cleanup_one_filebackup_client(clientid, Some(target))? {
                        Some(backupid) => {
                            report.push_str(&format!("Removed file backup {}\n", backupid));
                            did_remove = true;
                            misses = 0;
                            if self.has_enough_free_space(Some(target)) {
                                break;
                            }
                        }
                        None => misses += 1,
                    }
                }
                state = (state + 1) % 2;
            }

            if did_remove {
                self.update_stats()?;
            } else {
                return Ok(false);
            }
        }
    }

    // ---- statistics & trims ----------------------------------------

    fn update_stats(&self) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE clients SET
                 bytes_used_images = (SELECT COALESCE(SUM(size_bytes), 0)
                     FROM backup_images WHERE clientid=clients.id AND complete=1),
                 bytes_used_files = (SELECT COALESCE(SUM(size_bytes), 0)
                     FROM backups WHERE clientid=clients.id AND complete=1)",
            rusqlite::params![],
        )?;
        Ok(())
    }

    fn write_history(&self) -> Result<(), Error> {
        self.cleanup_dao().write_history()
    }

    fn cleanup_other(&self) -> Result<(), Error> {
        info!("deleting old logs and history");
        self.cleanup_dao()
            .cleanup_other(LOG_RETENTION_DAYS, HISTORY_RETENTION_DAYS)
    }

    // ---- remove unknown --------------------------------------------

    fn do_remove_unknown(&mut self) -> Result<(), Error> {
        let backupfolder = self.settings.backupfolder.clone();
        let clients = self.cleanup_dao().get_clients()?;

        for client in &clients {
            info!("removing unknown data for client \"{}\"", client.name);
            let dao = self.cleanup_dao();

            // catalog rows whose disk data is gone
            for backup in dao.get_file_backups_of_client(client.id)? {
                let path = backupfolder.join(&client.name).join(&backup.path);
                if !path.is_dir() {
                    warn!(
                        "file backup (id={}, path={:?}) does not exist on disk, removing from the catalog",
                        backup.id, backup.path
                    );
                    self.remove_file_backup_sql(backup.id)?;
                }
            }
            for image in self.cleanup_dao().get_image_backups_of_client(client.id)? {
                if !Path::new(&image.path).is_file() {
                    warn!(
                        "image backup (id={}, path={:?}) does not exist on disk, removing from the catalog",
                        image.id, image.path
                    );
                    self.cleanup_dao().remove_image(image.id)?;
                } else {
                    self.verify_image_on_disk(&image)?;
                }
            }

            self.cleanup_system_images(client.id, &client.name)?;

            // disk data the catalog does not know
            self.remove_unknown_in_client_dir(client)?;

            self.check_symlinks(client.id, &client.name)?;
        }

        info!("removing dangling file entries");
        let removed = FilesDao::new(self.conn).remove_dangling_files()?;
        info!("deleted {} dangling file entries", removed);
        Ok(())
    }

    /// Open-level check of a complete image: a corrupt container or
    /// hash sidecar demotes the row to incomplete (the next sweep
    /// deletes it); a merely truncated sidecar is recomputed from the
    /// container.
    fn verify_image_on_disk(&self, image: &ImageBackupInfo) -> Result<(), Error> {
        use crate::backup::{HashFile, OpenMode, VhdFile, ALLOC_BLOCK_SIZE, MBR_AREA_SIZE};

        let complete: i64 = self.conn.query_row(
            "SELECT complete FROM backup_images WHERE id=?",
            rusqlite::params![image.id],
            |row| row.get(0),
        )?;
        if complete == 0 {
            return Ok(());
        }

        let mut container = match VhdFile::open(Path::new(&image.path), OpenMode::Read) {
            Ok(container) => container,
            Err(err) => {
                warn!(
                    "image backup {} ({:?}) cannot be opened ({}), marking it incomplete",
                    image.id, image.path, err
                );
                return self.mark_image_incomplete(image.id);
            }
        };

        let drive_size = container.logical_size().saturating_sub(MBR_AREA_SIZE);
        let expected = HashFile::expected_count(drive_size, ALLOC_BLOCK_SIZE);
        let hash_path = suffixed(Path::new(&image.path), ".hash");
        match HashFile::open(&hash_path) {
            Ok(mut hashes) if hashes.digest_count() < expected => {
                info!(
                    "hash sidecar {:?} is truncated ({} of {} digests), recomputing",
                    hash_path,
                    hashes.digest_count(),
                    expected
                );
                if let Err(err) =
                    hashes.repair_from(&mut container, MBR_AREA_SIZE, drive_size, ALLOC_BLOCK_SIZE)
                {
                    warn!(
                        "repairing hash sidecar {:?} failed ({}), marking image {} incomplete",
                        hash_path, err, image.id
                    );
                    return self.mark_image_incomplete(image.id);
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    "hash sidecar {:?} cannot be opened ({}), marking image {} incomplete",
                    hash_path, err, image.id
                );
                return self.mark_image_incomplete(image.id);
            }
        }
        Ok(())
    }

    fn mark_image_incomplete(&self, backupid: i64) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE backup_images SET complete=0, running=0 WHERE id=?",
            rusqlite::params![backupid],
        )?;
        Ok(())
    }

    fn remove_unknown_in_client_dir(
        &mut self,
        client: &super::catalog::ClientInfo,
    ) -> Result<(), Error> {
        let client_dir = self.settings.backupfolder.join(&client.name);
        if !client_dir.is_dir() {
            return Ok(());
        }

        let known_images: Vec<String> = self
            .cleanup_dao()
            .get_image_backups_of_client(client.id)?
            .into_iter()
            .map(|image| image.path)
            .collect();

        let entries: Vec<PathBuf> = std::fs::read_dir(&client_dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .collect();

        for path in entries {
            let name = match tools::file_name_string(&path) {
                Some(name) => name,
                None => continue,
            };
            if name == "current" || name == super::dir_links::DIRECTORY_POOL_NAME {
                continue;
            }

            let meta = std::fs::symlink_metadata(&path)?;
            if meta.is_dir() && !meta.file_type().is_symlink() {
                if IMAGE_DIR_RE.is_match(&name) {
                    self.remove_unknown_image_dir(&client.name, &path, &known_images)?;
                } else if self
                    .cleanup_dao()
                    .find_file_backup(client.id, &name)?
                    .is_none()
                {
                    warn!(
                        "file backup directory {:?} of client \"{}\" not in the catalog, deleting it",
                        path, client.name
                    );
                    if let Err(err) =
                        self.ctrl
                            .pool
                            .remove_directory_link_dir(self.conn, client.id, &path)
                    {
                        error!("unable to delete directory {:?} - {}", path, err);
                    }
                }
            } else if meta.is_file() {
                // legacy flat layout: containers directly in the client dir
                if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
                    if IMAGE_EXTENSIONS.contains(&ext)
                        && !known_images.iter().any(|known| known == &path.to_string_lossy())
                    {
                        warn!(
                            "image {:?} of client \"{}\" not in the catalog, deleting it",
                            path, client.name
                        );
                        delete_and_truncate(&path);
                        delete_and_truncate(&suffixed(&path, ".hash"));
                        delete_and_truncate(&suffixed(&path, ".mbr"));
                        let _ = std::fs::remove_file(suffixed(&path, ".bitmap"));
                        let _ = std::fs::remove_file(suffixed(&path, ".cbitmap"));
                    }
                }
            }
        }
        Ok(())
    }

    fn remove_unknown_image_dir(
        &self,
        clientname: &str,
        dir: &Path,
        known_images: &[String],
    ) -> Result<(), Error> {
        let mut found_image = false;
        let mut found_known = false;

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let ext = match path.extension().and_then(|ext| ext.to_str()) {
                Some(ext) => ext,
                None => continue,
            };
            if !IMAGE_EXTENSIONS.contains(&ext) {
                continue;
            }
            found_image = true;
            if known_images.iter().any(|known| known == &path.to_string_lossy()) {
                found_known = true;
            }
        }

        if !found_image || !found_known {
            warn!(
                "image backup directory {:?} of client \"{}\" not in the catalog, deleting it",
                dir, clientname
            );
            let mut remove_link = |link: &Path| -> Result<(), Error> {
                std::fs::remove_file(link)?;
                Ok(())
            };
            if let Err(err) = tools::remove_dir_recursive(dir, &mut remove_link, true) {
                error!("unable to delete image directory {:?} - {}", dir, err);
            }
        }
        Ok(())
    }

    /// Repair pass over the link references of one client: drop rows
    /// whose pool entry or symlink is gone, repoint stale symlinks, and
    /// collect unreferenced pool entries.
    fn check_symlinks(&self, clientid: i64, clientname: &str) -> Result<(), Error> {
        let link_dao = LinkDao::new(self.conn);
        let proot = pool_root(&self.settings.backupfolder, clientname);

        let mut del_ids = Vec::new();
        for entry in link_dao.get_client_links(clientid)? {
            let pool_path = super::dir_links::pool_entry_path(&proot, &entry.name);
            let target = PathBuf::from(&entry.target);

            let pool_ok = pool_path.is_dir();
            let target_is_link = std::fs::symlink_metadata(&target)
                .map(|meta| meta.file_type().is_symlink())
                .unwrap_or(false);

            if !pool_ok || !target_is_link {
                if !pool_ok {
                    info!("pool entry for \"{}\" not found", entry.name);
                }
                if !target_is_link {
                    info!("pool symlink {:?} not found", target);
                }
                info!("deleting link reference {}", entry.id);
                del_ids.push(entry.id);
                continue;
            }

            if let Ok(current) = std::fs::read_link(&target) {
                if current != pool_path {
                    info!("correcting symlink {:?} to {:?}", target, pool_path);
                    if std::fs::remove_file(&target).is_ok() {
                        if let Err(err) = std::os::unix::fs::symlink(&pool_path, &target) {
                            error!(
                                "unable to create symlink at {:?} to {:?} - {}",
                                target, pool_path, err
                            );
                        }
                    } else {
                        error!("unable to delete symlink {:?}", target);
                    }
                }
            }
        }

        for id in del_ids {
            link_dao.delete_link_ref_entry(id)?;
        }

        self.ctrl
            .pool
            .cleanup_pool_entries(self.conn, clientid, &proot)
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", path.display(), suffix))
}

/// Delete a file; on failure truncate it to zero so the space is
/// reclaimed even when the directory entry cannot be removed.
fn delete_and_truncate(path: &Path) -> bool {
    if !path.exists() {
        return true;
    }
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(err) => {
            info!("deleting {:?} failed ({}), truncating it instead", path, err);
            if let Ok(file) = std::fs::OpenOptions::new().write(true).open(path) {
                let _ = file.set_len(0);
            }
            false
        }
    }
}

/// Seen-state snapshot used by the remove-unknown idempotence tests.
#[cfg(test)]
fn catalog_fingerprint(conn: &Connection) -> (i64, i64, i64, i64) {
    let count = |sql: &str| -> i64 {
        conn.query_row(sql, rusqlite::params![], |row| row.get(0)).unwrap()
    };
    (
        count("SELECT count(*) FROM backups"),
        count("SELECT count(*) FROM backup_images"),
        count("SELECT count(*) FROM files"),
        count("SELECT count(*) FROM directory_links"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::catalog::{test_catalog, BackupDao};

    struct Fixture {
        _dir: tempfile::TempDir,
        catalog: Catalog,
        backupfolder: PathBuf,
        controller: CleanupController,
    }

    /// Free-space probe pinned to zero: the in-memory accounting alone
    /// decides when a target is reached.
    fn fixture() -> Fixture {
        let (dir, catalog) = test_catalog();
        let backupfolder = dir.path().join("backups");
        std::fs::create_dir_all(&backupfolder).unwrap();

        let conn = catalog.connect().unwrap();
        ServerSettings::set(&conn, 0, "backupfolder", backupfolder.to_str().unwrap()).unwrap();

        let controller = CleanupController::new(
            catalog.clone(),
            Arc::new(DirectoryPool::new()),
            CleanupLocks::new(),
            None,
        )
        .with_free_space_fn(Box::new(|_| Ok(0)));

        Fixture {
            _dir: dir,
            catalog,
            backupfolder,
            controller,
        }
    }

    /// A complete image backup with container + sidecars on disk.
    fn make_image(
        fx: &Fixture,
        conn: &Connection,
        clientid: i64,
        clientname: &str,
        seq: i64,
        incremental_ref: Option<i64>,
        size: i64,
    ) -> i64 {
        let dir = fx
            .backupfolder
            .join(clientname)
            .join(format!("Image_C_{}", seq));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("image.vhd");
        std::fs::write(&path, vec![0u8; 16]).unwrap();
        std::fs::write(suffixed(&path, ".hash"), b"h").unwrap();
        std::fs::write(suffixed(&path, ".mbr"), b"m").unwrap();

        let dao = BackupDao::new(conn);
        let incremental = if incremental_ref.is_some() { 1 } else { 0 };
        let id = dao
            .create_image_backup(
                clientid,
                "C",
                path.to_str().unwrap(),
                incremental,
                incremental_ref,
            )
            .unwrap();
        conn.execute(
            "UPDATE backup_images SET complete=1, size_bytes=?, backuptime=? WHERE id=?",
            rusqlite::params![size, seq, id],
        )
        .unwrap();
        id
    }

    fn image_exists(conn: &Connection, id: i64) -> bool {
        conn.query_row(
            "SELECT count(*) FROM backup_images WHERE id=?",
            rusqlite::params![id],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            > 0
    }

    #[test]
    fn retention_deletes_oldest_full_image() {
        let fx = fixture();
        let conn = fx.catalog.connect().unwrap();
        let dao = BackupDao::new(&conn);
        let client = dao.get_or_create_client("ws").unwrap();

        ServerSettings::set(&conn, 0, "max_image_full", "2").unwrap();
        let img1 = make_image(&fx, &conn, client, "ws", 1, None, 100);
        let img2 = make_image(&fx, &conn, client, "ws", 2, None, 100);
        let img3 = make_image(&fx, &conn, client, "ws", 3, None, 100);
        conn.execute(
            "UPDATE clients SET bytes_used_images=300 WHERE id=?",
            rusqlite::params![client],
        )
        .unwrap();

        let path1: String = conn
            .query_row(
                "SELECT path FROM backup_images WHERE id=?",
                rusqlite::params![img1],
                |row| row.get(0),
            )
            .unwrap();

        fx.controller.nightly_cleanup().unwrap();

        assert!(!image_exists(&conn, img1), "oldest full image removed");
        assert!(image_exists(&conn, img2));
        assert!(image_exists(&conn, img3));
        assert!(!Path::new(&path1).exists());
        assert!(!Path::new(&path1).parent().unwrap().exists());
    }

    #[test]
    fn chains_are_deleted_bottom_up_and_respect_min_incr() {
        let fx = fixture();
        let conn = fx.catalog.connect().unwrap();
        let dao = BackupDao::new(&conn);
        let client = dao.get_or_create_client("ws").unwrap();

        // full image with two complete incremental children
        let full = make_image(&fx, &conn, client, "ws", 1, None, 100);
        let incr1 = make_image(&fx, &conn, client, "ws", 2, Some(full), 10);
        let incr2 = make_image(&fx, &conn, client, "ws", 3, Some(full), 10);
        let full2 = make_image(&fx, &conn, client, "ws", 4, None, 100);

        // with min_image_incr=2, the two children may not be removed,
        // so the parent is not removable either
        ServerSettings::set(&conn, 0, "min_image_full", "1").unwrap();
        ServerSettings::set(&conn, 0, "min_image_incr", "2").unwrap();
        assert!(!fx.controller.free_space(1_000).unwrap());
        assert!(image_exists(&conn, full));
        assert!(image_exists(&conn, incr1));
        assert!(image_exists(&conn, incr2));

        // allow removing the children and the chain goes bottom-up
        ServerSettings::set(&conn, 0, "min_image_incr", "0").unwrap();
        assert!(fx.controller.free_space(120).unwrap());
        assert!(!image_exists(&conn, full));
        assert!(!image_exists(&conn, incr1));
        assert!(!image_exists(&conn, incr2));
        assert!(image_exists(&conn, full2), "newest full image survives");
    }

    #[test]
    fn free_space_targets_client_with_most_usage_first() {
        let fx = fixture();
        let conn = fx.catalog.connect().unwrap();
        let dao = BackupDao::new(&conn);

        ServerSettings::set(&conn, 0, "min_image_full", "2").unwrap();

        let big = dao.get_or_create_client("big").unwrap();
        let small = dao.get_or_create_client("small").unwrap();
        let mut big_images = Vec::new();
        for seq in 0..4 {
            big_images.push(make_image(&fx, &conn, big, "big", seq, None, 300));
        }
        let mut small_images = Vec::new();
        for seq in 0..4 {
            small_images.push(make_image(&fx, &conn, small, "small", seq, None, 100));
        }
        conn.execute("UPDATE clients SET bytes_used_images=1200 WHERE id=?", rusqlite::params![big]).unwrap();
        conn.execute("UPDATE clients SET bytes_used_images=400 WHERE id=?", rusqlite::params![small]).unwrap();

        assert!(fx.controller.free_space(500).unwrap());

        // the two oldest images of the bigger client are gone, the
        // smaller client is untouched
        assert!(!image_exists(&conn, big_images[0]));
        assert!(!image_exists(&conn, big_images[1]));
        assert!(image_exists(&conn, big_images[2]));
        assert!(small_images.iter().all(|&id| image_exists(&conn, id)));
    }

    #[test]
    fn mount_locked_images_are_skipped() {
        let fx = fixture();
        let conn = fx.catalog.connect().unwrap();
        let dao = BackupDao::new(&conn);
        let client = dao.get_or_create_client("ws").unwrap();

        ServerSettings::set(&conn, 0, "min_image_full", "0").unwrap();
        let img1 = make_image(&fx, &conn, client, "ws", 1, None, 100);
        let img2 = make_image(&fx, &conn, client, "ws", 2, None, 100);

        fx.controller.lock_image(img1);
        // img2 alone does not reach the target and img1 is locked
        assert!(!fx.controller.free_space(150).unwrap());

        assert!(image_exists(&conn, img1));
        assert!(!image_exists(&conn, img2));
    }

    #[test]
    fn incomplete_images_with_stale_heartbeat_are_removed() {
        let fx = fixture();
        let conn = fx.catalog.connect().unwrap();
        let dao = BackupDao::new(&conn);
        let client = dao.get_or_create_client("ws").unwrap();

        let dir = fx.backupfolder.join("ws/Image_C_9");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("image.vhd");
        std::fs::write(&path, b"partial").unwrap();
        let id = dao
            .create_image_backup(client, "C", path.to_str().unwrap(), 0, None)
            .unwrap();
        conn.execute(
            "UPDATE backup_images SET running=? WHERE id=?",
            rusqlite::params![tools::epoch_secs() - 3600, id],
        )
        .unwrap();

        fx.controller.nightly_cleanup().unwrap();
        assert!(!image_exists(&conn, id));
        assert!(!path.exists());
    }

    #[test]
    fn remove_unknown_is_idempotent() {
        let fx = fixture();
        let conn = fx.catalog.connect().unwrap();
        let dao = BackupDao::new(&conn);
        let client = dao.get_or_create_client("ws").unwrap();

        // a known image (stays), a catalog row without disk data
        // (row removed), and a disk dir without catalog rows (deleted)
        let keep = make_image(&fx, &conn, client, "ws", 1, None, 10);
        let ghost = dao
            .create_image_backup(
                client,
                "C",
                fx.backupfolder.join("ws/Image_C_77/image.vhd").to_str().unwrap(),
                0,
                None,
            )
            .unwrap();
        conn.execute(
            "UPDATE backup_images SET complete=1 WHERE id=?",
            rusqlite::params![ghost],
        )
        .unwrap();

        let stray = fx.backupfolder.join("ws/Image_C_99");
        std::fs::create_dir_all(&stray).unwrap();
        std::fs::write(stray.join("image.vhd"), b"x").unwrap();

        let stray_file_backup = fx.backupfolder.join("ws/210101-0101");
        std::fs::create_dir_all(&stray_file_backup).unwrap();

        fx.controller.remove_unknown().unwrap();

        assert!(image_exists(&conn, keep));
        assert!(!image_exists(&conn, ghost));
        assert!(!stray.exists());
        assert!(!stray_file_backup.exists());

        // second run changes nothing
        let before = catalog_fingerprint(&conn);
        fx.controller.remove_unknown().unwrap();
        assert_eq!(catalog_fingerprint(&conn), before);
        assert!(image_exists(&conn, keep));
    }

    #[test]
    fn quota_enforcement_removes_until_within_quota() {
        let fx = fixture();
        let conn = fx.catalog.connect().unwrap();
        let dao = BackupDao::new(&conn);
        let client = dao.get_or_create_client("ws").unwrap();

        ServerSettings::set(&conn, 0, "min_image_full", "1").unwrap();
        ServerSettings::set(&conn, 0, "client_quota", "250").unwrap();
        for seq in 0..3 {
            make_image(&fx, &conn, client, "ws", seq, None, 100);
        }
        conn.execute(
            "UPDATE clients SET bytes_used_images=300 WHERE id=?",
            rusqlite::params![client],
        )
        .unwrap();

        fx.controller.nightly_cleanup().unwrap();

        let remaining: i64 = conn
            .query_row(
                "SELECT count(*) FROM backup_images",
                rusqlite::params![],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 2);
        let used: i64 = conn
            .query_row(
                "SELECT bytes_used_images FROM clients WHERE id=?",
                rusqlite::params![client],
                |row| row.get(0),
            )
            .unwrap();
        assert!(used <= 250);
    }

    #[test]
    fn tombstoned_client_is_fully_removed() {
        let fx = fixture();
        let conn = fx.catalog.connect().unwrap();
        let dao = BackupDao::new(&conn);
        let client = dao.get_or_create_client("ws").unwrap();
        make_image(&fx, &conn, client, "ws", 1, None, 10);
        dao.set_client_delete_pending(client, true).unwrap();

        fx.controller.nightly_cleanup().unwrap();

        let clients: i64 = conn
            .query_row("SELECT count(*) FROM clients", rusqlite::params![], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(clients, 0);
        assert!(!fx.backupfolder.join("ws").exists());
    }

    #[test]
    fn database_backup_copies_and_renames() {
        let fx = fixture();
        assert!(fx.controller.backup_database().unwrap());

        let copy = fx
            .backupfolder
            .join("blockbackup")
            .join(crate::server::catalog::CATALOG_DB_NAME);
        assert!(copy.is_file());
        // the staging name is gone after the rename pass
        assert!(!PathBuf::from(format!("{}~", copy.display())).exists());

        // the copy opens as a valid database
        let conn = Connection::open(&copy).unwrap();
        let ok: String = conn
            .query_row("PRAGMA quick_check", rusqlite::params![], |row| row.get(0))
            .unwrap();
        assert_eq!(ok, "ok");
    }

    #[test]
    fn free_space_accounting_counts_deleted_sizes() {
        let fx = fixture();
        let conn = fx.catalog.connect().unwrap();
        let dao = BackupDao::new(&conn);
        let client = dao.get_or_create_client("ws").unwrap();

        ServerSettings::set(&conn, 0, "min_image_full", "0").unwrap();
        for seq in 0..3 {
            make_image(&fx, &conn, client, "ws", seq, None, 100);
        }
        conn.execute(
            "UPDATE clients SET bytes_used_images=300 WHERE id=?",
            rusqlite::params![client],
        )
        .unwrap();

        // 150 bytes target: two images (100 each) must go, not three
        assert!(fx.controller.free_space(150).unwrap());
        let remaining: i64 = conn
            .query_row(
                "SELECT count(*) FROM backup_images",
                rusqlite::params![],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 1);
    }
}
