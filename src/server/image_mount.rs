//! Mount/export layer: brings completed images online as read-only
//! filesystems, one mountpoint per backup, with timed auto-unmount.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use log::{error, info};

use super::catalog::{BackupDao, Catalog};
use crate::tools;

/// Pluggable mount driver; the core never inspects its internals.
pub trait MountProvider: Send + Sync {
    /// Expose the image's root filesystem read-only at `mountpoint`.
    fn mount_readonly(&self, image_path: &Path, mountpoint: &Path) -> Result<(), Error>;
    fn unmount(&self, mountpoint: &Path) -> Result<(), Error>;
}

/// Image ids the cleanup controller must not delete; shared between the
/// mount layer and the cleanup controller.
#[derive(Clone, Default)]
pub struct CleanupLocks {
    locked: Arc<Mutex<HashSet<i64>>>,
}

impl CleanupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, backupid: i64) {
        self.locked.lock().unwrap().insert(backupid);
    }

    pub fn unlock(&self, backupid: i64) {
        self.locked.lock().unwrap().remove(&backupid);
    }

    pub fn is_locked(&self, backupid: i64) -> bool {
        self.locked.lock().unwrap().contains(&backupid)
    }
}

#[derive(Default)]
struct MountTable {
    /// Refcount of active users per mounted image.
    referenced: HashMap<i64, usize>,
    /// Images currently inside a mount or unmount operation.
    in_operation: HashSet<i64>,
}

pub struct ImageMount {
    catalog: Catalog,
    provider: Box<dyn MountProvider>,
    cleanup_locks: CleanupLocks,
    table: Mutex<MountTable>,
    cond: Condvar,
    mount_ttl_secs: i64,
    stop: AtomicBool,
}

impl ImageMount {
    pub fn new(
        catalog: Catalog,
        provider: Box<dyn MountProvider>,
        cleanup_locks: CleanupLocks,
        mount_ttl_secs: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            provider,
            cleanup_locks,
            table: Mutex::new(MountTable::default()),
            cond: Condvar::new(),
            mount_ttl_secs,
            stop: AtomicBool::new(false),
        })
    }

    /// Serialize mount operations per image id.
    fn lock_image(&self, backupid: i64) {
        let mut table = self.table.lock().unwrap();
        while table.in_operation.contains(&backupid) {
            table = self.cond.wait(table).unwrap();
        }
        table.in_operation.insert(backupid);
    }

    fn unlock_image(&self, backupid: i64) {
        let mut table = self.table.lock().unwrap();
        table.in_operation.remove(&backupid);
        drop(table);
        self.cond.notify_all();
    }

    fn mountpoint_for(image_path: &str) -> PathBuf {
        tools::parent_path(Path::new(image_path)).join("contents")
    }

    /// Mount a completed image and return the mountpoint.
    pub fn mount(&self, backupid: i64) -> Result<PathBuf, Error> {
        self.lock_image(backupid);
        let result = self.mount_locked(backupid);
        self.unlock_image(backupid);
        result
    }

    fn mount_locked(&self, backupid: i64) -> Result<PathBuf, Error> {
        let conn = self.catalog.connect()?;
        let dao = BackupDao::new(&conn);
        let image = dao
            .get_mounted_image(backupid)?
            .ok_or_else(|| format_err!("image backup {} not found or incomplete", backupid))?;

        let mountpoint = Self::mountpoint_for(&image.path);

        if image.mounttime != 0 && mountpoint.is_dir() {
            dao.set_image_mounted(backupid)?;
            return Ok(mountpoint);
        }

        self.cleanup_locks.lock(backupid);
        dao.set_image_mounted(backupid)?;

        if let Err(err) = self
            .provider
            .mount_readonly(Path::new(&image.path), &mountpoint)
        {
            dao.set_image_unmounted(backupid)?;
            self.cleanup_locks.unlock(backupid);
            bail!("unable to mount image backup {} - {}", backupid, err);
        }

        Ok(mountpoint)
    }

    /// Current mountpoint of an image; with `do_mount` the image is
    /// mounted on demand.
    pub fn mount_path(&self, backupid: i64, do_mount: bool) -> Result<Option<PathBuf>, Error> {
        {
            let conn = self.catalog.connect()?;
            let dao = BackupDao::new(&conn);
            let image = match dao.get_mounted_image(backupid)? {
                Some(image) => image,
                None => return Ok(None),
            };
            if image.mounttime != 0 {
                let mountpoint = Self::mountpoint_for(&image.path);
                if mountpoint.is_dir() {
                    dao.set_image_mounted(backupid)?;
                    return Ok(Some(mountpoint));
                }
            }
        }
        if !do_mount {
            return Ok(None);
        }
        self.mount(backupid).map(Some)
    }

    pub fn unmount(&self, backupid: i64) -> Result<(), Error> {
        self.lock_image(backupid);
        let result = self.unmount_locked(backupid);
        self.unlock_image(backupid);
        result
    }

    fn unmount_locked(&self, backupid: i64) -> Result<(), Error> {
        let conn = self.catalog.connect()?;
        let dao = BackupDao::new(&conn);
        let image = dao
            .get_mounted_image(backupid)?
            .ok_or_else(|| format_err!("image backup {} not found", backupid))?;

        let mountpoint = Self::mountpoint_for(&image.path);
        let result = self.provider.unmount(&mountpoint);
        dao.set_image_unmounted(backupid)?;
        self.cleanup_locks.unlock(backupid);
        result
    }

    /// Pin a mounted image while a reader uses it; pinned images are
    /// exempt from TTL revocation.
    pub fn incr_image_mounted(&self, backupid: i64) {
        let mut table = self.table.lock().unwrap();
        *table.referenced.entry(backupid).or_insert(0) += 1;
    }

    pub fn decr_image_mounted(&self, backupid: i64) {
        let mut table = self.table.lock().unwrap();
        if let Some(count) = table.referenced.get_mut(&backupid) {
            *count -= 1;
            if *count == 0 {
                table.referenced.remove(&backupid);
            }
        }
    }

    /// One watchdog pass: unmount images mounted longer than the TTL
    /// that are not actively referenced.
    pub fn revoke_old_mounts(&self) -> Result<(), Error> {
        let old = {
            let conn = self.catalog.connect()?;
            BackupDao::new(&conn).get_old_mounted_images(self.mount_ttl_secs)?
        };

        for image in old {
            {
                let table = self.table.lock().unwrap();
                if table.referenced.contains_key(&image.id) || table.in_operation.contains(&image.id)
                {
                    continue;
                }
            }
            info!(
                "unmounting image backup {} (path {:?}), mounted {}s ago",
                image.id,
                image.path,
                tools::epoch_secs() - image.mounttime
            );
            if let Err(err) = self.unmount(image.id) {
                error!("watchdog unmount of image backup {} failed - {}", image.id, err);
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Watchdog loop; runs until [`stop`](Self::stop).
    pub fn run_watchdog(self: &Arc<Self>) {
        while !self.stop.load(Ordering::SeqCst) {
            if let Err(err) = self.revoke_old_mounts() {
                error!("mount watchdog pass failed - {}", err);
            }
            for _ in 0..60 {
                if self.stop.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
}
