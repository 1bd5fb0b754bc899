//! Backup server daemon.
//!
//! Wires the engine together and runs the long-lived threads: the
//! background orchestrator and the mount watchdog. Client sessions and
//! the management API live in separate services; they drive image
//! transfers, cleanup requests and mounts through the library API.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use log::{error, info};

use blockbackup::config::ServerSettings;
use blockbackup::server::{
    catalog::{Catalog, CATALOG_DB_NAME},
    CleanupController, CleanupLocks, DirectoryPool, ImageMount, MountProvider, Orchestrator,
};
use blockbackup::tools;

/// Mounts images through the setuid helper, like the restore path does.
struct HelperMountProvider;

impl MountProvider for HelperMountProvider {
    fn mount_readonly(&self, image_path: &Path, mountpoint: &Path) -> Result<(), Error> {
        let status = Command::new("blockbackup_mount_helper")
            .arg("mount")
            .arg(image_path)
            .arg(mountpoint)
            .status()
            .map_err(|err| format_err!("unable to run blockbackup_mount_helper - {}", err))?;
        if !status.success() {
            bail!("blockbackup_mount_helper mount failed with {}", status);
        }
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path) -> Result<(), Error> {
        let status = Command::new("blockbackup_mount_helper")
            .arg("umount")
            .arg(mountpoint)
            .status()
            .map_err(|err| format_err!("unable to run blockbackup_mount_helper - {}", err))?;
        if !status.success() {
            bail!("blockbackup_mount_helper umount failed with {}", status);
        }
        Ok(())
    }
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<(), Error> {
    use nix::sys::signal::{signal, SigHandler, Signal};
    unsafe {
        signal(Signal::SIGINT, SigHandler::Handler(handle_signal))?;
        signal(Signal::SIGTERM, SigHandler::Handler(handle_signal))?;
    }
    Ok(())
}

fn run() -> Result<(), Error> {
    let workdir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let catalog = Catalog::open(&workdir.join("blockbackup").join(CATALOG_DB_NAME))?;

    {
        let conn = catalog.connect()?;
        let settings = ServerSettings::load(&conn, 0)?;
        std::fs::create_dir_all(&settings.backupfolder).map_err(|err| {
            format_err!(
                "unable to create backup folder {:?} - {}",
                settings.backupfolder,
                err
            )
        })?;
        info!(
            "backup storage at {:?} ({} free)",
            settings.backupfolder,
            tools::pretty_print_bytes(tools::free_space(&settings.backupfolder)?)
        );
    }

    let pool = Arc::new(DirectoryPool::new());
    let cleanup_locks = CleanupLocks::new();
    let cleanup = Arc::new(CleanupController::new(
        catalog.clone(),
        pool.clone(),
        cleanup_locks.clone(),
        None,
    ));

    let mount_ttl = {
        let conn = catalog.connect()?;
        ServerSettings::load(&conn, 0)?.mount_ttl_secs
    };
    let image_mount = ImageMount::new(
        catalog.clone(),
        Box::new(HelperMountProvider),
        cleanup_locks,
        mount_ttl,
    );

    let orchestrator = Arc::new(Orchestrator::new(catalog, cleanup, pool));

    install_signal_handlers()?;

    let orchestrator_handle = {
        let orchestrator = Arc::clone(&orchestrator);
        std::thread::Builder::new()
            .name("orchestrator".into())
            .spawn(move || orchestrator.run())?
    };
    let watchdog_handle = {
        let image_mount = Arc::clone(&image_mount);
        std::thread::Builder::new()
            .name("mount-watchdog".into())
            .spawn(move || image_mount.run_watchdog())?
    };

    info!("backup server running");
    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(500));
    }

    info!("shutting down");
    orchestrator.stop();
    image_mount.stop();
    let _ = orchestrator_handle.join();
    let _ = watchdog_handle.join();
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        error!("{}", err);
        std::process::exit(1);
    }
}
