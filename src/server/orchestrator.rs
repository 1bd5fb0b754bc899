//! Background orchestrator: startup journal replay, the hourly
//! statistics tick and the nightly maintenance window (cleanup, quota
//! enforcement, database backup).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Error;
use chrono::{DateTime, Local};
use log::{error, info};

use super::catalog::Catalog;
use super::cleanup::CleanupController;
use super::dir_links::DirectoryPool;
use crate::config::ServerSettings;
use crate::tools::timespan;

/// Cleanup runs at most once per window entry, even if the window is
/// wide open.
const MIN_CLEANUP_INTERVAL_SECS: i64 = 20 * 3600;
const STATS_INTERVAL_SECS: i64 = 3600;
const TICK_SLEEP: Duration = Duration::from_secs(60);

pub struct Orchestrator {
    catalog: Catalog,
    cleanup: Arc<CleanupController>,
    pool: Arc<DirectoryPool>,
    stop: AtomicBool,
    stats_requested: AtomicBool,
    stats_disabled: AtomicBool,
    state: Mutex<TickState>,
}

#[derive(Default)]
struct TickState {
    last_cleanup: i64,
    last_stats: i64,
}

impl Orchestrator {
    pub fn new(catalog: Catalog, cleanup: Arc<CleanupController>, pool: Arc<DirectoryPool>) -> Self {
        Self {
            catalog,
            cleanup,
            pool,
            stop: AtomicBool::new(false),
            stats_requested: AtomicBool::new(false),
            stats_disabled: AtomicBool::new(false),
            state: Mutex::new(TickState::default()),
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Ask for an out-of-band statistics refresh at the next tick.
    pub fn request_stats_update(&self) {
        self.stats_requested.store(true, Ordering::SeqCst);
    }

    pub fn disable_stats_update(&self, disabled: bool) {
        self.stats_disabled.store(disabled, Ordering::SeqCst);
    }

    /// Replay the directory-link journal; must run before any backup
    /// or cleanup activity.
    pub fn startup(&self) -> Result<(), Error> {
        let conn = self.catalog.connect()?;
        if !self.pool.replay_journal(&conn)? {
            error!("directory link journal replay reported errors");
        }
        Ok(())
    }

    /// Blocking main loop; returns after [`stop`](Self::stop).
    pub fn run(&self) {
        if let Err(err) = self.startup() {
            error!("orchestrator startup failed - {}", err);
        }
        while !self.stop.load(Ordering::SeqCst) {
            if let Err(err) = self.tick(Local::now()) {
                error!("orchestrator tick failed - {}", err);
            }
            std::thread::sleep(TICK_SLEEP);
        }
    }

    /// One orchestrator pass; separated from the loop so the window
    /// logic is testable with a pinned clock.
    pub fn tick(&self, now: DateTime<Local>) -> Result<(), Error> {
        let now_secs = now.timestamp();

        let run_stats = {
            let state = self.state.lock().unwrap();
            self.stats_requested.load(Ordering::SeqCst)
                || now_secs - state.last_stats >= STATS_INTERVAL_SECS
        };
        if run_stats && !self.stats_disabled.load(Ordering::SeqCst) {
            info!("updating statistics");
            self.cleanup.refresh_statistics()?;
            self.stats_requested.store(false, Ordering::SeqCst);
            self.state.lock().unwrap().last_stats = now_secs;
            info!("done updating statistics");
        }

        let window = {
            let conn = self.catalog.connect()?;
            ServerSettings::load(&conn, 0)?.cleanup_window
        };

        let due = {
            let state = self.state.lock().unwrap();
            timespan::is_in_window(&window, now)
                && now_secs - state.last_cleanup > MIN_CLEANUP_INTERVAL_SECS
        };
        if due {
            self.cleanup.nightly_cleanup()?;
            if let Err(err) = self.cleanup.backup_database() {
                error!("database backup failed - {}", err);
            }
            self.state.lock().unwrap().last_cleanup = now_secs;
        }

        Ok(())
    }
}
