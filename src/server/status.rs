//! Process-wide status table.
//!
//! Keeps the transient per-client state the status API exports: running
//! processes with progress and ETA, online flags, the administrative
//! stop flags the worker loops poll, and the no-space counters. Nothing
//! here is durable; completed processes are recorded in the catalog's
//! `processes_log` by their owners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use lazy_static::lazy_static;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusError {
    Idle,
    IdentError,
    TooManyClients,
    AuthenticationError,
    BackupRunning,
}

impl Default for StatusError {
    fn default() -> Self {
        StatusError::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessAction {
    FullImage,
    IncrImage,
    NightlyCleanup,
    EmergencyCleanup,
    RemoveUnknown,
    CheckIntegrity,
    DatabaseBackup,
    UpdateStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunningProcess {
    pub id: u64,
    pub action: ProcessAction,
    pub details: String,
    pub pcdone: i32,
    pub eta_ms: i64,
    pub done_bytes: i64,
    pub total_bytes: i64,
    pub speed_bpms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientStatus {
    pub online: bool,
    pub status_error: StatusError,
    pub processes: Vec<RunningProcess>,
}

#[derive(Default)]
struct StatusTable {
    clients: HashMap<String, ClientStatus>,
    stopped: HashMap<String, bool>,
    next_process_id: u64,
}

lazy_static! {
    static ref STATUS: Mutex<StatusTable> = Mutex::new(StatusTable::default());
}

static NOSPC_STALLED: AtomicI64 = AtomicI64::new(0);
static NOSPC_FATAL: AtomicBool = AtomicBool::new(false);

pub struct ServerStatus;

impl ServerStatus {
    pub fn start_process(client: &str, action: ProcessAction, details: String) -> u64 {
        let mut table = STATUS.lock().unwrap();
        table.next_process_id += 1;
        let id = table.next_process_id;
        let status = table.clients.entry(client.to_string()).or_default();
        status.processes.push(RunningProcess {
            id,
            action,
            details,
            pcdone: -1,
            eta_ms: -1,
            done_bytes: 0,
            total_bytes: -1,
            speed_bpms: 0.0,
        });
        id
    }

    pub fn stop_process(client: &str, id: u64) {
        let mut table = STATUS.lock().unwrap();
        if let Some(status) = table.clients.get_mut(client) {
            status.processes.retain(|process| process.id != id);
        }
    }

    fn update<F: FnOnce(&mut RunningProcess)>(client: &str, id: u64, update: F) {
        let mut table = STATUS.lock().unwrap();
        if let Some(process) = table
            .clients
            .get_mut(client)
            .and_then(|status| status.processes.iter_mut().find(|process| process.id == id))
        {
            update(process);
        }
    }

    pub fn set_process_pcdone(client: &str, id: u64, pcdone: i32) {
        Self::update(client, id, |process| process.pcdone = pcdone);
    }

    pub fn set_process_eta(client: &str, id: u64, eta_ms: i64, speed_bpms: f64) {
        Self::update(client, id, |process| {
            process.eta_ms = eta_ms;
            process.speed_bpms = speed_bpms;
        });
    }

    pub fn set_process_done_bytes(client: &str, id: u64, done: i64, total: i64) {
        Self::update(client, id, |process| {
            process.done_bytes = done;
            process.total_bytes = total;
        });
    }

    pub fn set_online(client: &str, online: bool) {
        let mut table = STATUS.lock().unwrap();
        table.clients.entry(client.to_string()).or_default().online = online;
    }

    pub fn set_status_error(client: &str, error: StatusError) {
        let mut table = STATUS.lock().unwrap();
        table
            .clients
            .entry(client.to_string())
            .or_default()
            .status_error = error;
    }

    /// Administrative stop; polled by the protocol, cleanup and writer
    /// loops. Terminal for the running backup.
    pub fn stop_backup(client: &str) {
        let mut table = STATUS.lock().unwrap();
        table.stopped.insert(client.to_string(), true);
    }

    pub fn is_backup_stopped(client: &str) -> bool {
        let table = STATUS.lock().unwrap();
        table.stopped.get(client).copied().unwrap_or(false)
    }

    pub fn clear_stopped(client: &str) {
        let mut table = STATUS.lock().unwrap();
        table.stopped.remove(client);
    }

    pub fn increment_nospc_stalled(amount: i64) {
        NOSPC_STALLED.fetch_add(amount, Ordering::SeqCst);
    }

    pub fn set_nospc_fatal(fatal: bool) {
        NOSPC_FATAL.store(fatal, Ordering::SeqCst);
    }

    /// Snapshot for the status API.
    pub fn status_json() -> serde_json::Value {
        let table = STATUS.lock().unwrap();
        let clients: HashMap<&String, &ClientStatus> = table.clients.iter().collect();
        json!({
            "clients": clients,
            "nospc_stalled": NOSPC_STALLED.load(Ordering::SeqCst),
            "nospc_fatal": NOSPC_FATAL.load(Ordering::SeqCst),
        })
    }

    #[cfg(test)]
    pub fn reset_for_test() {
        let mut table = STATUS.lock().unwrap();
        *table = StatusTable::default();
        NOSPC_STALLED.store(0, Ordering::SeqCst);
        NOSPC_FATAL.store(false, Ordering::SeqCst);
    }
}

/// RAII handle removing the process entry when the owner is done.
pub struct ScopedProcess {
    client: String,
    id: u64,
}

impl ScopedProcess {
    pub fn new(client: &str, action: ProcessAction, details: String) -> Self {
        let id = ServerStatus::start_process(client, action, details);
        Self {
            client: client.to_string(),
            id,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> &str {
        &self.client
    }
}

impl Drop for ScopedProcess {
    fn drop(&mut self) {
        ServerStatus::stop_process(&self.client, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_lifecycle() {
        ServerStatus::reset_for_test();

        let id = ServerStatus::start_process("alpha", ProcessAction::FullImage, "C".into());
        ServerStatus::set_process_pcdone("alpha", id, 42);
        ServerStatus::set_online("alpha", true);

        let status = ServerStatus::status_json();
        let client = &status["clients"]["alpha"];
        assert_eq!(client["online"], true);
        assert_eq!(client["processes"][0]["pcdone"], 42);
        assert_eq!(client["processes"][0]["action"], "full_image");

        ServerStatus::stop_process("alpha", id);
        let status = ServerStatus::status_json();
        assert_eq!(status["clients"]["alpha"]["processes"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn stop_flag_round_trip() {
        ServerStatus::reset_for_test();
        assert!(!ServerStatus::is_backup_stopped("beta"));
        ServerStatus::stop_backup("beta");
        assert!(ServerStatus::is_backup_stopped("beta"));
        ServerStatus::clear_stopped("beta");
        assert!(!ServerStatus::is_backup_stopped("beta"));
    }

    #[test]
    fn scoped_process_removes_itself() {
        ServerStatus::reset_for_test();
        {
            let _proc = ScopedProcess::new("gamma", ProcessAction::NightlyCleanup, String::new());
            let status = ServerStatus::status_json();
            assert_eq!(
                status["clients"]["gamma"]["processes"][0]["action"],
                "nightly_cleanup"
            );
        }
        let status = ServerStatus::status_json();
        assert_eq!(
            status["clients"]["gamma"]["processes"].as_array().unwrap().len(),
            0
        );
    }
}
