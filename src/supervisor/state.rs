use crate::plan::process_id::ProcessId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Display;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};

/// Where a supervisor currently sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Blocked,
    Failed,
    Finished,
}

impl Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessState::Created => "created",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
            ProcessState::Blocked => "blocked",
            ProcessState::Failed => "failed",
            ProcessState::Finished => "finished",
        };
        write!(f, "{name}")
    }
}

/// How the last child ended. On Unix a signal-terminated child carries the
/// signal number and no code.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitRecord {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub at: DateTime<Utc>,
}

impl ExitRecord {
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: exit_signal(status),
            at: Utc::now(),
        }
    }

    /// A spawn that never produced a child. Treated like an erroneous exit by
    /// the restart policy.
    pub fn spawn_failure() -> Self {
        Self {
            code: None,
            signal: None,
            at: Utc::now(),
        }
    }

    /// Anything but a plain zero exit counts as an error, signals included.
    pub fn is_error(&self) -> bool {
        self.code != Some(0)
    }
}

#[cfg(target_family = "unix")]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(target_family = "unix"))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

/// Point-in-time view of one supervisor, as reported over the status bus.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub id: ProcessId,
    pub state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<ExitRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cron_fire: Option<DateTime<Utc>>,
}

/// Shared view of a supervisor's status. The owning actor writes it
/// synchronously on every transition; the controller, the cluster balancer
/// and the status command read it.
#[derive(Clone)]
pub struct StatusCell(Arc<Mutex<StatusSnapshot>>);

impl StatusCell {
    pub fn new(id: ProcessId) -> Self {
        Self(Arc::new(Mutex::new(StatusSnapshot {
            id,
            state: ProcessState::Created,
            pid: None,
            restarts: 0,
            last_exit: None,
            next_cron_fire: None,
        })))
    }

    pub fn state(&self) -> ProcessState {
        self.0.lock().expect("status cell lock poisoned").state
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.0.lock().expect("status cell lock poisoned").clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        f(&mut self.0.lock().expect("status cell lock poisoned"))
    }
}
