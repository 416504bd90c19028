use crate::plan::process_id::ProcessId;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::sync::{Arc, Condvar, Mutex};
use tracing::warn;

/// Per-stream buffering budget. Readers never block the child on a slow
/// sink: once a stream exceeds this, its oldest buffered lines are dropped.
pub const STREAM_BUFFER_LIMIT_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// One captured child output line, tagged with the instant it was read.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub id: ProcessId,
    pub stream: StreamKind,
    pub at: DateTime<Utc>,
    pub line: String,
}

type StreamKey = (ProcessId, StreamKind);

#[derive(Default)]
struct QueueState {
    entries: VecDeque<LogLine>,
    stream_bytes: HashMap<StreamKey, usize>,
    overflowed: HashSet<StreamKey>,
    closed: bool,
}

/// The shared buffer between child output pumps and the single log writer
/// task. Pushes never block; pops block until a line or close arrives.
#[derive(Clone, Default)]
pub struct LogQueue {
    inner: Arc<(Mutex<QueueState>, Condvar)>,
}

impl LogQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: LogLine) {
        let (state, ready) = &*self.inner;
        let mut state = state.lock().expect("log queue lock poisoned");
        if state.closed {
            return;
        }

        let key = (line.id.clone(), line.stream);
        let incoming = line.line.len();

        while state.stream_bytes.get(&key).copied().unwrap_or(0) + incoming
            > STREAM_BUFFER_LIMIT_BYTES
        {
            let Some(oldest) = state
                .entries
                .iter()
                .position(|l| l.id == key.0 && l.stream == key.1)
            else {
                break;
            };
            let dropped = state.entries.remove(oldest).expect("position just found");
            let bytes = state.stream_bytes.entry(key.clone()).or_default();
            *bytes = bytes.saturating_sub(dropped.line.len());
            if state.overflowed.insert(key.clone()) {
                warn!(
                    process_id = %key.0,
                    stream = %key.1,
                    "log-overflow: sink is slow, dropping oldest buffered lines"
                );
            }
        }

        *state.stream_bytes.entry(key).or_default() += incoming;
        state.entries.push_back(line);
        ready.notify_one();
    }

    /// Blocks for the next line. Returns `None` only once the queue is closed
    /// and fully drained.
    pub fn pop(&self) -> Option<LogLine> {
        let (state, ready) = &*self.inner;
        let mut state = state.lock().expect("log queue lock poisoned");
        loop {
            if let Some(line) = state.entries.pop_front() {
                let key = (line.id.clone(), line.stream);
                let remaining = {
                    let bytes = state.stream_bytes.entry(key.clone()).or_default();
                    *bytes = bytes.saturating_sub(line.line.len());
                    *bytes
                };
                if remaining == 0 {
                    // The overflow episode is over; a later one warns again.
                    state.overflowed.remove(&key);
                }
                return Some(line);
            }
            if state.closed {
                return None;
            }
            state = ready.wait(state).expect("log queue lock poisoned");
        }
    }

    /// Non-blocking variant of [`LogQueue::pop`] with a bounded wait, for
    /// callers that poll instead of parking forever.
    pub fn pop_timeout(&self, timeout: std::time::Duration) -> Option<LogLine> {
        let (state, ready) = &*self.inner;
        let deadline = std::time::Instant::now() + timeout;
        let mut state = state.lock().expect("log queue lock poisoned");
        loop {
            if let Some(line) = state.entries.pop_front() {
                let key = (line.id.clone(), line.stream);
                let remaining = {
                    let bytes = state.stream_bytes.entry(key.clone()).or_default();
                    *bytes = bytes.saturating_sub(line.line.len());
                    *bytes
                };
                if remaining == 0 {
                    state.overflowed.remove(&key);
                }
                return Some(line);
            }
            if state.closed {
                return None;
            }
            let wait = deadline.saturating_duration_since(std::time::Instant::now());
            if wait.is_zero() {
                return None;
            }
            let (next, timed_out) = ready
                .wait_timeout(state, wait)
                .expect("log queue lock poisoned");
            state = next;
            if timed_out.timed_out() && state.entries.is_empty() {
                return None;
            }
        }
    }

    pub fn close(&self) {
        let (state, ready) = &*self.inner;
        state.lock().expect("log queue lock poisoned").closed = true;
        ready.notify_all();
    }
}
