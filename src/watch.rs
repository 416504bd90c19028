use crate::event::channel::EventPublisher;
use crate::utils::thread_context::{NotStartedThreadContext, StartedThreadContext};
use chrono::{DateTime, Utc};
use crossbeam::channel::{unbounded, RecvTimeoutError};
use crossbeam::select;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("could not create filesystem watcher: {0}")]
    Init(notify::Error),

    #[error("could not watch `{path}`: {source}")]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },
}

/// A debounced filesystem change. Raw notifications landing within the
/// debounce window coalesce into one event carrying the union of paths.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub paths: Vec<PathBuf>,
    pub at: DateTime<Utc>,
}

/// Starts watching `paths` and publishes one [`ChangeEvent`] per debounced
/// burst. Registration happens before the thread launches so a path that
/// cannot be watched fails the caller instead of dying silently in the
/// background.
pub fn spawn_path_watcher(
    name: &str,
    paths: &[PathBuf],
    debounce: Duration,
    publisher: EventPublisher<ChangeEvent>,
) -> Result<StartedThreadContext, WatchError> {
    let (raw_tx, raw_rx) = unbounded::<Event>();

    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = raw_tx.send(event);
            }
        })
        .map_err(WatchError::Init)?;

    for path in paths {
        watcher
            .watch(path, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Watch {
                path: path.clone(),
                source,
            })?;
    }

    let thread_name = format!("{name} path watcher");
    let started = NotStartedThreadContext::new(thread_name, move |stop_consumer| {
        // The watcher lives on this thread; dropping it closes raw_rx.
        let _watcher = watcher;
        loop {
            select! {
                recv(raw_rx) -> event => {
                    let event = match event {
                        Ok(event) if is_change(&event) => event,
                        Ok(_) => continue,
                        Err(_) => break,
                    };
                    let mut paths: BTreeSet<PathBuf> = event.paths.into_iter().collect();
                    coalesce_burst(&raw_rx, debounce, &mut paths);
                    let change = ChangeEvent {
                        paths: paths.into_iter().collect(),
                        at: Utc::now(),
                    };
                    debug!(paths = ?change.paths, "filesystem change detected");
                    if publisher.publish(change).is_err() {
                        break;
                    }
                },
                recv(stop_consumer.as_ref()) -> _ => break,
            }
        }
    })
    .start();

    Ok(started)
}

fn is_change(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Drains further raw notifications until the debounce window closes, folding
/// their paths into `paths`.
fn coalesce_burst(
    raw_rx: &crossbeam::channel::Receiver<Event>,
    debounce: Duration,
    paths: &mut BTreeSet<PathBuf>,
) {
    let deadline = Instant::now() + debounce;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        match raw_rx.recv_timeout(remaining) {
            Ok(event) if is_change(&event) => paths.extend(event.paths),
            Ok(_) => continue,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::channel::pub_sub;
    use std::fs;

    const TEST_DEBOUNCE: Duration = Duration::from_millis(200);

    #[test]
    fn burst_of_writes_coalesces_into_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let (publisher, consumer) = pub_sub();

        let watcher = spawn_path_watcher(
            "test",
            &[dir.path().to_path_buf()],
            TEST_DEBOUNCE,
            publisher,
        )
        .unwrap();

        fs::write(dir.path().join("a"), b"1").unwrap();
        fs::write(dir.path().join("b"), b"2").unwrap();

        consumer.recv_timeout(Duration::from_secs(5)).unwrap();
        // The burst produced exactly one event; nothing else is pending once
        // the window has passed.
        assert!(consumer.recv_timeout(TEST_DEBOUNCE * 2).is_err());

        watcher.stop_blocking().unwrap();
    }

    #[test]
    fn later_change_produces_a_second_event() {
        let dir = tempfile::tempdir().unwrap();
        let (publisher, consumer) = pub_sub();

        let watcher = spawn_path_watcher(
            "test",
            &[dir.path().to_path_buf()],
            TEST_DEBOUNCE,
            publisher,
        )
        .unwrap();

        fs::write(dir.path().join("a"), b"1").unwrap();
        consumer.recv_timeout(Duration::from_secs(5)).unwrap();

        std::thread::sleep(TEST_DEBOUNCE * 2);
        fs::write(dir.path().join("a"), b"2").unwrap();
        consumer.recv_timeout(Duration::from_secs(5)).unwrap();

        watcher.stop_blocking().unwrap();
    }

    #[test]
    fn missing_path_fails_the_start() {
        let (publisher, _consumer) = pub_sub();
        let result = spawn_path_watcher(
            "test",
            &[PathBuf::from("/definitely/not/a/real/path")],
            TEST_DEBOUNCE,
            publisher,
        );
        assert!(matches!(result, Err(WatchError::Watch { .. })));
    }
}
