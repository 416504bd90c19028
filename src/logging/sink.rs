use super::queue::{LogLine, LogQueue, StreamKind};
use crate::utils::threads::spawn_named_thread;
use std::thread::JoinHandle;
use tracing::{debug, info};

/// Destination of captured child output. Implementations run on the single
/// writer thread, so a sink may keep mutable state without locking.
pub trait LogSink: Send + 'static {
    fn write(&mut self, line: &LogLine);
}

/// Forwards child output into the tracing pipeline, which fans it out to the
/// console and the optional file layer. Stdout is informational; stderr is
/// kept at debug like any other diagnostic chatter.
#[derive(Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&mut self, line: &LogLine) {
        match line.stream {
            StreamKind::Stdout => {
                info!(process_id = %line.id, at = %line.at.to_rfc3339(), "{}", line.line)
            }
            StreamKind::Stderr => {
                debug!(process_id = %line.id, at = %line.at.to_rfc3339(), "{}", line.line)
            }
        }
    }
}

/// The single writer task. All log writes are serialised through it to keep
/// lines atomic regardless of how many children are talking.
pub struct LogWriter {
    queue: LogQueue,
    handle: JoinHandle<()>,
}

impl LogWriter {
    pub fn spawn(queue: LogQueue, mut sink: Box<dyn LogSink>) -> Self {
        let consumer_queue = queue.clone();
        let handle = spawn_named_thread("log writer", move || {
            while let Some(line) = consumer_queue.pop() {
                sink.write(&line);
            }
        });
        Self { queue, handle }
    }

    /// Closes the queue and waits for the remaining lines to drain.
    pub fn stop(self) {
        self.queue.close();
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::process_id::ProcessId;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    struct CollectingSink(Arc<Mutex<Vec<String>>>);

    impl LogSink for CollectingSink {
        fn write(&mut self, line: &LogLine) {
            self.0.lock().unwrap().push(line.line.clone());
        }
    }

    #[test]
    fn writer_drains_the_queue_before_stopping() {
        let queue = LogQueue::new();
        let collected = Arc::new(Mutex::new(Vec::new()));
        let writer = LogWriter::spawn(queue.clone(), Box::new(CollectingSink(collected.clone())));

        for n in 0..10 {
            queue.push(LogLine {
                id: ProcessId::new("a").unwrap(),
                stream: StreamKind::Stdout,
                at: Utc::now(),
                line: format!("line {n}"),
            });
        }
        writer.stop();

        let collected = collected.lock().unwrap();
        assert_eq!(collected.len(), 10);
        assert_eq!(collected[0], "line 0");
        assert_eq!(collected[9], "line 9");
    }
}
