use crate::logging::queue::{LogLine, LogQueue, StreamKind};
use crate::plan::process_id::ProcessId;
use crate::utils::threads::spawn_named_thread;
use chrono::Utc;
use std::io::Read;
use std::thread::JoinHandle;

/// Lines longer than this are split here, without loss, so one misbehaving
/// child cannot make the log pipeline buffer unbounded single lines.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Reads a child output stream to EOF, splitting it into lines and handing
/// each to `on_line`. A trailing segment without a newline is still emitted.
pub fn pump_lines<R: Read>(mut reader: R, max_line: usize, mut on_line: impl FnMut(Vec<u8>)) {
    let mut buf = [0u8; 8192];
    let mut carry: Vec<u8> = Vec::new();
    // Set right after a forced split so the newline that terminated the
    // original line does not produce a spurious empty line.
    let mut split_pending = false;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        for &byte in &buf[..n] {
            if byte == b'\n' {
                if split_pending {
                    split_pending = false;
                    continue;
                }
                on_line(std::mem::take(&mut carry));
            } else {
                split_pending = false;
                carry.push(byte);
                if carry.len() >= max_line {
                    on_line(std::mem::take(&mut carry));
                    split_pending = true;
                }
            }
        }
    }
    if !carry.is_empty() {
        on_line(carry);
    }
}

/// Spawns the reader thread for one child stream; each line lands in the
/// shared log queue tagged with the instant it was read.
pub fn spawn_output_pump<R>(
    id: ProcessId,
    stream: StreamKind,
    reader: R,
    queue: LogQueue,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    let thread_name = format!("{id} {stream} pump");
    spawn_named_thread(thread_name, move || {
        pump_lines(reader, MAX_LINE_BYTES, |raw| {
            queue.push(LogLine {
                id: id.clone(),
                stream,
                at: Utc::now(),
                line: String::from_utf8_lossy(&raw).into_owned(),
            });
        });
    })
}
