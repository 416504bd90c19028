use super::SpawnError;
use crate::plan::process_id::ProcessId;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};

////////////////////////////////////////////////////////////////////////////////////
// States for Started / Not Started Command
////////////////////////////////////////////////////////////////////////////////////

/// A child command that has been assembled but not spawned. `argv[0]` is the
/// executable; stdout and stderr are piped so the supervisor can capture them
/// line-wise, stdin is closed.
pub struct CommandNotStarted {
    id: ProcessId,
    bin: String,
    cmd: Command,
}

pub struct CommandStarted {
    id: ProcessId,
    process: Child,
}

impl CommandNotStarted {
    pub fn new(id: ProcessId, argv: &[String], cwd: &Path, env: &HashMap<String, String>) -> Self {
        let bin = argv[0].clone();
        let mut cmd = Command::new(&bin);
        cmd.args(&argv[1..])
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        Self { id, bin, cmd }
    }

    pub fn start(mut self) -> Result<CommandStarted, SpawnError> {
        let process = self.cmd.spawn().map_err(|source| SpawnError::Launch {
            bin: self.bin.clone(),
            source,
        })?;
        Ok(CommandStarted {
            id: self.id,
            process,
        })
    }
}

impl CommandStarted {
    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn get_pid(&self) -> u32 {
        self.process.id()
    }

    /// Detaches the output pipes for the line pumps. Callable once.
    pub fn take_output(&mut self) -> Result<(ChildStdout, ChildStderr), SpawnError> {
        let stdout = self
            .process
            .stdout
            .take()
            .ok_or(SpawnError::StreamPipe("stdout"))?;
        let stderr = self
            .process
            .stderr
            .take()
            .ok_or(SpawnError::StreamPipe("stderr"))?;
        Ok((stdout, stderr))
    }

    /// Blocks until the child exits. Never cancels; callers that need to stop
    /// the child first signal it through its pid.
    pub fn wait(mut self) -> io::Result<ExitStatus> {
        self.process.wait()
    }
}
