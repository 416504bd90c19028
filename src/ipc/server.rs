use super::codec::{read_frame, write_frame};
use super::protocol::{Reply, Request, StatusResponse};
use crate::controller::{CommandOutcome, CommandRequest, OperatorCommand};
use crate::event::channel::EventPublisher;
use crate::plan::process_id::ProcessId;
use crate::utils::thread_context::{NotStartedThreadContext, StartedThreadContext};
use crate::utils::threads::spawn_named_thread;
use crossbeam::channel::bounded;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const COMMAND_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum BusError {
    #[error("another pup core is already running at `{0}`")]
    Conflict(PathBuf),

    #[error("could not bind the control socket `{path}`: {source}")]
    Bind { path: PathBuf, source: io::Error },
}

/// Subscribed child connections, keyed by the id they registered. Writers
/// are shared so relayed messages and command replies interleave without
/// tearing frames.
type RelayRegistry = Arc<Mutex<HashMap<String, Arc<Mutex<UnixStream>>>>>;

/// The local command/status endpoint. Operator commands are serialised into
/// the controller's queue; `subscribe`/`send` frames are relayed between
/// children without touching the controller.
pub struct BusServer {
    context: StartedThreadContext,
    socket_path: PathBuf,
}

impl BusServer {
    /// Binds the socket, refusing to start when another live core already
    /// owns it. A stale socket file (nothing listening) is cleaned up.
    pub fn start(
        socket_path: &Path,
        command_publisher: EventPublisher<CommandRequest>,
    ) -> Result<Self, BusError> {
        if socket_path.exists() {
            if UnixStream::connect(socket_path).is_ok() {
                return Err(BusError::Conflict(socket_path.to_path_buf()));
            }
            debug!(path = %socket_path.display(), "removing stale control socket");
            let _ = fs::remove_file(socket_path);
        }
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent).map_err(|source| BusError::Bind {
                path: socket_path.to_path_buf(),
                source,
            })?;
        }

        let listener = UnixListener::bind(socket_path).map_err(|source| BusError::Bind {
            path: socket_path.to_path_buf(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| BusError::Bind {
                path: socket_path.to_path_buf(),
                source,
            })?;

        let registry: RelayRegistry = Arc::new(Mutex::new(HashMap::new()));
        let context = NotStartedThreadContext::new("ipc bus", move |stop_consumer| loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    let publisher = command_publisher.clone();
                    let registry = registry.clone();
                    spawn_named_thread("ipc connection", move || {
                        if let Err(err) = handle_connection(stream, publisher, registry) {
                            debug!(%err, "bus connection closed with error");
                        }
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if stop_consumer.is_cancelled(ACCEPT_POLL_INTERVAL) {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "bus listener error");
                    break;
                }
            }
        })
        .start();

        Ok(Self {
            context,
            socket_path: socket_path.to_path_buf(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn stop(self) {
        if let Err(err) = self.context.stop() {
            warn!(%err, "error stopping the bus listener");
        }
        let _ = fs::remove_file(&self.socket_path);
    }
}

fn handle_connection(
    stream: UnixStream,
    command_publisher: EventPublisher<CommandRequest>,
    registry: RelayRegistry,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let writer = Arc::new(Mutex::new(stream.try_clone()?));
    let mut reader = stream;
    let mut subscription: Option<String> = None;

    let outcome = loop {
        let frame = match read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        let result = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => handle_request(
                request,
                &writer,
                &command_publisher,
                &registry,
                &mut subscription,
            ),
            Err(err) => send_reply(&writer, &Reply::error(format!("invalid request: {err}"))),
        };
        if let Err(err) = result {
            break Err(err);
        }
    };

    // Whatever ended the connection, its subscription must not outlive it.
    if let Some(id) = subscription {
        registry
            .lock()
            .expect("relay registry lock poisoned")
            .remove(&id);
    }
    outcome
}

fn handle_request(
    request: Request,
    writer: &Arc<Mutex<UnixStream>>,
    command_publisher: &EventPublisher<CommandRequest>,
    registry: &RelayRegistry,
    subscription: &mut Option<String>,
) -> io::Result<()> {
    match request {
        Request::Subscribe { id } => {
            registry
                .lock()
                .expect("relay registry lock poisoned")
                .insert(id.clone(), writer.clone());
            debug!(id = %id, "child subscribed to the bus");
            *subscription = Some(id);
            send_reply(writer, &Reply::Ok)
        }
        Request::Send { to, payload } => {
            let target = registry
                .lock()
                .expect("relay registry lock poisoned")
                .get(&to)
                .cloned();
            match target {
                Some(target) => {
                    let message = Reply::Message {
                        id: subscription.clone(),
                        payload,
                    };
                    match send_reply(&target, &message) {
                        Ok(()) => send_reply(writer, &Reply::Ok),
                        Err(err) => {
                            registry
                                .lock()
                                .expect("relay registry lock poisoned")
                                .remove(&to);
                            send_reply(
                                writer,
                                &Reply::error(format!("delivery to `{to}` failed: {err}")),
                            )
                        }
                    }
                }
                None => send_reply(writer, &Reply::error(format!("no subscriber for `{to}`"))),
            }
        }
        other => {
            let command = match operator_command(other) {
                Ok(command) => command,
                Err(message) => return send_reply(writer, &Reply::error(message)),
            };
            let (reply, outcome) = bounded(1);
            if command_publisher
                .publish(CommandRequest { command, reply })
                .is_err()
            {
                return send_reply(writer, &Reply::error("core is not accepting commands"));
            }
            match outcome.recv_timeout(COMMAND_REPLY_TIMEOUT) {
                Ok(CommandOutcome::Done) => send_reply(writer, &Reply::Ok),
                Ok(CommandOutcome::Failed(message)) => send_reply(writer, &Reply::error(message)),
                Ok(CommandOutcome::Status(processes)) => {
                    send_reply(writer, &StatusResponse { processes })
                }
                Err(_) => send_reply(writer, &Reply::error("command timed out")),
            }
        }
    }
}

/// Maps the wire command verbs onto controller commands. Relay verbs are
/// handled before this point.
fn operator_command(request: Request) -> Result<OperatorCommand, String> {
    let parse = |id: String| {
        ProcessId::try_from(id).map_err(|err| format!("invalid process id: {err}"))
    };
    match request {
        Request::Start { id } => Ok(OperatorCommand::Start(parse(id)?)),
        Request::Stop { id } => Ok(OperatorCommand::Stop(parse(id)?)),
        Request::Restart { id } => Ok(OperatorCommand::Restart(parse(id)?)),
        Request::Block { id } => Ok(OperatorCommand::Block(parse(id)?)),
        Request::Unblock { id } => Ok(OperatorCommand::Unblock(parse(id)?)),
        Request::Status => Ok(OperatorCommand::Status),
        Request::Terminate => Ok(OperatorCommand::Terminate),
        Request::Subscribe { .. } | Request::Send { .. } => {
            Err("relay verbs carry no operator command".to_string())
        }
    }
}

fn send_reply<T: Serialize>(writer: &Arc<Mutex<UnixStream>>, reply: &T) -> io::Result<()> {
    let payload = serde_json::to_vec(reply)?;
    let mut stream = writer.lock().expect("bus writer lock poisoned");
    write_frame(&mut *stream, &payload)
}
