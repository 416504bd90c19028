use crate::plan::process_id::ProcessId;
use crate::plan::BalancingStrategy;
use crate::supervisor::state::{ProcessState, StatusCell};
use crate::utils::thread_context::{NotStartedThreadContext, StartedThreadContext};
use crate::utils::threads::spawn_named_thread;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

const REFUSAL_RESPONSE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// One backend the front-end can dispatch to. Eligibility is decided at
/// dispatch time from the replica supervisor's published state.
pub struct Replica {
    cell: StatusCell,
    backend: SocketAddr,
    active: Arc<AtomicUsize>,
}

impl Replica {
    pub fn new(cell: StatusCell, backend: SocketAddr) -> Self {
        Self {
            cell,
            backend,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn is_dispatchable(&self) -> bool {
        self.cell.state() == ProcessState::Running
    }
}

/// The running front-end listener of one cluster.
pub struct FrontEnd {
    context: StartedThreadContext,
    local_addr: SocketAddr,
}

impl FrontEnd {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(self) {
        let name = self.context.thread_name().to_string();
        if let Err(err) = self.context.stop() {
            warn!("error stopping '{name}': {err}");
        }
    }
}

/// Accepts connections and proxies each to a RUNNING replica chosen by the
/// strategy. Replicas in any other state are skipped; with no eligible
/// replica the connection is refused with a 503.
pub fn spawn_front_end(
    id: &ProcessId,
    listener: TcpListener,
    strategy: BalancingStrategy,
    replicas: Vec<Replica>,
) -> io::Result<FrontEnd> {
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    let thread_name = format!("{id} front-end");
    let id = id.clone();

    let context = NotStartedThreadContext::new(thread_name, move |stop_consumer| {
        let mut cursor = 0usize;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(process_id = %id, %peer, "connection accepted");
                    dispatch(&id, stream, &replicas, strategy, &mut cursor);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if stop_consumer.is_cancelled(ACCEPT_POLL_INTERVAL) {
                        break;
                    }
                }
                Err(err) => {
                    error!(process_id = %id, %err, "front-end listener error");
                    break;
                }
            }
        }
    })
    .start();

    Ok(FrontEnd {
        context,
        local_addr,
    })
}

fn dispatch(
    id: &ProcessId,
    mut client: TcpStream,
    replicas: &[Replica],
    strategy: BalancingStrategy,
    cursor: &mut usize,
) {
    let order = candidate_order(replicas, strategy, *cursor);
    for index in order {
        let replica = &replicas[index];
        match TcpStream::connect_timeout(&replica.backend, BACKEND_CONNECT_TIMEOUT) {
            Ok(backend) => {
                *cursor = index + 1;
                debug!(process_id = %id, backend = %replica.backend, "dispatching connection");
                proxy(client, backend, replica.active.clone());
                return;
            }
            Err(err) => {
                debug!(process_id = %id, backend = %replica.backend, %err, "backend unreachable");
            }
        }
    }

    warn!(process_id = %id, "no running replica available; refusing connection");
    let _ = client.write_all(REFUSAL_RESPONSE);
    let _ = client.shutdown(Shutdown::Both);
}

/// Indices of dispatchable replicas in the order they should be tried.
fn candidate_order(
    replicas: &[Replica],
    strategy: BalancingStrategy,
    cursor: usize,
) -> Vec<usize> {
    let len = replicas.len();
    let mut order: Vec<usize> = match strategy {
        BalancingStrategy::RoundRobin => (0..len).map(|offset| (cursor + offset) % len).collect(),
        BalancingStrategy::LeastConnections => {
            let mut indices: Vec<usize> = (0..len).collect();
            indices.sort_by_key(|&i| replicas[i].active.load(Ordering::Relaxed));
            indices
        }
    };
    order.retain(|&i| replicas[i].is_dispatchable());
    order
}

/// Decrements the replica's active-connection count once both proxy
/// directions are done.
struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

fn proxy(client: TcpStream, backend: TcpStream, active: Arc<AtomicUsize>) {
    active.fetch_add(1, Ordering::Relaxed);
    let guard = Arc::new(ConnectionGuard(active));

    let (Ok(mut client_read), Ok(mut backend_write)) = (client.try_clone(), backend.try_clone())
    else {
        return;
    };
    let mut client_write = client;
    let mut backend_read = backend;

    let upstream_guard = guard.clone();
    spawn_named_thread("front-end upstream", move || {
        let _guard = upstream_guard;
        let _ = io::copy(&mut client_read, &mut backend_write);
        let _ = backend_write.shutdown(Shutdown::Write);
    });
    spawn_named_thread("front-end downstream", move || {
        let _guard = guard;
        let _ = io::copy(&mut backend_read, &mut client_write);
        let _ = client_write.shutdown(Shutdown::Write);
    });
}
