pub mod balancer;

use crate::logging::queue::LogQueue;
use crate::plan::process_id::ProcessId;
use crate::plan::ProcessSpec;
use crate::supervisor::{NotStartedSupervisor, StartedSupervisor};
use balancer::{FrontEnd, Replica};
use std::net::TcpListener;
use tracing::{info, warn};

/// 0-based replica index within the cluster.
pub const ENV_CLUSTER_INSTANCE: &str = "PUP_CLUSTER_INSTANCE";
/// Total number of replicas.
pub const ENV_CLUSTER_SIZE: &str = "PUP_CLUSTER_SIZE";
/// Backend port this replica is expected to listen on.
pub const ENV_CLUSTER_PORT: &str = "PUP_CLUSTER_PORT";

/// N supervisors presenting one logical process. When the spec carries a
/// front-end declaration, incoming connections are balanced across the
/// replicas that are RUNNING at dispatch time.
pub struct Cluster {
    id: ProcessId,
    supervisors: Vec<StartedSupervisor>,
    front_end: Option<FrontEnd>,
}

impl Cluster {
    pub fn start(spec: ProcessSpec, log_queue: &LogQueue) -> Self {
        let id = spec.id.clone();
        let size = spec.instances;

        let mut supervisors = Vec::with_capacity(size as usize);
        for index in 0..size {
            let mut replica = spec.clone();
            replica.id = spec.id.replica(index);
            replica
                .env
                .insert(ENV_CLUSTER_INSTANCE.to_string(), index.to_string());
            replica
                .env
                .insert(ENV_CLUSTER_SIZE.to_string(), size.to_string());
            if let Some(balancer) = &spec.balancer {
                replica.env.insert(
                    ENV_CLUSTER_PORT.to_string(),
                    (balancer.start_port + index as u16).to_string(),
                );
            }
            supervisors.push(NotStartedSupervisor::new(replica, log_queue.clone()).start());
        }

        let front_end = spec.balancer.as_ref().and_then(|balancer| {
            let replicas = supervisors
                .iter()
                .enumerate()
                .map(|(index, supervisor)| {
                    Replica::new(
                        supervisor.status_cell(),
                        std::net::SocketAddr::from((
                            [127, 0, 0, 1],
                            balancer.start_port + index as u16,
                        )),
                    )
                })
                .collect();
            match TcpListener::bind(("127.0.0.1", balancer.port)) {
                Ok(listener) => {
                    match balancer::spawn_front_end(&id, listener, balancer.strategy, replicas) {
                        Ok(front_end) => {
                            info!(
                                process_id = %id,
                                port = balancer.port,
                                path = %balancer.path,
                                "load-balancing front-end listening"
                            );
                            Some(front_end)
                        }
                        Err(err) => {
                            warn!(process_id = %id, %err, "front-end disabled");
                            None
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        process_id = %id,
                        port = balancer.port,
                        %err,
                        "could not bind front-end; load balancing disabled"
                    );
                    None
                }
            }
        });

        Self {
            id,
            supervisors,
            front_end,
        }
    }

    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn supervisors(&self) -> &[StartedSupervisor] {
        &self.supervisors
    }

    pub fn into_parts(self) -> (Vec<StartedSupervisor>, Option<FrontEnd>) {
        (self.supervisors, self.front_end)
    }
}
