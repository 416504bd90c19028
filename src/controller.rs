use crate::cluster::Cluster;
use crate::event::channel::EventConsumer;
use crate::event::ApplicationEvent;
use crate::logging::queue::LogQueue;
use crate::logging::sink::{LogWriter, TracingSink};
use crate::plan::process_id::ProcessId;
use crate::plan::Plan;
use crate::supervisor::message::SupervisorMsg;
use crate::supervisor::state::StatusSnapshot;
use crate::supervisor::{NotStartedSupervisor, StartedSupervisor};
use crossbeam::channel::{RecvTimeoutError, Sender};
use crossbeam::select;
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Path of the control socket, injected into every child.
pub const ENV_IPC: &str = "PUP_IPC";

/// Slack added on top of the largest `terminateTimeoutMs` before leftovers
/// are force-killed.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const JOIN_GRACE: Duration = Duration::from_secs(2);

/// An operator command as routed by the root controller.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Start(ProcessId),
    Stop(ProcessId),
    Restart(ProcessId),
    Block(ProcessId),
    Unblock(ProcessId),
    Status,
    Terminate,
}

#[derive(Debug)]
pub enum CommandOutcome {
    Done,
    Failed(String),
    Status(Vec<StatusSnapshot>),
}

/// A command paired with its reply channel; the bus enqueues these into the
/// controller's serial loop.
#[derive(Debug)]
pub struct CommandRequest {
    pub command: OperatorCommand,
    pub reply: Sender<CommandOutcome>,
}

impl CommandRequest {
    fn respond(&self, outcome: CommandOutcome) {
        let _ = self.reply.send(outcome);
    }
}

enum Unit {
    Single(StartedSupervisor),
    Cluster(Cluster),
}

/// The root controller: owns every supervisor built from the plan, routes
/// operator commands and drives the global shutdown.
pub struct Pup {
    max_terminate_timeout: Duration,
    units: Vec<Unit>,
    log_writer: LogWriter,
}

impl Pup {
    /// Builds one supervisor per declared process (or a cluster of them for
    /// `instances > 1`) and starts their trigger tasks. Autostart processes
    /// begin launching immediately.
    pub fn new(plan: &Plan) -> Self {
        let log_queue = LogQueue::new();
        let log_writer = LogWriter::spawn(log_queue.clone(), Box::new(TracingSink));

        let mut units = Vec::with_capacity(plan.processes.len());
        for spec in &plan.processes {
            let mut spec = spec.clone();
            spec.env
                .insert(ENV_IPC.to_string(), plan.socket_path.display().to_string());
            if spec.instances > 1 {
                units.push(Unit::Cluster(Cluster::start(spec, &log_queue)));
            } else {
                units.push(Unit::Single(
                    NotStartedSupervisor::new(spec, log_queue.clone()).start(),
                ));
            }
        }
        info!(processes = units.len(), "supervisors started");

        Self {
            max_terminate_timeout: Duration::from_millis(plan.max_terminate_timeout_ms()),
            units,
            log_writer,
        }
    }

    fn all_supervisors(&self) -> impl Iterator<Item = &StartedSupervisor> {
        self.units.iter().flat_map(|unit| match unit {
            Unit::Single(supervisor) => std::slice::from_ref(supervisor).iter(),
            Unit::Cluster(cluster) => cluster.supervisors().iter(),
        })
    }

    /// Resolves a command target: an exact supervisor id, or a logical
    /// cluster id fanning out to every replica.
    fn find(&self, id: &ProcessId) -> Vec<&StartedSupervisor> {
        for unit in &self.units {
            match unit {
                Unit::Single(supervisor) if supervisor.id() == id => return vec![supervisor],
                Unit::Cluster(cluster) if cluster.id() == id => {
                    return cluster.supervisors().iter().collect()
                }
                Unit::Cluster(cluster) => {
                    if let Some(replica) =
                        cluster.supervisors().iter().find(|s| s.id() == id)
                    {
                        return vec![replica];
                    }
                }
                _ => {}
            }
        }
        Vec::new()
    }

    pub fn status(&self) -> Vec<StatusSnapshot> {
        self.all_supervisors().map(|s| s.status()).collect()
    }

    /// Serves operator commands until a terminate (or an application stop
    /// event) arrives, then runs the global shutdown.
    pub fn run(
        self,
        commands: EventConsumer<CommandRequest>,
        application_events: EventConsumer<ApplicationEvent>,
    ) {
        info!("pup core running");
        loop {
            select! {
                recv(commands.as_ref()) -> request => match request {
                    Ok(request) => {
                        if !self.handle_command(&request) {
                            break;
                        }
                    }
                    Err(_) => {
                        warn!("command channel closed; shutting down");
                        break;
                    }
                },
                recv(application_events.as_ref()) -> _ => {
                    info!("stop requested; shutting down");
                    break;
                },
            }
        }
        self.shutdown(commands);
    }

    /// Returns false when the command ends the run loop.
    fn handle_command(&self, request: &CommandRequest) -> bool {
        match &request.command {
            OperatorCommand::Status => {
                request.respond(CommandOutcome::Status(self.status()));
            }
            OperatorCommand::Terminate => {
                request.respond(CommandOutcome::Done);
                return false;
            }
            OperatorCommand::Start(id)
            | OperatorCommand::Stop(id)
            | OperatorCommand::Restart(id)
            | OperatorCommand::Block(id)
            | OperatorCommand::Unblock(id) => {
                let targets = self.find(id);
                if targets.is_empty() {
                    request.respond(CommandOutcome::Failed(format!("unknown process id `{id}`")));
                    return true;
                }
                for supervisor in targets {
                    let msg = match &request.command {
                        OperatorCommand::Start(_) => SupervisorMsg::Start {
                            reset_restarts: true,
                        },
                        OperatorCommand::Stop(_) => SupervisorMsg::Stop,
                        OperatorCommand::Restart(_) => SupervisorMsg::Restart,
                        OperatorCommand::Block(_) => SupervisorMsg::Block,
                        OperatorCommand::Unblock(_) => SupervisorMsg::Unblock,
                        _ => unreachable!("filtered above"),
                    };
                    if let Err(err) = supervisor.send(msg) {
                        warn!(process_id = %supervisor.id(), %err, "command not delivered");
                    }
                }
                request.respond(CommandOutcome::Done);
            }
        }
        true
    }

    /// Global shutdown: broadcast stop to every supervisor, wait up to the
    /// plan's largest stop window, force-kill the rest. A second terminate
    /// arriving meanwhile short-circuits straight to the force-kill.
    fn shutdown(self, commands: EventConsumer<CommandRequest>) {
        info!("stopping all processes");
        for supervisor in self.all_supervisors() {
            supervisor.begin_shutdown();
        }

        let deadline = Instant::now() + self.max_terminate_timeout + SHUTDOWN_GRACE;
        let mut force_killed = false;
        let mut commands_open = true;
        while Instant::now() < deadline && !self.all_finished() {
            if !commands_open {
                sleep(SHUTDOWN_POLL_INTERVAL);
                continue;
            }
            match commands.recv_timeout(SHUTDOWN_POLL_INTERVAL) {
                Ok(request) => {
                    if request.command == OperatorCommand::Terminate {
                        if !force_killed {
                            warn!("second terminate received; force-killing all processes");
                            self.force_kill_all();
                            force_killed = true;
                        }
                        request.respond(CommandOutcome::Done);
                    } else {
                        request.respond(CommandOutcome::Failed(
                            "core is shutting down".to_string(),
                        ));
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => commands_open = false,
            }
        }

        if !self.all_finished() {
            self.force_kill_all();
        }

        let Pup {
            units, log_writer, ..
        } = self;
        for unit in units {
            match unit {
                Unit::Single(supervisor) => join_supervisor(supervisor),
                Unit::Cluster(cluster) => {
                    let (supervisors, front_end) = cluster.into_parts();
                    if let Some(front_end) = front_end {
                        front_end.stop();
                    }
                    for supervisor in supervisors {
                        join_supervisor(supervisor);
                    }
                }
            }
        }
        log_writer.stop();
        info!("pup core finished");
    }

    fn all_finished(&self) -> bool {
        self.all_supervisors().all(|s| s.is_finished())
    }

    fn force_kill_all(&self) {
        for supervisor in self.all_supervisors() {
            if !supervisor.is_finished() {
                supervisor.force_kill();
                // The kill resolves the pending exit; ask the actor again so
                // it leaves its loop promptly.
                supervisor.begin_shutdown();
            }
        }
    }
}

fn join_supervisor(supervisor: StartedSupervisor) {
    let id = supervisor.id().clone();
    if let Err(err) = supervisor.join(JOIN_GRACE) {
        error!(process_id = %id, %err, "supervisor did not stop cleanly");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::event::channel::{pub_sub, EventPublisher};
    use crate::supervisor::state::ProcessState;
    use std::fs;
    use std::thread;

    fn load_plan(contents: &str) -> Plan {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pup.json");
        fs::write(&path, contents).unwrap();
        // Leak the tempdir so child cwds stay valid for the test's duration.
        std::mem::forget(dir);
        Plan::load(&path).unwrap()
    }

    fn send(
        publisher: &EventPublisher<CommandRequest>,
        command: OperatorCommand,
    ) -> CommandOutcome {
        let (reply, outcome) = crossbeam::channel::bounded(1);
        publisher
            .publish(CommandRequest { command, reply })
            .unwrap();
        outcome.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn status_enumerates_every_replica() {
        let plan = load_plan(
            r#"{"processes":[
                {"id":"solo","cmd":["sleep","30"],"autostart":true},
                {"id":"multi","cmd":["sleep","30"],"instances":2}
            ]}"#,
        );
        let pup = Pup::new(&plan);
        let (command_publisher, command_consumer) = pub_sub();
        let (_app_publisher, app_consumer) = pub_sub();
        let core = thread::spawn(move || pup.run(command_consumer, app_consumer));

        let outcome = send(&command_publisher, OperatorCommand::Status);
        let CommandOutcome::Status(processes) = outcome else {
            panic!("expected a status response");
        };
        let ids: Vec<&str> = processes.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["solo", "multi-0", "multi-1"]);

        send(&command_publisher, OperatorCommand::Terminate);
        core.join().unwrap();
    }

    #[test]
    fn logical_id_commands_fan_out_to_replicas() {
        let plan = load_plan(
            r#"{"processes":[
                {"id":"multi","cmd":["sleep","30"],"autostart":true,"instances":2,
                 "terminateTimeoutMs":500}
            ]}"#,
        );
        let pup = Pup::new(&plan);
        let (command_publisher, command_consumer) = pub_sub();
        let (_app_publisher, app_consumer) = pub_sub();
        let core = thread::spawn(move || pup.run(command_consumer, app_consumer));

        // Wait for both replicas to run.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let CommandOutcome::Status(processes) =
                send(&command_publisher, OperatorCommand::Status)
            else {
                panic!("expected a status response");
            };
            if processes.iter().all(|p| p.state == ProcessState::Running) {
                break;
            }
            assert!(Instant::now() < deadline, "replicas never started");
            sleep(Duration::from_millis(20));
        }

        send(
            &command_publisher,
            OperatorCommand::Stop(ProcessId::new("multi").unwrap()),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let CommandOutcome::Status(processes) =
                send(&command_publisher, OperatorCommand::Status)
            else {
                panic!("expected a status response");
            };
            if processes.iter().all(|p| p.state == ProcessState::Stopped) {
                break;
            }
            assert!(Instant::now() < deadline, "replicas never stopped");
            sleep(Duration::from_millis(20));
        }

        send(&command_publisher, OperatorCommand::Terminate);
        core.join().unwrap();
    }

    #[test]
    fn unknown_ids_are_reported() {
        let plan = load_plan(r#"{"processes":[{"id":"a","cmd":["true"]}]}"#);
        let pup = Pup::new(&plan);
        let (command_publisher, command_consumer) = pub_sub();
        let (_app_publisher, app_consumer) = pub_sub();
        let core = thread::spawn(move || pup.run(command_consumer, app_consumer));

        let outcome = send(
            &command_publisher,
            OperatorCommand::Start(ProcessId::new("nope").unwrap()),
        );
        assert!(matches!(outcome, CommandOutcome::Failed(_)));

        send(&command_publisher, OperatorCommand::Terminate);
        core.join().unwrap();
    }

    #[test]
    fn application_stop_event_shuts_the_core_down() {
        let plan = load_plan(
            r#"{"processes":[{"id":"a","cmd":["sleep","30"],"autostart":true,
                "terminateTimeoutMs":500}]}"#,
        );
        let pup = Pup::new(&plan);
        let (_command_publisher, command_consumer) = pub_sub();
        let (app_publisher, app_consumer) = pub_sub();
        let core = thread::spawn(move || pup.run(command_consumer, app_consumer));

        sleep(Duration::from_millis(300));
        app_publisher.publish(ApplicationEvent::StopRequested).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !core.is_finished() {
            assert!(Instant::now() < deadline, "core did not shut down");
            sleep(Duration::from_millis(20));
        }
        core.join().unwrap();
    }
}
