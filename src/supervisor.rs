pub mod message;
pub mod restart;
pub mod state;

use crate::cron::CronSchedule;
use crate::event::channel::{pub_sub, EventConsumer, EventPublisher, EventPublisherError};
use crate::logging::queue::{LogQueue, StreamKind};
use crate::plan::process_id::ProcessId;
use crate::plan::ProcessSpec;
use crate::runner::command::CommandNotStarted;
use crate::runner::output::spawn_output_pump;
use crate::runner::terminator::ProcessTerminator;
use crate::utils::thread_context::{NotStartedThreadContext, StartedThreadContext};
use crate::utils::threads::spawn_named_thread;
use crate::watch::{spawn_path_watcher, ChangeEvent, DEFAULT_DEBOUNCE};
use chrono::Utc;
use crossbeam::select;
use message::SupervisorMsg;
use restart::ExitDecision;
use state::{ExitRecord, ProcessState, StatusCell, StatusSnapshot};
use std::thread::{sleep, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Injected into every child so it can identify itself on the bus.
pub const ENV_PROCESS_ID: &str = "PUP_PROCESS_ID";

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);
const STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("supervisor `{0}` did not stop in time")]
    StopTimeout(ProcessId),
}

/// A declared process whose controller task hasn't been launched yet.
pub struct NotStartedSupervisor {
    spec: ProcessSpec,
    log_queue: LogQueue,
}

/// The running per-process controller: a serial actor thread owning the state
/// machine, plus the trigger tasks feeding its queue.
pub struct StartedSupervisor {
    id: ProcessId,
    terminate_timeout: Duration,
    publisher: EventPublisher<SupervisorMsg>,
    cell: StatusCell,
    trigger_contexts: Vec<StartedThreadContext>,
    actor_handle: JoinHandle<()>,
}

impl NotStartedSupervisor {
    pub fn new(spec: ProcessSpec, log_queue: LogQueue) -> Self {
        Self { spec, log_queue }
    }

    pub fn start(self) -> StartedSupervisor {
        let id = self.spec.id.clone();
        let terminate_timeout = Duration::from_millis(self.spec.terminate_timeout_ms);
        let (publisher, consumer) = pub_sub::<SupervisorMsg>();
        let cell = StatusCell::new(id.clone());

        let mut trigger_contexts = Vec::new();
        if let Some(schedule) = self.spec.cron.clone() {
            trigger_contexts.push(spawn_cron_ticker(
                &id,
                schedule,
                publisher.clone(),
                cell.clone(),
            ));
        }
        if !self.spec.watch.is_empty() {
            let (change_publisher, change_consumer) = pub_sub::<ChangeEvent>();
            match spawn_path_watcher(&id, &self.spec.watch, DEFAULT_DEBOUNCE, change_publisher) {
                Ok(watcher) => {
                    trigger_contexts.push(watcher);
                    trigger_contexts.push(spawn_watch_forwarder(
                        &id,
                        change_consumer,
                        publisher.clone(),
                    ));
                }
                Err(err) => {
                    warn!(process_id = %id, %err, "watch trigger disabled");
                }
            }
        }

        let autostart = self.spec.autostart;
        let actor = SupervisorActor::new(
            self.spec,
            cell.clone(),
            publisher.clone(),
            self.log_queue,
        );
        let actor_handle =
            spawn_named_thread(format!("{id} supervisor"), move || actor.run(consumer));

        if autostart {
            let _ = publisher.publish(SupervisorMsg::Start {
                reset_restarts: true,
            });
        }

        StartedSupervisor {
            id,
            terminate_timeout,
            publisher,
            cell,
            trigger_contexts,
            actor_handle,
        }
    }
}

impl StartedSupervisor {
    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn state(&self) -> ProcessState {
        self.cell.state()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.cell.snapshot()
    }

    /// Shared status view for the cluster balancer and the status command.
    pub fn status_cell(&self) -> StatusCell {
        self.cell.clone()
    }

    /// Enqueues a trigger. Fails only once the actor is gone.
    pub fn send(&self, msg: SupervisorMsg) -> Result<(), EventPublisherError> {
        self.publisher.publish(msg)
    }

    /// Asks the actor to stop its child and finish. Does not block.
    pub fn begin_shutdown(&self) {
        let _ = self.publisher.publish(SupervisorMsg::Shutdown);
    }

    pub fn is_finished(&self) -> bool {
        self.actor_handle.is_finished()
    }

    /// SIGKILLs whatever child is still recorded. Used when the graceful
    /// shutdown window has passed.
    pub fn force_kill(&self) {
        if let Some(pid) = self.cell.snapshot().pid {
            warn!(process_id = %self.id, pid, "force-killing process");
            let _ = ProcessTerminator::new(pid).kill();
        }
    }

    /// Graceful stop: shutdown, wait for the child within its stop window,
    /// force-kill past it. Consumes the supervisor.
    pub fn stop(self) -> Result<(), SupervisorError> {
        self.begin_shutdown();
        let deadline = Instant::now() + self.terminate_timeout + STOP_GRACE;
        while !self.actor_handle.is_finished() && Instant::now() < deadline {
            sleep(STOP_POLL_INTERVAL);
        }
        if !self.actor_handle.is_finished() {
            self.force_kill();
        }
        self.join(STOP_GRACE)
    }

    /// Stops the trigger tasks and joins the actor thread, waiting at most
    /// `grace` for it.
    pub fn join(self, grace: Duration) -> Result<(), SupervisorError> {
        for context in self.trigger_contexts {
            let name = context.thread_name().to_string();
            if let Err(err) = context.stop() {
                warn!(process_id = %self.id, "error stopping '{name}': {err}");
            }
        }
        let deadline = Instant::now() + grace;
        while !self.actor_handle.is_finished() {
            if Instant::now() >= deadline {
                return Err(SupervisorError::StopTimeout(self.id));
            }
            sleep(STOP_POLL_INTERVAL);
        }
        let _ = self.actor_handle.join();
        Ok(())
    }
}

/// Sleeps until each upcoming fire instant and enqueues a cron trigger,
/// keeping `nextCronFire` in the status view current. Evaluation itself is
/// pure ([`CronSchedule::next_after`]); this is only the ticking shell.
fn spawn_cron_ticker(
    id: &ProcessId,
    schedule: CronSchedule,
    publisher: EventPublisher<SupervisorMsg>,
    cell: StatusCell,
) -> StartedThreadContext {
    let thread_name = format!("{id} cron ticker");
    let id = id.clone();
    NotStartedThreadContext::new(thread_name, move |stop_consumer| {
        loop {
            let now = Utc::now();
            let Some(next) = schedule.next_after(now) else {
                debug!(process_id = %id, expr = schedule.source(), "cron schedule has no upcoming fire; trigger inactive");
                break;
            };
            cell.update(|s| s.next_cron_fire = Some(next));
            let delay = (next - now).to_std().unwrap_or_default();
            if stop_consumer.is_cancelled(delay) {
                break;
            }
            if publisher.publish(SupervisorMsg::CronFired).is_err() {
                break;
            }
        }
        cell.update(|s| s.next_cron_fire = None);
    })
    .start()
}

/// Maps debounced filesystem changes onto the supervisor queue.
fn spawn_watch_forwarder(
    id: &ProcessId,
    changes: EventConsumer<ChangeEvent>,
    publisher: EventPublisher<SupervisorMsg>,
) -> StartedThreadContext {
    let thread_name = format!("{id} watch trigger");
    NotStartedThreadContext::new(thread_name, move |stop_consumer| loop {
        select! {
            recv(changes.as_ref()) -> event => {
                if event.is_err() || publisher.publish(SupervisorMsg::PathChanged).is_err() {
                    break;
                }
            },
            recv(stop_consumer.as_ref()) -> _ => break,
        }
    })
    .start()
}

/// What to do once a deliberate stop completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterStop {
    Remain,
    Respawn,
}

struct LiveChild {
    pid: u32,
    token: u64,
}

/// The serial state machine. All mutation happens on the actor thread, in
/// message arrival order; the only shared piece is the status cell, written
/// synchronously on every transition.
struct SupervisorActor {
    spec: ProcessSpec,
    cell: StatusCell,
    self_publisher: EventPublisher<SupervisorMsg>,
    log_queue: LogQueue,
    state: ProcessState,
    blocked: bool,
    resume_state: ProcessState,
    restarts: u32,
    child: Option<LiveChild>,
    child_tokens: u64,
    delay_tokens: u64,
    pending_restart: Option<u64>,
    after_stop: AfterStop,
    shutting_down: bool,
}

impl SupervisorActor {
    fn new(
        spec: ProcessSpec,
        cell: StatusCell,
        self_publisher: EventPublisher<SupervisorMsg>,
        log_queue: LogQueue,
    ) -> Self {
        Self {
            spec,
            cell,
            self_publisher,
            log_queue,
            state: ProcessState::Created,
            blocked: false,
            resume_state: ProcessState::Created,
            restarts: 0,
            child: None,
            child_tokens: 0,
            delay_tokens: 0,
            pending_restart: None,
            after_stop: AfterStop::Remain,
            shutting_down: false,
        }
    }

    fn run(mut self, inbox: EventConsumer<SupervisorMsg>) {
        while let Ok(msg) = inbox.recv() {
            if !self.handle(msg) {
                break;
            }
        }
        debug!(process_id = %self.spec.id, "supervisor finished");
    }

    /// Returns false once the actor is done for good.
    fn handle(&mut self, msg: SupervisorMsg) -> bool {
        if self.blocked && (msg.is_trigger() || matches!(msg, SupervisorMsg::Block)) {
            debug!(process_id = %self.spec.id, ?msg, "trigger dropped while blocked");
            return true;
        }
        match msg {
            SupervisorMsg::Start { reset_restarts } => self.on_start(reset_restarts),
            SupervisorMsg::Stop => self.on_stop(),
            SupervisorMsg::Restart => self.on_restart(),
            SupervisorMsg::Block => self.on_block(),
            SupervisorMsg::Unblock => self.on_unblock(),
            SupervisorMsg::CronFired => self.on_cron_fired(),
            SupervisorMsg::PathChanged => self.on_path_changed(),
            SupervisorMsg::ChildExited { token, exit } => return self.on_child_exited(token, exit),
            SupervisorMsg::RestartDelayElapsed { token } => self.on_delay_elapsed(token),
            SupervisorMsg::StopDeadline { token } => self.on_stop_deadline(token),
            SupervisorMsg::Shutdown => return self.on_shutdown(),
        }
        true
    }

    /// The state as the policy evaluators see it: while blocked, the saved
    /// state keeps evolving underneath the visible BLOCKED.
    fn current(&self) -> ProcessState {
        if self.blocked {
            self.resume_state
        } else {
            self.state
        }
    }

    fn transition(&mut self, next: ProcessState) {
        if self.blocked {
            self.resume_state = next;
        } else {
            self.state = next;
            self.cell.update(|s| s.state = next);
        }
    }

    fn set_restarts(&mut self, restarts: u32) {
        self.restarts = restarts;
        self.cell.update(|s| s.restarts = restarts);
    }

    fn on_start(&mut self, reset_restarts: bool) {
        if self.shutting_down {
            return;
        }
        match self.current() {
            ProcessState::Created
            | ProcessState::Stopped
            | ProcessState::Failed
            | ProcessState::Finished => {
                self.cancel_pending_restart();
                if reset_restarts {
                    self.set_restarts(0);
                }
                self.spawn_child();
            }
            state => debug!(process_id = %self.spec.id, %state, "start ignored"),
        }
    }

    fn on_stop(&mut self) {
        match self.current() {
            ProcessState::Running => self.begin_stop(AfterStop::Remain),
            ProcessState::Stopping => {
                // A stop while already stopping cancels a pending respawn.
                self.after_stop = AfterStop::Remain;
            }
            ProcessState::Stopped if self.pending_restart.is_some() => {
                debug!(process_id = %self.spec.id, "stop cancels the pending restart");
                self.cancel_pending_restart();
            }
            state => debug!(process_id = %self.spec.id, %state, "stop ignored"),
        }
    }

    fn on_restart(&mut self) {
        if self.shutting_down {
            return;
        }
        match self.current() {
            ProcessState::Running => self.begin_stop(AfterStop::Respawn),
            ProcessState::Created
            | ProcessState::Stopped
            | ProcessState::Failed
            | ProcessState::Finished => {
                self.cancel_pending_restart();
                self.set_restarts(0);
                self.spawn_child();
            }
            state => debug!(process_id = %self.spec.id, %state, "restart ignored"),
        }
    }

    fn on_block(&mut self) {
        self.cancel_pending_restart();
        self.resume_state = self.state;
        self.blocked = true;
        self.state = ProcessState::Blocked;
        self.cell.update(|s| s.state = ProcessState::Blocked);
        info!(process_id = %self.spec.id, "supervisor blocked; triggers are dropped");
    }

    fn on_unblock(&mut self) {
        if !self.blocked {
            return;
        }
        self.blocked = false;
        let next = if self.child.is_some() {
            self.resume_state
        } else {
            match self.resume_state {
                // Terminal outcomes reached while blocked stick.
                ProcessState::Failed | ProcessState::Finished => self.resume_state,
                // A dead child is never resurrected by unblocking.
                _ => ProcessState::Created,
            }
        };
        self.transition(next);
        info!(process_id = %self.spec.id, state = %next, "supervisor unblocked");
    }

    fn on_cron_fired(&mut self) {
        if self.shutting_down {
            return;
        }
        match self.current() {
            ProcessState::Running => {
                debug!(process_id = %self.spec.id, "cron fired while child is running; skipping");
            }
            ProcessState::Stopping => {
                debug!(process_id = %self.spec.id, "cron fired while stopping; dropped");
            }
            ProcessState::Stopped if self.pending_restart.is_some() => {
                debug!(process_id = %self.spec.id, "cron fired during restart delay; dropped");
            }
            ProcessState::Failed => {
                debug!(process_id = %self.spec.id, "cron fired on failed supervisor; dropped");
            }
            ProcessState::Created | ProcessState::Stopped | ProcessState::Finished => {
                self.spawn_child()
            }
            _ => {}
        }
    }

    fn on_path_changed(&mut self) {
        if self.shutting_down {
            return;
        }
        match self.current() {
            ProcessState::Running => self.begin_stop(AfterStop::Respawn),
            ProcessState::Stopping => {
                debug!(process_id = %self.spec.id, "path change while stopping; dropped");
            }
            ProcessState::Stopped if self.pending_restart.is_some() => {
                // A change supersedes the delay: restart right away.
                self.cancel_pending_restart();
                self.respawn_child();
            }
            ProcessState::Created
            | ProcessState::Stopped
            | ProcessState::Failed
            | ProcessState::Finished => self.spawn_child(),
            _ => {}
        }
    }

    fn on_child_exited(&mut self, token: u64, exit: ExitRecord) -> bool {
        if self.child.as_ref().map(|c| c.token) != Some(token) {
            return true;
        }
        self.child = None;
        self.cell.update(|s| {
            s.pid = None;
            s.last_exit = Some(exit.clone());
        });
        if exit.is_error() {
            error!(
                process_id = %self.spec.id,
                code = ?exit.code,
                signal = ?exit.signal,
                "process exited unsuccessfully"
            );
        } else {
            info!(process_id = %self.spec.id, "process exited");
        }

        if self.shutting_down {
            self.transition(ProcessState::Stopped);
            return false;
        }

        match self.current() {
            ProcessState::Stopping => {
                self.transition(ProcessState::Stopped);
                if self.after_stop == AfterStop::Respawn {
                    self.respawn_child();
                }
            }
            ProcessState::Running | ProcessState::Starting => self.apply_exit_policy(&exit),
            _ => self.transition(ProcessState::Stopped),
        }
        true
    }

    fn apply_exit_policy(&mut self, exit: &ExitRecord) {
        match restart::decide(self.spec.restart, exit) {
            ExitDecision::Finished => self.transition(ProcessState::Finished),
            ExitDecision::Failed => self.transition(ProcessState::Failed),
            ExitDecision::Restart => {
                if self.blocked {
                    // Restarting would resurrect the child behind a block.
                    self.transition(ProcessState::Stopped);
                } else if restart::limit_reached(self.restarts, self.spec.restart_limit) {
                    warn!(
                        process_id = %self.spec.id,
                        restarts = self.restarts,
                        "restart limit exceeded; the process won't restart anymore"
                    );
                    self.transition(ProcessState::Failed);
                } else {
                    self.transition(ProcessState::Stopped);
                    self.schedule_restart_delay();
                }
            }
        }
    }

    fn on_delay_elapsed(&mut self, token: u64) {
        if self.pending_restart != Some(token) {
            return;
        }
        self.pending_restart = None;
        if self.shutting_down {
            return;
        }
        self.respawn_child();
    }

    fn on_stop_deadline(&mut self, token: u64) {
        let Some(child) = &self.child else { return };
        if child.token != token {
            return;
        }
        if self.current() == ProcessState::Stopping {
            warn!(
                process_id = %self.spec.id,
                pid = child.pid,
                "graceful stop window elapsed; force-killing process"
            );
            let _ = ProcessTerminator::new(child.pid).kill();
        }
    }

    fn on_shutdown(&mut self) -> bool {
        if self.shutting_down {
            // A second terminate short-circuits to an immediate kill.
            if let Some(child) = &self.child {
                warn!(process_id = %self.spec.id, pid = child.pid, "force-killing process");
                let _ = ProcessTerminator::new(child.pid).kill();
            }
            return true;
        }
        self.shutting_down = true;
        self.blocked = false;
        self.cancel_pending_restart();
        match &self.child {
            Some(child) => {
                let (pid, token) = (child.pid, child.token);
                self.transition(ProcessState::Stopping);
                info!(process_id = %self.spec.id, pid, "stopping process");
                let _ = ProcessTerminator::new(pid).terminate();
                self.schedule_stop_deadline(token);
                true
            }
            None => {
                self.transition(ProcessState::Stopped);
                false
            }
        }
    }

    fn begin_stop(&mut self, after: AfterStop) {
        let Some(child) = &self.child else { return };
        let (pid, token) = (child.pid, child.token);
        self.after_stop = after;
        self.transition(ProcessState::Stopping);
        info!(process_id = %self.spec.id, pid, "stopping process");
        if let Err(err) = ProcessTerminator::new(pid).terminate() {
            warn!(process_id = %self.spec.id, %err, "could not signal process");
        }
        self.schedule_stop_deadline(token);
    }

    fn cancel_pending_restart(&mut self) {
        if self.pending_restart.take().is_some() {
            debug!(process_id = %self.spec.id, "pending restart cancelled");
        }
    }

    fn schedule_restart_delay(&mut self) {
        self.delay_tokens += 1;
        let token = self.delay_tokens;
        self.pending_restart = Some(token);
        let delay = Duration::from_millis(self.spec.restart_delay_ms);
        let publisher = self.self_publisher.clone();
        debug!(process_id = %self.spec.id, delay_ms = self.spec.restart_delay_ms, "restart scheduled");
        spawn_named_thread(format!("{} restart delay", self.spec.id), move || {
            sleep(delay);
            let _ = publisher.publish(SupervisorMsg::RestartDelayElapsed { token });
        });
    }

    fn schedule_stop_deadline(&mut self, token: u64) {
        let timeout = Duration::from_millis(self.spec.terminate_timeout_ms);
        let publisher = self.self_publisher.clone();
        spawn_named_thread(format!("{} stop deadline", self.spec.id), move || {
            sleep(timeout);
            let _ = publisher.publish(SupervisorMsg::StopDeadline { token });
        });
    }

    fn respawn_child(&mut self) {
        self.set_restarts(self.restarts + 1);
        self.spawn_child();
    }

    fn spawn_child(&mut self) {
        self.transition(ProcessState::Starting);
        info!(process_id = %self.spec.id, cmd = ?self.spec.cmd, "starting process");

        let mut env = self.spec.env.clone();
        env.insert(ENV_PROCESS_ID.to_string(), self.spec.id.to_string());
        let command =
            CommandNotStarted::new(self.spec.id.clone(), &self.spec.cmd, &self.spec.cwd, &env);
        match command.start() {
            Ok(mut started) => {
                let pid = started.get_pid();
                match started.take_output() {
                    Ok((stdout, stderr)) => {
                        spawn_output_pump(
                            self.spec.id.clone(),
                            StreamKind::Stdout,
                            stdout,
                            self.log_queue.clone(),
                        );
                        spawn_output_pump(
                            self.spec.id.clone(),
                            StreamKind::Stderr,
                            stderr,
                            self.log_queue.clone(),
                        );
                    }
                    Err(err) => {
                        warn!(process_id = %self.spec.id, %err, "output capture unavailable")
                    }
                }

                self.child_tokens += 1;
                let token = self.child_tokens;
                self.child = Some(LiveChild { pid, token });
                self.cell.update(|s| s.pid = Some(pid));

                let publisher = self.self_publisher.clone();
                spawn_named_thread(format!("{} waiter", self.spec.id), move || {
                    let exit = match started.wait() {
                        Ok(status) => ExitRecord::from_status(status),
                        Err(err) => {
                            error!(%err, "error waiting for process");
                            ExitRecord::spawn_failure()
                        }
                    };
                    let _ = publisher.publish(SupervisorMsg::ChildExited { token, exit });
                });

                self.transition(ProcessState::Running);
            }
            Err(err) => {
                error!(process_id = %self.spec.id, %err, "error while launching process");
                let failure = ExitRecord::spawn_failure();
                self.cell.update(|s| s.last_exit = Some(failure.clone()));
                // A spawn failure counts as a failed start toward the limit.
                self.apply_exit_policy(&failure);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::plan::RestartPolicy;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn spec(id: &str, argv: &[&str]) -> ProcessSpec {
        ProcessSpec {
            id: ProcessId::new(id).unwrap(),
            cmd: argv.iter().map(|s| s.to_string()).collect(),
            cwd: PathBuf::from("."),
            env: HashMap::new(),
            autostart: false,
            cron: None,
            watch: Vec::new(),
            restart: RestartPolicy::Never,
            restart_delay_ms: 50,
            restart_limit: None,
            terminate_timeout_ms: 500,
            instances: 1,
            balancer: None,
        }
    }

    fn start(spec: ProcessSpec) -> StartedSupervisor {
        NotStartedSupervisor::new(spec, LogQueue::new()).start()
    }

    fn wait_for(
        supervisor: &StartedSupervisor,
        timeout: Duration,
        predicate: impl Fn(&StatusSnapshot) -> bool,
    ) -> StatusSnapshot {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = supervisor.status();
            if predicate(&snapshot) {
                return snapshot;
            }
            assert!(
                Instant::now() < deadline,
                "condition not reached in time; last status: {snapshot:?}"
            );
            sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn autostart_with_restart_always_keeps_cycling() {
        let mut s = spec("cycler", &["true"]);
        s.autostart = true;
        s.restart = RestartPolicy::Always;
        s.restart_delay_ms = 20;
        let supervisor = start(s);

        let snapshot = wait_for(&supervisor, Duration::from_secs(5), |s| s.restarts >= 5);
        assert_ne!(snapshot.state, ProcessState::Failed);

        supervisor.stop().unwrap();
    }

    #[test]
    fn restart_limit_parks_in_failed() {
        let mut s = spec("limited", &["false"]);
        s.autostart = true;
        s.restart = RestartPolicy::Always;
        s.restart_limit = Some(3);
        s.restart_delay_ms = 20;
        let supervisor = start(s);

        let snapshot = wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Failed
        });
        assert_eq!(snapshot.restarts, 3);

        supervisor.stop().unwrap();
    }

    #[test]
    fn clean_exit_without_restart_finishes_for_good() {
        let mut s = spec("oneshot", &["true"]);
        s.autostart = true;
        let supervisor = start(s);

        wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Finished
        });
        sleep(Duration::from_millis(200));
        let snapshot = supervisor.status();
        assert_eq!(snapshot.state, ProcessState::Finished);
        assert_eq!(snapshot.restarts, 0);
        assert_eq!(snapshot.last_exit.as_ref().unwrap().code, Some(0));

        supervisor.stop().unwrap();
    }

    #[test]
    fn error_exit_without_restart_fails() {
        let mut s = spec("oops", &["false"]);
        s.autostart = true;
        let supervisor = start(s);

        let snapshot = wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Failed
        });
        assert!(snapshot.last_exit.unwrap().is_error());

        supervisor.stop().unwrap();
    }

    #[test]
    fn spawn_failures_count_toward_the_limit() {
        let mut s = spec("ghost", &["pup-test-no-such-binary"]);
        s.autostart = true;
        s.restart = RestartPolicy::Always;
        s.restart_limit = Some(2);
        s.restart_delay_ms = 20;
        let supervisor = start(s);

        let snapshot = wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Failed
        });
        assert_eq!(snapshot.restarts, 2);

        supervisor.stop().unwrap();
    }

    #[test]
    fn manual_stop_moves_to_stopped() {
        let mut s = spec("stoppable", &["sleep", "30"]);
        s.autostart = true;
        let supervisor = start(s);

        wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Running
        });
        supervisor.send(SupervisorMsg::Stop).unwrap();
        let snapshot = wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Stopped
        });
        assert!(snapshot.pid.is_none());

        supervisor.stop().unwrap();
    }

    #[test]
    fn manual_restart_cycles_the_child() {
        let mut s = spec("restartable", &["sleep", "30"]);
        s.autostart = true;
        let supervisor = start(s);

        let before = wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Running
        });
        supervisor.send(SupervisorMsg::Restart).unwrap();
        let after = wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Running && s.restarts == 1
        });
        assert_ne!(before.pid, after.pid);

        supervisor.stop().unwrap();
    }

    #[test]
    fn manual_stop_during_restart_delay_cancels_it() {
        let mut s = spec("delayed", &["false"]);
        s.autostart = true;
        s.restart = RestartPolicy::Always;
        s.restart_delay_ms = 60_000;
        let supervisor = start(s);

        wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Stopped
        });
        supervisor.send(SupervisorMsg::Stop).unwrap();
        sleep(Duration::from_millis(200));
        let snapshot = supervisor.status();
        assert_eq!(snapshot.state, ProcessState::Stopped);
        assert_eq!(snapshot.restarts, 0);

        supervisor.stop().unwrap();
    }

    #[test]
    fn blocked_supervisor_drops_triggers_but_keeps_its_child() {
        let mut s = spec("blocked", &["sleep", "30"]);
        s.autostart = true;
        let supervisor = start(s);

        let running = wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Running
        });
        supervisor.send(SupervisorMsg::Block).unwrap();
        wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Blocked
        });

        // Triggers are dropped; the child keeps running.
        supervisor.send(SupervisorMsg::Stop).unwrap();
        supervisor.send(SupervisorMsg::CronFired).unwrap();
        sleep(Duration::from_millis(200));
        let blocked = supervisor.status();
        assert_eq!(blocked.state, ProcessState::Blocked);
        assert_eq!(blocked.pid, running.pid);

        supervisor.send(SupervisorMsg::Unblock).unwrap();
        let resumed = wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Running
        });
        assert_eq!(resumed.pid, running.pid);

        supervisor.stop().unwrap();
    }

    #[test]
    fn unblock_never_resurrects_a_dead_child() {
        let mut s = spec("blocked-exit", &["sleep", "0.2"]);
        s.autostart = true;
        s.restart = RestartPolicy::Always;
        let supervisor = start(s);

        wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Running
        });
        supervisor.send(SupervisorMsg::Block).unwrap();

        // Let the child exit behind the block; no restart may be scheduled.
        sleep(Duration::from_millis(500));
        assert_eq!(supervisor.state(), ProcessState::Blocked);

        supervisor.send(SupervisorMsg::Unblock).unwrap();
        sleep(Duration::from_millis(300));
        let snapshot = supervisor.status();
        assert_eq!(snapshot.state, ProcessState::Created);
        assert!(snapshot.pid.is_none());

        supervisor.stop().unwrap();
    }

    #[test]
    fn stop_deadline_force_kills_a_term_trapping_child() {
        let mut s = spec(
            "stubborn",
            &["sh", "-c", "trap '' TERM; while true; do sleep 1; done"],
        );
        s.autostart = true;
        s.terminate_timeout_ms = 200;
        let supervisor = start(s);

        wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Running
        });
        // Warm-up time for the shell to install its trap.
        sleep(Duration::from_millis(300));

        supervisor.send(SupervisorMsg::Stop).unwrap();
        let snapshot = wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Stopped
        });
        assert_eq!(snapshot.last_exit.unwrap().signal, Some(9));

        supervisor.stop().unwrap();
    }

    #[test]
    fn watch_event_restarts_regardless_of_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = spec("watched", &["sleep", "30"]);
        s.autostart = true;
        s.watch = vec![dir.path().to_path_buf()];
        s.terminate_timeout_ms = 500;
        let supervisor = start(s);

        let before = wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Running
        });
        std::fs::write(dir.path().join("t"), b"x").unwrap();

        let after = wait_for(&supervisor, Duration::from_secs(10), |s| {
            s.state == ProcessState::Running && s.restarts == 1
        });
        assert_ne!(before.pid, after.pid);

        supervisor.stop().unwrap();
    }

    #[test]
    fn cron_fires_skip_while_the_child_runs() {
        let mut s = spec("scheduled", &["sleep", "2"]);
        s.cron = Some(CronSchedule::parse("* * * * * *").unwrap());
        let supervisor = start(s);

        let first = wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Running
        });
        // Several cron fires land while the child sleeps; all are skipped.
        sleep(Duration::from_millis(1200));
        let during = supervisor.status();
        assert_eq!(during.pid, first.pid);
        assert_eq!(during.restarts, 0);

        supervisor.stop().unwrap();
    }

    #[test]
    fn cron_respawns_after_a_clean_finish() {
        let mut s = spec("periodic", &["true"]);
        s.cron = Some(CronSchedule::parse("* * * * * *").unwrap());
        let supervisor = start(s);

        let first_exit = wait_for(&supervisor, Duration::from_secs(5), |s| s.last_exit.is_some())
            .last_exit
            .unwrap()
            .at;
        // The next second's fire starts a fresh child after the clean finish.
        wait_for(&supervisor, Duration::from_secs(5), |s| {
            s.state == ProcessState::Running
                || s.last_exit.as_ref().is_some_and(|e| e.at > first_exit)
        });
        assert_ne!(supervisor.state(), ProcessState::Failed);

        supervisor.stop().unwrap();
    }

    #[test]
    fn shutdown_without_a_child_finishes_immediately() {
        let supervisor = start(spec("idle", &["true"]));
        supervisor.stop().unwrap();
    }
}
