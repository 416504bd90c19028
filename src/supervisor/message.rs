use super::state::ExitRecord;

/// Everything that can make a supervisor act. Cron ticks, watcher events,
/// operator commands and the supervisor's own timers all land in the same
/// ordered inbound queue, so races between them are resolved by arrival
/// order alone.
#[derive(Debug)]
pub enum SupervisorMsg {
    /// Operator (or autostart) start. `reset_restarts` marks an
    /// externally-initiated start, which zeroes the restart counter.
    Start { reset_restarts: bool },
    Stop,
    Restart,
    Block,
    Unblock,
    CronFired,
    PathChanged,
    /// Published by the waiter thread of child generation `token`.
    ChildExited { token: u64, exit: ExitRecord },
    /// The restart delay of generation `token` ran out.
    RestartDelayElapsed { token: u64 },
    /// The graceful-stop window of child generation `token` ran out.
    StopDeadline { token: u64 },
    /// Global terminate. The supervisor stops its child and its own loop.
    Shutdown,
}

impl SupervisorMsg {
    /// Triggers are droppable (while blocked); lifecycle-internal messages
    /// and shutdown are not.
    pub fn is_trigger(&self) -> bool {
        matches!(
            self,
            SupervisorMsg::Start { .. }
                | SupervisorMsg::Stop
                | SupervisorMsg::Restart
                | SupervisorMsg::CronFired
                | SupervisorMsg::PathChanged
        )
    }
}
