use super::state::ExitRecord;
use crate::plan::RestartPolicy;

/// What the restart policy says about an exit, before the restart limit is
/// applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// Clean one-shot completion; the supervisor parks in FINISHED.
    Finished,
    /// Unrecoverable under this policy; the supervisor parks in FAILED.
    Failed,
    /// Schedule a respawn after the restart delay.
    Restart,
}

pub fn decide(policy: RestartPolicy, exit: &ExitRecord) -> ExitDecision {
    match (policy, exit.is_error()) {
        (RestartPolicy::Always, _) => ExitDecision::Restart,
        (RestartPolicy::OnError, true) => ExitDecision::Restart,
        (RestartPolicy::OnError, false) => ExitDecision::Finished,
        (RestartPolicy::Never, false) => ExitDecision::Finished,
        (RestartPolicy::Never, true) => ExitDecision::Failed,
    }
}

/// True when the policy would restart but the limit is already spent.
pub fn limit_reached(restarts: u32, restart_limit: Option<u32>) -> bool {
    restart_limit.is_some_and(|limit| restarts >= limit)
}
