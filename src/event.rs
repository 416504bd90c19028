pub mod channel;

/// Process-level events delivered to the root controller (e.g. from the
/// signal handler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationEvent {
    StopRequested,
}
