use crossbeam::channel::{unbounded, Receiver, RecvError, RecvTimeoutError, Sender};
use std::time::Duration;
use thiserror::Error;

/// Consuming half of an event channel. Wrapping the crossbeam receiver keeps
/// channel construction in one place and lets consumers expose only the
/// operations a serial task needs.
pub struct EventConsumer<E>(Receiver<E>);

impl<E> From<Receiver<E>> for EventConsumer<E> {
    fn from(value: Receiver<E>) -> Self {
        Self(value)
    }
}

pub struct EventPublisher<E>(Sender<E>);

impl<E> From<Sender<E>> for EventPublisher<E> {
    fn from(value: Sender<E>) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EventPublisherError {
    #[error("error while publishing event: {0}")]
    SendError(String),
}

pub fn pub_sub<E>() -> (EventPublisher<E>, EventConsumer<E>) {
    let (s, r) = unbounded();
    (EventPublisher(s), EventConsumer(r))
}

impl<E> EventPublisher<E> {
    pub fn publish(&self, event: E) -> Result<(), EventPublisherError> {
        self.0
            .send(event)
            .map_err(|err| EventPublisherError::SendError(err.to_string()))
    }
}

impl<E> EventConsumer<E> {
    /// Blocks until an event arrives or every publisher is gone.
    pub fn recv(&self) -> Result<E, RecvError> {
        self.0.recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<E, RecvTimeoutError> {
        self.0.recv_timeout(timeout)
    }
}

/// What a worker's stop channel carries. The payload is empty on purpose:
/// delivery itself is the stop request.
pub type CancellationMessage = ();

impl EventConsumer<CancellationMessage> {
    /// Waits up to `timeout` for a stop request and reports whether one
    /// arrived. A closed channel counts as cancelled too, since it means
    /// whoever owned this worker is gone. Workers use this as their
    /// cancellable sleep: pass the time until the next piece of work and
    /// bail out when it returns true.
    pub fn is_cancelled(&self, timeout: Duration) -> bool {
        !matches!(self.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

impl<E> Clone for EventPublisher<E> {
    fn clone(&self) -> Self {
        EventPublisher(self.0.clone())
    }
}

impl<E> AsRef<Receiver<E>> for EventConsumer<E> {
    fn as_ref(&self) -> &Receiver<E> {
        &self.0
    }
}
