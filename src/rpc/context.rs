use std::time::{Duration, Instant};

use flume::{Receiver, Selector, Sender, TryRecvError};

use super::TransportError;

/// Deadline and cancellation signal shared by every request of a query.
#[derive(Debug, Clone)]
pub struct Context {
    deadline: Option<Instant>,
    /// Never receives; disconnected once the [Canceller] is dropped.
    done: Receiver<()>,
}

/// Cancels every clone of its [Context] when cancelled or dropped.
#[derive(Debug)]
pub struct Canceller(Sender<()>);

impl Canceller {
    pub fn cancel(self) {
        drop(self)
    }
}

impl Context {
    /// A context with no deadline, only cancellation.
    pub fn background() -> (Context, Canceller) {
        Self::new(None)
    }

    pub fn with_deadline(deadline: Instant) -> (Context, Canceller) {
        Self::new(Some(deadline))
    }

    pub fn with_timeout(timeout: Duration) -> (Context, Canceller) {
        Self::new(Instant::now().checked_add(timeout))
    }

    fn new(deadline: Option<Instant>) -> (Context, Canceller) {
        let (sender, done) = flume::bounded(0);

        (Context { deadline, done }, Canceller(sender))
    }

    // === Getters ===

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Returns why this context is done, or `None` if it is still live.
    pub fn err(&self) -> Option<TransportError> {
        if self.is_cancelled() {
            return Some(TransportError::Cancelled);
        }

        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(TransportError::DeadlineExceeded),
            _ => None,
        }
    }

    // === Public Methods ===

    /// Block until this context is cancelled or its deadline passes.
    pub fn done(&self) -> TransportError {
        let result = match self.deadline {
            Some(deadline) => self.done.recv_deadline(deadline).map_err(|error| match error {
                flume::RecvTimeoutError::Timeout => TransportError::DeadlineExceeded,
                flume::RecvTimeoutError::Disconnected => TransportError::Cancelled,
            }),
            None => self.done.recv().map_err(|_| TransportError::Cancelled),
        };

        match result {
            Ok(()) | Err(TransportError::Cancelled) => TransportError::Cancelled,
            Err(error) => error,
        }
    }

    /// Receive from `receiver`, unless this context is done first.
    pub fn recv<T>(&self, receiver: &Receiver<T>) -> Result<T, TransportError> {
        if let Some(error) = self.err() {
            return Err(error);
        }

        let selector = Selector::new()
            .recv(receiver, |result| result.map_err(|_| TransportError::Closed))
            .recv(&self.done, |_| Err(TransportError::Cancelled));

        match self.deadline {
            Some(deadline) => selector
                .wait_deadline(deadline)
                .unwrap_or(Err(TransportError::DeadlineExceeded)),
            None => selector.wait(),
        }
    }
}
