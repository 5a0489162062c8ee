//! Error notifications.
//!
//! Every error recorded at [`Severity::Error`](crate::Severity::Error) is also
//! published on the [`ErrorChannel`] of its logger, so error reporters can
//! subscribe without reading log files:
//!
//! ```rust
//! # async fn run(logger: actix_web_middleware_flogger::FileLogger) {
//! let mut errors = logger.subscribe();
//! while let Some(event) = errors.recv().await {
//!     eprintln!("{}: {}", event.error.name, event.error.message);
//! }
//! # }
//! ```

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::record::{ErrorDetail, RequestDetail};

const DEFAULT_CAPACITY: usize = 256;

/// An error that was logged, with the request it happened in, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub error: ErrorDetail,
    pub request: Option<RequestDetail>,
}

/// Broadcast channel owned by one logger.
#[derive(Debug, Clone)]
pub struct ErrorChannel {
    sender: broadcast::Sender<ErrorEvent>,
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receives every event published after this call.
    pub fn subscribe(&self) -> ErrorSubscription {
        ErrorSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publishes `event` without waiting for subscribers. Returns how many
    /// subscribers will see it; zero subscribers is not an error.
    pub(crate) fn emit(&self, event: ErrorEvent) -> usize {
        match self.sender.send(event) {
            Ok(count) => count,
            Err(_) => {
                log::trace!("error event dropped, no subscribers");
                0
            }
        }
    }
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of an [`ErrorChannel`]. Dropping it unsubscribes.
#[derive(Debug)]
pub struct ErrorSubscription {
    receiver: broadcast::Receiver<ErrorEvent>,
}

impl ErrorSubscription {
    /// Waits for the next event. Returns `None` once the logger is gone.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<ErrorEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("error subscriber lagged, skipped {skipped} events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ErrorEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    log::warn!("error subscriber lagged, skipped {skipped} events");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}
