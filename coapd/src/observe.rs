//! Observation handles (RFC 7641).
//!
//! An [`Observation`] is the client-side view of one observe
//! relationship: a lazy stream of notifications ending on user cancel,
//! peer de-registration or an error-class notification.

use coapd_msg::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Handle returned from an observe request.
///
/// Dropping the handle behaves like [`Observation::cancel`]: the local
/// registration is removed and a best-effort deregistration is sent to
/// the peer.
pub struct Observation {
    rx: mpsc::Receiver<Result<Message, Error>>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
    closed: bool,
}

impl Observation {
    pub(crate) fn new(
        rx: mpsc::Receiver<Result<Message, Error>>,
        on_cancel: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            rx,
            on_cancel: Some(on_cancel),
            closed: false,
        }
    }

    /// Await the next notification.
    ///
    /// Returns [`Error::Closed`] once the stream has terminated (peer
    /// de-registration, error notification, session shutdown) and
    /// [`Error::Cancelled`] when `cancel` fires first.
    pub async fn recv(&mut self, cancel: &CancellationToken) -> Result<Message, Error> {
        if self.closed {
            return Err(Error::Closed);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            next = self.rx.recv() => match next {
                Some(Ok(msg)) => {
                    // A response without Observe or with an error class is
                    // the final item.
                    if msg.observe().is_none() || msg.code.is_error_response() {
                        self.closed = true;
                    }
                    Ok(msg)
                }
                Some(Err(err)) => {
                    self.closed = true;
                    Err(err)
                }
                None => {
                    self.closed = true;
                    Err(Error::Closed)
                }
            },
        }
    }

    /// Deregister with the peer and stop delivery. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
        self.closed = true;
        self.rx.close();
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coapd_msg::{Code, MessageType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn notification(seq: u32) -> Message {
        let mut msg = Message::new(MessageType::NonConfirmable, Code::CONTENT, 0);
        msg.set_observe(seq);
        msg
    }

    #[tokio::test]
    async fn test_receives_notifications_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let mut obs = Observation::new(rx, Box::new(|| {}));
        let cancel = CancellationToken::new();

        tx.send(Ok(notification(1))).await.unwrap();
        tx.send(Ok(notification(2))).await.unwrap();

        assert_eq!(obs.recv(&cancel).await.unwrap().observe(), Some(1));
        assert_eq!(obs.recv(&cancel).await.unwrap().observe(), Some(2));
    }

    #[tokio::test]
    async fn test_terminal_notification_closes_stream() {
        let (tx, rx) = mpsc::channel(4);
        let mut obs = Observation::new(rx, Box::new(|| {}));
        let cancel = CancellationToken::new();

        // No Observe option: peer deregistered us.
        tx.send(Ok(Message::new(
            MessageType::NonConfirmable,
            Code::CONTENT,
            0,
        )))
        .await
        .unwrap();

        assert!(obs.recv(&cancel).await.is_ok());
        assert!(matches!(obs.recv(&cancel).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_cancel_token_aborts_wait() {
        let (_tx, rx) = mpsc::channel::<Result<Message, Error>>(1);
        let mut obs = Observation::new(rx, Box::new(|| {}));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(obs.recv(&cancel).await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_runs_deregistration_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let (_tx, rx) = mpsc::channel::<Result<Message, Error>>(1);
        let mut obs = Observation::new(
            rx,
            Box::new(move || {
                calls_in.fetch_add(1, Ordering::SeqCst);
            }),
        );

        obs.cancel();
        obs.cancel();
        drop(obs);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
