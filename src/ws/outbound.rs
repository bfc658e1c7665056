//! Serialized transport writer.
//!
//! A connection's reader loop and every one of its delivery tasks need to
//! write frames. They never touch the sink directly: each holds an
//! [`Outbound`] handle that enqueues onto a bounded queue drained by one
//! writer task, so frames leave in the order they were enqueued.
//!
//! Live frames carry their subscription's cancellation token. The writer
//! discards a live frame whose token was cancelled while it sat in the
//! queue, so nothing from a closed or replaced subscription follows the
//! `CLOSE` or the replacement `REQ`.

use std::fmt::Display;

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::messages::RelayMessage;
use crate::error::RelayError;

/// One queued frame.
#[derive(Debug)]
struct Frame {
    message: Message,
    live: Option<CancellationToken>,
}

impl Frame {
    fn is_stale(&self) -> bool {
        self.live
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// Cloneable handle onto a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Frame>,
}

impl Outbound {
    /// Spawns the writer task for `sink` and returns a handle to it.
    ///
    /// The writer exits, closing the sink, once every handle is dropped and
    /// the queue is drained, or on the first failed write.
    pub fn spawn<Si>(sink: Si, capacity: usize) -> (Self, JoinHandle<()>)
    where
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: Display,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(write_loop(sink, rx));
        (Self { tx }, writer)
    }

    /// Enqueues one frame, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the frame cannot be encoded or
    /// the writer has stopped.
    pub async fn send(&self, message: RelayMessage) -> Result<(), RelayError> {
        self.enqueue(message, None).await
    }

    /// Enqueues a live frame for the subscription owning `subscription`.
    /// The frame is dropped unwritten if that token is cancelled first.
    ///
    /// # Errors
    ///
    /// Same as [`Outbound::send`].
    pub async fn send_live(
        &self,
        message: RelayMessage,
        subscription: &CancellationToken,
    ) -> Result<(), RelayError> {
        self.enqueue(message, Some(subscription.clone())).await
    }

    async fn enqueue(
        &self,
        message: RelayMessage,
        live: Option<CancellationToken>,
    ) -> Result<(), RelayError> {
        let text = message
            .to_json()
            .map_err(|e| RelayError::Transport(format!("could not encode frame: {e}")))?;
        let frame = Frame {
            message: Message::text(text),
            live,
        };
        self.tx
            .send(frame)
            .await
            .map_err(|_| RelayError::Transport("connection closed".to_string()))
    }
}

async fn write_loop<Si>(mut sink: Si, mut rx: mpsc::Receiver<Frame>)
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    while let Some(frame) = rx.recv().await {
        if frame.is_stale() {
            tracing::trace!("dropping live frame for a closed subscription");
            continue;
        }
        if let Err(err) = sink.send(frame.message).await {
            tracing::debug!(error = %err, "transport write failed");
            return;
        }
    }
    if let Err(err) = sink.close().await {
        tracing::debug!(error = %err, "transport close failed");
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::SubscriptionId;
    use tokio_util::sync::PollSender;

    fn sub(id: &str) -> SubscriptionId {
        let Ok(sub) = SubscriptionId::new(id) else {
            panic!("valid id");
        };
        sub
    }

    #[tokio::test]
    async fn frames_are_written_in_enqueue_order() {
        let (tx, mut rx) = mpsc::channel::<Message>(16);
        let (outbound, writer) = Outbound::spawn(PollSender::new(tx), 4);

        let other = outbound.clone();
        let _ = outbound.send(RelayMessage::Notice("one".to_string())).await;
        let _ = other.send(RelayMessage::Eose(sub("s"))).await;
        let _ = outbound.send(RelayMessage::Notice("three".to_string())).await;
        drop(outbound);
        drop(other);

        let mut written = Vec::new();
        while let Some(Message::Text(text)) = rx.recv().await {
            written.push(text.as_str().to_string());
        }
        assert_eq!(
            written,
            vec![
                r#"["NOTICE","one"]"#.to_string(),
                r#"["EOSE","s"]"#.to_string(),
                r#"["NOTICE","three"]"#.to_string(),
            ]
        );
        assert!(writer.await.is_ok());
    }

    #[tokio::test]
    async fn queued_live_frames_of_a_closed_subscription_are_dropped() {
        // The far end holds one frame and is not read until the end, so
        // later frames wait in the outbound queue.
        let (tx, mut rx) = mpsc::channel::<Message>(1);
        let (outbound, writer) = Outbound::spawn(PollSender::new(tx), 8);
        let subscription = CancellationToken::new();

        for note in ["a", "b", "c", "d"] {
            let live = RelayMessage::Notice(note.to_string());
            let _ = outbound.send_live(live, &subscription).await;
        }
        subscription.cancel();
        let _ = outbound.send(RelayMessage::Eose(sub("s"))).await;
        drop(outbound);

        let mut written = Vec::new();
        while let Some(Message::Text(text)) = rx.recv().await {
            written.push(text.as_str().to_string());
        }
        assert_eq!(written.last().map(String::as_str), Some(r#"["EOSE","s"]"#));
        assert!(!written.contains(&r#"["NOTICE","c"]"#.to_string()));
        assert!(!written.contains(&r#"["NOTICE","d"]"#.to_string()));
        assert!(writer.await.is_ok());
    }

    #[tokio::test]
    async fn send_fails_once_the_transport_is_gone() {
        let (tx, rx) = mpsc::channel::<Message>(1);
        drop(rx);
        let (outbound, writer) = Outbound::spawn(PollSender::new(tx), 4);

        let _ = outbound.send(RelayMessage::Notice("lost".to_string())).await;
        assert!(writer.await.is_ok());
        assert!(matches!(
            outbound.send(RelayMessage::Notice("late".to_string())).await,
            Err(RelayError::Transport(_))
        ));
    }
}
