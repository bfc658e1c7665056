//! Per-connection protocol state machine.
//!
//! A [`Session`] owns one transport. Its reader loop is the only task that
//! calls the store or touches the session's subscription table. Each open
//! subscription gets a delivery task that drains its registry channel into
//! the shared [`Outbound`] queue.
//!
//! Lifecycle: `Open` until the client disconnects, sends a malformed frame,
//! or shutdown is signalled; then `Closing` while subscriptions are removed
//! from the registry and delivery tasks are cancelled; then `Closed`.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::{Sink, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use super::messages::{ClientMessage, RelayMessage};
use super::outbound::Outbound;
use crate::app_state::AppState;
use crate::domain::{
    ConnectionId, Event, EventValidator, FilterGroup, SubscriberRegistry, SubscriptionId,
    SubscriptionKey,
};
use crate::error::{ProtocolError, RelayError};
use crate::store::{EventStore, PutOutcome, compile};

/// How long a closing session waits for queued frames to reach the client.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Flush budget when the session is closing for shutdown.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Processing frames.
    Open,
    /// Releasing subscriptions and tasks.
    Closing,
    /// Transport released.
    Closed,
}

/// Why the reader loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CloseReason {
    ClientClosed,
    Shutdown,
    Protocol(ProtocolError),
    Transport(String),
}

/// One client connection.
pub struct Session<S> {
    connection: ConnectionId,
    store: Arc<S>,
    registry: Arc<SubscriberRegistry>,
    validator: Arc<dyn EventValidator>,
    max_limit: u64,
    outbound_capacity: usize,
    state: SessionState,
    token: CancellationToken,
    delivery: TaskTracker,
    subscriptions: HashMap<SubscriptionId, CancellationToken>,
}

impl<S> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection", &self.connection)
            .field("state", &self.state)
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl<S: EventStore> Session<S> {
    /// Creates a session bound to the relay's shared state. The session
    /// stops when `state.shutdown` is cancelled.
    #[must_use]
    pub fn new(state: &AppState<S>) -> Self {
        Self {
            connection: ConnectionId::new(),
            store: Arc::clone(&state.store),
            registry: Arc::clone(&state.registry),
            validator: Arc::clone(&state.validator),
            max_limit: state.config.max_limit,
            outbound_capacity: state.config.outbound_capacity,
            state: SessionState::Open,
            token: state.shutdown.child_token(),
            delivery: TaskTracker::new(),
            subscriptions: HashMap::new(),
        }
    }

    /// Server-assigned id of this connection.
    #[must_use]
    pub const fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Runs the session to completion over a split transport.
    pub async fn run<Si, St, E>(self, sink: Si, stream: St)
    where
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: Display,
        St: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let span = tracing::info_span!("session", connection = %self.connection);
        self.drive(sink, stream).instrument(span).await;
    }

    async fn drive<Si, St, E>(mut self, sink: Si, mut stream: St)
    where
        Si: Sink<Message> + Unpin + Send + 'static,
        Si::Error: Display,
        St: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        tracing::debug!("session opened");
        let (outbound, mut writer) = Outbound::spawn(sink, self.outbound_capacity);
        let token = self.token.clone();

        let reason = loop {
            let frame = tokio::select! {
                biased;
                () = token.cancelled() => break CloseReason::Shutdown,
                frame = stream.next() => frame,
            };

            let message = match frame {
                None | Some(Ok(Message::Close(_))) => break CloseReason::ClientClosed,
                Some(Err(err)) => break CloseReason::Transport(err.to_string()),
                Some(Ok(Message::Text(text))) => match text.as_str().parse::<ClientMessage>() {
                    Ok(message) => message,
                    Err(err) => break CloseReason::Protocol(err),
                },
                Some(Ok(Message::Binary(_))) => {
                    break CloseReason::Protocol(ProtocolError::Binary);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            };

            tracing::debug!(label = message.label(), "frame received");
            // A client that stops reading can park `handle` on a full queue.
            let handled = tokio::select! {
                biased;
                () = token.cancelled() => break CloseReason::Shutdown,
                handled = self.handle(message, &outbound) => handled,
            };
            if let Err(err) = handled {
                break CloseReason::Transport(err.to_string());
            }
        };

        self.state = SessionState::Closing;
        match &reason {
            CloseReason::Protocol(err) => {
                tracing::warn!(error = %err, "closing session on protocol error");
                let notice = RelayError::Protocol(err.clone()).to_string();
                let notice = outbound.send(RelayMessage::Notice(notice));
                let sent = tokio::select! {
                    biased;
                    () = token.cancelled() => Ok(Ok(())),
                    sent = tokio::time::timeout(FLUSH_TIMEOUT, notice) => sent,
                };
                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::debug!(error = %err, "could not send notice"),
                    Err(_) => tracing::debug!("notice not queued before timeout"),
                }
            }
            CloseReason::Transport(err) => tracing::debug!(error = %err, "transport failed"),
            CloseReason::Shutdown => tracing::debug!("closing session for shutdown"),
            CloseReason::ClientClosed => tracing::debug!("client closed connection"),
        }

        self.release().await;
        drop(outbound);
        let flush = if reason == CloseReason::Shutdown {
            SHUTDOWN_FLUSH_TIMEOUT
        } else {
            FLUSH_TIMEOUT
        };
        if tokio::time::timeout(flush, &mut writer).await.is_err() {
            tracing::debug!("outbound flush timed out");
            writer.abort();
        }
        self.state = SessionState::Closed;
        tracing::debug!(state = ?self.state, ?reason, "session closed");
    }

    /// Applies one client frame. Errors are transport failures only;
    /// everything else is reported to the client in-band.
    async fn handle(
        &mut self,
        message: ClientMessage,
        outbound: &Outbound,
    ) -> Result<(), RelayError> {
        match message {
            ClientMessage::Event(event) => self.submit(*event, outbound).await,
            ClientMessage::Req {
                subscription_id,
                filters,
            } => self.query(subscription_id, filters, outbound).await,
            ClientMessage::Close(subscription_id) => {
                self.cancel(&subscription_id).await;
                Ok(())
            }
            ClientMessage::Notice(notice) => {
                tracing::debug!(%notice, "client notice");
                Ok(())
            }
            ClientMessage::Eose(_) | ClientMessage::Ok { .. } | ClientMessage::Auth(_) => Ok(()),
        }
    }

    async fn submit(&self, event: Event, outbound: &Outbound) -> Result<(), RelayError> {
        let event_id = event.id.clone();
        let (accepted, message) = match self.validator.validate(&event) {
            Err(err) => {
                let err = RelayError::from(err);
                tracing::warn!(%event_id, error = %err, "event rejected");
                (false, err.to_string())
            }
            Ok(()) => match self.store.put(&event).await {
                Ok(PutOutcome::Inserted) => {
                    tracing::debug!(%event_id, kind = event.kind, "event stored");
                    (true, String::new())
                }
                Ok(PutOutcome::Duplicate) => {
                    (true, "duplicate: already have this event".to_string())
                }
                Err(err) => {
                    let err = RelayError::from(err);
                    tracing::error!(%event_id, error = %err, "could not store event");
                    (false, "error: could not save event".to_string())
                }
            },
        };
        outbound
            .send(RelayMessage::Ok {
                event_id,
                accepted,
                message,
            })
            .await
    }

    async fn query(
        &mut self,
        subscription_id: SubscriptionId,
        filters: FilterGroup,
        outbound: &Outbound,
    ) -> Result<(), RelayError> {
        // Live frames of a replaced subscription still in the queue are
        // discarded by the writer from here on.
        self.cancel(&subscription_id).await;

        let predicate = compile(&filters, self.max_limit);
        let events = match self.store.query(&predicate).await {
            Ok(events) => events,
            Err(err) => {
                tracing::error!(subscription = %subscription_id, error = %err, "query failed");
                return outbound
                    .send(RelayMessage::Closed(subscription_id, format!("error: {err}")))
                    .await;
            }
        };

        let replayed = events.len();
        for event in events {
            outbound
                .send(RelayMessage::Event(subscription_id.clone(), Arc::new(event)))
                .await?;
        }
        outbound
            .send(RelayMessage::Eose(subscription_id.clone()))
            .await?;

        // Replay and EOSE are already queued, so live frames land after them.
        let key = SubscriptionKey::new(self.connection, subscription_id.clone());
        let rx = self.registry.subscribe(key, filters).await;
        let token = self.token.child_token();
        self.delivery.spawn(deliver(
            subscription_id.clone(),
            rx,
            outbound.clone(),
            token.clone(),
        ));
        tracing::debug!(subscription = %subscription_id, replayed, "subscription opened");
        self.subscriptions.insert(subscription_id, token);
        Ok(())
    }

    /// Removes a subscription; unknown ids are ignored.
    async fn cancel(&mut self, subscription_id: &SubscriptionId) {
        let Some(token) = self.subscriptions.remove(subscription_id) else {
            return;
        };
        let key = SubscriptionKey::new(self.connection, subscription_id.clone());
        self.registry.unsubscribe(&key).await;
        token.cancel();
        tracing::debug!(subscription = %subscription_id, "subscription closed");
    }

    async fn release(&mut self) {
        let removed = self.registry.unsubscribe_connection(self.connection).await;
        self.subscriptions.clear();
        self.token.cancel();
        self.delivery.close();
        self.delivery.wait().await;
        tracing::debug!(removed, "subscriptions released");
    }
}

/// Forwards live events for one subscription until cancelled or the
/// registry drops the channel.
async fn deliver(
    subscription_id: SubscriptionId,
    mut rx: mpsc::Receiver<Arc<Event>>,
    outbound: Outbound,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = token.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        let frame = RelayMessage::Event(subscription_id.clone(), event);
        tokio::select! {
            biased;
            () = token.cancelled() => return,
            sent = outbound.send_live(frame, &token) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::domain::AcceptAll;
    use crate::store::MemoryEventStore;
    use tokio_util::sync::PollSender;

    /// Client side of an in-memory transport.
    struct Client {
        to_session: mpsc::UnboundedSender<Result<Message, String>>,
        from_session: mpsc::Receiver<Message>,
    }

    impl Client {
        fn send(&self, text: &str) {
            let _ = self.to_session.send(Ok(Message::text(text)));
        }

        async fn recv(&mut self) -> Option<String> {
            match tokio::time::timeout(Duration::from_secs(2), self.from_session.recv()).await {
                Ok(Some(Message::Text(text))) => Some(text.as_str().to_string()),
                Ok(_) => None,
                Err(_) => panic!("timed out waiting for a frame"),
            }
        }

        async fn assert_next(&mut self, want: &str) {
            let Some(got) = self.recv().await else {
                panic!("connection closed, wanted {want}");
            };
            assert_eq!(got, want);
        }
    }

    fn state() -> AppState<MemoryEventStore> {
        AppState::new(MemoryEventStore::new(), RelayConfig::default()).with_validator(AcceptAll)
    }

    fn open(state: &AppState<MemoryEventStore>) -> (Client, tokio::task::JoinHandle<()>) {
        let (to_session, inbound) = mpsc::unbounded_channel::<Result<Message, String>>();
        let (outbound, from_session) = mpsc::channel(64);
        let stream = futures_util::stream::unfold(inbound, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let session = Session::new(state);
        let task = tokio::spawn(session.run(PollSender::new(outbound), Box::pin(stream)));
        (
            Client {
                to_session,
                from_session,
            },
            task,
        )
    }

    /// EOSE is queued before the registry entry is created; wait for it.
    async fn registered(state: &AppState<MemoryEventStore>, count: usize) {
        for _ in 0..200 {
            if state.registry.len().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("registry never reached {count} entries");
    }

    fn event(id: &str, pubkey: &str, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at,
            kind: 1,
            tags: Vec::new(),
            content: String::new(),
            sig: String::new(),
        }
    }

    fn event_frame(event: &Event) -> String {
        let Ok(json) = serde_json::to_string(event) else {
            panic!("encode");
        };
        format!(r#"["EVENT",{json}]"#)
    }

    #[tokio::test]
    async fn submit_replies_ok_and_duplicate() {
        let state = state();
        let (mut client, _task) = open(&state);
        let frame = event_frame(&event("a1", "pk", 100));

        client.send(&frame);
        client.assert_next(r#"["OK","a1",true,""]"#).await;
        client.send(&frame);
        client
            .assert_next(r#"["OK","a1",true,"duplicate: already have this event"]"#)
            .await;
        assert_eq!(state.store.len().await, 1);
    }

    #[tokio::test]
    async fn invalid_event_is_rejected_without_closing() {
        let state = AppState::new(MemoryEventStore::new(), RelayConfig::default());
        let (mut client, _task) = open(&state);

        client.send(&event_frame(&event("a1", "pk", 100)));
        let Some(reply) = client.recv().await else {
            panic!("expected OK");
        };
        assert!(reply.starts_with(r#"["OK","a1",false,"invalid: "#));
        assert!(state.store.is_empty().await);

        client.send(r#"["CLOSE","nothing"]"#);
        client.send(r#"["REQ","s",{}]"#);
        client.assert_next(r#"["EOSE","s"]"#).await;
    }

    #[tokio::test]
    async fn replay_precedes_eose_then_live() {
        let state = state();
        let _ = state.store.put(&event("old", "pk1", 100)).await;
        let (mut client, _task) = open(&state);

        client.send(r#"["REQ","s",{"authors":["pk1"]}]"#);
        let Some(first) = client.recv().await else {
            panic!("expected replay");
        };
        assert!(first.starts_with(r#"["EVENT","s",{"id":"old""#));
        client.assert_next(r#"["EOSE","s"]"#).await;
        registered(&state, 1).await;

        let _ = state
            .registry
            .broadcast(Arc::new(event("new", "pk1", 200)))
            .await;
        let Some(live) = client.recv().await else {
            panic!("expected live event");
        };
        assert!(live.starts_with(r#"["EVENT","s",{"id":"new""#));
    }

    #[tokio::test]
    async fn close_stops_live_delivery() {
        let state = state();
        let (mut client, _task) = open(&state);

        client.send(r#"["REQ","s",{}]"#);
        client.assert_next(r#"["EOSE","s"]"#).await;
        client.send(r#"["CLOSE","s"]"#);
        // Round-trip a REQ so the CLOSE is known to be processed.
        client.send(r#"["REQ","t",{"kinds":[7]}]"#);
        client.assert_next(r#"["EOSE","t"]"#).await;

        let report = state
            .registry
            .broadcast(Arc::new(event("x", "pk", 1)))
            .await;
        assert_eq!(report.matched, 0);
    }

    #[tokio::test]
    async fn reusing_a_subscription_id_replaces_it() {
        let state = state();
        let (mut client, _task) = open(&state);

        client.send(r#"["REQ","s",{"authors":["pk1"]}]"#);
        client.assert_next(r#"["EOSE","s"]"#).await;
        client.send(r#"["REQ","s",{"authors":["pk2"]}]"#);
        client.assert_next(r#"["EOSE","s"]"#).await;
        registered(&state, 1).await;

        let report = state
            .registry
            .broadcast(Arc::new(event("x", "pk1", 1)))
            .await;
        assert_eq!(report.matched, 0);
        let report = state
            .registry
            .broadcast(Arc::new(event("y", "pk2", 1)))
            .await;
        assert_eq!(report.matched, 1);
    }

    #[tokio::test]
    async fn malformed_frame_sends_notice_and_closes() {
        let state = state();
        let (mut client, task) = open(&state);

        client.send(r#"["REQ","s",{}]"#);
        client.assert_next(r#"["EOSE","s"]"#).await;
        client.send(r#"["BOGUS"]"#);

        let Some(notice) = client.recv().await else {
            panic!("expected NOTICE");
        };
        assert!(notice.starts_with(r#"["NOTICE","invalid: "#));
        assert_eq!(client.recv().await, None);
        assert!(task.await.is_ok());
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_ends_the_session_and_releases_subscriptions() {
        let state = state();
        let (mut client, task) = open(&state);

        client.send(r#"["REQ","s",{}]"#);
        client.assert_next(r#"["EOSE","s"]"#).await;
        registered(&state, 1).await;

        state.shutdown.cancel();
        assert!(task.await.is_ok());
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_replay_the_client_never_reads() {
        let config = RelayConfig {
            outbound_capacity: 1,
            ..RelayConfig::default()
        };
        let state = AppState::new(MemoryEventStore::new(), config).with_validator(AcceptAll);
        for i in 0..20_u64 {
            let _ = state.store.put(&event(&format!("e{i}"), "pk", i)).await;
        }

        // Transport whose far end is never drained.
        let (to_session, inbound) = mpsc::unbounded_channel::<Result<Message, String>>();
        let (stalled, _never_read) = mpsc::channel::<Message>(1);
        let stream = futures_util::stream::unfold(inbound, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let task = tokio::spawn(
            Session::new(&state).run(PollSender::new(stalled), Box::pin(stream)),
        );

        let _ = to_session.send(Ok(Message::text(r#"["REQ","s",{}]"#)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());

        state.shutdown.cancel();
        let finished = tokio::time::timeout(Duration::from_secs(3), task).await;
        assert!(matches!(finished, Ok(Ok(()))), "session ignored shutdown");
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn filter_group_is_passed_to_registry() {
        let state = state();
        let (mut client, _task) = open(&state);

        client.send(r#"["REQ","s",{"kinds":[2]},{"authors":["pk9"]}]"#);
        client.assert_next(r#"["EOSE","s"]"#).await;
        registered(&state, 1).await;

        let report = state
            .registry
            .broadcast(Arc::new(event("z", "pk9", 5)))
            .await;
        assert_eq!(report.matched, 1);
    }
}
