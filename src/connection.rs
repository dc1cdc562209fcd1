use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::event::{kind, Event};
use crate::filter::Filter;
use crate::message::{ClientMessage, RelayMessage};
use crate::relay::{Acceptance, Relay};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Per-socket context: subscription table, authentication state and the
/// outbound queue. Owned one-to-one by a live WebSocket; everything is
/// released when the socket unregisters.
pub struct Connection {
    pub id: u64,
    pub challenge: String,
    sender: mpsc::Sender<WsMessage>,
    subscriptions: RwLock<HashMap<String, Vec<Filter>>>,
    auth_pubkey: RwLock<Option<String>>,
    metadata: RwLock<HashMap<String, String>>,
}

impl Connection {
    pub fn new(id: u64, sender: mpsc::Sender<WsMessage>) -> Self {
        Self {
            id,
            challenge: nanoid::nanoid!(),
            sender,
            subscriptions: RwLock::new(HashMap::new()),
            auth_pubkey: RwLock::new(None),
            metadata: RwLock::new(HashMap::new()),
        }
    }

    /// Queue a frame, waiting for room. Returns false once the socket is
    /// gone.
    pub async fn send(&self, message: &RelayMessage) -> bool {
        self.sender
            .send(WsMessage::Text(message.as_json()))
            .await
            .is_ok()
    }

    /// Non-blocking queue attempt, used on the broadcast fan-out path.
    pub fn try_send(&self, message: &RelayMessage) -> std::result::Result<(), TrySendError<WsMessage>> {
        self.sender.try_send(WsMessage::Text(message.as_json()))
    }

    pub async fn auth_pubkey(&self) -> Option<String> {
        self.auth_pubkey.read().await.clone()
    }

    pub async fn set_auth_pubkey(&self, pubkey: String) {
        *self.auth_pubkey.write().await = Some(pubkey);
    }

    /// Record a subscription; an existing id is replaced.
    pub async fn subscribe(&self, id: String, filters: Vec<Filter>) {
        self.subscriptions.write().await.insert(id, filters);
    }

    pub async fn unsubscribe(&self, id: &str) -> bool {
        self.subscriptions.write().await.remove(id).is_some()
    }

    pub async fn has_subscription(&self, id: &str) -> bool {
        self.subscriptions.read().await.contains_key(id)
    }

    pub async fn subscriptions_snapshot(&self) -> Vec<(String, Vec<Filter>)> {
        self.subscriptions
            .read()
            .await
            .iter()
            .map(|(id, filters)| (id.clone(), filters.clone()))
            .collect()
    }

    pub async fn set_metadata(&self, key: &str, value: String) {
        self.metadata.write().await.insert(key.to_string(), value);
    }

    pub async fn metadata(&self, key: &str) -> Option<String> {
        self.metadata.read().await.get(key).cloned()
    }
}

/// Drive one WebSocket to completion: register the context, spawn the
/// writer and heartbeat tasks, issue the AUTH challenge, then process
/// frames in receipt order.
pub async fn serve_socket(relay: Arc<Relay>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsMessage>(relay.config.outbound_queue);
    let conn = relay.register(tx.clone()).await;
    debug!("connection {} opened", conn.id);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_tx.send(msg).await {
                warn!("failed to send message: {e}");
                break;
            }
        }
    });

    let tx_ping = tx.clone();
    let heartbeat_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            if tx_ping.send(WsMessage::Ping(Vec::new())).await.is_err() {
                break;
            }
        }
    });

    // NIP-42 challenge, first thing on the wire.
    let _ = conn.send(&RelayMessage::auth(conn.challenge.clone())).await;

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => handle_frame(&relay, &conn, &text).await,
            Ok(WsMessage::Ping(data)) => {
                let _ = tx.send(WsMessage::Pong(data)).await;
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("websocket error on connection {}: {e}", conn.id);
                break;
            }
        }
    }

    relay.unregister(conn.id).await;
    send_task.abort();
    heartbeat_task.abort();
    debug!("connection {} closed", conn.id);
}

/// Parse and dispatch a single frame. Every failure path ends in a
/// terminal wire message; nothing here tears down the connection.
pub async fn handle_frame(relay: &Relay, conn: &Arc<Connection>, text: &str) {
    match ClientMessage::from_json(text) {
        Ok(message) => {
            if let Err(e) = dispatch(relay, conn, message).await {
                error!("handler failed on connection {}: {e}", conn.id);
                let _ = conn.send(&RelayMessage::notice("error: internal error")).await;
            }
        }
        Err(Error::Json(e)) => {
            debug!("malformed frame on connection {}: {e}", conn.id);
            let _ = conn
                .send(&RelayMessage::notice("invalid: malformed json"))
                .await;
        }
        Err(e) => {
            let _ = conn
                .send(&RelayMessage::notice(format!("invalid: {e}")))
                .await;
        }
    }
}

async fn dispatch(relay: &Relay, conn: &Arc<Connection>, message: ClientMessage) -> Result<()> {
    match message {
        ClientMessage::Event(event) => handle_event(relay, conn, *event).await,
        ClientMessage::Req {
            subscription_id,
            filters,
        } => handle_req(relay, conn, subscription_id, filters).await,
        ClientMessage::Count {
            subscription_id,
            filters,
        } => handle_count(relay, conn, subscription_id, filters).await,
        ClientMessage::Close(subscription_id) => handle_close(conn, subscription_id).await,
        ClientMessage::Auth(event) => handle_auth(conn, *event).await,
    }
}

/// EVENT: verify, run the rejection chains, route by storage class, then
/// acknowledge. The OK frame always precedes any broadcast of the same
/// event.
async fn handle_event(relay: &Relay, conn: &Arc<Connection>, event: Event) -> Result<()> {
    if let Err(e) = event.verify() {
        let _ = conn
            .send(&RelayMessage::ok(&event.id, false, format!("{e}")))
            .await;
        return Ok(());
    }

    if let Some(reason) = relay.pipeline.reject_event(conn, &event).await {
        let _ = conn.send(&RelayMessage::ok(&event.id, false, reason)).await;
        return Ok(());
    }

    match relay.accept_event(&event).await {
        Ok(Acceptance::Stored(outcome)) => {
            let _ = conn.send(&RelayMessage::ok(&event.id, true, "")).await;
            relay.broadcast(&event).await;
            relay.apply_outcome(outcome).await;
            if event.kind == kind::DELETION {
                for target in event.tag_values("e") {
                    relay.pipeline.delete(target, &event.pubkey).await;
                }
            }
        }
        Ok(Acceptance::Ephemeral) => {
            let _ = conn.send(&RelayMessage::ok(&event.id, true, "")).await;
            relay.broadcast(&event).await;
        }
        Ok(Acceptance::Duplicate) => {
            let _ = conn
                .send(&RelayMessage::ok(
                    &event.id,
                    true,
                    "duplicate: already have this event",
                ))
                .await;
        }
        Ok(Acceptance::Superseded) => {
            let _ = conn
                .send(&RelayMessage::ok(&event.id, false, "replaced by newer"))
                .await;
        }
        Err(Error::InvalidEvent(reason)) => {
            let _ = conn.send(&RelayMessage::ok(&event.id, false, reason)).await;
        }
        Err(e) => {
            error!("failed to accept event {}: {e}", event.id);
            let _ = conn
                .send(&RelayMessage::ok(&event.id, false, "error: internal error"))
                .await;
        }
    }
    Ok(())
}

/// REQ: gate the filters, record the subscription, stream stored events in
/// sort order, then EOSE. The subscription stays live for broadcasts.
async fn handle_req(
    relay: &Relay,
    conn: &Arc<Connection>,
    subscription_id: String,
    mut filters: Vec<Filter>,
) -> Result<()> {
    if let Some(reason) = relay.pipeline.reject_filter(conn, &filters).await {
        let _ = conn.send(&RelayMessage::notice(reason)).await;
        return Ok(());
    }

    for filter in &mut filters {
        if let Some(limit) = filter.limit {
            filter.limit = Some(limit.min(relay.config.max_query_limit));
        }
    }

    conn.subscribe(subscription_id.clone(), filters.clone()).await;

    let mut stream = relay.pipeline.query(&filters).await?;
    while let Some(event) = stream.try_next().await? {
        // A CLOSE for this id cancels the stream mid-flight.
        if !conn.has_subscription(&subscription_id).await {
            return Ok(());
        }
        if !conn
            .send(&RelayMessage::event(subscription_id.clone(), event))
            .await
        {
            return Ok(());
        }
    }
    let _ = conn.send(&RelayMessage::eose(subscription_id)).await;
    Ok(())
}

async fn handle_count(
    relay: &Relay,
    conn: &Arc<Connection>,
    subscription_id: String,
    filters: Vec<Filter>,
) -> Result<()> {
    if let Some(reason) = relay.pipeline.reject_filter(conn, &filters).await {
        let _ = conn.send(&RelayMessage::notice(reason)).await;
        return Ok(());
    }
    let count = relay.pipeline.count(&filters).await?;
    let _ = conn
        .send(&RelayMessage::count(subscription_id, count))
        .await;
    Ok(())
}

async fn handle_close(conn: &Arc<Connection>, subscription_id: String) -> Result<()> {
    conn.unsubscribe(&subscription_id).await;
    let _ = conn
        .send(&RelayMessage::closed(subscription_id, "subscription closed"))
        .await;
    Ok(())
}

/// NIP-42: the response event must be kind 22242, carry our challenge,
/// be reasonably fresh and verify.
async fn handle_auth(conn: &Arc<Connection>, event: Event) -> Result<()> {
    if event.kind != kind::AUTH {
        let _ = conn
            .send(&RelayMessage::ok(&event.id, false, "invalid: wrong kind for auth"))
            .await;
        return Ok(());
    }
    if event.tag_value("challenge") != Some(conn.challenge.as_str()) {
        let _ = conn
            .send(&RelayMessage::ok(&event.id, false, "invalid: challenge mismatch"))
            .await;
        return Ok(());
    }
    if (Utc::now().timestamp() - event.created_at).abs() > 600 {
        let _ = conn
            .send(&RelayMessage::ok(&event.id, false, "invalid: auth event is stale"))
            .await;
        return Ok(());
    }
    if event.verify().is_err() {
        let _ = conn
            .send(&RelayMessage::ok(&event.id, false, "invalid: signature"))
            .await;
        return Ok(());
    }

    conn.set_auth_pubkey(event.pubkey.clone()).await;
    let _ = conn.send(&RelayMessage::ok(&event.id, true, "")).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> (Connection, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(2);
        (Connection::new(7, tx), rx)
    }

    #[tokio::test]
    async fn resubscribe_replaces_filters() {
        let (conn, _rx) = conn();
        let kinds1 = Filter {
            kinds: Some(vec![1]),
            ..Default::default()
        };
        let kinds2 = Filter {
            kinds: Some(vec![2]),
            ..Default::default()
        };

        conn.subscribe("s".to_string(), vec![kinds1]).await;
        conn.subscribe("s".to_string(), vec![kinds2.clone()]).await;

        let subs = conn.subscriptions_snapshot().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].1, vec![kinds2]);

        assert!(conn.unsubscribe("s").await);
        assert!(!conn.unsubscribe("s").await);
    }

    #[tokio::test]
    async fn try_send_reports_backpressure() {
        let (conn, mut rx) = conn();
        let notice = RelayMessage::notice("x");
        assert!(conn.try_send(&notice).is_ok());
        assert!(conn.try_send(&notice).is_ok());
        // Queue capacity is 2: the third frame must not block.
        assert!(matches!(conn.try_send(&notice), Err(TrySendError::Full(_))));

        rx.recv().await.unwrap();
        assert!(conn.try_send(&notice).is_ok());
    }

    #[tokio::test]
    async fn metadata_scratch_space() {
        let (conn, _rx) = conn();
        assert_eq!(conn.metadata("ip").await, None);
        conn.set_metadata("ip", "127.0.0.1".to_string()).await;
        assert_eq!(conn.metadata("ip").await.as_deref(), Some("127.0.0.1"));
    }
}
