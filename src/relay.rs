use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message as WsMessage;
use futures::TryStreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::event::{Event, EventClass};
use crate::filter::{match_any, Filter};
use crate::groups::{GroupGate, GroupOutcome, Groups};
use crate::keys::RelayKeys;
use crate::message::RelayMessage;
use crate::policy::{self, Pipeline, RejectEvent};
use crate::store::{GroupStore, Store};

/// Outcome of routing an event through the storage layer.
pub enum Acceptance {
    /// Persisted; carries the group side effects to run after the OK.
    Stored(GroupOutcome),
    /// Ephemeral kind: broadcast only.
    Ephemeral,
    /// The id is already known.
    Duplicate,
    /// Lost the replacement race to a newer event at the same address.
    Superseded,
}

/// Serializes replacements per address so concurrent writers to the same
/// `(kind, pubkey[, d])` cannot interleave their delete-then-insert.
#[derive(Default)]
struct AddressLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AddressLocks {
    async fn acquire(&self, address: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(address.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// The relay kernel: connection registry, policy pipeline, group state
/// machine and broadcast fan-out.
pub struct Relay {
    pub config: Config,
    pub pipeline: Pipeline,
    pub groups: Arc<Groups>,
    keys: RelayKeys,
    clients: RwLock<HashMap<u64, Arc<Connection>>>,
    next_id: AtomicU64,
    address_locks: AddressLocks,
}

impl Relay {
    pub fn new(
        config: Config,
        keys: RelayKeys,
        store: Arc<dyn Store>,
        group_store: Arc<dyn GroupStore>,
    ) -> Arc<Self> {
        Self::with_policies(config, keys, store, group_store, Vec::new())
    }

    /// Like [`Relay::new`], with additional rejection handlers appended to
    /// the general chain ahead of the group gate. Rate limiters plug in
    /// here.
    pub fn with_policies(
        config: Config,
        keys: RelayKeys,
        store: Arc<dyn Store>,
        group_store: Arc<dyn GroupStore>,
        extra: Vec<Arc<dyn RejectEvent>>,
    ) -> Arc<Self> {
        let groups = Arc::new(Groups::new(group_store, keys.clone()));

        let mut pipeline = Pipeline::new();
        install_standard_policies(&mut pipeline, &config);
        for handler in extra {
            pipeline.on_reject_event(handler);
        }
        pipeline.on_reject_event(Arc::new(GroupGate(groups.clone())));
        pipeline.with_store(store);

        Arc::new(Self {
            config,
            pipeline,
            groups,
            keys,
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            address_locks: AddressLocks::default(),
        })
    }

    pub fn relay_pubkey(&self) -> &str {
        self.keys.public_key()
    }

    /// Register a fresh connection context under a monotonic id.
    pub async fn register(&self, sender: mpsc::Sender<WsMessage>) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, sender));
        self.clients.write().await.insert(id, conn.clone());
        conn
    }

    /// Drop the context and, with it, every subscription it owns.
    pub async fn unregister(&self, id: u64) {
        self.clients.write().await.remove(&id);
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Route an accepted event into storage by its class. Replaceable and
    /// addressable kinds go through the per-address resolver; ephemerals
    /// skip storage entirely.
    pub async fn accept_event(&self, event: &Event) -> Result<Acceptance> {
        match event.classification(self.config.legacy_replaceable) {
            EventClass::Ephemeral => Ok(Acceptance::Ephemeral),
            EventClass::Replaceable | EventClass::Addressable => {
                self.resolve_replacement(event).await
            }
            EventClass::Regular => {
                let outcome = self.groups.apply(event).await?;
                if !self.pipeline.store(event).await? {
                    return Ok(Acceptance::Duplicate);
                }
                if event.has_tag("h") {
                    self.groups.record_timeline_ref(event).await?;
                }
                Ok(Acceptance::Stored(outcome))
            }
        }
    }

    /// Newest event wins per address; the delete-then-insert runs under a
    /// per-address lock on top of the store's own replace atomicity.
    async fn resolve_replacement(&self, event: &Event) -> Result<Acceptance> {
        let legacy = self.config.legacy_replaceable;
        let address = event
            .address(legacy)
            .ok_or_else(|| Error::Store("event has no replacement address".to_string()))?;
        let _guard = self.address_locks.acquire(&address).await;

        let probe = Filter {
            kinds: Some(vec![event.kind]),
            authors: Some(vec![event.pubkey.clone()]),
            ..Default::default()
        };
        let existing: Vec<Event> = self.pipeline.query(&[probe]).await?.try_collect().await?;
        let same_address: Vec<&Event> = existing
            .iter()
            .filter(|e| e.address(legacy).as_deref() == Some(address.as_str()))
            .collect();

        if same_address.iter().any(|e| e.id == event.id) {
            return Ok(Acceptance::Duplicate);
        }
        if same_address.iter().any(|e| !event.supersedes(e)) {
            debug!("event {} superseded at address {address}", event.id);
            return Ok(Acceptance::Superseded);
        }

        let outcome = self.groups.apply(event).await?;
        if !self.pipeline.replace(event).await? {
            return Err(Error::Store("no replace handler accepted the event".to_string()));
        }
        if event.has_tag("h") {
            self.groups.record_timeline_ref(event).await?;
        }
        Ok(Acceptance::Stored(outcome))
    }

    /// Fan an event out to every live subscription it matches, one copy
    /// per matching subscription. Writes are non-blocking; a full peer
    /// queue costs that peer the subscription.
    pub async fn broadcast(&self, event: &Event) {
        let clients: Vec<Arc<Connection>> =
            self.clients.read().await.values().cloned().collect();

        for conn in clients {
            let mut overloaded: Vec<String> = Vec::new();
            for (sub_id, filters) in conn.subscriptions_snapshot().await {
                if !match_any(&filters, event) {
                    continue;
                }
                match conn.try_send(&RelayMessage::event(sub_id.clone(), event.clone())) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => overloaded.push(sub_id),
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            for sub_id in overloaded {
                warn!("connection {}: subscription {sub_id} overloaded, dropping", conn.id);
                conn.unsubscribe(&sub_id).await;
                let _ = conn.try_send(&RelayMessage::notice(format!(
                    "subscription {sub_id} overloaded"
                )));
            }
        }
    }

    /// Run the side effects of a group event: scoped deletes, then the
    /// relay-authored follow-ups (stored and broadcast like any other
    /// event). Failures are logged and never reach the publisher.
    pub async fn apply_outcome(&self, outcome: GroupOutcome) {
        for (id, pubkey) in outcome.deletes {
            self.pipeline.delete(&id, &pubkey).await;
        }
        for follow_up in outcome.follow_ups {
            if let Err(e) = self.ingest(follow_up).await {
                error!("failed to ingest relay-authored event: {e}");
            }
        }
    }

    /// Store and broadcast a relay-authored event, bypassing the client
    /// rejection chains. Relay-authored kinds produce no follow-ups of
    /// their own, so this does not recurse.
    pub async fn ingest(&self, event: Event) -> Result<()> {
        match self.accept_event(&event).await? {
            Acceptance::Stored(outcome) => {
                self.broadcast(&event).await;
                for (id, pubkey) in outcome.deletes {
                    self.pipeline.delete(&id, &pubkey).await;
                }
            }
            Acceptance::Ephemeral => self.broadcast(&event).await,
            Acceptance::Duplicate | Acceptance::Superseded => {
                debug!("relay-authored event {} not stored", event.id)
            }
        }
        Ok(())
    }

    /// NIP-11 document.
    pub fn info_document(&self) -> serde_json::Value {
        let info = &self.config.info;
        serde_json::json!({
            "name": info.name,
            "description": info.description,
            "pubkey": self.keys.public_key(),
            "contact": info.contact,
            "supported_nips": info.supported_nips,
            "software": info.software,
            "version": info.version,
        })
    }
}

/// Wire the built-in rejection policies the configuration enables.
fn install_standard_policies(pipeline: &mut Pipeline, config: &Config) {
    let p = &config.policies;

    pipeline.on_reject_event(Arc::new(policy::SignatureShape));
    if !p.forbidden_kinds.is_empty() {
        pipeline.on_reject_event(Arc::new(policy::ForbidKinds(p.forbidden_kinds.clone())));
    }
    if let Some(max) = p.max_tags {
        pipeline.on_reject_event(Arc::new(policy::MaxTags(max)));
    }
    if let Some(max) = p.max_content_bytes {
        pipeline.on_reject_event(Arc::new(policy::MaxContentBytes(max)));
    }
    if let Some(secs) = p.created_at_future_secs {
        pipeline.on_reject_event(Arc::new(policy::CreatedAtFutureBound(secs)));
    }
    if let Some(secs) = p.created_at_past_secs {
        pipeline.on_reject_event(Arc::new(policy::CreatedAtPastBound(secs)));
    }
    if !p.blocked_pubkeys.is_empty() {
        pipeline.on_reject_event(Arc::new(policy::BlockedPubkeys(p.blocked_pubkeys.clone())));
    }
    if !p.allowed_pubkeys.is_empty() {
        pipeline.on_reject_event(Arc::new(policy::AllowedPubkeys(p.allowed_pubkeys.clone())));
    }
    if !p.auth_required_kinds.is_empty() {
        pipeline.on_reject_event(Arc::new(policy::AuthRequiredKinds(
            p.auth_required_kinds.clone(),
        )));
    }
    if !p.non_empty_content_kinds.is_empty() {
        pipeline.on_reject_event(Arc::new(policy::NonEmptyContentKinds(
            p.non_empty_content_kinds.clone(),
        )));
    }
    for (tag, values) in &p.blocked_tag_values {
        pipeline.on_reject_event(Arc::new(policy::BlockedTagValues {
            tag: tag.clone(),
            values: values.clone(),
        }));
    }
    if p.reject_expired {
        pipeline.on_reject_event(Arc::new(policy::RejectExpired));
    }

    // Kind-scoped chains.
    pipeline.on_kind_reject_event(crate::event::kind::METADATA, Arc::new(policy::MetadataShape));
    for (kind, tags) in &p.required_tags {
        let single: HashMap<u32, Vec<String>> = [(*kind, tags.clone())].into_iter().collect();
        pipeline.on_kind_reject_event(*kind, Arc::new(policy::RequiredTags(single)));
    }

    if config.rate_limit_events_per_min.is_some() {
        // Hook only: the limiter itself is injected via `with_policies`.
        info!("rate limiting configured; install a limiter via Relay::with_policies");
    }
}
