use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use tracing::warn;

use crate::connection::Connection;
use crate::error::Result;
use crate::event::{kind, Event};
use crate::filter::Filter;
use crate::store::{stream_from, EventStream, Store};

/// Event gate. Returning `Some(reason)` rejects the event; the reason is
/// sent back in the OK frame.
#[async_trait]
pub trait RejectEvent: Send + Sync {
    async fn reject(&self, conn: &Connection, event: &Event) -> Option<String>;
}

/// Filter gate for incoming REQ/COUNT subscriptions.
#[async_trait]
pub trait RejectFilter: Send + Sync {
    async fn reject(&self, conn: &Connection, filters: &[Filter]) -> Option<String>;
}

/// Ordered handler chains the dispatcher runs per message.
///
/// Rejection chains short-circuit on the first rejection. The store and
/// replace chains stop at the first handler that accepts. Query and count
/// handlers all contribute; delete handlers all run, with failures logged
/// and swallowed.
#[derive(Default)]
pub struct Pipeline {
    reject_event: Vec<Arc<dyn RejectEvent>>,
    reject_filter: Vec<Arc<dyn RejectFilter>>,
    kind_reject_event: HashMap<u32, Vec<Arc<dyn RejectEvent>>>,
    store_event: Vec<Arc<dyn Store>>,
    query_events: Vec<Arc<dyn Store>>,
    count_events: Vec<Arc<dyn Store>>,
    delete_event: Vec<Arc<dyn Store>>,
    replace_event: Vec<Arc<dyn Store>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn on_reject_event(&mut self, handler: Arc<dyn RejectEvent>) -> &mut Self {
        self.reject_event.push(handler);
        self
    }

    pub fn on_reject_filter(&mut self, handler: Arc<dyn RejectFilter>) -> &mut Self {
        self.reject_filter.push(handler);
        self
    }

    pub fn on_kind_reject_event(&mut self, kind: u32, handler: Arc<dyn RejectEvent>) -> &mut Self {
        self.kind_reject_event.entry(kind).or_default().push(handler);
        self
    }

    /// Register a storage backend on every storage-facing chain.
    pub fn with_store(&mut self, store: Arc<dyn Store>) -> &mut Self {
        self.store_event.push(store.clone());
        self.query_events.push(store.clone());
        self.count_events.push(store.clone());
        self.delete_event.push(store.clone());
        self.replace_event.push(store);
        self
    }

    /// General chain first, then any kind-specific chain, in insertion
    /// order. First rejection wins.
    pub async fn reject_event(&self, conn: &Connection, event: &Event) -> Option<String> {
        for handler in &self.reject_event {
            if let Some(reason) = handler.reject(conn, event).await {
                return Some(reason);
            }
        }
        if let Some(chain) = self.kind_reject_event.get(&event.kind) {
            for handler in chain {
                if let Some(reason) = handler.reject(conn, event).await {
                    return Some(reason);
                }
            }
        }
        None
    }

    pub async fn reject_filter(&self, conn: &Connection, filters: &[Filter]) -> Option<String> {
        for handler in &self.reject_filter {
            if let Some(reason) = handler.reject(conn, filters).await {
                return Some(reason);
            }
        }
        None
    }

    /// First handler that accepts wins; later handlers do not run.
    pub async fn store(&self, event: &Event) -> Result<bool> {
        for store in &self.store_event {
            if store.store(event).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Concatenate handler outputs, deduplicated by id, in sort order. With
    /// a single handler the stream passes through lazily.
    pub async fn query(&self, filters: &[Filter]) -> Result<EventStream> {
        match self.query_events.len() {
            0 => Ok(stream_from(Vec::new())),
            1 => self.query_events[0].query(filters).await,
            _ => {
                let mut seen: HashSet<String> = HashSet::new();
                let mut merged: Vec<Event> = Vec::new();
                for store in &self.query_events {
                    let mut stream = store.query(filters).await?;
                    while let Some(event) = stream.try_next().await? {
                        if seen.insert(event.id.clone()) {
                            merged.push(event);
                        }
                    }
                }
                merged.sort_by(|a, b| {
                    b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))
                });
                Ok(stream_from(merged))
            }
        }
    }

    pub async fn count(&self, filters: &[Filter]) -> Result<u64> {
        let mut total = 0;
        for store in &self.count_events {
            total += store.count(filters).await?;
        }
        Ok(total)
    }

    /// All handlers run; failures are logged but never block.
    pub async fn delete(&self, id: &str, pubkey: &str) {
        for store in &self.delete_event {
            if let Err(e) = store.delete(id, pubkey).await {
                warn!("delete handler failed for {id}: {e}");
            }
        }
    }

    /// First handler that accepts wins. Handlers own replacement atomicity.
    pub async fn replace(&self, event: &Event) -> Result<bool> {
        for store in &self.replace_event {
            if store.replace(event).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ---- standard policies -------------------------------------------------

pub struct ForbidKinds(pub HashSet<u32>);

#[async_trait]
impl RejectEvent for ForbidKinds {
    async fn reject(&self, _conn: &Connection, event: &Event) -> Option<String> {
        self.0
            .contains(&event.kind)
            .then(|| format!("blocked: kind {} not accepted here", event.kind))
    }
}

pub struct MaxTags(pub usize);

#[async_trait]
impl RejectEvent for MaxTags {
    async fn reject(&self, _conn: &Connection, event: &Event) -> Option<String> {
        (event.tags.len() > self.0).then(|| format!("invalid: too many tags (max {})", self.0))
    }
}

pub struct MaxContentBytes(pub usize);

#[async_trait]
impl RejectEvent for MaxContentBytes {
    async fn reject(&self, _conn: &Connection, event: &Event) -> Option<String> {
        (event.content.len() > self.0)
            .then(|| format!("invalid: content larger than {} bytes", self.0))
    }
}

/// Rejects events timestamped more than the allowed drift into the future.
pub struct CreatedAtFutureBound(pub i64);

#[async_trait]
impl RejectEvent for CreatedAtFutureBound {
    async fn reject(&self, _conn: &Connection, event: &Event) -> Option<String> {
        (event.created_at > Utc::now().timestamp() + self.0)
            .then(|| "invalid: created_at is too far in the future".to_string())
    }
}

/// Rejects events older than the allowed age.
pub struct CreatedAtPastBound(pub i64);

#[async_trait]
impl RejectEvent for CreatedAtPastBound {
    async fn reject(&self, _conn: &Connection, event: &Event) -> Option<String> {
        (event.created_at < Utc::now().timestamp() - self.0)
            .then(|| "invalid: created_at is too far in the past".to_string())
    }
}

pub struct BlockedPubkeys(pub HashSet<String>);

#[async_trait]
impl RejectEvent for BlockedPubkeys {
    async fn reject(&self, _conn: &Connection, event: &Event) -> Option<String> {
        self.0
            .contains(&event.pubkey)
            .then(|| "blocked: pubkey is not welcome here".to_string())
    }
}

/// When configured, only the listed pubkeys may publish.
pub struct AllowedPubkeys(pub HashSet<String>);

#[async_trait]
impl RejectEvent for AllowedPubkeys {
    async fn reject(&self, _conn: &Connection, event: &Event) -> Option<String> {
        (!self.0.contains(&event.pubkey))
            .then(|| "restricted: pubkey is not on the allow list".to_string())
    }
}

/// NIP-42 gate for selected kinds.
pub struct AuthRequiredKinds(pub HashSet<u32>);

#[async_trait]
impl RejectEvent for AuthRequiredKinds {
    async fn reject(&self, conn: &Connection, event: &Event) -> Option<String> {
        if !self.0.contains(&event.kind) {
            return None;
        }
        match conn.auth_pubkey().await {
            Some(_) => None,
            None => Some(format!(
                "auth-required: kind {} requires authentication",
                event.kind
            )),
        }
    }
}

/// Per-kind required tag names.
pub struct RequiredTags(pub HashMap<u32, Vec<String>>);

#[async_trait]
impl RejectEvent for RequiredTags {
    async fn reject(&self, _conn: &Connection, event: &Event) -> Option<String> {
        let required = self.0.get(&event.kind)?;
        required
            .iter()
            .find(|name| !event.has_tag(name))
            .map(|name| format!("invalid: kind {} requires a '{}' tag", event.kind, name))
    }
}

pub struct NonEmptyContentKinds(pub HashSet<u32>);

#[async_trait]
impl RejectEvent for NonEmptyContentKinds {
    async fn reject(&self, _conn: &Connection, event: &Event) -> Option<String> {
        (self.0.contains(&event.kind) && event.content.is_empty())
            .then(|| format!("invalid: kind {} requires non-empty content", event.kind))
    }
}

/// Blocks events carrying a given value under a given tag name.
pub struct BlockedTagValues {
    pub tag: String,
    pub values: HashSet<String>,
}

#[async_trait]
impl RejectEvent for BlockedTagValues {
    async fn reject(&self, _conn: &Connection, event: &Event) -> Option<String> {
        event
            .tag_values(&self.tag)
            .any(|v| self.values.contains(v))
            .then(|| format!("blocked: '{}' tag value not accepted", self.tag))
    }
}

/// Shape check kept as an explicit chain entry even though full
/// verification happens at parse time.
pub struct SignatureShape;

#[async_trait]
impl RejectEvent for SignatureShape {
    async fn reject(&self, _conn: &Connection, event: &Event) -> Option<String> {
        (event.sig.len() != 128 || hex::decode(&event.sig).is_err())
            .then(|| "invalid: malformed signature".to_string())
    }
}

/// Kind-0 content must be a JSON object carrying a name.
pub struct MetadataShape;

#[async_trait]
impl RejectEvent for MetadataShape {
    async fn reject(&self, _conn: &Connection, event: &Event) -> Option<String> {
        if event.kind != kind::METADATA {
            return None;
        }
        let parsed: std::result::Result<serde_json::Value, _> =
            serde_json::from_str(&event.content);
        match parsed {
            Ok(value) if value.get("name").is_some_and(|n| n.is_string()) => None,
            _ => Some("invalid: metadata content must be a json object with a name".to_string()),
        }
    }
}

/// NIP-40: refuse events that are already expired on arrival.
pub struct RejectExpired;

#[async_trait]
impl RejectEvent for RejectExpired {
    async fn reject(&self, _conn: &Connection, event: &Event) -> Option<String> {
        let expired = event
            .tag_value("expiration")
            .and_then(|v| v.parse::<i64>().ok())
            .is_some_and(|t| t <= Utc::now().timestamp());
        expired.then(|| "invalid: event has already expired".to_string())
    }
}
