use std::collections::HashSet;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::Result;
use crate::event::Event;
use crate::filter::Filter;
use crate::groups::{Group, GroupAdmin, GroupMember, Invite, Role};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Lazy sequence of query results, sorted by `created_at` descending with
/// ties broken by ascending id.
pub type EventStream = BoxStream<'static, Result<Event>>;

/// Abstract event persistence. Backends must be safe for concurrent use.
#[async_trait]
pub trait Store: Send + Sync {
    /// Idempotent setup (tables, indices).
    async fn init(&self) -> Result<()>;

    /// Persist an event. Returns false for a duplicate id.
    async fn store(&self, event: &Event) -> Result<bool>;

    /// Stream stored events matching any of the filters, in sort order.
    async fn query(&self, filters: &[Filter]) -> Result<EventStream>;

    /// Number of distinct stored events matching any of the filters.
    async fn count(&self, filters: &[Filter]) -> Result<u64>;

    /// Remove the event with `id` if it is authored by `pubkey`.
    /// Returns whether a row was removed.
    async fn delete(&self, id: &str, pubkey: &str) -> Result<bool>;

    /// Atomically supplant every event sharing the incoming event's
    /// replacement address, then insert it. Precedence is decided by the
    /// caller; the store only guarantees atomicity.
    async fn replace(&self, event: &Event) -> Result<bool>;
}

/// Persistence for the moderated-group state machine.
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn get_group(&self, group_id: &str) -> Result<Option<Group>>;
    async fn put_group(&self, group: &Group) -> Result<()>;
    /// Cascade: removes the group and every related row.
    async fn delete_group(&self, group_id: &str) -> Result<()>;

    /// Returns false if the pubkey was already a member.
    async fn add_member(&self, group_id: &str, pubkey: &str, joined_at: i64) -> Result<bool>;
    async fn remove_member(&self, group_id: &str, pubkey: &str) -> Result<bool>;
    async fn is_member(&self, group_id: &str, pubkey: &str) -> Result<bool>;
    async fn members(&self, group_id: &str) -> Result<Vec<GroupMember>>;
    /// Replace the whole member set (relay-authored member list events).
    async fn set_members(&self, group_id: &str, members: &[GroupMember]) -> Result<()>;

    async fn put_admin(&self, group_id: &str, pubkey: &str, roles: &[String]) -> Result<()>;
    async fn remove_admin(&self, group_id: &str, pubkey: &str) -> Result<bool>;
    async fn admin_roles(&self, group_id: &str, pubkey: &str) -> Result<Option<Vec<String>>>;
    async fn admins(&self, group_id: &str) -> Result<Vec<GroupAdmin>>;
    async fn set_admins(&self, group_id: &str, admins: &[GroupAdmin]) -> Result<()>;

    async fn put_role(&self, role: &Role) -> Result<()>;
    async fn roles(&self, group_id: &str) -> Result<Vec<Role>>;
    async fn set_roles(&self, group_id: &str, roles: &[Role]) -> Result<()>;

    async fn create_invite(&self, invite: &Invite) -> Result<()>;
    async fn get_invite(&self, group_id: &str, code: &str) -> Result<Option<Invite>>;
    /// Atomically consume one use of an invite if it is still valid at
    /// `now`. Returns whether a use was consumed.
    async fn use_invite(&self, group_id: &str, code: &str, now: i64) -> Result<bool>;

    async fn add_timeline_ref(
        &self,
        group_id: &str,
        event_id: &str,
        ref_hash: &str,
        created_at: i64,
    ) -> Result<()>;
    async fn has_timeline_ref(&self, group_id: &str, ref_hash: &str) -> Result<bool>;
}

/// NIP-40: whether the event carries an `expiration` tag in the past.
pub(crate) fn is_expired(event: &Event, now: i64) -> bool {
    event
        .tag_value("expiration")
        .and_then(|v| v.parse::<i64>().ok())
        .is_some_and(|t| t <= now)
}

/// Collect, order and bound an in-memory result set: per-filter limits,
/// union deduplicated by id, newest first.
pub(crate) fn select_events<'a, I>(events: I, filters: &[Filter], now: i64) -> Vec<Event>
where
    I: IntoIterator<Item = &'a Event>,
{
    let all: Vec<&Event> = events
        .into_iter()
        .filter(|e| !is_expired(e, now))
        .collect();

    let mut seen: HashSet<&str> = HashSet::new();
    let mut selected: Vec<Event> = Vec::new();
    for filter in filters {
        let mut matching: Vec<&Event> =
            all.iter().copied().filter(|e| filter.match_event(e)).collect();
        matching.sort_by(sort_newest_first);
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        for event in matching {
            if seen.insert(event.id.as_str()) {
                selected.push(event.clone());
            }
        }
    }
    selected.sort_by(|a, b| sort_newest_first(&a, &b));
    selected
}

pub(crate) fn sort_newest_first(a: &&Event, b: &&Event) -> std::cmp::Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Wrap an already-materialized result set as an [`EventStream`].
pub(crate) fn stream_from(events: Vec<Event>) -> EventStream {
    futures::stream::iter(events.into_iter().map(Ok)).boxed()
}
