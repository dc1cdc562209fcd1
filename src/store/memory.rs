use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::event::Event;
use crate::filter::Filter;
use crate::groups::{Group, GroupAdmin, GroupMember, Invite, Role};

use super::{select_events, stream_from, EventStream, GroupStore, Store};

#[derive(Default)]
struct GroupTables {
    groups: HashMap<String, Group>,
    // group id → pubkey → joined_at
    members: HashMap<String, HashMap<String, i64>>,
    // group id → pubkey → roles
    admins: HashMap<String, HashMap<String, Vec<String>>>,
    roles: HashMap<String, Vec<Role>>,
    // (group id, code) → invite
    invites: HashMap<(String, String), Invite>,
    // group id → refs
    timeline: HashMap<String, Vec<(String, String, i64)>>,
}

/// In-memory backend. Backs the test suite and DB-less deployments; events
/// and group state are lost on shutdown.
#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<HashMap<String, Event>>,
    groups: RwLock<GroupTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn store(&self, event: &Event) -> Result<bool> {
        let mut events = self.events.write().await;
        if events.contains_key(&event.id) {
            return Ok(false);
        }
        events.insert(event.id.clone(), event.clone());
        Ok(true)
    }

    async fn query(&self, filters: &[Filter]) -> Result<EventStream> {
        let events = self.events.read().await;
        let selected = select_events(events.values(), filters, Utc::now().timestamp());
        Ok(stream_from(selected))
    }

    async fn count(&self, filters: &[Filter]) -> Result<u64> {
        let events = self.events.read().await;
        let selected = select_events(events.values(), filters, Utc::now().timestamp());
        Ok(selected.len() as u64)
    }

    async fn delete(&self, id: &str, pubkey: &str) -> Result<bool> {
        let mut events = self.events.write().await;
        match events.get(id) {
            Some(event) if event.pubkey == pubkey => {
                events.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn replace(&self, event: &Event) -> Result<bool> {
        // Single write lock makes the delete-then-insert atomic.
        let mut events = self.events.write().await;
        let d = event.tag_value("d").unwrap_or("").to_string();
        let addressable = (30_000..40_000).contains(&event.kind);
        events.retain(|_, existing| {
            if existing.pubkey != event.pubkey || existing.kind != event.kind {
                return true;
            }
            if addressable {
                existing.tag_value("d").unwrap_or("") != d
            } else {
                false
            }
        });
        events.insert(event.id.clone(), event.clone());
        Ok(true)
    }
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn get_group(&self, group_id: &str) -> Result<Option<Group>> {
        Ok(self.groups.read().await.groups.get(group_id).cloned())
    }

    async fn put_group(&self, group: &Group) -> Result<()> {
        self.groups
            .write()
            .await
            .groups
            .insert(group.id.clone(), group.clone());
        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        let mut tables = self.groups.write().await;
        tables.groups.remove(group_id);
        tables.members.remove(group_id);
        tables.admins.remove(group_id);
        tables.roles.remove(group_id);
        tables.invites.retain(|(gid, _), _| gid != group_id);
        tables.timeline.remove(group_id);
        Ok(())
    }

    async fn add_member(&self, group_id: &str, pubkey: &str, joined_at: i64) -> Result<bool> {
        let mut tables = self.groups.write().await;
        let members = tables.members.entry(group_id.to_string()).or_default();
        if members.contains_key(pubkey) {
            return Ok(false);
        }
        members.insert(pubkey.to_string(), joined_at);
        Ok(true)
    }

    async fn remove_member(&self, group_id: &str, pubkey: &str) -> Result<bool> {
        let mut tables = self.groups.write().await;
        Ok(tables
            .members
            .get_mut(group_id)
            .is_some_and(|m| m.remove(pubkey).is_some()))
    }

    async fn is_member(&self, group_id: &str, pubkey: &str) -> Result<bool> {
        Ok(self
            .groups
            .read()
            .await
            .members
            .get(group_id)
            .is_some_and(|m| m.contains_key(pubkey)))
    }

    async fn members(&self, group_id: &str) -> Result<Vec<GroupMember>> {
        Ok(self
            .groups
            .read()
            .await
            .members
            .get(group_id)
            .map(|members| {
                members
                    .iter()
                    .map(|(pubkey, joined_at)| GroupMember {
                        group_id: group_id.to_string(),
                        pubkey: pubkey.clone(),
                        joined_at: *joined_at,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_members(&self, group_id: &str, members: &[GroupMember]) -> Result<()> {
        let mut tables = self.groups.write().await;
        let table = tables.members.entry(group_id.to_string()).or_default();
        table.clear();
        for member in members {
            table.insert(member.pubkey.clone(), member.joined_at);
        }
        Ok(())
    }

    async fn put_admin(&self, group_id: &str, pubkey: &str, roles: &[String]) -> Result<()> {
        self.groups
            .write()
            .await
            .admins
            .entry(group_id.to_string())
            .or_default()
            .insert(pubkey.to_string(), roles.to_vec());
        Ok(())
    }

    async fn remove_admin(&self, group_id: &str, pubkey: &str) -> Result<bool> {
        let mut tables = self.groups.write().await;
        Ok(tables
            .admins
            .get_mut(group_id)
            .is_some_and(|a| a.remove(pubkey).is_some()))
    }

    async fn admin_roles(&self, group_id: &str, pubkey: &str) -> Result<Option<Vec<String>>> {
        Ok(self
            .groups
            .read()
            .await
            .admins
            .get(group_id)
            .and_then(|a| a.get(pubkey).cloned()))
    }

    async fn admins(&self, group_id: &str) -> Result<Vec<GroupAdmin>> {
        Ok(self
            .groups
            .read()
            .await
            .admins
            .get(group_id)
            .map(|admins| {
                admins
                    .iter()
                    .map(|(pubkey, roles)| GroupAdmin {
                        group_id: group_id.to_string(),
                        pubkey: pubkey.clone(),
                        roles: roles.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_admins(&self, group_id: &str, admins: &[GroupAdmin]) -> Result<()> {
        let mut tables = self.groups.write().await;
        let table = tables.admins.entry(group_id.to_string()).or_default();
        table.clear();
        for admin in admins {
            table.insert(admin.pubkey.clone(), admin.roles.clone());
        }
        Ok(())
    }

    async fn put_role(&self, role: &Role) -> Result<()> {
        let mut tables = self.groups.write().await;
        let roles = tables.roles.entry(role.group_id.clone()).or_default();
        roles.retain(|r| r.name != role.name);
        roles.push(role.clone());
        Ok(())
    }

    async fn roles(&self, group_id: &str) -> Result<Vec<Role>> {
        Ok(self
            .groups
            .read()
            .await
            .roles
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_roles(&self, group_id: &str, roles: &[Role]) -> Result<()> {
        self.groups
            .write()
            .await
            .roles
            .insert(group_id.to_string(), roles.to_vec());
        Ok(())
    }

    async fn create_invite(&self, invite: &Invite) -> Result<()> {
        self.groups.write().await.invites.insert(
            (invite.group_id.clone(), invite.code.clone()),
            invite.clone(),
        );
        Ok(())
    }

    async fn get_invite(&self, group_id: &str, code: &str) -> Result<Option<Invite>> {
        Ok(self
            .groups
            .read()
            .await
            .invites
            .get(&(group_id.to_string(), code.to_string()))
            .cloned())
    }

    async fn use_invite(&self, group_id: &str, code: &str, now: i64) -> Result<bool> {
        let mut tables = self.groups.write().await;
        let Some(invite) = tables
            .invites
            .get_mut(&(group_id.to_string(), code.to_string()))
        else {
            return Ok(false);
        };
        if invite.used_count >= invite.max_uses {
            return Ok(false);
        }
        if invite.expires_at.is_some_and(|t| t <= now) {
            return Ok(false);
        }
        invite.used_count += 1;
        Ok(true)
    }

    async fn add_timeline_ref(
        &self,
        group_id: &str,
        event_id: &str,
        ref_hash: &str,
        created_at: i64,
    ) -> Result<()> {
        self.groups
            .write()
            .await
            .timeline
            .entry(group_id.to_string())
            .or_default()
            .push((event_id.to_string(), ref_hash.to_string(), created_at));
        Ok(())
    }

    async fn has_timeline_ref(&self, group_id: &str, ref_hash: &str) -> Result<bool> {
        Ok(self
            .groups
            .read()
            .await
            .timeline
            .get(group_id)
            .is_some_and(|refs| refs.iter().any(|(_, hash, _)| hash == ref_hash)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::RelayKeys;
    use futures::TryStreamExt;

    async fn collect(store: &MemoryStore, filters: &[Filter]) -> Vec<Event> {
        store
            .query(filters)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn store_rejects_duplicates() {
        let store = MemoryStore::new();
        let keys = RelayKeys::generate();
        let event = keys.sign_event(100, 1, vec![], "hi").unwrap();

        assert!(store.store(&event).await.unwrap());
        assert!(!store.store(&event).await.unwrap());
        assert_eq!(store.count(&[Filter::new()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_orders_newest_first_and_limits() {
        let store = MemoryStore::new();
        let keys = RelayKeys::generate();
        for t in [30, 10, 20] {
            let event = keys.sign_event(t, 1, vec![], &format!("n{t}")).unwrap();
            store.store(&event).await.unwrap();
        }

        let all = collect(&store, &[Filter::new()]).await;
        let stamps: Vec<i64> = all.iter().map(|e| e.created_at).collect();
        assert_eq!(stamps, vec![30, 20, 10]);

        let limited = collect(
            &store,
            &[Filter {
                limit: Some(2),
                ..Default::default()
            }],
        )
        .await;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].created_at, 30);
    }

    #[tokio::test]
    async fn disjunctive_filters_deduplicate() {
        let store = MemoryStore::new();
        let keys = RelayKeys::generate();
        let event = keys.sign_event(100, 1, vec![], "x").unwrap();
        store.store(&event).await.unwrap();

        let by_kind = Filter {
            kinds: Some(vec![1]),
            ..Default::default()
        };
        let by_author = Filter {
            authors: Some(vec![keys.public_key().to_string()]),
            ..Default::default()
        };
        let events = collect(&store, &[by_kind, by_author]).await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn delete_is_scoped_to_author() {
        let store = MemoryStore::new();
        let keys = RelayKeys::generate();
        let other = RelayKeys::generate();
        let event = keys.sign_event(100, 1, vec![], "x").unwrap();
        store.store(&event).await.unwrap();

        assert!(!store.delete(&event.id, other.public_key()).await.unwrap());
        assert!(store.delete(&event.id, keys.public_key()).await.unwrap());
        assert!(collect(&store, &[Filter::new()]).await.is_empty());
    }

    #[tokio::test]
    async fn replace_supplants_same_address() {
        let store = MemoryStore::new();
        let keys = RelayKeys::generate();

        let old = keys.sign_event(100, 0, vec![], r#"{"name":"a"}"#).unwrap();
        let new = keys.sign_event(200, 0, vec![], r#"{"name":"b"}"#).unwrap();
        store.store(&old).await.unwrap();
        store.replace(&new).await.unwrap();

        let events = collect(&store, &[Filter::new()]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, new.id);
    }

    #[tokio::test]
    async fn replace_addressable_keys_on_d_tag() {
        let store = MemoryStore::new();
        let keys = RelayKeys::generate();
        let d = |v: &str| vec![vec!["d".to_string(), v.to_string()]];

        let x1 = keys.sign_event(1, 30_000, d("x"), "").unwrap();
        let y = keys.sign_event(1, 30_000, d("y"), "").unwrap();
        store.store(&x1).await.unwrap();
        store.store(&y).await.unwrap();

        let x2 = keys.sign_event(2, 30_000, d("x"), "").unwrap();
        store.replace(&x2).await.unwrap();

        let mut events = collect(&store, &[Filter::new()]).await;
        events.sort_by(|a, b| a.id.cmp(&b.id));
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(events.len(), 2);
        assert!(ids.contains(&x2.id.as_str()));
        assert!(ids.contains(&y.id.as_str()));
    }

    #[tokio::test]
    async fn expired_events_hidden() {
        let store = MemoryStore::new();
        let keys = RelayKeys::generate();
        let expired = keys
            .sign_event(
                100,
                1,
                vec![vec!["expiration".to_string(), "1".to_string()]],
                "old",
            )
            .unwrap();
        store.store(&expired).await.unwrap();

        assert!(collect(&store, &[Filter::new()]).await.is_empty());
        assert_eq!(store.count(&[Filter::new()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invite_usage_is_bounded() {
        let store = MemoryStore::new();
        let invite = Invite {
            group_id: "g".to_string(),
            code: "c".to_string(),
            creator_pubkey: "p".repeat(64),
            created_at: 1,
            expires_at: None,
            max_uses: 1,
            used_count: 0,
        };
        store.create_invite(&invite).await.unwrap();

        assert!(store.use_invite("g", "c", 10).await.unwrap());
        assert!(!store.use_invite("g", "c", 10).await.unwrap());
        assert!(!store.use_invite("g", "missing", 10).await.unwrap());
    }

    #[tokio::test]
    async fn expired_invite_rejected() {
        let store = MemoryStore::new();
        let invite = Invite {
            group_id: "g".to_string(),
            code: "c".to_string(),
            creator_pubkey: "p".repeat(64),
            created_at: 1,
            expires_at: Some(5),
            max_uses: 10,
            used_count: 0,
        };
        store.create_invite(&invite).await.unwrap();
        assert!(store.use_invite("g", "c", 4).await.unwrap());
        assert!(!store.use_invite("g", "c", 6).await.unwrap());
    }

    #[tokio::test]
    async fn roles_upsert_by_name() {
        let store = MemoryStore::new();
        let role = |desc: &str| Role {
            group_id: "g".to_string(),
            name: "moderator".to_string(),
            description: desc.to_string(),
            permissions: vec!["delete-event".to_string()],
        };

        store.put_role(&role("first")).await.unwrap();
        store.put_role(&role("second")).await.unwrap();

        let roles = store.roles("g").await.unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].description, "second");
    }

    #[tokio::test]
    async fn group_cascade_delete() {
        let store = MemoryStore::new();
        let group = Group::new("g1", 1);
        store.put_group(&group).await.unwrap();
        store.add_member("g1", "alice", 1).await.unwrap();
        store.put_admin("g1", "alice", &["admin".to_string()]).await.unwrap();
        store
            .add_timeline_ref("g1", &"e".repeat(64), "deadbeef", 1)
            .await
            .unwrap();

        store.delete_group("g1").await.unwrap();
        assert!(store.get_group("g1").await.unwrap().is_none());
        assert!(!store.is_member("g1", "alice").await.unwrap());
        assert!(store.admin_roles("g1", "alice").await.unwrap().is_none());
        assert!(!store.has_timeline_ref("g1", "deadbeef").await.unwrap());
    }
}
