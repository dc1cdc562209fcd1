use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::keys::RelayKeys;
use crate::policy::RejectEvent;
use crate::store::GroupStore;

/// NIP-29 kind numbers.
pub mod kinds {
    pub const PUT_USER: u32 = 9000;
    pub const REMOVE_USER: u32 = 9001;
    pub const EDIT_METADATA: u32 = 9002;
    pub const DELETE_EVENT: u32 = 9005;
    pub const CREATE_GROUP: u32 = 9007;
    pub const DELETE_GROUP: u32 = 9008;
    pub const CREATE_INVITE: u32 = 9009;
    pub const JOIN_REQUEST: u32 = 9021;
    pub const LEAVE_REQUEST: u32 = 9022;
    pub const GROUP_METADATA: u32 = 39_000;
    pub const GROUP_ADMINS: u32 = 39_001;
    pub const GROUP_MEMBERS: u32 = 39_002;
    pub const GROUP_ROLES: u32 = 39_003;

    pub fn is_moderation(kind: u32) -> bool {
        (9000..=9020).contains(&kind)
    }

    pub fn is_relay_metadata(kind: u32) -> bool {
        (GROUP_METADATA..=GROUP_ROLES).contains(&kind)
    }
}

/// Length of the id prefix recorded as a timeline reference.
pub const TIMELINE_REF_LEN: usize = 8;

pub const CLOSED_GROUP_REASON: &str = "Group is closed and no valid invite code provided";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub picture: String,
    pub about: String,
    pub public: bool,
    pub open: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Group {
    /// Fresh group with the default flags: listed, but closed to
    /// uninvited joins.
    pub fn new(id: impl Into<String>, now: i64) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            picture: String::new(),
            about: String::new(),
            public: true,
            open: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub group_id: String,
    pub pubkey: String,
    pub joined_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAdmin {
    pub group_id: String,
    pub pubkey: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub group_id: String,
    pub name: String,
    pub description: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invite {
    pub group_id: String,
    pub code: String,
    pub creator_pubkey: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub max_uses: u32,
    pub used_count: u32,
}

/// Role a moderation kind demands of its publisher. The relay key
/// bypasses this entirely.
fn required_role(kind: u32) -> Option<&'static str> {
    match kind {
        kinds::PUT_USER
        | kinds::REMOVE_USER
        | kinds::EDIT_METADATA
        | kinds::CREATE_GROUP
        | kinds::DELETE_GROUP
        | kinds::CREATE_INVITE => Some("admin"),
        kinds::DELETE_EVENT => Some("moderator"),
        _ => None,
    }
}

/// Hot-path cache over group existence and membership. Every write to the
/// underlying rows must invalidate the group's entries.
#[derive(Default)]
struct GroupCache {
    groups: RwLock<HashMap<String, Option<Group>>>,
    members: RwLock<HashMap<(String, String), bool>>,
}

impl GroupCache {
    fn get_group(&self, id: &str) -> Option<Option<Group>> {
        self.groups.read().expect("cache lock poisoned").get(id).cloned()
    }

    fn put_group(&self, id: &str, group: Option<Group>) {
        self.groups
            .write()
            .expect("cache lock poisoned")
            .insert(id.to_string(), group);
    }

    fn get_member(&self, group_id: &str, pubkey: &str) -> Option<bool> {
        self.members
            .read()
            .expect("cache lock poisoned")
            .get(&(group_id.to_string(), pubkey.to_string()))
            .copied()
    }

    fn put_member(&self, group_id: &str, pubkey: &str, member: bool) {
        self.members
            .write()
            .expect("cache lock poisoned")
            .insert((group_id.to_string(), pubkey.to_string()), member);
    }

    fn invalidate(&self, group_id: &str) {
        self.groups.write().expect("cache lock poisoned").remove(group_id);
        self.members
            .write()
            .expect("cache lock poisoned")
            .retain(|(gid, _), _| gid != group_id);
    }
}

/// Side effects of a group event beyond storing the event itself.
#[derive(Default)]
pub struct GroupOutcome {
    /// Relay-authored events to store and broadcast after the triggering
    /// event is acknowledged.
    pub follow_ups: Vec<Event>,
    /// `(event id, pubkey)` pairs to hand to the delete chain.
    pub deletes: Vec<(String, String)>,
}

/// The moderated-group state machine: validation gate, state mutation and
/// relay-authored follow-up events.
pub struct Groups {
    store: Arc<dyn GroupStore>,
    keys: RelayKeys,
    cache: GroupCache,
}

impl Groups {
    pub fn new(store: Arc<dyn GroupStore>, keys: RelayKeys) -> Self {
        Self {
            store,
            keys,
            cache: GroupCache::default(),
        }
    }

    pub fn relay_pubkey(&self) -> &str {
        self.keys.public_key()
    }

    async fn group(&self, id: &str) -> Result<Option<Group>> {
        if let Some(cached) = self.cache.get_group(id) {
            return Ok(cached);
        }
        let group = self.store.get_group(id).await?;
        self.cache.put_group(id, group.clone());
        Ok(group)
    }

    async fn member(&self, group_id: &str, pubkey: &str) -> Result<bool> {
        if let Some(cached) = self.cache.get_member(group_id, pubkey) {
            return Ok(cached);
        }
        let member = self.store.is_member(group_id, pubkey).await?;
        self.cache.put_member(group_id, pubkey, member);
        Ok(member)
    }

    async fn authorized(&self, group_id: &str, pubkey: &str, kind: u32) -> Result<bool> {
        if pubkey == self.keys.public_key() {
            return Ok(true);
        }
        let Some(required) = required_role(kind) else {
            return Ok(false);
        };
        let roles = self.store.admin_roles(group_id, pubkey).await?;
        Ok(roles.is_some_and(|roles| roles.iter().any(|r| r == required)))
    }

    async fn invite_usable(&self, group_id: &str, code: &str, now: i64) -> Result<bool> {
        let Some(invite) = self.store.get_invite(group_id, code).await? else {
            return Ok(false);
        };
        Ok(invite.used_count < invite.max_uses && !invite.expires_at.is_some_and(|t| t <= now))
    }

    /// Pre-store gate: group existence, membership for non-public groups,
    /// moderation authorization, join/leave admissibility, timeline
    /// references. Relay-metadata kinds are gated on the relay key.
    pub async fn validate(&self, event: &Event) -> Result<Option<String>> {
        if kinds::is_relay_metadata(event.kind) {
            if event.pubkey != self.keys.public_key() {
                return Ok(Some("restricted: metadata kinds are relay-authored".to_string()));
            }
            return Ok(None);
        }

        let Some(group_id) = event.tag_value("h") else {
            return Ok(None);
        };
        let group_id = group_id.to_string();
        let now = Utc::now().timestamp();

        let group = self.group(&group_id).await?;
        if event.kind == kinds::CREATE_GROUP {
            if group.is_some() {
                return Ok(Some("invalid: group already exists".to_string()));
            }
            // A group that does not exist yet has no admins, so creation is
            // effectively relay-authorized.
            if !self.authorized(&group_id, &event.pubkey, event.kind).await? {
                return Ok(Some("restricted: missing moderation permission".to_string()));
            }
            return Ok(None);
        }
        let Some(group) = group else {
            return Ok(Some("invalid: group not found".to_string()));
        };

        for reference in event.tag_values("previous") {
            let prefix: String = reference.chars().take(TIMELINE_REF_LEN).collect();
            if !self.store.has_timeline_ref(&group_id, &prefix).await? {
                return Ok(Some("invalid: unknown timeline reference".to_string()));
            }
        }

        if kinds::is_moderation(event.kind) {
            if !self.authorized(&group_id, &event.pubkey, event.kind).await? {
                return Ok(Some("restricted: missing moderation permission".to_string()));
            }
            return Ok(None);
        }

        match event.kind {
            kinds::JOIN_REQUEST => {
                if self.member(&group_id, &event.pubkey).await? {
                    return Ok(Some("duplicate: already a member".to_string()));
                }
                if group.open {
                    return Ok(None);
                }
                if let Some(code) = event.tag_value("code") {
                    if self.invite_usable(&group_id, code, now).await? {
                        return Ok(None);
                    }
                }
                Ok(Some(CLOSED_GROUP_REASON.to_string()))
            }
            kinds::LEAVE_REQUEST => {
                if !self.member(&group_id, &event.pubkey).await? {
                    return Ok(Some("invalid: not a member".to_string()));
                }
                Ok(None)
            }
            _ => {
                if !group.public
                    && event.pubkey != self.keys.public_key()
                    && !self.member(&group_id, &event.pubkey).await?
                {
                    return Ok(Some("restricted: not a group member".to_string()));
                }
                Ok(None)
            }
        }
    }

    /// Run the state mutation for an admitted group event. Domain-level
    /// failures surface as [`Error::InvalidEvent`]; the dispatcher turns
    /// those into OK-false replies.
    pub async fn apply(&self, event: &Event) -> Result<GroupOutcome> {
        if kinds::is_relay_metadata(event.kind) {
            return self.apply_relay_metadata(event).await;
        }
        let Some(group_id) = event.tag_value("h").map(str::to_string) else {
            return Ok(GroupOutcome::default());
        };
        let now = Utc::now().timestamp();
        let mut outcome = GroupOutcome::default();

        match event.kind {
            kinds::JOIN_REQUEST => {
                let group = self.require_group(&group_id).await?;
                if !group.open {
                    let code = event
                        .tag_value("code")
                        .ok_or_else(|| Error::event(CLOSED_GROUP_REASON))?;
                    if !self.store.use_invite(&group_id, code, now).await? {
                        return Err(Error::event(CLOSED_GROUP_REASON));
                    }
                }
                if self.store.add_member(&group_id, &event.pubkey, now).await? {
                    info!("group {group_id}: {} joined", event.pubkey);
                    outcome.follow_ups.push(self.put_user_event(
                        &group_id,
                        &event.pubkey,
                        &[],
                        now,
                    )?);
                }
                self.cache.invalidate(&group_id);
            }
            kinds::LEAVE_REQUEST => {
                if self.store.remove_member(&group_id, &event.pubkey).await? {
                    info!("group {group_id}: {} left", event.pubkey);
                    outcome
                        .follow_ups
                        .push(self.remove_user_event(&group_id, &event.pubkey, now)?);
                }
                self.cache.invalidate(&group_id);
            }
            kinds::PUT_USER => {
                let target = event
                    .tag_value("p")
                    .ok_or_else(|| Error::event("invalid: missing p tag"))?
                    .to_string();
                self.store.add_member(&group_id, &target, now).await?;
                let roles: Vec<String> = event.tag_values("role").map(str::to_string).collect();
                if !roles.is_empty() {
                    self.store.put_admin(&group_id, &target, &roles).await?;
                }
                self.cache.invalidate(&group_id);
            }
            kinds::REMOVE_USER => {
                let target = event
                    .tag_value("p")
                    .ok_or_else(|| Error::event("invalid: missing p tag"))?
                    .to_string();
                self.store.remove_member(&group_id, &target).await?;
                self.store.remove_admin(&group_id, &target).await?;
                self.cache.invalidate(&group_id);
            }
            kinds::EDIT_METADATA => {
                let mut group = self.require_group(&group_id).await?;
                if let Some(name) = event.tag_value("name") {
                    group.name = name.to_string();
                }
                if let Some(picture) = event.tag_value("picture") {
                    group.picture = picture.to_string();
                }
                if let Some(about) = event.tag_value("about") {
                    group.about = about.to_string();
                }
                group.updated_at = now;
                self.store.put_group(&group).await?;
                self.cache.invalidate(&group_id);
            }
            kinds::DELETE_EVENT => {
                for target in event.tag_values("e") {
                    outcome
                        .deletes
                        .push((target.to_string(), event.pubkey.clone()));
                }
            }
            kinds::CREATE_GROUP => {
                let mut group = Group::new(group_id.clone(), now);
                if event.has_tag("private") {
                    group.public = false;
                }
                if event.has_tag("public") {
                    group.public = true;
                }
                group.open = event.has_tag("open");
                if let Some(name) = event.tag_value("name") {
                    group.name = name.to_string();
                }
                self.store.put_group(&group).await?;
                self.store.add_member(&group_id, &event.pubkey, now).await?;
                self.store
                    .put_admin(&group_id, &event.pubkey, &["admin".to_string()])
                    .await?;
                info!("group {group_id} created by {}", event.pubkey);
                self.cache.invalidate(&group_id);
            }
            kinds::DELETE_GROUP => {
                self.store.delete_group(&group_id).await?;
                info!("group {group_id} deleted");
                self.cache.invalidate(&group_id);
            }
            kinds::CREATE_INVITE => {
                let code = event
                    .tag_value("code")
                    .map(str::to_string)
                    .unwrap_or_else(|| nanoid::nanoid!());
                let max_uses = event
                    .tag_value("max_uses")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1);
                let expires_at = event.tag_value("expires_at").and_then(|v| v.parse().ok());
                self.store
                    .create_invite(&Invite {
                        group_id: group_id.clone(),
                        code,
                        creator_pubkey: event.pubkey.clone(),
                        created_at: now,
                        expires_at,
                        max_uses,
                        used_count: 0,
                    })
                    .await?;
            }
            _ => {}
        }

        Ok(outcome)
    }

    /// Relay-authored 39000..39003 replace the corresponding group state,
    /// keyed by the `d` tag.
    async fn apply_relay_metadata(&self, event: &Event) -> Result<GroupOutcome> {
        let group_id = event
            .tag_value("d")
            .ok_or_else(|| Error::event("invalid: missing d tag"))?
            .to_string();
        let now = Utc::now().timestamp();

        match event.kind {
            kinds::GROUP_METADATA => {
                let mut group = match self.group(&group_id).await? {
                    Some(group) => group,
                    None => Group::new(group_id.clone(), now),
                };
                if let Some(name) = event.tag_value("name") {
                    group.name = name.to_string();
                }
                if let Some(picture) = event.tag_value("picture") {
                    group.picture = picture.to_string();
                }
                if let Some(about) = event.tag_value("about") {
                    group.about = about.to_string();
                }
                if event.has_tag("private") {
                    group.public = false;
                }
                if event.has_tag("public") {
                    group.public = true;
                }
                if event.has_tag("open") {
                    group.open = true;
                }
                if event.has_tag("closed") {
                    group.open = false;
                }
                group.updated_at = now;
                self.store.put_group(&group).await?;
            }
            kinds::GROUP_ADMINS => {
                let admins: Vec<GroupAdmin> = event
                    .tags
                    .iter()
                    .filter(|t| t.len() > 1 && t[0] == "p")
                    .map(|t| GroupAdmin {
                        group_id: group_id.clone(),
                        pubkey: t[1].clone(),
                        roles: t[2..].to_vec(),
                    })
                    .collect();
                self.store.set_admins(&group_id, &admins).await?;
            }
            kinds::GROUP_MEMBERS => {
                let members: Vec<GroupMember> = event
                    .tag_values("p")
                    .map(|pubkey| GroupMember {
                        group_id: group_id.clone(),
                        pubkey: pubkey.to_string(),
                        joined_at: now,
                    })
                    .collect();
                self.store.set_members(&group_id, &members).await?;
            }
            kinds::GROUP_ROLES => {
                let roles: Vec<Role> = event
                    .tags
                    .iter()
                    .filter(|t| t.len() > 1 && t[0] == "role")
                    .map(|t| Role {
                        group_id: group_id.clone(),
                        name: t[1].clone(),
                        description: t.get(2).cloned().unwrap_or_default(),
                        permissions: Vec::new(),
                    })
                    .collect();
                self.store.set_roles(&group_id, &roles).await?;
            }
            _ => {}
        }

        self.cache.invalidate(&group_id);
        Ok(GroupOutcome::default())
    }

    /// Record the timeline reference of a stored group event.
    pub async fn record_timeline_ref(&self, event: &Event) -> Result<()> {
        let Some(group_id) = event.tag_value("h") else {
            return Ok(());
        };
        let prefix: String = event.id.chars().take(TIMELINE_REF_LEN).collect();
        debug!("group {group_id}: timeline ref {prefix}");
        self.store
            .add_timeline_ref(group_id, &event.id, &prefix, event.created_at)
            .await
    }

    async fn require_group(&self, group_id: &str) -> Result<Group> {
        self.group(group_id)
            .await?
            .ok_or_else(|| Error::event("invalid: group not found"))
    }

    fn put_user_event(
        &self,
        group_id: &str,
        pubkey: &str,
        roles: &[String],
        now: i64,
    ) -> Result<Event> {
        let mut tags = vec![
            vec!["h".to_string(), group_id.to_string()],
            vec!["p".to_string(), pubkey.to_string()],
        ];
        for role in roles {
            tags.push(vec!["role".to_string(), role.clone()]);
        }
        self.keys.sign_event(now, kinds::PUT_USER, tags, "")
    }

    fn remove_user_event(&self, group_id: &str, pubkey: &str, now: i64) -> Result<Event> {
        let tags = vec![
            vec!["h".to_string(), group_id.to_string()],
            vec!["p".to_string(), pubkey.to_string()],
        ];
        self.keys.sign_event(now, kinds::REMOVE_USER, tags, "")
    }
}

/// [`RejectEvent`] adapter placing the group gate in the rejection chain.
/// Store failures surface as a generic reason; detail goes to the log.
pub struct GroupGate(pub Arc<Groups>);

#[async_trait]
impl RejectEvent for GroupGate {
    async fn reject(&self, _conn: &Connection, event: &Event) -> Option<String> {
        match self.0.validate(event).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::error!("group validation failed for {}: {e}", event.id);
                Some("error: internal error".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn h(group: &str) -> Vec<String> {
        vec!["h".to_string(), group.to_string()]
    }

    struct Fixture {
        groups: Arc<Groups>,
        store: Arc<MemoryStore>,
        relay: RelayKeys,
        admin: RelayKeys,
        alice: RelayKeys,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let relay = RelayKeys::generate();
        let groups = Arc::new(Groups::new(store.clone(), relay.clone()));
        let admin = RelayKeys::generate();
        let alice = RelayKeys::generate();

        // The relay creates a closed group, then installs the admin.
        let create = relay
            .sign_event(100, kinds::CREATE_GROUP, vec![h("g1")], "")
            .unwrap();
        assert!(groups.validate(&create).await.unwrap().is_none());
        groups.apply(&create).await.unwrap();
        store
            .put_admin("g1", admin.public_key(), &["admin".to_string()])
            .await
            .unwrap();
        store.add_member("g1", admin.public_key(), 100).await.unwrap();

        Fixture {
            groups,
            store,
            relay,
            admin,
            alice,
        }
    }

    #[tokio::test]
    async fn create_group_bootstraps_creator() {
        let f = fixture().await;
        let group = f.store.get_group("g1").await.unwrap().unwrap();
        assert!(!group.open);
        assert_eq!(
            f.store
                .admin_roles("g1", f.relay.public_key())
                .await
                .unwrap(),
            Some(vec!["admin".to_string()])
        );
    }

    #[tokio::test]
    async fn create_group_requires_authorization() {
        let f = fixture().await;
        let create = f
            .alice
            .sign_event(1, kinds::CREATE_GROUP, vec![h("fresh")], "")
            .unwrap();
        assert_eq!(
            f.groups.validate(&create).await.unwrap().as_deref(),
            Some("restricted: missing moderation permission")
        );
    }

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let f = fixture().await;
        let again = f
            .admin
            .sign_event(101, kinds::CREATE_GROUP, vec![h("g1")], "")
            .unwrap();
        assert_eq!(
            f.groups.validate(&again).await.unwrap().as_deref(),
            Some("invalid: group already exists")
        );
    }

    #[tokio::test]
    async fn unknown_group_rejected() {
        let f = fixture().await;
        let event = f.alice.sign_event(1, 9, vec![h("nope")], "hi").unwrap();
        assert_eq!(
            f.groups.validate(&event).await.unwrap().as_deref(),
            Some("invalid: group not found")
        );
    }

    #[tokio::test]
    async fn closed_group_requires_invite() {
        let f = fixture().await;
        let join = f
            .alice
            .sign_event(1, kinds::JOIN_REQUEST, vec![h("g1")], "")
            .unwrap();
        assert_eq!(
            f.groups.validate(&join).await.unwrap().as_deref(),
            Some(CLOSED_GROUP_REASON)
        );
    }

    #[tokio::test]
    async fn invite_gated_join_and_exhaustion() {
        let f = fixture().await;
        let invite = f
            .admin
            .sign_event(
                2,
                kinds::CREATE_INVITE,
                vec![h("g1"), vec!["code".to_string(), "c1".to_string()]],
                "",
            )
            .unwrap();
        assert!(f.groups.validate(&invite).await.unwrap().is_none());
        f.groups.apply(&invite).await.unwrap();

        let join = |keys: &RelayKeys| {
            keys.sign_event(
                3,
                kinds::JOIN_REQUEST,
                vec![h("g1"), vec!["code".to_string(), "c1".to_string()]],
                "",
            )
            .unwrap()
        };

        let first = join(&f.alice);
        assert!(f.groups.validate(&first).await.unwrap().is_none());
        let outcome = f.groups.apply(&first).await.unwrap();
        assert_eq!(outcome.follow_ups.len(), 1);
        let put_user = &outcome.follow_ups[0];
        assert_eq!(put_user.kind, kinds::PUT_USER);
        assert_eq!(put_user.pubkey, f.relay.public_key());
        assert_eq!(put_user.tag_value("p"), Some(f.alice.public_key()));
        put_user.verify().unwrap();

        // max_uses defaults to 1: the next joiner is turned away.
        let bob = RelayKeys::generate();
        let second = join(&bob);
        assert_eq!(
            f.groups.validate(&second).await.unwrap().as_deref(),
            Some(CLOSED_GROUP_REASON)
        );
    }

    #[tokio::test]
    async fn open_group_join_and_leave() {
        let f = fixture().await;
        let open = Group {
            open: true,
            ..Group::new("g2", 1)
        };
        f.store.put_group(&open).await.unwrap();

        let join = f
            .alice
            .sign_event(5, kinds::JOIN_REQUEST, vec![h("g2")], "")
            .unwrap();
        assert!(f.groups.validate(&join).await.unwrap().is_none());
        f.groups.apply(&join).await.unwrap();
        assert!(f.store.is_member("g2", f.alice.public_key()).await.unwrap());

        let rejoin = f
            .alice
            .sign_event(6, kinds::JOIN_REQUEST, vec![h("g2")], "")
            .unwrap();
        assert_eq!(
            f.groups.validate(&rejoin).await.unwrap().as_deref(),
            Some("duplicate: already a member")
        );

        let leave = f
            .alice
            .sign_event(7, kinds::LEAVE_REQUEST, vec![h("g2")], "")
            .unwrap();
        assert!(f.groups.validate(&leave).await.unwrap().is_none());
        let outcome = f.groups.apply(&leave).await.unwrap();
        assert_eq!(outcome.follow_ups[0].kind, kinds::REMOVE_USER);
        assert!(!f.store.is_member("g2", f.alice.public_key()).await.unwrap());
    }

    #[tokio::test]
    async fn non_admin_moderation_always_rejected() {
        let f = fixture().await;
        for kind in [
            kinds::PUT_USER,
            kinds::REMOVE_USER,
            kinds::EDIT_METADATA,
            kinds::DELETE_EVENT,
            kinds::DELETE_GROUP,
            kinds::CREATE_INVITE,
            9003,
            9020,
        ] {
            let event = f.alice.sign_event(1, kind, vec![h("g1")], "").unwrap();
            assert_eq!(
                f.groups.validate(&event).await.unwrap().as_deref(),
                Some("restricted: missing moderation permission"),
                "kind {kind} must be rejected for non-admins"
            );
        }
    }

    #[tokio::test]
    async fn moderator_role_is_not_admin() {
        let f = fixture().await;
        let moderator = RelayKeys::generate();
        f.store
            .put_admin("g1", moderator.public_key(), &["moderator".to_string()])
            .await
            .unwrap();

        let delete = moderator
            .sign_event(
                1,
                kinds::DELETE_EVENT,
                vec![h("g1"), vec!["e".to_string(), "a".repeat(64)]],
                "",
            )
            .unwrap();
        assert!(f.groups.validate(&delete).await.unwrap().is_none());

        let edit = moderator
            .sign_event(1, kinds::EDIT_METADATA, vec![h("g1")], "")
            .unwrap();
        assert!(f.groups.validate(&edit).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn put_and_remove_user_mutate_membership() {
        let f = fixture().await;
        let target = RelayKeys::generate();
        let put = f
            .admin
            .sign_event(
                1,
                kinds::PUT_USER,
                vec![
                    h("g1"),
                    vec!["p".to_string(), target.public_key().to_string()],
                    vec!["role".to_string(), "moderator".to_string()],
                ],
                "",
            )
            .unwrap();
        assert!(f.groups.validate(&put).await.unwrap().is_none());
        f.groups.apply(&put).await.unwrap();
        assert!(f.store.is_member("g1", target.public_key()).await.unwrap());
        assert_eq!(
            f.store.admin_roles("g1", target.public_key()).await.unwrap(),
            Some(vec!["moderator".to_string()])
        );

        let remove = f
            .admin
            .sign_event(
                2,
                kinds::REMOVE_USER,
                vec![
                    h("g1"),
                    vec!["p".to_string(), target.public_key().to_string()],
                ],
                "",
            )
            .unwrap();
        f.groups.apply(&remove).await.unwrap();
        assert!(!f.store.is_member("g1", target.public_key()).await.unwrap());
        assert!(f
            .store
            .admin_roles("g1", target.public_key())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn edit_metadata_updates_group() {
        let f = fixture().await;
        let edit = f
            .admin
            .sign_event(
                9,
                kinds::EDIT_METADATA,
                vec![
                    h("g1"),
                    vec!["name".to_string(), "Pirates".to_string()],
                    vec!["about".to_string(), "arr".to_string()],
                ],
                "",
            )
            .unwrap();
        f.groups.apply(&edit).await.unwrap();
        let group = f.store.get_group("g1").await.unwrap().unwrap();
        assert_eq!(group.name, "Pirates");
        assert_eq!(group.about, "arr");
    }

    #[tokio::test]
    async fn delete_event_yields_delete_requests() {
        let f = fixture().await;
        let target_id = "e".repeat(64);
        let delete = f
            .admin
            .sign_event(
                1,
                kinds::DELETE_EVENT,
                vec![h("g1"), vec!["e".to_string(), target_id.clone()]],
                "",
            )
            .unwrap();
        let outcome = f.groups.apply(&delete).await.unwrap();
        assert_eq!(outcome.deletes, vec![(target_id, delete.pubkey.clone())]);
    }

    #[tokio::test]
    async fn delete_group_cascades() {
        let f = fixture().await;
        let delete = f
            .admin
            .sign_event(1, kinds::DELETE_GROUP, vec![h("g1")], "")
            .unwrap();
        f.groups.apply(&delete).await.unwrap();
        assert!(f.store.get_group("g1").await.unwrap().is_none());

        // Cache must not resurrect the group.
        let event = f.alice.sign_event(2, 9, vec![h("g1")], "hi").unwrap();
        assert_eq!(
            f.groups.validate(&event).await.unwrap().as_deref(),
            Some("invalid: group not found")
        );
    }

    #[tokio::test]
    async fn membership_gate_for_private_groups() {
        let f = fixture().await;
        let private = Group {
            public: false,
            ..Group::new("g3", 1)
        };
        f.store.put_group(&private).await.unwrap();
        f.store.add_member("g3", f.alice.public_key(), 1).await.unwrap();

        let member_msg = f.alice.sign_event(2, 9, vec![h("g3")], "hi").unwrap();
        assert!(f.groups.validate(&member_msg).await.unwrap().is_none());

        let outsider = RelayKeys::generate();
        let outsider_msg = outsider.sign_event(2, 9, vec![h("g3")], "hi").unwrap();
        assert_eq!(
            f.groups.validate(&outsider_msg).await.unwrap().as_deref(),
            Some("restricted: not a group member")
        );
    }

    #[tokio::test]
    async fn timeline_refs_are_validated() {
        let f = fixture().await;
        let anchor = f.admin.sign_event(1, 9, vec![h("g1")], "first").unwrap();
        f.groups.record_timeline_ref(&anchor).await.unwrap();

        let prefix: String = anchor.id.chars().take(TIMELINE_REF_LEN).collect();
        let chained = f
            .admin
            .sign_event(
                2,
                9,
                vec![h("g1"), vec!["previous".to_string(), prefix]],
                "second",
            )
            .unwrap();
        assert!(f.groups.validate(&chained).await.unwrap().is_none());

        let bogus = f
            .admin
            .sign_event(
                3,
                9,
                vec![h("g1"), vec!["previous".to_string(), "00000000".to_string()]],
                "third",
            )
            .unwrap();
        assert_eq!(
            f.groups.validate(&bogus).await.unwrap().as_deref(),
            Some("invalid: unknown timeline reference")
        );
    }

    #[tokio::test]
    async fn relay_metadata_kinds_require_relay_key() {
        let f = fixture().await;
        let fake = f
            .alice
            .sign_event(
                1,
                kinds::GROUP_MEMBERS,
                vec![vec!["d".to_string(), "g1".to_string()]],
                "",
            )
            .unwrap();
        assert!(f.groups.validate(&fake).await.unwrap().is_some());

        let genuine = f
            .relay
            .sign_event(
                1,
                kinds::GROUP_MEMBERS,
                vec![
                    vec!["d".to_string(), "g1".to_string()],
                    vec!["p".to_string(), f.alice.public_key().to_string()],
                ],
                "",
            )
            .unwrap();
        assert!(f.groups.validate(&genuine).await.unwrap().is_none());
        f.groups.apply(&genuine).await.unwrap();

        let members = f.store.members("g1").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].pubkey, f.alice.public_key());
    }

    #[tokio::test]
    async fn relay_admin_list_replaces_admins() {
        let f = fixture().await;
        let list = f
            .relay
            .sign_event(
                1,
                kinds::GROUP_ADMINS,
                vec![
                    vec!["d".to_string(), "g1".to_string()],
                    vec![
                        "p".to_string(),
                        f.alice.public_key().to_string(),
                        "admin".to_string(),
                        "moderator".to_string(),
                    ],
                ],
                "",
            )
            .unwrap();
        f.groups.apply(&list).await.unwrap();

        assert_eq!(
            f.store.admin_roles("g1", f.alice.public_key()).await.unwrap(),
            Some(vec!["admin".to_string(), "moderator".to_string()])
        );
        // The previous admin set was replaced wholesale.
        assert!(f
            .store
            .admin_roles("g1", f.admin.public_key())
            .await
            .unwrap()
            .is_none());
    }
}
