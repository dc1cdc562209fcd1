use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, QueryBuilder, Row};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::Filter;
use crate::groups::{Group, GroupAdmin, GroupMember, Invite, Role};

use super::{select_events, stream_from, EventStream, GroupStore, Store};

// Idempotent setup, run statement by statement.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        pubkey TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        kind INTEGER NOT NULL,
        tags JSONB NOT NULL,
        content TEXT NOT NULL,
        sig TEXT NOT NULL,
        d_tag TEXT,
        expires_at BIGINT
    )",
    "CREATE INDEX IF NOT EXISTS events_pubkey_idx ON events (pubkey)",
    "CREATE INDEX IF NOT EXISTS events_created_at_idx ON events (created_at)",
    "CREATE INDEX IF NOT EXISTS events_kind_idx ON events (kind)",
    "CREATE INDEX IF NOT EXISTS events_pubkey_kind_idx ON events (pubkey, kind)",
    "CREATE INDEX IF NOT EXISTS events_created_at_kind_idx ON events (created_at, kind)",
    "CREATE TABLE IF NOT EXISTS groups (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        picture TEXT NOT NULL DEFAULT '',
        about TEXT NOT NULL DEFAULT '',
        public BOOLEAN NOT NULL,
        open BOOLEAN NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS group_members (
        group_id TEXT NOT NULL,
        pubkey TEXT NOT NULL,
        joined_at BIGINT NOT NULL,
        PRIMARY KEY (group_id, pubkey)
    )",
    "CREATE TABLE IF NOT EXISTS group_admins (
        group_id TEXT NOT NULL,
        pubkey TEXT NOT NULL,
        roles JSONB NOT NULL DEFAULT '[]',
        PRIMARY KEY (group_id, pubkey)
    )",
    "CREATE TABLE IF NOT EXISTS group_roles (
        group_id TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        permissions JSONB NOT NULL DEFAULT '[]',
        PRIMARY KEY (group_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS group_invites (
        group_id TEXT NOT NULL,
        code TEXT NOT NULL,
        creator_pubkey TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        expires_at BIGINT,
        max_uses INTEGER NOT NULL DEFAULT 1,
        used_count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (group_id, code)
    )",
    "CREATE TABLE IF NOT EXISTS group_timeline_refs (
        group_id TEXT NOT NULL,
        event_id TEXT NOT NULL,
        ref_hash TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        PRIMARY KEY (group_id, event_id)
    )",
    "CREATE INDEX IF NOT EXISTS group_timeline_refs_hash_idx
        ON group_timeline_refs (group_id, ref_hash)",
];

/// Relational reference backend. Scalar filter keys are translated to SQL
/// with bound parameters; tag filters are enforced by post-filtering the
/// fetched rows in memory.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn row_to_event(row: &PgRow) -> Result<Event> {
        let tags: serde_json::Value = row.try_get("tags")?;
        Ok(Event {
            id: row.try_get("id")?,
            pubkey: row.try_get("pubkey")?,
            created_at: row.try_get("created_at")?,
            kind: row.try_get::<i32, _>("kind")? as u32,
            tags: serde_json::from_value(tags)?,
            content: row.try_get("content")?,
            sig: row.try_get("sig")?,
        })
    }

    /// One SELECT per filter; only scalar keys are translated. Prefixes are
    /// hex-validated before they reach a LIKE pattern, everything else is
    /// bound.
    async fn fetch_filter(&self, filter: &Filter, now: i64) -> Result<Vec<Event>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, pubkey, created_at, kind, tags, content, sig FROM events \
             WHERE (expires_at IS NULL OR expires_at > ",
        );
        qb.push_bind(now);
        qb.push(")");

        if let Some(kinds) = &filter.kinds {
            let kinds: Vec<i32> = kinds.iter().map(|k| *k as i32).collect();
            qb.push(" AND kind = ANY(");
            qb.push_bind(kinds);
            qb.push(")");
        }
        push_prefix_clause(&mut qb, "id", filter.ids.as_deref());
        push_prefix_clause(&mut qb, "pubkey", filter.authors.as_deref());
        if let Some(since) = filter.since {
            qb.push(" AND created_at >= ");
            qb.push_bind(since);
        }
        if let Some(until) = filter.until {
            qb.push(" AND created_at <= ");
            qb.push_bind(until);
        }

        qb.push(" ORDER BY created_at DESC, id ASC");
        if let Some(limit) = filter.limit {
            // Tag keys are matched after the fetch and may thin the page.
            if filter.tags.is_empty() {
                qb.push(" LIMIT ");
                qb.push_bind(limit as i64);
            }
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn fetch_all_filters(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        let now = Utc::now().timestamp();
        let mut fetched: Vec<Event> = Vec::new();
        for filter in filters {
            fetched.extend(self.fetch_filter(filter, now).await?);
        }
        Ok(select_events(fetched.iter(), filters, now))
    }
}

fn is_hex_prefix(s: &str) -> bool {
    !s.is_empty() && s.len() <= 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn push_prefix_clause(qb: &mut QueryBuilder<Postgres>, column: &str, prefixes: Option<&[String]>) {
    let Some(prefixes) = prefixes else {
        return;
    };
    // A malformed prefix can never match a hex column.
    let valid: Vec<&String> = prefixes.iter().filter(|p| is_hex_prefix(p)).collect();
    if valid.is_empty() {
        qb.push(" AND FALSE");
        return;
    }
    qb.push(format!(" AND ({column} LIKE "));
    for (i, prefix) in valid.iter().enumerate() {
        if i > 0 {
            qb.push(format!(" OR {column} LIKE "));
        }
        qb.push_bind(format!("{prefix}%"));
    }
    qb.push(")");
}

#[async_trait]
impl Store for PostgresStore {
    async fn init(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn store(&self, event: &Event) -> Result<bool> {
        let tags = serde_json::to_value(&event.tags)?;
        let d_tag = if (30_000..40_000).contains(&event.kind) {
            Some(event.tag_value("d").unwrap_or("").to_string())
        } else {
            None
        };
        let expires_at = event
            .tag_value("expiration")
            .and_then(|v| v.parse::<i64>().ok());

        let result = sqlx::query(
            "INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig, d_tag, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&event.id)
        .bind(&event.pubkey)
        .bind(event.created_at)
        .bind(event.kind as i32)
        .bind(tags)
        .bind(&event.content)
        .bind(&event.sig)
        .bind(d_tag)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query(&self, filters: &[Filter]) -> Result<EventStream> {
        Ok(stream_from(self.fetch_all_filters(filters).await?))
    }

    async fn count(&self, filters: &[Filter]) -> Result<u64> {
        Ok(self.fetch_all_filters(filters).await?.len() as u64)
    }

    async fn delete(&self, id: &str, pubkey: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM events WHERE id = $1 AND pubkey = $2")
            .bind(id)
            .bind(pubkey)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn replace(&self, event: &Event) -> Result<bool> {
        let tags = serde_json::to_value(&event.tags)?;
        let addressable = (30_000..40_000).contains(&event.kind);
        let d = event.tag_value("d").unwrap_or("").to_string();
        let expires_at = event
            .tag_value("expiration")
            .and_then(|v| v.parse::<i64>().ok());

        let mut tx = self.pool.begin().await?;
        if addressable {
            sqlx::query(
                "DELETE FROM events WHERE pubkey = $1 AND kind = $2 AND COALESCE(d_tag, '') = $3",
            )
            .bind(&event.pubkey)
            .bind(event.kind as i32)
            .bind(&d)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("DELETE FROM events WHERE pubkey = $1 AND kind = $2")
                .bind(&event.pubkey)
                .bind(event.kind as i32)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig, d_tag, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&event.id)
        .bind(&event.pubkey)
        .bind(event.created_at)
        .bind(event.kind as i32)
        .bind(tags)
        .bind(&event.content)
        .bind(&event.sig)
        .bind(addressable.then_some(d))
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }
}

fn roles_from_json(value: serde_json::Value) -> Result<Vec<String>> {
    serde_json::from_value(value).map_err(Error::from)
}

#[async_trait]
impl GroupStore for PostgresStore {
    async fn get_group(&self, group_id: &str) -> Result<Option<Group>> {
        let row = sqlx::query(
            "SELECT id, name, picture, about, public, open, created_at, updated_at \
             FROM groups WHERE id = $1",
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(Group {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                picture: row.try_get("picture")?,
                about: row.try_get("about")?,
                public: row.try_get("public")?,
                open: row.try_get("open")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn put_group(&self, group: &Group) -> Result<()> {
        sqlx::query(
            "INSERT INTO groups (id, name, picture, about, public, open, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (id) DO UPDATE SET \
                name = EXCLUDED.name, picture = EXCLUDED.picture, about = EXCLUDED.about, \
                public = EXCLUDED.public, open = EXCLUDED.open, updated_at = EXCLUDED.updated_at",
        )
        .bind(&group.id)
        .bind(&group.name)
        .bind(&group.picture)
        .bind(&group.about)
        .bind(group.public)
        .bind(group.open)
        .bind(group.created_at)
        .bind(group.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "group_timeline_refs",
            "group_invites",
            "group_roles",
            "group_admins",
            "group_members",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE group_id = $1"))
                .bind(group_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM groups WHERE id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn add_member(&self, group_id: &str, pubkey: &str, joined_at: i64) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO group_members (group_id, pubkey, joined_at) VALUES ($1, $2, $3) \
             ON CONFLICT (group_id, pubkey) DO NOTHING",
        )
        .bind(group_id)
        .bind(pubkey)
        .bind(joined_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_member(&self, group_id: &str, pubkey: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM group_members WHERE group_id = $1 AND pubkey = $2")
                .bind(group_id)
                .bind(pubkey)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_member(&self, group_id: &str, pubkey: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS one FROM group_members WHERE group_id = $1 AND pubkey = $2")
            .bind(group_id)
            .bind(pubkey)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn members(&self, group_id: &str) -> Result<Vec<GroupMember>> {
        let rows =
            sqlx::query("SELECT pubkey, joined_at FROM group_members WHERE group_id = $1")
                .bind(group_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| {
                Ok(GroupMember {
                    group_id: group_id.to_string(),
                    pubkey: row.try_get("pubkey")?,
                    joined_at: row.try_get("joined_at")?,
                })
            })
            .collect()
    }

    async fn set_members(&self, group_id: &str, members: &[GroupMember]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM group_members WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        for member in members {
            sqlx::query(
                "INSERT INTO group_members (group_id, pubkey, joined_at) VALUES ($1, $2, $3)",
            )
            .bind(group_id)
            .bind(&member.pubkey)
            .bind(member.joined_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn put_admin(&self, group_id: &str, pubkey: &str, roles: &[String]) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_admins (group_id, pubkey, roles) VALUES ($1, $2, $3) \
             ON CONFLICT (group_id, pubkey) DO UPDATE SET roles = EXCLUDED.roles",
        )
        .bind(group_id)
        .bind(pubkey)
        .bind(serde_json::to_value(roles)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_admin(&self, group_id: &str, pubkey: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM group_admins WHERE group_id = $1 AND pubkey = $2")
            .bind(group_id)
            .bind(pubkey)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn admin_roles(&self, group_id: &str, pubkey: &str) -> Result<Option<Vec<String>>> {
        let row =
            sqlx::query("SELECT roles FROM group_admins WHERE group_id = $1 AND pubkey = $2")
                .bind(group_id)
                .bind(pubkey)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|row| roles_from_json(row.try_get("roles")?)).transpose()
    }

    async fn admins(&self, group_id: &str) -> Result<Vec<GroupAdmin>> {
        let rows = sqlx::query("SELECT pubkey, roles FROM group_admins WHERE group_id = $1")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(GroupAdmin {
                    group_id: group_id.to_string(),
                    pubkey: row.try_get("pubkey")?,
                    roles: roles_from_json(row.try_get("roles")?)?,
                })
            })
            .collect()
    }

    async fn set_admins(&self, group_id: &str, admins: &[GroupAdmin]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM group_admins WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        for admin in admins {
            sqlx::query("INSERT INTO group_admins (group_id, pubkey, roles) VALUES ($1, $2, $3)")
                .bind(group_id)
                .bind(&admin.pubkey)
                .bind(serde_json::to_value(&admin.roles)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn put_role(&self, role: &Role) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_roles (group_id, name, description, permissions) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (group_id, name) DO UPDATE SET \
                description = EXCLUDED.description, permissions = EXCLUDED.permissions",
        )
        .bind(&role.group_id)
        .bind(&role.name)
        .bind(&role.description)
        .bind(serde_json::to_value(&role.permissions)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn roles(&self, group_id: &str) -> Result<Vec<Role>> {
        let rows =
            sqlx::query("SELECT name, description, permissions FROM group_roles WHERE group_id = $1")
                .bind(group_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| {
                Ok(Role {
                    group_id: group_id.to_string(),
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                    permissions: serde_json::from_value(row.try_get("permissions")?)?,
                })
            })
            .collect()
    }

    async fn set_roles(&self, group_id: &str, roles: &[Role]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM group_roles WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        for role in roles {
            sqlx::query(
                "INSERT INTO group_roles (group_id, name, description, permissions) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(group_id)
            .bind(&role.name)
            .bind(&role.description)
            .bind(serde_json::to_value(&role.permissions)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn create_invite(&self, invite: &Invite) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_invites \
                (group_id, code, creator_pubkey, created_at, expires_at, max_uses, used_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&invite.group_id)
        .bind(&invite.code)
        .bind(&invite.creator_pubkey)
        .bind(invite.created_at)
        .bind(invite.expires_at)
        .bind(invite.max_uses as i32)
        .bind(invite.used_count as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_invite(&self, group_id: &str, code: &str) -> Result<Option<Invite>> {
        let row = sqlx::query(
            "SELECT creator_pubkey, created_at, expires_at, max_uses, used_count \
             FROM group_invites WHERE group_id = $1 AND code = $2",
        )
        .bind(group_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(Invite {
                group_id: group_id.to_string(),
                code: code.to_string(),
                creator_pubkey: row.try_get("creator_pubkey")?,
                created_at: row.try_get("created_at")?,
                expires_at: row.try_get("expires_at")?,
                max_uses: row.try_get::<i32, _>("max_uses")? as u32,
                used_count: row.try_get::<i32, _>("used_count")? as u32,
            })
        })
        .transpose()
    }

    async fn use_invite(&self, group_id: &str, code: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE group_invites SET used_count = used_count + 1 \
             WHERE group_id = $1 AND code = $2 AND used_count < max_uses \
               AND (expires_at IS NULL OR expires_at > $3)",
        )
        .bind(group_id)
        .bind(code)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_timeline_ref(
        &self,
        group_id: &str,
        event_id: &str,
        ref_hash: &str,
        created_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_timeline_refs (group_id, event_id, ref_hash, created_at) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (group_id, event_id) DO NOTHING",
        )
        .bind(group_id)
        .bind(event_id)
        .bind(ref_hash)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_timeline_ref(&self, group_id: &str, ref_hash: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM group_timeline_refs WHERE group_id = $1 AND ref_hash = $2",
        )
        .bind(group_id)
        .bind(ref_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}
