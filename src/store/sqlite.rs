use super::KeyValueStore;
use crate::conversation::{
    Conversation, ConversationStatus, ConversationStore, Message, MessageRole, MessageStore,
};
use crate::events::{ChannelKind, EventKind};
use crate::tenant::{Tenant, TenantStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::time::Duration;

fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn ttl_to_expiry(ttl: Option<Duration>, now: DateTime<Utc>) -> Option<i64> {
    ttl.map(|d| to_ms(now) + i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Single-file SQLite backing for every store seam. WAL mode plus a busy
/// timeout keeps concurrent relay instances on a shared volume cooperative.
pub struct SqliteStore {
    conn: std::sync::Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed to create database parent directory: {}",
                    parent.display()
                )
            })?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at: {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             PRAGMA foreign_keys=ON;",
        )?;

        let store = Self {
            conn: std::sync::Mutex::new(conn),
        };
        store.ensure_schema().with_context(|| {
            format!(
                "Failed to initialize database schema at: {}",
                db_path.display()
            )
        })?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_list (
                id INTEGER PRIMARY KEY,
                list_key TEXT NOT NULL,
                value TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_kv_list_key ON kv_list(list_key)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                business_phone TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                system_prompt TEXT NOT NULL DEFAULT '',
                store_description TEXT NOT NULL DEFAULT '',
                catalog_text TEXT NOT NULL DEFAULT '',
                notify_email TEXT NOT NULL DEFAULT '',
                wa_phone_id TEXT NOT NULL DEFAULT '',
                wa_token TEXT NOT NULL DEFAULT '',
                bridge_account_id INTEGER
            )",
            [],
        )?;
        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_tenants_phone ON tenants(business_phone);
             CREATE INDEX IF NOT EXISTS idx_tenants_bridge ON tenants(bridge_account_id);",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                external_user_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                human_override_until INTEGER,
                last_message_at INTEGER NOT NULL,
                last_message_preview TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                UNIQUE (tenant_id, channel, external_user_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                message_type TEXT NOT NULL DEFAULT 'text',
                correlation_id TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages(conversation_id, created_at)",
            [],
        )?;

        Ok(())
    }

    /// Seed or update a tenant row. Admin CRUD lives outside the relay; this
    /// exists for provisioning scripts and tests.
    pub fn upsert_tenant(&self, tenant: &Tenant) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tenants (id, name, business_phone, active, system_prompt,
                store_description, catalog_text, notify_email, wa_phone_id, wa_token,
                bridge_account_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                business_phone = excluded.business_phone,
                active = excluded.active,
                system_prompt = excluded.system_prompt,
                store_description = excluded.store_description,
                catalog_text = excluded.catalog_text,
                notify_email = excluded.notify_email,
                wa_phone_id = excluded.wa_phone_id,
                wa_token = excluded.wa_token,
                bridge_account_id = excluded.bridge_account_id",
            params![
                tenant.id,
                tenant.name,
                tenant.business_phone,
                tenant.active,
                tenant.system_prompt,
                tenant.store_description,
                tenant.catalog_text,
                tenant.notify_email,
                tenant.wa_phone_id,
                tenant.wa_token,
                tenant.bridge_account_id,
            ],
        )?;
        Ok(())
    }

    pub fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {TENANT_COLS} FROM tenants ORDER BY id"))?;
        let rows = stmt.query_map([], tenant_row_mapper)?;
        let mut tenants = Vec::new();
        for row in rows {
            tenants.push(tenant_from_row(row?));
        }
        Ok(tenants)
    }
}

type TenantRow = (
    String,
    String,
    String,
    bool,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<i64>,
);

fn tenant_from_row(row: TenantRow) -> Tenant {
    Tenant {
        id: row.0,
        name: row.1,
        business_phone: row.2,
        active: row.3,
        system_prompt: row.4,
        store_description: row.5,
        catalog_text: row.6,
        notify_email: row.7,
        wa_phone_id: row.8,
        wa_token: row.9,
        bridge_account_id: row.10,
    }
}

const TENANT_COLS: &str = "id, name, business_phone, active, system_prompt, store_description,
    catalog_text, notify_email, wa_phone_id, wa_token, bridge_account_id";

type ConversationRow = (
    String,
    String,
    String,
    String,
    String,
    Option<i64>,
    i64,
    String,
    i64,
);

fn conversation_from_row(row: ConversationRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.0,
        tenant_id: row.1,
        channel: ChannelKind::parse(&row.2)
            .ok_or_else(|| anyhow::anyhow!("unknown channel in store: {}", row.2))?,
        external_user_id: row.3,
        status: ConversationStatus::parse(&row.4)
            .ok_or_else(|| anyhow::anyhow!("unknown conversation status in store: {}", row.4))?,
        human_override_until: row.5.map(from_ms),
        last_message_at: from_ms(row.6),
        last_message_preview: row.7,
        created_at: from_ms(row.8),
    })
}

const CONVERSATION_COLS: &str = "id, tenant_id, channel, external_user_id, status,
    human_override_until, last_message_at, last_message_preview, created_at";

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1
                 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, to_ms(Utc::now())],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at",
            params![key, value, ttl_to_expiry(ttl, Utc::now())],
        )?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let now = Utc::now();
        let conn = self.lock()?;
        // Opportunistic sweep so dead keys don't accumulate forever.
        conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![to_ms(now)],
        )?;
        // An expired survivor still loses its claim: the upsert arm only
        // fires when the existing row is past its expiry.
        let changed = conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
             WHERE kv.expires_at IS NOT NULL AND kv.expires_at <= ?4",
            params![key, value, ttl_to_expiry(ttl, now), to_ms(now)],
        )?;
        Ok(changed > 0)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn push(&self, key: &str, value: &str, cap: usize) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "INSERT INTO kv_list (list_key, value)
             SELECT ?1, ?2
             WHERE (SELECT COUNT(*) FROM kv_list WHERE list_key = ?1) < ?3",
            params![key, value, cap],
        )?;
        Ok(changed > 0)
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv_list WHERE list_key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn take_all(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let values = {
            let mut stmt = tx.prepare(
                "SELECT value FROM kv_list WHERE list_key = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        tx.execute("DELETE FROM kv_list WHERE list_key = ?1", params![key])?;
        tx.commit()?;
        Ok(values)
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn get_or_create(
        &self,
        tenant_id: &str,
        channel: ChannelKind,
        external_user_id: &str,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let fresh = Conversation::new(tenant_id, channel, external_user_id, now);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO conversations (id, tenant_id, channel, external_user_id,
                status, human_override_until, last_message_at, last_message_preview, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, '', ?6)
             ON CONFLICT(tenant_id, channel, external_user_id) DO NOTHING",
            params![
                fresh.id,
                tenant_id,
                channel.as_str(),
                external_user_id,
                fresh.status.as_str(),
                to_ms(now),
            ],
        )?;
        let row: ConversationRow = conn.query_row(
            &format!(
                "SELECT {CONVERSATION_COLS} FROM conversations
                 WHERE tenant_id = ?1 AND channel = ?2 AND external_user_id = ?3"
            ),
            params![tenant_id, channel.as_str(), external_user_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            },
        )?;
        conversation_from_row(row)
    }

    async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.lock()?;
        let row: Option<ConversationRow> = conn
            .query_row(
                &format!("SELECT {CONVERSATION_COLS} FROM conversations WHERE id = ?1"),
                params![id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                    ))
                },
            )
            .optional()?;
        row.map(conversation_from_row).transpose()
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>, preview: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE conversations SET last_message_at = ?2, last_message_preview = ?3
             WHERE id = ?1",
            params![id, to_ms(at), preview],
        )?;
        Ok(())
    }

    async fn apply_override(&self, id: &str, until: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE conversations SET status = 'human_override', human_override_until = ?2
             WHERE id = ?1",
            params![id, to_ms(until)],
        )?;
        Ok(())
    }

    async fn set_status(&self, id: &str, status: ConversationStatus) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE conversations SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, message: &Message) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, message_type,
                correlation_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.conversation_id,
                message.role.as_str(),
                message.content,
                message.message_type.as_str(),
                message.correlation_id,
                to_ms(message.created_at),
            ],
        )?;
        Ok(())
    }

    async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, message_type, correlation_id, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![conversation_id, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, conversation_id, role, content, message_type, correlation_id, created_at) =
                row?;
            messages.push(Message {
                id,
                conversation_id,
                role: MessageRole::parse(&role)
                    .ok_or_else(|| anyhow::anyhow!("unknown message role in store: {role}"))?,
                content,
                message_type: EventKind::parse(&message_type)
                    .ok_or_else(|| anyhow::anyhow!("unknown message type in store: {message_type}"))?,
                correlation_id,
                created_at: from_ms(created_at),
            });
        }
        messages.reverse();
        Ok(messages)
    }
}

#[async_trait]
impl TenantStore for SqliteStore {
    async fn tenant_by_id(&self, id: &str) -> Result<Option<Tenant>> {
        let conn = self.lock()?;
        let row: Option<TenantRow> = conn
            .query_row(
                &format!("SELECT {TENANT_COLS} FROM tenants WHERE id = ?1"),
                params![id],
                tenant_row_mapper,
            )
            .optional()?;
        Ok(row.map(tenant_from_row))
    }

    async fn tenant_by_phone(&self, digits: &str) -> Result<Option<Tenant>> {
        let conn = self.lock()?;
        let row: Option<TenantRow> = conn
            .query_row(
                &format!("SELECT {TENANT_COLS} FROM tenants WHERE business_phone = ?1"),
                params![digits],
                tenant_row_mapper,
            )
            .optional()?;
        Ok(row.map(tenant_from_row))
    }

    async fn tenant_by_bridge_account(&self, account_id: i64) -> Result<Option<Tenant>> {
        let conn = self.lock()?;
        let row: Option<TenantRow> = conn
            .query_row(
                &format!("SELECT {TENANT_COLS} FROM tenants WHERE bridge_account_id = ?1"),
                params![account_id],
                tenant_row_mapper,
            )
            .optional()?;
        Ok(row.map(tenant_from_row))
    }
}

fn tenant_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<TenantRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}
