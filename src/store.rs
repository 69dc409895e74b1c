//! Durable store adapter.
//!
//! The server consumes the capability set in [`Store`]; any backend
//! satisfying it is acceptable. Two implementations ship here:
//!
//! - [`PgStore`] – Postgres via sqlx, the production backend.
//! - [`MemStore`] – in-memory tables for tests and store-less local mode.
//!
//! All store calls are suspension points. Callers must not hold a world
//! lock across them; see the exclusion discipline in the `world` module.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient backend failure; the caller's retry policy applies.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The backend returned a row that violates the schema contract.
    #[error("corrupt store row: {0}")]
    Corrupt(String),
}

fn transient(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorldMeta {
    pub id: String,
    pub name: String,
    pub owner: Option<String>,
    pub is_public: bool,
    pub max_players: u32,
    pub generator_version: u32,
    pub registry_version: u32,
}

impl WorldMeta {
    /// The synthesized metadata for the store-bypassing default world.
    pub fn default_world() -> Self {
        Self {
            id: crate::world::DEFAULT_WORLD_ID.into(),
            name: "default".into(),
            owner: None,
            is_public: true,
            max_players: 8,
            generator_version: crate::protocol::GENERATOR_VERSION,
            registry_version: crate::protocol::REGISTRY_VERSION,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SectionRow {
    pub blocks: Bytes,
    pub version: u64,
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub instance: String,
    pub url: String,
    pub status: String,
    pub heartbeat_age: Duration,
}

#[derive(Debug, Clone)]
pub struct SectionUpsert {
    pub section: String,
    pub blocks: Bytes,
    pub version: u64,
}

/// One entry of the credential signing-key set.
#[derive(Debug, Clone)]
pub struct SigningKey {
    pub kid: Option<String>,
    /// jsonwebtoken algorithm name, e.g. `HS256` or `RS256`.
    pub algorithm: String,
    /// HMAC secret or PEM-encoded public key, per algorithm.
    pub secret: String,
}

// ---------------------------------------------------------------------------
// Capability set
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_world(&self, id: &str) -> Result<Option<WorldMeta>, StoreError>;
    async fn check_member(&self, world: &str, user: &str) -> Result<bool, StoreError>;
    /// Expired bans report false.
    async fn check_ban(&self, world: &str, user: &str) -> Result<bool, StoreError>;
    async fn load_section(
        &self,
        world: &str,
        section: &str,
    ) -> Result<Option<SectionRow>, StoreError>;
    /// Atomic per row; the whole batch fails together.
    async fn upsert_sections(
        &self,
        world: &str,
        batch: &[SectionUpsert],
    ) -> Result<(), StoreError>;
    async fn get_session(&self, world: &str) -> Result<Option<SessionRow>, StoreError>;
    async fn register_session(
        &self,
        world: &str,
        instance: &str,
        url: &str,
    ) -> Result<(), StoreError>;
    async fn heartbeat(&self, world: &str, count: u32) -> Result<(), StoreError>;
    async fn mark_sessions_offline(&self, instance: &str) -> Result<(), StoreError>;
    async fn record_join(&self, world: &str, user: &str, name: &str) -> Result<(), StoreError>;
    async fn record_leave(&self, world: &str, user: &str) -> Result<(), StoreError>;
    async fn display_name(&self, user: &str) -> Result<Option<String>, StoreError>;
    async fn key_set(&self) -> Result<Vec<SigningKey>, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to the store endpoint. A service key, when provided,
    /// overrides the password embedded in the endpoint URL.
    pub async fn connect(url: &str, service_key: Option<&str>) -> Result<Self, StoreError> {
        let mut opts = PgConnectOptions::from_str(url).map_err(transient)?;
        if let Some(key) = service_key {
            opts = opts.password(key);
        }
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await
            .map_err(transient)?;
        Ok(Self { pool })
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_world(&self, id: &str) -> Result<Option<WorldMeta>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, owner, is_public, max_players, generator_version, \
             registry_version FROM worlds WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;

        Ok(row.map(|r| WorldMeta {
            id: r.get("id"),
            name: r.get("name"),
            owner: r.get("owner"),
            is_public: r.get("is_public"),
            max_players: r.get::<i32, _>("max_players") as u32,
            generator_version: r.get::<i32, _>("generator_version") as u32,
            registry_version: r.get::<i32, _>("registry_version") as u32,
        }))
    }

    async fn check_member(&self, world: &str, user: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM world_members WHERE world_id = $1 AND user_id = $2) \
             AS present",
        )
        .bind(world)
        .bind(user)
        .fetch_one(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.get("present"))
    }

    async fn check_ban(&self, world: &str, user: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM world_bans WHERE world_id = $1 AND user_id = $2 \
             AND (expires_at IS NULL OR expires_at > now())) AS banned",
        )
        .bind(world)
        .bind(user)
        .fetch_one(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.get("banned"))
    }

    async fn load_section(
        &self,
        world: &str,
        section: &str,
    ) -> Result<Option<SectionRow>, StoreError> {
        let row = sqlx::query(
            "SELECT blocks, version FROM world_sections WHERE world_id = $1 AND section = $2",
        )
        .bind(world)
        .bind(section)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;

        row.map(|r| {
            let blocks: Vec<u8> = r.get("blocks");
            let version: i64 = r.get("version");
            if version <= 0 {
                return Err(StoreError::Corrupt(format!(
                    "section {world}/{section} has version {version}"
                )));
            }
            Ok(SectionRow {
                blocks: Bytes::from(blocks),
                version: version as u64,
            })
        })
        .transpose()
    }

    async fn upsert_sections(
        &self,
        world: &str,
        batch: &[SectionUpsert],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(transient)?;
        for item in batch {
            sqlx::query(
                "INSERT INTO world_sections (world_id, section, version, blocks, updated_at) \
                 VALUES ($1, $2, $3, $4, now()) \
                 ON CONFLICT (world_id, section) DO UPDATE \
                 SET version = EXCLUDED.version, blocks = EXCLUDED.blocks, updated_at = now()",
            )
            .bind(world)
            .bind(&item.section)
            .bind(item.version as i64)
            .bind(item.blocks.as_ref())
            .execute(&mut *tx)
            .await
            .map_err(transient)?;
        }
        tx.commit().await.map_err(transient)
    }

    async fn get_session(&self, world: &str) -> Result<Option<SessionRow>, StoreError> {
        let row = sqlx::query(
            "SELECT instance, url, status, \
             GREATEST(EXTRACT(EPOCH FROM (now() - last_heartbeat)), 0)::BIGINT AS age \
             FROM world_sessions WHERE world_id = $1",
        )
        .bind(world)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;

        Ok(row.map(|r| SessionRow {
            instance: r.get("instance"),
            url: r.get("url"),
            status: r.get("status"),
            heartbeat_age: Duration::from_secs(r.get::<i64, _>("age") as u64),
        }))
    }

    async fn register_session(
        &self,
        world: &str,
        instance: &str,
        url: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO world_sessions \
             (world_id, instance, url, status, participant_count, last_heartbeat, started_at) \
             VALUES ($1, $2, $3, 'online', 0, now(), now()) \
             ON CONFLICT (world_id) DO UPDATE SET instance = EXCLUDED.instance, \
             url = EXCLUDED.url, status = 'online', participant_count = 0, \
             last_heartbeat = now(), started_at = now()",
        )
        .bind(world)
        .bind(instance)
        .bind(url)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn heartbeat(&self, world: &str, count: u32) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE world_sessions SET last_heartbeat = now(), participant_count = $2 \
             WHERE world_id = $1",
        )
        .bind(world)
        .bind(count as i32)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn mark_sessions_offline(&self, instance: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE world_sessions SET status = 'offline' WHERE instance = $1")
            .bind(instance)
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn record_join(&self, world: &str, user: &str, name: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO world_players (world_id, user_id, display_name, joined_at, last_seen) \
             VALUES ($1, $2, $3, now(), now()) \
             ON CONFLICT (world_id, user_id) DO UPDATE \
             SET display_name = EXCLUDED.display_name, last_seen = now()",
        )
        .bind(world)
        .bind(user)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn record_leave(&self, world: &str, user: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE world_players SET last_seen = now() WHERE world_id = $1 AND user_id = $2",
        )
        .bind(world)
        .bind(user)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn display_name(&self, user: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT display_name FROM world_players WHERE user_id = $1 \
             ORDER BY last_seen DESC LIMIT 1",
        )
        .bind(user)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        Ok(row.map(|r| r.get("display_name")))
    }

    async fn key_set(&self) -> Result<Vec<SigningKey>, StoreError> {
        let rows = sqlx::query("SELECT kid, algorithm, secret FROM signing_keys")
            .fetch_all(&self.pool)
            .await
            .map_err(transient)?;
        Ok(rows
            .into_iter()
            .map(|r| SigningKey {
                kid: r.get("kid"),
                algorithm: r.get("algorithm"),
                secret: r.get("secret"),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemInner {
    worlds: HashMap<String, WorldMeta>,
    members: HashSet<(String, String)>,
    /// `None` expiry is a permanent ban.
    bans: HashMap<(String, String), Option<SystemTime>>,
    sections: HashMap<(String, String), (Bytes, u64)>,
    sessions: HashMap<String, MemSession>,
    players: HashMap<(String, String), String>,
    keys: Vec<SigningKey>,
    fail_upserts: bool,
    upsert_calls: usize,
}

#[derive(Debug, Clone)]
struct MemSession {
    instance: String,
    url: String,
    status: String,
    heartbeat_at: SystemTime,
    participant_count: u32,
}

/// In-memory [`Store`]: backs tests and store-less local mode.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_world(&self, meta: WorldMeta) {
        self.inner.lock().worlds.insert(meta.id.clone(), meta);
    }

    pub fn add_member(&self, world: &str, user: &str) {
        self.inner.lock().members.insert((world.into(), user.into()));
    }

    pub fn add_ban(&self, world: &str, user: &str, expires_at: Option<SystemTime>) {
        self.inner
            .lock()
            .bans
            .insert((world.into(), user.into()), expires_at);
    }

    pub fn add_key(&self, key: SigningKey) {
        self.inner.lock().keys.push(key);
    }

    pub fn clear_keys(&self) {
        self.inner.lock().keys.clear();
    }

    /// Test hook: make subsequent `upsert_sections` calls fail transiently.
    pub fn fail_upserts(&self, fail: bool) {
        self.inner.lock().fail_upserts = fail;
    }

    pub fn upsert_calls(&self) -> usize {
        self.inner.lock().upsert_calls
    }

    pub fn section_version(&self, world: &str, section: &str) -> Option<u64> {
        self.inner
            .lock()
            .sections
            .get(&(world.into(), section.into()))
            .map(|(_, v)| *v)
    }

    pub fn session_status(&self, world: &str) -> Option<String> {
        self.inner
            .lock()
            .sessions
            .get(world)
            .map(|s| s.status.clone())
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_world(&self, id: &str) -> Result<Option<WorldMeta>, StoreError> {
        Ok(self.inner.lock().worlds.get(id).cloned())
    }

    async fn check_member(&self, world: &str, user: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .members
            .contains(&(world.into(), user.into())))
    }

    async fn check_ban(&self, world: &str, user: &str) -> Result<bool, StoreError> {
        Ok(
            match self.inner.lock().bans.get(&(world.into(), user.into())) {
                Some(None) => true,
                Some(Some(expiry)) => *expiry > SystemTime::now(),
                None => false,
            },
        )
    }

    async fn load_section(
        &self,
        world: &str,
        section: &str,
    ) -> Result<Option<SectionRow>, StoreError> {
        Ok(self
            .inner
            .lock()
            .sections
            .get(&(world.into(), section.into()))
            .map(|(blocks, version)| SectionRow {
                blocks: blocks.clone(),
                version: *version,
            }))
    }

    async fn upsert_sections(
        &self,
        world: &str,
        batch: &[SectionUpsert],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.upsert_calls += 1;
        if inner.fail_upserts {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        for item in batch {
            inner.sections.insert(
                (world.into(), item.section.clone()),
                (item.blocks.clone(), item.version),
            );
        }
        Ok(())
    }

    async fn get_session(&self, world: &str) -> Result<Option<SessionRow>, StoreError> {
        Ok(self.inner.lock().sessions.get(world).map(|s| SessionRow {
            instance: s.instance.clone(),
            url: s.url.clone(),
            status: s.status.clone(),
            heartbeat_age: s
                .heartbeat_at
                .elapsed()
                .unwrap_or(Duration::ZERO),
        }))
    }

    async fn register_session(
        &self,
        world: &str,
        instance: &str,
        url: &str,
    ) -> Result<(), StoreError> {
        self.inner.lock().sessions.insert(
            world.into(),
            MemSession {
                instance: instance.into(),
                url: url.into(),
                status: "online".into(),
                heartbeat_at: SystemTime::now(),
                participant_count: 0,
            },
        );
        Ok(())
    }

    async fn heartbeat(&self, world: &str, count: u32) -> Result<(), StoreError> {
        if let Some(session) = self.inner.lock().sessions.get_mut(world) {
            session.heartbeat_at = SystemTime::now();
            session.participant_count = count;
        }
        Ok(())
    }

    async fn mark_sessions_offline(&self, instance: &str) -> Result<(), StoreError> {
        for session in self.inner.lock().sessions.values_mut() {
            if session.instance == instance {
                session.status = "offline".into();
            }
        }
        Ok(())
    }

    async fn record_join(&self, world: &str, user: &str, name: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .players
            .insert((world.into(), user.into()), name.into());
        Ok(())
    }

    async fn record_leave(&self, _world: &str, _user: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn display_name(&self, user: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .players
            .iter()
            .find(|((_, u), _)| u == user)
            .map(|(_, name)| name.clone()))
    }

    async fn key_set(&self) -> Result<Vec<SigningKey>, StoreError> {
        Ok(self.inner.lock().keys.clone())
    }
}
