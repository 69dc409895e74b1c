//! World registry and per-world state: participants, loaded sections,
//! subscription index, edit-response cache, admission and departure.
//!
//! ## Exclusion discipline
//!
//! Each world's mutable state lives behind one short-lived `parking_lot`
//! mutex. Store calls are suspension points and are never made while that
//! lock is held: callers read under the lock, release, perform I/O, then
//! reacquire to publish the result. Block edits additionally serialize on a
//! per-world async gate (see the `edit` module).

use crate::auth::{AuthError, CredentialVerifier, Identity};
use crate::coords::SectionCoord;
use crate::generator;
use crate::protocol::{
    self, BlockEvent, ErrorCode, Hello, Input, PlayerInfo, PlayerJoin, PlayerLeave, PlayerState,
    ServerFrame, Snapshot, Welcome, PROTOCOL_VERSION,
};
use crate::section::Section;
use crate::store::{SectionUpsert, Store, StoreError, WorldMeta};
use crate::types::{RateWindow, ServerConfig, Vec3, WorldStats};
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;

/// The single world id that bypasses the store: always exists, always
/// public, never persisted.
pub const DEFAULT_WORLD_ID: &str = "default-world";

// ---------------------------------------------------------------------------
// Outbound handle
// ---------------------------------------------------------------------------

/// What the connection writer task consumes.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(ServerFrame),
    /// Close the socket with the given code after flushing queued frames.
    Close(u16, String),
}

pub type FrameSender = mpsc::UnboundedSender<Outbound>;

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    pub position: Vec3,
    pub velocity: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub last_seq: u64,
    pub last_activity: Instant,
    pub subscribed: HashSet<SectionCoord>,
    pub pending: VecDeque<SectionCoord>,
    pub edit_rate: RateWindow,
    pub subscribe_rate: RateWindow,
    sender: FrameSender,
}

impl Participant {
    fn new(identity: &Identity, display_name: String, sender: FrameSender) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            display_name,
            position: generator::spawn_position(),
            velocity: Vec3::zero(),
            yaw: 0.0,
            pitch: 0.0,
            last_seq: 0,
            last_activity: Instant::now(),
            subscribed: HashSet::new(),
            pending: VecDeque::new(),
            edit_rate: RateWindow::new(Duration::from_secs(1)),
            subscribe_rate: RateWindow::new(Duration::from_secs(1)),
            sender,
        }
    }

    /// Queue a frame; a closed peer drops it silently (the connection's own
    /// exit path handles removal).
    pub fn send(&self, frame: ServerFrame) {
        let _ = self.sender.send(Outbound::Frame(frame));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.sender.send(Outbound::Close(code, reason.into()));
    }

    fn info(&self) -> PlayerInfo {
        PlayerInfo {
            player_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            x: self.position.x,
            y: self.position.y,
            z: self.position.z,
            yaw: self.yaw,
            pitch: self.pitch,
        }
    }

    fn state(&self) -> PlayerState {
        PlayerState {
            player_id: self.user_id.clone(),
            x: self.position.x,
            y: self.position.y,
            z: self.position.z,
            vx: self.velocity.x,
            vy: self.velocity.y,
            vz: self.velocity.z,
            yaw: self.yaw,
            pitch: self.pitch,
            seq: self.last_seq,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-world state
// ---------------------------------------------------------------------------

pub struct CachedEdit {
    pub event: BlockEvent,
    pub at: Instant,
}

#[derive(Default)]
pub struct WorldData {
    pub participants: HashMap<String, Participant>,
    pub sections: HashMap<SectionCoord, Section>,
    /// Section id → subscribed participant ids. Mirrors each participant's
    /// `subscribed` set; the two are updated together.
    pub subs: HashMap<SectionCoord, HashSet<String>>,
    pub edit_cache: HashMap<String, CachedEdit>,
}

pub struct WorldHandle {
    pub id: String,
    pub meta: WorldMeta,
    pub data: Mutex<WorldData>,
    /// Serializes block-edit application per world.
    pub edit_gate: tokio::sync::Mutex<()>,
}

impl WorldHandle {
    fn new(meta: WorldMeta) -> Self {
        Self {
            id: meta.id.clone(),
            meta,
            data: Mutex::new(WorldData::default()),
            edit_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_default(&self) -> bool {
        self.id == DEFAULT_WORLD_ID
    }

    pub fn stats(&self) -> WorldStats {
        let data = self.data.lock();
        WorldStats {
            participants: data.participants.len(),
            loaded_sections: data.sections.len(),
            dirty_sections: data.sections.values().filter(|s| s.dirty).count(),
            subscriptions: data.subs.values().map(|s| s.len()).sum(),
        }
    }

    pub fn participant_count(&self) -> usize {
        self.data.lock().participants.len()
    }

    pub fn broadcast(&self, frame: &ServerFrame) {
        let data = self.data.lock();
        for p in data.participants.values() {
            p.send(frame.clone());
        }
    }

    pub fn broadcast_except(&self, skip: &str, frame: &ServerFrame) {
        let data = self.data.lock();
        for p in data.participants.values() {
            if p.user_id != skip {
                p.send(frame.clone());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Motion
    // -----------------------------------------------------------------------

    /// Apply a reported motion sample. Stale sequences are dropped; a
    /// position outside world extents is clamped and answered with `RESYNC`.
    pub fn apply_input(&self, user: &str, input: &Input) {
        let mut data = self.data.lock();
        let Some(p) = data.participants.get_mut(user) else {
            return;
        };
        p.last_activity = Instant::now();
        if p.last_seq != 0 && input.seq <= p.last_seq {
            return;
        }
        p.last_seq = input.seq;

        let max_xz = crate::coords::WORLD_EXTENT_XZ as f32;
        let max_y = crate::coords::WORLD_EXTENT_Y as f32;
        let clamped = Vec3::new(
            input.x.clamp(0.0, max_xz),
            input.y.clamp(0.0, max_y),
            input.z.clamp(0.0, max_xz),
        );
        let reported = Vec3::new(input.x, input.y, input.z);

        p.velocity = Vec3::new(input.vx, input.vy, input.vz);
        p.yaw = input.yaw;
        p.pitch = input.pitch.clamp(-90.0, 90.0);
        p.position = clamped;

        if clamped != reported {
            p.send(ServerFrame::Resync(protocol::Resync {
                protocol_version: PROTOCOL_VERSION,
                x: clamped.x,
                y: clamped.y,
                z: clamped.z,
                seq: p.last_seq,
            }));
        }
    }

    /// Build the per-tick motion snapshot, or `None` for an empty world.
    pub fn build_snapshot(&self) -> Option<ServerFrame> {
        let data = self.data.lock();
        if data.participants.is_empty() {
            return None;
        }
        let server_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        Some(ServerFrame::Snapshot(Snapshot {
            protocol_version: PROTOCOL_VERSION,
            server_time_ms,
            players: data.participants.values().map(Participant::state).collect(),
        }))
    }

    // -----------------------------------------------------------------------
    // Section loading
    // -----------------------------------------------------------------------

    /// Make sure a section is resident, loading it from the store or
    /// generating the baseline. Never called with the data lock held.
    pub async fn ensure_section(
        &self,
        store: &Arc<dyn Store>,
        coord: SectionCoord,
    ) -> Result<(), StoreError> {
        {
            let mut data = self.data.lock();
            if let Some(section) = data.sections.get_mut(&coord) {
                section.touch();
                return Ok(());
            }
        }

        let row = if self.is_default() {
            None
        } else {
            store.load_section(&self.id, &coord.to_string()).await?
        };

        let section = match row {
            Some(row) => Section::from_store_row(coord, &row.blocks, row.version)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            None => Section::baseline(coord, generator::baseline_blocks(coord)),
        };

        let mut data = self.data.lock();
        // Another task may have raced the load; first insert wins.
        data.sections.entry(coord).or_insert(section);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Snapshot every dirty section for upsert.
    fn collect_dirty(&self) -> Vec<(SectionCoord, Bytes, u64)> {
        let data = self.data.lock();
        data.sections
            .values()
            .filter(|s| s.dirty)
            .map(|s| (s.coord, Bytes::from(s.to_bytes()), s.version))
            .collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.data.lock().sections.values().filter(|s| s.dirty).count()
    }

    /// Flush dirty sections in one batched upsert. On success the dirty
    /// flag is cleared only where the version is still the one written, so
    /// an edit racing the flush stays dirty for the next cycle.
    pub async fn flush_dirty(&self, store: &Arc<dyn Store>) -> Result<usize, StoreError> {
        if self.is_default() {
            return Ok(0);
        }
        let batch = self.collect_dirty();
        if batch.is_empty() {
            return Ok(0);
        }
        let upserts: Vec<SectionUpsert> = batch
            .iter()
            .map(|(coord, blocks, version)| SectionUpsert {
                section: coord.to_string(),
                blocks: blocks.clone(),
                version: *version,
            })
            .collect();
        store.upsert_sections(&self.id, &upserts).await?;

        let mut data = self.data.lock();
        for (coord, _, version) in &batch {
            if let Some(section) = data.sections.get_mut(coord) {
                if section.version == *version {
                    section.dirty = false;
                    section.from_store = true;
                }
            }
        }
        debug!("Flushed {} sections for world {}", batch.len(), self.id);
        Ok(batch.len())
    }
}

// ---------------------------------------------------------------------------
// Admission errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("unsupported protocol version")]
    ProtocolMismatch,
    #[error("registry version mismatch")]
    RegistryMismatch,
    #[error("generator version mismatch")]
    GeneratorMismatch,
    #[error(transparent)]
    Auth(AuthError),
    #[error("world not found")]
    WorldNotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("world is full")]
    WorldFull,
    /// The world is live on another instance; the client should reconnect
    /// to the carried URL.
    #[error("world is hosted elsewhere")]
    Redirect(String),
    #[error("store unavailable during handshake")]
    Store(#[from] StoreError),
}

impl AdmitError {
    /// Protocol error code for this failure. `Redirect` never maps here;
    /// it is answered with a `REDIRECT` frame instead.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AdmitError::ProtocolMismatch => ErrorCode::InvalidRequest,
            AdmitError::RegistryMismatch => ErrorCode::RegistryMismatch,
            AdmitError::GeneratorMismatch => ErrorCode::GeneratorMismatch,
            AdmitError::Auth(AuthError::Expired) => ErrorCode::AuthExpired,
            AdmitError::Auth(_) => ErrorCode::AuthFailed,
            AdmitError::WorldNotFound => ErrorCode::WorldNotFound,
            AdmitError::PermissionDenied => ErrorCode::PermissionDenied,
            AdmitError::WorldFull => ErrorCode::WorldFull,
            AdmitError::Redirect(_) => ErrorCode::InvalidRequest,
            AdmitError::Store(_) => ErrorCode::AuthFailed,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Admission {
    pub world: Arc<WorldHandle>,
    pub user_id: String,
    pub welcome: Welcome,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("world", &self.world.id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

pub struct WorldRegistry {
    config: Arc<ServerConfig>,
    store: Arc<dyn Store>,
    verifier: CredentialVerifier,
    worlds: RwLock<HashMap<String, Arc<WorldHandle>>>,
}

impl WorldRegistry {
    pub fn new(config: Arc<ServerConfig>, store: Arc<dyn Store>) -> Self {
        let verifier = CredentialVerifier::new(store.clone(), &config);
        Self {
            config,
            store,
            verifier,
            worlds: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn active_worlds(&self) -> Vec<Arc<WorldHandle>> {
        self.worlds.read().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorldHandle>> {
        self.worlds.read().get(id).cloned()
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    pub async fn admit(&self, hello: &Hello, sender: FrameSender) -> Result<Admission, AdmitError> {
        if hello.protocol_version != protocol::PROTOCOL_VERSION {
            return Err(AdmitError::ProtocolMismatch);
        }
        if hello.registry_version != protocol::REGISTRY_VERSION {
            return Err(AdmitError::RegistryMismatch);
        }
        if hello.generator_version != protocol::GENERATOR_VERSION {
            return Err(AdmitError::GeneratorMismatch);
        }

        let identity = self
            .verifier
            .verify(&hello.jwt)
            .await
            .map_err(AdmitError::Auth)?;
        let user = identity.user_id.clone();

        let meta = if hello.world_id == DEFAULT_WORLD_ID {
            WorldMeta::default_world()
        } else {
            let meta = self
                .store
                .get_world(&hello.world_id)
                .await?
                .ok_or(AdmitError::WorldNotFound)?;

            if self.store.check_ban(&hello.world_id, &user).await? {
                return Err(AdmitError::PermissionDenied);
            }
            if !meta.is_public
                && meta.owner.as_deref() != Some(user.as_str())
                && !self.store.check_member(&hello.world_id, &user).await?
            {
                return Err(AdmitError::PermissionDenied);
            }
            // Another live instance already hosts this world: send the
            // client there rather than splitting the world.
            if let Some(session) = self.store.get_session(&hello.world_id).await? {
                if session.status == "online"
                    && session.instance != self.config.instance_id
                    && session.heartbeat_age < self.config.heartbeat_period * 2
                {
                    return Err(AdmitError::Redirect(session.url));
                }
            }
            meta
        };

        let display_name = self.resolve_display_name(&identity).await;

        let world = self.get_or_create(meta);

        let welcome = {
            let mut data = world.data.lock();
            let cap = (world.meta.max_players as usize).min(self.config.max_participants);
            let superseded = data.participants.contains_key(&user);
            if !superseded && data.participants.len() >= cap {
                return Err(AdmitError::WorldFull);
            }
            // A reconnect replaces the previous seat for the same user.
            if let Some(old) = data.participants.remove(&user) {
                old.close(protocol::CLOSE_NORMAL, "superseded by a new connection");
                let WorldData { subs, .. } = &mut *data;
                for coord in &old.subscribed {
                    if let Some(set) = subs.get_mut(coord) {
                        set.remove(&user);
                        let empty = set.is_empty();
                        if empty {
                            subs.remove(coord);
                        }
                    }
                }
            }

            let participant = Participant::new(&identity, display_name.clone(), sender);
            let spawn = participant.position;
            let players: Vec<PlayerInfo> =
                data.participants.values().map(Participant::info).collect();
            data.participants.insert(user.clone(), participant);

            Welcome {
                protocol_version: protocol::PROTOCOL_VERSION,
                registry_version: protocol::REGISTRY_VERSION,
                generator_version: protocol::GENERATOR_VERSION,
                world_id: world.id.clone(),
                player_id: user.clone(),
                display_name: display_name.clone(),
                spawn_position: spawn,
                max_players: cap as u32,
                players,
            }
        };

        // An eviction may have raced the insert above; re-register the
        // handle so the world stays reachable.
        self.worlds
            .write()
            .entry(world.id.clone())
            .or_insert_with(|| world.clone());

        world.broadcast_except(
            &user,
            &ServerFrame::PlayerJoin(PlayerJoin {
                protocol_version: protocol::PROTOCOL_VERSION,
                player_id: user.clone(),
                display_name: display_name.clone(),
                x: welcome.spawn_position.x,
                y: welcome.spawn_position.y,
                z: welcome.spawn_position.z,
            }),
        );

        if !world.is_default() {
            if let Err(e) = self.store.record_join(&world.id, &user, &display_name).await {
                warn!("record_join failed for {user} in {}: {e}", world.id);
            }
            if let Err(e) = self
                .store
                .register_session(&world.id, &self.config.instance_id, &self.config.public_url)
                .await
            {
                warn!("register_session failed for {}: {e}", world.id);
            }
        }

        info!("Admitted {user} ({display_name}) into world {}", world.id);
        Ok(Admission {
            world,
            user_id: user,
            welcome,
        })
    }

    /// Token name, then stored presence name, then a stable derived
    /// fallback.
    async fn resolve_display_name(&self, identity: &Identity) -> String {
        if let Some(name) = &identity.display_name {
            return name.clone();
        }
        match self.store.display_name(&identity.user_id).await {
            Ok(Some(name)) => name,
            Ok(None) => derived_name(&identity.user_id),
            Err(e) => {
                warn!("display_name lookup failed for {}: {e}", identity.user_id);
                derived_name(&identity.user_id)
            }
        }
    }

    fn get_or_create(&self, meta: WorldMeta) -> Arc<WorldHandle> {
        if let Some(world) = self.worlds.read().get(&meta.id) {
            return world.clone();
        }
        let mut worlds = self.worlds.write();
        worlds
            .entry(meta.id.clone())
            .or_insert_with(|| Arc::new(WorldHandle::new(meta)))
            .clone()
    }

    // -----------------------------------------------------------------------
    // Departure
    // -----------------------------------------------------------------------

    /// Every disconnect path funnels here: broadcast the leave, drop the
    /// subscription index entries, record presence, and evict the world
    /// once it is empty and flushed.
    pub async fn handle_disconnect(&self, world: &Arc<WorldHandle>, user: &str) {
        let removed = {
            let mut data = world.data.lock();
            match data.participants.remove(user) {
                Some(old) => {
                    let WorldData { subs, .. } = &mut *data;
                    for coord in &old.subscribed {
                        if let Some(set) = subs.get_mut(coord) {
                            set.remove(user);
                            let empty = set.is_empty();
                            if empty {
                                subs.remove(coord);
                            }
                        }
                    }
                    true
                }
                None => false,
            }
        };
        if !removed {
            return;
        }

        world.broadcast(&ServerFrame::PlayerLeave(PlayerLeave {
            protocol_version: protocol::PROTOCOL_VERSION,
            player_id: user.into(),
        }));

        if !world.is_default() {
            if let Err(e) = self.store.record_leave(&world.id, user).await {
                warn!("record_leave failed for {user} in {}: {e}", world.id);
            }
        }

        if world.participant_count() == 0 {
            self.flush_and_evict(world).await;
        }
    }

    /// Flush a now-empty world and drop it from the registry. A failed
    /// flush keeps the world resident so the persistence loop retries.
    async fn flush_and_evict(&self, world: &Arc<WorldHandle>) {
        if !world.is_default() {
            if let Err(e) = world.flush_dirty(&self.store).await {
                warn!("Flush on evict failed for {}: {e}", world.id);
                return;
            }
        }
        let mut worlds = self.worlds.write();
        let still_empty = world.participant_count() == 0
            && (world.is_default() || world.dirty_count() == 0);
        if still_empty {
            worlds.remove(&world.id);
            info!("Evicted idle world {}", world.id);
        }
    }
}

/// Stable fallback display name derived from the user id.
fn derived_name(user_id: &str) -> String {
    let digest = md5::compute(user_id.as_bytes());
    let hex = format!("{digest:x}");
    format!("player-{}", &hex[..6])
}
