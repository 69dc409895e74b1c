//! Core types shared across all modules.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Basic math
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn distance(self, other: Vec3) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

impl std::fmt::Display for Vec3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

// ---------------------------------------------------------------------------
// Sliding-window rate limiting
// ---------------------------------------------------------------------------

/// Counts events inside a trailing time window.
///
/// Used for per-participant edit/subscribe limits and the per-IP connection
/// gate. `try_acquire` records the event only when it is admitted, so a
/// rejected burst does not extend its own penalty.
#[derive(Debug)]
pub struct RateWindow {
    window: Duration,
    hits: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            hits: VecDeque::new(),
        }
    }

    /// Admit one event if fewer than `limit` occurred inside the window.
    pub fn try_acquire(&mut self, limit: u32) -> bool {
        let now = Instant::now();
        self.prune(now);
        if self.hits.len() < limit as usize {
            self.hits.push_back(now);
            true
        } else {
            false
        }
    }

    pub fn is_idle(&self) -> bool {
        self.hits
            .back()
            .map(|t| t.elapsed() > self.window)
            .unwrap_or(true)
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.hits.front() {
            if now.duration_since(*front) > self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stats & config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldStats {
    pub participants: usize,
    pub loaded_sections: usize,
    pub dirty_sections: usize,
    pub subscriptions: usize,
}

/// Server-wide configuration.
///
/// Env-driven options (bind address, origins, store endpoint, public URL,
/// region, instance id) are filled in by the binary; the remaining fields are
/// protocol tunables with their contract defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listener bind address.
    pub bind_addr: String,
    /// Allowed `Origin` header patterns (exact or `*.domain` wildcard).
    /// Localhost origins are always admitted.
    pub allowed_origins: Vec<String>,
    /// Endpoint advertised in session rows and `REDIRECT` frames.
    pub public_url: String,
    /// Deployment region tag, logged and advertised only.
    pub region: String,
    /// Stable identifier for this server process across restarts.
    pub instance_id: String,
    /// Required `iss` claim on signed credentials.
    pub jwt_issuer: String,
    /// Required `aud` claim on signed credentials.
    pub jwt_audience: String,
    /// Admit unsigned short-lived tokens (display-name-only deployments).
    pub allow_unsigned_tokens: bool,

    pub max_participants: usize,
    pub tick_period: Duration,
    pub handshake_timeout: Duration,
    pub stale_timeout: Duration,
    pub flush_period: Duration,
    pub heartbeat_period: Duration,
    pub key_cache_ttl: Duration,
    pub edits_per_second: u32,
    pub subscribes_per_second: u32,
    pub connections_per_minute: u32,
    pub max_frame_bytes: usize,
    pub request_id_ttl: Duration,
    pub max_reach: f32,
    pub max_subscriptions: usize,
    pub sections_per_second: u32,
    pub max_dirty_sections: usize,
    pub opaque_token_max_age: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8780".into(),
            allowed_origins: Vec::new(),
            public_url: "ws://localhost:8780".into(),
            region: "local".into(),
            instance_id: "quarry-world-1".into(),
            jwt_issuer: "quarry".into(),
            jwt_audience: "quarry-world".into(),
            allow_unsigned_tokens: false,
            max_participants: 8,
            tick_period: Duration::from_millis(50),
            handshake_timeout: Duration::from_secs(5),
            stale_timeout: Duration::from_secs(60),
            flush_period: Duration::from_secs(1),
            heartbeat_period: Duration::from_secs(30),
            key_cache_ttl: Duration::from_secs(3600),
            edits_per_second: 20,
            subscribes_per_second: 100,
            connections_per_minute: 3,
            max_frame_bytes: 64 * 1024,
            request_id_ttl: Duration::from_secs(60),
            max_reach: 5.0,
            max_subscriptions: 128,
            sections_per_second: 40,
            max_dirty_sections: 500,
            opaque_token_max_age: Duration::from_secs(24 * 3600),
        }
    }
}

impl ServerConfig {
    /// Sections a participant may receive in a single tick.
    pub fn sections_per_tick(&self) -> usize {
        let ticks_per_second = (1000 / self.tick_period.as_millis().max(1)) as u32;
        self.sections_per_second
            .div_ceil(ticks_per_second.max(1))
            .max(1) as usize
    }
}
