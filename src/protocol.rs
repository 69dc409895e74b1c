//! Wire protocol: JSON frames over a bidirectional text stream.
//!
//! This module owns **every message that crosses the socket boundary**
//! between the world service and a client.
//!
//! ## Frame directory
//!
//! | Frame                | Direction          | Purpose                       |
//! |----------------------|--------------------|-------------------------------|
//! | `HELLO`              | client → server    | handshake + credentials       |
//! | `INPUT`              | client → server    | motion + input bitfield       |
//! | `SUBSCRIBE`          | client → server    | section interest set changes  |
//! | `BLOCK_EDIT_REQUEST` | client → server    | place/break one block         |
//! | `WELCOME`            | server → client    | handshake completion          |
//! | `SNAPSHOT`           | server → client    | per-tick motion broadcast     |
//! | `SECTION_DATA`       | server → client    | one section payload           |
//! | `BLOCK_EVENT`        | server → client    | edit outcome                  |
//! | `PLAYER_JOIN/LEAVE`  | server → client    | roster changes                |
//! | `ERROR`              | server → client    | protocol/auth/capacity errors |
//! | `RESYNC`             | server → client    | authoritative motion snap     |
//! | `REDIRECT`           | server → client    | world lives on another server |
//!
//! ## Design rules
//!
//! 1. Every struct must be `Serialize + Deserialize` with snake_case JSON.
//! 2. Every frame carries `type` (the serde tag) and `protocol_version`.
//! 3. Section blocks travel as base64 of exactly 8192 bytes
//!    (4096 little-endian u16 block ids).
//! 4. No in-memory state leaks out: frames reference sections by id string
//!    and participants by player id.

use crate::types::Vec3;
use serde::{Deserialize, Serialize};

/// Version 1 fixes JSON + base64 transport.
pub const PROTOCOL_VERSION: u32 = 1;
/// Version of the block/entity registry the server speaks.
pub const REGISTRY_VERSION: u32 = 1;
/// Version of the baseline generator the server computes.
pub const GENERATOR_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Close codes
// ---------------------------------------------------------------------------

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_INVALID_ORIGIN: u16 = 4403;
pub const CLOSE_RATE_LIMITED: u16 = 4429;

// ---------------------------------------------------------------------------
// Input bitfield
// ---------------------------------------------------------------------------

pub const INPUT_FORWARD: u8 = 1 << 0;
pub const INPUT_BACK: u8 = 1 << 1;
pub const INPUT_LEFT: u8 = 1 << 2;
pub const INPUT_RIGHT: u8 = 1 << 3;
pub const INPUT_JUMP: u8 = 1 << 4;
pub const INPUT_SNEAK: u8 = 1 << 5;

// ---------------------------------------------------------------------------
// Error codes & reject reasons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthFailed,
    AuthExpired,
    WorldNotFound,
    WorldFull,
    RegistryMismatch,
    GeneratorMismatch,
    RateLimited,
    InvalidRequest,
    OutOfBounds,
    PermissionDenied,
}

/// Why a block edit was rejected. Serialized as the human-readable phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    #[serde(rename = "rate limited")]
    RateLimited,
    #[serde(rename = "out of bounds")]
    OutOfBounds,
    #[serde(rename = "too far")]
    TooFar,
    #[serde(rename = "nothing to break")]
    NothingToBreak,
    #[serde(rename = "block occupied")]
    BlockOccupied,
    #[serde(rename = "cannot place inside self")]
    CannotPlaceInsideSelf,
    #[serde(rename = "failed to apply edit")]
    FailedToApply,
}

// ---------------------------------------------------------------------------
// Client → server frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "HELLO")]
    Hello(Hello),
    #[serde(rename = "INPUT")]
    Input(Input),
    #[serde(rename = "SUBSCRIBE")]
    Subscribe(Subscribe),
    #[serde(rename = "BLOCK_EDIT_REQUEST")]
    BlockEditRequest(BlockEditRequest),
}

/// First frame on every connection; anything else is a protocol error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    pub registry_version: u32,
    pub generator_version: u32,
    /// Signed credential or (where enabled) an unsigned short-lived token.
    pub jwt: String,
    pub world_id: String,
}

/// Client-reported motion sample. `inputs` is the held-key bitfield.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    pub protocol_version: u32,
    /// Client-side monotonic input sequence number.
    pub seq: u64,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub vx: f32,
    pub vy: f32,
    pub vz: f32,
    pub yaw: f32,
    pub pitch: f32,
    #[serde(default)]
    pub inputs: u8,
}

/// Change the set of sections this participant wants streamed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscribe {
    pub protocol_version: u32,
    #[serde(default)]
    pub subscribe: Vec<String>,
    #[serde(default)]
    pub unsubscribe: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEditRequest {
    pub protocol_version: u32,
    /// Client-chosen id; repeated ids replay the cached outcome.
    pub request_id: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub block_id: u16,
}

// ---------------------------------------------------------------------------
// Server → client frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "WELCOME")]
    Welcome(Welcome),
    #[serde(rename = "SNAPSHOT")]
    Snapshot(Snapshot),
    #[serde(rename = "SECTION_DATA")]
    SectionData(SectionData),
    #[serde(rename = "BLOCK_EVENT")]
    BlockEvent(BlockEvent),
    #[serde(rename = "PLAYER_JOIN")]
    PlayerJoin(PlayerJoin),
    #[serde(rename = "PLAYER_LEAVE")]
    PlayerLeave(PlayerLeave),
    #[serde(rename = "ERROR")]
    Error(ErrorFrame),
    #[serde(rename = "RESYNC")]
    Resync(Resync),
    #[serde(rename = "REDIRECT")]
    Redirect(Redirect),
}

/// Roster entry carried by `WELCOME`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub player_id: String,
    pub display_name: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub yaw: f32,
    pub pitch: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Welcome {
    pub protocol_version: u32,
    pub registry_version: u32,
    pub generator_version: u32,
    pub world_id: String,
    /// Id assigned to this participant (stable per user).
    pub player_id: String,
    pub display_name: String,
    pub spawn_position: Vec3,
    pub max_players: u32,
    /// Participants already admitted, excluding the new one.
    pub players: Vec<PlayerInfo>,
}

/// Per-player motion state inside a `SNAPSHOT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerState {
    pub player_id: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub vx: f32,
    pub vy: f32,
    pub vz: f32,
    pub yaw: f32,
    pub pitch: f32,
    /// Last input sequence the server processed for this player.
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub protocol_version: u32,
    /// Server wall-clock in milliseconds since the Unix epoch.
    pub server_time_ms: u64,
    pub players: Vec<PlayerState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionData {
    pub protocol_version: u32,
    pub section_id: String,
    pub version: u64,
    /// base64 of exactly 8192 bytes: 4096 little-endian u16 block ids.
    pub blocks: String,
    /// True when the payload is the untouched baseline, false when it has
    /// been edited or came back from the store.
    pub baseline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockEvent {
    pub protocol_version: u32,
    pub request_id: String,
    pub accepted: bool,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub block_id: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_block_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<RejectReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerJoin {
    pub protocol_version: u32,
    pub player_id: String,
    pub display_name: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerLeave {
    pub protocol_version: u32,
    pub player_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub protocol_version: u32,
    pub code: ErrorCode,
    pub message: String,
    /// When true the server closes the connection (code 1000) after sending.
    pub fatal: bool,
}

/// Authoritative motion snap after the server clamped a reported position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resync {
    pub protocol_version: u32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Last input sequence the server accepted before the snap.
    pub seq: u64,
}

/// The requested world is live on another instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Redirect {
    pub protocol_version: u32,
    pub url: String,
}

// ---------------------------------------------------------------------------
// Constructors used all over the server side
// ---------------------------------------------------------------------------

impl ServerFrame {
    pub fn error(code: ErrorCode, message: impl Into<String>, fatal: bool) -> Self {
        ServerFrame::Error(ErrorFrame {
            protocol_version: PROTOCOL_VERSION,
            code,
            message: message.into(),
            fatal,
        })
    }
}
