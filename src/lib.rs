//! Quarry World Service
//!
//! The authoritative real-time server for the Quarry voxel sandbox.
//!
//! ## Architecture
//!
//! ```text
//! Server  (server.rs)             ← listener, tick/persist/heartbeat loops
//!   └── session  (session.rs)     ← per-connection state machine
//!         ├── WorldRegistry (world.rs)  ← admission, participants, sections
//!         │     ├── edit.rs       ← serialized block-edit arbitration
//!         │     ├── streamer.rs   ← subscriptions + paced delivery
//!         │     └── generator.rs  ← deterministic baseline sections
//!         ├── auth.rs             ← credential verification
//!         └── store.rs            ← durable backend (Postgres / in-memory)
//! ```
//!
//! Clients speak JSON frames (`protocol.rs`) over a WebSocket; sections are
//! 16×16×16 blocks (`section.rs`) addressed by `"cx:cz:sy"` (`coords.rs`).

// Protocol and world-geometry types are always available (no server
// feature needed) so client crates can share them.
pub mod coords;
pub mod generator;
pub mod protocol;
pub mod section;
pub mod types;

// Server-side modules require the `server` feature.
#[cfg(feature = "server")]
pub mod auth;
#[cfg(feature = "server")]
pub mod edit;
#[cfg(feature = "server")]
pub mod server;
#[cfg(feature = "server")]
pub mod session;
#[cfg(feature = "server")]
pub mod store;
#[cfg(feature = "server")]
pub mod streamer;
#[cfg(feature = "server")]
pub mod world;

// Convenience re-exports (server only)
#[cfg(feature = "server")]
pub use auth::{AuthError, CredentialVerifier, Identity};
#[cfg(feature = "server")]
pub use server::Server;
#[cfg(feature = "server")]
pub use store::{MemStore, PgStore, Store};
#[cfg(feature = "server")]
pub use world::{WorldHandle, WorldRegistry, DEFAULT_WORLD_ID};
pub use coords::SectionCoord;
pub use types::{ServerConfig, Vec3, WorldStats};
