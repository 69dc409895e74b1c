//! Server shell: listener, background loops, shutdown sequencing.
//!
//! Four periodic loops run alongside the accept loop:
//!
//! | Loop        | Period          | Work                                       |
//! |-------------|-----------------|--------------------------------------------|
//! | tick        | 50 ms           | motion snapshot + paced section delivery   |
//! | persistence | 1 s             | batched upsert of dirty sections           |
//! | heartbeat   | 30 s            | refresh session rows with participant count|
//! | reaper      | stale/4         | close connections idle past the timeout    |
//!
//! Each world's tick work runs in its own task so a panic in one world
//! cannot take down the process or starve the other worlds.

use crate::protocol::CLOSE_NORMAL;
use crate::session::{self, ConnectionLimiter};
use crate::store::Store;
use crate::streamer;
use crate::types::ServerConfig;
use crate::world::WorldRegistry;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Server {
    config: Arc<ServerConfig>,
    store: Arc<dyn Store>,
    registry: Arc<WorldRegistry>,
    limiter: Arc<ConnectionLimiter>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    pub fn new(config: ServerConfig, store: Arc<dyn Store>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(WorldRegistry::new(config.clone(), store.clone()));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            registry,
            limiter: Arc::new(ConnectionLimiter::new()),
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<WorldRegistry> {
        &self.registry
    }

    /// Request a graceful shutdown; `run` unwinds and returns.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Accept connections and drive the background loops until shutdown.
    pub async fn run(&self) -> Result<()> {
        // Clear session rows orphaned by a previous crash of this instance.
        if let Err(e) = self.store.mark_sessions_offline(&self.config.instance_id).await {
            warn!("Startup mark_sessions_offline failed: {e}");
        }

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.bind_addr))?;
        info!(
            "quarry-world-server listening on {} (instance {}, region {})",
            self.config.bind_addr, self.config.instance_id, self.config.region
        );

        let tick = tokio::spawn(tick_loop(self.registry.clone(), self.shutdown.subscribe()));
        let persist = tokio::spawn(persistence_loop(
            self.registry.clone(),
            self.shutdown.subscribe(),
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.registry.clone(),
            self.shutdown.subscribe(),
        ));
        let reaper = tokio::spawn(reaper_loop(self.registry.clone(), self.shutdown.subscribe()));

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(session::serve_connection(
                            self.registry.clone(),
                            self.limiter.clone(),
                            self.shutdown.subscribe(),
                            stream,
                            peer,
                        ));
                    }
                    Err(e) => warn!("Accept failed: {e}"),
                },
            }
        }

        info!("Shutting down: closing connections");
        // Connections observe the shutdown watch themselves; nudge any
        // writer that is only waiting on its channel.
        for world in self.registry.active_worlds() {
            let data = world.data.lock();
            for participant in data.participants.values() {
                participant.close(crate::protocol::CLOSE_GOING_AWAY, "server shutting down");
            }
        }

        let _ = tokio::join!(tick, persist, heartbeat, reaper);

        // Final flush: after this no section may remain dirty.
        for world in self.registry.active_worlds() {
            if let Err(e) = world.flush_dirty(&self.store).await {
                warn!("Final flush failed for {}: {e}", world.id);
            }
        }
        if let Err(e) = self.store.mark_sessions_offline(&self.config.instance_id).await {
            warn!("Shutdown mark_sessions_offline failed: {e}");
        }
        info!("Shutdown complete");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

/// 20 Hz: per world, broadcast the motion snapshot and drain pending
/// section queues. Each world runs in its own task for panic isolation.
async fn tick_loop(registry: Arc<WorldRegistry>, mut shutdown: watch::Receiver<bool>) {
    let config = registry.config().clone();
    let mut timer = tokio::time::interval(config.tick_period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {
                for world in registry.active_worlds() {
                    let store = registry.store().clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        if let Some(snapshot) = world.build_snapshot() {
                            world.broadcast(&snapshot);
                        }
                        streamer::pump_world(&world, &store, &config).await;
                    });
                }
            }
        }
    }
}

/// 1 Hz: drain the dirty set per world. Failures keep the dirty flag for
/// the next cycle.
async fn persistence_loop(registry: Arc<WorldRegistry>, mut shutdown: watch::Receiver<bool>) {
    let config = registry.config().clone();
    let mut timer = tokio::time::interval(config.flush_period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {
                for world in registry.active_worlds() {
                    if world.is_default() {
                        continue;
                    }
                    if let Err(e) = world.flush_dirty(registry.store()).await {
                        warn!("Persistence flush failed for {}: {e}", world.id);
                    }
                }
            }
        }
    }
}

/// Refresh each active world's session row.
async fn heartbeat_loop(registry: Arc<WorldRegistry>, mut shutdown: watch::Receiver<bool>) {
    let config = registry.config().clone();
    let mut timer = tokio::time::interval(config.heartbeat_period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {
                for world in registry.active_worlds() {
                    let stats = world.stats();
                    debug!(
                        world = %world.id,
                        participants = stats.participants,
                        sections = stats.loaded_sections,
                        dirty = stats.dirty_sections,
                        subscriptions = stats.subscriptions,
                        "world heartbeat"
                    );
                    if world.is_default() {
                        continue;
                    }
                    if let Err(e) = registry
                        .store()
                        .heartbeat(&world.id, stats.participants as u32)
                        .await
                    {
                        warn!("Heartbeat failed for {}: {e}", world.id);
                    }
                }
            }
        }
    }
}

/// Close connections whose last activity is older than the stale timeout.
/// The close travels the connection's own exit path, which performs the
/// full departure cleanup.
async fn reaper_loop(registry: Arc<WorldRegistry>, mut shutdown: watch::Receiver<bool>) {
    let config = registry.config().clone();
    let mut timer = tokio::time::interval(config.stale_timeout / 4);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {
                let now = Instant::now();
                for world in registry.active_worlds() {
                    let data = world.data.lock();
                    for participant in data.participants.values() {
                        if now.duration_since(participant.last_activity) > config.stale_timeout {
                            info!(
                                "Reaping stale participant {} in world {}",
                                participant.user_id, world.id
                            );
                            participant.close(CLOSE_NORMAL, "idle timeout");
                        }
                    }
                }
            }
        }
    }
}
