//! Chunk streamer: per-participant subscription sets and paced section
//! delivery.
//!
//! Subscribes append to a per-participant pending queue; the tick
//! broadcaster drains each queue at `sections_per_second / ticks_per_second`
//! sections per tick (at least one immediately on an explicit subscribe).
//! The participant's subscribed set and the world's subscription index are
//! updated together on every path, including disconnect.

use crate::coords::SectionCoord;
use crate::protocol::{ErrorCode, SectionData, ServerFrame, Subscribe, PROTOCOL_VERSION};
use crate::store::Store;
use crate::types::ServerConfig;
use crate::world::{WorldData, WorldHandle};
use log::warn;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

// ---------------------------------------------------------------------------
// Subscription changes
// ---------------------------------------------------------------------------

/// Apply one `SUBSCRIBE` frame. On a limit violation an error frame is sent
/// and the rest of the message is dropped; entries already processed stay.
pub async fn handle_subscribe(
    world: &Arc<WorldHandle>,
    store: &Arc<dyn Store>,
    config: &ServerConfig,
    user: &str,
    msg: &Subscribe,
) {
    let added_any = {
        let mut data = world.data.lock();
        let WorldData {
            participants, subs, ..
        } = &mut *data;
        let Some(p) = participants.get_mut(user) else {
            return;
        };
        p.last_activity = Instant::now();

        for id in &msg.unsubscribe {
            let Ok(coord) = SectionCoord::parse(id) else {
                p.send(ServerFrame::error(
                    ErrorCode::InvalidRequest,
                    format!("invalid section id '{id}'"),
                    false,
                ));
                return;
            };
            if p.subscribed.remove(&coord) {
                p.pending.retain(|c| *c != coord);
                if let Some(set) = subs.get_mut(&coord) {
                    set.remove(user);
                    let empty = set.is_empty();
                    if empty {
                        subs.remove(&coord);
                    }
                }
            }
        }

        let mut added = false;
        for id in &msg.subscribe {
            let Ok(coord) = SectionCoord::parse(id) else {
                p.send(ServerFrame::error(
                    ErrorCode::InvalidRequest,
                    format!("invalid section id '{id}'"),
                    false,
                ));
                break;
            };
            if !p.subscribe_rate.try_acquire(config.subscribes_per_second) {
                p.send(ServerFrame::error(
                    ErrorCode::RateLimited,
                    "subscribe rate exceeded",
                    false,
                ));
                break;
            }
            if p.subscribed.contains(&coord) {
                continue;
            }
            if p.subscribed.len() >= config.max_subscriptions {
                p.send(ServerFrame::error(
                    ErrorCode::RateLimited,
                    "subscription limit reached",
                    false,
                ));
                break;
            }
            p.subscribed.insert(coord);
            subs.entry(coord).or_default().insert(user.to_string());
            p.pending.push_back(coord);
            added = true;
        }
        added
    };

    // An explicit subscribe gets at least one section without waiting for
    // the next tick.
    if added_any {
        pump_participant(world, store, config, user).await;
    }
}

// ---------------------------------------------------------------------------
// Paced delivery
// ---------------------------------------------------------------------------

/// Tick-driven drain of every participant's pending queue.
pub async fn pump_world(world: &Arc<WorldHandle>, store: &Arc<dyn Store>, config: &ServerConfig) {
    let quota = config.sections_per_tick();
    let batches: Vec<(String, Vec<SectionCoord>)> = {
        let mut data = world.data.lock();
        data.participants
            .iter_mut()
            .filter_map(|(id, p)| {
                if p.pending.is_empty() {
                    None
                } else {
                    let n = quota.min(p.pending.len());
                    Some((id.clone(), p.pending.drain(..n).collect()))
                }
            })
            .collect()
    };
    if !batches.is_empty() {
        deliver(world, store, batches).await;
    }
}

async fn pump_participant(
    world: &Arc<WorldHandle>,
    store: &Arc<dyn Store>,
    config: &ServerConfig,
    user: &str,
) {
    let quota = config.sections_per_tick();
    let batch: Vec<SectionCoord> = {
        let mut data = world.data.lock();
        let Some(p) = data.participants.get_mut(user) else {
            return;
        };
        let n = quota.min(p.pending.len());
        p.pending.drain(..n).collect()
    };
    if !batch.is_empty() {
        deliver(world, store, vec![(user.to_string(), batch)]).await;
    }
}

/// Load every needed section (store I/O, no data lock held), then send the
/// frames. Sections that fail to load are requeued for the next cycle; one
/// participant's failure never blocks another's delivery.
async fn deliver(
    world: &Arc<WorldHandle>,
    store: &Arc<dyn Store>,
    batches: Vec<(String, Vec<SectionCoord>)>,
) {
    let needed: BTreeSet<SectionCoord> = batches
        .iter()
        .flat_map(|(_, coords)| coords.iter().copied())
        .collect();

    let mut failed: BTreeSet<SectionCoord> = BTreeSet::new();
    for coord in needed {
        if let Err(e) = world.ensure_section(store, coord).await {
            warn!("Section {coord} load failed for world {}: {e}", world.id);
            failed.insert(coord);
        }
    }

    let mut data = world.data.lock();
    let WorldData {
        participants,
        sections,
        ..
    } = &mut *data;
    for (user, coords) in batches {
        let Some(p) = participants.get_mut(&user) else {
            continue;
        };
        for coord in coords {
            // Dropped mid-flight by an unsubscribe.
            if !p.subscribed.contains(&coord) {
                continue;
            }
            if failed.contains(&coord) {
                p.pending.push_back(coord);
                continue;
            }
            let Some(section) = sections.get_mut(&coord) else {
                continue;
            };
            section.touch();
            p.send(ServerFrame::SectionData(SectionData {
                protocol_version: PROTOCOL_VERSION,
                section_id: coord.to_string(),
                version: section.version,
                blocks: section.encode_wire(),
                baseline: section.is_baseline(),
            }));
        }
    }
}
