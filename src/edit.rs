//! Block-edit arbiter.
//!
//! Edits to one world are serialized on the world's async edit gate, so two
//! accepted edits can never interleave and section versions form a strict
//! per-section linearization. Store I/O (loading the target section,
//! back-pressure flushes) happens while holding only the gate, never the
//! data lock.
//!
//! Outcomes are cached by client-chosen request id for the idempotency
//! window: a replayed id yields the identical response to the requester and
//! no re-broadcast. Rejections go to the requester only.

use crate::coords::{self, SectionCoord};
use crate::generator::AIR;
use crate::protocol::{BlockEditRequest, BlockEvent, RejectReason, ServerFrame, PROTOCOL_VERSION};
use crate::store::Store;
use crate::types::{ServerConfig, Vec3};
use crate::world::{CachedEdit, WorldData, WorldHandle};
use log::warn;
use std::sync::Arc;
use std::time::Instant;

/// Eye height above the participant's position.
const EYE_HEIGHT: f32 = 1.6;
/// Participant collision box: half-width and height above `position.y`.
const HALF_WIDTH: f32 = 0.3;
const HEIGHT: f32 = 1.8;

pub async fn handle_edit(
    world: &Arc<WorldHandle>,
    store: &Arc<dyn Store>,
    config: &ServerConfig,
    user: &str,
    req: &BlockEditRequest,
) {
    let _gate = world.edit_gate.lock().await;

    // Idempotent replay: identical response, no re-broadcast.
    {
        let data = world.data.lock();
        if let Some(cached) = data.edit_cache.get(&req.request_id) {
            if cached.at.elapsed() <= config.request_id_ttl {
                if let Some(p) = data.participants.get(user) {
                    p.send(ServerFrame::BlockEvent(cached.event.clone()));
                }
                return;
            }
        }
    }

    // Rate, bounds and reach are decided before touching any section.
    let precheck = {
        let mut data = world.data.lock();
        let Some(p) = data.participants.get_mut(user) else {
            return;
        };
        p.last_activity = Instant::now();
        if !p.edit_rate.try_acquire(config.edits_per_second) {
            Err(RejectReason::RateLimited)
        } else if !coords::block_in_bounds(req.x, req.y, req.z) {
            Err(RejectReason::OutOfBounds)
        } else {
            let eye = Vec3::new(p.position.x, p.position.y + EYE_HEIGHT, p.position.z);
            let centre = Vec3::new(
                req.x as f32 + 0.5,
                req.y as f32 + 0.5,
                req.z as f32 + 0.5,
            );
            if eye.distance(centre) > config.max_reach {
                Err(RejectReason::TooFar)
            } else {
                Ok(())
            }
        }
    };
    if let Err(reason) = precheck {
        reject(world, config, user, req, reason);
        return;
    }

    // Bounds hold, so the section coordinate exists.
    let Ok(coord) = SectionCoord::from_world(req.x, req.y, req.z) else {
        reject(world, config, user, req, RejectReason::OutOfBounds);
        return;
    };

    if let Err(e) = world.ensure_section(store, coord).await {
        warn!("Section load failed for edit in {}: {e}", world.id);
        reject(world, config, user, req, RejectReason::FailedToApply);
        return;
    }

    // Apply under the data lock; the gate guarantees no other edit races.
    {
        let mut data = world.data.lock();
        let Some(p) = data.participants.get(user) else {
            return;
        };
        let position = p.position;

        let (lx, ly, lz) = coord.local_of(req.x, req.y, req.z);
        let index = coords::local_index(lx, ly, lz);

        let applied = match data.sections.get_mut(&coord) {
            // ensure_section just succeeded; an eviction in between is the
            // only way here.
            None => Err(RejectReason::FailedToApply),
            Some(section) => {
                let prev = section.get(index);
                if req.block_id == AIR && prev == AIR {
                    Err(RejectReason::NothingToBreak)
                } else if req.block_id != AIR && prev != AIR {
                    Err(RejectReason::BlockOccupied)
                } else if req.block_id != AIR && intersects_self(position, req.x, req.y, req.z) {
                    Err(RejectReason::CannotPlaceInsideSelf)
                } else {
                    section.set(index, req.block_id);
                    section.version += 1;
                    section.dirty = true;
                    section.touch();
                    Ok((prev, section.version))
                }
            }
        };

        let (prev, version) = match applied {
            Ok(applied) => applied,
            Err(reason) => {
                reject_locked(&mut data, config, user, req, reason);
                return;
            }
        };

        let event = BlockEvent {
            protocol_version: PROTOCOL_VERSION,
            request_id: req.request_id.clone(),
            accepted: true,
            x: req.x,
            y: req.y,
            z: req.z,
            block_id: req.block_id,
            section_id: Some(coord.to_string()),
            previous_block_id: Some(prev),
            section_version: Some(version),
            reject_reason: None,
        };
        cache_insert(&mut data, config, req.request_id.clone(), event.clone());

        // Deliver to the requester and every subscriber of the section.
        let frame = ServerFrame::BlockEvent(event);
        if let Some(p) = data.participants.get(user) {
            p.send(frame.clone());
        }
        if let Some(subscribers) = data.subs.get(&coord) {
            for id in subscribers {
                if id != user {
                    if let Some(p) = data.participants.get(id) {
                        p.send(frame.clone());
                    }
                }
            }
        }
    }

    // Back-pressure: a world holding too many dirty sections flushes now
    // rather than waiting for the persistence cycle.
    if !world.is_default() && world.dirty_count() > config.max_dirty_sections {
        if let Err(e) = world.flush_dirty(store).await {
            warn!("Back-pressure flush failed for {}: {e}", world.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Rejection path
// ---------------------------------------------------------------------------

/// Build, cache and send a rejection to the requester only.
fn reject(
    world: &Arc<WorldHandle>,
    config: &ServerConfig,
    user: &str,
    req: &BlockEditRequest,
    reason: RejectReason,
) {
    let mut data = world.data.lock();
    reject_locked(&mut data, config, user, req, reason);
}

fn reject_locked(
    data: &mut WorldData,
    config: &ServerConfig,
    user: &str,
    req: &BlockEditRequest,
    reason: RejectReason,
) {
    let event = BlockEvent {
        protocol_version: PROTOCOL_VERSION,
        request_id: req.request_id.clone(),
        accepted: false,
        x: req.x,
        y: req.y,
        z: req.z,
        block_id: req.block_id,
        section_id: SectionCoord::from_world(req.x, req.y, req.z)
            .ok()
            .map(|c| c.to_string()),
        previous_block_id: None,
        section_version: None,
        reject_reason: Some(reason),
    };
    cache_insert(data, config, req.request_id.clone(), event.clone());
    if let Some(p) = data.participants.get(user) {
        p.send(ServerFrame::BlockEvent(event));
    }
}

/// Insert into the response cache, lazily evicting entries past the TTL.
fn cache_insert(data: &mut WorldData, config: &ServerConfig, request_id: String, event: BlockEvent) {
    let now = Instant::now();
    let ttl = config.request_id_ttl;
    data.edit_cache
        .retain(|_, entry| now.duration_since(entry.at) <= ttl);
    data.edit_cache
        .insert(request_id, CachedEdit { event, at: now });
}

/// Whether the block at `(x, y, z)` overlaps the participant's collision
/// box.
fn intersects_self(position: Vec3, x: i32, y: i32, z: i32) -> bool {
    let (bx, by, bz) = (x as f32, y as f32, z as f32);
    position.x - HALF_WIDTH < bx + 1.0
        && position.x + HALF_WIDTH > bx
        && position.y < by + 1.0
        && position.y + HEIGHT > by
        && position.z - HALF_WIDTH < bz + 1.0
        && position.z + HALF_WIDTH > bz
}
