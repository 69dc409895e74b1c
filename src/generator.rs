//! Baseline generator: the deterministic section function for generator
//! version 1.
//!
//! Version 1 is the flat world. World-space layers:
//!
//! | world y | block |
//! |---------|-------|
//! | 0..=3   | stone |
//! | 4       | grass |
//! | 5..     | air   |
//!
//! The function is pure: same section id, same blocks, no store access.

use crate::coords::{SectionCoord, SECTION_SIZE, WORLD_EXTENT_XZ};
use crate::section::SECTION_VOLUME;
use crate::types::Vec3;

pub const AIR: u16 = 0;
pub const STONE: u16 = 1;
pub const GRASS: u16 = 2;

/// Highest solid world-y layer of the baseline.
pub const GROUND_Y: i32 = 4;

/// Compute the baseline blocks for a section.
pub fn baseline_blocks(section: SectionCoord) -> Box<[u16; SECTION_VOLUME]> {
    let mut blocks = Box::new([AIR; SECTION_VOLUME]);
    let base_y = section.sy * SECTION_SIZE;
    for ly in 0..SECTION_SIZE {
        let world_y = base_y + ly;
        let id = if world_y < GROUND_Y {
            STONE
        } else if world_y == GROUND_Y {
            GRASS
        } else {
            AIR
        };
        if id == AIR {
            continue;
        }
        let layer = (ly as usize) * 256;
        blocks[layer..layer + 256].fill(id);
    }
    blocks
}

/// Spawn point for newly admitted participants: the world centre, feet
/// resting on the grass layer.
pub fn spawn_position() -> Vec3 {
    let centre = (WORLD_EXTENT_XZ / 2) as f32 + 0.5;
    Vec3::new(centre, (GROUND_Y + 1) as f32, centre)
}
