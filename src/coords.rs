//! Section coordinate codec: world↔section↔local index math and the
//! `"cx:cz:sy"` identifier format.
//!
//! World extents are fixed: 256×256 section columns of 8 vertical sections,
//! i.e. block coordinates `0 ≤ x, z < 4096` and `0 ≤ y < 128`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Blocks along one section edge.
pub const SECTION_SIZE: i32 = 16;
/// Section columns along the world X/Z axes.
pub const WORLD_SECTIONS_XZ: i32 = 256;
/// Sections stacked along the world Y axis.
pub const WORLD_SECTIONS_Y: i32 = 8;
/// World extent in blocks along X/Z.
pub const WORLD_EXTENT_XZ: i32 = WORLD_SECTIONS_XZ * SECTION_SIZE;
/// World extent in blocks along Y.
pub const WORLD_EXTENT_Y: i32 = WORLD_SECTIONS_Y * SECTION_SIZE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordError {
    #[error("malformed section id '{0}'")]
    Malformed(String),
    #[error("section ({0}, {1}, {2}) outside world bounds")]
    OutOfBounds(i32, i32, i32),
}

// ---------------------------------------------------------------------------
// Section coordinate
// ---------------------------------------------------------------------------

/// Identifies one 16×16×16 section, serialized as `"cx:cz:sy"`.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SectionCoord {
    pub cx: i32,
    pub cz: i32,
    pub sy: i32,
}

impl SectionCoord {
    /// Bounds-checked constructor.
    pub fn new(cx: i32, cz: i32, sy: i32) -> Result<Self, CoordError> {
        if (0..WORLD_SECTIONS_XZ).contains(&cx)
            && (0..WORLD_SECTIONS_XZ).contains(&cz)
            && (0..WORLD_SECTIONS_Y).contains(&sy)
        {
            Ok(Self { cx, cz, sy })
        } else {
            Err(CoordError::OutOfBounds(cx, cz, sy))
        }
    }

    /// Section containing the block at world coordinates `(x, y, z)`.
    pub fn from_world(x: i32, y: i32, z: i32) -> Result<Self, CoordError> {
        if !block_in_bounds(x, y, z) {
            return Err(CoordError::OutOfBounds(x, y, z));
        }
        // Non-negative after the bounds check, so plain division floors.
        Self::new(x / SECTION_SIZE, z / SECTION_SIZE, y / SECTION_SIZE)
    }

    /// Strict parse of the `"cx:cz:sy"` form: exactly three non-negative
    /// decimal integer components, each inside world bounds.
    pub fn parse(s: &str) -> Result<Self, CoordError> {
        let mut parts = s.split(':');
        let mut next = || -> Result<i32, CoordError> {
            let part = parts.next().ok_or_else(|| CoordError::Malformed(s.into()))?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(CoordError::Malformed(s.into()));
            }
            part.parse().map_err(|_| CoordError::Malformed(s.into()))
        };
        let (cx, cz, sy) = (next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(CoordError::Malformed(s.into()));
        }
        Self::new(cx, cz, sy)
    }

    /// Block-space origin of this section.
    pub fn origin(&self) -> (i32, i32, i32) {
        (
            self.cx * SECTION_SIZE,
            self.sy * SECTION_SIZE,
            self.cz * SECTION_SIZE,
        )
    }

    /// Local coordinates of a world-space block inside this section.
    /// The block must lie in this section.
    pub fn local_of(&self, x: i32, y: i32, z: i32) -> (usize, usize, usize) {
        let (ox, oy, oz) = self.origin();
        ((x - ox) as usize, (y - oy) as usize, (z - oz) as usize)
    }
}

impl std::fmt::Display for SectionCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.cx, self.cz, self.sy)
    }
}

// ---------------------------------------------------------------------------
// Index math
// ---------------------------------------------------------------------------

/// Flat index of a local block position: `ly·256 + lz·16 + lx`.
pub fn local_index(lx: usize, ly: usize, lz: usize) -> usize {
    debug_assert!(lx < 16 && ly < 16 && lz < 16);
    ly * 256 + lz * 16 + lx
}

/// Whether a world-space block coordinate lies inside the world.
pub fn block_in_bounds(x: i32, y: i32, z: i32) -> bool {
    (0..WORLD_EXTENT_XZ).contains(&x)
        && (0..WORLD_EXTENT_Y).contains(&y)
        && (0..WORLD_EXTENT_XZ).contains(&z)
}

// ---------------------------------------------------------------------------
// Radius queries
// ---------------------------------------------------------------------------

/// All sections whose column lies inside the closed disk of radius
/// `r_chunks` around `center`'s column, as full 8-section columns, clipped
/// to world bounds.
///
/// Ordered by Manhattan distance of the column to the center column,
/// breaking ties lexicographically on `(cx, cz, sy)`.
pub fn sections_in_radius(center: SectionCoord, r_chunks: i32) -> Vec<SectionCoord> {
    let r = r_chunks.max(0);
    let mut out = Vec::new();
    for cx in (center.cx - r).max(0)..=(center.cx + r).min(WORLD_SECTIONS_XZ - 1) {
        for cz in (center.cz - r).max(0)..=(center.cz + r).min(WORLD_SECTIONS_XZ - 1) {
            let dx = cx - center.cx;
            let dz = cz - center.cz;
            if dx * dx + dz * dz > r * r {
                continue;
            }
            for sy in 0..WORLD_SECTIONS_Y {
                out.push(SectionCoord { cx, cz, sy });
            }
        }
    }
    out.sort_by_key(|s| {
        (
            (s.cx - center.cx).abs() + (s.cz - center.cz).abs(),
            s.cx,
            s.cz,
            s.sy,
        )
    });
    out
}
