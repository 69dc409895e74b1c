//! Section storage: the 16×16×16 unit of world state and its byte codec.
//!
//! A section holds 4096 unsigned 16-bit block ids indexed by
//! [`crate::coords::local_index`]. On the wire and in the store the blocks
//! serialize to exactly 8192 bytes of little-endian u16s; the wire
//! additionally base64-encodes that blob.

use crate::coords::SectionCoord;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::time::Instant;
use thiserror::Error;

/// Blocks per section.
pub const SECTION_VOLUME: usize = 4096;
/// Serialized size of a section's blocks.
pub const SECTION_BYTES: usize = SECTION_VOLUME * 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SectionError {
    #[error("section blob must be {SECTION_BYTES} bytes, got {0}")]
    BadLength(usize),
    #[error("section payload is not valid base64")]
    BadEncoding,
}

// ---------------------------------------------------------------------------
// Section
// ---------------------------------------------------------------------------

/// One loaded section. Owned exclusively by its world.
pub struct Section {
    pub coord: SectionCoord,
    blocks: Box<[u16; SECTION_VOLUME]>,
    /// 0 for an untouched baseline; incremented by one on each accepted edit.
    pub version: u64,
    /// In-memory contents differ from the durable store.
    pub dirty: bool,
    /// Loaded from the store rather than generated.
    pub from_store: bool,
    pub last_access: Instant,
}

impl Section {
    /// A freshly generated baseline section (version 0, clean).
    pub fn baseline(coord: SectionCoord, blocks: Box<[u16; SECTION_VOLUME]>) -> Self {
        Self {
            coord,
            blocks,
            version: 0,
            dirty: false,
            from_store: false,
            last_access: Instant::now(),
        }
    }

    /// A section materialized from a store row.
    pub fn from_store_row(
        coord: SectionCoord,
        blob: &[u8],
        version: u64,
    ) -> Result<Self, SectionError> {
        Ok(Self {
            coord,
            blocks: bytes_to_blocks(blob)?,
            version,
            dirty: false,
            from_store: true,
            last_access: Instant::now(),
        })
    }

    pub fn get(&self, index: usize) -> u16 {
        self.blocks[index]
    }

    pub fn set(&mut self, index: usize, block_id: u16) {
        self.blocks[index] = block_id;
    }

    /// Whether the payload is still the untouched baseline.
    pub fn is_baseline(&self) -> bool {
        self.version == 0 && !self.from_store
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    /// Little-endian serialization of the block array.
    pub fn to_bytes(&self) -> Vec<u8> {
        blocks_to_bytes(&self.blocks)
    }

    /// Wire encoding: base64 over [`Section::to_bytes`].
    pub fn encode_wire(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

pub fn blocks_to_bytes(blocks: &[u16; SECTION_VOLUME]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SECTION_BYTES);
    for id in blocks.iter() {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out
}

pub fn bytes_to_blocks(blob: &[u8]) -> Result<Box<[u16; SECTION_VOLUME]>, SectionError> {
    if blob.len() != SECTION_BYTES {
        return Err(SectionError::BadLength(blob.len()));
    }
    let mut blocks = Box::new([0u16; SECTION_VOLUME]);
    for (i, pair) in blob.chunks_exact(2).enumerate() {
        blocks[i] = u16::from_le_bytes([pair[0], pair[1]]);
    }
    Ok(blocks)
}

/// Decode a wire payload (base64 of the 8192-byte little-endian blob).
pub fn decode_wire(payload: &str) -> Result<Box<[u16; SECTION_VOLUME]>, SectionError> {
    let blob = BASE64
        .decode(payload)
        .map_err(|_| SectionError::BadEncoding)?;
    bytes_to_blocks(&blob)
}
