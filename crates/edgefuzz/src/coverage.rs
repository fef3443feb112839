//! Edge-coverage bitmaps in the AFL shared-memory layout.
//!
//! The instrumented target writes one byte per edge into a fixed-size map;
//! any nonzero byte counts as a hit. This module owns the map type, the
//! merge/novelty operations the feedback loop is built on, and the parser
//! for map files dumped out of the shared-memory region.

use std::{fmt, fs, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Number of edge slots in the coverage bitmap.
///
/// Must be a power of two and must match the map size compiled into the
/// instrumented target (the `__AFL_SHM_ID` protocol side).
pub const MAP_SIZE: usize = 65_536;

const _: () = assert!(MAP_SIZE.is_power_of_two());

/// SHA-1 digest over the raw bitmap bytes, used as a stable identity for
/// duplicate detection in the corpus.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature([u8; 20]);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({self})")
    }
}

/// A fixed-size edge-hit bitmap.
#[derive(Clone)]
pub struct CoverageMap {
    bitmap: Box<[u8; MAP_SIZE]>,
}

impl Default for CoverageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CoverageMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoverageMap")
            .field("size", &MAP_SIZE)
            .field("popcount", &self.popcount())
            .finish()
    }
}

impl CoverageMap {
    pub fn new() -> Self {
        Self {
            bitmap: Box::new([0u8; MAP_SIZE]),
        }
    }

    /// Builds a map from a raw shared-memory dump. Bytes beyond [`MAP_SIZE`]
    /// are folded back in modulo the map size.
    pub fn from_raw(raw: &[u8]) -> Self {
        let mut map = Self::new();
        for (offset, byte) in raw.iter().enumerate() {
            if *byte != 0 {
                map.add(offset);
            }
        }
        map
    }

    /// Marks the edge as hit. The id wraps modulo the map size.
    pub fn add(&mut self, edge_id: usize) {
        self.bitmap[edge_id % MAP_SIZE] = 1;
    }

    pub fn contains(&self, edge_id: usize) -> bool {
        self.bitmap[edge_id % MAP_SIZE] != 0
    }

    /// Byte-wise OR of `other` into `self`. Commutative and idempotent.
    pub fn merge(&mut self, other: &CoverageMap) {
        for (dst, src) in self.bitmap.iter_mut().zip(other.bitmap.iter()) {
            *dst |= *src;
        }
    }

    /// Merges `other` and returns how many edges transitioned from unseen
    /// to seen, in a single pass over both maps.
    pub fn merge_and_count_new(&mut self, other: &CoverageMap) -> usize {
        let mut new_edges = 0;
        for (dst, src) in self.bitmap.iter_mut().zip(other.bitmap.iter()) {
            if *src != 0 {
                if *dst == 0 {
                    new_edges += 1;
                }
                *dst |= *src;
            }
        }
        new_edges
    }

    /// Number of edges marked as hit.
    pub fn popcount(&self) -> usize {
        self.bitmap.iter().filter(|byte| **byte != 0).count()
    }

    /// Copy of the raw bitmap bytes.
    pub fn to_compact(&self) -> Box<[u8]> {
        self.bitmap.to_vec().into_boxed_slice()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bitmap.as_slice()
    }

    /// SHA-1 over the raw bitmap bytes.
    pub fn signature(&self) -> Signature {
        let mut hasher = Sha1::new();
        hasher.update(self.bitmap.as_slice());
        Signature(hasher.finalize().into())
    }
}

/// Parses a coverage map dumped to a file.
///
/// Text decoding is attempted first: every decimal or `0x`-prefixed integer
/// found on any line is added as an edge id. If no integer is found the file
/// is treated as a binary bitmap where each nonzero byte at offset `i` marks
/// edge `i`. Token-level parse failures are skipped, leaving the partial map
/// valid.
pub fn parse_map_file(path: &Path) -> anyhow::Result<CoverageMap> {
    let raw = fs::read(path).with_context(|| format!("Reading coverage map {}", path.display()))?;

    let mut map = CoverageMap::new();
    let text = String::from_utf8_lossy(&raw);
    let mut found_integers = false;
    for line in text.lines() {
        for token in line.split(|c: char| c.is_whitespace() || c == ',') {
            if token.is_empty() {
                continue;
            }
            let parsed = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
                Some(hex) => usize::from_str_radix(hex, 16),
                None => token.parse::<usize>(),
            };
            if let Ok(edge_id) = parsed {
                map.add(edge_id);
                found_integers = true;
            }
        }
    }
    if found_integers {
        return Ok(map);
    }

    Ok(CoverageMap::from_raw(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with(edges: &[usize]) -> CoverageMap {
        let mut map = CoverageMap::new();
        for edge in edges {
            map.add(*edge);
        }
        map
    }

    #[test]
    fn add_wraps_modulo_size() {
        let mut map = CoverageMap::new();
        map.add(MAP_SIZE + 3);
        assert!(map.contains(3));
        assert_eq!(map.popcount(), 1);
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let mut map = map_with(&[1, 5, 100]);
        let before = map.to_compact();
        map.merge(&CoverageMap::new());
        assert_eq!(map.to_compact(), before);
    }

    #[test]
    fn merge_with_self_is_idempotent() {
        let mut map = map_with(&[1, 5, 100]);
        let clone = map.clone();
        map.merge(&clone);
        assert_eq!(map.popcount(), 3);
        assert_eq!(map.merge_and_count_new(&clone), 0);
    }

    #[test]
    fn merge_and_count_new_matches_popcount_delta() {
        let mut base = map_with(&[1, 2, 3]);
        let other = map_with(&[3, 4, 5]);
        let before = base.popcount();
        let new_edges = base.merge_and_count_new(&other);
        assert_eq!(new_edges, 2);
        assert_eq!(base.popcount(), before + new_edges);
    }

    #[test]
    fn all_zero_and_saturated_popcounts() {
        let empty = CoverageMap::new();
        assert_eq!(empty.popcount(), 0);

        let full = CoverageMap::from_raw(&[1u8; MAP_SIZE]);
        assert_eq!(full.popcount(), MAP_SIZE);

        let mut merged = map_with(&[17]);
        merged.merge(&full);
        assert_eq!(merged.popcount(), MAP_SIZE);
    }

    #[test]
    fn signature_is_stable_and_content_sensitive() {
        let a = map_with(&[9, 11]);
        let b = map_with(&[9, 11]);
        let c = map_with(&[9, 12]);
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn parse_text_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.txt");
        std::fs::write(&path, "12\n0x20, 48\nnoise 7\n").unwrap();
        let map = parse_map_file(&path).unwrap();
        assert!(map.contains(12));
        assert!(map.contains(0x20));
        assert!(map.contains(48));
        assert!(map.contains(7));
        assert_eq!(map.popcount(), 4);
    }

    #[test]
    fn parse_binary_map_falls_back_on_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.bin");
        let mut raw = vec![0u8; 64];
        raw[3] = 0xff;
        raw[60] = 2;
        std::fs::write(&path, &raw).unwrap();
        let map = parse_map_file(&path).unwrap();
        assert!(map.contains(3));
        assert!(map.contains(60));
        assert_eq!(map.popcount(), 2);
    }

    #[test]
    fn parse_round_trips_binary_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.bin");
        let map = map_with(&[0, 7, 4096]);
        std::fs::write(&path, map.as_bytes()).unwrap();
        let parsed = parse_map_file(&path).unwrap();
        assert_eq!(parsed.signature(), map.signature());
    }
}
