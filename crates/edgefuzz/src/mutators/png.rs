//! Structural PNG mutations at the chunk level.
//!
//! Chunks are parsed once per distinct input (bounded LRU keyed by the
//! input hash) and edits recompute the chunk CRC so the variant still
//! passes checksum validation where the strategy intends it to. Safe mode,
//! on by default, avoids deletion-style havoc and extreme length values so
//! most variants survive the target's outermost parser checks.

use std::io::{Read, Write};

use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use indexmap::IndexMap;
use rand::{
    Rng, SeedableRng,
    rngs::SmallRng,
    seq::{IndexedRandom, IteratorRandom},
};
use sha1::{Digest, Sha1};

use super::fallback_perturbation;
use crate::format::PNG_SIGNATURE;

const CHUNK_CACHE_CAPACITY: usize = 512;
const DEFAULT_VARIANTS: usize = 16;

const CRITICAL_CHUNKS: [&[u8; 4]; 4] = [b"IHDR", b"PLTE", b"IDAT", b"IEND"];

/// Byte layout of one chunk inside the file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Chunk {
    /// Offset of the 4-byte length field.
    start: usize,
    /// One past the CRC.
    end: usize,
    kind: [u8; 4],
}

impl Chunk {
    fn payload(&self) -> std::ops::Range<usize> {
        self.start + 8..self.end - 4
    }

    fn is_critical(&self) -> bool {
        CRITICAL_CHUNKS.contains(&&self.kind)
    }
}

#[derive(Debug)]
pub struct PngMutator {
    rng: SmallRng,
    variants: usize,
    /// Disables deletion havoc and extreme length values.
    safe_mode: bool,
    cache: IndexMap<[u8; 20], Vec<Chunk>>,
}

impl PngMutator {
    pub fn new(seed: u64) -> Self {
        Self::with_safe_mode(seed, true)
    }

    pub fn with_safe_mode(seed: u64, safe_mode: bool) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            variants: DEFAULT_VARIANTS,
            safe_mode,
            cache: IndexMap::new(),
        }
    }

    pub fn mutate(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let Some(chunks) = self.parse_cached(data) else {
            return vec![fallback_perturbation(&mut self.rng, data)];
        };
        if chunks.len() < 2 {
            return vec![fallback_perturbation(&mut self.rng, data)];
        }

        let mut variants = Vec::with_capacity(self.variants);
        for _ in 0..self.variants {
            let variant = self.apply_strategy(data, &chunks);
            match variant {
                Some(out) if out != data => variants.push(out),
                _ => variants.push(fallback_perturbation(&mut self.rng, data)),
            }
        }
        variants
    }

    fn apply_strategy(&mut self, data: &[u8], chunks: &[Chunk]) -> Option<Vec<u8>> {
        let destructive_allowed = !self.safe_mode;
        let strategy = if destructive_allowed {
            self.rng.random_range(0..11u8)
        } else {
            // Skip chunk deletion (0) in safe mode.
            self.rng.random_range(1..11u8)
        };
        match strategy {
            0 => self.delete_chunk(data, chunks),
            1 => self.duplicate_chunk(data, chunks),
            2 => self.flip_payload_bytes(data, chunks),
            3 => self.corrupt_length(data, chunks),
            4 => self.swap_adjacent(data, chunks),
            5 => self.mutate_ihdr(data, chunks),
            6 => self.mutate_plte(data, chunks),
            7 => self.mutate_idat_recompress(data, chunks),
            8 => self.inject_chunk(data, chunks),
            9 => self.mutate_filter_types(data, chunks),
            _ => self.corrupt_zlib(data, chunks),
        }
    }

    fn parse_cached(&mut self, data: &[u8]) -> Option<Vec<Chunk>> {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let key: [u8; 20] = hasher.finalize().into();
        if let Some(index) = self.cache.get_index_of(&key) {
            let last = self.cache.len() - 1;
            self.cache.move_index(index, last);
            return Some(self.cache[&key].clone());
        }
        let chunks = parse_chunks(data)?;
        if self.cache.len() >= CHUNK_CACHE_CAPACITY {
            self.cache.shift_remove_index(0);
        }
        self.cache.insert(key, chunks.clone());
        Some(chunks)
    }

    /// Structural edits invalidate memoized parses; the whole table goes.
    fn invalidate_cache(&mut self) {
        self.cache.clear();
    }

    fn pick_non_critical<'c>(&mut self, chunks: &'c [Chunk]) -> Option<&'c Chunk> {
        let eligible: Vec<&Chunk> = chunks.iter().filter(|chunk| !chunk.is_critical()).collect();
        eligible.choose(&mut self.rng).copied()
    }

    fn delete_chunk(&mut self, data: &[u8], chunks: &[Chunk]) -> Option<Vec<u8>> {
        let chunk = self.pick_non_critical(chunks)?;
        let mut out = Vec::with_capacity(data.len());
        out.extend_from_slice(&data[..chunk.start]);
        out.extend_from_slice(&data[chunk.end..]);
        self.invalidate_cache();
        Some(out)
    }

    fn duplicate_chunk(&mut self, data: &[u8], chunks: &[Chunk]) -> Option<Vec<u8>> {
        let chunk = self.pick_non_critical(chunks)?.clone();
        let iend = chunks.iter().find(|candidate| &candidate.kind == b"IEND")?;
        let mut out = Vec::with_capacity(data.len() + chunk.end - chunk.start);
        out.extend_from_slice(&data[..iend.start]);
        out.extend_from_slice(&data[chunk.start..chunk.end]);
        out.extend_from_slice(&data[iend.start..]);
        self.invalidate_cache();
        Some(out)
    }

    fn flip_payload_bytes(&mut self, data: &[u8], chunks: &[Chunk]) -> Option<Vec<u8>> {
        let candidates: Vec<&Chunk> = chunks
            .iter()
            .filter(|chunk| chunk.payload().len() >= 1 && &chunk.kind != b"IEND")
            .collect();
        let chunk = candidates.choose(&mut self.rng)?;
        let mut out = data.to_vec();
        let payload = chunk.payload();
        for _ in 0..self.rng.random_range(1..=4usize) {
            let index = self.rng.random_range(payload.clone());
            out[index] ^= 1 << self.rng.random_range(0..8u32);
        }
        update_chunk_crc(&mut out, chunk);
        Some(out)
    }

    fn corrupt_length(&mut self, data: &[u8], chunks: &[Chunk]) -> Option<Vec<u8>> {
        let chunk = self.pick_non_critical(chunks).cloned().or_else(|| {
            chunks
                .iter()
                .find(|candidate| &candidate.kind != b"IEND")
                .cloned()
        })?;
        let actual = (chunk.end - chunk.start - 12) as i64;
        let new_length = if self.safe_mode {
            // Conservative nudge, never extreme.
            let delta = self.rng.random_range(-actual.min(4)..=16.min(actual.max(1)));
            (actual + delta).max(0) as u32
        } else {
            match self.rng.random_range(0..5u8) {
                0 => (actual + i64::from(self.rng.random_range(1..=1000u16))) as u32,
                1 => (actual - i64::from(self.rng.random_range(1..=1000u16))).max(0) as u32,
                2 => 0,
                3 => u32::MAX,
                _ => self.rng.random_range(0..=u32::MAX),
            }
        };
        let mut out = data.to_vec();
        out[chunk.start..chunk.start + 4].copy_from_slice(&new_length.to_be_bytes());
        self.invalidate_cache();
        Some(out)
    }

    fn swap_adjacent(&mut self, data: &[u8], chunks: &[Chunk]) -> Option<Vec<u8>> {
        let swappable: Vec<usize> = chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| !chunk.is_critical())
            .map(|(index, _)| index)
            .collect();
        let pair = swappable
            .windows(2)
            .filter(|pair| pair[1] == pair[0] + 1)
            .choose(&mut self.rng)?;
        let (first, second) = (&chunks[pair[0]], &chunks[pair[1]]);
        let mut out = Vec::with_capacity(data.len());
        out.extend_from_slice(&data[..first.start]);
        out.extend_from_slice(&data[second.start..second.end]);
        out.extend_from_slice(&data[first.start..first.end]);
        out.extend_from_slice(&data[second.end..]);
        self.invalidate_cache();
        Some(out)
    }

    fn mutate_ihdr(&mut self, data: &[u8], chunks: &[Chunk]) -> Option<Vec<u8>> {
        let ihdr = chunks.iter().find(|chunk| &chunk.kind == b"IHDR")?;
        let payload = ihdr.payload();
        if payload.len() < 13 {
            return None;
        }
        let mut out = data.to_vec();
        match self.rng.random_range(0..4u8) {
            0 => {
                let width: u32 = self.rng.random_range(1..=10_000);
                out[payload.start..payload.start + 4].copy_from_slice(&width.to_be_bytes());
            }
            1 => {
                let height: u32 = self.rng.random_range(1..=10_000);
                out[payload.start + 4..payload.start + 8].copy_from_slice(&height.to_be_bytes());
            }
            2 => {
                let depth = *[1u8, 2, 4, 8, 16, 0, 32, 64, 255]
                    .choose(&mut self.rng)
                    .unwrap_or(&8);
                out[payload.start + 8] = depth;
            }
            _ => {
                let color_type = *[0u8, 2, 3, 4, 6, 1, 5, 7, 255]
                    .choose(&mut self.rng)
                    .unwrap_or(&2);
                out[payload.start + 9] = color_type;
            }
        }
        update_chunk_crc(&mut out, ihdr);
        Some(out)
    }

    fn mutate_plte(&mut self, data: &[u8], chunks: &[Chunk]) -> Option<Vec<u8>> {
        let plte = chunks.iter().find(|chunk| &chunk.kind == b"PLTE")?;
        let payload = plte.payload();
        let entries = payload.len() / 3;
        if entries == 0 {
            return None;
        }
        let mut out = data.to_vec();
        for _ in 0..self.rng.random_range(1..=entries.min(10)) {
            let entry = self.rng.random_range(0..entries);
            let offset = payload.start + entry * 3;
            for channel in 0..3 {
                if self.rng.random_bool(0.5) {
                    out[offset + channel] = self.rng.random::<u8>();
                }
            }
        }
        update_chunk_crc(&mut out, plte);
        Some(out)
    }

    /// Decompress → mutate → recompress one IDAT, fixing up length and CRC.
    fn mutate_idat_recompress(&mut self, data: &[u8], chunks: &[Chunk]) -> Option<Vec<u8>> {
        let idats: Vec<&Chunk> = chunks
            .iter()
            .filter(|chunk| &chunk.kind == b"IDAT")
            .collect();
        let idat = idats.choose(&mut self.rng)?;
        let payload = idat.payload();

        let mut decompressed = Vec::new();
        ZlibDecoder::new(&data[payload.clone()])
            .read_to_end(&mut decompressed)
            .ok()?;
        if decompressed.is_empty() {
            return None;
        }

        for _ in 0..self.rng.random_range(1..=8usize) {
            let index = self.rng.random_range(0..decompressed.len());
            decompressed[index] = self.rng.random::<u8>();
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&decompressed).ok()?;
        let recompressed = encoder.finish().ok()?;

        Some(self.replace_chunk_payload(data, idat, &recompressed))
    }

    /// Targets the per-scanline filter-type bytes inside the decompressed
    /// image stream.
    fn mutate_filter_types(&mut self, data: &[u8], chunks: &[Chunk]) -> Option<Vec<u8>> {
        let idat = chunks.iter().find(|chunk| &chunk.kind == b"IDAT")?;
        let payload = idat.payload();

        let mut decompressed = Vec::new();
        ZlibDecoder::new(&data[payload.clone()])
            .read_to_end(&mut decompressed)
            .ok()?;
        if decompressed.is_empty() {
            return None;
        }

        let mut index = 0;
        while index < decompressed.len() {
            if self.rng.random_bool(0.3) {
                decompressed[index] = if self.rng.random_bool(0.5) {
                    self.rng.random_range(0..=4u8)
                } else {
                    self.rng.random_range(5..=255u8)
                };
            }
            index += self.rng.random_range(1..=100usize);
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&decompressed).ok()?;
        let recompressed = encoder.finish().ok()?;

        Some(self.replace_chunk_payload(data, idat, &recompressed))
    }

    fn replace_chunk_payload(&mut self, data: &[u8], chunk: &Chunk, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        out.extend_from_slice(&data[..chunk.start]);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&chunk.kind);
        out.extend_from_slice(payload);
        let crc = crc32fast::hash(&[&chunk.kind[..], payload].concat());
        out.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(&data[chunk.end..]);
        self.invalidate_cache();
        out
    }

    /// Synthesizes a well-formed unknown chunk right before IEND.
    fn inject_chunk(&mut self, data: &[u8], chunks: &[Chunk]) -> Option<Vec<u8>> {
        let iend = chunks.iter().find(|chunk| &chunk.kind == b"IEND")?;
        let kind: &[u8; 4] = [b"eXtr", b"fUzz", b"tEst", b"nOis"]
            .choose(&mut self.rng)
            .copied()?;
        let length = self.rng.random_range(0..=100usize);
        let payload: Vec<u8> = (0..length).map(|_| self.rng.random::<u8>()).collect();
        let crc = crc32fast::hash(&[&kind[..], &payload].concat());

        let mut out = Vec::with_capacity(data.len() + length + 12);
        out.extend_from_slice(&data[..iend.start]);
        out.extend_from_slice(&(length as u32).to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(&payload);
        out.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(&data[iend.start..]);
        self.invalidate_cache();
        Some(out)
    }

    /// Raw bit/byte corruption inside the zlib stream, without fixing the
    /// compression up afterwards.
    fn corrupt_zlib(&mut self, data: &[u8], chunks: &[Chunk]) -> Option<Vec<u8>> {
        let idats: Vec<&Chunk> = chunks
            .iter()
            .filter(|chunk| &chunk.kind == b"IDAT" && chunk.payload().len() >= 4)
            .collect();
        let idat = idats.choose(&mut self.rng)?;
        let payload = idat.payload();
        let mut out = data.to_vec();
        for _ in 0..self.rng.random_range(1..=5usize) {
            let index = self.rng.random_range(payload.clone());
            if self.safe_mode || self.rng.random_bool(0.7) {
                out[index] ^= 1 << self.rng.random_range(0..8u32);
            } else {
                out[index] = self.rng.random::<u8>();
            }
        }
        update_chunk_crc(&mut out, idat);
        Some(out)
    }
}

/// Recomputes the CRC of the chunk at `chunk.start`, trusting its length
/// field as currently written.
fn update_chunk_crc(data: &mut [u8], chunk: &Chunk) {
    let payload = chunk.payload();
    if payload.end > data.len() {
        return;
    }
    let crc = crc32fast::hash(&data[chunk.start + 4..payload.end]);
    data[payload.end..payload.end + 4].copy_from_slice(&crc.to_be_bytes());
}

fn parse_chunks(data: &[u8]) -> Option<Vec<Chunk>> {
    if !data.starts_with(PNG_SIGNATURE) {
        return None;
    }
    let mut chunks = Vec::new();
    let mut offset = PNG_SIGNATURE.len();
    while offset + 8 <= data.len() {
        let length =
            u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
                as usize;
        let Some(kind) = data.get(offset + 4..offset + 8) else {
            break;
        };
        let end = offset + 8 + length + 4;
        if end > data.len() {
            break;
        }
        chunks.push(Chunk {
            start: offset,
            end,
            kind: [kind[0], kind[1], kind[2], kind[3]],
        });
        offset = end;
    }
    Some(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(payload);
        let crc = crc32fast::hash(&[&kind[..], payload].concat());
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    /// Minimal PNG: signature, IHDR, a compressed IDAT, a tEXt chunk, IEND.
    fn minimal_png() -> Vec<u8> {
        let mut png = PNG_SIGNATURE.to_vec();
        let mut ihdr = Vec::new();
        ihdr.extend_from_slice(&1u32.to_be_bytes()); // width
        ihdr.extend_from_slice(&1u32.to_be_bytes()); // height
        ihdr.extend_from_slice(&[8, 0, 0, 0, 0]); // depth, color, comp, filter, interlace
        png.extend_from_slice(&chunk(b"IHDR", &ihdr));

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[0u8, 0x7f]).unwrap(); // filter byte + one pixel
        let idat = encoder.finish().unwrap();
        png.extend_from_slice(&chunk(b"IDAT", &idat));

        png.extend_from_slice(&chunk(b"tEXt", b"comment\0hi"));
        png.extend_from_slice(&chunk(b"IEND", b""));
        png
    }

    fn verify_crcs(data: &[u8]) -> bool {
        let Some(chunks) = parse_chunks(data) else {
            return false;
        };
        chunks.iter().all(|chunk| {
            let payload = chunk.payload();
            let expected = crc32fast::hash(&data[chunk.start + 4..payload.end]);
            data[payload.end..payload.end + 4] == expected.to_be_bytes()
        })
    }

    #[test]
    fn minimal_png_parses_with_valid_crcs() {
        let png = minimal_png();
        let chunks = parse_chunks(&png).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(&chunks[0].kind, b"IHDR");
        assert_eq!(&chunks[3].kind, b"IEND");
        assert!(verify_crcs(&png));
    }

    #[test]
    fn non_png_falls_back_to_one_perturbation() {
        let mut mutator = PngMutator::new(1);
        let variants = mutator.mutate(b"definitely not a png");
        assert_eq!(variants.len(), 1);
    }

    #[test]
    fn safe_mode_preserves_the_signature_in_most_variants() {
        let mut mutator = PngMutator::new(2);
        let png = minimal_png();
        let mut preserved = 0usize;
        let mut total = 0usize;
        while total < 100 {
            for variant in mutator.mutate(&png) {
                if variant.starts_with(PNG_SIGNATURE) {
                    preserved += 1;
                }
                total += 1;
                if total == 100 {
                    break;
                }
            }
        }
        assert!(preserved >= 80, "only {preserved}/100 kept the signature");
    }

    #[test]
    fn ihdr_and_iend_survive_safe_mode_structure_edits() {
        let mut mutator = PngMutator::new(3);
        let png = minimal_png();
        for _ in 0..20 {
            for variant in mutator.mutate(&png) {
                if let Some(chunks) = parse_chunks(&variant) {
                    // Deletion is disabled in safe mode, so the critical
                    // chunks must still be present whenever the variant
                    // parses at all.
                    let kinds: Vec<&[u8; 4]> =
                        chunks.iter().map(|chunk| &chunk.kind).collect();
                    if !chunks.is_empty() {
                        assert!(kinds.contains(&b"IHDR") || !variant.starts_with(PNG_SIGNATURE));
                    }
                }
            }
        }
    }

    #[test]
    fn payload_flip_keeps_crc_consistent() {
        let mut mutator = PngMutator::new(4);
        let png = minimal_png();
        let chunks = parse_chunks(&png).unwrap();
        let variant = mutator.flip_payload_bytes(&png, &chunks).unwrap();
        assert!(verify_crcs(&variant));
    }

    #[test]
    fn idat_recompression_round_trips() {
        let mut mutator = PngMutator::new(5);
        let png = minimal_png();
        let chunks = parse_chunks(&png).unwrap();
        let variant = mutator.mutate_idat_recompress(&png, &chunks).unwrap();
        assert!(verify_crcs(&variant));
        let new_chunks = parse_chunks(&variant).unwrap();
        let idat = new_chunks
            .iter()
            .find(|chunk| &chunk.kind == b"IDAT")
            .unwrap();
        let mut decompressed = Vec::new();
        ZlibDecoder::new(&variant[idat.payload()])
            .read_to_end(&mut decompressed)
            .unwrap();
        assert_eq!(decompressed.len(), 2);
    }

    #[test]
    fn injected_chunk_lands_before_iend() {
        let mut mutator = PngMutator::new(6);
        let png = minimal_png();
        let chunks = parse_chunks(&png).unwrap();
        let variant = mutator.inject_chunk(&png, &chunks).unwrap();
        let new_chunks = parse_chunks(&variant).unwrap();
        assert_eq!(new_chunks.len(), 5);
        assert_eq!(&new_chunks[4].kind, b"IEND");
        assert!(verify_crcs(&variant));
    }

    #[test]
    fn duplicate_never_copies_critical_chunks() {
        let mut mutator = PngMutator::new(7);
        let png = minimal_png();
        let chunks = parse_chunks(&png).unwrap();
        for _ in 0..20 {
            if let Some(variant) = mutator.duplicate_chunk(&png, &chunks) {
                let new_chunks = parse_chunks(&variant).unwrap();
                let ihdr_count = new_chunks
                    .iter()
                    .filter(|chunk| &chunk.kind == b"IHDR")
                    .count();
                let iend_count = new_chunks
                    .iter()
                    .filter(|chunk| &chunk.kind == b"IEND")
                    .count();
                assert_eq!(ihdr_count, 1);
                assert_eq!(iend_count, 1);
            }
        }
    }

    #[test]
    fn chunk_cache_is_bounded() {
        let mut mutator = PngMutator::new(8);
        let base = minimal_png();
        for round in 0..40usize {
            let mut input = base.clone();
            input.push(round as u8); // trailing garbage; still parses
            mutator.parse_cached(&input);
        }
        assert!(mutator.cache.len() <= CHUNK_CACHE_CAPACITY);
    }
}
