//! JPEG mutations over FF-prefixed marker segments.
//!
//! Three layered stages, mirroring the classic deterministic → havoc →
//! format-aware progression: plain bit/byte/arithmetic edits, random
//! destructive edits, and segment-level operations that understand APP
//! headers, quantization and Huffman tables, and the entropy-coded scan.

use rand::{Rng, SeedableRng, rngs::SmallRng, seq::IndexedRandom};

use super::fallback_perturbation;

const DEFAULT_VARIANTS: usize = 16;

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const DQT: u8 = 0xDB;
const DHT: u8 = 0xC4;

/// One marker segment: `(marker, start, end)` where `start` points at the
/// 0xFF byte and `end` is one past the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    marker: u8,
    start: usize,
    end: usize,
}

impl Segment {
    fn is_bare(self) -> bool {
        self.marker == SOI || self.marker == EOI || (0xD0..=0xD7).contains(&self.marker)
    }

    fn is_app(self) -> bool {
        (0xE0..=0xEF).contains(&self.marker)
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Deterministic,
    Havoc,
    SegmentAware,
}

#[derive(Debug)]
pub struct JpegMutator {
    rng: SmallRng,
    variants: usize,
}

impl JpegMutator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            variants: DEFAULT_VARIANTS,
        }
    }

    pub fn mutate(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let segments = parse_segments(data);
        if segments.is_empty() || !data.starts_with(&[0xFF, SOI]) {
            return vec![fallback_perturbation(&mut self.rng, data)];
        }

        let mut variants = Vec::with_capacity(self.variants);
        for _ in 0..self.variants {
            let stage = match self.rng.random_range(0..10u8) {
                0..=3 => Stage::Deterministic,
                4..=6 => Stage::Havoc,
                _ => Stage::SegmentAware,
            };
            let variant = match stage {
                Stage::Deterministic => Some(self.deterministic(data)),
                Stage::Havoc => Some(self.havoc(data)),
                Stage::SegmentAware => self.segment_aware(data, &segments),
            };
            match variant {
                Some(out) if out != data => variants.push(out),
                _ => variants.push(fallback_perturbation(&mut self.rng, data)),
            }
        }
        variants
    }

    /// Bit/byte flips, big-endian arithmetic, and interesting values.
    fn deterministic(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        if out.is_empty() {
            return out;
        }
        let pos = self.rng.random_range(0..out.len());
        match self.rng.random_range(0..9u8) {
            0 => out[pos] ^= 1 << self.rng.random_range(0..8u32),
            1 => {
                for _ in 0..2 {
                    out[pos] ^= 1 << self.rng.random_range(0..8u32);
                }
            }
            2 => {
                for _ in 0..4 {
                    out[pos] ^= 1 << self.rng.random_range(0..8u32);
                }
            }
            3 => out[pos] ^= 0xFF,
            4 => {
                let delta = *[-35i16, -1, 1, 35].choose(&mut self.rng).unwrap_or(&1);
                out[pos] = (i16::from(out[pos]) + delta) as u8;
            }
            5 => {
                // 16-bit big-endian arithmetic.
                if pos + 1 < out.len() {
                    let value = u16::from_be_bytes([out[pos], out[pos + 1]]);
                    let delta = *[-255i32, -1, 1, 2, 8, 64, 255]
                        .choose(&mut self.rng)
                        .unwrap_or(&1);
                    let updated = (i32::from(value) + delta) as u16;
                    out[pos..pos + 2].copy_from_slice(&updated.to_be_bytes());
                }
            }
            6 => {
                // 32-bit big-endian arithmetic.
                if pos + 3 < out.len() {
                    let value = u32::from_be_bytes([
                        out[pos],
                        out[pos + 1],
                        out[pos + 2],
                        out[pos + 3],
                    ]);
                    let delta = *[-4096i64, -1, 1, 16, 256, 4096]
                        .choose(&mut self.rng)
                        .unwrap_or(&1);
                    let updated = (i64::from(value) + delta) as u32;
                    out[pos..pos + 4].copy_from_slice(&updated.to_be_bytes());
                }
            }
            7 => out[pos] = *[0u8, 1, 0x7f, 0x80, 0xff].choose(&mut self.rng).unwrap_or(&0),
            _ => {
                if pos + 1 < out.len() {
                    let value = *[0u16, 1, 0x7fff, 0x8000, 0xffff]
                        .choose(&mut self.rng)
                        .unwrap_or(&0);
                    out[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
                }
            }
        }
        out
    }

    /// Random destructive edits: randomize, delete, clone, overwrite.
    fn havoc(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        for _ in 0..self.rng.random_range(1..=4usize) {
            if out.len() < 2 {
                break;
            }
            match self.rng.random_range(0..5u8) {
                0 => {
                    let pos = self.rng.random_range(0..out.len());
                    out[pos] = self.rng.random::<u8>();
                }
                1 => {
                    let pos = self.rng.random_range(0..out.len());
                    out[pos] ^= 1 << self.rng.random_range(0..8u32);
                }
                2 => {
                    let len = self.rng.random_range(1..=(out.len() / 2).clamp(1, 64));
                    let pos = self.rng.random_range(0..=out.len() - len);
                    out.drain(pos..pos + len);
                }
                3 => {
                    let len = self.rng.random_range(1..=(out.len() / 2).clamp(1, 64));
                    let src = self.rng.random_range(0..=out.len() - len);
                    let block: Vec<u8> = out[src..src + len].to_vec();
                    let dst = self.rng.random_range(0..=out.len());
                    out.splice(dst..dst, block);
                }
                _ => {
                    let src = self.rng.random_range(0..out.len());
                    let dst = self.rng.random_range(0..out.len());
                    out[dst] = out[src];
                }
            }
        }
        out
    }

    fn segment_aware(&mut self, data: &[u8], segments: &[Segment]) -> Option<Vec<u8>> {
        match self.rng.random_range(0..8u8) {
            0 => self.tweak_app_header(data, segments),
            1 => self.perturb_table(data, segments, DQT),
            2 => self.perturb_table(data, segments, DHT),
            3 => self.mutate_scan_data(data, segments),
            4 => self.corrupt_length(data, segments),
            5 => self.swap_segments(data, segments),
            6 => self.duplicate_app(data, segments),
            _ => self.inject_rst(data, segments),
        }
    }

    /// Small edits inside an APPn payload, past the marker and length.
    fn tweak_app_header(&mut self, data: &[u8], segments: &[Segment]) -> Option<Vec<u8>> {
        let apps: Vec<&Segment> = segments.iter().filter(|s| s.is_app()).collect();
        let app = apps.choose(&mut self.rng)?;
        if app.end - app.start <= 4 {
            return None;
        }
        let mut out = data.to_vec();
        let pos = self.rng.random_range(app.start + 4..app.end);
        out[pos] = self.rng.random::<u8>();
        Some(out)
    }

    /// Byte edits inside a DQT or DHT segment payload.
    fn perturb_table(&mut self, data: &[u8], segments: &[Segment], marker: u8) -> Option<Vec<u8>> {
        let tables: Vec<&Segment> = segments
            .iter()
            .filter(|s| s.marker == marker && s.end - s.start > 4)
            .collect();
        let table = tables.choose(&mut self.rng)?;
        let mut out = data.to_vec();
        for _ in 0..self.rng.random_range(1..=4usize) {
            let pos = self.rng.random_range(table.start + 4..table.end);
            out[pos] = out[pos].wrapping_add(self.rng.random_range(1..=255u8));
        }
        Some(out)
    }

    /// Flips bytes in the entropy-coded data between SOS and EOI.
    fn mutate_scan_data(&mut self, data: &[u8], segments: &[Segment]) -> Option<Vec<u8>> {
        let (scan_start, scan_end) = scan_range(data, segments)?;
        if scan_end <= scan_start {
            return None;
        }
        let mut out = data.to_vec();
        for _ in 0..self.rng.random_range(1..=8usize) {
            let pos = self.rng.random_range(scan_start..scan_end);
            out[pos] ^= self.rng.random_range(1..=255u8);
        }
        Some(out)
    }

    fn corrupt_length(&mut self, data: &[u8], segments: &[Segment]) -> Option<Vec<u8>> {
        let sized: Vec<&Segment> = segments
            .iter()
            .filter(|s| !s.is_bare() && s.end - s.start >= 4)
            .collect();
        let segment = sized.choose(&mut self.rng)?;
        let mut out = data.to_vec();
        let new_length = self
            .rng
            .random_range(2..=(segment.end - segment.start + 50) as u16);
        out[segment.start + 2..segment.start + 4].copy_from_slice(&new_length.to_be_bytes());
        Some(out)
    }

    /// Swaps two adjacent non-critical segments.
    fn swap_segments(&mut self, data: &[u8], segments: &[Segment]) -> Option<Vec<u8>> {
        let swappable: Vec<usize> = segments
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_bare() && s.marker != SOS)
            .map(|(index, _)| index)
            .collect();
        let adjacent: Vec<&[usize]> = swappable
            .windows(2)
            .filter(|pair| pair[1] == pair[0] + 1)
            .collect();
        let pair = adjacent.choose(&mut self.rng)?;
        let (first, second) = (segments[pair[0]], segments[pair[1]]);
        let mut out = Vec::with_capacity(data.len());
        out.extend_from_slice(&data[..first.start]);
        out.extend_from_slice(&data[second.start..second.end]);
        out.extend_from_slice(&data[first.start..first.end]);
        out.extend_from_slice(&data[second.end..]);
        Some(out)
    }

    fn duplicate_app(&mut self, data: &[u8], segments: &[Segment]) -> Option<Vec<u8>> {
        let apps: Vec<&Segment> = segments.iter().filter(|s| s.is_app()).collect();
        let app = apps.choose(&mut self.rng)?;
        let mut out = Vec::with_capacity(data.len() + app.end - app.start);
        out.extend_from_slice(&data[..app.end]);
        out.extend_from_slice(&data[app.start..app.end]);
        out.extend_from_slice(&data[app.end..]);
        Some(out)
    }

    /// Drops an RSTn marker into the scan data.
    fn inject_rst(&mut self, data: &[u8], segments: &[Segment]) -> Option<Vec<u8>> {
        let (scan_start, scan_end) = scan_range(data, segments)?;
        if scan_end <= scan_start {
            return None;
        }
        let pos = self.rng.random_range(scan_start..=scan_end);
        let marker = [0xFF, 0xD0 + self.rng.random_range(0..8u8)];
        let mut out = data.to_vec();
        out.splice(pos..pos, marker);
        Some(out)
    }
}

/// The entropy-coded region: after the SOS header up to the final EOI.
fn scan_range(data: &[u8], segments: &[Segment]) -> Option<(usize, usize)> {
    let sos = segments.iter().find(|s| s.marker == SOS)?;
    let eoi_start = segments
        .iter()
        .rev()
        .find(|s| s.marker == EOI)
        .map_or(data.len(), |s| s.start);
    Some((sos.end, eoi_start))
}

/// Lightweight segment walk. Markers without a length field (SOI, EOI,
/// RSTn) span just the two marker bytes; everything else consumes its
/// big-endian length. Lengths running past the end are clipped.
fn parse_segments(data: &[u8]) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut index = 0;
    let len = data.len();
    while index + 1 < len {
        if data[index] != 0xFF {
            index += 1;
            continue;
        }
        let marker = data[index + 1];
        if marker == SOI || marker == EOI || (0xD0..=0xD7).contains(&marker) {
            segments.push(Segment {
                marker,
                start: index,
                end: index + 2,
            });
            index += 2;
            continue;
        }
        if index + 3 >= len {
            break;
        }
        let length = usize::from(u16::from_be_bytes([data[index + 2], data[index + 3]]));
        let end = (index + 2 + length).min(len);
        segments.push(Segment {
            marker,
            start: index,
            end,
        });
        index = end;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    /// SOI + APP0 (JFIF) + minimal DQT + SOS stub + scan bytes + EOI.
    fn minimal_jpeg() -> Vec<u8> {
        let mut jpeg = vec![0xFF, SOI];
        // APP0, length 16.
        jpeg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        jpeg.extend_from_slice(b"JFIF\0");
        jpeg.extend_from_slice(&[0x01, 0x02, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00]);
        // DQT, length 5 (truncated table is fine for the parser).
        jpeg.extend_from_slice(&[0xFF, DQT, 0x00, 0x05, 0x00, 0x10, 0x10]);
        // SOS, length 3.
        jpeg.extend_from_slice(&[0xFF, SOS, 0x00, 0x03, 0x01]);
        // Entropy-coded bytes.
        jpeg.extend_from_slice(&[0x12, 0x34, 0x56, 0x78]);
        jpeg.extend_from_slice(&[0xFF, EOI]);
        jpeg
    }

    #[test]
    fn parses_the_minimal_jpeg() {
        let jpeg = minimal_jpeg();
        let segments = parse_segments(&jpeg);
        assert_eq!(segments[0].marker, SOI);
        assert!(segments.iter().any(|s| s.is_app()));
        assert!(segments.iter().any(|s| s.marker == DQT));
        assert!(segments.iter().any(|s| s.marker == SOS));
        assert_eq!(segments.last().unwrap().marker, EOI);
    }

    #[test]
    fn scan_range_sits_between_sos_and_eoi() {
        let jpeg = minimal_jpeg();
        let segments = parse_segments(&jpeg);
        let (start, end) = scan_range(&jpeg, &segments).unwrap();
        assert_eq!(&jpeg[start..end], &[0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn non_jpeg_falls_back_to_one_perturbation() {
        let mut mutator = JpegMutator::new(1);
        let variants = mutator.mutate(b"GIF89a not a jpeg");
        assert_eq!(variants.len(), 1);
    }

    #[test]
    fn jpeg_input_produces_a_full_batch() {
        let mut mutator = JpegMutator::new(2);
        let jpeg = minimal_jpeg();
        let variants = mutator.mutate(&jpeg);
        assert_eq!(variants.len(), DEFAULT_VARIANTS);
        assert!(variants.iter().any(|variant| variant != &jpeg));
    }

    #[test]
    fn rst_injection_stays_in_scan_data() {
        let mut mutator = JpegMutator::new(3);
        let jpeg = minimal_jpeg();
        let segments = parse_segments(&jpeg);
        let variant = mutator.inject_rst(&jpeg, &segments).unwrap();
        assert_eq!(variant.len(), jpeg.len() + 2);
        // SOI untouched.
        assert_eq!(&variant[..2], &[0xFF, SOI]);
        let markers: Vec<u8> = parse_segments(&variant)
            .iter()
            .map(|s| s.marker)
            .collect();
        assert!(markers.iter().any(|m| (0xD0..=0xD7).contains(m)));
    }

    #[test]
    fn duplicate_app_doubles_the_segment() {
        let mut mutator = JpegMutator::new(4);
        let jpeg = minimal_jpeg();
        let segments = parse_segments(&jpeg);
        let variant = mutator.duplicate_app(&jpeg, &segments).unwrap();
        let app_count = parse_segments(&variant)
            .iter()
            .filter(|s| s.is_app())
            .count();
        assert_eq!(app_count, 2);
    }

    #[test]
    fn scan_mutation_leaves_headers_alone() {
        let mut mutator = JpegMutator::new(5);
        let jpeg = minimal_jpeg();
        let segments = parse_segments(&jpeg);
        let (scan_start, _) = scan_range(&jpeg, &segments).unwrap();
        let variant = mutator.mutate_scan_data(&jpeg, &segments).unwrap();
        assert_eq!(&variant[..scan_start], &jpeg[..scan_start]);
    }
}
