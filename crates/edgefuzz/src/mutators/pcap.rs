//! PCAP mutations over the classic libpcap capture format: a 24-byte
//! global header followed by 16-byte record headers and packet payloads.
//!
//! Structural edits keep `incl_len` consistent with the payload they carry;
//! the one strategy that corrupts it does so deliberately.

use std::sync::Arc;

use rand::{Rng, SeedableRng, rngs::SmallRng, seq::IndexedRandom};

use super::fallback_perturbation;

const DEFAULT_VARIANTS: usize = 16;
const GLOBAL_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

/// One packet record: header offset plus payload span.
#[derive(Debug, Clone, Copy)]
struct Packet {
    start: usize,
    data_start: usize,
    incl_len: usize,
}

impl Packet {
    fn end(self) -> usize {
        self.data_start + self.incl_len
    }
}

#[derive(Debug)]
struct PcapLayout {
    endian: Endian,
    packets: Vec<Packet>,
}

#[derive(Debug)]
pub struct PcapMutator {
    rng: SmallRng,
    variants: usize,
    corpus: Vec<Arc<[u8]>>,
}

impl PcapMutator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            variants: DEFAULT_VARIANTS,
            corpus: Vec::new(),
        }
    }

    /// Donor captures for the packet-splice strategy.
    pub fn set_corpus(&mut self, corpus: &[Arc<[u8]>]) {
        self.corpus = corpus.to_vec();
    }

    pub fn mutate(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let Some(layout) = parse_pcap(data) else {
            return vec![fallback_perturbation(&mut self.rng, data)];
        };

        let mut variants = Vec::with_capacity(self.variants);
        for _ in 0..self.variants {
            let variant = match self.rng.random_range(0..6u8) {
                0 => self.drop_packet(data, &layout),
                1 => self.duplicate_packet(data, &layout),
                2 => self.swap_adjacent(data, &layout),
                3 => self.mutate_payload(data, &layout),
                4 => self.corrupt_incl_len(data, &layout),
                _ => self.splice_donor_packet(data, &layout),
            };
            match variant {
                Some(out) if out != data => variants.push(out),
                _ => variants.push(fallback_perturbation(&mut self.rng, data)),
            }
        }
        variants
    }

    fn pick_packet(&mut self, layout: &PcapLayout) -> Option<Packet> {
        layout.packets.choose(&mut self.rng).copied()
    }

    fn drop_packet(&mut self, data: &[u8], layout: &PcapLayout) -> Option<Vec<u8>> {
        let packet = self.pick_packet(layout)?;
        let mut out = Vec::with_capacity(data.len());
        out.extend_from_slice(&data[..packet.start]);
        out.extend_from_slice(&data[packet.end()..]);
        Some(out)
    }

    fn duplicate_packet(&mut self, data: &[u8], layout: &PcapLayout) -> Option<Vec<u8>> {
        let packet = self.pick_packet(layout)?;
        let record = &data[packet.start..packet.end()];
        let mut out = Vec::with_capacity(data.len() + record.len());
        out.extend_from_slice(&data[..packet.end()]);
        out.extend_from_slice(record);
        out.extend_from_slice(&data[packet.end()..]);
        Some(out)
    }

    fn swap_adjacent(&mut self, data: &[u8], layout: &PcapLayout) -> Option<Vec<u8>> {
        if layout.packets.len() < 2 {
            return None;
        }
        let index = self.rng.random_range(0..layout.packets.len() - 1);
        let (first, second) = (layout.packets[index], layout.packets[index + 1]);
        let mut out = Vec::with_capacity(data.len());
        out.extend_from_slice(&data[..first.start]);
        out.extend_from_slice(&data[second.start..second.end()]);
        out.extend_from_slice(&data[first.start..first.end()]);
        out.extend_from_slice(&data[second.end()..]);
        Some(out)
    }

    fn mutate_payload(&mut self, data: &[u8], layout: &PcapLayout) -> Option<Vec<u8>> {
        let packet = self.pick_packet(layout)?;
        if packet.incl_len == 0 {
            return None;
        }
        let mut out = data.to_vec();
        let edits = (packet.incl_len / 50).max(1);
        for _ in 0..self.rng.random_range(1..=edits) {
            let index = self.rng.random_range(packet.data_start..packet.end());
            out[index] ^= self.rng.random_range(1..=255u8);
        }
        Some(out)
    }

    /// The deliberate inconsistency strategy: the stored length no longer
    /// matches the payload.
    fn corrupt_incl_len(&mut self, data: &[u8], layout: &PcapLayout) -> Option<Vec<u8>> {
        let packet = self.pick_packet(layout)?;
        let mut out = data.to_vec();
        let new_len: u32 = self.rng.random_range(0..=65_535);
        write_u32(&mut out, packet.start + 8, layout.endian, new_len);
        Some(out)
    }

    /// Splices a whole record from a donor capture, rewriting its
    /// `incl_len` to match the payload actually copied.
    fn splice_donor_packet(&mut self, data: &[u8], layout: &PcapLayout) -> Option<Vec<u8>> {
        let donor = self.corpus.choose(&mut self.rng)?.clone();
        let donor_layout = parse_pcap(&donor)?;
        let donor_packet = donor_layout.packets.choose(&mut self.rng).copied()?;

        let mut record = donor[donor_packet.start..donor_packet.end()].to_vec();
        // Normalize the header length field to this file's endianness.
        write_u32(&mut record, 8, layout.endian, donor_packet.incl_len as u32);
        write_u32(&mut record, 12, layout.endian, donor_packet.incl_len as u32);

        let insert_at = layout
            .packets
            .choose(&mut self.rng)
            .map_or(data.len(), |packet| packet.end());
        let mut out = Vec::with_capacity(data.len() + record.len());
        out.extend_from_slice(&data[..insert_at]);
        out.extend_from_slice(&record);
        out.extend_from_slice(&data[insert_at..]);
        Some(out)
    }
}

fn read_u32(data: &[u8], offset: usize, endian: Endian) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    let bytes = [bytes[0], bytes[1], bytes[2], bytes[3]];
    Some(match endian {
        Endian::Little => u32::from_le_bytes(bytes),
        Endian::Big => u32::from_be_bytes(bytes),
    })
}

fn write_u32(data: &mut [u8], offset: usize, endian: Endian, value: u32) {
    if let Some(slot) = data.get_mut(offset..offset + 4) {
        let bytes = match endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        slot.copy_from_slice(&bytes);
    }
}

/// Parses the global header (magic selects endianness) and walks the
/// packet records; a record whose length runs past the file ends the walk.
fn parse_pcap(data: &[u8]) -> Option<PcapLayout> {
    if data.len() < GLOBAL_HEADER_LEN {
        return None;
    }
    let magic_le = read_u32(data, 0, Endian::Little)?;
    let magic_be = read_u32(data, 0, Endian::Big)?;
    let endian = if magic_le == 0xa1b2_c3d4 || magic_le == 0xa1b2_3c4d {
        Endian::Little
    } else if magic_be == 0xa1b2_c3d4 || magic_be == 0xa1b2_3c4d {
        Endian::Big
    } else {
        return None;
    };

    let mut packets = Vec::new();
    let mut offset = GLOBAL_HEADER_LEN;
    while offset + RECORD_HEADER_LEN <= data.len() {
        let incl_len = read_u32(data, offset + 8, endian)? as usize;
        let data_start = offset + RECORD_HEADER_LEN;
        let data_end = data_start.checked_add(incl_len)?;
        if data_end > data.len() {
            break;
        }
        packets.push(Packet {
            start: offset,
            data_start,
            incl_len,
        });
        offset = data_end;
    }

    Some(PcapLayout { endian, packets })
}
