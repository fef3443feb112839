//! Structural ELF mutations.
//!
//! The parser is deliberately shallow: header, section table, and program
//! table offsets are enough to aim edits at the places an ELF consumer
//! actually inspects. Parses are memoized in a bounded LRU keyed by the
//! input hash, since the campaign tends to re-mutate the same candidates.

use std::sync::Arc;

use indexmap::IndexMap;
use rand::{Rng, SeedableRng, rngs::SmallRng, seq::IndexedRandom};
use sha1::{Digest, Sha1};

use super::fallback_perturbation;
use crate::utils;

const PARSE_CACHE_CAPACITY: usize = 1000;
const DEFAULT_VARIANTS: usize = 16;

/// Names an ELF consumer plausibly looks up.
const COMMON_SYMBOLS: [&str; 8] = [
    "main", "_start", "init", "fini", "exit", "printf", "malloc", "free",
];

/// Tags a dynamic-section walker switches on.
const COMMON_DYN_TAGS: [u64; 8] = [
    1,  // DT_NEEDED
    5,  // DT_STRTAB
    6,  // DT_SYMTAB
    10, // DT_STRSZ
    12, // DT_INIT
    13, // DT_FINI
    21, // DT_DEBUG
    25, // DT_INIT_ARRAY
];

const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_DYNAMIC: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone)]
struct Section {
    header_offset: usize,
    sh_type: u32,
    offset: usize,
    size: usize,
}

#[derive(Debug, Clone)]
struct ProgramHeader {
    header_offset: usize,
}

#[derive(Debug, Clone)]
struct ElfLayout {
    is_64: bool,
    endian: Endian,
    sections: Vec<Section>,
    program_headers: Vec<ProgramHeader>,
}

#[derive(Debug, Clone, Copy)]
enum Strategy {
    HeaderFields,
    StringTable,
    SymbolNames,
    DynamicTags,
    SectionFlips,
    AggressiveBlock,
    ProgramHeader,
    AsciiRuns,
}

const STRATEGY_TABLE: [(Strategy, f64); 8] = [
    (Strategy::HeaderFields, 12.0),
    (Strategy::StringTable, 14.0),
    (Strategy::SymbolNames, 8.0),
    (Strategy::DynamicTags, 8.0),
    (Strategy::SectionFlips, 16.0),
    (Strategy::AggressiveBlock, 6.0),
    (Strategy::ProgramHeader, 10.0),
    (Strategy::AsciiRuns, 12.0),
];

#[derive(Debug)]
pub struct ElfMutator {
    rng: SmallRng,
    variants: usize,
    /// Scales the number of byte flips per section edit.
    strength: f64,
    cache: IndexMap<[u8; 20], Arc<ElfLayout>>,
}

impl ElfMutator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            variants: DEFAULT_VARIANTS,
            strength: 1.0,
            cache: IndexMap::new(),
        }
    }

    pub fn apply_aggression(&mut self, scale: f64) {
        self.strength = scale.max(1.0);
    }

    pub fn clear_aggression(&mut self) {
        self.strength = 1.0;
    }

    pub fn mutate(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let Some(layout) = self.parse_cached(data) else {
            return vec![fallback_perturbation(&mut self.rng, data)];
        };

        let weights: Vec<f64> = STRATEGY_TABLE.iter().map(|(_, weight)| *weight).collect();
        let mut variants = Vec::with_capacity(self.variants);
        for _ in 0..self.variants {
            let strategy = STRATEGY_TABLE[utils::weighted_index(&mut self.rng, &weights)].0;
            let mut out = data.to_vec();
            let changed = match strategy {
                Strategy::HeaderFields => self.perturb_header(&mut out, &layout),
                Strategy::StringTable => self.mutate_string_table(&mut out, &layout),
                Strategy::SymbolNames => self.perturb_symbol_names(&mut out, &layout),
                Strategy::DynamicTags => self.perturb_dynamic_tags(&mut out, &layout),
                Strategy::SectionFlips => self.flip_section_bytes(&mut out, &layout),
                Strategy::AggressiveBlock => self.aggressive_block(&mut out, &layout),
                Strategy::ProgramHeader => self.perturb_program_header(&mut out, &layout),
                Strategy::AsciiRuns => self.rewrite_ascii_run(&mut out),
            };
            if !changed {
                out = fallback_perturbation(&mut self.rng, data);
            }
            variants.push(out);
        }
        variants
    }

    fn parse_cached(&mut self, data: &[u8]) -> Option<Arc<ElfLayout>> {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let key: [u8; 20] = hasher.finalize().into();

        if let Some(index) = self.cache.get_index_of(&key) {
            let last = self.cache.len() - 1;
            self.cache.move_index(index, last);
            return Some(Arc::clone(&self.cache[&key]));
        }

        let layout = Arc::new(parse_layout(data)?);
        if self.cache.len() >= PARSE_CACHE_CAPACITY {
            self.cache.shift_remove_index(0);
        }
        self.cache.insert(key, Arc::clone(&layout));
        Some(layout)
    }

    /// Nudges e_entry, e_type, or the class/data ident bytes.
    fn perturb_header(&mut self, out: &mut [u8], layout: &ElfLayout) -> bool {
        match self.rng.random_range(0..3u8) {
            0 => {
                // e_entry at offset 24, width by class.
                let width = if layout.is_64 { 8 } else { 4 };
                let delta = *[1i64, -1, 16, -16, 0x1000, -0x1000]
                    .choose(&mut self.rng)
                    .unwrap_or(&1);
                let delta = if self.rng.random_bool(0.3) {
                    self.rng.random_range(i64::from(i32::MIN)..=i64::from(i32::MAX))
                } else {
                    delta
                };
                add_word(out, 24, width, layout.endian, delta)
            }
            1 => {
                // e_type at offset 16.
                add_word(out, 16, 2, layout.endian, i64::from(self.rng.random_range(1..=5u8)))
            }
            _ => {
                // e_ident[EI_CLASS] or e_ident[EI_DATA].
                let index = if self.rng.random_bool(0.5) { 4 } else { 5 };
                if index < out.len() {
                    out[index] = self.rng.random_range(0..=3u8);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Rewrites one NUL-terminated entry inside a string-table section.
    fn mutate_string_table(&mut self, out: &mut [u8], layout: &ElfLayout) -> bool {
        let tables: Vec<&Section> = layout
            .sections
            .iter()
            .filter(|section| section.sh_type == SHT_STRTAB)
            .collect();
        let Some(table) = tables.choose(&mut self.rng) else {
            return false;
        };
        let Some(range) = section_bytes(out, table) else {
            return false;
        };
        let strings = find_strings(&out[range.clone()], 2);
        let Some((start, len)) = strings.choose(&mut self.rng).copied() else {
            return false;
        };
        let absolute = range.start + start;
        match self.rng.random_range(0..5u8) {
            0 => {
                let symbol = COMMON_SYMBOLS.choose(&mut self.rng).unwrap_or(&"main");
                overwrite_string(&mut out[absolute..absolute + len], symbol.as_bytes());
            }
            1 => out[absolute..absolute + len].reverse(),
            2 => {
                // Truncate by planting an inner NUL.
                let cut = self.rng.random_range(0..len);
                out[absolute + cut] = 0;
            }
            3 => {
                // Version suffix over the tail.
                let suffix = format!("_v{}", self.rng.random_range(0..10u8));
                let tail = len.min(suffix.len());
                out[absolute + len - tail..absolute + len]
                    .copy_from_slice(&suffix.as_bytes()[..tail]);
            }
            _ => {
                // Swap with another entry of the same length, keeping the
                // table's offsets intact.
                let peers: Vec<(usize, usize)> = strings
                    .iter()
                    .filter(|(other_start, other_len)| {
                        *other_len == len && *other_start != start
                    })
                    .copied()
                    .collect();
                let Some((other_start, _)) = peers.choose(&mut self.rng).copied() else {
                    return false;
                };
                let other_absolute = range.start + other_start;
                for offset in 0..len {
                    out.swap(absolute + offset, other_absolute + offset);
                }
            }
        }
        true
    }

    /// Perturbs `st_name` indices inside a symbol table.
    fn perturb_symbol_names(&mut self, out: &mut [u8], layout: &ElfLayout) -> bool {
        let entry_size = if layout.is_64 { 24 } else { 16 };
        let tables: Vec<&Section> = layout
            .sections
            .iter()
            .filter(|section| section.sh_type == SHT_SYMTAB && section.size >= entry_size)
            .collect();
        let Some(table) = tables.choose(&mut self.rng) else {
            return false;
        };
        let Some(range) = section_bytes(out, table) else {
            return false;
        };
        let entries = (range.end - range.start) / entry_size;
        if entries == 0 {
            return false;
        }
        let entry = self.rng.random_range(0..entries);
        let offset = range.start + entry * entry_size;
        add_word(
            out,
            offset,
            4,
            layout.endian,
            i64::from(self.rng.random_range(-8..=8i8)),
        )
    }

    /// Steers dynamic-entry tags toward values walkers actually handle.
    fn perturb_dynamic_tags(&mut self, out: &mut [u8], layout: &ElfLayout) -> bool {
        let entry_size = if layout.is_64 { 16 } else { 8 };
        let word = entry_size / 2;
        let tables: Vec<&Section> = layout
            .sections
            .iter()
            .filter(|section| section.sh_type == SHT_DYNAMIC && section.size >= entry_size)
            .collect();
        let Some(table) = tables.choose(&mut self.rng) else {
            return false;
        };
        let Some(range) = section_bytes(out, table) else {
            return false;
        };
        let entries = (range.end - range.start) / entry_size;
        if entries == 0 {
            return false;
        }
        let entry = self.rng.random_range(0..entries);
        let offset = range.start + entry * entry_size;
        let tag = *COMMON_DYN_TAGS.choose(&mut self.rng).unwrap_or(&1);
        set_word(out, offset, word, layout.endian, tag)
    }

    /// Strength-scaled byte flips confined to one section.
    fn flip_section_bytes(&mut self, out: &mut [u8], layout: &ElfLayout) -> bool {
        let Some(section) = layout.sections.choose(&mut self.rng) else {
            return false;
        };
        let Some(range) = section_bytes(out, section) else {
            return false;
        };
        if range.is_empty() {
            return false;
        }
        let changes = ((1.0 + (range.len() / 64) as f64) * self.strength) as usize;
        for _ in 0..changes.clamp(1, 64) {
            let index = self.rng.random_range(range.clone());
            out[index] ^= 1 << self.rng.random_range(0..8u32);
        }
        true
    }

    /// Length-preserving block XOR / block swap / zero-fill within a section.
    fn aggressive_block(&mut self, out: &mut [u8], layout: &ElfLayout) -> bool {
        let Some(section) = layout.sections.choose(&mut self.rng) else {
            return false;
        };
        let Some(range) = section_bytes(out, section) else {
            return false;
        };
        if range.len() < 2 {
            return false;
        }
        let block_len = self.rng.random_range(1..=range.len().min(64));
        let start = self.rng.random_range(range.start..=range.end - block_len);
        match self.rng.random_range(0..3u8) {
            0 => {
                let key = self.rng.random_range(1..=255u8);
                for byte in &mut out[start..start + block_len] {
                    *byte ^= key;
                }
            }
            1 => {
                let other = self.rng.random_range(range.start..=range.end - block_len);
                for offset in 0..block_len {
                    out.swap(start + offset, other + offset);
                }
            }
            _ => out[start..start + block_len].fill(0),
        }
        true
    }

    /// Pokes bytes around `p_type` and `p_flags` in one program header.
    fn perturb_program_header(&mut self, out: &mut [u8], layout: &ElfLayout) -> bool {
        let Some(header) = layout.program_headers.choose(&mut self.rng) else {
            return false;
        };
        // p_type sits at +0 in both classes; p_flags at +4 (64-bit) or
        // +24 (32-bit).
        let flags_offset = if layout.is_64 { 4 } else { 24 };
        let field = if self.rng.random_bool(0.5) { 0 } else { flags_offset };
        add_word(
            out,
            header.header_offset + field,
            4,
            layout.endian,
            i64::from(self.rng.random_range(-4..=4i8)),
        )
    }

    /// Length-preserving rewrite of a printable ASCII run anywhere in the
    /// file.
    fn rewrite_ascii_run(&mut self, out: &mut [u8]) -> bool {
        let runs = find_strings(out, 3);
        let Some((start, len)) = runs.choose(&mut self.rng).copied() else {
            return false;
        };
        match self.rng.random_range(0..4u8) {
            0 => {
                let symbol = COMMON_SYMBOLS.choose(&mut self.rng).unwrap_or(&"main");
                overwrite_string(&mut out[start..start + len], symbol.as_bytes());
            }
            1 => out[start..start + len].reverse(),
            2 => {
                let suffix = format!("_v{}", self.rng.random_range(0..10u8));
                let tail = len.min(suffix.len());
                out[start + len - tail..start + len].copy_from_slice(&suffix.as_bytes()[..tail]);
            }
            _ => {
                let index = start + self.rng.random_range(0..len);
                out[index] ^= 1 << self.rng.random_range(0..7u32);
            }
        }
        true
    }
}

fn read_word(data: &[u8], offset: usize, width: usize, endian: Endian) -> Option<u64> {
    let word = data.get(offset..offset + width)?;
    let value = match endian {
        Endian::Little => word
            .iter()
            .rev()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
        Endian::Big => word
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
    };
    Some(value)
}

fn set_word(data: &mut [u8], offset: usize, width: usize, endian: Endian, value: u64) -> bool {
    let Some(word) = data.get_mut(offset..offset + width) else {
        return false;
    };
    for (index, byte) in word.iter_mut().enumerate() {
        let shift = match endian {
            Endian::Little => 8 * index,
            Endian::Big => 8 * (width - 1 - index),
        };
        *byte = ((value >> shift) & 0xFF) as u8;
    }
    true
}

fn add_word(data: &mut [u8], offset: usize, width: usize, endian: Endian, delta: i64) -> bool {
    let Some(value) = read_word(data, offset, width, endian) else {
        return false;
    };
    let mask = if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    };
    let updated = (value as i64).wrapping_add(delta) as u64 & mask;
    set_word(data, offset, width, endian, updated)
}

fn section_bytes(data: &[u8], section: &Section) -> Option<std::ops::Range<usize>> {
    let end = section.offset.checked_add(section.size)?;
    if section.size == 0 || end > data.len() {
        return None;
    }
    Some(section.offset..end)
}

/// Locates printable ASCII runs of at least `min_len` bytes as
/// `(start, len)` pairs.
fn find_strings(data: &[u8], min_len: usize) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start = None;
    for (index, byte) in data.iter().enumerate() {
        let printable = (0x20..=0x7e).contains(byte);
        match (printable, start) {
            (true, None) => start = Some(index),
            (false, Some(begin)) => {
                if index - begin >= min_len {
                    runs.push((begin, index - begin));
                }
                start = None;
            }
            _ => {}
        }
    }
    if let Some(begin) = start
        && data.len() - begin >= min_len
    {
        runs.push((begin, data.len() - begin));
    }
    runs
}

/// Overwrites `slot` with `replacement`, truncating or NUL-padding to keep
/// the length unchanged.
fn overwrite_string(slot: &mut [u8], replacement: &[u8]) {
    for (index, byte) in slot.iter_mut().enumerate() {
        *byte = replacement.get(index).copied().unwrap_or(0);
    }
}

fn parse_layout(data: &[u8]) -> Option<ElfLayout> {
    if data.len() < 52 || !data.starts_with(b"\x7fELF") {
        return None;
    }
    let is_64 = match data[4] {
        1 => false,
        2 => true,
        _ => return None,
    };
    let endian = match data[5] {
        1 => Endian::Little,
        2 => Endian::Big,
        _ => return None,
    };
    if is_64 && data.len() < 64 {
        return None;
    }

    let (shoff_at, shentsize_at, shnum_at, phoff_at, phentsize_at, phnum_at) = if is_64 {
        (40, 58, 60, 32, 54, 56)
    } else {
        (32, 46, 48, 28, 42, 44)
    };
    let word = if is_64 { 8 } else { 4 };

    let sh_offset = read_word(data, shoff_at, word, endian)? as usize;
    let sh_entsize = read_word(data, shentsize_at, 2, endian)? as usize;
    let sh_count = read_word(data, shnum_at, 2, endian)? as usize;

    let mut sections = Vec::new();
    if sh_entsize > 0 {
        let (type_at, offset_at, size_at) = if is_64 { (4, 24, 32) } else { (4, 16, 20) };
        for index in 0..sh_count.min(256) {
            let header_offset = sh_offset + index * sh_entsize;
            if header_offset + sh_entsize > data.len() {
                break;
            }
            let sh_type = read_word(data, header_offset + type_at, 4, endian)? as u32;
            let offset = read_word(data, header_offset + offset_at, word, endian)? as usize;
            let size = read_word(data, header_offset + size_at, word, endian)? as usize;
            sections.push(Section {
                header_offset,
                sh_type,
                offset,
                size,
            });
        }
    }

    let ph_offset = read_word(data, phoff_at, word, endian)? as usize;
    let ph_entsize = read_word(data, phentsize_at, 2, endian)? as usize;
    let ph_count = read_word(data, phnum_at, 2, endian)? as usize;

    let mut program_headers = Vec::new();
    if ph_entsize > 0 {
        for index in 0..ph_count.min(64) {
            let header_offset = ph_offset + index * ph_entsize;
            if header_offset + ph_entsize > data.len() {
                break;
            }
            program_headers.push(ProgramHeader { header_offset });
        }
    }

    Some(ElfLayout {
        is_64,
        endian,
        sections,
        program_headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal but internally consistent 64-bit little-endian ELF
    /// with one string-table section.
    fn minimal_elf() -> Vec<u8> {
        let mut elf = vec![0u8; 64];
        elf[..4].copy_from_slice(b"\x7fELF");
        elf[4] = 2; // ELFCLASS64
        elf[5] = 1; // little endian
        elf[6] = 1; // EV_CURRENT
        set_word(&mut elf, 16, 2, Endian::Little, 2); // e_type = ET_EXEC
        set_word(&mut elf, 18, 2, Endian::Little, 0x3e); // e_machine = x86-64
        set_word(&mut elf, 24, 8, Endian::Little, 0x40_1000); // e_entry

        // String-table payload right after the header.
        let strtab_offset = elf.len();
        elf.extend_from_slice(b"\0hello\0world\0longer_name\0");
        let strtab_size = elf.len() - strtab_offset;

        // One section header describing it.
        let sh_offset = elf.len();
        let mut header = vec![0u8; 64];
        set_word(&mut header, 4, 4, Endian::Little, u64::from(SHT_STRTAB));
        set_word(&mut header, 24, 8, Endian::Little, strtab_offset as u64);
        set_word(&mut header, 32, 8, Endian::Little, strtab_size as u64);
        elf.extend_from_slice(&header);

        set_word(&mut elf, 40, 8, Endian::Little, sh_offset as u64); // e_shoff
        set_word(&mut elf, 58, 2, Endian::Little, 64); // e_shentsize
        set_word(&mut elf, 60, 2, Endian::Little, 1); // e_shnum
        elf
    }

    #[test]
    fn parses_the_minimal_elf() {
        let elf = minimal_elf();
        let layout = parse_layout(&elf).expect("valid ELF");
        assert!(layout.is_64);
        assert_eq!(layout.endian, Endian::Little);
        assert_eq!(layout.sections.len(), 1);
        assert_eq!(layout.sections[0].sh_type, SHT_STRTAB);
    }

    #[test]
    fn rejects_non_elf_input() {
        assert!(parse_layout(b"not an elf at all").is_none());
        assert!(parse_layout(b"\x7fELF").is_none());
    }

    #[test]
    fn non_elf_input_falls_back_to_one_perturbation() {
        let mut mutator = ElfMutator::new(1);
        let variants = mutator.mutate(b"plain bytes, no header");
        assert_eq!(variants.len(), 1);
        assert_ne!(variants[0], b"plain bytes, no header");
    }

    #[test]
    fn elf_input_produces_a_full_batch() {
        let mut mutator = ElfMutator::new(2);
        let elf = minimal_elf();
        let variants = mutator.mutate(&elf);
        assert_eq!(variants.len(), DEFAULT_VARIANTS);
        assert!(variants.iter().any(|variant| variant != &elf));
    }

    #[test]
    fn parse_cache_is_bounded() {
        let mut mutator = ElfMutator::new(3);
        let base = minimal_elf();
        for round in 0..(PARSE_CACHE_CAPACITY + 50) {
            let mut input = base.clone();
            // Vary a payload byte so every input hashes differently.
            let len = input.len();
            input[len - 1] = (round & 0xFF) as u8;
            input.push((round >> 8) as u8);
            mutator.mutate(&input);
        }
        assert!(mutator.cache.len() <= PARSE_CACHE_CAPACITY);
    }

    #[test]
    fn string_rewrite_preserves_length() {
        let elf = minimal_elf();
        let mut mutator = ElfMutator::new(4);
        for variant in mutator.mutate(&elf) {
            // Only ascii-run rewrites and in-place edits: structural length
            // never changes for this mutator.
            assert_eq!(variant.len(), elf.len());
        }
    }

    #[test]
    fn find_strings_locates_printable_runs() {
        let data = b"\x00abc\x01de\x02long_run_here";
        let runs = find_strings(data, 3);
        assert!(runs.contains(&(1, 3)));
        assert!(runs.contains(&(8, 13)));
        // Two-byte run is below the threshold.
        assert!(!runs.iter().any(|(start, _)| *start == 5));
    }

    #[test]
    fn overwrite_string_pads_and_truncates() {
        let mut slot = *b"abcdef";
        overwrite_string(&mut slot, b"xy");
        assert_eq!(&slot, b"xy\0\0\0\0");
        let mut slot = *b"ab";
        overwrite_string(&mut slot, b"longer");
        assert_eq!(&slot, b"lo");
    }
}
