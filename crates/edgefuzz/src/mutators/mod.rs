//! The mutation pipeline.
//!
//! Each mutator is a bounded generator: `mutate` takes the input bytes and
//! returns a batch of variants the campaign can abandon at any index. The
//! set is expressed as a tagged sum type so the campaign can hold mixed
//! pools (and composites can hold sub-pools) without trait objects.

use std::sync::Arc;

use rand::Rng;

pub mod arith;
pub mod bitflip;
pub mod composite;
pub mod elf;
pub mod havoc;
pub mod interest;
pub mod jpeg;
pub mod pcap;
pub mod png;
pub mod script;
pub mod splice;
pub mod xml;

pub use arith::ArithMutator;
pub use bitflip::BitFlipMutator;
pub use composite::CompositeMutator;
pub use elf::ElfMutator;
pub use havoc::HavocMutator;
pub use interest::InterestMutator;
pub use jpeg::JpegMutator;
pub use pcap::PcapMutator;
pub use png::PngMutator;
pub use script::{ScriptDialect, ScriptMutator};
pub use splice::SpliceMutator;
pub use xml::XmlMutator;

/// A mutator variant plus uniform dispatch for the campaign.
#[derive(Debug)]
pub enum Mutator {
    BitFlip(BitFlipMutator),
    Arith(ArithMutator),
    Interest(InterestMutator),
    Havoc(HavocMutator),
    Splice(SpliceMutator),
    Elf(ElfMutator),
    Png(PngMutator),
    Jpeg(JpegMutator),
    Pcap(PcapMutator),
    Xml(XmlMutator),
    Script(ScriptMutator),
    Composite(CompositeMutator),
}

impl Mutator {
    pub fn name(&self) -> &'static str {
        match self {
            Mutator::BitFlip(_) => "bitflip",
            Mutator::Arith(_) => "arith",
            Mutator::Interest(_) => "interest",
            Mutator::Havoc(_) => "havoc",
            Mutator::Splice(_) => "splice",
            Mutator::Elf(_) => "elf",
            Mutator::Png(_) => "png",
            Mutator::Jpeg(_) => "jpeg",
            Mutator::Pcap(_) => "pcap",
            Mutator::Xml(_) => "xml",
            Mutator::Script(_) => "script",
            Mutator::Composite(_) => "composite",
        }
    }

    /// Produces a bounded batch of variants.
    pub fn mutate(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        match self {
            Mutator::BitFlip(m) => m.mutate(data),
            Mutator::Arith(m) => m.mutate(data),
            Mutator::Interest(m) => m.mutate(data),
            Mutator::Havoc(m) => m.mutate(data),
            Mutator::Splice(m) => m.mutate(data),
            Mutator::Elf(m) => m.mutate(data),
            Mutator::Png(m) => m.mutate(data),
            Mutator::Jpeg(m) => m.mutate(data),
            Mutator::Pcap(m) => m.mutate(data),
            Mutator::Xml(m) => m.mutate(data),
            Mutator::Script(m) => m.mutate(data),
            Mutator::Composite(m) => m.mutate(data),
        }
    }

    /// Widens mutation parameters; a no-op for mutators without tunable
    /// strength.
    pub fn apply_aggression(&mut self, scale: f64) {
        match self {
            Mutator::Havoc(m) => m.apply_aggression(scale),
            Mutator::Elf(m) => m.apply_aggression(scale),
            Mutator::Composite(m) => m.apply_aggression(scale),
            _ => {}
        }
    }

    /// Restores the original mutation parameters.
    pub fn clear_aggression(&mut self) {
        match self {
            Mutator::Havoc(m) => m.clear_aggression(),
            Mutator::Elf(m) => m.clear_aggression(),
            Mutator::Composite(m) => m.clear_aggression(),
            _ => {}
        }
    }

    /// Refreshes the donor pool for corpus-aware mutators.
    pub fn set_corpus(&mut self, corpus: &[Arc<[u8]>]) {
        match self {
            Mutator::Havoc(m) => m.set_corpus(corpus),
            Mutator::Splice(m) => m.set_corpus(corpus),
            Mutator::Pcap(m) => m.set_corpus(corpus),
            Mutator::Script(m) => m.set_corpus(corpus),
            Mutator::Composite(m) => m.set_corpus(corpus),
            _ => {}
        }
    }
}

/// Single-byte random perturbation. Format mutators fall back to this when
/// parsing fails so the engine always receives at least one variant.
pub(crate) fn fallback_perturbation<R: Rng>(rng: &mut R, data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    if out.is_empty() {
        out.push(rng.random::<u8>());
    } else {
        let index = rng.random_range(0..out.len());
        out[index] = out[index].wrapping_add(rng.random_range(1..=255u8));
    }
    out
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::SmallRng};

    use super::*;

    #[test]
    fn fallback_changes_exactly_one_byte() {
        let mut rng = SmallRng::seed_from_u64(3);
        let data = vec![0u8; 32];
        let out = fallback_perturbation(&mut rng, &data);
        assert_eq!(out.len(), data.len());
        let changed = out
            .iter()
            .zip(&data)
            .filter(|(new, old)| new != old)
            .count();
        assert_eq!(changed, 1);
    }

    #[test]
    fn fallback_on_empty_input_yields_one_byte() {
        let mut rng = SmallRng::seed_from_u64(3);
        assert_eq!(fallback_perturbation(&mut rng, &[]).len(), 1);
    }
}
