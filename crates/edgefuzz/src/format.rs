//! Seed format detection from magic numbers and content heuristics.

/// Formats with a specialized structural mutator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum SeedFormat {
    #[display("elf")]
    Elf,
    #[display("png")]
    Png,
    #[display("jpeg")]
    Jpeg,
    #[display("pcap")]
    Pcap,
    #[display("xml")]
    Xml,
    #[display("lua")]
    Lua,
    #[display("mjs")]
    Mjs,
    #[display("other")]
    Other,
}

pub const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

const PCAP_MAGICS: [u32; 2] = [0xa1b2_c3d4, 0xa1b2_3c4d];

/// Best-effort detection from the input bytes alone.
pub fn detect(data: &[u8]) -> SeedFormat {
    if data.starts_with(b"\x7fELF") {
        return SeedFormat::Elf;
    }
    if data.starts_with(PNG_SIGNATURE) {
        return SeedFormat::Png;
    }
    if data.starts_with(b"\xff\xd8") {
        return SeedFormat::Jpeg;
    }
    if data.len() >= 4 {
        let magic_le = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let magic_be = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if PCAP_MAGICS.contains(&magic_le) || PCAP_MAGICS.contains(&magic_be) {
            return SeedFormat::Pcap;
        }
    }

    let text = String::from_utf8_lossy(data);
    let trimmed = text.trim_start();
    if trimmed.starts_with("<?xml") || trimmed.starts_with("<!DOCTYPE") || trimmed.starts_with('<')
    {
        return SeedFormat::Xml;
    }
    let lowered = trimmed.to_lowercase();
    if lowered.contains("function") && lowered.contains("end") {
        return SeedFormat::Lua;
    }
    if lowered.contains("import ") || lowered.contains("export ") || lowered.contains("require(") {
        return SeedFormat::Mjs;
    }

    SeedFormat::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_by_magic() {
        assert_eq!(detect(b"\x7fELF\x02\x01\x01"), SeedFormat::Elf);
        assert_eq!(detect(b"\x89PNG\r\n\x1a\nrest"), SeedFormat::Png);
        assert_eq!(detect(b"\xff\xd8\xff\xe0"), SeedFormat::Jpeg);
        assert_eq!(detect(&0xa1b2_c3d4u32.to_le_bytes()), SeedFormat::Pcap);
        assert_eq!(detect(&0xa1b2_c3d4u32.to_be_bytes()), SeedFormat::Pcap);
    }

    #[test]
    fn detects_text_formats() {
        assert_eq!(detect(b"<?xml version='1.0'?><a/>"), SeedFormat::Xml);
        assert_eq!(detect(b"  <root></root>"), SeedFormat::Xml);
        assert_eq!(
            detect(b"local function f() return 1 end"),
            SeedFormat::Lua
        );
        assert_eq!(detect(b"import { x } from './y.mjs'"), SeedFormat::Mjs);
    }

    #[test]
    fn everything_else_is_other() {
        assert_eq!(detect(b""), SeedFormat::Other);
        assert_eq!(detect(b"plain bytes"), SeedFormat::Other);
    }
}
