//! Conversion between the clients' string encodings and UTF-8.
//!
//! DC/GC clients send Shift-JIS for Japanese text and ISO-8859-1 otherwise;
//! PC and Blue Burst use UTF-16LE. Internally the server is UTF-8 only.

use encoding_rs::{SHIFT_JIS, WINDOWS_1252};

use crate::version::{Language, Version};

/// Decode a NUL-terminated (or full-length) client string to UTF-8.
pub fn decode_string(version: Version, lang: Language, bytes: &[u8]) -> String {
    if uses_utf16(version) {
        return decode_utf16le(bytes);
    }

    let bytes = truncate_at_nul(bytes);

    if lang == Language::Japanese || looks_like_sjis(bytes) {
        let (s, _, _) = SHIFT_JIS.decode(bytes);
        s.into_owned()
    } else {
        let (s, _, _) = WINDOWS_1252.decode(bytes);
        s.into_owned()
    }
}

/// Encode UTF-8 into what the given client expects. Output is NOT padded;
/// packet builders handle their own field sizes.
pub fn encode_string(version: Version, lang: Language, s: &str) -> Vec<u8> {
    if uses_utf16(version) {
        return encode_utf16le(s);
    }

    if lang == Language::Japanese {
        let (b, _, _) = SHIFT_JIS.encode(s);
        b.into_owned()
    } else {
        let (b, _, _) = WINDOWS_1252.encode(s);
        b.into_owned()
    }
}

fn uses_utf16(version: Version) -> bool {
    matches!(version, Version::PcNte | Version::Pcv2 | Version::BlueBurst)
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let mut units = Vec::with_capacity(bytes.len() / 2);

    for pair in bytes.chunks_exact(2) {
        let u = u16::from_le_bytes([pair[0], pair[1]]);
        if u == 0 {
            break;
        }
        units.push(u);
    }

    String::from_utf16_lossy(&units)
}

fn encode_utf16le(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);

    for u in s.encode_utf16() {
        out.extend_from_slice(&u.to_le_bytes());
    }

    out
}

fn truncate_at_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(n) => &bytes[..n],
        None => bytes,
    }
}

/// Chat bodies on DC/GC carry a language marker: "\tJ" for Shift-JIS text,
/// "\tE" for ISO-8859-1. This peeks at it without consuming.
fn looks_like_sjis(bytes: &[u8]) -> bool {
    bytes.starts_with(b"\tJ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_round_trips_everywhere() {
        for v in [Version::Dcv1, Version::Gc, Version::Pcv2, Version::BlueBurst] {
            let enc = encode_string(v, Language::English, "GAME-01");
            assert_eq!(decode_string(v, Language::English, &enc), "GAME-01");
        }
    }

    #[test]
    fn utf16_stops_at_the_terminator() {
        let bytes = [b'H', 0, b'i', 0, 0, 0, b'X', 0];
        assert_eq!(decode_string(Version::Pcv2, Language::English, &bytes), "Hi");
    }

    #[test]
    fn japanese_tag_selects_shift_jis() {
        let enc = encode_string(Version::Gc, Language::Japanese, "\tJテスト");
        let dec = decode_string(Version::Gc, Language::English, &enc);
        assert_eq!(dec, "\tJテスト");
    }
}
