//! Registration token material.
//!
//! Tokens are `STRATO-XXXX-XXXX-XXXX-XXXX`: 128 bits of CSPRNG output
//! rendered in Crockford base32 (no I, L, O, U), grouped for humans.
//! Comparison is constant-time.

use rand::RngCore;
use rand::rngs::OsRng;

pub const TOKEN_PREFIX: &str = "STRATO";

/// Crockford base32 alphabet: unambiguous under transcription.
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

fn crockford(bytes: &[u8], out_chars: usize) -> String {
    // Consume 5 bits per output character from a rolling bit buffer.
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    let mut out = String::with_capacity(out_chars);
    for &b in bytes {
        acc = (acc << 8) | b as u32;
        bits += 8;
        while bits >= 5 && out.len() < out_chars {
            bits -= 5;
            out.push(ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
        if out.len() == out_chars {
            break;
        }
    }
    out
}

/// Mint a fresh token string.
pub fn generate() -> String {
    let mut material = [0u8; 16];
    OsRng.fill_bytes(&mut material);
    let chars = crockford(&material, 16);
    format!(
        "{TOKEN_PREFIX}-{}-{}-{}-{}",
        &chars[0..4],
        &chars[4..8],
        &chars[8..12],
        &chars[12..16]
    )
}

/// Constant-time equality: the comparison cost never depends on where the
/// strings first differ.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut diff = (a.len() ^ b.len()) as u8;
    let n = a.len().min(b.len());
    for i in 0..n {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_format() {
        let token = generate();
        let parts: Vec<&str> = token.split('-').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], TOKEN_PREFIX);
        for group in &parts[1..] {
            assert_eq!(group.len(), 4);
            for c in group.chars() {
                assert!(ALPHABET.contains(&(c as u8)), "bad char {c}");
                assert!(!"ILOU".contains(c));
            }
        }
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = generate();
        let b = generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
        assert!(!constant_time_eq("", "x"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_crockford_is_deterministic() {
        let bytes = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
        assert_eq!(crockford(&bytes, 8), crockford(&bytes, 8));
        assert_eq!(crockford(&bytes, 8).len(), 8);
    }
}
