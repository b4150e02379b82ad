//! Content hashing and the deterministic encodings used for identifiers.
//!
//! Scope ids use Base58 (Bitcoin alphabet — no `0 O I l`); chunk ids use
//! SHA-256 truncated to 128 bits in lowercase Base32. Both are hand-rolled:
//! the encodings are tiny and the alphabets are part of the stable id
//! format, so they live here rather than behind a dependency.

use sha2::{Digest, Sha256};

/// Base58 alphabet (Bitcoin). Excludes `0`, `O`, `I`, `l`.
const BASE58_ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// RFC 4648 Base32 alphabet, lowercased, unpadded.
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

// ---------------------------------------------------------------------------
// SHA-256 helpers
// ---------------------------------------------------------------------------

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Content hash of a source file, as stored in `FileSnapshot.file_hash`.
pub fn file_hash(content: &[u8]) -> String {
    sha256_hex(content)
}

// ---------------------------------------------------------------------------
// Base58 / Base32
// ---------------------------------------------------------------------------

/// Base58-encode arbitrary bytes. Leading zero bytes map to leading `1`s.
pub fn base58_encode(input: &[u8]) -> String {
    let leading_zeros = input.iter().take_while(|&&b| b == 0).count();

    // Repeated division by 58 over a big-endian byte buffer.
    let mut digits: Vec<u8> = Vec::with_capacity(input.len() * 2);
    for &byte in input {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }

    let mut out = String::with_capacity(leading_zeros + digits.len());
    for _ in 0..leading_zeros {
        out.push('1');
    }
    for &d in digits.iter().rev() {
        out.push(BASE58_ALPHABET[d as usize] as char);
    }
    out
}

/// Lowercase unpadded Base32.
pub fn base32_encode(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len().div_ceil(5) * 8);
    let mut buffer: u64 = 0;
    let mut bits: u32 = 0;

    for &byte in input {
        buffer = (buffer << 8) | byte as u64;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let idx = ((buffer >> bits) & 0x1f) as usize;
            out.push(BASE32_ALPHABET[idx] as char);
        }
    }
    if bits > 0 {
        let idx = ((buffer << (5 - bits)) & 0x1f) as usize;
        out.push(BASE32_ALPHABET[idx] as char);
    }
    out
}

/// Decode lowercase unpadded Base32. Returns `None` on foreign characters.
pub fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u64 = 0;
    let mut bits: u32 = 0;

    for c in input.bytes() {
        let value = BASE32_ALPHABET.iter().position(|&a| a == c)? as u64;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
        }
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Chunk identity
// ---------------------------------------------------------------------------

/// Deterministic chunk id.
///
/// `SHA-256(collection \n path \n start \n end \n SHA-256(content))`,
/// truncated to 128 bits and Base32-encoded. Identical inputs always
/// produce the same id, so re-chunking unchanged content is idempotent.
pub fn chunk_id(
    collection: &str,
    relative_path: &str,
    start_line: usize,
    end_line: usize,
    content: &str,
) -> String {
    let content_digest = sha256(content.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(collection.as_bytes());
    hasher.update(b"\n");
    hasher.update(relative_path.as_bytes());
    hasher.update(b"\n");
    hasher.update(start_line.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(end_line.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(content_digest);
    let digest: [u8; 32] = hasher.finalize().into();
    base32_encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn base58_leading_zeros_become_ones() {
        assert_eq!(base58_encode(&[0]), "1");
        assert_eq!(base58_encode(&[0, 0]), "11");
        let encoded = base58_encode(&[0, 0, 1]);
        assert!(encoded.starts_with("11"));
    }

    #[test]
    fn base58_alphabet_excludes_ambiguous_chars() {
        let encoded = base58_encode(&sha256(b"the quick brown fox"));
        for c in ['0', 'O', 'I', 'l'] {
            assert!(!encoded.contains(c), "found {c} in {encoded}");
        }
    }

    #[test]
    fn base32_lowercase_unpadded() {
        let encoded = base32_encode(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(encoded.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(!encoded.contains('='));
        // 4 bytes = 32 bits = 7 base32 chars (ceil(32/5))
        assert_eq!(encoded.len(), 7);
    }

    #[test]
    fn base32_round_trips() {
        let data = sha256(b"roundtrip");
        let encoded = base32_encode(&data[..16]);
        assert_eq!(base32_decode(&encoded).unwrap(), data[..16].to_vec());
        assert!(base32_decode("UPPER!").is_none());
    }

    #[test]
    fn chunk_id_is_deterministic() {
        let a = chunk_id("project_p_dataset_d", "src/lib.rs", 1, 10, "fn main() {}");
        let b = chunk_id("project_p_dataset_d", "src/lib.rs", 1, 10, "fn main() {}");
        assert_eq!(a, b);
        // 128 bits -> 26 base32 chars
        assert_eq!(a.len(), 26);
    }

    #[test]
    fn chunk_id_varies_with_every_field() {
        let base = chunk_id("c", "p", 1, 10, "x");
        assert_ne!(base, chunk_id("c2", "p", 1, 10, "x"));
        assert_ne!(base, chunk_id("c", "p2", 1, 10, "x"));
        assert_ne!(base, chunk_id("c", "p", 2, 10, "x"));
        assert_ne!(base, chunk_id("c", "p", 1, 11, "x"));
        assert_ne!(base, chunk_id("c", "p", 1, 10, "y"));
    }
}
