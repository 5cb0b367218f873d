use std::fmt;

use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// It fingerprints task inputs so that a completed task is re-executed only
/// when the content it was computed from actually changed, and it names the
/// prefixes of materialized environments.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub(crate) struct Hash32([u8; 32]);

impl From<blake3::Hash> for Hash32 {
    fn from(value: blake3::Hash) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// The first eight bytes read as a little-endian integer.
    pub(crate) fn prefix_u64(self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(bytes)
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl From<Hash32> for String {
    fn from(value: Hash32) -> Self {
        value.to_hex()
    }
}

impl TryFrom<String> for Hash32 {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.len() != 64 {
            return Err(format!("expected 64 hex digits, got {}", value.len()));
        }

        let mut out = [0u8; 32];
        for (i, chunk) in value.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).map_err(|e| e.to_string())?;
            out[i] = u8::from_str_radix(pair, 16).map_err(|e| e.to_string())?;
        }

        Ok(Hash32(out))
    }
}

/// Incremental BLAKE3 hasher with length-prefixed fields, so that adjacent
/// fields can't run into each other and collide.
#[derive(Default)]
pub(crate) struct Fingerprint(blake3::Hasher);

impl Fingerprint {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn field(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    pub(crate) fn finish(&self) -> Hash32 {
        self.0.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let hash = Fingerprint::new().field("scflow").finish();
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Hash32::try_from(hex).unwrap(), hash);
    }

    #[test]
    fn test_from_blake3_digest() {
        let digest = blake3::hash(b"scflow");
        assert_eq!(Hash32::from(digest).to_hex(), digest.to_hex().as_str());
    }

    #[test]
    fn test_serializes_as_hex_string() {
        let hash = Fingerprint::new().field("marker").finish();
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));

        let back: Hash32 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
        assert!(serde_json::from_str::<Hash32>("\"abc\"").is_err());
    }

    #[test]
    fn test_hex_rejects_garbage() {
        assert!(Hash32::try_from("abc".to_string()).is_err());
        assert!(Hash32::try_from("z".repeat(64)).is_err());
    }

    #[test]
    fn test_fields_are_delimited() {
        let a = Fingerprint::new().field("ab").field("c").finish();
        let b = Fingerprint::new().field("a").field("bc").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn test_file_hash_follows_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("x.txt")).unwrap();

        std::fs::write(&path, "one").unwrap();
        let first = Hash32::hash_file(&path).unwrap();
        std::fs::write(&path, "two").unwrap();
        let second = Hash32::hash_file(&path).unwrap();

        assert_ne!(first, second);
    }
}
