//! Content fingerprints used as cache keys across the mining pipeline.

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

/// 32-byte content digest identifying a shard, index, or derived artifact.
///
/// Equal content always yields an equal fingerprint regardless of where the
/// bytes came from; the ordering impl exists so fingerprint sets can be
/// sorted into a canonical sequence before being combined.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digest of a single byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form used in cache entry names.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in &self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// Parses the form produced by [`Fingerprint::to_hex`].
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HexVisitor;

        impl Visitor<'_> for HexVisitor {
            type Value = Fingerprint;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 64-character lowercase hex digest")
            }

            fn visit_str<E>(self, value: &str) -> Result<Fingerprint, E>
            where
                E: de::Error,
            {
                Fingerprint::from_hex(value)
                    .ok_or_else(|| E::custom(format!("invalid fingerprint hex: {value:?}")))
            }
        }

        deserializer.deserialize_str(HexVisitor)
    }
}

/// Incremental fingerprint builder over length-prefixed segments.
///
/// Each segment is hashed as an 8-byte little-endian length followed by the
/// segment bytes, so `["ab", "c"]` and `["a", "bc"]` never collide. The
/// `domain` string separates artifact kinds that hash similar inputs.
pub struct FingerprintBuilder {
    hasher: blake3::Hasher,
}

impl FingerprintBuilder {
    /// Starts a builder for the given artifact domain.
    pub fn new(domain: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(domain.len() as u64).to_le_bytes());
        hasher.update(domain.as_bytes());
        Self { hasher }
    }

    /// Appends one length-prefixed byte segment.
    pub fn push_bytes(&mut self, segment: &[u8]) {
        self.hasher.update(&(segment.len() as u64).to_le_bytes());
        self.hasher.update(segment);
    }

    /// Appends a string segment.
    pub fn push_str(&mut self, segment: &str) {
        self.push_bytes(segment.as_bytes());
    }

    /// Appends an integer parameter.
    pub fn push_u64(&mut self, value: u64) {
        self.push_bytes(&value.to_le_bytes());
    }

    /// Appends another fingerprint.
    pub fn push_fingerprint(&mut self, fingerprint: &Fingerprint) {
        self.push_bytes(fingerprint.as_bytes());
    }

    /// Finalizes the digest.
    pub fn finish(self) -> Fingerprint {
        Fingerprint(*self.hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_segments_yield_identical_digests() {
        let mut a = FingerprintBuilder::new("shard");
        a.push_str("first sentence");
        a.push_str("second sentence");
        let mut b = FingerprintBuilder::new("shard");
        b.push_str("first sentence");
        b.push_str("second sentence");
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn single_segment_change_flips_digest() {
        let mut a = FingerprintBuilder::new("shard");
        a.push_str("first sentence");
        a.push_str("second sentence");
        let mut b = FingerprintBuilder::new("shard");
        b.push_str("first sentence");
        b.push_str("second sentence!");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn segment_boundaries_are_unambiguous() {
        let mut a = FingerprintBuilder::new("shard");
        a.push_str("ab");
        a.push_str("c");
        let mut b = FingerprintBuilder::new("shard");
        b.push_str("a");
        b.push_str("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn domains_separate_equal_content() {
        let mut a = FingerprintBuilder::new("shard");
        a.push_str("text");
        let mut b = FingerprintBuilder::new("index");
        b.push_str("text");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn hex_round_trips() {
        let fp = Fingerprint::of_bytes(b"round trip");
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Fingerprint::from_hex(&hex), Some(fp));
        assert_eq!(Fingerprint::from_hex("not hex"), None);
    }

    #[test]
    fn serde_uses_hex_form() {
        let fp = Fingerprint::of_bytes(b"serde");
        let json = serde_json::to_string(&fp).expect("serialize");
        assert_eq!(json, format!("\"{}\"", fp.to_hex()));
        let back: Fingerprint = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, fp);
    }
}
