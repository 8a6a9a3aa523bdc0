//! The 128-bit content hash and its encodings.

use std::convert::TryInto;
use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Version of a project that has never been written.
pub const VERSION_NEVER_WRITTEN: i64 = 0;

/// Sentinel returned by updates that committed no change.
pub const VERSION_NO_CHANGE: i64 = -1;

/// A 128-bit content hash, split into two 64-bit words for indexing.
///
/// Computed with xxh3-128 over the payload as stored (i.e. after
/// compression). Fast, not cryptographic.
#[derive(Default, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
	/// Hash `data` with xxh3-128.
	pub fn digest(data: &[u8]) -> Self {
		ContentHash(xxhash_rust::xxh3::xxh3_128(data).to_be_bytes())
	}

	pub fn as_slice(&self) -> &[u8] {
		&self.0[..]
	}

	/// High 64-bit word, as stored in the `h1` database column.
	pub fn h1(&self) -> i64 {
		i64::from_be_bytes(self.0[0..8].try_into().unwrap())
	}

	/// Low 64-bit word, as stored in the `h2` database column.
	pub fn h2(&self) -> i64 {
		i64::from_be_bytes(self.0[8..16].try_into().unwrap())
	}

	pub fn from_words(h1: i64, h2: i64) -> Self {
		let mut bytes = [0u8; 16];
		bytes[0..8].copy_from_slice(&h1.to_be_bytes());
		bytes[8..16].copy_from_slice(&h2.to_be_bytes());
		ContentHash(bytes)
	}

	/// 32 lowercase hex characters.
	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}

	pub fn from_hex(s: &str) -> Option<Self> {
		let bytes = hex::decode(s).ok()?;
		let bytes: [u8; 16] = bytes.try_into().ok()?;
		Some(ContentHash(bytes))
	}
}

impl fmt::Display for ContentHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

impl fmt::Debug for ContentHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ContentHash({})", self.to_hex())
	}
}

impl Serialize for ContentHash {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_bytes(&self.0[..])
	}
}

struct ContentHashVisitor;

impl<'de> Visitor<'de> for ContentHashVisitor {
	type Value = ContentHash;

	fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "a 16-byte content hash")
	}

	fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<ContentHash, E> {
		let bytes: [u8; 16] = v
			.try_into()
			.map_err(|_| E::invalid_length(v.len(), &self))?;
		Ok(ContentHash(bytes))
	}

	fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<ContentHash, A::Error> {
		let mut bytes = [0u8; 16];
		for (i, byte) in bytes.iter_mut().enumerate() {
			*byte = seq
				.next_element()?
				.ok_or_else(|| de::Error::invalid_length(i, &self))?;
		}
		Ok(ContentHash(bytes))
	}
}

impl<'de> Deserialize<'de> for ContentHash {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<ContentHash, D::Error> {
		deserializer.deserialize_bytes(ContentHashVisitor)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_word_split_roundtrip() {
		let hash = ContentHash::digest(b"some payload");
		assert_eq!(ContentHash::from_words(hash.h1(), hash.h2()), hash);
	}

	#[test]
	fn test_hex_roundtrip() {
		let hash = ContentHash::digest(b"other payload");
		let hex = hash.to_hex();
		assert_eq!(hex.len(), 32);
		assert_eq!(ContentHash::from_hex(&hex), Some(hash));
	}

	#[test]
	fn test_digest_is_deterministic() {
		assert_eq!(ContentHash::digest(b"x"), ContentHash::digest(b"x"));
		assert_ne!(ContentHash::digest(b"x"), ContentHash::digest(b"y"));
	}
}
