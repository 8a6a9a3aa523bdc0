//! Process-wide zstd codec pool.
//!
//! Contents are compressed before hashing and stored compressed;
//! decompression is done lazily by consumers. Compressor contexts are
//! pooled and reused across requests.

use std::sync::Mutex;

use zstd::bulk::Compressor;

use crate::error::Error;

/// Compression level used for stored contents and stream frames.
pub const COMPRESSION_LEVEL: i32 = 3;

const POOL_MAX: usize = 16;

lazy_static::lazy_static! {
	static ref COMPRESSORS: Mutex<Vec<Compressor<'static>>> = Mutex::new(Vec::new());
}

/// Compress `data` with a pooled zstd context.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, Error> {
	let mut compressor = match COMPRESSORS.lock().unwrap().pop() {
		Some(c) => c,
		None => Compressor::new(COMPRESSION_LEVEL)
			.map_err(|e| Error::Encoding(format!("zstd context: {}", e)))?,
	};
	let result = compressor
		.compress(data)
		.map_err(|e| Error::Encoding(format!("zstd compress: {}", e)));
	let mut pool = COMPRESSORS.lock().unwrap();
	if pool.len() < POOL_MAX {
		pool.push(compressor);
	}
	result
}

/// Decompress a zstd frame produced by [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, Error> {
	zstd::stream::decode_all(data).map_err(|e| Error::Encoding(format!("zstd decompress: {}", e)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_roundtrip() {
		let data = b"depot depot depot depot depot".repeat(64);
		let compressed = compress(&data).unwrap();
		assert!(compressed.len() < data.len());
		assert_eq!(decompress(&compressed).unwrap(), data);
	}

	#[test]
	fn test_compress_is_deterministic() {
		let data = vec![7u8; 4096];
		assert_eq!(compress(&data).unwrap(), compress(&data).unwrap());
	}
}
