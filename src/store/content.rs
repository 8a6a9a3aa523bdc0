//! The write-once, globally deduplicated content table.

use depot_db::rusqlite::{params, Connection, OptionalExtension};

use depot_util::codec;
use depot_util::data::ContentHash;
use depot_util::error::Error;

/// Compress `bytes` and insert them if absent, returning the content
/// hash.
///
/// The hash is computed over the compressed payload, so callers that
/// compare hashes compare exactly what is stored. Insertion is
/// insert-or-ignore: concurrent identical writes are race-free and
/// existing rows are never rewritten.
pub fn put(conn: &Connection, bytes: &[u8]) -> Result<ContentHash, Error> {
	let compressed = codec::compress(bytes)?;
	let hash = ContentHash::digest(&compressed);
	let inserted = conn.execute(
		"INSERT OR IGNORE INTO contents (h1, h2, bytes) VALUES (?1, ?2, ?3)",
		params![hash.h1(), hash.h2(), compressed],
	)?;
	if inserted > 0 {
		trace!("stored content {} ({} bytes)", hash, compressed.len());
	}
	Ok(hash)
}

/// Fetch the compressed payload for `hash`.
///
/// Decompression is the caller's concern (`depot_util::codec`); packed
/// blobs are forwarded compressed as-is.
pub fn get(conn: &Connection, hash: &ContentHash) -> Result<Vec<u8>, Error> {
	conn.query_row(
		"SELECT bytes FROM contents WHERE h1 = ?1 AND h2 = ?2",
		params![hash.h1(), hash.h2()],
		|row| row.get::<_, Vec<u8>>(0),
	)
	.optional()?
	.ok_or_else(|| Error::NotFound(format!("content {}", hash)))
}

/// Fetch and decompress the payload for `hash`.
pub fn get_raw(conn: &Connection, hash: &ContentHash) -> Result<Vec<u8>, Error> {
	codec::decompress(&get(conn, hash)?)
}

pub fn exists(conn: &Connection, hash: &ContentHash) -> Result<bool, Error> {
	let found = conn
		.query_row(
			"SELECT 1 FROM contents WHERE h1 = ?1 AND h2 = ?2",
			params![hash.h1(), hash.h2()],
			|_| Ok(()),
		)
		.optional()?;
	Ok(found.is_some())
}

#[cfg(test)]
mod tests {
	use super::*;
	use depot_db::Pool;

	#[test]
	fn test_put_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let pool = Pool::open(&dir.path().join("test.db")).unwrap();
		let conn = pool.get().unwrap();

		let first = put(&conn, b"same bytes").unwrap();
		let second = put(&conn, b"same bytes").unwrap();
		assert_eq!(first, second);

		let count: i64 = conn
			.query_row("SELECT COUNT(*) FROM contents", [], |r| r.get(0))
			.unwrap();
		assert_eq!(count, 1);
	}

	#[test]
	fn test_get_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let pool = Pool::open(&dir.path().join("test.db")).unwrap();
		let conn = pool.get().unwrap();

		let hash = put(&conn, b"payload").unwrap();
		assert!(exists(&conn, &hash).unwrap());
		assert_eq!(get_raw(&conn, &hash).unwrap(), b"payload");
	}

	#[test]
	fn test_get_missing() {
		let dir = tempfile::tempdir().unwrap();
		let pool = Pool::open(&dir.path().join("test.db")).unwrap();
		let conn = pool.get().unwrap();

		let missing = ContentHash::digest(b"never stored");
		assert!(!exists(&conn, &missing).unwrap());
		assert!(matches!(get(&conn, &missing), Err(Error::NotFound(_))));
	}
}
