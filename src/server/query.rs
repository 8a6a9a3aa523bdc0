//! The query engine: resolves `(project, from, to, filters)` views over
//! the object index and streams them back, either as plain object
//! records or as compressed TAR frames.

use std::collections::HashSet;

use serde_bytes::ByteBuf;

use depot_db::rusqlite::Connection;
use depot_db::Pool;

use depot_rpc::{FrameFormat, ObjectQuery, TarFrame, WireObject};
use depot_store::object::{self, ObjectRecord, PathFilter};
use depot_store::{content, project};
use depot_util::archive::{self, ArchiveEntry, EntryKind};
use depot_util::codec;
use depot_util::data::ContentHash;
use depot_util::error::Error;
use depot_util::pattern::PatternSet;

/// Target size of one diff TAR frame before compression.
const FRAME_TARGET: usize = 512 << 10;

/// An [`ObjectQuery`] with its glob filters compiled.
struct CompiledQuery {
	path: String,
	is_prefix: bool,
	ignores: PatternSet,
	subpaths: Vec<String>,
}

impl CompiledQuery {
	fn compile(query: &ObjectQuery) -> Result<Self, Error> {
		Ok(CompiledQuery {
			path: query.path.clone(),
			is_prefix: query.is_prefix,
			ignores: PatternSet::new(&query.ignores)?,
			subpaths: query.subpaths.clone(),
		})
	}

	fn filter(&self) -> PathFilter<'_> {
		PathFilter {
			path: &self.path,
			is_prefix: self.is_prefix,
		}
	}

	/// Per-path admission: prefix/exact constraint, ignores, subpaths.
	/// Evaluated against member paths for packs, not the pack root.
	fn admits(&self, path: &str) -> bool {
		let constrained = if self.is_prefix {
			path.starts_with(&self.path)
		} else {
			path == self.path
		};
		constrained
			&& !self.ignores.matches(path)
			&& (self.subpaths.is_empty() || self.subpaths.iter().any(|s| path.starts_with(s.as_str())))
	}

	/// Whether forwarding a whole pack rooted at `root` needs no
	/// member-level filtering.
	fn covers_whole_pack(&self, root: &str) -> bool {
		let covers = if self.is_prefix {
			root.starts_with(&self.path)
		} else {
			self.path == root
		};
		covers && self.ignores.is_empty() && self.subpaths.is_empty()
	}
}

/// Resolve the `(from, to]` bounds of a read against the project row.
fn resolve_versions(
	conn: &Connection,
	project_id: i64,
	from: i64,
	to: Option<i64>,
) -> Result<(i64, i64), Error> {
	let proj = project::get(conn, project_id)?;
	let to = to.unwrap_or(proj.latest_version);
	if to > proj.latest_version {
		return Err(Error::NotFound(format!(
			"project {} has no version {} (latest is {})",
			project_id, to, proj.latest_version
		)));
	}
	if from > to {
		return Err(Error::Invariant(format!(
			"version range ({}, {}] is empty",
			from, to
		)));
	}
	Ok((from, to))
}

/// Changed rows for one query, packs deduplicated between the range
/// scan and the ancestor lookup.
fn candidate_rows(
	conn: &Connection,
	project_id: i64,
	from: i64,
	to: i64,
	query: &CompiledQuery,
) -> Result<Vec<ObjectRecord>, Error> {
	let changed = object::changed_in_range(conn, project_id, from, to, &query.filter())?;
	let ancestors = object::packed_ancestors(conn, project_id, from, to, &query.path)?;
	let mut seen_packs: HashSet<String> = HashSet::new();
	let mut rows = Vec::with_capacity(changed.len() + ancestors.len());
	for record in changed.into_iter().chain(ancestors) {
		if record.packed && !seen_packs.insert(record.path.clone()) {
			continue;
		}
		rows.push(record);
	}
	Ok(rows)
}

/// Rebuild the tagged entry for an unpacked row.
fn record_to_entry(conn: &Connection, record: &ObjectRecord) -> Result<ArchiveEntry, Error> {
	let kind = if archive::is_directory(record.mode) {
		EntryKind::Directory
	} else if archive::is_symlink(record.mode) {
		let raw = content::get_raw(conn, &record.hash)?;
		let target = String::from_utf8(raw).map_err(|_| {
			Error::Encoding(format!("symlink target of {} is not UTF-8", record.path))
		})?;
		EntryKind::Symlink(target)
	} else {
		EntryKind::Regular(content::get_raw(conn, &record.hash)?)
	};
	Ok(ArchiveEntry {
		path: record.path.clone(),
		mode: record.mode,
		kind,
	})
}

/// `GET`: stream plain object records.
///
/// `emit` returns false when the consumer has gone away; the scan stops
/// quietly. Returns the resolved target version.
pub fn get_objects(
	pool: &Pool,
	project_id: i64,
	from: i64,
	to: Option<i64>,
	queries: &[ObjectQuery],
	emit: &mut dyn FnMut(WireObject) -> bool,
) -> Result<i64, Error> {
	let conn = pool.get()?;
	let (from, to) = resolve_versions(&conn, project_id, from, to)?;

	for query in queries {
		let query = CompiledQuery::compile(query)?;
		for record in candidate_rows(&conn, project_id, from, to, &query)? {
			if record.packed {
				let tar = content::get_raw(&conn, &record.hash)?;
				for entry in archive::parse(&tar)? {
					if !query.admits(&entry.path) {
						continue;
					}
					if !emit(WireObject::from_entry(&entry)) {
						return Ok(to);
					}
				}
			} else {
				if !query.admits(&record.path) {
					continue;
				}
				let entry = record_to_entry(&conn, &record)?;
				if !emit(WireObject::from_entry(&entry)) {
					return Ok(to);
				}
			}
		}
		// Tombstones are only meaningful for incremental reads.
		if from > 0 {
			for (path, _) in object::removed_in_range(&conn, project_id, from, to, &query.filter())? {
				if !query.admits(&path) {
					continue;
				}
				let tombstone = WireObject {
					path,
					mode: 0,
					size: 0,
					deleted: true,
					content: None,
				};
				if !emit(tombstone) {
					return Ok(to);
				}
			}
		}
	}
	Ok(to)
}

/// `GET` collected into one response.
pub fn get_unary(
	pool: &Pool,
	project_id: i64,
	from: i64,
	to: Option<i64>,
	queries: &[ObjectQuery],
) -> Result<(i64, Vec<WireObject>), Error> {
	let mut objects = Vec::new();
	let version = get_objects(pool, project_id, from, to, queries, &mut |obj| {
		objects.push(obj);
		true
	})?;
	Ok((version, objects))
}

fn flush_frame(
	writer: &mut archive::ArchiveWriter,
	to: i64,
	emit: &mut dyn FnMut(TarFrame) -> bool,
) -> Result<bool, Error> {
	if writer.is_empty() {
		return Ok(true);
	}
	let tar = std::mem::replace(writer, archive::ArchiveWriter::new()).finish()?;
	let bytes = codec::compress(&tar)?;
	Ok(emit(TarFrame {
		version: to,
		format: FrameFormat::ZstdTar,
		bytes: ByteBuf::from(bytes),
		pack_path: None,
	}))
}

fn pack_frame(to: i64, pack_path: &str, bytes: Vec<u8>) -> TarFrame {
	TarFrame {
		version: to,
		format: FrameFormat::ZstdTar,
		bytes: ByteBuf::from(bytes),
		pack_path: Some(pack_path.to_string()),
	}
}

/// `GET_COMPRESS`: stream zstd-compressed TAR frames.
///
/// Packed rows are forwarded verbatim (their stored bytes already are
/// compressed TARs); packs whose hash the client holds in one of its
/// cache versions shrink to a placeholder entry naming the hash;
/// unpacked rows are grouped into bounded-size diff frames.
pub fn get_compress(
	pool: &Pool,
	project_id: i64,
	from: i64,
	to: Option<i64>,
	queries: &[ObjectQuery],
	cache_versions: &[i64],
	emit: &mut dyn FnMut(TarFrame) -> bool,
) -> Result<i64, Error> {
	let conn = pool.get()?;
	let (from, to) = resolve_versions(&conn, project_id, from, to)?;
	let cached = crate::cache::hashes_of_versions(&conn, cache_versions)?;

	let mut writer = archive::ArchiveWriter::new();
	for query in queries {
		let query = CompiledQuery::compile(query)?;
		for record in candidate_rows(&conn, project_id, from, to, &query)? {
			if record.packed {
				if !emit_pack(&conn, &query, &record, to, &cached, emit)? {
					return Ok(to);
				}
			} else {
				if !query.admits(&record.path) {
					continue;
				}
				writer.append(&record_to_entry(&conn, &record)?)?;
				if writer.len() >= FRAME_TARGET && !flush_frame(&mut writer, to, emit)? {
					return Ok(to);
				}
			}
		}
		if from > 0 {
			for (path, _) in object::removed_in_range(&conn, project_id, from, to, &query.filter())? {
				if !query.admits(&path) {
					continue;
				}
				writer.append(&ArchiveEntry {
					path,
					mode: 0,
					kind: EntryKind::Delete,
				})?;
				if writer.len() >= FRAME_TARGET && !flush_frame(&mut writer, to, emit)? {
					return Ok(to);
				}
			}
		}
	}
	flush_frame(&mut writer, to, emit)?;
	Ok(to)
}

/// Emit one packed row: verbatim, as a cache placeholder, or demuxed
/// when member-level filters apply.
fn emit_pack(
	conn: &Connection,
	query: &CompiledQuery,
	record: &ObjectRecord,
	to: i64,
	cached: &HashSet<ContentHash>,
	emit: &mut dyn FnMut(TarFrame) -> bool,
) -> Result<bool, Error> {
	if query.covers_whole_pack(&record.path) {
		if cached.contains(&record.hash) {
			let mut writer = archive::ArchiveWriter::new();
			writer.append(&ArchiveEntry {
				path: record.path.clone(),
				mode: archive::MODE_DIRECTORY | 0o755,
				kind: EntryKind::Cached(record.hash),
			})?;
			let bytes = codec::compress(&writer.finish()?)?;
			return Ok(emit(pack_frame(to, &record.path, bytes)));
		}
		// Stored bytes are already a compressed TAR; no re-encoding.
		let bytes = content::get(conn, &record.hash)?;
		return Ok(emit(pack_frame(to, &record.path, bytes)));
	}

	// Member-level filters apply: demux and send the surviving members
	// as plain diff entries. Carrying the pack path here would make the
	// client swap the whole root and lose the filtered-out members.
	let tar = content::get_raw(conn, &record.hash)?;
	let mut writer = archive::ArchiveWriter::new();
	for entry in archive::parse(&tar)? {
		if query.admits(&entry.path) {
			writer.append(&entry)?;
		}
	}
	if writer.is_empty() {
		return Ok(true);
	}
	let bytes = codec::compress(&writer.finish()?)?;
	Ok(emit(TarFrame {
		version: to,
		format: FrameFormat::ZstdTar,
		bytes: ByteBuf::from(bytes),
		pack_path: None,
	}))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::update::tests::{deletion, file, test_pool};
	use crate::update;

	fn get_all(pool: &Pool, project: i64, from: i64, to: Option<i64>) -> Vec<WireObject> {
		let (_, objects) =
			get_unary(pool, project, from, to, &[ObjectQuery::prefix("")]).unwrap();
		objects
	}

	fn content_of(obj: &WireObject) -> &[u8] {
		obj.content.as_ref().unwrap()
	}

	#[test]
	fn test_full_read_after_two_updates() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &[]).unwrap();
		update::apply(
			&pool,
			1,
			&[file("a", b"a v1"), file("b", b"b v1"), file("c", b"c v1")],
		)
		.unwrap();
		update::apply(&pool, 1, &[file("a", b"a v2"), file("c", b"c v2")]).unwrap();

		let objects = get_all(&pool, 1, 0, None);
		assert_eq!(objects.len(), 3);
		let by_path = |p: &str| objects.iter().find(|o| o.path == p).unwrap();
		assert_eq!(content_of(by_path("a")), b"a v2");
		assert_eq!(content_of(by_path("b")), b"b v1");
		assert_eq!(content_of(by_path("c")), b"c v2");
	}

	#[test]
	fn test_historical_read() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &[]).unwrap();
		update::apply(&pool, 1, &[file("a", b"a v1")]).unwrap();
		update::apply(&pool, 1, &[file("a", b"a v2")]).unwrap();

		let objects = get_all(&pool, 1, 0, Some(1));
		assert_eq!(objects.len(), 1);
		assert_eq!(content_of(&objects[0]), b"a v1");
	}

	#[test]
	fn test_incremental_read_emits_tombstones() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &[]).unwrap();
		update::apply(&pool, 1, &[file("a", b"a"), file("b", b"b")]).unwrap();
		update::apply(&pool, 1, &[deletion("b"), file("c", b"c")]).unwrap();

		// Incremental: the new object and the tombstone.
		let objects = get_all(&pool, 1, 1, None);
		assert_eq!(objects.len(), 2);
		assert!(objects.iter().any(|o| o.path == "c" && !o.deleted));
		assert!(objects.iter().any(|o| o.path == "b" && o.deleted));

		// Full read: deleted paths silently omitted.
		let objects = get_all(&pool, 1, 0, None);
		let paths: Vec<_> = objects.iter().map(|o| o.path.as_str()).collect();
		assert_eq!(paths, vec!["a", "c"]);
	}

	#[test]
	fn test_reading_future_version_is_not_found() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &[]).unwrap();
		update::apply(&pool, 1, &[file("a", b"a")]).unwrap();
		assert!(matches!(
			get_unary(&pool, 1, 0, Some(5), &[ObjectQuery::prefix("")]),
			Err(Error::NotFound(_))
		));
	}

	#[test]
	fn test_ignores_and_subpaths() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &[]).unwrap();
		update::apply(
			&pool,
			1,
			&[
				file("src/a.rs", b"a"),
				file("src/a.tmp", b"tmp"),
				file("doc/readme", b"r"),
			],
		)
		.unwrap();

		let query = ObjectQuery {
			path: "".into(),
			is_prefix: true,
			ignores: vec!["*/*.tmp".into()],
			subpaths: vec!["src/".into()],
		};
		let (_, objects) = get_unary(&pool, 1, 0, None, &[query]).unwrap();
		let paths: Vec<_> = objects.iter().map(|o| o.path.as_str()).collect();
		assert_eq!(paths, vec!["src/a.rs"]);
	}

	#[test]
	fn test_pack_members_are_demuxed_on_get() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &["a/".to_string()]).unwrap();
		update::apply(&pool, 1, &[file("a/c", b"c"), file("a/d", b"d"), file("b", b"b")]).unwrap();

		// Exact query for one path inside the pack.
		let query = ObjectQuery {
			path: "a/c".into(),
			is_prefix: false,
			..Default::default()
		};
		let (_, objects) = get_unary(&pool, 1, 0, None, &[query]).unwrap();
		assert_eq!(objects.len(), 1);
		assert_eq!(objects[0].path, "a/c");
		assert_eq!(content_of(&objects[0]), b"c");

		// Prefix query inside the pack root.
		let (_, objects) =
			get_unary(&pool, 1, 0, None, &[ObjectQuery::prefix("a/")]).unwrap();
		let paths: Vec<_> = objects.iter().map(|o| o.path.as_str()).collect();
		assert_eq!(paths, vec!["a/c", "a/d"]);
	}

	#[test]
	fn test_get_compress_forwards_packs_and_frames_the_rest() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &["a/".to_string()]).unwrap();
		update::apply(&pool, 1, &[file("a/c", b"c"), file("b", b"b")]).unwrap();

		let mut frames = Vec::new();
		let version = get_compress(
			&pool,
			1,
			0,
			None,
			&[ObjectQuery::prefix("")],
			&[],
			&mut |frame| {
				frames.push(frame);
				true
			},
		)
		.unwrap();
		assert_eq!(version, 1);
		assert_eq!(frames.len(), 2);

		let pack = frames
			.iter()
			.find(|f| f.pack_path.as_deref() == Some("a/"))
			.unwrap();
		let members = archive::parse(&codec::decompress(&pack.bytes).unwrap()).unwrap();
		assert_eq!(members.len(), 1);
		assert_eq!(members[0].path, "a/c");

		let diff = frames.iter().find(|f| f.pack_path.is_none()).unwrap();
		let members = archive::parse(&codec::decompress(&diff.bytes).unwrap()).unwrap();
		assert_eq!(members.len(), 1);
		assert_eq!(members[0].path, "b");
	}

	#[test]
	fn test_get_compress_substitutes_cached_packs() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &["a/".to_string()]).unwrap();
		update::apply(&pool, 1, &[file("a/c", b"c")]).unwrap();

		let cache_version = crate::cache::build(&pool, "a/").unwrap().unwrap();

		let mut frames = Vec::new();
		get_compress(
			&pool,
			1,
			0,
			None,
			&[ObjectQuery::prefix("")],
			&[cache_version],
			&mut |frame| {
				frames.push(frame);
				true
			},
		)
		.unwrap();
		assert_eq!(frames.len(), 1);

		let members = archive::parse(&codec::decompress(&frames[0].bytes).unwrap()).unwrap();
		assert_eq!(members.len(), 1);
		match &members[0].kind {
			EntryKind::Cached(hash) => {
				let conn = pool.get().unwrap();
				let root = object::open_row(&conn, 1, "a/").unwrap().unwrap();
				assert_eq!(*hash, root.hash);
			}
			other => panic!("expected cached placeholder, got {:?}", other),
		}
	}

	#[test]
	fn test_get_compress_tombstones_removed_pack_root() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &["a/".to_string()]).unwrap();
		update::apply(&pool, 1, &[file("a/c", b"c")]).unwrap();
		update::apply(&pool, 1, &[deletion("a/c")]).unwrap();

		let mut frames = Vec::new();
		get_compress(
			&pool,
			1,
			1,
			None,
			&[ObjectQuery::prefix("")],
			&[],
			&mut |frame| {
				frames.push(frame);
				true
			},
		)
		.unwrap();
		assert_eq!(frames.len(), 1);
		let members = archive::parse(&codec::decompress(&frames[0].bytes).unwrap()).unwrap();
		assert_eq!(members.len(), 1);
		assert_eq!(members[0].path, "a/");
		assert_eq!(members[0].kind, EntryKind::Delete);
	}
}
