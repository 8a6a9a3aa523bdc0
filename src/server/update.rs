//! The update engine: streams of object changes applied as one
//! transaction, advancing the project version.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

use depot_db::rusqlite::TransactionBehavior;
use depot_db::Pool;

use depot_rpc::WireObject;
use depot_store::{content, object, pack, project, VERSION_NO_CHANGE};
use depot_util::archive::{self, ArchiveEntry};
use depot_util::error::Error;
use depot_util::pattern::{self, PatternSet};

/// Attempts per update before a serialization failure is surfaced.
const UPDATE_RETRIES: u64 = 3;

/// Registry of per-project advisory locks.
///
/// Updates against one project serialize here; the second writer waits,
/// then observes the committed `latest_version` of the first.
pub struct ProjectLocks {
	inner: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProjectLocks {
	pub fn new() -> Self {
		ProjectLocks {
			inner: Mutex::new(HashMap::new()),
		}
	}

	pub async fn lock(&self, project: i64) -> OwnedMutexGuard<()> {
		let mutex = self
			.inner
			.lock()
			.unwrap()
			.entry(project)
			.or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
			.clone();
		mutex.lock_owned().await
	}
}

impl Default for ProjectLocks {
	fn default() -> Self {
		Self::new()
	}
}

/// Apply one update, retrying bounded times on serialization failures.
///
/// Returns the committed version, or [`VERSION_NO_CHANGE`] when no
/// effective row was written or closed.
pub fn apply(pool: &Pool, project: i64, objects: &[WireObject]) -> Result<i64, Error> {
	let mut attempt = 0;
	loop {
		attempt += 1;
		match apply_once(pool, project, objects) {
			Err(e) if e.is_retryable() && attempt < UPDATE_RETRIES => {
				warn!(
					"update of project {} failed on attempt {} ({}), retrying",
					project, attempt, e
				);
				std::thread::sleep(Duration::from_millis(50 * attempt));
			}
			result => return result,
		}
	}
}

fn apply_once(pool: &Pool, project_id: i64, objects: &[WireObject]) -> Result<i64, Error> {
	let mut conn = pool.get()?;
	let tx = conn
		.transaction_with_behavior(TransactionBehavior::Immediate)
		.map_err(depot_db::Error::from)?;

	let proj = project::get(&tx, project_id)?;
	let patterns = PatternSet::new(&proj.pack_patterns)?;
	let new_version = proj.latest_version + 1;

	let mut changed = 0u64;
	let mut packs: BTreeMap<String, Vec<ArchiveEntry>> = BTreeMap::new();

	for obj in objects {
		let path = normalize_path(obj)?;
		match pattern::pack_root(&patterns, &path) {
			Some(root) => {
				let mut entry = obj.to_entry()?;
				entry.path = path;
				packs.entry(root).or_insert_with(Vec::new).push(entry);
			}
			None => {
				if apply_unpacked(&tx, project_id, new_version, &path, obj)? {
					changed += 1;
				}
			}
		}
	}

	for (root, entries) in &packs {
		if apply_pack(&tx, project_id, new_version, root, entries)? {
			changed += 1;
		}
	}

	if changed == 0 {
		// Dropping the transaction rolls back the content inserts too.
		return Ok(VERSION_NO_CHANGE);
	}

	project::set_latest(&tx, project_id, new_version)?;
	tx.commit().map_err(depot_db::Error::from)?;
	info!(
		"project {}: committed version {} ({} rows touched)",
		project_id, new_version, changed
	);
	Ok(new_version)
}

/// Close/open rows for one unpacked object. Returns whether an
/// effective change was made.
fn apply_unpacked(
	conn: &depot_db::rusqlite::Connection,
	project: i64,
	version: i64,
	path: &str,
	obj: &WireObject,
) -> Result<bool, Error> {
	let open = object::open_row(conn, project, path)?;

	if obj.deleted {
		if open.is_some() {
			object::close_row(conn, project, path, version)?;
			return Ok(true);
		}
		return Ok(false);
	}

	let raw: &[u8] = match &obj.content {
		Some(content) => content.as_slice(),
		None => &[],
	};
	let hash = content::put(conn, raw)?;
	if let Some(open) = open {
		if open.hash == hash {
			return Ok(false);
		}
		object::close_row(conn, project, path, version)?;
	}
	object::insert_row(
		conn,
		project,
		path,
		version,
		&hash,
		obj.mode,
		raw.len() as i64,
		false,
	)?;
	Ok(true)
}

/// Merge incoming objects for one pack root and rewrite the pack blob.
///
/// A pack whose merged serialization hashes identically to the open row
/// is left alone and does not count as a change.
fn apply_pack(
	conn: &depot_db::rusqlite::Connection,
	project: i64,
	version: i64,
	root: &str,
	entries: &[ArchiveEntry],
) -> Result<bool, Error> {
	let open = object::open_row(conn, project, root)?;
	let current = match &open {
		Some(open) => Some(content::get_raw(conn, &open.hash)?),
		None => None,
	};

	match pack::merge(current.as_deref(), entries)? {
		None => {
			if open.is_some() {
				object::close_row(conn, project, root, version)?;
				Ok(true)
			} else {
				Ok(false)
			}
		}
		Some(tar) => {
			let hash = content::put(conn, &tar)?;
			if let Some(open) = &open {
				if open.hash == hash {
					return Ok(false);
				}
			}
			if open.is_some() {
				object::close_row(conn, project, root, version)?;
			}
			object::insert_row(
				conn,
				project,
				root,
				version,
				&hash,
				archive::MODE_DIRECTORY | 0o755,
				tar.len() as i64,
				true,
			)?;
			Ok(true)
		}
	}
}

/// Validate and canonicalize an incoming object path.
///
/// Paths are project-root-relative, use `/` separators, and directory
/// paths carry a trailing slash.
fn normalize_path(obj: &WireObject) -> Result<String, Error> {
	let path = obj.path.as_str();
	if path.is_empty() || path.starts_with('/') {
		return Err(Error::Invariant(format!("invalid object path {:?}", path)));
	}
	for component in path.split('/') {
		if component == "." || component == ".." {
			return Err(Error::Invariant(format!(
				"object path {:?} escapes the project root",
				path
			)));
		}
	}
	if path.contains("//") {
		return Err(Error::Invariant(format!("invalid object path {:?}", path)));
	}
	let mut path = path.to_string();
	if archive::is_directory(obj.mode) && !obj.deleted && !path.ends_with('/') {
		path.push('/');
	}
	Ok(path)
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use depot_store::object::PathFilter;
	use depot_util::data::ContentHash;
	use serde_bytes::ByteBuf;

	pub(crate) fn test_pool() -> (tempfile::TempDir, Pool) {
		let dir = tempfile::tempdir().unwrap();
		let pool = Pool::open(&dir.path().join("test.db")).unwrap();
		(dir, pool)
	}

	pub(crate) fn file(path: &str, data: &[u8]) -> WireObject {
		WireObject {
			path: path.to_string(),
			mode: archive::MODE_REGULAR | 0o644,
			size: data.len() as i64,
			deleted: false,
			content: Some(ByteBuf::from(data.to_vec())),
		}
	}

	pub(crate) fn deletion(path: &str) -> WireObject {
		WireObject {
			path: path.to_string(),
			mode: 0,
			size: 0,
			deleted: true,
			content: None,
		}
	}

	#[test]
	fn test_update_advances_version_by_one() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &[]).unwrap();

		let v1 = apply(&pool, 1, &[file("a", b"a v1"), file("b", b"b v1")]).unwrap();
		assert_eq!(v1, 1);
		let v2 = apply(&pool, 1, &[file("a", b"a v2")]).unwrap();
		assert_eq!(v2, 2);

		let conn = pool.get().unwrap();
		assert_eq!(project::get(&conn, 1).unwrap().latest_version, 2);

		// "a" has two disjoint intervals, "b" one open interval.
		let a_open = object::open_row(&conn, 1, "a").unwrap().unwrap();
		assert_eq!(a_open.start_version, 2);
		let b_open = object::open_row(&conn, 1, "b").unwrap().unwrap();
		assert_eq!(b_open.start_version, 1);
	}

	#[test]
	fn test_identical_update_is_a_noop() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &[]).unwrap();

		assert_eq!(apply(&pool, 1, &[file("a", b"same")]).unwrap(), 1);
		assert_eq!(
			apply(&pool, 1, &[file("a", b"same")]).unwrap(),
			VERSION_NO_CHANGE
		);
		let conn = pool.get().unwrap();
		assert_eq!(project::get(&conn, 1).unwrap().latest_version, 1);
	}

	#[test]
	fn test_empty_update_is_a_noop() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &[]).unwrap();
		assert_eq!(apply(&pool, 1, &[]).unwrap(), VERSION_NO_CHANGE);
	}

	#[test]
	fn test_delete_closes_without_new_row() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &[]).unwrap();

		apply(&pool, 1, &[file("a", b"a")]).unwrap();
		let v2 = apply(&pool, 1, &[deletion("a")]).unwrap();
		assert_eq!(v2, 2);

		let conn = pool.get().unwrap();
		assert!(object::open_row(&conn, 1, "a").unwrap().is_none());
		let removed = object::removed_in_range(&conn, 1, 1, 2, &PathFilter::all()).unwrap();
		assert_eq!(removed, vec![("a".to_string(), 2)]);

		// Deleting an absent path changes nothing.
		assert_eq!(
			apply(&pool, 1, &[deletion("a")]).unwrap(),
			VERSION_NO_CHANGE
		);
	}

	#[test]
	fn test_pack_rewrite_on_member_change() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &["a/".to_string()]).unwrap();

		apply(
			&pool,
			1,
			&[file("a/c", b"a/c v1"), file("a/d", b"a/d v1"), file("b", b"b v1")],
		)
		.unwrap();

		let conn = pool.get().unwrap();
		let root_v1 = object::open_row(&conn, 1, "a/").unwrap().unwrap();
		assert!(root_v1.packed);
		// Individual rows do not coexist under the pack root.
		assert!(object::open_row(&conn, 1, "a/c").unwrap().is_none());
		drop(conn);

		apply(&pool, 1, &[file("a/c", b"a/c v2"), file("b", b"b v2")]).unwrap();

		let conn = pool.get().unwrap();
		let root_v2 = object::open_row(&conn, 1, "a/").unwrap().unwrap();
		assert_eq!(root_v2.start_version, 2);
		assert_ne!(root_v2.hash, root_v1.hash);

		// The rewritten pack carries the untouched member at v1.
		let tar = content::get_raw(&conn, &root_v2.hash).unwrap();
		let members = archive::parse(&tar).unwrap();
		let d = members.iter().find(|m| m.path == "a/d").unwrap();
		assert_eq!(
			d.kind,
			depot_util::archive::EntryKind::Regular(b"a/d v1".to_vec())
		);
	}

	#[test]
	fn test_hash_equal_pack_rewrite_is_a_noop() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &["a/".to_string()]).unwrap();

		apply(&pool, 1, &[file("a/c", b"c")]).unwrap();
		// Same member bytes serialize to the same pack, hence no change.
		assert_eq!(
			apply(&pool, 1, &[file("a/c", b"c")]).unwrap(),
			VERSION_NO_CHANGE
		);
	}

	#[test]
	fn test_deleting_last_pack_member_closes_the_root() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &["a/".to_string()]).unwrap();

		apply(&pool, 1, &[file("a/c", b"c")]).unwrap();
		let v2 = apply(&pool, 1, &[deletion("a/c")]).unwrap();
		assert_eq!(v2, 2);

		let conn = pool.get().unwrap();
		assert!(object::open_row(&conn, 1, "a/").unwrap().is_none());
	}

	#[test]
	fn test_file_replacing_directory() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &[]).unwrap();

		apply(&pool, 1, &[file("foo/bar", b"X")]).unwrap();
		let v2 = apply(&pool, 1, &[deletion("foo/bar"), file("foo", b"Y")]).unwrap();
		assert_eq!(v2, 2);

		let conn = pool.get().unwrap();
		let live = object::changed_in_range(&conn, 1, 0, 2, &PathFilter::all()).unwrap();
		assert_eq!(live.len(), 1);
		assert_eq!(live[0].path, "foo");
		assert_eq!(live[0].hash, ContentHash::digest(&codec_compress(b"Y")));
	}

	#[test]
	fn test_symlink_replacing_directory() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &[]).unwrap();

		apply(&pool, 1, &[file("foo/bar", b"inner"), file("target", b"t")]).unwrap();
		let link = WireObject {
			path: "foo".into(),
			mode: archive::MODE_SYMLINK | 0o777,
			size: 6,
			deleted: false,
			content: Some(ByteBuf::from(b"target".to_vec())),
		};
		apply(&pool, 1, &[deletion("foo/bar"), link]).unwrap();

		let conn = pool.get().unwrap();
		let foo = object::open_row(&conn, 1, "foo").unwrap().unwrap();
		assert!(archive::is_symlink(foo.mode));
		assert!(object::open_row(&conn, 1, "foo/bar").unwrap().is_none());
	}

	#[test]
	fn test_rejects_escaping_paths() {
		let (_dir, pool) = test_pool();
		project::create(&pool.get().unwrap(), 1, &[]).unwrap();

		for path in ["../evil", "/abs", "a/../b", ""] {
			let result = apply(&pool, 1, &[file(path, b"x")]);
			assert!(matches!(result, Err(Error::Invariant(_))), "path {:?}", path);
		}
	}

	#[test]
	fn test_update_missing_project() {
		let (_dir, pool) = test_pool();
		assert!(matches!(
			apply(&pool, 9, &[file("a", b"a")]),
			Err(Error::NotFound(_))
		));
	}

	fn codec_compress(data: &[u8]) -> Vec<u8> {
		depot_util::codec::compress(data).unwrap()
	}
}
