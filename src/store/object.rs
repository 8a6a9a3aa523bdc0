//! The object index: per-(project, path) version interval rows.
//!
//! A row means "between `start_version` (inclusive) and `stop_version`
//! (exclusive, open when absent), this path has this content". Deletion
//! closes the open row and writes nothing new, so a path's intervals are
//! always disjoint and at most one of them is open.

use depot_db::rusqlite::types::Value;
use depot_db::rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use depot_util::data::ContentHash;
use depot_util::error::Error;
use depot_util::pattern;

/// One stored object row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
	pub path: String,
	pub start_version: i64,
	pub stop_version: Option<i64>,
	pub hash: ContentHash,
	pub mode: u32,
	pub size: i64,
	pub packed: bool,
}

/// Path constraint of one query. Prefix constraints compile to a range
/// scan on the path index.
#[derive(Debug, Clone, Copy)]
pub struct PathFilter<'a> {
	pub path: &'a str,
	pub is_prefix: bool,
}

impl<'a> PathFilter<'a> {
	pub fn all() -> PathFilter<'static> {
		PathFilter {
			path: "",
			is_prefix: true,
		}
	}

	/// Whether `path` satisfies this filter (used for pack members,
	/// which the index predicate cannot see).
	pub fn matches(&self, path: &str) -> bool {
		if self.is_prefix {
			path.starts_with(self.path)
		} else {
			path == self.path
		}
	}
}

fn record_from_row(row: &Row<'_>) -> depot_db::rusqlite::Result<ObjectRecord> {
	Ok(ObjectRecord {
		path: row.get(0)?,
		start_version: row.get(1)?,
		stop_version: row.get(2)?,
		hash: ContentHash::from_words(row.get(3)?, row.get(4)?),
		mode: row.get::<_, i64>(5)? as u32,
		size: row.get(6)?,
		packed: row.get::<_, i64>(7)? != 0,
	})
}

const RECORD_COLUMNS: &str = "path, start_version, stop_version, h1, h2, mode, size, packed";

/// Appends the SQL predicate for `filter` on `column`, pushing its
/// parameters onto `args`.
fn push_path_clause(sql: &mut String, column: &str, filter: &PathFilter, args: &mut Vec<Value>) {
	if !filter.is_prefix {
		args.push(Value::from(filter.path.to_string()));
		sql.push_str(&format!(" AND {} = ?{}", column, args.len()));
	} else if filter.path.is_empty() {
		// No constraint.
	} else if let Some(hi) = pattern::prefix_upper_bound(filter.path) {
		args.push(Value::from(filter.path.to_string()));
		sql.push_str(&format!(" AND {} >= ?{}", column, args.len()));
		args.push(Value::from(hi));
		sql.push_str(&format!(" AND {} < ?{}", column, args.len()));
	} else {
		args.push(Value::from(filter.path.to_string()));
		sql.push_str(&format!(
			" AND substr({}, 1, length(?{})) = ?{}",
			column,
			args.len(),
			args.len()
		));
	}
}

/// Rows live at `version` that satisfy `filter`.
pub fn live_at(
	conn: &Connection,
	project: i64,
	version: i64,
	filter: &PathFilter,
) -> Result<Vec<ObjectRecord>, Error> {
	let mut args: Vec<Value> = vec![Value::from(project), Value::from(version)];
	let mut sql = format!(
		"SELECT {} FROM objects \
		 WHERE project = ?1 AND start_version <= ?2 \
		 AND (stop_version IS NULL OR stop_version > ?2)",
		RECORD_COLUMNS
	);
	push_path_clause(&mut sql, "path", filter, &mut args);
	sql.push_str(" ORDER BY path");
	let mut stmt = conn.prepare(&sql)?;
	let rows = stmt
		.query_map(params_from_iter(args), record_from_row)?
		.collect::<Result<Vec<_>, _>>()?;
	Ok(rows)
}

/// Rows that opened in `(from, to]` and are still live at `to`.
///
/// With `from = 0` this is exactly the live state at `to`; with a larger
/// `from` it is the incremental additions and replacements.
pub fn changed_in_range(
	conn: &Connection,
	project: i64,
	from: i64,
	to: i64,
	filter: &PathFilter,
) -> Result<Vec<ObjectRecord>, Error> {
	let mut args: Vec<Value> = vec![Value::from(project), Value::from(from), Value::from(to)];
	let mut sql = format!(
		"SELECT {} FROM objects \
		 WHERE project = ?1 AND start_version > ?2 AND start_version <= ?3 \
		 AND (stop_version IS NULL OR stop_version > ?3)",
		RECORD_COLUMNS
	);
	push_path_clause(&mut sql, "path", filter, &mut args);
	sql.push_str(" ORDER BY path");
	let mut stmt = conn.prepare(&sql)?;
	let rows = stmt
		.query_map(params_from_iter(args), record_from_row)?
		.collect::<Result<Vec<_>, _>>()?;
	Ok(rows)
}

/// Paths whose deletion falls in `(from, to]` and that have no surviving
/// row at `to`, as `(path, stop_version)` pairs.
///
/// Only meaningful for incremental reads; with `from = 0` deleted paths
/// are silently omitted by the caller.
pub fn removed_in_range(
	conn: &Connection,
	project: i64,
	from: i64,
	to: i64,
	filter: &PathFilter,
) -> Result<Vec<(String, i64)>, Error> {
	let mut args: Vec<Value> = vec![Value::from(project), Value::from(from), Value::from(to)];
	let mut sql = "SELECT o.path, MAX(o.stop_version) FROM objects o \
		 WHERE o.project = ?1 AND o.stop_version > ?2 AND o.stop_version <= ?3 \
		 AND NOT EXISTS ( \
		 SELECT 1 FROM objects l \
		 WHERE l.project = o.project AND l.path = o.path \
		 AND l.start_version <= ?3 \
		 AND (l.stop_version IS NULL OR l.stop_version > ?3))"
		.to_string();
	push_path_clause(&mut sql, "o.path", filter, &mut args);
	sql.push_str(" GROUP BY o.path ORDER BY o.path");
	let mut stmt = conn.prepare(&sql)?;
	let rows = stmt
		.query_map(params_from_iter(args), |row| {
			Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
		})?
		.collect::<Result<Vec<_>, _>>()?;
	Ok(rows)
}

/// Packed rows changed in `(from, to]` whose root is a proper prefix of
/// `query_path`, which a range scan on `query_path` cannot see.
pub fn packed_ancestors(
	conn: &Connection,
	project: i64,
	from: i64,
	to: i64,
	query_path: &str,
) -> Result<Vec<ObjectRecord>, Error> {
	if query_path.is_empty() {
		return Ok(Vec::new());
	}
	let sql = format!(
		"SELECT {} FROM objects \
		 WHERE project = ?1 AND packed = 1 \
		 AND start_version > ?2 AND start_version <= ?3 \
		 AND (stop_version IS NULL OR stop_version > ?3) \
		 AND length(path) < length(?4) \
		 AND substr(?4, 1, length(path)) = path",
		RECORD_COLUMNS
	);
	let mut stmt = conn.prepare(&sql)?;
	let rows = stmt
		.query_map(params![project, from, to, query_path], record_from_row)?
		.collect::<Result<Vec<_>, _>>()?;
	Ok(rows)
}

/// The single open row for `(project, path)`, if any.
pub fn open_row(
	conn: &Connection,
	project: i64,
	path: &str,
) -> Result<Option<ObjectRecord>, Error> {
	let sql = format!(
		"SELECT {} FROM objects \
		 WHERE project = ?1 AND path = ?2 AND stop_version IS NULL",
		RECORD_COLUMNS
	);
	let row = conn
		.query_row(&sql, params![project, path], record_from_row)
		.optional()?;
	Ok(row)
}

/// Close the open row for `path` at `version`. Returns whether a row was
/// closed.
pub fn close_row(conn: &Connection, project: i64, path: &str, version: i64) -> Result<bool, Error> {
	let closed = conn.execute(
		"UPDATE objects SET stop_version = ?3 \
		 WHERE project = ?1 AND path = ?2 AND stop_version IS NULL",
		params![project, path, version],
	)?;
	Ok(closed > 0)
}

/// Insert a new open row starting at `version`.
pub fn insert_row(
	conn: &Connection,
	project: i64,
	path: &str,
	version: i64,
	hash: &ContentHash,
	mode: u32,
	size: i64,
	packed: bool,
) -> Result<(), Error> {
	conn.execute(
		"INSERT INTO objects (project, path, start_version, stop_version, h1, h2, mode, size, packed) \
		 VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, ?8)",
		params![
			project,
			path,
			version,
			hash.h1(),
			hash.h2(),
			mode as i64,
			size,
			packed as i64
		],
	)?;
	Ok(())
}

/// Live object count and total live size, for `Inspect`.
pub fn stats(conn: &Connection, project: i64) -> Result<(i64, i64), Error> {
	let row = conn.query_row(
		"SELECT COUNT(*), COALESCE(SUM(size), 0) FROM objects \
		 WHERE project = ?1 AND stop_version IS NULL",
		params![project],
		|row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
	)?;
	Ok(row)
}

#[cfg(test)]
mod tests {
	use super::*;
	use depot_db::Pool;

	fn test_pool() -> (tempfile::TempDir, Pool) {
		let dir = tempfile::tempdir().unwrap();
		let pool = Pool::open(&dir.path().join("test.db")).unwrap();
		(dir, pool)
	}

	fn insert(conn: &Connection, path: &str, version: i64, data: &[u8]) {
		let hash = ContentHash::digest(data);
		insert_row(conn, 1, path, version, &hash, 0o100644, data.len() as i64, false).unwrap();
	}

	#[test]
	fn test_single_open_row_per_path() {
		let (_dir, pool) = test_pool();
		let conn = pool.get().unwrap();

		insert(&conn, "a", 1, b"v1");
		assert!(close_row(&conn, 1, "a", 2).unwrap());
		insert(&conn, "a", 2, b"v2");

		let open = open_row(&conn, 1, "a").unwrap().unwrap();
		assert_eq!(open.start_version, 2);

		assert!(close_row(&conn, 1, "a", 3).unwrap());
		assert!(open_row(&conn, 1, "a").unwrap().is_none());
		// With no open row left, closing is a no-op.
		assert!(!close_row(&conn, 1, "a", 4).unwrap());
	}

	#[test]
	fn test_changed_in_range_picks_latest_interval() {
		let (_dir, pool) = test_pool();
		let conn = pool.get().unwrap();

		insert(&conn, "a", 1, b"v1");
		close_row(&conn, 1, "a", 2).unwrap();
		insert(&conn, "a", 2, b"v2");
		insert(&conn, "b", 1, b"b1");

		let all = changed_in_range(&conn, 1, 0, 2, &PathFilter::all()).unwrap();
		assert_eq!(all.len(), 2);
		let a = all.iter().find(|r| r.path == "a").unwrap();
		assert_eq!(a.start_version, 2);

		// Historical read at version 1 sees the first interval.
		let old = changed_in_range(&conn, 1, 0, 1, &PathFilter::all()).unwrap();
		let a = old.iter().find(|r| r.path == "a").unwrap();
		assert_eq!(a.hash, ContentHash::digest(b"v1"));
	}

	#[test]
	fn test_removed_in_range_skips_replaced_paths() {
		let (_dir, pool) = test_pool();
		let conn = pool.get().unwrap();

		// "a" replaced at v2, "b" deleted at v2.
		insert(&conn, "a", 1, b"v1");
		close_row(&conn, 1, "a", 2).unwrap();
		insert(&conn, "a", 2, b"v2");
		insert(&conn, "b", 1, b"b1");
		close_row(&conn, 1, "b", 2).unwrap();

		let removed = removed_in_range(&conn, 1, 1, 2, &PathFilter::all()).unwrap();
		assert_eq!(removed, vec![("b".to_string(), 2)]);

		// A deletion before the range start is not re-reported.
		let removed = removed_in_range(&conn, 1, 2, 3, &PathFilter::all()).unwrap();
		assert!(removed.is_empty());
	}

	#[test]
	fn test_prefix_filter_is_a_range() {
		let (_dir, pool) = test_pool();
		let conn = pool.get().unwrap();

		insert(&conn, "lib/a", 1, b"1");
		insert(&conn, "lib/b", 1, b"2");
		insert(&conn, "libx", 1, b"3");

		let filter = PathFilter {
			path: "lib/",
			is_prefix: true,
		};
		let rows = changed_in_range(&conn, 1, 0, 1, &filter).unwrap();
		let paths: Vec<_> = rows.iter().map(|r| r.path.as_str()).collect();
		assert_eq!(paths, vec!["lib/a", "lib/b"]);
	}

	#[test]
	fn test_packed_ancestors() {
		let (_dir, pool) = test_pool();
		let conn = pool.get().unwrap();

		let hash = ContentHash::digest(b"pack");
		insert_row(&conn, 1, "node_modules/", 3, &hash, 0o040755, 100, true).unwrap();

		let found = packed_ancestors(&conn, 1, 0, 3, "node_modules/react/index.js").unwrap();
		assert_eq!(found.len(), 1);
		assert_eq!(found[0].path, "node_modules/");

		// The root itself is not an ancestor of itself.
		let found = packed_ancestors(&conn, 1, 0, 3, "node_modules/").unwrap();
		assert!(found.is_empty());
	}
}
