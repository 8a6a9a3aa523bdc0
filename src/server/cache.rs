//! The cache builder: a periodic job that publishes the set of packed
//! blobs worth pre-populating on workers.

use std::collections::{HashMap, HashSet};

use depot_db::rusqlite::types::Value;
use depot_db::rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use depot_db::Pool;

use depot_store::content;
use depot_util::data::ContentHash;
use depot_util::error::Error;
use depot_util::pattern;

/// Union of the hash sets of the given cache versions. Unknown versions
/// are skipped: a client advertising a stale cache just gets full packs.
pub fn hashes_of_versions(
	conn: &Connection,
	versions: &[i64],
) -> Result<HashSet<ContentHash>, Error> {
	let mut hashes = HashSet::new();
	if versions.is_empty() {
		return Ok(hashes);
	}
	let placeholders: Vec<String> = (1..=versions.len()).map(|i| format!("?{}", i)).collect();
	let sql = format!(
		"SELECT h1, h2 FROM cache_hashes WHERE version IN ({})",
		placeholders.join(", ")
	);
	let args: Vec<Value> = versions.iter().map(|v| Value::from(*v)).collect();
	let mut stmt = conn.prepare(&sql)?;
	let rows = stmt.query_map(params_from_iter(args), |row| {
		Ok(ContentHash::from_words(row.get(0)?, row.get(1)?))
	})?;
	for row in rows {
		hashes.insert(row?);
	}
	Ok(hashes)
}

/// Latest published cache version, if any.
pub fn latest_version(conn: &Connection) -> Result<Option<i64>, Error> {
	let version = conn
		.query_row("SELECT MAX(version) FROM cache_versions", [], |row| {
			row.get::<_, Option<i64>>(0)
		})
		.optional()?
		.flatten();
	Ok(version)
}

/// Scan live packed rows under `prefix` and publish the next cache
/// version.
///
/// Per distinct pack-root path the hash with the highest live-project
/// count wins; ties break towards the largest `start_version`. Returns
/// the new version number, or `None` when no packed rows exist under
/// the prefix.
pub fn build(pool: &Pool, prefix: &str) -> Result<Option<i64>, Error> {
	let mut conn = pool.get()?;
	let tx = conn
		.transaction_with_behavior(TransactionBehavior::Immediate)
		.map_err(depot_db::Error::from)?;

	let mut args: Vec<Value> = Vec::new();
	let mut sql = "SELECT path, h1, h2, COUNT(DISTINCT project) AS projects, \
		 MAX(start_version) AS latest_start \
		 FROM objects WHERE packed = 1 AND stop_version IS NULL"
		.to_string();
	if !prefix.is_empty() {
		match pattern::prefix_upper_bound(prefix) {
			Some(hi) => {
				args.push(Value::from(prefix.to_string()));
				sql.push_str(&format!(" AND path >= ?{}", args.len()));
				args.push(Value::from(hi));
				sql.push_str(&format!(" AND path < ?{}", args.len()));
			}
			None => {
				args.push(Value::from(prefix.to_string()));
				sql.push_str(&format!(
					" AND substr(path, 1, length(?{})) = ?{}",
					args.len(),
					args.len()
				));
			}
		}
	}
	sql.push_str(" GROUP BY path, h1, h2");

	// Best hash per path: most live projects, then largest start_version.
	let mut best: HashMap<String, (i64, i64, ContentHash)> = HashMap::new();
	{
		let mut stmt = tx.prepare(&sql)?;
		let rows = stmt.query_map(params_from_iter(args), |row| {
			Ok((
				row.get::<_, String>(0)?,
				ContentHash::from_words(row.get(1)?, row.get(2)?),
				row.get::<_, i64>(3)?,
				row.get::<_, i64>(4)?,
			))
		})?;
		for row in rows {
			let (path, hash, projects, latest_start) = row?;
			// Hash is the last tie-breaker so the result is deterministic.
			match best.get(&path) {
				Some((p, s, h)) if (projects, latest_start, hash) <= (*p, *s, *h) => {}
				_ => {
					best.insert(path, (projects, latest_start, hash));
				}
			}
		}
	}

	if best.is_empty() {
		return Ok(None);
	}

	let version = latest_version(&tx)?.unwrap_or(0) + 1;
	tx.execute(
		"INSERT INTO cache_versions (version) VALUES (?1)",
		params![version],
	)?;
	let hashes: HashSet<ContentHash> = best.values().map(|(_, _, hash)| *hash).collect();
	for hash in &hashes {
		tx.execute(
			"INSERT OR IGNORE INTO cache_hashes (version, h1, h2) VALUES (?1, ?2, ?3)",
			params![version, hash.h1(), hash.h2()],
		)?;
	}
	tx.commit().map_err(depot_db::Error::from)?;
	info!(
		"published cache version {} ({} packed hashes)",
		version,
		hashes.len()
	);
	Ok(Some(version))
}

/// `GET_CACHE`: stream every packed blob of one cache version, then the
/// trailer listing the versions materialized.
pub fn get_cache(
	pool: &Pool,
	version: Option<i64>,
	emit: &mut dyn FnMut(ContentHash, Vec<u8>) -> bool,
) -> Result<Vec<i64>, Error> {
	let conn = pool.get()?;
	let version = match version {
		Some(v) => {
			let known: Option<i64> = conn
				.query_row(
					"SELECT version FROM cache_versions WHERE version = ?1",
					params![v],
					|row| row.get(0),
				)
				.optional()?;
			known.ok_or_else(|| Error::NotFound(format!("cache version {}", v)))?
		}
		None => latest_version(&conn)?
			.ok_or_else(|| Error::NotFound("no cache version published".to_string()))?,
	};

	let mut stmt =
		conn.prepare("SELECT h1, h2 FROM cache_hashes WHERE version = ?1 ORDER BY h1, h2")?;
	let hashes = stmt
		.query_map(params![version], |row| {
			Ok(ContentHash::from_words(row.get(0)?, row.get(1)?))
		})?
		.collect::<Result<Vec<_>, _>>()?;

	for hash in hashes {
		let blob = content::get(&conn, &hash)?;
		if !emit(hash, blob) {
			break;
		}
	}
	Ok(vec![version])
}
