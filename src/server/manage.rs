//! Project lifecycle and maintenance operations: creation (optionally
//! from a template), deletion, snapshot/reset/rollback, cloning and
//! garbage collection.

use std::collections::HashMap;

use depot_db::rusqlite::{params, Connection, TransactionBehavior};
use depot_db::Pool;

use depot_rpc::ProjectInfo;
use depot_store::project;
use depot_util::error::Error;

fn immediate_tx<'c>(
	conn: &'c mut depot_db::PooledConnection<'_>,
) -> Result<depot_db::rusqlite::Transaction<'c>, Error> {
	conn.transaction_with_behavior(TransactionBehavior::Immediate)
		.map_err(|e| Error::from(depot_db::Error::from(e)))
}

fn commit(tx: depot_db::rusqlite::Transaction<'_>) -> Result<(), Error> {
	tx.commit()
		.map_err(|e| Error::from(depot_db::Error::from(e)))
}

/// Copy every live object row of `source` at `version` into `target`
/// at version 1, preserving hashes. Returns the number of rows copied.
fn copy_live_rows(
	conn: &Connection,
	source: i64,
	version: i64,
	target: i64,
) -> Result<i64, Error> {
	let copied = conn.execute(
		"INSERT INTO objects (project, path, start_version, stop_version, h1, h2, mode, size, packed) \
		 SELECT ?3, path, 1, NULL, h1, h2, mode, size, packed FROM objects \
		 WHERE project = ?1 AND start_version <= ?2 \
		 AND (stop_version IS NULL OR stop_version > ?2)",
		params![source, version, target],
	)?;
	Ok(copied as i64)
}

/// Create a project, optionally cloning a template at a given version.
pub fn new_project(
	pool: &Pool,
	id: i64,
	pack_patterns: &[String],
	template: Option<i64>,
	template_version: Option<i64>,
) -> Result<(), Error> {
	let mut conn = pool.get()?;
	let tx = immediate_tx(&mut conn)?;
	project::create(&tx, id, pack_patterns)?;
	if let Some(source) = template {
		let source_project = project::get(&tx, source)?;
		let version = template_version.unwrap_or(source_project.latest_version);
		if version > source_project.latest_version {
			return Err(Error::Invariant(format!(
				"template project {} has no version {}",
				source, version
			)));
		}
		let copied = copy_live_rows(&tx, source, version, id)?;
		project::set_latest(&tx, id, if copied > 0 { 1 } else { 0 })?;
	}
	commit(tx)?;
	info!("created project {}", id);
	Ok(())
}

pub fn delete_project(pool: &Pool, id: i64) -> Result<(), Error> {
	let mut conn = pool.get()?;
	let tx = immediate_tx(&mut conn)?;
	project::delete(&tx, id)?;
	commit(tx)?;
	info!("deleted project {}", id);
	Ok(())
}

pub fn list_projects(pool: &Pool) -> Result<Vec<ProjectInfo>, Error> {
	let conn = pool.get()?;
	let projects = project::list(&conn)?;
	Ok(projects
		.into_iter()
		.map(|p| ProjectInfo {
			id: p.id,
			latest_version: p.latest_version,
			pack_patterns: p.pack_patterns,
		})
		.collect())
}

/// Latest version plus live row statistics.
pub fn inspect(pool: &Pool, id: i64) -> Result<(i64, i64, i64), Error> {
	let conn = pool.get()?;
	let proj = project::get(&conn, id)?;
	let (live_objects, total_bytes) = depot_store::object::stats(&conn, id)?;
	Ok((proj.latest_version, live_objects, total_bytes))
}

/// Atomic list of `(project, latest_version)` pairs.
pub fn snapshot(pool: &Pool) -> Result<Vec<(i64, i64)>, Error> {
	let conn = pool.get()?;
	project::snapshot(&conn)
}

/// Truncate one project's history back to `version`: rows started after
/// it are dropped, rows closed after it are reopened.
fn reset_project_rows(conn: &Connection, id: i64, version: i64) -> Result<(), Error> {
	conn.execute(
		"DELETE FROM objects WHERE project = ?1 AND start_version > ?2",
		params![id, version],
	)?;
	conn.execute(
		"UPDATE objects SET stop_version = NULL WHERE project = ?1 AND stop_version > ?2",
		params![id, version],
	)?;
	project::set_latest(conn, id, version)?;
	Ok(())
}

/// Restore the state captured by a [`snapshot`] call. Projects absent
/// from the list are deleted.
pub fn reset(pool: &Pool, projects: &[(i64, i64)]) -> Result<(), Error> {
	let keep: HashMap<i64, i64> = projects.iter().copied().collect();
	let mut conn = pool.get()?;
	let tx = immediate_tx(&mut conn)?;
	for existing in project::list(&tx)? {
		match keep.get(&existing.id) {
			Some(&version) => reset_project_rows(&tx, existing.id, version)?,
			None => project::delete(&tx, existing.id)?,
		}
	}
	commit(tx)?;
	info!("reset {} projects", projects.len());
	Ok(())
}

/// [`reset`] scoped to a single project.
pub fn rollback(pool: &Pool, id: i64, version: i64) -> Result<(), Error> {
	let mut conn = pool.get()?;
	let tx = immediate_tx(&mut conn)?;
	let proj = project::get(&tx, id)?;
	if version < 0 || version > proj.latest_version {
		return Err(Error::Invariant(format!(
			"cannot roll project {} back to version {} (latest is {})",
			id, version, proj.latest_version
		)));
	}
	reset_project_rows(&tx, id, version)?;
	commit(tx)?;
	info!("rolled project {} back to version {}", id, version);
	Ok(())
}

/// Copy `source` at `version` into the fresh project `target`,
/// inheriting the source's pack patterns. Returns the target's latest
/// version.
pub fn clone_to_project(pool: &Pool, source: i64, version: i64, target: i64) -> Result<i64, Error> {
	let mut conn = pool.get()?;
	let tx = immediate_tx(&mut conn)?;
	let source_project = project::get(&tx, source)?;
	if version < 0 || version > source_project.latest_version {
		return Err(Error::Invariant(format!(
			"project {} has no version {} (latest is {})",
			source, version, source_project.latest_version
		)));
	}
	project::create(&tx, target, &source_project.pack_patterns)?;
	let copied = copy_live_rows(&tx, source, version, target)?;
	let latest = if copied > 0 { 1 } else { 0 };
	project::set_latest(&tx, target, latest)?;
	commit(tx)?;
	info!(
		"cloned project {} at version {} into project {} ({} rows)",
		source, version, target, copied
	);
	Ok(latest)
}

/// Keep the last `keep_versions` versions of one project, deleting rows
/// whose interval closed before the retention window. Non-blocking: only
/// closed rows are touched.
pub fn gc_project(pool: &Pool, id: i64, keep_versions: i64) -> Result<i64, Error> {
	let conn = pool.get()?;
	let proj = project::get(&conn, id)?;
	let threshold = proj.latest_version - keep_versions;
	if threshold <= 0 {
		return Ok(0);
	}
	let removed = conn.execute(
		"DELETE FROM objects WHERE project = ?1 \
		 AND stop_version IS NOT NULL AND stop_version <= ?2",
		params![id, threshold],
	)?;
	debug!("gc: project {} dropped {} closed rows", id, removed);
	Ok(removed as i64)
}

/// Run [`gc_project`] on a random sample of projects.
pub fn gc_random_projects(pool: &Pool, count: i64, keep_versions: i64) -> Result<i64, Error> {
	let ids: Vec<i64> = {
		let conn = pool.get()?;
		let mut stmt = conn.prepare("SELECT id FROM projects ORDER BY RANDOM() LIMIT ?1")?;
		let rows = stmt.query_map(params![count], |row| row.get(0))?;
		rows.collect::<Result<Vec<_>, _>>()?
	};
	let mut removed = 0;
	for id in ids {
		removed += gc_project(pool, id, keep_versions)?;
	}
	Ok(removed)
}

/// Drop content rows no object row references any more.
///
/// Contents referenced by a published cache version are kept, so
/// `GET_CACHE` never streams a dangling hash.
pub fn gc_contents(pool: &Pool) -> Result<i64, Error> {
	let conn = pool.get()?;
	let removed = conn.execute(
		"DELETE FROM contents WHERE NOT EXISTS \
		 (SELECT 1 FROM objects o WHERE o.h1 = contents.h1 AND o.h2 = contents.h2) \
		 AND NOT EXISTS \
		 (SELECT 1 FROM cache_hashes c WHERE c.h1 = contents.h1 AND c.h2 = contents.h2)",
		[],
	)?;
	info!("gc: dropped {} orphaned contents", removed);
	Ok(removed as i64)
}
