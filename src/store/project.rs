//! Project rows: id, latest committed version, pack patterns.

use depot_db::rusqlite::{params, Connection, OptionalExtension};

use depot_util::error::Error;

use crate::VERSION_NEVER_WRITTEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
	pub id: i64,
	pub latest_version: i64,
	pub pack_patterns: Vec<String>,
}

fn join_patterns(patterns: &[String]) -> String {
	patterns.join("\n")
}

fn split_patterns(joined: &str) -> Vec<String> {
	joined
		.split('\n')
		.filter(|s| !s.is_empty())
		.map(|s| s.to_string())
		.collect()
}

pub fn create(conn: &Connection, id: i64, pack_patterns: &[String]) -> Result<(), Error> {
	let inserted = conn.execute(
		"INSERT OR IGNORE INTO projects (id, latest_version, pack_patterns) VALUES (?1, ?2, ?3)",
		params![id, VERSION_NEVER_WRITTEN, join_patterns(pack_patterns)],
	)?;
	if inserted == 0 {
		return Err(Error::Invariant(format!("project {} already exists", id)));
	}
	Ok(())
}

pub fn get(conn: &Connection, id: i64) -> Result<Project, Error> {
	conn.query_row(
		"SELECT id, latest_version, pack_patterns FROM projects WHERE id = ?1",
		params![id],
		|row| {
			Ok(Project {
				id: row.get(0)?,
				latest_version: row.get(1)?,
				pack_patterns: split_patterns(&row.get::<_, String>(2)?),
			})
		},
	)
	.optional()?
	.ok_or_else(|| Error::NotFound(format!("project {}", id)))
}

pub fn list(conn: &Connection) -> Result<Vec<Project>, Error> {
	let mut stmt =
		conn.prepare("SELECT id, latest_version, pack_patterns FROM projects ORDER BY id")?;
	let rows = stmt
		.query_map([], |row| {
			Ok(Project {
				id: row.get(0)?,
				latest_version: row.get(1)?,
				pack_patterns: split_patterns(&row.get::<_, String>(2)?),
			})
		})?
		.collect::<Result<Vec<_>, _>>()?;
	Ok(rows)
}

/// Delete the project row and all of its object rows.
pub fn delete(conn: &Connection, id: i64) -> Result<(), Error> {
	conn.execute("DELETE FROM objects WHERE project = ?1", params![id])?;
	let deleted = conn.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
	if deleted == 0 {
		return Err(Error::NotFound(format!("project {}", id)));
	}
	Ok(())
}

pub fn set_latest(conn: &Connection, id: i64, version: i64) -> Result<(), Error> {
	conn.execute(
		"UPDATE projects SET latest_version = ?2 WHERE id = ?1",
		params![id, version],
	)?;
	Ok(())
}

/// Atomic list of `(project, latest_version)` pairs.
pub fn snapshot(conn: &Connection) -> Result<Vec<(i64, i64)>, Error> {
	let mut stmt = conn.prepare("SELECT id, latest_version FROM projects ORDER BY id")?;
	let rows = stmt
		.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
		.collect::<Result<Vec<_>, _>>()?;
	Ok(rows)
}
