//! SQLite access layer for the depot store.
//!
//! All authoritative state lives in one SQLite database in WAL mode:
//! project rows, object version intervals, deduplicated contents and
//! published cache versions. Connections are pooled per process; writers
//! run one transaction per logical operation and readers never observe
//! intermediate state.

#[macro_use]
extern crate tracing;

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use err_derive::Error;
use rusqlite::Connection;

pub use rusqlite;

#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "sqlite error: {}", _0)]
	Sqlite(rusqlite::Error),

	/// A serialization failure; worth a bounded retry.
	#[error(display = "database busy")]
	Busy,
}

impl From<rusqlite::Error> for Error {
	fn from(e: rusqlite::Error) -> Error {
		match &e {
			rusqlite::Error::SqliteFailure(f, _)
				if f.code == rusqlite::ErrorCode::DatabaseBusy
					|| f.code == rusqlite::ErrorCode::DatabaseLocked =>
			{
				Error::Busy
			}
			_ => Error::Sqlite(e),
		}
	}
}

const BUSY_TIMEOUT_MS: u32 = 1000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
	id INTEGER PRIMARY KEY,
	latest_version INTEGER NOT NULL,
	pack_patterns TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS contents (
	h1 INTEGER NOT NULL,
	h2 INTEGER NOT NULL,
	bytes BLOB NOT NULL,
	PRIMARY KEY (h1, h2)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS objects (
	project INTEGER NOT NULL,
	path TEXT NOT NULL,
	start_version INTEGER NOT NULL,
	stop_version INTEGER,
	h1 INTEGER NOT NULL,
	h2 INTEGER NOT NULL,
	mode INTEGER NOT NULL,
	size INTEGER NOT NULL,
	packed INTEGER NOT NULL DEFAULT 0,
	PRIMARY KEY (project, path, start_version)
);

CREATE INDEX IF NOT EXISTS objects_by_start ON objects (project, start_version);
CREATE INDEX IF NOT EXISTS objects_by_stop ON objects (project, stop_version);
CREATE INDEX IF NOT EXISTS objects_by_hash ON objects (h1, h2);

CREATE TABLE IF NOT EXISTS cache_versions (
	version INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS cache_hashes (
	version INTEGER NOT NULL,
	h1 INTEGER NOT NULL,
	h2 INTEGER NOT NULL,
	PRIMARY KEY (version, h1, h2)
) WITHOUT ROWID;
";

/// A pool of connections to one SQLite database.
///
/// `get` hands out an idle connection or opens a new one; dropping the
/// guard returns the connection to the pool.
pub struct Pool {
	path: PathBuf,
	idle: Mutex<Vec<Connection>>,
}

impl Pool {
	/// Open the database at `path`, creating it and migrating the schema
	/// if needed.
	pub fn open(path: &Path) -> Result<Pool, Error> {
		let conn = Connection::open(path)?;
		init_connection(&conn)?;
		conn.execute_batch(SCHEMA)?;
		debug!("opened database at {:?}", path);
		Ok(Pool {
			path: path.to_path_buf(),
			idle: Mutex::new(vec![conn]),
		})
	}

	pub fn get(&self) -> Result<PooledConnection<'_>, Error> {
		let idle = self.idle.lock().unwrap().pop();
		let conn = match idle {
			Some(conn) => conn,
			None => {
				let conn = Connection::open(&self.path)?;
				init_connection(&conn)?;
				conn
			}
		};
		Ok(PooledConnection {
			pool: self,
			conn: Some(conn),
		})
	}
}

fn init_connection(conn: &Connection) -> Result<(), Error> {
	conn.pragma_update(None, "journal_mode", "WAL")?;
	conn.pragma_update(None, "synchronous", "NORMAL")?;
	conn.pragma_update(None, "foreign_keys", "ON")?;
	conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS as u64))?;
	Ok(())
}

pub struct PooledConnection<'a> {
	pool: &'a Pool,
	conn: Option<Connection>,
}

impl<'a> Deref for PooledConnection<'a> {
	type Target = Connection;

	fn deref(&self) -> &Connection {
		self.conn.as_ref().unwrap()
	}
}

impl<'a> DerefMut for PooledConnection<'a> {
	fn deref_mut(&mut self) -> &mut Connection {
		self.conn.as_mut().unwrap()
	}
}

impl<'a> Drop for PooledConnection<'a> {
	fn drop(&mut self) {
		if let Some(conn) = self.conn.take() {
			self.pool.idle.lock().unwrap().push(conn);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_open_and_reuse() {
		let dir = tempfile::tempdir().unwrap();
		let pool = Pool::open(&dir.path().join("test.db")).unwrap();
		{
			let conn = pool.get().unwrap();
			conn.execute(
				"INSERT INTO projects (id, latest_version) VALUES (1, 0)",
				[],
			)
			.unwrap();
		}
		let conn = pool.get().unwrap();
		let latest: i64 = conn
			.query_row("SELECT latest_version FROM projects WHERE id = 1", [], |r| {
				r.get(0)
			})
			.unwrap();
		assert_eq!(latest, 0);
		assert_eq!(pool.idle.lock().unwrap().len(), 0);
	}

	#[test]
	fn test_busy_classification() {
		let e = rusqlite::Error::SqliteFailure(
			rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
			None,
		);
		assert!(matches!(Error::from(e), Error::Busy));
	}
}
