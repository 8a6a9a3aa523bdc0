//! Error kinds shared across the depot workspace.

use err_derive::Error;

/// Errors returned by depot, grouped by how callers are expected to
/// react to them.
#[derive(Debug, Error)]
pub enum Error {
	/// Project, version or content absent. Never retried by the server.
	#[error(display = "not found: {}", _0)]
	NotFound(String),

	/// Concurrent-writer serialization failure. The update engine retries
	/// these a bounded number of times before surfacing them.
	#[error(display = "conflict: {}", _0)]
	Conflict(String),

	/// The request violates a precondition.
	#[error(display = "invariant violated: {}", _0)]
	Invariant(String),

	/// Database or network hiccup; idempotent reads may be retried.
	#[error(display = "transient failure: {}", _0)]
	Transient(String),

	/// The operation is not available on this platform or filesystem.
	#[error(display = "unsupported: {}", _0)]
	Unsupported(String),

	/// An existing path's type disagrees with the target, and removing
	/// it did not help.
	#[error(display = "filesystem conflict at {}: {}", _0, _1)]
	FilesystemConflict(String, String),

	#[error(display = "database error: {}", _0)]
	Db(#[error(source, no_from)] depot_db::Error),

	#[error(display = "IO error: {}", _0)]
	Io(#[error(source, no_from)] std::io::Error),

	#[error(display = "encoding error: {}", _0)]
	Encoding(String),

	#[error(display = "{}", _0)]
	Message(String),
}

impl From<depot_db::Error> for Error {
	fn from(e: depot_db::Error) -> Error {
		match e {
			depot_db::Error::Busy => Error::Conflict("database busy".into()),
			e => Error::Db(e),
		}
	}
}

impl From<depot_db::rusqlite::Error> for Error {
	fn from(e: depot_db::rusqlite::Error) -> Error {
		Error::from(depot_db::Error::from(e))
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Error {
		Error::Io(e)
	}
}

impl From<rmp_serde::encode::Error> for Error {
	fn from(e: rmp_serde::encode::Error) -> Error {
		Error::Encoding(format!("messagepack encode: {}", e))
	}
}

impl From<rmp_serde::decode::Error> for Error {
	fn from(e: rmp_serde::decode::Error) -> Error {
		Error::Encoding(format!("messagepack decode: {}", e))
	}
}

impl From<glob::PatternError> for Error {
	fn from(e: glob::PatternError) -> Error {
		Error::Invariant(format!("bad glob pattern: {}", e))
	}
}

impl Error {
	/// Whether a bounded retry under the project lock is worthwhile.
	pub fn is_retryable(&self) -> bool {
		matches!(self, Error::Conflict(_) | Error::Transient(_))
	}
}
