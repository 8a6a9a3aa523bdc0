//! Message shapes exchanged between depot clients and the server.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use depot_util::archive::{self, ArchiveEntry, EntryKind};
use depot_util::data::ContentHash;
use depot_util::error::Error;

/// One path filter inside a `Get`/`GetCompress` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectQuery {
	pub path: String,
	/// Exact match when false, path-prefix match when true.
	pub is_prefix: bool,
	/// Glob patterns; a match excludes the path.
	pub ignores: Vec<String>,
	/// When non-empty, results are restricted to paths under one of
	/// these prefixes.
	pub subpaths: Vec<String>,
}

impl ObjectQuery {
	pub fn prefix(path: &str) -> ObjectQuery {
		ObjectQuery {
			path: path.to_string(),
			is_prefix: true,
			..Default::default()
		}
	}
}

/// Flattened object record as it crosses the wire.
///
/// `content` is the file bytes for regular files, the target for
/// symlinks, and absent for directories and deletions. Internally both
/// sides work with [`ArchiveEntry`] and only flatten here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireObject {
	pub path: String,
	pub mode: u32,
	pub size: i64,
	pub deleted: bool,
	pub content: Option<ByteBuf>,
}

impl WireObject {
	pub fn from_entry(entry: &ArchiveEntry) -> WireObject {
		let (deleted, size, content) = match &entry.kind {
			EntryKind::Regular(data) => {
				(false, data.len() as i64, Some(ByteBuf::from(data.clone())))
			}
			EntryKind::Symlink(target) => (
				false,
				target.len() as i64,
				Some(ByteBuf::from(target.as_bytes().to_vec())),
			),
			EntryKind::Directory => (false, 0, None),
			EntryKind::Delete => (true, 0, None),
			EntryKind::Cached(_) => (false, 0, None),
		};
		WireObject {
			path: entry.path.clone(),
			mode: entry.full_mode(),
			size,
			deleted,
			content,
		}
	}

	/// Recover the tagged entry form. Fails on malformed symlink targets.
	pub fn to_entry(&self) -> Result<ArchiveEntry, Error> {
		let kind = if self.deleted {
			EntryKind::Delete
		} else if archive::is_symlink(self.mode) {
			let target = self.content.clone().unwrap_or_default();
			let target = String::from_utf8(target.into_vec())
				.map_err(|_| Error::Encoding(format!("symlink target of {} is not UTF-8", self.path)))?;
			EntryKind::Symlink(target)
		} else if archive::is_directory(self.mode) {
			EntryKind::Directory
		} else {
			EntryKind::Regular(self.content.clone().unwrap_or_default().into_vec())
		};
		Ok(ArchiveEntry {
			path: self.path.clone(),
			mode: self.mode,
			kind,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
	pub id: i64,
	pub latest_version: i64,
	pub pack_patterns: Vec<String>,
}

/// Compression/framing format of a stream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameFormat {
	/// A zstd-compressed TAR stream.
	ZstdTar,
}

/// One `GetCompress` stream frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TarFrame {
	/// The version this stream materializes.
	pub version: i64,
	pub format: FrameFormat,
	pub bytes: ByteBuf,
	/// Set when the frame is a whole pack blob (or a cache placeholder
	/// for one), so the client can stage it under the right prefix.
	pub pack_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
	NewProject {
		project: i64,
		pack_patterns: Vec<String>,
		template: Option<i64>,
		template_version: Option<i64>,
	},
	DeleteProject {
		project: i64,
	},
	ListProjects,
	Get {
		project: i64,
		from_version: i64,
		to_version: Option<i64>,
		queries: Vec<ObjectQuery>,
	},
	GetUnary {
		project: i64,
		from_version: i64,
		to_version: Option<i64>,
		queries: Vec<ObjectQuery>,
	},
	GetCompress {
		project: i64,
		from_version: i64,
		to_version: Option<i64>,
		queries: Vec<ObjectQuery>,
		/// Cache versions the client already has on disk.
		cache_versions: Vec<i64>,
	},
	/// Opens a client-streamed update; `UpdateObject` frames follow,
	/// terminated by `UpdateDone`.
	Update {
		project: i64,
	},
	UpdateObject {
		object: WireObject,
	},
	UpdateDone,
	Rollback {
		project: i64,
		version: i64,
	},
	Inspect {
		project: i64,
	},
	Snapshot,
	Reset {
		projects: Vec<(i64, i64)>,
	},
	GcProject {
		project: i64,
		keep_versions: i64,
	},
	GcRandomProjects {
		count: i64,
		keep_versions: i64,
	},
	GcContents,
	CloneToProject {
		source: i64,
		version: i64,
		target: i64,
	},
	GetCache {
		version: Option<i64>,
	},
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
	Ok,
	Error {
		code: StatusCode,
		message: String,
	},
	Projects(Vec<ProjectInfo>),
	/// One `Get` stream item.
	Object {
		object: WireObject,
	},
	/// The whole `GetUnary` result.
	Objects {
		version: i64,
		objects: Vec<WireObject>,
	},
	Frame(TarFrame),
	/// One `GetCache` stream item: a packed blob and its hash.
	CacheBlob {
		hash: ContentHash,
		bytes: ByteBuf,
	},
	/// `GetCache` trailer naming the versions that were materialized.
	CacheEnd {
		versions: Vec<i64>,
	},
	/// Committed version of an update, `-1` for a no-op.
	Version {
		version: i64,
	},
	InspectResult {
		project: i64,
		latest_version: i64,
		live_objects: i64,
		total_bytes: i64,
	},
	SnapshotResult {
		projects: Vec<(i64, i64)>,
	},
	GcResult {
		removed: i64,
	},
	/// Server-stream terminator for `Get`/`GetCompress`.
	End {
		version: i64,
	},
}

/// Stable status codes carried by error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
	NotFound,
	Conflict,
	Invariant,
	Transient,
	Internal,
}

/// Map an internal error to its wire status.
pub fn status_of(err: &Error) -> StatusCode {
	match err {
		Error::NotFound(_) => StatusCode::NotFound,
		Error::Conflict(_) => StatusCode::Conflict,
		Error::Invariant(_) => StatusCode::Invariant,
		Error::Transient(_) | Error::Db(_) => StatusCode::Transient,
		_ => StatusCode::Internal,
	}
}

/// Reconstruct an error kind from a received error response.
pub fn status_error(code: StatusCode, message: String) -> Error {
	match code {
		StatusCode::NotFound => Error::NotFound(message),
		StatusCode::Conflict => Error::Conflict(message),
		StatusCode::Invariant => Error::Invariant(message),
		StatusCode::Transient => Error::Transient(message),
		StatusCode::Internal => Error::Message(message),
	}
}
