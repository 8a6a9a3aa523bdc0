//! Working-tree state and the disk-to-server differ.
//!
//! A rebuilt tree carries a `.dl/` directory holding the last
//! materialized version and a manifest of `(mode, size, mtime, hash)`
//! per path. The differ compares the walk against the manifest and only
//! rehashes entries whose cheap metadata changed; the manifest is
//! rewritten only after the operation succeeds, so a failed push can
//! simply run again.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use walkdir::WalkDir;

use depot_rpc::WireObject;
use depot_util::archive::{MODE_DIRECTORY, MODE_SYMLINK};
use depot_util::data::{ContentHash, VERSION_NEVER_WRITTEN, VERSION_NO_CHANGE};
use depot_util::error::Error;

use crate::remote::Client;

/// Name of the state directory inside a working tree.
pub const STATE_DIR: &str = ".dl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
	pub mode: u32,
	pub size: i64,
	pub mtime_ns: i64,
	/// xxh3-128 of the raw content, when it has been computed.
	pub hash: Option<ContentHash>,
}

/// Path-keyed snapshot of the tree as of the last push/rebuild.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
	pub entries: BTreeMap<String, ManifestEntry>,
}

/// A project working tree on the local filesystem.
pub struct WorkDir {
	root: PathBuf,
}

impl WorkDir {
	pub fn open(root: &Path) -> WorkDir {
		WorkDir {
			root: root.to_path_buf(),
		}
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn state_dir(&self) -> PathBuf {
		self.root.join(STATE_DIR)
	}

	/// The last rebuilt version, [`VERSION_NEVER_WRITTEN`] for a fresh
	/// tree.
	pub fn version(&self) -> Result<i64, Error> {
		let path = self.state_dir().join("version");
		match fs::read_to_string(&path) {
			Ok(text) => text
				.trim()
				.parse()
				.map_err(|_| Error::Encoding(format!("corrupt version file {:?}", path))),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(VERSION_NEVER_WRITTEN),
			Err(e) => Err(Error::Io(e)),
		}
	}

	pub fn set_version(&self, version: i64) -> Result<(), Error> {
		fs::create_dir_all(self.state_dir())?;
		fs::write(self.state_dir().join("version"), format!("{}\n", version))?;
		Ok(())
	}

	pub fn manifest(&self) -> Result<Manifest, Error> {
		let path = self.state_dir().join("objects");
		match fs::read(&path) {
			Ok(bytes) => Ok(rmp_serde::from_slice(&bytes)?),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
			Err(e) => Err(Error::Io(e)),
		}
	}

	pub fn save_manifest(&self, manifest: &Manifest) -> Result<(), Error> {
		fs::create_dir_all(self.state_dir())?;
		let bytes = rmp_serde::to_vec_named(manifest)?;
		let tmp = self.state_dir().join("objects.tmp");
		fs::write(&tmp, bytes)?;
		fs::rename(tmp, self.state_dir().join("objects"))?;
		Ok(())
	}

	/// Diff the tree against the manifest.
	///
	/// Returns the wire objects for changed, new and deleted paths, and
	/// the manifest describing the current state of the disk. Entries
	/// whose `(mode, size, mtime)` are unchanged are trusted; the rest
	/// are rehashed, and only actual content or mode changes are sent.
	pub fn diff(&self, subpaths: &[String]) -> Result<(Vec<WireObject>, Manifest), Error> {
		let in_scope =
			|path: &str| subpaths.is_empty() || subpaths.iter().any(|s| path.starts_with(s.as_str()));

		let old = self.manifest()?;
		let mut next = Manifest::default();
		let mut changes = Vec::new();

		let walk = WalkDir::new(&self.root)
			.min_depth(1)
			.sort_by_file_name()
			.into_iter()
			.filter_entry(|e| e.file_name() != std::ffi::OsStr::new(STATE_DIR));
		for entry in walk {
			let entry = entry.map_err(|e| Error::Io(e.into()))?;
			let rel = entry
				.path()
				.strip_prefix(&self.root)
				.expect("walked entry outside the root")
				.to_string_lossy()
				.into_owned();
			let meta = entry.metadata().map_err(|e| Error::Io(e.into()))?;
			let file_type = entry.file_type();

			let (path, raw) = if file_type.is_dir() {
				// Non-empty directories are implied by their children.
				if fs::read_dir(entry.path())?.next().is_some() {
					continue;
				}
				(format!("{}/", rel), None)
			} else if file_type.is_symlink() {
				let target = fs::read_link(entry.path())?;
				(rel, Some(target.to_string_lossy().into_owned().into_bytes()))
			} else {
				(rel, None)
			};
			if !in_scope(&path) {
				continue;
			}

			let mode = normalized_mode(&meta, file_type.is_dir(), file_type.is_symlink());
			let mtime_ns = mtime_nanos(&meta)?;
			let size = match &raw {
				Some(target) => target.len() as i64,
				None if file_type.is_dir() => 0,
				None => meta.len() as i64,
			};

			match old.entries.get(&path) {
				Some(prev)
					if prev.mode == mode && prev.size == size && prev.mtime_ns == mtime_ns =>
				{
					next.entries.insert(path, prev.clone());
				}
				prev => {
					let raw = match raw {
						Some(raw) => raw,
						None if file_type.is_dir() => Vec::new(),
						None => fs::read(entry.path())?,
					};
					let hash = ContentHash::digest(&raw);
					let unchanged =
						prev.map_or(false, |p| p.hash == Some(hash) && p.mode == mode);
					next.entries.insert(
						path.clone(),
						ManifestEntry {
							mode,
							size,
							mtime_ns,
							hash: Some(hash),
						},
					);
					if !unchanged {
						changes.push(WireObject {
							path,
							mode,
							size,
							deleted: false,
							content: Some(ByteBuf::from(raw)),
						});
					}
				}
			}
		}

		for (path, entry) in &old.entries {
			if !in_scope(path) {
				// Out-of-scope entries carry over untouched.
				next.entries.insert(path.clone(), entry.clone());
			} else if !next.entries.contains_key(path) {
				changes.push(WireObject {
					path: path.clone(),
					mode: 0,
					size: 0,
					deleted: true,
					content: None,
				});
			}
		}

		Ok((changes, next))
	}
}

fn normalized_mode(meta: &fs::Metadata, is_dir: bool, is_symlink: bool) -> u32 {
	let perm = meta.permissions().mode() & 0o7777;
	if is_dir {
		MODE_DIRECTORY | perm
	} else if is_symlink {
		MODE_SYMLINK | perm
	} else {
		depot_util::archive::MODE_REGULAR | perm
	}
}

fn mtime_nanos(meta: &fs::Metadata) -> Result<i64, Error> {
	let mtime = meta.modified()?;
	let nanos = mtime
		.duration_since(UNIX_EPOCH)
		.map_err(|_| Error::Message("mtime before the epoch".to_string()))?
		.as_nanos();
	Ok(nanos as i64)
}

/// Diff the working tree and stream the changes to the server.
///
/// Returns the committed version, [`VERSION_NO_CHANGE`] when nothing
/// changed. The manifest and version file are rewritten only on
/// success.
pub async fn push(
	client: &mut Client,
	project: i64,
	dir: &Path,
	subpaths: &[String],
) -> Result<i64, Error> {
	let workdir = WorkDir::open(dir);
	let (changes, next) = workdir.diff(subpaths)?;
	let version = if changes.is_empty() {
		VERSION_NO_CHANGE
	} else {
		client.update(project, changes).await?
	};
	if version != VERSION_NO_CHANGE {
		workdir.set_version(version)?;
	}
	workdir.save_manifest(&next)?;
	Ok(version)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn write(root: &Path, rel: &str, data: &[u8]) {
		let path = root.join(rel);
		fs::create_dir_all(path.parent().unwrap()).unwrap();
		fs::write(path, data).unwrap();
	}

	#[test]
	fn test_diff_detects_new_and_deleted() {
		let dir = tempfile::tempdir().unwrap();
		let workdir = WorkDir::open(dir.path());
		write(dir.path(), "a.txt", b"a");
		write(dir.path(), "sub/b.txt", b"b");

		let (changes, next) = workdir.diff(&[]).unwrap();
		let mut paths: Vec<_> = changes.iter().map(|c| c.path.as_str()).collect();
		paths.sort_unstable();
		assert_eq!(paths, vec!["a.txt", "sub/b.txt"]);
		workdir.save_manifest(&next).unwrap();

		fs::remove_file(dir.path().join("a.txt")).unwrap();
		let (changes, _) = workdir.diff(&[]).unwrap();
		assert_eq!(changes.len(), 1);
		assert_eq!(changes[0].path, "a.txt");
		assert!(changes[0].deleted);
	}

	#[test]
	fn test_diff_skips_unchanged_and_state_dir() {
		let dir = tempfile::tempdir().unwrap();
		let workdir = WorkDir::open(dir.path());
		write(dir.path(), "a.txt", b"a");
		workdir.set_version(3).unwrap();

		let (changes, next) = workdir.diff(&[]).unwrap();
		assert_eq!(changes.len(), 1);
		workdir.save_manifest(&next).unwrap();

		let (changes, _) = workdir.diff(&[]).unwrap();
		assert!(changes.is_empty());
		assert_eq!(workdir.version().unwrap(), 3);
	}

	#[test]
	fn test_mtime_only_touch_is_not_pushed() {
		let dir = tempfile::tempdir().unwrap();
		let workdir = WorkDir::open(dir.path());
		write(dir.path(), "a.txt", b"stable");

		let (_, next) = workdir.diff(&[]).unwrap();
		workdir.save_manifest(&next).unwrap();

		// Rewrite identical bytes; the mtime moves, the hash does not.
		write(dir.path(), "a.txt", b"stable");
		let (changes, next) = workdir.diff(&[]).unwrap();
		assert!(changes.is_empty());
		// The refreshed mtime is remembered so the next diff is cheap.
		workdir.save_manifest(&next).unwrap();
	}

	#[test]
	fn test_empty_directories_become_objects() {
		let dir = tempfile::tempdir().unwrap();
		let workdir = WorkDir::open(dir.path());
		fs::create_dir_all(dir.path().join("empty")).unwrap();
		write(dir.path(), "full/child.txt", b"c");

		let (changes, _) = workdir.diff(&[]).unwrap();
		let paths: Vec<_> = changes.iter().map(|c| c.path.as_str()).collect();
		assert!(paths.contains(&"empty/"));
		assert!(!paths.contains(&"full/"));
	}

	#[test]
	fn test_symlinks_are_not_dereferenced() {
		let dir = tempfile::tempdir().unwrap();
		let workdir = WorkDir::open(dir.path());
		write(dir.path(), "target.txt", b"t");
		std::os::unix::fs::symlink("target.txt", dir.path().join("link")).unwrap();

		let (changes, _) = workdir.diff(&[]).unwrap();
		let link = changes.iter().find(|c| c.path == "link").unwrap();
		assert!(depot_util::archive::is_symlink(link.mode));
		assert_eq!(link.content.as_ref().unwrap().as_slice(), b"target.txt");
	}

	#[test]
	fn test_subpath_scoping() {
		let dir = tempfile::tempdir().unwrap();
		let workdir = WorkDir::open(dir.path());
		write(dir.path(), "src/a.rs", b"a");
		write(dir.path(), "doc/b.md", b"b");
		let (_, next) = workdir.diff(&[]).unwrap();
		workdir.save_manifest(&next).unwrap();

		write(dir.path(), "src/a.rs", b"a2");
		write(dir.path(), "doc/b.md", b"b2");
		let (changes, next) = workdir.diff(&["src/".to_string()]).unwrap();
		let paths: Vec<_> = changes.iter().map(|c| c.path.as_str()).collect();
		assert_eq!(paths, vec!["src/a.rs"]);
		// The out-of-scope entry survives in the manifest.
		assert!(next.entries.contains_key("doc/b.md"));
	}
}
