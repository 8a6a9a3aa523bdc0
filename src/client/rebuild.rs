//! Applying streamed TAR frames onto a working tree.
//!
//! Conflicting path types are reconciled by retry-and-clobber: a
//! create that fails over an existing entry removes the path
//! recursively and tries once more. Whole packs whose root already
//! exists on disk are extracted into a temporary sibling and swapped
//! into place, so readers of the tree never see a half-written pack.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use depot_rpc::{ObjectQuery, TarFrame};
use depot_util::archive::{self, ArchiveEntry, EntryKind};
use depot_util::codec;
use depot_util::data::ContentHash;
use depot_util::error::Error;

use crate::cache::CacheDir;
use crate::remote::Client;
use crate::workdir::{Manifest, ManifestEntry, WorkDir};

/// Files at least this large are preallocated before writing.
const FALLOCATE_MIN: u64 = 512 << 10;

/// Materialize `project` at `to` (latest when `None`) into `dir`,
/// requesting only the diff against the tree's current version and
/// resolving cached packs through `cache`.
pub async fn rebuild(
	client: &mut Client,
	project: i64,
	dir: &Path,
	to: Option<i64>,
	cache: Option<&CacheDir>,
	subpaths: &[String],
) -> Result<i64, Error> {
	let workdir = WorkDir::open(dir);
	let from = workdir.version()?;
	let mut manifest = workdir.manifest()?;
	let cache_versions = match cache {
		Some(cache) => cache.versions()?,
		None => Vec::new(),
	};

	let query = ObjectQuery {
		path: String::new(),
		is_prefix: true,
		ignores: Vec::new(),
		subpaths: subpaths.to_vec(),
	};
	let mut applier = Applier {
		root: workdir.root().to_path_buf(),
		state_dir: workdir.state_dir(),
		cache,
		manifest: &mut manifest,
	};
	fs::create_dir_all(&applier.state_dir)?;

	let version = client
		.get_compress(
			project,
			from,
			to,
			vec![query],
			cache_versions,
			&mut |frame| applier.apply_frame(frame),
		)
		.await?;

	workdir.set_version(version)?;
	workdir.save_manifest(&manifest)?;
	debug!("rebuilt {:?} to version {}", dir, version);
	Ok(version)
}

struct Applier<'a> {
	root: PathBuf,
	state_dir: PathBuf,
	cache: Option<&'a CacheDir>,
	manifest: &'a mut Manifest,
}

impl<'a> Applier<'a> {
	fn apply_frame(&mut self, frame: TarFrame) -> Result<(), Error> {
		let tar = codec::decompress(&frame.bytes)?;
		let entries = archive::parse(&tar)?;

		if let Some(pack_path) = frame.pack_path.clone() {
			if let [ArchiveEntry {
				kind: EntryKind::Cached(hash),
				..
			}] = entries.as_slice()
			{
				return self.apply_cached_pack(&pack_path, *hash);
			}
			return self.apply_pack(&pack_path, &entries);
		}

		for entry in &entries {
			self.apply_entry(entry)?;
		}
		Ok(())
	}

	/// A whole pack blob. If the root already exists the members are
	/// staged next to the tree and swapped in atomically.
	fn apply_pack(&mut self, pack_path: &str, entries: &[ArchiveEntry]) -> Result<(), Error> {
		let dest = self.root.join(pack_path.trim_end_matches('/'));
		if !dest.exists() {
			for entry in entries {
				self.apply_entry(entry)?;
			}
			return Ok(());
		}

		let stage = tempfile::tempdir_in(&self.state_dir)?;
		for entry in entries {
			materialize_entry(stage.path(), entry)?;
		}
		let staged_root = stage.path().join(pack_path.trim_end_matches('/'));

		remove_path_any(&dest);
		ensure_parent_dirs(&self.root, pack_path)?;
		fs::rename(&staged_root, &dest)?;

		self.forget_subtree(pack_path);
		for entry in entries {
			self.record_entry(entry)?;
		}
		Ok(())
	}

	/// A `TarCached` placeholder: link the pack subtree out of the
	/// local cache instead of receiving bytes.
	fn apply_cached_pack(&mut self, pack_path: &str, hash: ContentHash) -> Result<(), Error> {
		let cache = self.cache.ok_or_else(|| {
			Error::Invariant(format!(
				"server sent cached pack {} but no cache directory is configured",
				pack_path
			))
		})?;
		let dest = self.root.join(pack_path.trim_end_matches('/'));
		remove_path_any(&dest);
		ensure_parent_dirs(&self.root, pack_path)?;
		cache.link_tree(&hash, pack_path, &dest)?;

		self.forget_subtree(pack_path);
		self.record_tree(pack_path, &dest)?;
		Ok(())
	}

	fn apply_entry(&mut self, entry: &ArchiveEntry) -> Result<(), Error> {
		if let EntryKind::Delete = entry.kind {
			let path = self.root.join(entry.path.trim_end_matches('/'));
			remove_tolerant(&path)?;
			self.forget_path(&entry.path);
			return Ok(());
		}
		materialize_entry(&self.root, entry)?;
		self.record_entry(entry)?;
		Ok(())
	}

	// ---- Manifest bookkeeping ----

	fn forget_path(&mut self, path: &str) {
		self.manifest.entries.remove(path);
		let prefix = if path.ends_with('/') {
			path.to_string()
		} else {
			format!("{}/", path)
		};
		self.manifest
			.entries
			.retain(|k, _| !k.starts_with(&prefix));
	}

	fn forget_subtree(&mut self, pack_path: &str) {
		self.manifest
			.entries
			.retain(|k, _| !k.starts_with(pack_path));
	}

	fn record_entry(&mut self, entry: &ArchiveEntry) -> Result<(), Error> {
		let disk = self.root.join(entry.path.trim_end_matches('/'));
		let hash = match &entry.kind {
			EntryKind::Regular(data) => Some(ContentHash::digest(data)),
			EntryKind::Symlink(target) => Some(ContentHash::digest(target.as_bytes())),
			_ => None,
		};
		let meta = fs::symlink_metadata(&disk)?;
		self.manifest.entries.insert(
			entry.path.clone(),
			ManifestEntry {
				mode: entry.full_mode(),
				size: meta.len() as i64,
				mtime_ns: mtime_nanos(&meta),
				hash,
			},
		);
		Ok(())
	}

	/// Record a linked cache subtree by walking what landed on disk.
	fn record_tree(&mut self, pack_path: &str, dest: &Path) -> Result<(), Error> {
		for entry in walkdir::WalkDir::new(dest).min_depth(1) {
			let entry = entry.map_err(|e| Error::Io(e.into()))?;
			let rel = entry
				.path()
				.strip_prefix(dest)
				.expect("walked entry outside the linked tree")
				.to_string_lossy()
				.into_owned();
			let meta = entry.metadata().map_err(|e| Error::Io(e.into()))?;
			let file_type = entry.file_type();
			if file_type.is_dir() && fs::read_dir(entry.path())?.next().is_some() {
				continue;
			}
			let path = if file_type.is_dir() {
				format!("{}{}/", pack_path, rel)
			} else {
				format!("{}{}", pack_path, rel)
			};
			let mode = if file_type.is_dir() {
				archive::MODE_DIRECTORY | (meta.permissions().mode() & 0o7777)
			} else if file_type.is_symlink() {
				archive::MODE_SYMLINK | (meta.permissions().mode() & 0o7777)
			} else {
				archive::MODE_REGULAR | (meta.permissions().mode() & 0o7777)
			};
			self.manifest.entries.insert(
				path,
				ManifestEntry {
					mode,
					size: meta.len() as i64,
					mtime_ns: mtime_nanos(&meta),
					hash: None,
				},
			);
		}
		Ok(())
	}
}

fn mtime_nanos(meta: &fs::Metadata) -> i64 {
	meta.modified()
		.ok()
		.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
		.map(|d| d.as_nanos() as i64)
		.unwrap_or(0)
}

/// Write one archive member under `base`, clobbering conflicting
/// entries.
pub(crate) fn materialize_entry(base: &Path, entry: &ArchiveEntry) -> Result<(), Error> {
	ensure_parent_dirs(base, &entry.path)?;
	let path = base.join(entry.path.trim_end_matches('/'));
	let perm = entry.mode & 0o7777;
	match &entry.kind {
		EntryKind::Regular(data) => with_clobber(&path, || write_file(&path, data, perm)),
		EntryKind::Directory => with_clobber(&path, || {
			if let Err(e) = fs::create_dir(&path) {
				let exists_as_dir = e.kind() == std::io::ErrorKind::AlreadyExists
					&& fs::symlink_metadata(&path)
						.map(|m| m.is_dir())
						.unwrap_or(false);
				if !exists_as_dir {
					return Err(e);
				}
			}
			fs::set_permissions(&path, fs::Permissions::from_mode(perm))
		}),
		EntryKind::Symlink(target) => with_clobber(&path, || {
			match fs::remove_file(&path) {
				Ok(()) => {}
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
				Err(e) => return Err(e),
			}
			std::os::unix::fs::symlink(target, &path)
		}),
		EntryKind::Delete => remove_tolerant(&path),
		EntryKind::Cached(_) => Err(Error::Invariant(format!(
			"cache placeholder {} outside a pack frame",
			entry.path
		))),
	}
}

fn write_file(path: &Path, data: &[u8], perm: u32) -> std::io::Result<()> {
	let mut file = fs::OpenOptions::new()
		.write(true)
		.create(true)
		.truncate(true)
		.open(path)?;
	preallocate(&file, data.len() as u64);
	file.write_all(data)?;
	file.set_permissions(fs::Permissions::from_mode(perm))?;
	Ok(())
}

#[cfg(target_os = "linux")]
fn preallocate(file: &fs::File, size: u64) {
	use std::os::unix::io::AsRawFd;
	if size >= FALLOCATE_MIN {
		// Best effort: not every filesystem supports fallocate.
		unsafe {
			libc::fallocate(file.as_raw_fd(), 0, 0, size as libc::off_t);
		}
	}
}

#[cfg(not(target_os = "linux"))]
fn preallocate(_file: &fs::File, _size: u64) {}

/// Run `op`; if it fails over a conflicting existing entry, remove the
/// path recursively and try once more. Surfaced only if the second
/// attempt also fails.
fn with_clobber<T>(path: &Path, mut op: impl FnMut() -> std::io::Result<T>) -> Result<T, Error> {
	match op() {
		Ok(value) => Ok(value),
		Err(_) => {
			remove_path_any(path);
			op().map_err(|e| {
				Error::FilesystemConflict(path.display().to_string(), e.to_string())
			})
		}
	}
}

fn remove_path_any(path: &Path) {
	match fs::symlink_metadata(path) {
		Ok(meta) if meta.is_dir() => {
			let _ = fs::remove_dir_all(path);
		}
		Ok(_) => {
			let _ = fs::remove_file(path);
		}
		Err(_) => {}
	}
}

/// Deletion applied to disk: tolerate paths that are already gone, or
/// whose parent was replaced by a file.
fn remove_tolerant(path: &Path) -> Result<(), Error> {
	match fs::symlink_metadata(path) {
		Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map_err(Error::Io),
		Ok(_) => fs::remove_file(path).map_err(Error::Io),
		Err(e)
			if e.kind() == std::io::ErrorKind::NotFound
				|| e.raw_os_error() == Some(libc_notdir()) =>
		{
			Ok(())
		}
		Err(e) => Err(Error::Io(e)),
	}
}

#[cfg(target_os = "linux")]
fn libc_notdir() -> i32 {
	libc::ENOTDIR
}

#[cfg(not(target_os = "linux"))]
fn libc_notdir() -> i32 {
	20 // ENOTDIR on the BSDs and macOS as well
}

/// Create the directory chain above `rel`, clobbering any non-directory
/// entry found along the way.
fn ensure_parent_dirs(base: &Path, rel: &str) -> Result<(), Error> {
	let components: Vec<&str> = rel.trim_end_matches('/').split('/').collect();
	let mut current = base.to_path_buf();
	for component in &components[..components.len().saturating_sub(1)] {
		current.push(component);
		match fs::symlink_metadata(&current) {
			Ok(meta) if meta.is_dir() => {}
			Ok(_) => {
				remove_path_any(&current);
				fs::create_dir(&current)?;
			}
			Err(_) => match fs::create_dir(&current) {
				Ok(()) => {}
				Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
				Err(e) => return Err(Error::Io(e)),
			},
		}
	}
	Ok(())
}
