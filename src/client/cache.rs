//! Local mirror of server cache versions.
//!
//! Layout under the cache root: `objects/<hex-hash>/<pack-root>/...`
//! holds the extracted packed subtrees, `versions` lists every cache
//! version installed, and `.lock` excludes concurrent mutators. The
//! mirror is read-only in steady state, so rebuilds hardlink or reflink
//! out of it concurrently without any locking.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use depot_util::archive;
use depot_util::codec;
use depot_util::data::ContentHash;
use depot_util::error::Error;

use crate::rebuild::materialize_entry;
use crate::remote::Client;

/// How files are cloned out of the cache into working trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMethod {
	Hardlink,
	Reflink,
}

pub struct CacheDir {
	root: PathBuf,
	link: LinkMethod,
}

impl CacheDir {
	/// Open (creating if needed) a cache directory, probing once
	/// whether the filesystem supports reflinks.
	pub fn open(root: &Path) -> Result<CacheDir, Error> {
		fs::create_dir_all(root.join("objects"))?;
		let link = probe_reflink(root);
		Ok(CacheDir {
			root: root.to_path_buf(),
			link,
		})
	}

	pub fn link_method(&self) -> LinkMethod {
		self.link
	}

	fn versions_path(&self) -> PathBuf {
		self.root.join("versions")
	}

	fn lock_path(&self) -> PathBuf {
		self.root.join(".lock")
	}

	pub fn object_dir(&self, hash: &ContentHash) -> PathBuf {
		self.root.join("objects").join(hash.to_hex())
	}

	/// Cache versions installed locally.
	pub fn versions(&self) -> Result<Vec<i64>, Error> {
		match fs::read_to_string(self.versions_path()) {
			Ok(text) => Ok(text
				.lines()
				.filter(|l| !l.is_empty())
				.filter_map(|l| l.parse().ok())
				.collect()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
			Err(e) => Err(Error::Io(e)),
		}
	}

	/// Mirror one server cache version (latest when `None`) onto disk.
	///
	/// Takes the exclusive cache lock for the duration; failing to
	/// acquire it is a hard error.
	pub async fn populate(
		&self,
		client: &mut Client,
		version: Option<i64>,
	) -> Result<Vec<i64>, Error> {
		let lock = fs::OpenOptions::new()
			.create(true)
			.write(true)
			.open(self.lock_path())?;
		lock.try_lock_exclusive().map_err(|_| {
			Error::Conflict(format!(
				"cache directory {:?} is locked by another process",
				self.root
			))
		})?;

		let versions = client
			.get_cache(version, &mut |hash, bytes| self.install_blob(&hash, &bytes))
			.await?;

		let mut installed = self.versions()?;
		for v in &versions {
			if !installed.contains(v) {
				installed.push(*v);
			}
		}
		installed.sort_unstable();
		let mut text = String::new();
		for v in &installed {
			text.push_str(&format!("{}\n", v));
		}
		let tmp = self.root.join("versions.tmp");
		let mut file = fs::File::create(&tmp)?;
		file.write_all(text.as_bytes())?;
		file.sync_all()?;
		fs::rename(&tmp, self.versions_path())?;

		info!(
			"cache {:?}: installed versions {:?}",
			self.root, versions
		);
		let _ = lock.unlock();
		Ok(versions)
	}

	/// Extract one packed blob under `objects/<hex>/`, atomically via a
	/// temporary sibling. Already-present blobs are skipped.
	fn install_blob(&self, hash: &ContentHash, bytes: &[u8]) -> Result<(), Error> {
		let dest = self.object_dir(hash);
		if dest.exists() {
			return Ok(());
		}
		let tar = codec::decompress(bytes)?;
		let entries = archive::parse(&tar)?;

		let tmp = self.root.join("objects").join(format!(".{}.tmp", hash.to_hex()));
		if tmp.exists() {
			fs::remove_dir_all(&tmp)?;
		}
		fs::create_dir_all(&tmp)?;
		for entry in &entries {
			materialize_entry(&tmp, entry)?;
		}
		fs::rename(&tmp, &dest)?;
		debug!("cache: installed pack {}", hash);
		Ok(())
	}

	/// Clone the subtree `<hash>/<subtree>` into `dest`, mirroring
	/// directories and symlinks and linking every regular file.
	pub fn link_tree(&self, hash: &ContentHash, subtree: &str, dest: &Path) -> Result<(), Error> {
		let src = self.object_dir(hash).join(subtree.trim_end_matches('/'));
		if !src.is_dir() {
			return Err(Error::NotFound(format!(
				"cache has no subtree {} for hash {}",
				subtree, hash
			)));
		}
		link_recursive(&src, dest, self.link)
	}
}

fn link_recursive(src: &Path, dest: &Path, method: LinkMethod) -> Result<(), Error> {
	let meta = fs::metadata(src)?;
	fs::create_dir_all(dest)?;
	fs::set_permissions(dest, meta.permissions())?;
	for entry in fs::read_dir(src)? {
		let entry = entry?;
		let src_path = entry.path();
		let dest_path = dest.join(entry.file_name());
		let file_type = entry.file_type()?;
		if file_type.is_dir() {
			link_recursive(&src_path, &dest_path, method)?;
		} else if file_type.is_symlink() {
			let target = fs::read_link(&src_path)?;
			std::os::unix::fs::symlink(&target, &dest_path)?;
		} else {
			link_file(&src_path, &dest_path, method)?;
		}
	}
	Ok(())
}

fn link_file(src: &Path, dest: &Path, method: LinkMethod) -> Result<(), Error> {
	match method {
		LinkMethod::Hardlink => fs::hard_link(src, dest).map_err(Error::Io),
		LinkMethod::Reflink => match reflink_copy::reflink(src, dest) {
			Ok(()) => Ok(()),
			// The probe passed but this file still would not clone;
			// hardlinking preserves the sharing guarantee.
			Err(_) => fs::hard_link(src, dest).map_err(Error::Io),
		},
	}
}

/// One-shot probe: can this filesystem clone files copy-on-write?
fn probe_reflink(root: &Path) -> LinkMethod {
	let src = root.join(".reflink-probe-src");
	let dst = root.join(".reflink-probe-dst");
	let _ = fs::remove_file(&dst);
	let supported = fs::write(&src, b"probe")
		.map_err(Error::Io)
		.and_then(|_| reflink_copy::reflink(&src, &dst).map_err(Error::Io))
		.is_ok();
	let _ = fs::remove_file(&src);
	let _ = fs::remove_file(&dst);
	if supported {
		LinkMethod::Reflink
	} else {
		info!("reflink not supported under {:?}, falling back to hardlink", root);
		LinkMethod::Hardlink
	}
}
