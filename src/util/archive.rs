//! TAR primitives shared by the packer, the stream assembler and the
//! client-side applier.
//!
//! Members carry project-root-relative paths. Besides the POSIX entry
//! types, two custom typeflags extend the vocabulary on the wire:
//! `'D'` marks a deleted path in diff frames, `'C'` marks a packed
//! subtree to be linked from a local cache instead of carrying bytes.
//! Neither appears inside a stored pack blob.

use std::io::Read;

use tar::{Builder, EntryType, Header};

use crate::data::ContentHash;
use crate::error::Error;

/// Typeflag of a "delete this path" member.
pub const TYPE_DELETE: u8 = b'D';
/// Typeflag of a "link this subtree from the named cache hash" member.
pub const TYPE_CACHED: u8 = b'C';

const MODE_TYPE_MASK: u32 = 0o170000;
const MODE_PERM_MASK: u32 = 0o7777;

pub const MODE_REGULAR: u32 = 0o100000;
pub const MODE_DIRECTORY: u32 = 0o040000;
pub const MODE_SYMLINK: u32 = 0o120000;

pub fn is_regular(mode: u32) -> bool {
	mode & MODE_TYPE_MASK == MODE_REGULAR
}

pub fn is_directory(mode: u32) -> bool {
	mode & MODE_TYPE_MASK == MODE_DIRECTORY
}

pub fn is_symlink(mode: u32) -> bool {
	mode & MODE_TYPE_MASK == MODE_SYMLINK
}

/// Payload of one archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
	Regular(Vec<u8>),
	Symlink(String),
	Directory,
	Delete,
	Cached(ContentHash),
}

/// One archive member: a project-root-relative path, its mode, and its
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
	pub path: String,
	pub mode: u32,
	pub kind: EntryKind,
}

impl ArchiveEntry {
	/// The full POSIX mode, type bits included, implied by the entry.
	pub fn full_mode(&self) -> u32 {
		let perm = self.mode & MODE_PERM_MASK;
		match self.kind {
			EntryKind::Regular(_) => MODE_REGULAR | perm,
			EntryKind::Symlink(_) => MODE_SYMLINK | perm,
			EntryKind::Directory => MODE_DIRECTORY | perm,
			EntryKind::Delete | EntryKind::Cached(_) => self.mode,
		}
	}
}

/// Serializes members into an uncompressed TAR stream.
///
/// Header times and ownership are zeroed so that equal member sets
/// produce byte-identical streams.
pub struct ArchiveWriter {
	builder: Builder<Vec<u8>>,
}

impl ArchiveWriter {
	pub fn new() -> Self {
		ArchiveWriter {
			builder: Builder::new(Vec::new()),
		}
	}

	/// Bytes written so far, used to bound frame sizes.
	pub fn len(&self) -> usize {
		self.builder.get_ref().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn append(&mut self, entry: &ArchiveEntry) -> Result<(), Error> {
		let mut header = Header::new_gnu();
		header.set_mtime(0);
		header.set_uid(0);
		header.set_gid(0);
		header.set_mode(entry.mode & MODE_PERM_MASK);
		match &entry.kind {
			EntryKind::Regular(data) => {
				header.set_entry_type(EntryType::Regular);
				header.set_size(data.len() as u64);
				self.builder
					.append_data(&mut header, &entry.path, &data[..])?;
			}
			EntryKind::Symlink(target) => {
				header.set_entry_type(EntryType::Symlink);
				header.set_size(0);
				self.builder
					.append_link(&mut header, &entry.path, target.as_str())?;
			}
			EntryKind::Directory => {
				header.set_entry_type(EntryType::Directory);
				header.set_size(0);
				self.builder.append_data(&mut header, &entry.path, &[][..])?;
			}
			EntryKind::Delete => {
				header.set_entry_type(EntryType::new(TYPE_DELETE));
				header.set_size(0);
				self.builder.append_data(&mut header, &entry.path, &[][..])?;
			}
			EntryKind::Cached(hash) => {
				header.set_entry_type(EntryType::new(TYPE_CACHED));
				let hex = hash.to_hex();
				header.set_size(hex.len() as u64);
				self.builder
					.append_data(&mut header, &entry.path, hex.as_bytes())?;
			}
		}
		Ok(())
	}

	pub fn finish(self) -> Result<Vec<u8>, Error> {
		self.builder.into_inner().map_err(Error::from)
	}
}

impl Default for ArchiveWriter {
	fn default() -> Self {
		Self::new()
	}
}

/// Parse an uncompressed TAR stream back into its members.
pub fn parse(bytes: &[u8]) -> Result<Vec<ArchiveEntry>, Error> {
	let mut entries = Vec::new();
	let mut archive = tar::Archive::new(bytes);
	for entry in archive.entries()? {
		let mut entry = entry?;
		let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
		let perm = entry.header().mode()? & MODE_PERM_MASK;
		let entry_type = entry.header().entry_type();
		let parsed = match entry_type {
			EntryType::Regular | EntryType::Continuous => {
				let mut data = Vec::with_capacity(entry.size() as usize);
				entry.read_to_end(&mut data)?;
				ArchiveEntry {
					path,
					mode: MODE_REGULAR | perm,
					kind: EntryKind::Regular(data),
				}
			}
			EntryType::Directory => ArchiveEntry {
				path,
				mode: MODE_DIRECTORY | perm,
				kind: EntryKind::Directory,
			},
			EntryType::Symlink => {
				let target = entry
					.link_name()?
					.ok_or_else(|| Error::Encoding(format!("symlink {} without target", path)))?;
				ArchiveEntry {
					path,
					mode: MODE_SYMLINK | perm,
					kind: EntryKind::Symlink(target.to_string_lossy().into_owned()),
				}
			}
			other if other.as_byte() == TYPE_DELETE => ArchiveEntry {
				path,
				mode: 0,
				kind: EntryKind::Delete,
			},
			other if other.as_byte() == TYPE_CACHED => {
				let mut hex = String::new();
				entry.read_to_string(&mut hex)?;
				let hash = ContentHash::from_hex(hex.trim())
					.ok_or_else(|| Error::Encoding(format!("bad cache hash for {}", path)))?;
				ArchiveEntry {
					path,
					mode: MODE_DIRECTORY,
					kind: EntryKind::Cached(hash),
				}
			}
			other => {
				return Err(Error::Encoding(format!(
					"unexpected tar entry type {:?} at {}",
					other, path
				)));
			}
		};
		entries.push(parsed);
	}
	Ok(entries)
}
