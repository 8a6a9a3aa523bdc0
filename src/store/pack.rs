//! Merging object streams into pack blobs.
//!
//! A pack blob is an uncompressed TAR (compression happens in the
//! content store) holding every live member under one pack root. Any
//! update touching a member rewrites the whole pack; packs target
//! directories whose members change together.

use std::collections::BTreeMap;

use depot_util::archive::{self, ArchiveEntry, EntryKind};
use depot_util::error::Error;

/// Overlay `incoming` objects onto the members of the current pack blob.
///
/// Same-path entries replace; deletions drop the member and are not
/// retained. Members are serialized sorted by path, so equal member sets
/// produce byte-identical blobs. Returns `None` when no members remain.
pub fn merge(current: Option<&[u8]>, incoming: &[ArchiveEntry]) -> Result<Option<Vec<u8>>, Error> {
	let mut members: BTreeMap<String, ArchiveEntry> = BTreeMap::new();
	if let Some(bytes) = current {
		for entry in archive::parse(bytes)? {
			members.insert(entry.path.clone(), entry);
		}
	}
	for entry in incoming {
		match entry.kind {
			EntryKind::Delete => {
				members.remove(&entry.path);
			}
			EntryKind::Cached(_) => {
				return Err(Error::Invariant(format!(
					"cache placeholder {} cannot be stored in a pack",
					entry.path
				)));
			}
			_ => {
				members.insert(entry.path.clone(), entry.clone());
			}
		}
	}
	if members.is_empty() {
		return Ok(None);
	}
	let mut writer = archive::ArchiveWriter::new();
	for entry in members.values() {
		writer.append(entry)?;
	}
	writer.finish().map(Some)
}

#[cfg(test)]
mod tests {
	use super::*;
	use depot_util::archive::{MODE_DIRECTORY, MODE_REGULAR};

	fn file(path: &str, data: &[u8]) -> ArchiveEntry {
		ArchiveEntry {
			path: path.to_string(),
			mode: MODE_REGULAR | 0o644,
			kind: EntryKind::Regular(data.to_vec()),
		}
	}

	fn deletion(path: &str) -> ArchiveEntry {
		ArchiveEntry {
			path: path.to_string(),
			mode: 0,
			kind: EntryKind::Delete,
		}
	}

	#[test]
	fn test_merge_from_scratch_sorts_members() {
		let blob = merge(None, &[file("a/d", b"d"), file("a/c", b"c")])
			.unwrap()
			.unwrap();
		let members = archive::parse(&blob).unwrap();
		let paths: Vec<_> = members.iter().map(|m| m.path.as_str()).collect();
		assert_eq!(paths, vec!["a/c", "a/d"]);
	}

	#[test]
	fn test_merge_replaces_and_keeps() {
		let v1 = merge(None, &[file("a/c", b"c v1"), file("a/d", b"d v1")])
			.unwrap()
			.unwrap();
		let v2 = merge(Some(&v1), &[file("a/c", b"c v2")]).unwrap().unwrap();

		let members = archive::parse(&v2).unwrap();
		assert_eq!(members.len(), 2);
		assert_eq!(members[0].kind, EntryKind::Regular(b"c v2".to_vec()));
		assert_eq!(members[1].kind, EntryKind::Regular(b"d v1".to_vec()));
	}

	#[test]
	fn test_merge_drops_deleted_members() {
		let v1 = merge(None, &[file("a/c", b"c"), file("a/d", b"d")])
			.unwrap()
			.unwrap();
		let v2 = merge(Some(&v1), &[deletion("a/c")]).unwrap().unwrap();
		let members = archive::parse(&v2).unwrap();
		assert_eq!(members.len(), 1);
		assert_eq!(members[0].path, "a/d");

		// Deleting the last member empties the pack.
		assert!(merge(Some(&v2), &[deletion("a/d")]).unwrap().is_none());
	}

	#[test]
	fn test_merge_is_deterministic() {
		let base = merge(None, &[file("a/x", b"x"), file("a/y", b"y")])
			.unwrap()
			.unwrap();
		let one = merge(Some(&base), &[file("a/z", b"z")]).unwrap().unwrap();
		let two = merge(Some(&base), &[file("a/z", b"z")]).unwrap().unwrap();
		assert_eq!(one, two);
	}

	#[test]
	fn test_merge_keeps_directories_and_symlinks() {
		let entries = vec![
			ArchiveEntry {
				path: "a/empty/".into(),
				mode: MODE_DIRECTORY | 0o755,
				kind: EntryKind::Directory,
			},
			ArchiveEntry {
				path: "a/link".into(),
				mode: 0o120777,
				kind: EntryKind::Symlink("empty".into()),
			},
		];
		let blob = merge(None, &entries).unwrap().unwrap();
		assert_eq!(archive::parse(&blob).unwrap(), entries);
	}
}
