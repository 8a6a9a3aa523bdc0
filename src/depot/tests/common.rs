//! Shared fixture: a real server on an ephemeral port over a temporary
//! database, plus small tree helpers.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tokio::net::TcpListener;

use depot_db::Pool;
use depot_server::{service, Depot};

pub struct TestServer {
	pub addr: String,
	pub db_path: PathBuf,
	_dir: tempfile::TempDir,
	handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
	fn drop(&mut self) {
		self.handle.abort();
	}
}

pub async fn spawn_server() -> TestServer {
	let dir = tempfile::tempdir().unwrap();
	let db_path = dir.path().join("depot.db");
	let pool = Pool::open(&db_path).unwrap();
	let depot = Depot::new(pool);
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap().to_string();
	let handle = tokio::spawn(async move {
		let _ = service::serve(depot, listener).await;
	});
	TestServer {
		addr,
		db_path,
		_dir: dir,
		handle,
	}
}

pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
	for (rel, content) in files {
		let path = root.join(rel);
		fs::create_dir_all(path.parent().unwrap()).unwrap();
		fs::write(path, content).unwrap();
	}
}

/// Files and symlinks under `root`, keyed by relative path, skipping
/// the client state directory.
pub fn read_tree(root: &Path) -> BTreeMap<String, String> {
	let mut tree = BTreeMap::new();
	for entry in walkdir::WalkDir::new(root)
		.min_depth(1)
		.into_iter()
		.filter_entry(|e| e.file_name() != std::ffi::OsStr::new(".dl"))
	{
		let entry = entry.unwrap();
		let rel = entry
			.path()
			.strip_prefix(root)
			.unwrap()
			.to_string_lossy()
			.into_owned();
		if entry.file_type().is_symlink() {
			let target = fs::read_link(entry.path()).unwrap();
			tree.insert(rel, format!("-> {}", target.display()));
		} else if entry.file_type().is_file() {
			tree.insert(rel, fs::read_to_string(entry.path()).unwrap());
		}
	}
	tree
}
