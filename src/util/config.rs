//! Reading the server configuration file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Error;

/// Depot server configuration, read from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	/// Path of the SQLite database holding projects, objects and contents
	pub db_path: PathBuf,

	/// Address and port for the RPC service
	pub bind_addr: SocketAddr,

	/// Path prefix scanned by the cache builder
	#[serde(default = "default_cache_prefix")]
	pub cache_prefix: String,
}

fn default_cache_prefix() -> String {
	"node_modules/".to_string()
}

/// Read and parse the configuration file at `path`.
pub fn read_config(path: &Path) -> Result<Config, Error> {
	let data = std::fs::read_to_string(path)?;
	toml::from_str(&data).map_err(|e| Error::Message(format!("config file {:?}: {}", path, e)))
}
