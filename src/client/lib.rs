//! Client side of the depot file service: snapshotting a working tree
//! into the store (`push`) and materializing store versions back onto
//! disk (`rebuild`), with a shared local cache of packed subtrees.

#[macro_use]
extern crate tracing;

pub mod cache;
pub mod rebuild;
pub mod remote;
pub mod workdir;

pub use cache::CacheDir;
pub use rebuild::rebuild;
pub use remote::Client;
pub use workdir::{push, WorkDir};
