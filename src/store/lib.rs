//! Storage primitives for the depot file service: deduplicated content
//! rows, per-path version intervals, project rows and directory packing.

#[macro_use]
extern crate tracing;

pub mod content;
pub mod object;
pub mod pack;
pub mod project;

pub use depot_util::data::{VERSION_NEVER_WRITTEN, VERSION_NO_CHANGE};
