//! Server-side engines of the depot file service: query resolution,
//! transactional updates, cache building and the RPC dispatch loop.

#[macro_use]
extern crate tracing;

pub mod cache;
pub mod manage;
pub mod query;
pub mod service;
pub mod update;

use std::sync::Arc;

use depot_db::Pool;

use crate::update::ProjectLocks;

/// Shared server state handed to every request task.
pub struct Depot {
	pub pool: Pool,
	pub(crate) locks: ProjectLocks,
}

impl Depot {
	pub fn new(pool: Pool) -> Arc<Depot> {
		Arc::new(Depot {
			pool,
			locks: ProjectLocks::new(),
		})
	}
}
