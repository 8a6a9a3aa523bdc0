//! The TCP service: accepts connections, decodes request frames and
//! binds them to the engines.
//!
//! Server streams run their database cursor on a blocking thread and
//! emit through a bounded channel; the channel is the backpressure
//! seam, so a slow client slows its own producer and nothing else.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use depot_rpc::framing::{self, FrameReader, FrameWriter};
use depot_rpc::{status_of, Request, Response, WireObject};
use depot_util::error::Error;

use crate::{cache, manage, query, update, Depot};

/// Frames buffered between a producer and the socket writer.
const STREAM_BUFFER: usize = 16;

/// Request context exposed by the transport to the engines.
///
/// Authentication is out of scope; the subject is whatever the
/// transport learned about the peer.
#[derive(Debug, Clone, Default)]
pub struct Context {
	pub subject: Option<String>,
	pub project: Option<i64>,
}

/// Accept loop. Runs until the listener is closed or the task is
/// aborted.
pub async fn serve(depot: Arc<Depot>, listener: TcpListener) -> Result<(), Error> {
	info!("listening on {}", listener.local_addr()?);
	loop {
		let (stream, peer) = listener.accept().await?;
		let depot = depot.clone();
		tokio::spawn(async move {
			debug!("connection from {}", peer);
			if let Err(e) = handle_connection(depot, stream).await {
				debug!("connection from {} ended: {}", peer, e);
			}
		});
	}
}

async fn handle_connection(depot: Arc<Depot>, stream: TcpStream) -> Result<(), Error> {
	let (mut reader, mut writer) = framing::split(stream);
	while let Some(request) = framing::recv::<Request>(&mut reader).await? {
		let ctx = Context {
			subject: None,
			project: request_project(&request),
		};
		if let Err(e) = dispatch(&depot, &ctx, request, &mut reader, &mut writer).await {
			warn!("request failed (project {:?}): {}", ctx.project, e);
			let response = Response::Error {
				code: status_of(&e),
				message: e.to_string(),
			};
			framing::send(&mut writer, &response).await?;
		}
	}
	Ok(())
}

fn request_project(request: &Request) -> Option<i64> {
	match request {
		Request::NewProject { project, .. }
		| Request::DeleteProject { project }
		| Request::Get { project, .. }
		| Request::GetUnary { project, .. }
		| Request::GetCompress { project, .. }
		| Request::Update { project }
		| Request::Rollback { project, .. }
		| Request::Inspect { project }
		| Request::GcProject { project, .. } => Some(*project),
		Request::CloneToProject { source, .. } => Some(*source),
		_ => None,
	}
}

/// Run one blocking engine call on a worker thread.
async fn run_blocking<T, F>(depot: &Arc<Depot>, f: F) -> Result<T, Error>
where
	T: Send + 'static,
	F: FnOnce(&Depot) -> Result<T, Error> + Send + 'static,
{
	let depot = depot.clone();
	tokio::task::spawn_blocking(move || f(&depot))
		.await
		.map_err(|e| Error::Message(format!("worker task failed: {}", e)))?
}

async fn dispatch(
	depot: &Arc<Depot>,
	ctx: &Context,
	request: Request,
	reader: &mut FrameReader,
	writer: &mut FrameWriter,
) -> Result<(), Error> {
	match request {
		Request::NewProject {
			project,
			pack_patterns,
			template,
			template_version,
		} => {
			run_blocking(depot, move |d| {
				manage::new_project(&d.pool, project, &pack_patterns, template, template_version)
			})
			.await?;
			framing::send(writer, &Response::Ok).await
		}

		Request::DeleteProject { project } => {
			run_blocking(depot, move |d| manage::delete_project(&d.pool, project)).await?;
			framing::send(writer, &Response::Ok).await
		}

		Request::ListProjects => {
			let projects = run_blocking(depot, |d| manage::list_projects(&d.pool)).await?;
			framing::send(writer, &Response::Projects(projects)).await
		}

		Request::Get {
			project,
			from_version,
			to_version,
			queries,
		} => {
			let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
			let producer = {
				let depot = depot.clone();
				tokio::task::spawn_blocking(move || {
					query::get_objects(
						&depot.pool,
						project,
						from_version,
						to_version,
						&queries,
						&mut |object| tx.blocking_send(Response::Object { object }).is_ok(),
					)
				})
			};
			while let Some(response) = rx.recv().await {
				framing::send(writer, &response).await?;
			}
			let version = producer
				.await
				.map_err(|e| Error::Message(format!("worker task failed: {}", e)))??;
			framing::send(writer, &Response::End { version }).await
		}

		Request::GetUnary {
			project,
			from_version,
			to_version,
			queries,
		} => {
			let (version, objects) = run_blocking(depot, move |d| {
				query::get_unary(&d.pool, project, from_version, to_version, &queries)
			})
			.await?;
			framing::send(writer, &Response::Objects { version, objects }).await
		}

		Request::GetCompress {
			project,
			from_version,
			to_version,
			queries,
			cache_versions,
		} => {
			let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
			let producer = {
				let depot = depot.clone();
				tokio::task::spawn_blocking(move || {
					query::get_compress(
						&depot.pool,
						project,
						from_version,
						to_version,
						&queries,
						&cache_versions,
						&mut |frame| tx.blocking_send(Response::Frame(frame)).is_ok(),
					)
				})
			};
			while let Some(response) = rx.recv().await {
				framing::send(writer, &response).await?;
			}
			let version = producer
				.await
				.map_err(|e| Error::Message(format!("worker task failed: {}", e)))??;
			framing::send(writer, &Response::End { version }).await
		}

		Request::Update { project } => {
			let objects = recv_update_stream(reader).await?;
			debug!(
				"update stream for project {:?}: {} objects",
				ctx.project,
				objects.len()
			);
			// Per-project advisory lock held for the whole transaction.
			let _guard = depot.locks.lock(project).await;
			let version =
				run_blocking(depot, move |d| update::apply(&d.pool, project, &objects)).await?;
			framing::send(writer, &Response::Version { version }).await
		}

		Request::UpdateObject { .. } | Request::UpdateDone => Err(Error::Invariant(
			"update stream frame outside an update".to_string(),
		)),

		Request::Rollback { project, version } => {
			let _guard = depot.locks.lock(project).await;
			run_blocking(depot, move |d| manage::rollback(&d.pool, project, version)).await?;
			framing::send(writer, &Response::Ok).await
		}

		Request::Inspect { project } => {
			let (latest_version, live_objects, total_bytes) =
				run_blocking(depot, move |d| manage::inspect(&d.pool, project)).await?;
			framing::send(
				writer,
				&Response::InspectResult {
					project,
					latest_version,
					live_objects,
					total_bytes,
				},
			)
			.await
		}

		Request::Snapshot => {
			let projects = run_blocking(depot, |d| manage::snapshot(&d.pool)).await?;
			framing::send(writer, &Response::SnapshotResult { projects }).await
		}

		Request::Reset { projects } => {
			run_blocking(depot, move |d| manage::reset(&d.pool, &projects)).await?;
			framing::send(writer, &Response::Ok).await
		}

		Request::GcProject {
			project,
			keep_versions,
		} => {
			let removed = run_blocking(depot, move |d| {
				manage::gc_project(&d.pool, project, keep_versions)
			})
			.await?;
			framing::send(writer, &Response::GcResult { removed }).await
		}

		Request::GcRandomProjects {
			count,
			keep_versions,
		} => {
			let removed = run_blocking(depot, move |d| {
				manage::gc_random_projects(&d.pool, count, keep_versions)
			})
			.await?;
			framing::send(writer, &Response::GcResult { removed }).await
		}

		Request::GcContents => {
			let removed = run_blocking(depot, |d| manage::gc_contents(&d.pool)).await?;
			framing::send(writer, &Response::GcResult { removed }).await
		}

		Request::CloneToProject {
			source,
			version,
			target,
		} => {
			let _guard = depot.locks.lock(target).await;
			let latest = run_blocking(depot, move |d| {
				manage::clone_to_project(&d.pool, source, version, target)
			})
			.await?;
			framing::send(writer, &Response::Version { version: latest }).await
		}

		Request::GetCache { version } => {
			let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
			let producer = {
				let depot = depot.clone();
				tokio::task::spawn_blocking(move || {
					cache::get_cache(&depot.pool, version, &mut |hash, bytes| {
						tx.blocking_send(Response::CacheBlob {
							hash,
							bytes: serde_bytes::ByteBuf::from(bytes),
						})
						.is_ok()
					})
				})
			};
			while let Some(response) = rx.recv().await {
				framing::send(writer, &response).await?;
			}
			let versions = producer
				.await
				.map_err(|e| Error::Message(format!("worker task failed: {}", e)))??;
			framing::send(writer, &Response::CacheEnd { versions }).await
		}
	}
}

/// Collect a client-streamed update: `UpdateObject` frames terminated
/// by `UpdateDone`.
async fn recv_update_stream(reader: &mut FrameReader) -> Result<Vec<WireObject>, Error> {
	let mut objects = Vec::new();
	loop {
		match framing::recv::<Request>(reader).await? {
			Some(Request::UpdateObject { object }) => objects.push(object),
			Some(Request::UpdateDone) => return Ok(objects),
			Some(_) => {
				return Err(Error::Invariant(
					"unexpected message inside an update stream".to_string(),
				))
			}
			None => {
				return Err(Error::Transient(
					"connection closed mid-update".to_string(),
				))
			}
		}
	}
}
