//! Typed RPC client over the framed transport.

use tokio::net::TcpStream;

use depot_rpc::framing::{self, FrameReader, FrameWriter};
use depot_rpc::{
	status_error, ObjectQuery, ProjectInfo, Request, Response, TarFrame, WireObject,
};
use depot_util::data::ContentHash;
use depot_util::error::Error;

/// One connection to a depot server. Requests are issued sequentially;
/// server streams are consumed to their terminator before the next
/// request starts.
pub struct Client {
	reader: FrameReader,
	writer: FrameWriter,
}

impl Client {
	pub async fn connect(addr: &str) -> Result<Client, Error> {
		let stream = TcpStream::connect(addr)
			.await
			.map_err(|e| Error::Transient(format!("connect to {}: {}", addr, e)))?;
		stream.set_nodelay(true).ok();
		let (reader, writer) = framing::split(stream);
		Ok(Client { reader, writer })
	}

	async fn recv_response(&mut self) -> Result<Response, Error> {
		match framing::recv::<Response>(&mut self.reader).await? {
			Some(Response::Error { code, message }) => Err(status_error(code, message)),
			Some(response) => Ok(response),
			None => Err(Error::Transient("connection closed".to_string())),
		}
	}

	async fn call(&mut self, request: &Request) -> Result<Response, Error> {
		framing::send(&mut self.writer, request).await?;
		self.recv_response().await
	}

	fn unexpected(response: Response) -> Error {
		Error::Encoding(format!("unexpected response: {:?}", response))
	}

	pub async fn new_project(
		&mut self,
		project: i64,
		pack_patterns: Vec<String>,
		template: Option<i64>,
		template_version: Option<i64>,
	) -> Result<(), Error> {
		match self
			.call(&Request::NewProject {
				project,
				pack_patterns,
				template,
				template_version,
			})
			.await?
		{
			Response::Ok => Ok(()),
			other => Err(Self::unexpected(other)),
		}
	}

	pub async fn delete_project(&mut self, project: i64) -> Result<(), Error> {
		match self.call(&Request::DeleteProject { project }).await? {
			Response::Ok => Ok(()),
			other => Err(Self::unexpected(other)),
		}
	}

	pub async fn list_projects(&mut self) -> Result<Vec<ProjectInfo>, Error> {
		match self.call(&Request::ListProjects).await? {
			Response::Projects(projects) => Ok(projects),
			other => Err(Self::unexpected(other)),
		}
	}

	/// Client-streamed update. Returns the committed version, `-1` when
	/// the server found nothing to change.
	pub async fn update(&mut self, project: i64, objects: Vec<WireObject>) -> Result<i64, Error> {
		framing::send(&mut self.writer, &Request::Update { project }).await?;
		for object in objects {
			framing::send(&mut self.writer, &Request::UpdateObject { object }).await?;
		}
		framing::send(&mut self.writer, &Request::UpdateDone).await?;
		match self.recv_response().await? {
			Response::Version { version } => Ok(version),
			other => Err(Self::unexpected(other)),
		}
	}

	/// Server-streamed `Get`, collected. Returns the resolved version
	/// and the records.
	pub async fn get(
		&mut self,
		project: i64,
		from_version: i64,
		to_version: Option<i64>,
		queries: Vec<ObjectQuery>,
	) -> Result<(i64, Vec<WireObject>), Error> {
		framing::send(
			&mut self.writer,
			&Request::Get {
				project,
				from_version,
				to_version,
				queries,
			},
		)
		.await?;
		let mut objects = Vec::new();
		loop {
			match self.recv_response().await? {
				Response::Object { object } => objects.push(object),
				Response::End { version } => return Ok((version, objects)),
				other => return Err(Self::unexpected(other)),
			}
		}
	}

	pub async fn get_unary(
		&mut self,
		project: i64,
		from_version: i64,
		to_version: Option<i64>,
		queries: Vec<ObjectQuery>,
	) -> Result<(i64, Vec<WireObject>), Error> {
		match self
			.call(&Request::GetUnary {
				project,
				from_version,
				to_version,
				queries,
			})
			.await?
		{
			Response::Objects { version, objects } => Ok((version, objects)),
			other => Err(Self::unexpected(other)),
		}
	}

	/// Server-streamed `GetCompress`. `apply` runs per frame; on its
	/// first error the rest of the stream is drained and the error
	/// returned.
	pub async fn get_compress(
		&mut self,
		project: i64,
		from_version: i64,
		to_version: Option<i64>,
		queries: Vec<ObjectQuery>,
		cache_versions: Vec<i64>,
		apply: &mut dyn FnMut(TarFrame) -> Result<(), Error>,
	) -> Result<i64, Error> {
		framing::send(
			&mut self.writer,
			&Request::GetCompress {
				project,
				from_version,
				to_version,
				queries,
				cache_versions,
			},
		)
		.await?;
		let mut failed: Option<Error> = None;
		loop {
			match self.recv_response().await {
				Ok(Response::Frame(frame)) => {
					if failed.is_none() {
						if let Err(e) = apply(frame) {
							failed = Some(e);
						}
					}
				}
				Ok(Response::End { version }) => {
					return match failed {
						Some(e) => Err(e),
						None => Ok(version),
					};
				}
				Ok(other) => return Err(Self::unexpected(other)),
				Err(e) => return Err(failed.unwrap_or(e)),
			}
		}
	}

	/// Server-streamed `GetCache`. Returns the cache versions the
	/// stream materialized.
	pub async fn get_cache(
		&mut self,
		version: Option<i64>,
		apply: &mut dyn FnMut(ContentHash, Vec<u8>) -> Result<(), Error>,
	) -> Result<Vec<i64>, Error> {
		framing::send(&mut self.writer, &Request::GetCache { version }).await?;
		let mut failed: Option<Error> = None;
		loop {
			match self.recv_response().await {
				Ok(Response::CacheBlob { hash, bytes }) => {
					if failed.is_none() {
						if let Err(e) = apply(hash, bytes.into_vec()) {
							failed = Some(e);
						}
					}
				}
				Ok(Response::CacheEnd { versions }) => {
					return match failed {
						Some(e) => Err(e),
						None => Ok(versions),
					};
				}
				Ok(other) => return Err(Self::unexpected(other)),
				Err(e) => return Err(failed.unwrap_or(e)),
			}
		}
	}

	pub async fn rollback(&mut self, project: i64, version: i64) -> Result<(), Error> {
		match self.call(&Request::Rollback { project, version }).await? {
			Response::Ok => Ok(()),
			other => Err(Self::unexpected(other)),
		}
	}

	/// Returns `(latest_version, live_objects, total_bytes)`.
	pub async fn inspect(&mut self, project: i64) -> Result<(i64, i64, i64), Error> {
		match self.call(&Request::Inspect { project }).await? {
			Response::InspectResult {
				latest_version,
				live_objects,
				total_bytes,
				..
			} => Ok((latest_version, live_objects, total_bytes)),
			other => Err(Self::unexpected(other)),
		}
	}

	pub async fn snapshot(&mut self) -> Result<Vec<(i64, i64)>, Error> {
		match self.call(&Request::Snapshot).await? {
			Response::SnapshotResult { projects } => Ok(projects),
			other => Err(Self::unexpected(other)),
		}
	}

	pub async fn reset(&mut self, projects: Vec<(i64, i64)>) -> Result<(), Error> {
		match self.call(&Request::Reset { projects }).await? {
			Response::Ok => Ok(()),
			other => Err(Self::unexpected(other)),
		}
	}

	pub async fn gc_project(&mut self, project: i64, keep_versions: i64) -> Result<i64, Error> {
		match self
			.call(&Request::GcProject {
				project,
				keep_versions,
			})
			.await?
		{
			Response::GcResult { removed } => Ok(removed),
			other => Err(Self::unexpected(other)),
		}
	}

	pub async fn gc_random_projects(
		&mut self,
		count: i64,
		keep_versions: i64,
	) -> Result<i64, Error> {
		match self
			.call(&Request::GcRandomProjects {
				count,
				keep_versions,
			})
			.await?
		{
			Response::GcResult { removed } => Ok(removed),
			other => Err(Self::unexpected(other)),
		}
	}

	pub async fn gc_contents(&mut self) -> Result<i64, Error> {
		match self.call(&Request::GcContents).await? {
			Response::GcResult { removed } => Ok(removed),
			other => Err(Self::unexpected(other)),
		}
	}

	pub async fn clone_to_project(
		&mut self,
		source: i64,
		version: i64,
		target: i64,
	) -> Result<i64, Error> {
		match self
			.call(&Request::CloneToProject {
				source,
				version,
				target,
			})
			.await?
		{
			Response::Version { version } => Ok(version),
			other => Err(Self::unexpected(other)),
		}
	}
}
