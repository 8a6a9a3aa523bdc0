//! Length-delimited MessagePack framing over TCP.
//!
//! Every message is one frame: a 4-byte big-endian length prefix
//! followed by the MessagePack encoding of a [`Request`](crate::Request)
//! or [`Response`](crate::Response). Server streams are sequences of
//! frames on the same connection, terminated by an `End` (or error)
//! frame.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use depot_util::error::Error;

/// Upper bound on one frame; large pack blobs fit comfortably.
pub const MAX_FRAME_LENGTH: usize = 256 << 20;

pub type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
pub type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

fn codec() -> LengthDelimitedCodec {
	LengthDelimitedCodec::builder()
		.max_frame_length(MAX_FRAME_LENGTH)
		.new_codec()
}

/// Split a connection into framed halves.
pub fn split(stream: TcpStream) -> (FrameReader, FrameWriter) {
	let (read, write) = stream.into_split();
	(
		FramedRead::new(read, codec()),
		FramedWrite::new(write, codec()),
	)
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes, Error> {
	let bytes = rmp_serde::to_vec_named(msg)?;
	Ok(Bytes::from(bytes))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
	Ok(rmp_serde::from_slice(bytes)?)
}

/// Send one message as a frame.
pub async fn send<T: Serialize>(writer: &mut FrameWriter, msg: &T) -> Result<(), Error> {
	let frame = encode(msg)?;
	writer
		.send(frame)
		.await
		.map_err(|e| Error::Transient(format!("send failed: {}", e)))
}

/// Receive the next frame, or `None` on a cleanly closed connection.
pub async fn recv<T: DeserializeOwned>(reader: &mut FrameReader) -> Result<Option<T>, Error> {
	match reader.next().await {
		None => Ok(None),
		Some(Err(e)) => Err(Error::Transient(format!("receive failed: {}", e))),
		Some(Ok(frame)) => decode(&frame).map(Some),
	}
}
