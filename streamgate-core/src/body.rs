//! Streaming HTTP response bodies.
//!
//! The byte streamer (C4) produces chunks lazily and needs to hand them to
//! hyper as they become available rather than buffering the whole range in
//! memory. [`ByteStream`] is an mpsc-channel-backed body: a background task
//! pushes chunks into the sender half while hyper drains the receiver half
//! as the socket becomes writable.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Boxed body type used for every response the gateway returns.
pub type ResponseBody = BoxBody<Bytes, std::io::Error>;

/// Boxed body type used for every *request* the gateway accepts. Hyper
/// hands us a concrete `Incoming` per connection; boxing it at the edge
/// (see `streamgate`'s server accept loop) keeps the rest of the stack —
/// and its tests — independent of hyper's connection internals.
pub type RequestBody = BoxBody<Bytes, hyper::Error>;

/// Box up a hyper `Incoming` body into the gateway's request body type.
pub fn box_incoming(incoming: Incoming) -> RequestBody {
    incoming.boxed()
}

/// An empty body, for responses with no content (e.g. 204, 304, HEAD).
pub fn empty_body() -> ResponseBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// A body made of a single, already-in-memory buffer.
pub fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Sender half of a lazily-produced response body. Each `send` suspends
/// until hyper has room in its write buffer (backpressure), which is what
/// lets the byte streamer observe a slow/stalled client without buffering
/// the whole range.
#[derive(Clone)]
pub struct ByteStreamSender {
    tx: mpsc::Sender<std::io::Result<Bytes>>,
}

impl ByteStreamSender {
    pub async fn send(&self, chunk: Bytes) -> bool {
        self.tx.send(Ok(chunk)).await.is_ok()
    }

    pub async fn send_error(&self, err: std::io::Error) {
        let _ = self.tx.send(Err(err)).await;
    }
}

/// Create a streaming body and the sender used to feed it. Buffer size of
/// 8 gives a few chunks of read-ahead (chunk_size is typically 512KiB, so
/// this caps in-flight memory at a few MiB per stream) without unbounded
/// buffering.
pub fn streaming_body() -> (ResponseBody, ByteStreamSender) {
    let (tx, rx) = mpsc::channel(8);
    let stream = ReceiverStream::new(rx).map(|result| result.map(Frame::data));
    let body = StreamBody::new(stream).boxed();
    (body, ByteStreamSender { tx })
}

/// Read an inbound request body fully into memory. Only used for the
/// small, non-streaming routes (status/watch/thumb); `/dl` never reads a
/// request body.
pub async fn read_to_bytes(body: RequestBody) -> Result<Bytes, hyper::Error> {
    Ok(body.collect().await?.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt as _;

    #[tokio::test]
    async fn streaming_body_delivers_chunks_in_order() {
        let (body, sender) = streaming_body();
        tokio::spawn(async move {
            assert!(sender.send(Bytes::from_static(b"hello ")).await);
            assert!(sender.send(Bytes::from_static(b"world")).await);
        });

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello world");
    }

    #[tokio::test]
    async fn dropping_sender_ends_the_stream() {
        let (body, sender) = streaming_body();
        drop(sender);
        let collected = body.collect().await.unwrap().to_bytes();
        assert!(collected.is_empty());
    }
}
