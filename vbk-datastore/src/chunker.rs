use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures::ready;
use futures::stream::{Stream, TryStream};

use crate::{CHUNK_SIZE_MAX, CHUNK_SIZE_MIN};

/// Clamp a configured chunk size into the supported window.
pub fn clamp_chunk_size(size: usize) -> usize {
    size.clamp(CHUNK_SIZE_MIN, CHUNK_SIZE_MAX)
}

/// Lowercase hex BLAKE3-256 digest, the identity of a chunk.
pub fn chunk_digest_hex(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// Split input stream into fixed sized chunks
///
/// The last chunk can have any size; empty input yields no chunks at all.
pub struct FixedChunkStream<S: Unpin> {
    input: S,
    chunk_size: usize,
    buffer: BytesMut,
}

impl<S: Unpin> FixedChunkStream<S> {
    pub fn new(input: S, chunk_size: usize) -> Self {
        Self {
            input,
            chunk_size: clamp_chunk_size(chunk_size),
            buffer: BytesMut::new(),
        }
    }
}

impl<S: Unpin> Unpin for FixedChunkStream<S> {}

impl<S: Unpin> Stream for FixedChunkStream<S>
where
    S: TryStream,
    S::Ok: AsRef<[u8]>,
{
    type Item = Result<BytesMut, S::Error>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Option<Result<BytesMut, S::Error>>> {
        let this = self.get_mut();
        loop {
            if this.buffer.len() >= this.chunk_size {
                return Poll::Ready(Some(Ok(this.buffer.split_to(this.chunk_size))));
            }

            match ready!(Pin::new(&mut this.input).try_poll_next(cx)) {
                Some(Err(err)) => {
                    return Poll::Ready(Some(Err(err)));
                }
                None => {
                    // last chunk can have any size
                    if !this.buffer.is_empty() {
                        return Poll::Ready(Some(Ok(this.buffer.split())));
                    } else {
                        return Poll::Ready(None);
                    }
                }
                Some(Ok(data)) => {
                    this.buffer.extend_from_slice(data.as_ref());
                }
            }
        }
    }
}
