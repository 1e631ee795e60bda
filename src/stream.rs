//! Byte streams handed over by the network layer
//!
//! A download's data arrives as a stream of chunks. The stream ending
//! means success; an `Err` item ends it with the given interrupt reason.

use crate::protocol::InterruptReason;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

/// Chunks of a response body
pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, InterruptReason>>;

/// A stream that yields `chunks` and then ends successfully
pub fn from_chunks<I, B>(chunks: I) -> ByteStream
where
    I: IntoIterator<Item = B>,
    I::IntoIter: Send + 'static,
    B: Into<Bytes>,
{
    stream::iter(chunks.into_iter().map(|c| Ok(c.into()))).boxed()
}

/// Push side of [`channel`]
#[derive(Debug, Clone)]
pub struct ByteStreamSender {
    tx: mpsc::Sender<std::result::Result<Bytes, InterruptReason>>,
}

impl ByteStreamSender {
    /// Queue a chunk. Returns false once the reader is gone.
    pub async fn send(&self, chunk: impl Into<Bytes>) -> bool {
        self.tx.send(Ok(chunk.into())).await.is_ok()
    }

    /// End the stream with an error
    pub async fn fail(self, reason: InterruptReason) {
        let _ = self.tx.send(Err(reason)).await;
    }

    /// The reader dropped the stream (download cancelled)
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A stream fed by a [`ByteStreamSender`]. Dropping every sender ends it.
pub fn channel(capacity: usize) -> (ByteStreamSender, ByteStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stream = stream::unfold(rx, |mut rx| async move {
        let item = rx.recv().await?;
        Some((item, rx))
    })
    .boxed();
    (ByteStreamSender { tx }, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunks_then_end() {
        let mut s = from_chunks(vec![&b"ab"[..], &b"c"[..]]);
        assert_eq!(s.next().await, Some(Ok(Bytes::from_static(b"ab"))));
        assert_eq!(s.next().await, Some(Ok(Bytes::from_static(b"c"))));
        assert_eq!(s.next().await, None);
    }

    #[tokio::test]
    async fn channel_carries_errors() {
        let (tx, mut s) = channel(4);
        assert!(tx.send(&b"x"[..]).await);
        tx.fail(InterruptReason::NetworkDisconnected).await;
        assert_eq!(s.next().await, Some(Ok(Bytes::from_static(b"x"))));
        assert_eq!(s.next().await, Some(Err(InterruptReason::NetworkDisconnected)));
        assert_eq!(s.next().await, None);
    }

    #[tokio::test]
    async fn dropping_reader_closes_sender() {
        let (tx, s) = channel(1);
        drop(s);
        assert!(tx.is_closed());
        assert!(!tx.send(&b"x"[..]).await);
    }
}
