// ── Event streams ──
//
// `Stream` adapters over the broadcast and watch channels a device exposes,
// for consumers that prefer `StreamExt` combinators over raw receivers.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// `Stream` over a broadcast receiver.
///
/// A slow consumer skips the events it missed (logged at warn level) rather
/// than ending the stream. Ends when every sender is gone.
pub struct EventStream<T> {
    inner: Pin<Box<dyn Stream<Item = T> + Send>>,
}

impl<T: Clone + Send + 'static> EventStream<T> {
    pub(crate) fn new(mut receiver: broadcast::Receiver<T>) -> Self {
        let inner = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(event) => yield event,
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        };
        Self { inner: Box::pin(inner) }
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    #[tokio::test]
    async fn yields_until_senders_drop() {
        let (tx, rx) = broadcast::channel(4);
        let stream = EventStream::new(rx);
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        drop(tx);
        assert_eq!(stream.collect::<Vec<_>>().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn lag_skips_instead_of_ending() {
        let (tx, rx) = broadcast::channel(2);
        let mut stream = EventStream::new(rx);
        for n in 0..5 {
            tx.send(n).unwrap();
        }
        assert_eq!(stream.next().await, Some(3));
        assert_eq!(stream.next().await, Some(4));
    }
}
