use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

/// Build a deferred sequence: an asynchronous producer/consumer pair.
/// The Producer feeds items, completes, or fails the sequence from any
/// task; the Deferred consumer is a futures::Stream over those items.
/// feed() resolves only once the consumer has taken the item, so a
/// producer cannot run ahead of its consumer: item N+1 is not produced
/// until item N has been delivered.
pub fn deferred<T, E>() -> (Producer<T, E>, Deferred<T, E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Producer { tx }, Deferred { rx, done: false })
}

enum Op<T, E> {
    Item(T, oneshot::Sender<()>),
    Complete,
    Fail(E),
}

/// Producer is the feeding half of a deferred sequence.
/// It's cheap to clone, and all clones feed the same consumer.
pub struct Producer<T, E> {
    tx: mpsc::UnboundedSender<Op<T, E>>,
}

impl<T, E> Clone for Producer<T, E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T, E> Producer<T, E> {
    /// Feed the next item of the sequence, waiting until the consumer
    /// has taken it. Returns false if the consumer is gone, or was
    /// dropped while this item was in flight.
    pub async fn feed(&self, item: T) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Op::Item(item, ack_tx)).is_err() {
            return false;
        }
        ack_rx.await.is_ok()
    }

    /// Complete the sequence: the consumer observes end-of-stream after
    /// all previously fed items.
    pub fn complete(&self) {
        let _ = self.tx.send(Op::Complete);
    }

    /// Fail the sequence: the consumer observes `error` after all
    /// previously fed items, and then end-of-stream.
    pub fn fail(&self, error: E) {
        let _ = self.tx.send(Op::Fail(error));
    }
}

/// Deferred is the consuming half of a deferred sequence:
/// a Stream of the items its Producer feeds.
pub struct Deferred<T, E> {
    rx: mpsc::UnboundedReceiver<Op<T, E>>,
    done: bool,
}

impl<T, E> futures_core::Stream for Deferred<T, E> {
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();

        if me.done {
            return Poll::Ready(None);
        }
        match std::task::ready!(me.rx.poll_recv(cx)) {
            Some(Op::Item(item, ack)) => {
                // The item is delivered from this point, even if the
                // producer has already given up waiting for the ack.
                let _ = ack.send(());
                Poll::Ready(Some(Ok(item)))
            }
            Some(Op::Complete) | None => {
                me.done = true;
                Poll::Ready(None)
            }
            Some(Op::Fail(error)) => {
                me.done = true;
                Poll::Ready(Some(Err(error)))
            }
        }
    }
}
