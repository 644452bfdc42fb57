use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Weak;
use std::task::Context;
use std::task::Poll;

use futures::Future;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;

use crate::error::FetchError;

/// Broadcasts values to the subscribers registered at publish time.
///
/// Every subscriber owns a bounded queue, so a slow subscriber never holds back the publisher or
/// its siblings: once its queue is full it is removed and told so with
/// [`FetchError::Backpressure`].
pub struct Channel<T> {
    state: Arc<Mutex<ChannelState<T>>>,
    capacity: usize,
}

struct ChannelState<T> {
    next_id: u64,
    subscribers: Vec<Subscriber<T>>,
    unpublished: bool,
}

struct Subscriber<T> {
    id: u64,
    values: mpsc::Sender<T>,
    terminal: oneshot::Sender<FetchError>,
}

impl<T> Channel<T>
where
    T: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Channel {
            state: Arc::new(Mutex::new(ChannelState {
                next_id: 0,
                subscribers: Vec::new(),
                unpublished: false,
            })),
            capacity: capacity.max(1),
        }
    }

    /// Delivers `value` to every current subscriber. Without subscribers the value is lost.
    pub fn publish(&self, value: T) {
        let mut state = self.state.lock();
        if state.unpublished {
            return;
        }

        let subscribers = std::mem::take(&mut state.subscribers);
        for subscriber in subscribers {
            match subscriber.values.try_send(value.clone()) {
                Ok(()) => state.subscribers.push(subscriber),
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = subscriber.id,
                        capacity = self.capacity,
                        "subscriber queue is full, stopping it"
                    );
                    // the queued values stay readable, the error comes after them
                    let _ = subscriber.terminal.send(FetchError::Backpressure {
                        capacity: self.capacity,
                    });
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Registers a new subscriber that receives every value published from now on.
    pub fn subscribe(&self) -> Subscription<T> {
        let (values_tx, values) = mpsc::channel(self.capacity);
        let (terminal_tx, terminal) = oneshot::channel();

        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        if !state.unpublished {
            state.subscribers.push(Subscriber {
                id,
                values: values_tx,
                terminal: terminal_tx,
            });
        }

        Subscription {
            id,
            values,
            terminal: Some(terminal),
            channel: Arc::downgrade(&self.state),
        }
    }

    /// Ends every subscription, with `reason` as their last item when given.
    ///
    /// The channel ignores publishes afterwards and new subscriptions end right away.
    pub fn unpublish(&self, reason: Option<FetchError>) {
        let subscribers = {
            let mut state = self.state.lock();
            state.unpublished = true;
            std::mem::take(&mut state.subscribers)
        };
        tracing::trace!(subscribers = subscribers.len(), "unpublishing channel");
        for subscriber in subscribers {
            if let Some(reason) = &reason {
                let _ = subscriber.terminal.send(reason.clone());
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn is_unpublished(&self) -> bool {
        self.state.lock().unpublished
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            state: self.state.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// The values one subscriber receives from a [`Channel`].
///
/// Dropping it unregisters the subscriber.
pub struct Subscription<T> {
    id: u64,
    values: mpsc::Receiver<T>,
    terminal: Option<oneshot::Receiver<FetchError>>,
    channel: Weak<Mutex<ChannelState<T>>>,
}

impl<T> Stream for Subscription<T> {
    type Item = Result<T, FetchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.values.poll_recv(cx) {
            Poll::Ready(Some(value)) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(None) => match this.terminal.as_mut() {
                Some(terminal) => match Pin::new(terminal).poll(cx) {
                    Poll::Ready(reason) => {
                        this.terminal = None;
                        Poll::Ready(reason.ok().map(Err))
                    }
                    Poll::Pending => Poll::Pending,
                },
                None => Poll::Ready(None),
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(state) = self.channel.upgrade() {
            state
                .lock()
                .subscribers
                .retain(|subscriber| subscriber.id != self.id);
        }
    }
}
