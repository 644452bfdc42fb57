use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

use futures::Stream;
use futures::StreamExt;
use futures::stream::BoxStream;
use futures::task::ArcWake;
use futures::task::waker_ref;
use parking_lot::Mutex;

/// Demultiplexes `source` into `count` streams.
///
/// `classify` maps every item to the index of the output that receives it. Outputs drive the
/// source themselves when their buffer is empty, so the source is only pulled on demand and by
/// one output at a time. Items for an output that was dropped are discarded; once every output
/// is dropped the source is dropped too.
pub fn split<S, T, F>(source: S, count: usize, classify: F) -> Vec<SplitStream<T>>
where
    S: Stream + Send + 'static,
    F: FnMut(S::Item) -> (usize, T) + Send + 'static,
    T: Send + 'static,
{
    if count == 0 {
        return Vec::new();
    }

    let shared = Arc::new(Mutex::new(Splitter {
        source: Some(source.map(classify).boxed()),
        outputs: (0..count).map(|_| Output::new()).collect(),
        wakers: Arc::new(FanoutWaker::new(count)),
    }));

    (0..count)
        .map(|index| SplitStream {
            index,
            shared: shared.clone(),
        })
        .collect()
}

struct Splitter<T> {
    source: Option<BoxStream<'static, (usize, T)>>,
    outputs: Vec<Output<T>>,
    wakers: Arc<FanoutWaker>,
}

struct Output<T> {
    buffer: VecDeque<T>,
    dropped: bool,
}

impl<T> Output<T> {
    fn new() -> Self {
        Output {
            buffer: VecDeque::new(),
            dropped: false,
        }
    }
}

/// The waker handed to the source: it wakes every output currently waiting on it, so that
/// whichever output polls next can route what the source produced.
struct FanoutWaker {
    wakers: Mutex<Vec<Option<Waker>>>,
}

impl FanoutWaker {
    fn new(count: usize) -> Self {
        FanoutWaker {
            wakers: Mutex::new(vec![None; count]),
        }
    }

    fn register(&self, index: usize, waker: &Waker) {
        let mut wakers = self.wakers.lock();
        match &wakers[index] {
            Some(registered) if registered.will_wake(waker) => {}
            _ => wakers[index] = Some(waker.clone()),
        }
    }

    fn remove(&self, index: usize) {
        self.wakers.lock()[index] = None;
    }

    fn wake_output(&self, index: usize) {
        let waker = self.wakers.lock()[index].take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn wake_all(&self) {
        let wakers: Vec<Waker> = self
            .wakers
            .lock()
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        for waker in wakers {
            waker.wake();
        }
    }
}

impl ArcWake for FanoutWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.wake_all();
    }
}

/// One output of [`split`].
pub struct SplitStream<T> {
    index: usize,
    shared: Arc<Mutex<Splitter<T>>>,
}

impl<T> Stream for SplitStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let index = self.index;
        let mut guard = self.shared.lock();
        let splitter = &mut *guard;

        loop {
            if let Some(item) = splitter.outputs[index].buffer.pop_front() {
                return Poll::Ready(Some(item));
            }
            let Some(source) = splitter.source.as_mut() else {
                return Poll::Ready(None);
            };

            splitter.wakers.register(index, cx.waker());
            let wakers = splitter.wakers.clone();
            let waker = waker_ref(&wakers);
            let mut source_cx = Context::from_waker(&waker);

            match source.poll_next_unpin(&mut source_cx) {
                Poll::Ready(Some((target, item))) => {
                    if target == index {
                        return Poll::Ready(Some(item));
                    }
                    let outputs = splitter.outputs.len();
                    match splitter.outputs.get_mut(target) {
                        Some(output) if !output.dropped => {
                            tracing::trace!(from = index, to = target, "buffering split item");
                            output.buffer.push_back(item);
                            wakers.wake_output(target);
                        }
                        Some(_) => {
                            tracing::trace!(target, "discarding item for a dropped output");
                        }
                        None => {
                            tracing::warn!(
                                target,
                                outputs,
                                "split item routed outside of the outputs, dropping it"
                            );
                        }
                    }
                }
                Poll::Ready(None) => {
                    tracing::trace!("split source completed");
                    splitter.source = None;
                    wakers.wake_all();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T> Drop for SplitStream<T> {
    fn drop(&mut self) {
        let source = {
            let mut splitter = self.shared.lock();
            splitter.wakers.remove(self.index);
            let output = &mut splitter.outputs[self.index];
            output.dropped = true;
            output.buffer.clear();
            if splitter.outputs.iter().all(|output| output.dropped) {
                splitter.source.take()
            } else {
                None
            }
        };
        if source.is_some() {
            tracing::debug!("every split output was dropped, cancelling the source");
        }
    }
}

impl<T> fmt::Debug for SplitStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitStream")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
