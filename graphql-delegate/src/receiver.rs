//! Reassembles the incremental result of one delegated subtree and answers path lookups
//! against it.
//!
//! A [`PatchReceiver`] owns the stream returned by a delegated execution. The first item is
//! the baseline, read by [`PatchReceiver::get_initial_result`]. Later items are patches: they
//! are only pulled while some [`PatchReceiver::request`] is waiting for a value that is not in
//! the tree yet.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use futures::stream::select_all;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::watch;

use crate::configuration::PubSubConfig;
use crate::error::FetchError;
use crate::graphql;
use crate::graphql::ResponseStream;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;
use crate::pubsub::PubSub;

/// Turns an item of the stream into the data stored in the tree.
pub type Transformer = Arc<dyn Fn(graphql::Response) -> Value + Send + Sync>;

fn data_of(response: graphql::Response) -> Value {
    response.data.unwrap_or_default()
}

#[derive(Clone)]
pub struct PatchReceiver {
    shared: Arc<Shared>,
}

struct Shared {
    transformer: Transformer,
    field_name: Option<String>,
    pubsub: PubSub<Value>,
    tree: watch::Receiver<Value>,
    errors: Mutex<Vec<graphql::Error>>,
    driver: Mutex<Driver>,
    idle: Notify,
}

struct Driver {
    state: DriveState,
    outstanding: usize,
}

enum DriveState {
    Uninitialized(Source),
    Initializing,
    /// Baseline read, nobody is pulling the stream.
    Idle(Source),
    /// A drive loop owns the source.
    Running,
    Exhausted,
    Failed(FetchError),
}

/// What the drive loop owns while it runs.
struct Source {
    stream: ResponseStream,
    tree: watch::Sender<Value>,
}

#[buildstructor::buildstructor]
impl PatchReceiver {
    /// Returns a builder for a receiver over `stream`.
    ///
    /// Without a `transformer` the `data` of each item is stored as is. With a `field_name`
    /// only patches below that top level field are applied.
    #[builder(visibility = "pub")]
    fn new(
        stream: ResponseStream,
        transformer: Option<Transformer>,
        field_name: Option<String>,
        pubsub: Option<PubSubConfig>,
    ) -> Self {
        let (sender, tree) = watch::channel(Value::Null);
        let capacity = pubsub.unwrap_or_default().subscriber_capacity;
        PatchReceiver {
            shared: Arc::new(Shared {
                transformer: transformer.unwrap_or_else(|| Arc::new(data_of)),
                field_name,
                pubsub: PubSub::new(capacity),
                tree,
                errors: Mutex::new(Vec::new()),
                driver: Mutex::new(Driver {
                    state: DriveState::Uninitialized(Source {
                        stream,
                        tree: sender,
                    }),
                    outstanding: 0,
                }),
                idle: Notify::new(),
            }),
        }
    }
}

impl PatchReceiver {
    pub fn from_stream(stream: ResponseStream) -> Self {
        Self::builder().stream(stream).build()
    }

    /// Reads the baseline. Must be called once, before any [`PatchReceiver::request`].
    pub async fn get_initial_result(&self) -> Result<Value, FetchError> {
        let mut source = {
            let mut driver = self.shared.driver.lock();
            match std::mem::replace(&mut driver.state, DriveState::Initializing) {
                DriveState::Uninitialized(source) => source,
                state => {
                    driver.state = state;
                    return Err(FetchError::ReceiverState {
                        reason: "the initial result was already requested".to_string(),
                    });
                }
            }
        };

        let failure = match source.stream.next().await {
            Some(response) if response.data.is_some() => {
                self.shared
                    .errors
                    .lock()
                    .extend(response.errors.iter().cloned());
                let root = (self.shared.transformer)(response);
                source.tree.send_replace(root.clone());
                self.shared.driver.lock().state = DriveState::Idle(source);
                return Ok(root);
            }
            Some(response) => {
                self.shared.errors.lock().extend(response.errors);
                "the initial result has no data"
            }
            None => "the stream ended before its initial result",
        };

        tracing::debug!(reason = failure, "delegated baseline failed");
        let error = FetchError::BaselineFailed {
            reason: failure.to_string(),
        };
        self.shared.driver.lock().state = DriveState::Failed(error.clone());
        Err(error)
    }

    /// Resolves the value at `path`, waiting for the patch that delivers it if needed.
    ///
    /// Returns `None` once the stream is exhausted without the path ever materializing.
    pub async fn request(&self, path: &Path) -> Result<Option<Value>, FetchError> {
        match &self.shared.driver.lock().state {
            DriveState::Uninitialized(_) | DriveState::Initializing => {
                return Err(FetchError::ReceiverState {
                    reason: "a path was requested before the initial result".to_string(),
                });
            }
            DriveState::Failed(error) => return Err(error.clone()),
            // nothing will be published anymore, subscribing would only leave topics behind
            DriveState::Exhausted => return Ok(self.lookup(path)),
            _ => {}
        }

        if let Some(value) = self.lookup(path) {
            return Ok(Some(value));
        }

        let mut outstanding = None;
        loop {
            let mut notifications = self.subscribe(path);
            {
                let mut driver = self.shared.driver.lock();
                // a patch may have landed before the subscriptions were in place
                if let Some(value) = self.lookup(path) {
                    return Ok(Some(value));
                }
                match &driver.state {
                    DriveState::Exhausted => {
                        drop(notifications);
                        self.shared.pubsub.close(None);
                        return Ok(None);
                    }
                    DriveState::Failed(error) => return Err(error.clone()),
                    _ => {}
                }
                if outstanding.is_none() {
                    driver.outstanding += 1;
                    match std::mem::replace(&mut driver.state, DriveState::Running) {
                        DriveState::Idle(source) => {
                            tracing::debug!(%path, "starting the drive loop");
                            tokio::spawn(drive(self.shared.clone(), source));
                        }
                        state => driver.state = state,
                    }
                    outstanding = Some(Outstanding {
                        shared: self.shared.clone(),
                    });
                }
            }

            let capacity = loop {
                match notifications.next().await {
                    Some((depth, Ok(value))) => {
                        if let Some(found) = value.get_path(&path.suffix(depth)) {
                            return Ok(Some(found.clone()));
                        }
                    }
                    // the queue overflowed, what it dropped is in the tree
                    Some((_, Err(FetchError::Backpressure { capacity }))) => break capacity,
                    Some((_, Err(error))) => return Err(error),
                    None => return Ok(self.lookup(path)),
                }
            };
            tracing::debug!(%path, capacity, "request fell behind, resubscribing");
        }
    }

    /// Listens on every ancestor topic of `path`, each tagged with its depth so the rest of
    /// the path can be resolved against what it publishes.
    fn subscribe(&self, path: &Path) -> BoxStream<'static, (usize, Result<Value, FetchError>)> {
        select_all(path.prefixes().enumerate().map(|(depth, prefix)| {
            self.shared
                .pubsub
                .subscribe(&prefix.topic())
                .map(move |published| (depth, published))
        }))
        .boxed()
    }

    /// The tree as currently known.
    pub fn snapshot(&self) -> Value {
        self.shared.tree.borrow().clone()
    }

    /// Errors carried by every item read so far.
    pub fn errors(&self) -> Vec<graphql::Error> {
        self.shared.errors.lock().clone()
    }

    fn lookup(&self, path: &Path) -> Option<Value> {
        self.shared.tree.borrow().get_path(path).cloned()
    }
}

impl fmt::Debug for PatchReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchReceiver")
            .field("field_name", &self.shared.field_name)
            .finish_non_exhaustive()
    }
}

/// Keeps the drive loop pulling while a request waits.
struct Outstanding {
    shared: Arc<Shared>,
}

impl Drop for Outstanding {
    fn drop(&mut self) {
        let mut driver = self.shared.driver.lock();
        driver.outstanding = driver.outstanding.saturating_sub(1);
        if driver.outstanding == 0 {
            self.shared.idle.notify_one();
        }
    }
}

async fn drive(shared: Arc<Shared>, mut source: Source) {
    loop {
        {
            let mut driver = shared.driver.lock();
            if driver.outstanding == 0 {
                tracing::debug!("no request is waiting, pausing the drive loop");
                driver.state = DriveState::Idle(source);
                return;
            }
        }

        let next = tokio::select! {
            biased;
            next = source.stream.next() => next,
            _ = shared.idle.notified() => continue,
        };

        match next {
            Some(patch) => shared.apply(&source.tree, patch),
            None => {
                tracing::debug!("delegated stream exhausted");
                shared.driver.lock().state = DriveState::Exhausted;
                shared.pubsub.close(None);
                return;
            }
        }
    }
}

impl Shared {
    fn apply(&self, tree: &watch::Sender<Value>, patch: graphql::Response) {
        let Some(path) = patch.path.clone() else {
            tracing::warn!("skipping a patch without a path");
            return;
        };
        if let Some(field_name) = &self.field_name
            && !matches!(path.first(), Some(PathElement::Key(key)) if key == field_name)
        {
            tracing::trace!(
                %path,
                field_name = field_name.as_str(),
                "skipping a patch for another field"
            );
            return;
        }

        self.errors.lock().extend(patch.errors.iter().cloned());
        if matches!(patch.data, None | Some(Value::Null)) {
            return;
        }
        let data = (self.transformer)(patch);

        // data under a field is expressed from the enclosing object, data under a list index
        // is the element itself
        let target = match path.last() {
            Some(PathElement::Key(_)) => path.parent(),
            _ => path.clone(),
        };

        let mut merged = Err(None);
        tree.send_if_modified(|root| match root.entry_at_path(&target) {
            Ok(entry) => {
                entry.deep_merge(data);
                merged = Ok(entry.clone());
                true
            }
            Err(error) => {
                merged = Err(Some(error));
                false
            }
        });

        match merged {
            Ok(value) => {
                tracing::trace!(%path, "patch applied");
                self.pubsub.publish(&target.topic(), value);
            }
            Err(Some(error)) => {
                tracing::warn!(%error, "cannot apply patch");
                self.pubsub.close(Some(error));
            }
            Err(None) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use futures::channel::mpsc;
    use futures::stream;
    use serde_json_bytes::json;

    use super::*;
    use crate::json_ext::Object;

    fn patch(data: Value, path: &str) -> graphql::Response {
        graphql::Response::builder()
            .data(data)
            .path(Path::from(path))
            .build()
    }

    fn baseline(data: Value) -> graphql::Response {
        graphql::Response::builder().data(data).build()
    }

    fn counted(
        items: impl futures::Stream<Item = graphql::Response> + Send + 'static,
        pulls: Arc<AtomicUsize>,
    ) -> ResponseStream {
        items
            .inspect(move |_| {
                pulls.fetch_add(1, Ordering::SeqCst);
            })
            .boxed()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn patches_resolve_requests_and_exhaustion_resolves_to_none() {
        let receiver = PatchReceiver::from_stream(
            stream::iter(vec![
                baseline(json!({"a": 1})),
                patch(json!({"b": 2}), "a/b"),
            ])
            .boxed(),
        );

        assert_eq!(receiver.get_initial_result().await, Ok(json!({"a": 1})));
        let (present, absent) = (Path::from("a/b"), Path::from("a/c"));
        let (found, missing) = tokio::join!(receiver.request(&present), receiver.request(&absent));
        assert_eq!(found, Ok(Some(json!(2))));
        assert_eq!(missing, Ok(None));
    }

    #[tokio::test]
    async fn resolved_paths_do_not_pull_again() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let receiver = PatchReceiver::from_stream(counted(
            stream::iter(vec![baseline(json!({"a": 1}))]).chain(stream::pending()),
            pulls.clone(),
        ));
        receiver.get_initial_result().await.unwrap();

        let path = Path::from("a");
        assert_eq!(receiver.request(&path).await, Ok(Some(json!(1))));
        assert_eq!(receiver.request(&path).await, Ok(Some(json!(1))));
        assert_eq!(pulls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn requests_resolve_regardless_of_arrival_order() {
        let (sender, items) = mpsc::unbounded();
        let receiver = PatchReceiver::from_stream(items.boxed());
        sender.unbounded_send(baseline(json!({}))).unwrap();
        receiver.get_initial_result().await.unwrap();

        let first = tokio::spawn({
            let receiver = receiver.clone();
            async move { receiver.request(&Path::from("first/value")).await }
        });
        let second = tokio::spawn({
            let receiver = receiver.clone();
            async move { receiver.request(&Path::from("second")).await }
        });
        settle().await;

        sender
            .unbounded_send(patch(json!({"second": [1, 2]}), "second"))
            .unwrap();
        assert_eq!(second.await.unwrap(), Ok(Some(json!([1, 2]))));
        assert!(!first.is_finished());

        sender
            .unbounded_send(patch(json!({"first": {"value": "x"}}), "first"))
            .unwrap();
        assert_eq!(first.await.unwrap(), Ok(Some(json!("x"))));
    }

    #[tokio::test]
    async fn the_loop_pauses_and_restarts() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let (sender, items) = mpsc::unbounded();
        let receiver = PatchReceiver::from_stream(counted(items, pulls.clone()));
        sender.unbounded_send(baseline(json!({}))).unwrap();
        receiver.get_initial_result().await.unwrap();

        let waiting = tokio::spawn({
            let receiver = receiver.clone();
            async move { receiver.request(&Path::from("a")).await }
        });
        settle().await;
        sender.unbounded_send(patch(json!({"a": 1}), "a")).unwrap();
        assert_eq!(waiting.await.unwrap(), Ok(Some(json!(1))));
        settle().await;

        sender.unbounded_send(patch(json!({"b": 2}), "b")).unwrap();
        settle().await;
        assert_eq!(pulls.load(Ordering::SeqCst), 2);
        assert_eq!(receiver.snapshot(), json!({"a": 1}));

        assert_eq!(receiver.request(&Path::from("b")).await, Ok(Some(json!(2))));
        assert_eq!(pulls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_requests_release_the_loop() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let (sender, items) = mpsc::unbounded();
        let receiver = PatchReceiver::from_stream(counted(items, pulls.clone()));
        sender.unbounded_send(baseline(json!({}))).unwrap();
        receiver.get_initial_result().await.unwrap();

        let waiting = tokio::spawn({
            let receiver = receiver.clone();
            async move { receiver.request(&Path::from("a")).await }
        });
        settle().await;
        waiting.abort();
        assert!(waiting.await.unwrap_err().is_cancelled());
        settle().await;
        assert_eq!(receiver.shared.driver.lock().outstanding, 0);

        sender.unbounded_send(patch(json!({"a": 1}), "a")).unwrap();
        settle().await;
        assert_eq!(pulls.load(Ordering::SeqCst), 1);
        assert_eq!(receiver.snapshot(), json!({}));

        assert_eq!(receiver.request(&Path::from("a")).await, Ok(Some(json!(1))));
        assert_eq!(pulls.load(Ordering::SeqCst), 2);
    }

    #[test_log::test(tokio::test)]
    async fn requests_outlast_their_subscription_capacity() {
        let mut items = vec![baseline(json!({}))];
        items.extend((0..200).map(|i| {
            let key = format!("k{i}");
            let mut data = Object::new();
            data.insert(key.clone(), json!(i));
            patch(Value::Object(data), &key)
        }));
        let receiver = PatchReceiver::from_stream(stream::iter(items).boxed());
        receiver.get_initial_result().await.unwrap();

        assert_eq!(
            receiver.request(&Path::from("k199")).await,
            Ok(Some(json!(199)))
        );
        assert_eq!(receiver.request(&Path::from("k0")).await, Ok(Some(json!(0))));
    }

    #[tokio::test]
    async fn requests_after_exhaustion_leave_no_topics() {
        let receiver = PatchReceiver::from_stream(
            stream::iter(vec![baseline(json!({"a": 1})), patch(json!({"b": 2}), "b")]).boxed(),
        );
        receiver.get_initial_result().await.unwrap();
        assert_eq!(receiver.request(&Path::from("missing")).await, Ok(None));
        assert_eq!(receiver.shared.pubsub.topic_count(), 0);

        for path in ["missing", "b/c", "x/0/y"] {
            assert_eq!(receiver.request(&Path::from(path)).await, Ok(None));
        }
        assert_eq!(receiver.request(&Path::from("b")).await, Ok(Some(json!(2))));
        assert_eq!(receiver.shared.pubsub.topic_count(), 0);
    }

    #[tokio::test]
    async fn list_elements_are_merged_in_place() {
        let receiver = PatchReceiver::from_stream(
            stream::iter(vec![
                baseline(json!({"users": [{"id": 1}, {"id": 2}]})),
                patch(json!({"name": "two"}), "users/1"),
            ])
            .boxed(),
        );
        receiver.get_initial_result().await.unwrap();

        assert_eq!(
            receiver.request(&Path::from("users/1/name")).await,
            Ok(Some(json!("two")))
        );
        assert_eq!(
            receiver.snapshot(),
            json!({"users": [{"id": 1}, {"id": 2, "name": "two"}]})
        );
    }

    #[tokio::test]
    async fn failed_baseline_rejects_every_request() {
        let receiver = PatchReceiver::from_stream(stream::empty().boxed());
        assert!(matches!(
            receiver.get_initial_result().await,
            Err(FetchError::BaselineFailed { .. })
        ));
        assert!(matches!(
            receiver.request(&Path::from("a")).await,
            Err(FetchError::BaselineFailed { .. })
        ));

        let receiver = PatchReceiver::from_stream(
            stream::iter(vec![
                graphql::Response::builder()
                    .error(graphql::Error::builder().message("boom").build())
                    .build(),
            ])
            .boxed(),
        );
        assert!(receiver.get_initial_result().await.is_err());
        assert_eq!(receiver.errors()[0].message, "boom");
    }

    #[tokio::test]
    async fn calls_out_of_order_are_rejected() {
        let receiver =
            PatchReceiver::from_stream(stream::iter(vec![baseline(json!({"a": 1}))]).boxed());
        assert!(matches!(
            receiver.request(&Path::from("a")).await,
            Err(FetchError::ReceiverState { .. })
        ));
        receiver.get_initial_result().await.unwrap();
        assert!(matches!(
            receiver.get_initial_result().await,
            Err(FetchError::ReceiverState { .. })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn conflicts_fail_waiting_requests_only() {
        let (sender, items) = mpsc::unbounded();
        let receiver = PatchReceiver::from_stream(items.boxed());
        sender.unbounded_send(baseline(json!({"a": [1]}))).unwrap();
        receiver.get_initial_result().await.unwrap();

        let waiting = tokio::spawn({
            let receiver = receiver.clone();
            async move { receiver.request(&Path::from("a/3/b")).await }
        });
        settle().await;
        sender.unbounded_send(patch(json!({"x": 1}), "a/3")).unwrap();

        let error = waiting.await.unwrap().unwrap_err();
        assert_eq!(
            error,
            FetchError::MergeConflict {
                path: Path::from("a/3"),
                reason: "list index out of bounds".to_string(),
            }
        );
        assert_eq!(receiver.snapshot(), json!({"a": [1]}));
        assert_eq!(receiver.request(&Path::from("a/0")).await, Ok(Some(json!(1))));
    }

    #[test_log::test(tokio::test)]
    async fn patches_without_path_are_skipped() {
        let receiver = PatchReceiver::from_stream(
            stream::iter(vec![
                baseline(json!({})),
                baseline(json!({"ignored": true})),
                patch(json!({"a": 1}), "a"),
            ])
            .boxed(),
        );
        receiver.get_initial_result().await.unwrap();
        assert_eq!(receiver.request(&Path::from("a")).await, Ok(Some(json!(1))));
        assert_eq!(receiver.request(&Path::from("ignored")).await, Ok(None));
    }

    #[tokio::test]
    async fn scoped_receivers_ignore_other_fields() {
        let transformer: Transformer = Arc::new(|response: graphql::Response| {
            let mut data = response.data.unwrap_or_default();
            if let Value::Object(object) = &mut data {
                object.insert("seen", json!(true));
            }
            data
        });
        let receiver = PatchReceiver::builder()
            .stream(
                stream::iter(vec![
                    baseline(json!({"mine": {}})),
                    graphql::Response::builder()
                        .data(json!({"other": 1}))
                        .path(Path::from("other"))
                        .error(graphql::Error::builder().message("not mine").build())
                        .build(),
                    patch(json!({"value": 2}), "mine/value"),
                ])
                .boxed(),
            )
            .transformer(transformer)
            .field_name("mine")
            .build();

        assert_eq!(
            receiver.get_initial_result().await,
            Ok(json!({"mine": {}, "seen": true}))
        );
        assert_eq!(
            receiver.request(&Path::from("mine/value")).await,
            Ok(Some(json!(2)))
        );
        assert_eq!(receiver.request(&Path::from("other")).await, Ok(None));
        assert!(receiver.errors().is_empty());
        assert_eq!(
            receiver.snapshot(),
            json!({"mine": {"value": 2, "seen": true}, "seen": true})
        );
    }
}
