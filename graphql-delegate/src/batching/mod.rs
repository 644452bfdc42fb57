//! Coalesce delegated executions. Implemented as a tower Layer.
//!
//! Requests submitted to a [`BatchingService`] during one scheduling turn are grouped by
//! operation kind, merged into a single request per group (see [`merge`]) and executed once.
//! The merged result is then split back per request (see [`split_result`]).
//!
//! See [`Layer`] and [`tower::Service`] for more details.

pub mod merge;
pub mod split_result;

use std::sync::Arc;
use std::task::Poll;

use futures::future::BoxFuture;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tower::BoxError;
use tower::Layer;
use tower::ServiceExt;

use self::merge::PreparedRequest;
use self::merge::merge_requests;
use self::split_result::split_result;
use crate::Context;
use crate::configuration::Batching;
use crate::error::FetchError;
use crate::graphql;
use crate::json_ext::Object;
use crate::services::ExecutionRequest;
use crate::services::ExecutionResult;
use crate::services::Executor;

/// Context key holding the position of a request in the batch it was executed with.
pub const BATCH_INDEX_CONTEXT_KEY: &str = "batching::index";
/// Context key holding the number of requests in that batch.
pub const BATCH_SIZE_CONTEXT_KEY: &str = "batching::size";

/// Folds the `extensions` of every request of a batch, in submission order, into the
/// extensions of the merged request.
pub type ExtensionsReducer = Arc<dyn Fn(Object, &graphql::Request) -> Object + Send + Sync>;

/// Shallow merge: later requests overwrite the keys of earlier ones.
pub fn default_extensions_reducer() -> ExtensionsReducer {
    Arc::new(|mut merged, request| {
        for (key, value) in request.extensions.iter() {
            merged.insert(key.clone(), value.clone());
        }
        merged
    })
}

/// Wraps `executor` in a [`BatchingService`] and boxes it.
pub fn create_batching_executor<S>(executor: S, config: Batching) -> Executor
where
    S: tower::Service<ExecutionRequest, Response = ExecutionResult, Error = BoxError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    Executor::new(BatchingLayer::new(config).layer(executor))
}

#[derive(Clone)]
pub struct BatchingLayer {
    config: Batching,
    reducer: ExtensionsReducer,
}

impl BatchingLayer {
    pub fn new(config: Batching) -> Self {
        BatchingLayer {
            config,
            reducer: default_extensions_reducer(),
        }
    }

    pub fn with_extensions_reducer(mut self, reducer: ExtensionsReducer) -> Self {
        self.reducer = reducer;
        self
    }
}

impl<S> Layer<S> for BatchingLayer
where
    S: tower::Service<ExecutionRequest, Response = ExecutionResult, Error = BoxError> + Clone,
{
    type Service = BatchingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        BatchingService {
            service,
            config: self.config.clone(),
            reducer: self.reducer.clone(),
            queue: Default::default(),
        }
    }
}

type Waiter = oneshot::Sender<Result<ExecutionResult, FetchError>>;

struct PendingRequest {
    prepared: PreparedRequest,
    context: Context,
    sender: Waiter,
}

#[derive(Default)]
struct Queue {
    pending: Vec<PendingRequest>,
    scheduled: bool,
}

pub struct BatchingService<S> {
    service: S,
    config: Batching,
    reducer: ExtensionsReducer,
    queue: Arc<Mutex<Queue>>,
}

impl<S: Clone> Clone for BatchingService<S> {
    fn clone(&self) -> Self {
        BatchingService {
            service: self.service.clone(),
            config: self.config.clone(),
            reducer: self.reducer.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<S> tower::Service<ExecutionRequest> for BatchingService<S>
where
    S: tower::Service<ExecutionRequest, Response = ExecutionResult, Error = BoxError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = ExecutionResult;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        // readiness of the inner executor is awaited when the batch is dispatched
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ExecutionRequest) -> Self::Future {
        if !self.config.enabled {
            let service = self.service.clone();
            return Box::pin(service.oneshot(request));
        }

        let ExecutionRequest {
            request, context, ..
        } = request;
        let prepared = match PreparedRequest::new(request) {
            Ok(prepared) => prepared,
            Err(error) => {
                tracing::debug!(%error, "request cannot join a batch");
                return Box::pin(async move { Err::<ExecutionResult, BoxError>(error.into()) });
            }
        };

        let (sender, receiver) = oneshot::channel();
        let schedule = {
            let mut queue = self.queue.lock();
            queue.pending.push(PendingRequest {
                prepared,
                context,
                sender,
            });
            !std::mem::replace(&mut queue.scheduled, true)
        };
        if schedule {
            tokio::task::spawn(dispatch(
                self.service.clone(),
                self.queue.clone(),
                self.config.max_batch_size,
                self.reducer.clone(),
            ));
        }

        Box::pin(async move {
            match receiver.await {
                Ok(result) => result.map_err(BoxError::from),
                Err(_) => Err(FetchError::BatchCancelled.into()),
            }
        })
    }
}

/// Seals everything submitted during the current turn and executes it.
async fn dispatch<S>(
    service: S,
    queue: Arc<Mutex<Queue>>,
    max_batch_size: Option<usize>,
    reducer: ExtensionsReducer,
) where
    S: tower::Service<ExecutionRequest, Response = ExecutionResult, Error = BoxError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    // let the current turn finish submitting
    tokio::task::yield_now().await;

    let pending = {
        let mut queue = queue.lock();
        queue.scheduled = false;
        std::mem::take(&mut queue.pending)
    };
    let batches = group(pending, max_batch_size);
    tracing::debug!(batches = batches.len(), "dispatching batches");

    join_all(
        batches
            .into_iter()
            .map(|batch| execute_batch(service.clone(), batch, &reducer)),
    )
    .await;
}

/// Splits the sealed submissions into batches of one operation kind, keeping their order.
fn group(pending: Vec<PendingRequest>, max_batch_size: Option<usize>) -> Vec<Vec<PendingRequest>> {
    let mut batches: Vec<Vec<PendingRequest>> = Vec::new();
    for request in pending {
        let joins = batches.last().is_some_and(|batch| {
            batch[0].prepared.kind == request.prepared.kind
                && max_batch_size.is_none_or(|max| batch.len() < max)
        });
        if joins && let Some(batch) = batches.last_mut() {
            batch.push(request);
            continue;
        }
        batches.push(vec![request]);
    }
    batches
}

async fn execute_batch<S>(service: S, batch: Vec<PendingRequest>, reducer: &ExtensionsReducer)
where
    S: tower::Service<ExecutionRequest, Response = ExecutionResult, Error = BoxError>,
{
    let size = batch.len();
    for (index, pending) in batch.iter().enumerate() {
        let _ = pending.context.insert(BATCH_INDEX_CONTEXT_KEY, index);
        let _ = pending.context.insert(BATCH_SIZE_CONTEXT_KEY, size);
    }

    let request = match merge_requests(batch.iter().map(|pending| &pending.prepared), reducer) {
        Ok(request) => request,
        Err(error) => {
            tracing::warn!(%error, size, "cannot merge batch");
            for pending in batch {
                let _ = pending.sender.send(Err(error.clone()));
            }
            return;
        }
    };
    let kind = batch[0].prepared.kind;
    let context = batch[0].context.clone();
    tracing::debug!(size, %kind, "executing merged request");

    match service
        .oneshot(ExecutionRequest::builder().request(request).context(context).build())
        .await
    {
        Ok(result) => {
            for (pending, share) in batch.into_iter().zip(split_result(result, size)) {
                // the caller may have gone away, its share is dropped with it
                let _ = pending.sender.send(Ok(share));
            }
        }
        Err(error) => {
            let error = FetchError::SubrequestTransportError {
                reason: error.to_string(),
            };
            tracing::debug!(%error, size, "merged request failed");
            for pending in batch {
                let _ = pending.sender.send(Err(error.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use futures::StreamExt;
    use futures::future::join_all;
    use serde_json_bytes::json;
    use tower::service_fn;

    use super::*;
    use crate::json_ext::Value;

    /// Records every request the executor receives and answers `data` keyed by response key.
    #[derive(Clone, Default)]
    struct Recorder {
        requests: Arc<Mutex<Vec<graphql::Request>>>,
    }

    impl Recorder {
        fn executor(&self) -> Executor {
            let requests = self.requests.clone();
            Executor::new(service_fn(move |request: ExecutionRequest| {
                let requests = requests.clone();
                async move {
                    requests.lock().push(request.request.clone());
                    let data: Object = request
                        .request
                        .variables
                        .iter()
                        .map(|(key, value)| (key.clone(), value.clone()))
                        .collect();
                    Ok::<_, BoxError>(ExecutionResult::Single(
                        graphql::Response::builder()
                            .data(Value::Object(data))
                            .build(),
                    ))
                }
            }))
        }

        fn queries(&self) -> Vec<String> {
            self.requests
                .lock()
                .iter()
                .map(|request| request.query.clone().unwrap_or_default())
                .collect()
        }
    }

    fn request(query: &str, value: i32) -> ExecutionRequest {
        ExecutionRequest::builder()
            .request(
                graphql::Request::builder()
                    .query(query)
                    .variable("v", value)
                    .build(),
            )
            .build()
    }

    fn data(result: Result<ExecutionResult, BoxError>) -> Value {
        result
            .unwrap()
            .into_single()
            .unwrap()
            .data
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_execution() {
        let recorder = Recorder::default();
        let executor = create_batching_executor(recorder.executor(), Batching::default());

        let results = join_all((0..3).map(|i| {
            executor
                .clone()
                .oneshot(request("query($v: Int) { echo(v: $v) }", i))
        }))
        .await;

        assert_eq!(recorder.queries().len(), 1);
        // the recorder answers with the variables, which carry the same prefix as fields
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(data(result), json!({ "v": i }));
        }
    }

    #[tokio::test]
    async fn kind_changes_start_a_new_batch() {
        let recorder = Recorder::default();
        let executor = create_batching_executor(recorder.executor(), Batching::default());

        let queries = [
            "query($v: Int) { a(v: $v) }",
            "query($v: Int) { a(v: $v) }",
            "mutation($v: Int) { b(v: $v) }",
            "query($v: Int) { a(v: $v) }",
        ];
        let results = join_all(
            queries
                .iter()
                .enumerate()
                .map(|(i, query)| executor.clone().oneshot(request(query, i as i32))),
        )
        .await;

        let executed = recorder.queries();
        assert_eq!(executed.len(), 3);
        assert!(executed[0].starts_with("query"), "{}", executed[0]);
        assert!(executed[1].starts_with("mutation"), "{}", executed[1]);
        assert!(executed[2].starts_with("query"), "{}", executed[2]);
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(data(result), json!({ "v": i }));
        }
    }

    #[tokio::test]
    async fn batches_respect_the_maximum_size() {
        let recorder = Recorder::default();
        let executor = create_batching_executor(
            recorder.executor(),
            Batching::builder().max_batch_size(2).build(),
        );

        join_all((0..5).map(|i| executor.clone().oneshot(request("{ a }", i)))).await;
        assert_eq!(recorder.queries().len(), 3);
    }

    #[tokio::test]
    async fn disabled_batching_forwards_requests_untouched() {
        let recorder = Recorder::default();
        let executor = create_batching_executor(
            recorder.executor(),
            Batching::builder().enabled(false).build(),
        );

        let results = join_all((0..2).map(|i| executor.clone().oneshot(request("{ a }", i)))).await;
        assert_eq!(recorder.queries(), vec!["{ a }", "{ a }"]);
        assert_eq!(data(results.into_iter().next().unwrap()), json!({ "v": 0 }));
    }

    #[tokio::test]
    async fn transport_failure_fails_the_whole_batch_identically() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let executor = create_batching_executor(
            service_fn(move |_: ExecutionRequest| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<ExecutionResult, BoxError>("connection reset".into()) }
            }),
            Batching::default(),
        );

        let results = join_all((0..3).map(|i| executor.clone().oneshot(request("{ a }", i)))).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            let error = result.unwrap_err();
            assert_eq!(
                error.downcast_ref::<FetchError>(),
                Some(&FetchError::SubrequestTransportError {
                    reason: "connection reset".to_string()
                })
            );
        }
    }

    #[tokio::test]
    async fn malformed_requests_fail_alone() {
        let recorder = Recorder::default();
        let executor = create_batching_executor(recorder.executor(), Batching::default());

        let (bad, good) = futures::join!(
            executor.clone().oneshot(request("{ a ", 0)),
            executor.clone().oneshot(request("query($v: Int) { a(v: $v) }", 1)),
        );
        assert!(matches!(
            bad.unwrap_err().downcast_ref::<FetchError>(),
            Some(FetchError::MalformedRequest { .. })
        ));
        assert_eq!(data(good), json!({ "v": 1 }));
        assert_eq!(recorder.queries().len(), 1);
    }

    #[tokio::test]
    async fn contexts_record_the_batch() {
        let recorder = Recorder::default();
        let executor = create_batching_executor(recorder.executor(), Batching::default());
        let contexts: Vec<Context> = (0..2).map(|_| Context::new()).collect();

        join_all(contexts.iter().enumerate().map(|(i, context)| {
            let mut request = request("{ a }", i as i32);
            request.context = context.clone();
            executor.clone().oneshot(request)
        }))
        .await;

        for (i, context) in contexts.iter().enumerate() {
            assert_eq!(context.get(BATCH_INDEX_CONTEXT_KEY).unwrap(), Some(i));
            assert_eq!(context.get(BATCH_SIZE_CONTEXT_KEY).unwrap(), Some(2usize));
        }
    }

    #[tokio::test]
    async fn incremental_results_are_split_per_request() {
        let executor = create_batching_executor(
            service_fn(|_: ExecutionRequest| async {
                let items = vec![
                    graphql::Response::builder()
                        .data(json!({"_0_a": {"id": 1}, "_1_a": {"id": 2}}))
                        .has_next(true)
                        .build(),
                    graphql::Response::builder()
                        .data(json!({"name": "two"}))
                        .path(crate::json_ext::Path::from("_1_a"))
                        .has_next(false)
                        .build(),
                ];
                Ok::<_, BoxError>(ExecutionResult::Incremental(
                    futures::stream::iter(items).boxed(),
                ))
            }),
            Batching::default(),
        );

        let mut results =
            join_all((0..2).map(|i| executor.clone().oneshot(request("{ a { id } }", i))))
                .await
                .into_iter()
                .map(|result| result.unwrap().into_stream());

        let first: Vec<_> = results.next().unwrap().collect().await;
        let second: Vec<_> = results.next().unwrap().collect().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].data, Some(json!({"a": {"id": 1}})));
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].path, Some(crate::json_ext::Path::from("a")));
        assert_eq!(second[1].data, Some(json!({"name": "two"})));
    }
}
