//! The service seams of delegated execution.

pub use self::execution::OperationKind;
pub use crate::services::execution::Request as ExecutionRequest;
pub use crate::services::execution::Response as ExecutionResult;

pub mod execution;

/// Any downstream executor, boxed.
///
/// Executors are `tower` services from [`ExecutionRequest`] to [`ExecutionResult`]; the
/// batching executor returned by [`crate::create_batching_executor`] has this same shape.
pub type Executor = execution::BoxCloneService;
