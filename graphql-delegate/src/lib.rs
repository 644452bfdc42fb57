//! Building blocks for delegating GraphQL execution to another service.
//!
//! * [`batching`] coalesces the requests issued during one scheduling turn into a single
//!   downstream execution and splits the result back per request.
//! * [`pubsub`] holds the fan-out primitives: channels, topics and stream splitting.
//! * [`receiver`] reassembles an incremental result and resolves paths as patches arrive.

pub mod json_ext;

pub mod batching;
pub mod configuration;
mod context;
pub mod error;
pub mod graphql;
pub mod pubsub;
pub mod receiver;
pub mod services;

pub use batching::BatchingLayer;
pub use batching::create_batching_executor;
pub use batching::split_result::split_result;
pub use configuration::Configuration;
pub use context::Context;
pub use error::FetchError;
pub use pubsub::split;
pub use receiver::PatchReceiver;
pub use services::Executor;

/// Reexports for downstream crates
#[doc(hidden)]
pub mod _private {
    pub use serde_json_bytes;
}
