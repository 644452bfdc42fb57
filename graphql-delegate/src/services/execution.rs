//! The delegated execution step: one GraphQL request in, one result (possibly a stream) out.

use std::fmt;
use std::fmt::Display;

use futures::StreamExt;
use futures::stream;
use serde::Deserialize;
use serde::Serialize;
use tower::BoxError;

use crate::Context;
use crate::graphql;

pub type BoxCloneService = tower::util::BoxCloneService<Request, Response, BoxError>;

#[non_exhaustive]
pub struct Request {
    /// The GraphQL request handed to the downstream executor.
    pub request: graphql::Request,

    pub context: Context,
}

#[buildstructor::buildstructor]
impl Request {
    /// This is the constructor (or builder) to use when constructing a real ExecutionRequest.
    #[builder(visibility = "pub")]
    fn new(request: graphql::Request, context: Option<Context>) -> Request {
        Self {
            request,
            context: context.unwrap_or_default(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("request", &self.request)
            .finish()
    }
}

/// What a downstream executor produced.
pub enum Response {
    /// A complete result.
    Single(graphql::Response),

    /// An initial result followed by patches.
    Incremental(graphql::ResponseStream),
}

impl Response {
    /// The single result, if this is not a stream.
    pub fn into_single(self) -> Option<graphql::Response> {
        match self {
            Response::Single(response) => Some(response),
            Response::Incremental(_) => None,
        }
    }

    /// Views either shape as a stream; a single result becomes a one item stream.
    pub fn into_stream(self) -> graphql::ResponseStream {
        match self {
            Response::Single(response) => stream::once(async move { response }).boxed(),
            Response::Incremental(stream) => stream,
        }
    }
}

impl From<graphql::Response> for Response {
    fn from(response: graphql::Response) -> Self {
        Response::Single(response)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Single(response) => f.debug_tuple("Single").field(response).finish(),
            Response::Incremental(_) => f.debug_tuple("Incremental").finish_non_exhaustive(),
        }
    }
}

/// GraphQL operation type.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl OperationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

impl From<OperationKind> for apollo_compiler::ast::OperationType {
    fn from(value: OperationKind) -> Self {
        match value {
            OperationKind::Query => apollo_compiler::ast::OperationType::Query,
            OperationKind::Mutation => apollo_compiler::ast::OperationType::Mutation,
            OperationKind::Subscription => apollo_compiler::ast::OperationType::Subscription,
        }
    }
}

impl From<apollo_compiler::ast::OperationType> for OperationKind {
    fn from(value: apollo_compiler::ast::OperationType) -> Self {
        match value {
            apollo_compiler::ast::OperationType::Query => OperationKind::Query,
            apollo_compiler::ast::OperationType::Mutation => OperationKind::Mutation,
            apollo_compiler::ast::OperationType::Subscription => OperationKind::Subscription,
        }
    }
}
