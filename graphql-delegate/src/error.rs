//! Delegation errors.
use displaydoc::Display;
use serde::Serialize;
use thiserror::Error;

use crate::graphql::Error;
use crate::json_ext::Path;
use crate::json_ext::Value;

/// Error types for delegated execution.
///
/// These are never sent to the client as is, they are converted with
/// [`FetchError::to_graphql_error`] first.
#[derive(Error, Display, Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(untagged)]
#[ignore_extra_doc_attributes]
#[non_exhaustive]
pub enum FetchError {
    /// request was malformed: {reason}
    MalformedRequest {
        /// The reason the request could not be understood.
        reason: String,
    },

    /// batched fetch failed: {reason}
    ///
    /// Every request of the batch receives this same error.
    SubrequestTransportError {
        /// The stringified transport failure.
        reason: String,
    },

    /// cannot merge patch at '{path}': {reason}
    MergeConflict {
        /// Where the walk into the reconstructed tree stopped.
        path: Path,

        /// What was found instead of a mergeable value.
        reason: String,
    },

    /// subscriber fell more than {capacity} values behind and was stopped
    Backpressure {
        /// The delivery queue size of the subscriber.
        capacity: usize,
    },

    /// initial result could not be fetched: {reason}
    BaselineFailed {
        /// The failure reason.
        reason: String,
    },

    /// receiver used out of order: {reason}
    ReceiverState {
        /// What was called out of order.
        reason: String,
    },

    /// batch was dropped before it produced a result
    BatchCancelled,
}

impl FetchError {
    /// Convert the fetch error to a GraphQL error.
    pub fn to_graphql_error(&self, path: Option<Path>) -> Error {
        let mut value: Value = serde_json_bytes::to_value(self).unwrap_or_default();
        if let Some(extensions) = value.as_object_mut() {
            extensions
                .entry("code")
                .or_insert_with(|| self.extension_code().into());
            // the merge path is already reported as the error path
            if let FetchError::MergeConflict { .. } = self {
                extensions.remove("path");
            }

            Error::builder()
                .message(self.to_string())
                .and_path(path)
                .extensions(extensions.clone())
                .build()
        } else {
            Error::builder()
                .message(self.to_string())
                .and_path(path)
                .extension("code", self.extension_code())
                .build()
        }
    }

    /// The machine readable code reported in `extensions.code`.
    pub fn extension_code(&self) -> &'static str {
        match self {
            FetchError::MalformedRequest { .. } => "MALFORMED_REQUEST",
            FetchError::SubrequestTransportError { .. } => "SUBREQUEST_TRANSPORT_ERROR",
            FetchError::MergeConflict { .. } => "MERGE_CONFLICT",
            FetchError::Backpressure { .. } => "BACKPRESSURE",
            FetchError::BaselineFailed { .. } => "BASELINE_FAILED",
            FetchError::ReceiverState { .. } => "RECEIVER_STATE",
            FetchError::BatchCancelled => "BATCH_CANCELLED",
        }
    }
}
