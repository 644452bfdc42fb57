use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// Configuration for request coalescing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Batching {
    /// Merge requests submitted in the same scheduling turn into one execution; defaults to true.
    /// When disabled every request is executed on its own, unmerged.
    pub enabled: bool,

    /// Upper bound on the number of requests merged into one execution.
    /// Unbounded when not specified.
    pub max_batch_size: Option<usize>,
}

#[buildstructor::buildstructor]
impl Batching {
    #[builder(visibility = "pub")]
    fn new(enabled: Option<bool>, max_batch_size: Option<usize>) -> Self {
        Self {
            enabled: enabled.unwrap_or(true),
            max_batch_size,
        }
    }
}

impl Default for Batching {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: None,
        }
    }
}
