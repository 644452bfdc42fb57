use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 128;

/// Configuration for patch delivery
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct PubSubConfig {
    /// How many undelivered values a single subscriber may hold before it is stopped;
    /// defaults to 128.
    pub subscriber_capacity: usize,
}

#[buildstructor::buildstructor]
impl PubSubConfig {
    #[builder(visibility = "pub")]
    fn new(subscriber_capacity: Option<usize>) -> Self {
        Self {
            subscriber_capacity: subscriber_capacity.unwrap_or(DEFAULT_SUBSCRIBER_CAPACITY),
        }
    }
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}
