//! Logic for loading configuration in to an object model
mod batching;
mod pubsub;

use std::str::FromStr;

pub use batching::Batching;
use displaydoc::Display;
pub use pubsub::PubSubConfig;
use schemars::JsonSchema;
use schemars::r#gen::SchemaSettings;
use schemars::schema::RootSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error, Display)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// {message}: {error}
    InvalidConfiguration {
        /// What is wrong.
        message: &'static str,
        /// Details of the failure.
        error: String,
    },
    /// could not deserialize configuration: {0}
    DeserializeConfigError(serde_yaml::Error),
}

/// The configuration of the delegation layer.
///
/// Can be created through `serde::Deserialize` from various formats,
/// or inline in Rust code with the builder.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Request coalescing of delegated executions.
    pub batching: Batching,

    /// Delivery of patch values to waiting requesters.
    pub pubsub: PubSubConfig,
}

#[buildstructor::buildstructor]
impl Configuration {
    #[builder(visibility = "pub")]
    fn new(batching: Option<Batching>, pubsub: Option<PubSubConfig>) -> Self {
        Self {
            batching: batching.unwrap_or_default(),
            pubsub: pubsub.unwrap_or_default(),
        }
    }

    /// Checks the values serde cannot reject on its own.
    pub fn validate(self) -> Result<Self, ConfigurationError> {
        if self.batching.max_batch_size == Some(0) {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "batching.max_batch_size must be greater than 0",
                error: "a batch needs room for at least one request".to_string(),
            });
        }
        if self.pubsub.subscriber_capacity == 0 {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "pubsub.subscriber_capacity must be greater than 0",
                error: "a subscriber needs room for at least one value".to_string(),
            });
        }
        Ok(self)
    }

    /// Generate a JSON schema for the configuration.
    pub fn schema() -> RootSchema {
        let settings = SchemaSettings::draft07().with(|s| {
            s.option_nullable = true;
            s.option_add_null_type = false;
            s.inline_subschemas = true;
        });
        settings.into_generator().into_root_schema_for::<Configuration>()
    }
}

/// Parse configuration from a string in YAML syntax
impl FromStr for Configuration {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let configuration: Configuration =
            serde_yaml::from_str(s).map_err(ConfigurationError::DeserializeConfigError)?;
        configuration.validate()
    }
}
