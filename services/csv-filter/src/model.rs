//! Messages exchanged with callers and downstream consumers.

use crate::location::{LocationError, ObjectLocation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Acceptable values per dimension name
pub type DimensionFilters = HashMap<String, HashSet<String>>;

/// Filter request received over HTTP or from Kafka
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterRequest {
    /// Correlation ID carried through every log line and the notification
    #[serde(default = "new_request_id")]
    pub request_id: String,
    /// Source CSV file
    pub input_url: ObjectLocation,
    /// Where the final artifact should end up
    pub output_url: ObjectLocation,
    /// Dimension name to acceptable values; empty means no filtering
    #[serde(default)]
    pub dimensions: DimensionFilters,
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

impl FilterRequest {
    /// Build a request from raw URLs, generating a request ID
    pub fn new(
        input_url: &str,
        output_url: &str,
        dimensions: DimensionFilters,
    ) -> Result<Self, LocationError> {
        Ok(Self {
            request_id: new_request_id(),
            input_url: ObjectLocation::parse(input_url)?,
            output_url: ObjectLocation::parse(output_url)?,
            dimensions,
        })
    }

    /// Replace the generated request ID
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

impl fmt::Display for FilterRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Sorted so log lines are stable between runs
        let dimensions: BTreeMap<&str, BTreeSet<&str>> = self
            .dimensions
            .iter()
            .map(|(name, values)| (name.as_str(), values.iter().map(String::as_str).collect()))
            .collect();

        write!(
            f,
            "FilterRequest{{RequestID: \"{}\", InputURL: \"{}\", OutputURL: \"{}\", Dimensions: {:?}}}",
            self.request_id, self.input_url, self.output_url, dimensions
        )
    }
}

/// Notification published once a filtered file has been stored.
///
/// `input_url` is the filtered file, `output_url` the caller's final
/// destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformRequest {
    pub request_id: String,
    pub input_url: ObjectLocation,
    pub output_url: ObjectLocation,
}

impl TransformRequest {
    pub fn new(
        request_id: impl Into<String>,
        input_url: ObjectLocation,
        output_url: ObjectLocation,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            input_url,
            output_url,
        }
    }
}

impl fmt::Display for TransformRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransformRequest{{RequestID: \"{}\", InputURL: \"{}\", OutputURL: \"{}\"}}",
            self.request_id, self.input_url, self.output_url
        )
    }
}

/// Body returned by the `/filter` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterResponse {
    pub message: String,
}

impl FilterResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
