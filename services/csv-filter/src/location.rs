//! Object locations of the form `scheme://bucket/path/to/object`.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

/// Scheme used when a bucket prefix does not carry one
const DEFAULT_SCHEME: &str = "s3";

/// Errors raised while building an [`ObjectLocation`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    #[error("URL '{url}' is not a valid location: {reason}")]
    Invalid { url: String, reason: String },

    #[error("URL '{0}' does not contain a bucket")]
    MissingBucket(String),

    #[error("URL '{0}' does not contain a file path")]
    MissingPath(String),
}

/// A validated reference to an object in a bucket.
///
/// Both the bucket and a non-empty path are guaranteed to be present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    url: Url,
    key: String,
}

impl ObjectLocation {
    /// Parse and validate a location URL
    pub fn parse(text: &str) -> Result<Self, LocationError> {
        let url = Url::parse(text).map_err(|e| LocationError::Invalid {
            url: text.to_string(),
            reason: e.to_string(),
        })?;

        match url.host_str() {
            Some(host) if !host.is_empty() => {}
            _ => return Err(LocationError::MissingBucket(text.to_string())),
        }

        let raw_key = url.path().trim_start_matches('/');
        if raw_key.is_empty() {
            return Err(LocationError::MissingPath(text.to_string()));
        }

        let key = percent_decode_str(raw_key)
            .decode_utf8()
            .map_err(|e| LocationError::Invalid {
                url: text.to_string(),
                reason: e.to_string(),
            })?
            .into_owned();

        Ok(Self { url, key })
    }

    /// Build a location for `file_name` inside a bucket prefix.
    ///
    /// The prefix may be a bare bucket (`filter-bucket`), a bucket with a
    /// folder (`bucket/folder/`) or a full URL (`s3://bucket/`). A missing
    /// scheme defaults to `s3://` and the prefix always ends with exactly
    /// one separator before the file name is appended. The file name is a
    /// single path segment; `#`, `?` and `/` in it are percent-encoded.
    pub fn under_prefix(prefix: &str, file_name: &str) -> Result<Self, LocationError> {
        let mut base = if prefix.contains("://") {
            prefix.to_string()
        } else {
            format!("{}://{}", DEFAULT_SCHEME, prefix)
        };

        let trimmed_len = base.trim_end_matches('/').len();
        base.truncate(trimmed_len);

        let invalid = |reason: &str| LocationError::Invalid {
            url: base.clone(),
            reason: reason.to_string(),
        };

        let mut url = Url::parse(&base).map_err(|e| invalid(&e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("prefix cannot hold a path"))?
            .push(file_name);

        Self::parse(url.as_str())
    }

    /// Scheme of the location (`s3` for most callers)
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Bucket name
    pub fn bucket(&self) -> &str {
        // Presence of a host is checked in `parse`
        self.url.host_str().unwrap_or_default()
    }

    /// Object key within the bucket, without the leading separator
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last path segment of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Extension of the object name, without the leading dot
    pub fn extension(&self) -> Option<&str> {
        Path::new(self.file_name())
            .extension()
            .and_then(|ext| ext.to_str())
    }

    /// Canonical URL text
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

impl FromStr for ObjectLocation {
    type Err = LocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ObjectLocation {
    type Error = LocationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl Serialize for ObjectLocation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ObjectLocation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
