//! Response assertions.
//!
//! An [`Expectation`] is one of three checks over the raw response bytes.
//! The set of forms is closed: anything else is rejected while the
//! expectation is being built (see [`ExpectationConfig`]), never at match time.

use bytes::Bytes;
use regex::bytes::Regex;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

use crate::config::ConfigError;

/// Byte pattern matched at the start of the response.
#[derive(Clone)]
pub struct BytePattern {
    source: String,
    regex: Regex,
}

impl BytePattern {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(&format!("^(?:{pattern})")).map_err(|e| {
            ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                source: Box::new(e),
            }
        })?;
        Ok(BytePattern {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, response: &[u8]) -> bool {
        self.regex.is_match(response)
    }
}

impl fmt::Debug for BytePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.source)
    }
}

type CheckFn = dyn Fn(&[u8]) -> bool + Send + Sync;

/// Arbitrary check over the response.
#[derive(Clone)]
pub struct Predicate {
    name: String,
    check: Arc<CheckFn>,
}

impl Predicate {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        Predicate {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<predicate {}>", self.name)
    }
}

/// What a response must look like.
#[derive(Debug, Clone)]
pub enum Expectation {
    /// Byte-for-byte equality.
    Exact(Bytes),
    /// Regex anchored at the start of the response.
    Pattern(BytePattern),
    /// Custom predicate.
    Predicate(Predicate),
}

impl Expectation {
    pub fn exact(bytes: impl Into<Bytes>) -> Self {
        Expectation::Exact(bytes.into())
    }

    pub fn pattern(pattern: &str) -> Result<Self, ConfigError> {
        Ok(Expectation::Pattern(BytePattern::new(pattern)?))
    }

    pub fn predicate<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        Expectation::Predicate(Predicate::new(name, check))
    }

    pub fn check(&self, response: &[u8]) -> Result<(), Mismatch> {
        let actual = || Bytes::copy_from_slice(response);
        match self {
            Expectation::Exact(expected) if expected.as_ref() == response => Ok(()),
            Expectation::Exact(expected) => Err(Mismatch::Bytes {
                actual: actual(),
                expected: expected.clone(),
            }),
            Expectation::Pattern(pattern) if pattern.matches(response) => Ok(()),
            Expectation::Pattern(pattern) => Err(Mismatch::Pattern {
                actual: actual(),
                pattern: pattern.as_str().to_string(),
            }),
            Expectation::Predicate(predicate) if (predicate.check)(response) => Ok(()),
            Expectation::Predicate(predicate) => Err(Mismatch::Predicate {
                actual: actual(),
                name: predicate.name.clone(),
            }),
        }
    }
}

/// Check a response; no expectation means the check is skipped.
pub fn check(response: &[u8], expectation: Option<&Expectation>) -> Result<(), Mismatch> {
    match expectation {
        Some(expectation) => expectation.check(response),
        None => Ok(()),
    }
}

/// Serializable expectation used in config files.
///
/// Predicates only exist in code, so they have no form here.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExpectationConfig {
    Exact(String),
    Pattern(String),
}

impl ExpectationConfig {
    pub fn build(self) -> Result<Expectation, ConfigError> {
        match self {
            ExpectationConfig::Exact(text) => Ok(Expectation::exact(text.into_bytes())),
            ExpectationConfig::Pattern(pattern) => Expectation::pattern(&pattern),
        }
    }
}

/// A response that failed its expectation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Mismatch {
    #[error("Received {actual:?} while expecting {expected:?}")]
    Bytes { actual: Bytes, expected: Bytes },

    #[error("Result {actual:?} does not match pattern /{pattern}/")]
    Pattern { actual: Bytes, pattern: String },

    #[error("Result {actual:?} did not pass check '{name}'")]
    Predicate { actual: Bytes, name: String },
}
