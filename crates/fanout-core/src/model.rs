//! Backend candidate types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of an ordered set of interchangeable remote services a task may be
/// attempted against.
///
/// This is provider-agnostic: a candidate can name a model API, a hosted
/// browser-automation service, or a locally launched agent process. The
/// registry that resolves it lives in the backend crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendCandidate(String);

impl BackendCandidate {
    /// Create a new candidate from its registry id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the candidate id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for BackendCandidate {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BackendCandidate {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
