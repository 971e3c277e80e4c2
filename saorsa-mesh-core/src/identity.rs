//! Participant identity
//!
//! Every structure in the mesh is keyed by the participant id of the remote
//! side. The id is opaque to this crate: the embedding application decides
//! what it contains (user id, device id, four-word address, ...), we only
//! require it to be stable for the lifetime of a call.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Opaque, stable identifier of a call participant
///
/// Ordering is lexicographic on the underlying string. It is only used for
/// deterministic iteration and by [`GlarePolicy::LowerIdWins`](crate::types::GlarePolicy).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Create a participant id from anything string-like
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the id is empty (never valid on the wire)
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for ParticipantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
