//! Strongly-typed identifiers shared across the daemon.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a captured replay state.
///
/// The empty id is meaningful: it marks "no state", both for the
/// dependent-state field of a replay request and for the fields of the
/// prewarm record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(String);

impl StateId {
    /// The empty state id.
    pub fn none() -> Self {
        Self(String::new())
    }

    /// True if this id marks "no state".
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StateId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StateId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<none>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Identifier of a resource referenced by a replay payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// The raw identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resource blob together with its identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// The resource identifier.
    pub id: ResourceId,
    /// The resource payload.
    pub data: Vec<u8>,
}

impl Resource {
    /// Create a resource from an id and its bytes.
    pub fn new(id: impl Into<ResourceId>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
        }
    }
}

/// How an interpretation run should terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretMode {
    /// Run the instruction stream to completion.
    Terminating,
    /// Run the common prefix only and keep the context warm. Used when
    /// priming a standby context.
    Priming,
}

impl InterpretMode {
    /// True for a priming (non-terminating) run.
    pub fn is_priming(self) -> bool {
        matches!(self, InterpretMode::Priming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_state_id_is_none() {
        assert!(StateId::none().is_empty());
        assert!(StateId::from("").is_empty());
        assert!(!StateId::from("frame-7").is_empty());
    }

    #[test]
    fn state_id_display() {
        assert_eq!(StateId::none().to_string(), "<none>");
        assert_eq!(StateId::from("s1").to_string(), "s1");
    }

    #[test]
    fn interpret_mode_priming() {
        assert!(InterpretMode::Priming.is_priming());
        assert!(!InterpretMode::Terminating.is_priming());
    }
}
