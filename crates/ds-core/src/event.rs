//! Connection trust states and transition records.
//!
//! Every status change of a pooled connection produces a
//! [`StatusTransition`]. The record is logged and forwarded to the
//! node-availability cache so other subsystems can short-circuit nodes that
//! are known to be down.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a cached session may be reused without re-verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ConnectionStatus {
    /// The session is usable.
    Safe = 0,
    /// The session is known bad or absent.
    Unsafe = 1,
    /// Reachability was lost; retry optimistically.
    Unknown = 2,
}

impl ConnectionStatus {
    /// Decodes the value stored in an atomic.
    ///
    /// Unrecognised values decode as `Unknown`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Safe,
            1 => Self::Unsafe,
            _ => Self::Unknown,
        }
    }

    /// Encodes the value for storage in an atomic.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns whether a node in this state should be reported available.
    #[must_use]
    pub const fn is_available(self) -> bool {
        !matches!(self, Self::Unsafe)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Safe => "safe",
            Self::Unsafe => "unsafe",
            Self::Unknown => "unknown",
        })
    }
}

/// A single status change of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    /// Node the connection belongs to.
    pub node: String,

    /// Previous status.
    pub from: ConnectionStatus,

    /// New status.
    pub to: ConnectionStatus,

    /// When the change happened.
    pub at: DateTime<Utc>,
}

impl StatusTransition {
    /// Records a transition happening now.
    #[must_use]
    pub fn now(node: impl Into<String>, from: ConnectionStatus, to: ConnectionStatus) -> Self {
        Self {
            node: node.into(),
            from,
            to,
            at: Utc::now(),
        }
    }

    /// Returns whether availability flipped with this transition.
    #[must_use]
    pub const fn changes_availability(&self) -> bool {
        self.from.is_available() != self.to.is_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_u8() {
        for status in [
            ConnectionStatus::Safe,
            ConnectionStatus::Unsafe,
            ConnectionStatus::Unknown,
        ] {
            assert_eq!(ConnectionStatus::from_u8(status.as_u8()), status);
        }
        assert_eq!(ConnectionStatus::from_u8(200), ConnectionStatus::Unknown);
    }

    #[test]
    fn only_unsafe_is_unavailable() {
        assert!(ConnectionStatus::Safe.is_available());
        assert!(ConnectionStatus::Unknown.is_available());
        assert!(!ConnectionStatus::Unsafe.is_available());
    }

    #[test]
    fn transition_detects_availability_flip() {
        let down = StatusTransition::now("node", ConnectionStatus::Safe, ConnectionStatus::Unsafe);
        assert!(down.changes_availability());

        let optimistic =
            StatusTransition::now("node", ConnectionStatus::Unsafe, ConnectionStatus::Unknown);
        assert!(optimistic.changes_availability());

        let lost = StatusTransition::now("node", ConnectionStatus::Safe, ConnectionStatus::Unknown);
        assert!(!lost.changes_availability());
    }

    #[test]
    fn transition_serializes_status_names() {
        let record =
            StatusTransition::now("/LDAPv3/a", ConnectionStatus::Safe, ConnectionStatus::Unsafe);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"SAFE\""));
        assert!(json.contains("\"UNSAFE\""));
    }
}
