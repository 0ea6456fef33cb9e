//! Network reachability boundary.

use std::fmt;
use std::net::SocketAddr;

use tokio::sync::mpsc;

/// What a subscription watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReachabilityTarget {
    /// A resolved socket address.
    Address(SocketAddr),
    /// A host name, watched before it resolves.
    Host(String),
}

impl fmt::Display for ReachabilityTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(addr) => write!(f, "{addr}"),
            Self::Host(host) => f.write_str(host),
        }
    }
}

/// One reachability notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachabilityEvent {
    /// The target can be reached.
    pub reachable: bool,
    /// Reaching the target first requires bringing up a connection.
    pub connection_required: bool,
}

impl ReachabilityEvent {
    /// Reachable without further setup.
    pub const UP: Self = Self {
        reachable: true,
        connection_required: false,
    };

    /// Not reachable.
    pub const DOWN: Self = Self {
        reachable: false,
        connection_required: false,
    };

    /// Returns whether traffic can flow right now.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.reachable && !self.connection_required
    }
}

/// Source of reachability notifications.
///
/// Dropping the receiver ends the subscription.
pub trait ReachabilityProvider: Send + Sync {
    /// Subscribes to changes for `target`.
    fn subscribe(&self, target: &ReachabilityTarget) -> mpsc::Receiver<ReachabilityEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_requires_no_pending_connection() {
        assert!(ReachabilityEvent::UP.is_usable());
        assert!(!ReachabilityEvent::DOWN.is_usable());
        let dial_up = ReachabilityEvent {
            reachable: true,
            connection_required: true,
        };
        assert!(!dial_up.is_usable());
    }

    #[test]
    fn target_display() {
        let addr = ReachabilityTarget::Address("10.1.2.3:389".parse().unwrap());
        assert_eq!(addr.to_string(), "10.1.2.3:389");
        assert_eq!(
            ReachabilityTarget::Host("ldap.example.com".to_string()).to_string(),
            "ldap.example.com"
        );
    }
}
