//! Security policy bitmask and SASL mechanism table.
//!
//! A [`SecurityLevel`] is used two ways: as the set of protections a node
//! *requires* (local policy united with what the server advertises), and as
//! the set of protections a replica or a live session *offers*. A replica is
//! acceptable when what it offers contains everything that is required.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

// ============================================================================
// Security Level
// ============================================================================

/// Set of session protection flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecurityLevel(u32);

impl SecurityLevel {
    /// No protection required or offered.
    pub const NONE: Self = Self(0);
    /// Passwords must never cross the wire in clear.
    pub const DISALLOW_CLEARTEXT: Self = Self(0x0001);
    /// Mutual authentication, defeating man-in-the-middle attacks.
    pub const MAN_IN_MIDDLE: Self = Self(0x0002);
    /// Every packet is integrity protected.
    pub const PACKET_SIGNING: Self = Self(0x0004);
    /// Every packet is encrypted.
    pub const PACKET_ENCRYPTION: Self = Self(0x0008);
    /// All protections.
    pub const ALL: Self = Self(0x000F);

    const NAMES: [(Self, &'static str); 4] = [
        (Self::DISALLOW_CLEARTEXT, "no-cleartext"),
        (Self::MAN_IN_MIDDLE, "mitm"),
        (Self::PACKET_SIGNING, "signing"),
        (Self::PACKET_ENCRYPTION, "encryption"),
    ];

    /// Builds a level from raw bits, dropping unknown flags.
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true when no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true when every flag of `other` is also set here.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true when at least one flag is shared.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns the union of both sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns the flags of `self` that are not in `other`.
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns true when this offered level meets `required`.
    #[must_use]
    pub const fn satisfies(self, required: Self) -> bool {
        self.contains(required)
    }

    /// Protections provided by a TLS transport.
    #[must_use]
    pub const fn tls() -> Self {
        Self::ALL
    }

    /// Protections offered by a server advertising `mechanisms`.
    ///
    /// Unknown mechanism names contribute nothing.
    #[must_use]
    pub fn from_mechanisms<S: AsRef<str>>(mechanisms: &[S]) -> Self {
        mechanisms
            .iter()
            .filter_map(|m| m.as_ref().parse::<SaslMechanism>().ok())
            .fold(Self::NONE, |acc, m| acc | m.security())
    }
}

impl BitOr for SecurityLevel {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for SecurityLevel {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for SecurityLevel {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecurityLevel({self})")
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join("|"))
    }
}

// ============================================================================
// SASL Mechanisms
// ============================================================================

/// Credential mechanisms understood by authentication negotiation.
///
/// Variants are declared in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SaslMechanism {
    /// Kerberos v5 through GSSAPI.
    #[serde(rename = "GSSAPI")]
    Gssapi,
    /// DIGEST-MD5 challenge/response.
    #[serde(rename = "DIGEST-MD5")]
    DigestMd5,
    /// CRAM-MD5 challenge/response.
    #[serde(rename = "CRAM-MD5")]
    CramMd5,
}

impl SaslMechanism {
    /// Mechanisms in negotiation order.
    pub const PREFERENCE: [Self; 3] = [Self::Gssapi, Self::DigestMd5, Self::CramMd5];

    /// Returns the IANA mechanism name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gssapi => "GSSAPI",
            Self::DigestMd5 => "DIGEST-MD5",
            Self::CramMd5 => "CRAM-MD5",
        }
    }

    /// Protections a session bound with this mechanism receives.
    #[must_use]
    pub const fn security(&self) -> SecurityLevel {
        match self {
            Self::Gssapi => SecurityLevel::ALL,
            Self::DigestMd5 => SecurityLevel(
                SecurityLevel::DISALLOW_CLEARTEXT.0 | SecurityLevel::MAN_IN_MIDDLE.0,
            ),
            Self::CramMd5 => SecurityLevel::DISALLOW_CLEARTEXT,
        }
    }
}

impl fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SaslMechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GSSAPI" => Ok(Self::Gssapi),
            "DIGEST-MD5" => Ok(Self::DigestMd5),
            "CRAM-MD5" => Ok(Self::CramMd5),
            other => Err(Error::config(format!("unknown SASL mechanism {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_and_satisfies() {
        let offered = SecurityLevel::DISALLOW_CLEARTEXT | SecurityLevel::MAN_IN_MIDDLE;
        assert!(offered.satisfies(SecurityLevel::DISALLOW_CLEARTEXT));
        assert!(offered.satisfies(SecurityLevel::NONE));
        assert!(!offered.satisfies(SecurityLevel::PACKET_SIGNING));
        assert!(SecurityLevel::NONE.satisfies(SecurityLevel::NONE));
    }

    #[test]
    fn truncates_unknown_bits() {
        assert_eq!(SecurityLevel::from_bits_truncate(0xFF), SecurityLevel::ALL);
        assert_eq!(SecurityLevel::from_bits_truncate(0x10), SecurityLevel::NONE);
    }

    #[test]
    fn mechanisms_accumulate_security() {
        let level = SecurityLevel::from_mechanisms(&["CRAM-MD5", "PLAIN", "digest-md5"]);
        assert_eq!(
            level,
            SecurityLevel::DISALLOW_CLEARTEXT | SecurityLevel::MAN_IN_MIDDLE
        );
        assert_eq!(SecurityLevel::from_mechanisms(&["GSSAPI"]), SecurityLevel::ALL);
        assert!(SecurityLevel::from_mechanisms::<&str>(&[]).is_empty());
    }

    #[test]
    fn display_lists_flags() {
        assert_eq!(SecurityLevel::NONE.to_string(), "none");
        assert_eq!(
            (SecurityLevel::PACKET_SIGNING | SecurityLevel::DISALLOW_CLEARTEXT).to_string(),
            "no-cleartext|signing"
        );
    }

    #[test]
    fn difference_removes_flags() {
        let required = SecurityLevel::ALL;
        let missing = required.difference(SaslMechanism::CramMd5.security());
        assert!(!missing.contains(SecurityLevel::DISALLOW_CLEARTEXT));
        assert!(missing.contains(SecurityLevel::PACKET_ENCRYPTION));
    }

    #[test]
    fn mechanism_round_trip_through_name() {
        for mech in SaslMechanism::PREFERENCE {
            assert_eq!(mech.as_str().parse::<SaslMechanism>().unwrap(), mech);
        }
        assert!("PLAIN".parse::<SaslMechanism>().is_err());
    }

    #[test]
    fn level_serializes_as_number() {
        let json = serde_json::to_string(&SecurityLevel::PACKET_SIGNING).unwrap();
        assert_eq!(json, "4");
    }
}
