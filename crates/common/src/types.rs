//! Common data types for topic service components.

use crate::error::{ParseError, Result};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Prefix of the external form of a user id.
const USER_PREFIX: &str = "usr";
/// Prefix of the internal name of a two-party topic.
const P2P_PREFIX: &str = "p2p";
/// Prefix of the internal name of a per-user search topic.
const FND_PREFIX: &str = "fnd";
/// Prefix of a group topic name.
const GRP_PREFIX: &str = "grp";
/// Prefix a client uses to ask for a brand new group topic.
const NEW_PREFIX: &str = "new";

/// Unique identifier for a user.
///
/// The zero value means "no user" and is never assigned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(u64);

impl Uid {
    /// The "no user" value.
    pub const ZERO: Uid = Uid(0);

    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Create a new random, non-zero user id
    #[must_use]
    pub fn random() -> Self {
        loop {
            let raw: u64 = rand::random();
            if raw != 0 {
                return Self(raw);
            }
        }
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// External form, `usr` followed by 16 hex digits.
    #[must_use]
    pub fn user_id(self) -> String {
        format!("{USER_PREFIX}{:016x}", self.0)
    }

    /// Parse the external `usr…` form.
    ///
    /// # Errors
    ///
    /// Returns `ParseError::InvalidUserId` if the prefix or the hex body is wrong,
    /// or if the id is zero.
    pub fn parse_user_id(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix(USER_PREFIX)
            .ok_or_else(|| ParseError::InvalidUserId(s.to_string()))?;
        match u64::from_str_radix(body, 16) {
            Ok(raw) if raw != 0 => Ok(Self(raw)),
            _ => Err(ParseError::InvalidUserId(s.to_string())),
        }
    }

    /// Internal name of the two-party topic between `self` and `other`.
    ///
    /// The name does not depend on argument order.
    #[must_use]
    pub fn p2p_name(self, other: Uid) -> String {
        let (lo, hi) = if self.0 <= other.0 {
            (self.0, other.0)
        } else {
            (other.0, self.0)
        };
        format!("{P2P_PREFIX}{lo:016x}{hi:016x}")
    }

    /// Split a two-party topic name into its two user ids.
    #[must_use]
    pub fn from_p2p_name(name: &str) -> Option<(Uid, Uid)> {
        let body = name.strip_prefix(P2P_PREFIX)?;
        if body.len() != 32 || !body.is_ascii() {
            return None;
        }
        let (a, b) = body.split_at(16);
        let a = u64::from_str_radix(a, 16).ok()?;
        let b = u64::from_str_radix(b, 16).ok()?;
        Some((Uid(a), Uid(b)))
    }

    /// Internal name of this user's search topic.
    #[must_use]
    pub fn fnd_name(self) -> String {
        format!("{FND_PREFIX}{:016x}", self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{USER_PREFIX}{:016x}", self.0)
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.user_id())
    }
}

/// Generate a random group topic name.
#[must_use]
pub fn new_group_name() -> String {
    format!("{GRP_PREFIX}{:016x}", Uid::random().as_u64())
}

/// Topic category, derived from the name a client addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicCategory {
    /// Per-user meta-channel.
    Me,
    /// Per-user search topic.
    Fnd,
    /// Two-party conversation.
    P2P,
    /// Group conversation.
    Grp,
}

impl TopicCategory {
    /// Category of a client-facing topic name.
    ///
    /// `usr…` names address the two-party topic with that user. `new…` names
    /// request a group topic that does not exist yet.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        if name == "me" {
            Some(Self::Me)
        } else if name == "fnd" {
            Some(Self::Fnd)
        } else if name.starts_with(USER_PREFIX) || name.starts_with(P2P_PREFIX) {
            Some(Self::P2P)
        } else if name.starts_with(GRP_PREFIX) || name.starts_with(NEW_PREFIX) {
            Some(Self::Grp)
        } else {
            None
        }
    }

    /// Whether a client name asks for a new group topic.
    #[must_use]
    pub fn is_new_group_request(name: &str) -> bool {
        name.starts_with(NEW_PREFIX)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Me => "me",
            Self::Fnd => "fnd",
            Self::P2P => "p2p",
            Self::Grp => "grp",
        }
    }
}

/// Authentication level of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AuthLevel {
    /// Not authenticated.
    #[default]
    None,
    /// Anonymous user.
    Anon,
    /// Authenticated user.
    Auth,
    /// Superuser.
    Root,
}

impl AuthLevel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Anon => "anon",
            Self::Auth => "auth",
            Self::Root => "root",
        }
    }
}

impl fmt::Display for AuthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthLevel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "anon" => Ok(Self::Anon),
            "auth" => Ok(Self::Auth),
            "root" => Ok(Self::Root),
            _ => Err(ParseError::InvalidAuthLevel(s.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_format_and_parse() {
        let uid = Uid::new(0xabc);
        assert_eq!(uid.user_id(), "usr0000000000000abc");
        assert_eq!(Uid::parse_user_id(&uid.user_id()).unwrap(), uid);
        assert_eq!(uid.to_string(), uid.user_id());
    }

    #[test]
    fn test_parse_user_id_rejects_garbage() {
        assert!(Uid::parse_user_id("grp123").is_err());
        assert!(Uid::parse_user_id("usrxyz").is_err());
        assert!(Uid::parse_user_id("usr0").is_err());
        assert!(Uid::parse_user_id("").is_err());
    }

    #[test]
    fn test_p2p_name_is_symmetric() {
        let a = Uid::new(7);
        let b = Uid::new(3);
        assert_eq!(a.p2p_name(b), b.p2p_name(a));
        assert_eq!(Uid::from_p2p_name(&a.p2p_name(b)), Some((b, a)));
        assert_eq!(Uid::from_p2p_name("p2pshort"), None);
    }

    #[test]
    fn test_random_uid_is_not_zero() {
        for _ in 0..100 {
            assert!(!Uid::random().is_zero());
        }
    }

    #[test]
    fn test_group_name_prefix() {
        let name = new_group_name();
        assert!(name.starts_with("grp"));
        assert_eq!(TopicCategory::from_name(&name), Some(TopicCategory::Grp));
    }

    #[test]
    fn test_category_from_name() {
        assert_eq!(TopicCategory::from_name("me"), Some(TopicCategory::Me));
        assert_eq!(TopicCategory::from_name("fnd"), Some(TopicCategory::Fnd));
        assert_eq!(
            TopicCategory::from_name("usr0000000000000001"),
            Some(TopicCategory::P2P)
        );
        assert_eq!(TopicCategory::from_name("newabc"), Some(TopicCategory::Grp));
        assert!(TopicCategory::is_new_group_request("newabc"));
        assert_eq!(TopicCategory::from_name("chan"), None);
    }

    #[test]
    fn test_auth_level_round_trip() {
        for level in [AuthLevel::Anon, AuthLevel::Auth, AuthLevel::Root] {
            assert_eq!(level.to_string().parse::<AuthLevel>().unwrap(), level);
        }
        assert!("admin".parse::<AuthLevel>().is_err());
    }

    #[test]
    fn test_uid_serializes_as_user_id() {
        let json = serde_json::to_string(&Uid::new(1)).unwrap();
        assert_eq!(json, "\"usr0000000000000001\"");
    }
}
