//! Access-mode bitmasks.
//!
//! An `AccessMode` is a set of capabilities a subscriber holds on a topic:
//!
//! | Letter | Bit | Meaning |
//! |--------|-----|---------|
//! | `J` | Join | may attach to the topic |
//! | `R` | Read | may receive data messages |
//! | `W` | Write | may publish data messages |
//! | `P` | Presence | receives presence notifications |
//! | `A` | Approve | may approve join requests, evict members |
//! | `S` | Share | may invite other users |
//! | `D` | Delete | may hard-delete messages |
//! | `O` | Owner | topic owner |
//!
//! `N` is the explicit empty set. The unset value is distinct from `N`: it
//! means "use the default" and formats as an empty string.
//!
//! Authorization is always checked against the effective mode,
//! `given & want`, never either side alone.

use crate::error::{ParseError, Result};
use serde::{Serialize, Serializer};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};
use std::str::FromStr;

/// Capability letters in bit order.
const MODE_LETTERS: [(char, u32); 8] = [
    ('J', AccessMode::JOIN.0),
    ('R', AccessMode::READ.0),
    ('W', AccessMode::WRITE.0),
    ('P', AccessMode::PRES.0),
    ('A', AccessMode::APPROVE.0),
    ('S', AccessMode::SHARE.0),
    ('D', AccessMode::DELETE.0),
    ('O', AccessMode::OWNER.0),
];

/// Mask covering all capability bits.
const CAPABILITY_BITS: u32 = 0xFF;

/// Capability bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessMode(u32);

impl AccessMode {
    pub const JOIN: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE: Self = Self(0x04);
    pub const PRES: Self = Self(0x08);
    pub const APPROVE: Self = Self(0x10);
    pub const SHARE: Self = Self(0x20);
    pub const DELETE: Self = Self(0x40);
    pub const OWNER: Self = Self(0x80);

    /// Explicitly no access (`N`).
    pub const NONE: Self = Self(0);
    /// No value given, use the default.
    pub const UNSET: Self = Self(0x100);

    /// Legal subset for two-party topics: `JRWPA`.
    pub const CP2P: Self = Self(0x01 | 0x02 | 0x04 | 0x08 | 0x10);
    /// Default for authenticated users of group topics: `JRWP`.
    pub const CPUBLIC: Self = Self(0x01 | 0x02 | 0x04 | 0x08);
    /// Every capability: `JRWPASDO`.
    pub const CFULL: Self = Self(CAPABILITY_BITS);
    /// Any bit that qualifies a subscriber to see membership changes: `ASO`.
    pub const CSHARER: Self = Self(0x10 | 0x20 | 0x80);
    /// Mode a user holds on their own meta and search topics: `JRWPD`.
    pub const CSELF: Self = Self(0x01 | 0x02 | 0x04 | 0x08 | 0x40);

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_owner(self) -> bool {
        self.0 & Self::OWNER.0 != 0
    }

    /// Approver or owner.
    #[must_use]
    pub const fn is_admin(self) -> bool {
        self.0 & (Self::APPROVE.0 | Self::OWNER.0) != 0
    }

    /// Sharer, approver or owner.
    #[must_use]
    pub const fn is_sharer(self) -> bool {
        self.0 & Self::CSHARER.0 != 0
    }

    #[must_use]
    pub const fn is_joiner(self) -> bool {
        self.0 & Self::JOIN.0 != 0
    }

    #[must_use]
    pub const fn is_reader(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    #[must_use]
    pub const fn is_writer(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    #[must_use]
    pub const fn is_presencer(self) -> bool {
        self.0 & Self::PRES.0 != 0
    }

    #[must_use]
    pub const fn is_deleter(self) -> bool {
        self.0 & Self::DELETE.0 != 0
    }

    /// `N` counts as defined, unset does not.
    #[must_use]
    pub const fn is_defined(self) -> bool {
        self.0 != Self::UNSET.0
    }

    /// `self` holds every capability in `other`.
    #[must_use]
    pub const fn better_equal(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// `self` holds at least one capability missing from `other`.
    #[must_use]
    pub const fn better_than(self, other: Self) -> bool {
        self.0 & !other.0 & CAPABILITY_BITS != 0
    }

    /// Change descriptor from `self` to `new`: `+` added letters then `-`
    /// removed letters, e.g. `+PS-D`. Empty when nothing changed.
    #[must_use]
    pub fn delta(self, new: Self) -> String {
        let mut out = String::new();
        let added = new.0 & !self.0 & CAPABILITY_BITS;
        if added != 0 {
            out.push('+');
            out.push_str(&Self(added).letters());
        }
        let removed = self.0 & !new.0 & CAPABILITY_BITS;
        if removed != 0 {
            out.push('-');
            out.push_str(&Self(removed).letters());
        }
        out
    }

    fn letters(self) -> String {
        MODE_LETTERS
            .iter()
            .filter(|(_, bit)| self.0 & bit != 0)
            .map(|(letter, _)| *letter)
            .collect()
    }
}

impl Default for AccessMode {
    fn default() -> Self {
        Self::UNSET
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::UNSET {
            Ok(())
        } else if self.0 & CAPABILITY_BITS == 0 {
            f.write_str("N")
        } else {
            f.write_str(&self.letters())
        }
    }
}

impl FromStr for AccessMode {
    type Err = ParseError;

    /// Parses letters in any order and case. An empty string is unset.
    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(Self::UNSET);
        }
        let mut bits = 0;
        for ch in s.chars() {
            let upper = ch.to_ascii_uppercase();
            if upper == 'N' {
                continue;
            }
            let (_, bit) = MODE_LETTERS
                .iter()
                .find(|(letter, _)| *letter == upper)
                .ok_or(ParseError::InvalidModeChar(ch))?;
            bits |= bit;
        }
        Ok(Self(bits))
    }
}

impl Serialize for AccessMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl BitOr for AccessMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self((self.0 | rhs.0) & CAPABILITY_BITS)
    }
}

impl BitOrAssign for AccessMode {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

impl BitAnd for AccessMode {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0 & CAPABILITY_BITS)
    }
}

impl BitAndAssign for AccessMode {
    fn bitand_assign(&mut self, rhs: Self) {
        *self = *self & rhs;
    }
}

impl Not for AccessMode {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & CAPABILITY_BITS)
    }
}

/// Default access granted to users by authentication level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DefaultAccess {
    pub auth: AccessMode,
    pub anon: AccessMode,
}

impl DefaultAccess {
    #[must_use]
    pub const fn new(auth: AccessMode, anon: AccessMode) -> Self {
        Self { auth, anon }
    }

    /// Mode for a session at `level`.
    #[must_use]
    pub const fn for_level(&self, level: crate::types::AuthLevel) -> AccessMode {
        use crate::types::AuthLevel;
        match level {
            AuthLevel::Anon => self.anon,
            AuthLevel::Auth | AuthLevel::Root => self.auth,
            AuthLevel::None => AccessMode::NONE,
        }
    }
}

impl Default for DefaultAccess {
    fn default() -> Self {
        Self::new(AccessMode::CPUBLIC, AccessMode::NONE)
    }
}
