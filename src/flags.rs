//! Lookup flags.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Raw flag bits.
pub mod consts {
    /// Return `Pending` instead of waiting for the background driver.
    pub const NO_BLOCK: u16 = 0x0001;
    /// Answer from the cache only.
    pub const FORCE_CACHE: u16 = 0x0002;
    /// Discard any cached entry and query again.
    pub const FORCE_RENEW: u16 = 0x0004;
    /// Query even when the name is an address literal.
    pub const FORCE_RESOLUTION: u16 = 0x0008;
    /// Only IPv4 addresses / PTR-v4.
    pub const IPV4_ONLY: u16 = 0x0010;
    /// Only IPv6 addresses / PTR-v6.
    pub const IPV6_ONLY: u16 = 0x0020;
    /// Map an address to a host name.
    pub const REVERSE_LOOKUP: u16 = 0x0040;
    /// Also return the canonical name of a forward lookup.
    pub const CANON: u16 = 0x0080;
    /// Internal: refresh preferred flags while matching reverse lookups.
    pub(crate) const UPDATE_PREF: u16 = 0x0100;
    /// Internal: rewind an existing host record instead of allocating one.
    pub(crate) const RESET_REQ: u16 = 0x0200;

    pub(crate) const INTERNAL: u16 = UPDATE_PREF | RESET_REQ;
}

/// Bit-set of lookup options.
///
/// ```
/// use stub_resolver::LookupFlags;
///
/// let flags = LookupFlags::REVERSE_LOOKUP | LookupFlags::IPV4_ONLY;
/// assert!(flags.is_reverse());
/// assert!(flags.is_ipv4_only());
/// assert!(!flags.is_canonical());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LookupFlags(u16);

impl LookupFlags {
    /// No options: blocking forward lookup that consults the cache first.
    pub const NONE: Self = Self(0);
    /// See [`consts::NO_BLOCK`].
    pub const NO_BLOCK: Self = Self(consts::NO_BLOCK);
    /// See [`consts::FORCE_CACHE`].
    pub const FORCE_CACHE: Self = Self(consts::FORCE_CACHE);
    /// See [`consts::FORCE_RENEW`].
    pub const FORCE_RENEW: Self = Self(consts::FORCE_RENEW);
    /// See [`consts::FORCE_RESOLUTION`].
    pub const FORCE_RESOLUTION: Self = Self(consts::FORCE_RESOLUTION);
    /// See [`consts::IPV4_ONLY`].
    pub const IPV4_ONLY: Self = Self(consts::IPV4_ONLY);
    /// See [`consts::IPV6_ONLY`].
    pub const IPV6_ONLY: Self = Self(consts::IPV6_ONLY);
    /// See [`consts::REVERSE_LOOKUP`].
    pub const REVERSE_LOOKUP: Self = Self(consts::REVERSE_LOOKUP);
    /// See [`consts::CANON`].
    pub const CANON: Self = Self(consts::CANON);

    pub(crate) const UPDATE_PREF: Self = Self(consts::UPDATE_PREF);
    pub(crate) const RESET_REQ: Self = Self(consts::RESET_REQ);

    /// Creates flags from raw bits, including bits callers may not use.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw bit value.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns a copy with the bits of `other` set.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns a copy with the bits of `other` cleared.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns `true` if an internal-only bit is set.
    #[must_use]
    pub const fn has_internal(self) -> bool {
        self.0 & consts::INTERNAL != 0
    }

    /// Reverse lookup requested.
    #[must_use]
    pub const fn is_reverse(self) -> bool {
        self.contains(Self::REVERSE_LOOKUP)
    }

    /// Canonical name requested.
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        self.contains(Self::CANON)
    }

    /// Non-blocking submission requested.
    #[must_use]
    pub const fn is_no_block(self) -> bool {
        self.contains(Self::NO_BLOCK)
    }

    /// IPv4 only.
    #[must_use]
    pub const fn is_ipv4_only(self) -> bool {
        self.contains(Self::IPV4_ONLY)
    }

    /// IPv6 only.
    #[must_use]
    pub const fn is_ipv6_only(self) -> bool {
        self.contains(Self::IPV6_ONLY)
    }
}

impl BitOr for LookupFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for LookupFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<u16> for LookupFlags {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<LookupFlags> for u16 {
    fn from(flags: LookupFlags) -> Self {
        flags.0
    }
}

impl fmt::Debug for LookupFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u16, &str); 10] = [
            (consts::NO_BLOCK, "NO_BLOCK"),
            (consts::FORCE_CACHE, "FORCE_CACHE"),
            (consts::FORCE_RENEW, "FORCE_RENEW"),
            (consts::FORCE_RESOLUTION, "FORCE_RESOLUTION"),
            (consts::IPV4_ONLY, "IPV4_ONLY"),
            (consts::IPV6_ONLY, "IPV6_ONLY"),
            (consts::REVERSE_LOOKUP, "REVERSE"),
            (consts::CANON, "CANON"),
            (consts::UPDATE_PREF, "UPDATE_PREF"),
            (consts::RESET_REQ, "RESET_REQ"),
        ];

        let parts: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect();

        if parts.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}

impl fmt::Display for LookupFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
