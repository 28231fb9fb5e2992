//! Resolved addresses, literal detection and reverse-mapping names.

use std::fmt;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{ResolverError, Result};

/// Reverse-mapping domain for IPv4 (RFC 1035 §3.5).
pub const REVERSE_DOMAIN_IPV4: &str = "in-addr.arpa";

/// Reverse-mapping domain for IPv6 (RFC 3596 §2.5).
pub const REVERSE_DOMAIN_IPV6: &str = "ip6.arpa";

/// One resolved address.
///
/// `preferred` marks the address a reverse lookup was last performed for, so
/// a host with several addresses can tell which one its reverse name belongs
/// to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostAddr {
    /// The address.
    pub ip: IpAddr,
    /// Set on the address the cached reverse name was resolved for.
    pub preferred: bool,
}

impl HostAddr {
    /// Creates a non-preferred address.
    #[must_use]
    pub const fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            preferred: false,
        }
    }

    /// Returns `true` for an IPv4 address.
    #[must_use]
    pub const fn is_ipv4(&self) -> bool {
        self.ip.is_ipv4()
    }

    /// Returns `true` for an IPv6 address.
    #[must_use]
    pub const fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }
}

impl Default for HostAddr {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

impl From<IpAddr> for HostAddr {
    fn from(ip: IpAddr) -> Self {
        Self::new(ip)
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.ip, f)
    }
}

/// Address family of a lookup track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl Family {
    /// Family of `ip`.
    #[must_use]
    pub const fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

/// Parses `name` as an address literal.
///
/// Returns `Ok(None)` for anything that is not an address.
///
/// # Errors
///
/// Returns [`ResolverError::AddrInvalid`] for an IPv6 literal when IPv6
/// support is compiled out.
pub fn parse_literal(name: &str) -> Result<Option<IpAddr>> {
    match name.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) if !cfg!(feature = "ipv6") => Err(ResolverError::AddrInvalid),
        Ok(ip) => Ok(Some(ip)),
        Err(_) => Ok(None),
    }
}

/// Parses server text into an address.
///
/// # Errors
///
/// Returns [`ResolverError::AddrInvalid`] for malformed text or an
/// unsupported family.
pub fn parse_server(text: &str) -> Result<IpAddr> {
    parse_literal(text.trim())?.ok_or(ResolverError::AddrInvalid)
}

/// Builds the `in-addr.arpa` name for an IPv4 address.
///
/// ```
/// use std::net::Ipv4Addr;
/// use stub_resolver::addr::reverse_name_v4;
///
/// assert_eq!(
///     reverse_name_v4(Ipv4Addr::new(192, 0, 2, 10)),
///     "10.2.0.192.in-addr.arpa"
/// );
/// ```
#[must_use]
pub fn reverse_name_v4(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("{d}.{c}.{b}.{a}.{REVERSE_DOMAIN_IPV4}")
}

/// Builds the nibble-reversed `ip6.arpa` name for an IPv6 address.
#[must_use]
pub fn reverse_name_v6(ip: Ipv6Addr) -> String {
    let mut name = String::with_capacity(64 + REVERSE_DOMAIN_IPV6.len());
    for byte in ip.octets().iter().rev() {
        let _ = write!(name, "{:x}.{:x}.", byte & 0x0f, byte >> 4);
    }
    name.push_str(REVERSE_DOMAIN_IPV6);
    name
}

/// Builds the reverse-mapping name for either family.
#[must_use]
pub fn reverse_name(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => reverse_name_v4(v4),
        IpAddr::V6(v6) => reverse_name_v6(v6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_detection() {
        assert_eq!(
            parse_literal("203.0.113.5").unwrap(),
            Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)))
        );
        assert_eq!(parse_literal("example.com").unwrap(), None);
        assert_eq!(parse_literal("1.2.3").unwrap(), None);
    }

    #[cfg(feature = "ipv6")]
    #[test]
    fn ipv6_literal_detection() {
        assert_eq!(
            parse_literal("2001:db8::1").unwrap(),
            Some("2001:db8::1".parse().unwrap())
        );
    }

    #[test]
    fn server_text() {
        assert_eq!(
            parse_server(" 8.8.8.8 ").unwrap(),
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))
        );
        assert!(matches!(
            parse_server("dns.example"),
            Err(ResolverError::AddrInvalid)
        ));
    }

    #[test]
    fn ipv4_reverse_name() {
        assert_eq!(
            reverse_name_v4(Ipv4Addr::new(10, 0, 0, 1)),
            "1.0.0.10.in-addr.arpa"
        );
    }

    #[test]
    fn ipv6_reverse_name() {
        let ip: Ipv6Addr = "2001:db8::567:89ab".parse().unwrap();
        assert_eq!(
            reverse_name_v6(ip),
            "b.a.9.8.7.6.5.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.1.0.0.2.ip6.arpa"
        );
    }

    #[test]
    fn host_addr_defaults() {
        let addr = HostAddr::default();
        assert!(addr.is_ipv4());
        assert!(!addr.preferred);
        assert_eq!(Family::of(&addr.ip), Family::V4);
    }
}
