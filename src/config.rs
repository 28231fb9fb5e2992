//! Resolver, task and per-request configuration.

use std::net::IpAddr;

use crate::error::{ResolverError, Result};

/// Standard DNS server port.
pub const DNS_PORT: u16 = 53;

/// Process-wide resolver configuration.
///
/// Pool capacities are derived from these numbers at [`init`](crate::Resolver::init)
/// and never grow afterwards.
///
/// # Example
///
/// ```
/// use stub_resolver::ResolverConfig;
///
/// let config = ResolverConfig::new()
///     .with_server("192.0.2.53")
///     .with_cache_entries(4)
///     .with_retry(2, 500);
///
/// assert_eq!(config.server_default.as_deref(), Some("192.0.2.53"));
/// assert_eq!(config.cache_entries_max, 4);
/// assert_eq!(config.req_retry_max, 2);
/// assert_eq!(config.req_retry_timeout_ms, 500);
/// ```
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Default DNS server as text (v4 or v6). `None` leaves it unset until
    /// [`set_default_server`](crate::Resolver::set_default_server) is called.
    pub server_default: Option<String>,

    /// Longest host name accepted, and the size of every name block.
    pub host_name_len_max: usize,

    /// Number of host records the cache can hold.
    pub cache_entries_max: usize,

    /// IPv4 addresses kept per host.
    pub addr_ipv4_max_per_host: usize,

    /// IPv6 addresses kept per host.
    pub addr_ipv6_max_per_host: usize,

    /// Delay between driver passes, in milliseconds.
    pub task_delay_ms: u64,

    /// Queries sent per track before giving up.
    pub req_retry_max: u8,

    /// Time to wait for a response before re-transmitting, in milliseconds.
    pub req_retry_timeout_ms: u64,
}

impl ResolverConfig {
    /// Creates a configuration with embedded-friendly defaults and no server.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            server_default: None,
            host_name_len_max: 255,
            cache_entries_max: 16,
            addr_ipv4_max_per_host: 2,
            addr_ipv6_max_per_host: 2,
            task_delay_ms: 50,
            req_retry_max: 3,
            req_retry_timeout_ms: 1000,
        }
    }

    /// Sets the default server text.
    #[must_use]
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server_default = Some(server.into());
        self
    }

    /// Overrides the cache capacity.
    #[must_use]
    pub const fn with_cache_entries(mut self, entries: usize) -> Self {
        self.cache_entries_max = entries;
        self
    }

    /// Overrides the per-host address maxima.
    #[must_use]
    pub const fn with_addrs_per_host(mut self, ipv4: usize, ipv6: usize) -> Self {
        self.addr_ipv4_max_per_host = ipv4;
        self.addr_ipv6_max_per_host = ipv6;
        self
    }

    /// Overrides the retry count and retry timeout.
    #[must_use]
    pub const fn with_retry(mut self, retry_max: u8, timeout_ms: u64) -> Self {
        self.req_retry_max = retry_max;
        self.req_retry_timeout_ms = timeout_ms;
        self
    }

    /// Overrides the driver delay.
    #[must_use]
    pub const fn with_task_delay(mut self, delay_ms: u64) -> Self {
        self.task_delay_ms = delay_ms;
        self
    }

    /// Overrides the maximum host name length.
    #[must_use]
    pub const fn with_host_name_len(mut self, len: usize) -> Self {
        self.host_name_len_max = len;
        self
    }

    /// Number of address records needed across all hosts.
    #[must_use]
    pub const fn addr_capacity(&self) -> usize {
        let mut per_host = self.addr_ipv4_max_per_host;
        if cfg!(feature = "ipv6") {
            per_host += self.addr_ipv6_max_per_host;
        }
        per_host * self.cache_entries_max
    }

    /// Checks that every capacity is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.cache_entries_max == 0 {
            return Err(ResolverError::InvalidConfig(
                "cache_entries_max must be non-zero".into(),
            ));
        }
        if self.host_name_len_max == 0 {
            return Err(ResolverError::InvalidConfig(
                "host_name_len_max must be non-zero".into(),
            ));
        }
        if self.addr_capacity() == 0 {
            return Err(ResolverError::InvalidConfig(
                "at least one address per host is required".into(),
            ));
        }
        if self.req_retry_max == 0 {
            return Err(ResolverError::InvalidConfig(
                "req_retry_max must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Background driver configuration.
///
/// Passing one to [`Resolver::init`](crate::Resolver::init) selects the
/// background-task driver; without it every lookup is polled to completion on
/// the calling thread.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Name given to the driver thread.
    pub name: String,

    /// Stack size of the driver thread in bytes, or the platform default.
    pub stack_size: Option<usize>,
}

impl TaskConfig {
    /// Creates a task configuration with the platform default stack.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stack_size: None,
        }
    }

    /// Overrides the stack size.
    #[must_use]
    pub const fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self::new("dns-resolver")
    }
}

/// Per-request overrides of the process-wide defaults.
///
/// Unset fields fall back to the [`ResolverConfig`] values (and to the
/// default server) when the request is submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestConfig {
    /// Server queried instead of the default server.
    pub server: Option<IpAddr>,

    /// Server port instead of 53.
    pub port: Option<u16>,

    /// Response timeout in milliseconds.
    pub timeout_ms: Option<u64>,

    /// Queries sent per track.
    pub retry_max: Option<u8>,

    /// Driver delay in milliseconds.
    pub task_delay_ms: Option<u64>,
}

impl RequestConfig {
    /// Creates an empty override set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            server: None,
            port: None,
            timeout_ms: None,
            retry_max: None,
            task_delay_ms: None,
        }
    }

    /// Targets a specific server.
    #[must_use]
    pub const fn with_server(mut self, server: IpAddr, port: Option<u16>) -> Self {
        self.server = Some(server);
        self.port = port;
        self
    }

    /// Overrides the retry count and timeout.
    #[must_use]
    pub const fn with_retry(mut self, retry_max: u8, timeout_ms: u64) -> Self {
        self.retry_max = Some(retry_max);
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Overrides the driver delay.
    #[must_use]
    pub const fn with_task_delay(mut self, delay_ms: u64) -> Self {
        self.task_delay_ms = Some(delay_ms);
        self
    }

    /// Fills every unset numeric field from `defaults`. The server stays
    /// optional; the transport falls back to the default server.
    #[must_use]
    pub fn merged(&self, defaults: &ResolverConfig) -> EffectiveRequest {
        EffectiveRequest {
            server: self.server,
            port: self.port.unwrap_or(DNS_PORT),
            timeout_ms: self.timeout_ms.unwrap_or(defaults.req_retry_timeout_ms),
            retry_max: self.retry_max.unwrap_or(defaults.req_retry_max),
            task_delay_ms: self.task_delay_ms.unwrap_or(defaults.task_delay_ms),
        }
    }
}

/// A request configuration with every default applied.
///
/// One is attached to each host record for the duration of its resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveRequest {
    /// Explicit server, or `None` for the default server.
    pub server: Option<IpAddr>,
    /// Server port.
    pub port: u16,
    /// Response timeout in milliseconds.
    pub timeout_ms: u64,
    /// Queries sent per track.
    pub retry_max: u8,
    /// Driver delay in milliseconds.
    pub task_delay_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sets_defaults() {
        let c = ResolverConfig::new();
        assert!(c.server_default.is_none());
        assert_eq!(c.host_name_len_max, 255);
        assert_eq!(c.cache_entries_max, 16);
        assert_eq!(c.req_retry_max, 3);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn addr_capacity_scales_with_entries() {
        let c = ResolverConfig::new()
            .with_cache_entries(3)
            .with_addrs_per_host(2, 1);
        let per_host = if cfg!(feature = "ipv6") { 3 } else { 2 };
        assert_eq!(c.addr_capacity(), per_host * 3);
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        assert!(matches!(
            ResolverConfig::new().with_cache_entries(0).validate(),
            Err(ResolverError::InvalidConfig(_))
        ));
        assert!(ResolverConfig::new().with_retry(0, 10).validate().is_err());
        assert!(
            ResolverConfig::new()
                .with_addrs_per_host(0, 0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn request_overrides_merge_with_defaults() {
        let defaults = ResolverConfig::new().with_retry(4, 250).with_task_delay(5);
        let merged = RequestConfig::new().with_retry(1, 100).merged(&defaults);
        assert_eq!(merged.retry_max, 1);
        assert_eq!(merged.timeout_ms, 100);
        assert_eq!(merged.task_delay_ms, 5);
        assert_eq!(merged.port, DNS_PORT);
        assert!(merged.server.is_none());

        let merged = RequestConfig::default().merged(&defaults);
        assert_eq!(merged.retry_max, 4);
        assert_eq!(merged.timeout_ms, 250);
    }
}
