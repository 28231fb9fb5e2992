//! Top-level resolver handle.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::addr::{self, Family, HostAddr};
use crate::cache::{Cache, CacheStats, CacheStore, HostKey, Network, Request, Status, Track};
use crate::clock::{Clock, SystemClock};
use crate::codec::QueryIds;
use crate::config::{RequestConfig, ResolverConfig, TaskConfig};
use crate::error::{ResolverError, Result};
use crate::flags::LookupFlags;
use crate::task::{Background, Driver, Submission};
use crate::transport::{InterfaceDirectory, SystemInterfaces, Transport, UdpTransport};

/// The system collaborators a resolver talks to.
#[derive(Clone)]
pub struct Platform {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) interfaces: Arc<dyn InterfaceDirectory>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Platform {
    /// Bundles custom collaborators.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        interfaces: Arc<dyn InterfaceDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            interfaces,
            clock,
        }
    }

    /// UDP sockets, the host's interface table and the wall clock.
    #[must_use]
    pub fn system() -> Self {
        Self::new(
            Arc::new(UdpTransport),
            Arc::new(SystemInterfaces),
            Arc::new(SystemClock::new()),
        )
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

/// State shared between callers and the background driver.
pub(crate) struct Shared {
    pub config: ResolverConfig,
    pub cache: Cache,
    pub platform: Platform,
    server: RwLock<Option<IpAddr>>,
    ids: QueryIds,
}

impl Shared {
    fn network(&self) -> Network<'_> {
        Network {
            platform: &self.platform,
            default_server: *self.server.read(),
            ids: &self.ids,
        }
    }

    /// Advances one host by one step.
    pub(crate) fn resolve_host(&self, key: HostKey) -> Result<Status> {
        self.cache.resolve_host(key, &self.network())
    }

    /// Advances every pending host by one step.
    pub(crate) fn resolve_all(&self) -> Result<usize> {
        self.cache.resolve_all(&self.network())
    }
}

/// Outcome of [`Resolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    /// Where the lookup stands.
    pub status: Status,
    /// Addresses written to the caller's buffer.
    pub count: usize,
    /// Reverse name of a reverse lookup, or canonical name of a
    /// [`CANON`](LookupFlags::CANON) lookup.
    pub name: Option<String>,
}

impl Lookup {
    const fn pending() -> Self {
        Self {
            status: Status::Pending,
            count: 0,
            name: None,
        }
    }

    /// Returns `true` once addresses are available.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.status == Status::Resolved
    }

    /// The filled part of the buffer passed to [`Resolver::resolve`].
    #[must_use]
    pub fn addrs<'a>(&self, buf: &'a [HostAddr]) -> &'a [HostAddr] {
        &buf[..self.count.min(buf.len())]
    }
}

/// A DNS stub resolver with a bounded host cache.
///
/// # Example
///
/// ```rust,no_run
/// use stub_resolver::{HostAddr, LookupFlags, Resolver, ResolverConfig};
///
/// let resolver = Resolver::init(ResolverConfig::new().with_server("192.0.2.53"), None)?;
///
/// let mut addrs = [HostAddr::default(); 4];
/// let lookup = resolver.resolve("example.com", &mut addrs, LookupFlags::NONE, None)?;
/// for addr in lookup.addrs(&addrs) {
///     println!("{addr}");
/// }
/// # Ok::<(), stub_resolver::ResolverError>(())
/// ```
pub struct Resolver {
    driver: Driver,
    shared: Arc<Shared>,
}

impl Resolver {
    /// Creates a resolver on the system platform.
    ///
    /// With a [`TaskConfig`] a background thread drives every lookup and
    /// [`NO_BLOCK`](LookupFlags::NO_BLOCK) is available; without one each
    /// lookup is polled to completion on the caller's thread.
    ///
    /// # Errors
    ///
    /// - [`ResolverError::InvalidConfig`] for a zero capacity or a malformed
    ///   default server
    /// - [`ResolverError::FaultInit`] if the driver thread cannot start
    pub fn init(config: ResolverConfig, task: Option<TaskConfig>) -> Result<Self> {
        Self::with_platform(config, task, Platform::system())
    }

    /// Creates a resolver on custom collaborators.
    ///
    /// # Errors
    ///
    /// As for [`init`](Self::init).
    pub fn with_platform(
        config: ResolverConfig,
        task: Option<TaskConfig>,
        platform: Platform,
    ) -> Result<Self> {
        config.validate()?;
        let server = match config.server_default.as_deref() {
            Some(text) => Some(addr::parse_server(text).map_err(|_| {
                ResolverError::InvalidConfig(format!("malformed default server {text:?}"))
            })?),
            None => None,
        };

        let shared = Arc::new(Shared {
            cache: Cache::new(&config),
            config,
            platform,
            server: RwLock::new(server),
            ids: QueryIds::new(),
        });
        let driver = match task {
            Some(task) => Driver::Background(Background::spawn(Arc::clone(&shared), &task)?),
            None => Driver::Polling,
        };

        tracing::info!(
            cache_entries = shared.config.cache_entries_max,
            background = driver.supports_no_block(),
            "Resolver initialized"
        );
        Ok(Self { driver, shared })
    }

    /// Resolves `name`, writing addresses into `addrs`.
    ///
    /// A forward lookup of an address literal returns the literal itself
    /// without any network traffic. Otherwise the cache is consulted first,
    /// then the server is queried for A (and AAAA) records, or for a PTR
    /// record with [`REVERSE_LOOKUP`](LookupFlags::REVERSE_LOOKUP).
    ///
    /// # Errors
    ///
    /// - [`ResolverError::InvalidArg`] for an empty name, an empty buffer, a
    ///   name over the configured length or internal-only flags
    /// - [`ResolverError::InvalidConfig`] for conflicting flags, or
    ///   `NO_BLOCK` without a background driver
    /// - [`ResolverError::CacheHostNotFound`] for a `FORCE_CACHE` miss
    /// - [`ResolverError::CacheHostPending`] for `FORCE_RENEW` while the
    ///   cached entry is still being resolved
    /// - the error that failed the resolution otherwise
    pub fn resolve(
        &self,
        name: &str,
        addrs: &mut [HostAddr],
        flags: LookupFlags,
        request: Option<&RequestConfig>,
    ) -> Result<Lookup> {
        self.validate(name, addrs, flags)?;

        let literal = addr::parse_literal(name)?;
        let reverse = flags.is_reverse();
        if let Some(ip) = literal {
            if !reverse {
                if flags.contains(LookupFlags::FORCE_RESOLUTION) {
                    return Err(ResolverError::InvalidConfig(
                        "cannot force resolution of an address literal".into(),
                    ));
                }
                addrs[0] = HostAddr::new(ip);
                return Ok(Lookup {
                    status: Status::Resolved,
                    count: 1,
                    name: None,
                });
            }
        }

        let track = if reverse {
            Some(reverse_track(flags, literal)?)
        } else {
            None
        };
        let mut request = Request {
            effective: request.copied().unwrap_or_default().merged(&self.shared.config),
            flags,
            track,
        };

        let mut store = self.shared.cache.lock()?;

        if flags.contains(LookupFlags::FORCE_CACHE) {
            let hit = store.search(name, addrs, flags.with(LookupFlags::UPDATE_PREF))?;
            return Self::complete(&mut store, hit.host, name, addrs, flags);
        }

        if !flags.contains(LookupFlags::FORCE_RENEW) {
            if let Some(key) = store.search_by_name(name, flags) {
                match store.state(key)?.status() {
                    Status::Pending => {
                        let submission = self.driver.enqueue(&mut store, key, &request, false)?;
                        drop(store);
                        return self.drive(submission, name, addrs, &request);
                    }
                    Status::Resolved if reverse && Self::needs_refresh(&store, key, literal) => {
                        tracing::debug!(host = name, "Cached reverse name is stale, re-resolving");
                        request.flags = flags
                            .with(LookupFlags::RESET_REQ)
                            .with(LookupFlags::UPDATE_PREF);
                    }
                    _ => {
                        tracing::debug!(host = name, "Cache hit");
                        return Self::complete(&mut store, key, name, addrs, flags);
                    }
                }
            }
        } else if let Some(key) = store.search_by_name(name, flags) {
            store.remove(key)?;
        }

        let key = store.get_or_create_host(name, request)?;
        let submission = self.driver.enqueue(&mut store, key, &request, true)?;
        drop(store);
        self.drive(submission, name, addrs, &request)
    }

    fn validate(&self, name: &str, addrs: &[HostAddr], flags: LookupFlags) -> Result<()> {
        if name.is_empty() {
            return Err(ResolverError::InvalidArg("empty host name"));
        }
        if addrs.is_empty() {
            return Err(ResolverError::InvalidArg("empty address buffer"));
        }
        if flags.has_internal() {
            return Err(ResolverError::InvalidArg("internal lookup flag"));
        }
        if flags.contains(LookupFlags::FORCE_CACHE | LookupFlags::FORCE_RENEW) {
            return Err(ResolverError::InvalidConfig(
                "FORCE_CACHE and FORCE_RENEW are exclusive".into(),
            ));
        }
        if flags.contains(LookupFlags::CANON | LookupFlags::REVERSE_LOOKUP) {
            return Err(ResolverError::InvalidConfig(
                "CANON does not apply to reverse lookups".into(),
            ));
        }
        if flags.is_no_block() && !self.driver.supports_no_block() {
            return Err(ResolverError::InvalidConfig(
                "NO_BLOCK requires a background task".into(),
            ));
        }
        if name.len() > self.shared.config.host_name_len_max {
            return Err(ResolverError::InvalidArg("host name too long"));
        }
        Ok(())
    }

    /// A cached reverse entry is stale when it has no reverse name, or when
    /// the queried literal is not the address that name was resolved for.
    fn needs_refresh(store: &CacheStore, key: HostKey, literal: Option<IpAddr>) -> bool {
        store.reverse_name(key).is_none() || literal.is_some_and(|ip| !store.is_preferred(key, ip))
    }

    fn drive(
        &self,
        submission: Submission,
        name: &str,
        addrs: &mut [HostAddr],
        request: &Request,
    ) -> Result<Lookup> {
        let key = submission.key();
        let status = self.driver.submit(&self.shared, submission, request)?;
        if status == Status::Pending {
            return Ok(Lookup::pending());
        }
        let mut store = self.shared.cache.lock()?;
        Self::complete(&mut store, key, name, addrs, request.flags)
    }

    fn complete(
        store: &mut CacheStore,
        key: HostKey,
        name: &str,
        addrs: &mut [HostAddr],
        flags: LookupFlags,
    ) -> Result<Lookup> {
        let flags = flags
            .without(LookupFlags::UPDATE_PREF)
            .without(LookupFlags::RESET_REQ);
        if flags.is_reverse() && store.state(key)?.status() == Status::Resolved {
            store.mark_single_preferred(key);
        }
        let hit = store.snapshot(key, name, addrs, flags)?;
        match hit.status {
            Status::Pending => Ok(Lookup::pending()),
            Status::Failed => {
                let error = store
                    .take_error(key)
                    .unwrap_or(ResolverError::CacheHostNotFound);
                store.discard(key);
                Err(error)
            }
            Status::Resolved => {
                let name = if flags.is_reverse() {
                    store.reverse_name(key)
                } else if flags.is_canonical() {
                    store.canonical_name(key)
                } else {
                    None
                };
                Ok(Lookup {
                    status: Status::Resolved,
                    count: hit.count,
                    name,
                })
            }
        }
    }

    /// Replaces the default DNS server.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::AddrInvalid`] for an IPv6 server when IPv6
    /// support is compiled out.
    pub fn set_default_server(&self, server: IpAddr) -> Result<()> {
        if server.is_ipv6() && !cfg!(feature = "ipv6") {
            return Err(ResolverError::AddrInvalid);
        }
        *self.shared.server.write() = Some(server);
        tracing::info!(server = %server, "Default DNS server set");
        Ok(())
    }

    /// Parses `text` and makes it the default DNS server.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::AddrInvalid`] for malformed text.
    pub fn set_default_server_str(&self, text: &str) -> Result<()> {
        self.set_default_server(addr::parse_server(text)?)
    }

    /// The default DNS server.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::AddrInvalid`] when none is set.
    pub fn default_server(&self) -> Result<IpAddr> {
        self.shared.server.read().ok_or(ResolverError::AddrInvalid)
    }

    /// The default DNS server as text.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::AddrInvalid`] when none is set.
    pub fn default_server_string(&self) -> Result<String> {
        Ok(self.default_server()?.to_string())
    }

    /// Drops every cached entry that is not being resolved.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::CacheLock`] if the cache stays locked.
    pub fn clear_cache(&self) -> Result<()> {
        let removed = self.shared.cache.lock()?.clear();
        tracing::debug!(removed, "Cache cleared");
        Ok(())
    }

    /// Drops the cached entry for `name`.
    ///
    /// # Errors
    ///
    /// - [`ResolverError::InvalidArg`] for an empty name
    /// - [`ResolverError::CacheHostNotFound`] if nothing is cached for it
    /// - [`ResolverError::CacheHostPending`] if it is being resolved
    pub fn clear_cache_entry(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(ResolverError::InvalidArg("empty host name"));
        }
        self.shared.cache.lock()?.remove_by_name(name)
    }

    /// Current pool usage.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::CacheLock`] if the cache stays locked.
    pub fn cache_stats(&self) -> Result<CacheStats> {
        Ok(self.shared.cache.lock()?.stats())
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("background", &self.driver.supports_no_block())
            .field("server", &*self.shared.server.read())
            .finish_non_exhaustive()
    }
}

/// PTR track for a reverse lookup: an explicit family flag wins, then the
/// family of the literal, then IPv4.
fn reverse_track(flags: LookupFlags, literal: Option<IpAddr>) -> Result<Track> {
    let family = if flags.is_ipv4_only() {
        Family::V4
    } else if flags.is_ipv6_only() {
        Family::V6
    } else {
        literal.as_ref().map_or(Family::V4, Family::of)
    };
    match family {
        Family::V4 => Ok(Track::PtrV4),
        Family::V6 if cfg!(feature = "ipv6") => Ok(Track::PtrV6),
        Family::V6 => Err(ResolverError::AddrInvalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::mpsc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::clock::mock::ManualClock;
    use crate::transport::Connection;
    use crate::transport::mock::{Record, ScriptedTransport, StaticInterfaces};

    fn resolver(config: ResolverConfig) -> (Resolver, ScriptedTransport) {
        let clock = Arc::new(ManualClock::default());
        let transport = ScriptedTransport::new(clock.clone());
        let platform = Platform::new(
            Arc::new(transport.clone()),
            Arc::new(StaticInterfaces::one_up()),
            clock,
        );
        let config = config.with_server("192.0.2.53");
        (
            Resolver::with_platform(config, None, platform).unwrap(),
            transport,
        )
    }

    #[test]
    fn literal_short_circuits() {
        let (r, t) = resolver(ResolverConfig::new());
        let mut out = [HostAddr::default(); 2];
        let lookup = r
            .resolve("203.0.113.5", &mut out, LookupFlags::NONE, None)
            .unwrap();
        assert!(lookup.is_resolved());
        assert_eq!(lookup.addrs(&out), &[HostAddr::new("203.0.113.5".parse().unwrap())]);
        assert!(t.sent().is_empty());

        assert!(matches!(
            r.resolve("203.0.113.5", &mut out, LookupFlags::FORCE_RESOLUTION, None),
            Err(ResolverError::InvalidConfig(_))
        ));
    }

    #[test]
    fn argument_checks() {
        let (r, _) = resolver(ResolverConfig::new().with_host_name_len(16));
        let mut out = [HostAddr::default(); 1];
        let mut none: [HostAddr; 0] = [];

        assert!(matches!(
            r.resolve("", &mut out, LookupFlags::NONE, None),
            Err(ResolverError::InvalidArg(_))
        ));
        assert!(matches!(
            r.resolve("a.example", &mut none, LookupFlags::NONE, None),
            Err(ResolverError::InvalidArg(_))
        ));
        assert!(matches!(
            r.resolve("a.example", &mut out, LookupFlags::UPDATE_PREF, None),
            Err(ResolverError::InvalidArg(_))
        ));
        assert!(matches!(
            r.resolve("a.very-long.example", &mut out, LookupFlags::NONE, None),
            Err(ResolverError::InvalidArg(_))
        ));
        assert!(matches!(
            r.resolve("a.example", &mut out, LookupFlags::NO_BLOCK, None),
            Err(ResolverError::InvalidConfig(_))
        ));
    }

    #[test]
    fn reverse_track_selection() {
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(reverse_track(LookupFlags::NONE, Some(v4)).unwrap(), Track::PtrV4);
        assert_eq!(reverse_track(LookupFlags::NONE, None).unwrap(), Track::PtrV4);
        assert_eq!(
            reverse_track(LookupFlags::IPV4_ONLY, Some(v6)).unwrap(),
            Track::PtrV4
        );
        if cfg!(feature = "ipv6") {
            assert_eq!(reverse_track(LookupFlags::NONE, Some(v6)).unwrap(), Track::PtrV6);
        }
    }

    #[test]
    fn stale_reverse_entry_is_refreshed_in_place() {
        let (r, t) = resolver(ResolverConfig::new());
        t.answer(
            "multi.example",
            1,
            vec![
                Record::Addr("10.0.0.1".parse().unwrap()),
                Record::Addr("10.0.0.2".parse().unwrap()),
            ],
        );
        t.answer(
            "2.0.0.10.in-addr.arpa",
            12,
            vec![Record::Ptr("two.example".into())],
        );

        let mut out = [HostAddr::default(); 4];
        r.resolve("multi.example", &mut out, LookupFlags::NONE, None)
            .unwrap();
        let entries = r.cache_stats().unwrap().entries;

        let lookup = r
            .resolve("10.0.0.2", &mut out, LookupFlags::REVERSE_LOOKUP, None)
            .unwrap();
        assert_eq!(lookup.name.as_deref(), Some("two.example"));
        assert_eq!(r.cache_stats().unwrap().entries, entries);

        let preferred: Vec<_> = lookup
            .addrs(&out)
            .iter()
            .filter(|a| a.preferred)
            .map(|a| a.ip)
            .collect();
        assert_eq!(preferred, vec!["10.0.0.2".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn failed_lookups_leave_no_entry() {
        let (r, t) = resolver(ResolverConfig::new());
        t.rcode("gone.example", 1, 3);
        let mut out = [HostAddr::default(); 1];
        assert!(matches!(
            r.resolve("gone.example", &mut out, LookupFlags::NONE, None),
            Err(ResolverError::NameNotExist)
        ));
        assert_eq!(r.cache_stats().unwrap().entries, 0);
    }

    #[test]
    fn malformed_default_server_is_rejected() {
        let err = Resolver::with_platform(
            ResolverConfig::new().with_server("not-an-ip"),
            None,
            Platform::system(),
        )
        .unwrap_err();
        assert!(matches!(err, ResolverError::InvalidConfig(_)));
    }

    /// Holds `open` until the test lets it go, then refuses the socket.
    struct GatedTransport {
        entered: Mutex<mpsc::Sender<()>>,
        go: Mutex<mpsc::Receiver<()>>,
    }

    impl Transport for GatedTransport {
        fn open(&self, _server: SocketAddr) -> io::Result<Box<dyn Connection>> {
            self.entered.lock().send(()).ok();
            self.go.lock().recv().ok();
            Err(io::ErrorKind::ConnectionRefused.into())
        }
    }

    #[test]
    fn lock_timeout_after_network_step_releases_the_host() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel();
        let transport = GatedTransport {
            entered: Mutex::new(entered_tx),
            go: Mutex::new(go_rx),
        };
        let platform = Platform::new(
            Arc::new(transport),
            Arc::new(StaticInterfaces::one_up()),
            Arc::new(ManualClock::default()),
        );
        let r = Resolver::with_platform(
            ResolverConfig::new().with_server("192.0.2.53"),
            None,
            platform,
        )
        .unwrap();
        let before = r.cache_stats().unwrap();

        std::thread::scope(|scope| {
            let lookup = scope.spawn(|| {
                let mut out = [HostAddr::default(); 1];
                r.resolve("a.example", &mut out, LookupFlags::NONE, None)
            });

            entered_rx.recv().unwrap();
            // The socket is opened with the cache unlocked.
            let held = r.shared.cache.lock().unwrap();
            go_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(1500));
            drop(held);

            assert!(matches!(
                lookup.join().unwrap(),
                Err(ResolverError::CacheLock)
            ));
        });
        assert_eq!(r.cache_stats().unwrap(), before);
    }

    #[test]
    fn reverse_result_marks_its_only_address_preferred() {
        let (r, t) = resolver(ResolverConfig::new());
        t.answer(
            "9.0.0.10.in-addr.arpa",
            12,
            vec![Record::Ptr("nine.example".into())],
        );
        let mut out = [HostAddr::default(); 2];
        r.resolve("10.0.0.9", &mut out, LookupFlags::REVERSE_LOOKUP, None)
            .unwrap();

        let lookup = r
            .resolve("10.0.0.9", &mut out, LookupFlags::REVERSE_LOOKUP, None)
            .unwrap();
        assert_eq!(lookup.name.as_deref(), Some("nine.example"));
        assert_eq!(lookup.count, 1);
        assert!(out[0].preferred);
    }
}
