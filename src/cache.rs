//! Host cache and the per-host resolution state machine.
//!
//! All host data lives in fixed-capacity [`Pool`]s sized from
//! [`ResolverConfig`]: cache entries, host records, name buffers, addresses,
//! address-list nodes and request configurations. Cache entries form a
//! singly linked list, most recently inserted or looked up first. The whole store sits behind one
//! [`Cache`] lock.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use slotmap::new_key_type;

use crate::addr::{self, Family, HostAddr};
use crate::codec::{self, AnswerSink, MAX_MESSAGE_SIZE, QueryIds, RecordKind};
use crate::config::{EffectiveRequest, ResolverConfig};
use crate::error::{ResolverError, Result};
use crate::flags::LookupFlags;
use crate::pool::Pool;
use crate::resolver::Platform;
use crate::task::Completion;
use crate::transport::{self, Connection};

/// Longest wait for the cache lock before giving up with
/// [`ResolverError::CacheLock`].
const LOCK_WAIT: Duration = Duration::from_secs(1);

new_key_type! {
    /// Handle to a host record.
    pub(crate) struct HostKey;
    struct EntryKey;
    struct NameKey;
    struct AddrKey;
    struct NodeKey;
    struct ReqKey;
}

/// Coarse outcome of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Resolution is still in progress.
    Pending,
    /// Addresses (or a reverse name) are available.
    Resolved,
    /// Resolution ended without a result.
    Failed,
}

/// Record type a host is currently querying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    /// IPv4 addresses.
    A,
    /// IPv6 addresses.
    Aaaa,
    /// Reverse lookup of an IPv4 address.
    PtrV4,
    /// Reverse lookup of an IPv6 address.
    PtrV6,
}

impl Track {
    const fn kind(self) -> RecordKind {
        match self {
            Self::A => RecordKind::A,
            Self::Aaaa => RecordKind::Aaaa,
            Self::PtrV4 | Self::PtrV6 => RecordKind::Ptr,
        }
    }

    const fn family(self) -> Family {
        match self {
            Self::A | Self::PtrV4 => Family::V4,
            Self::Aaaa | Self::PtrV6 => Family::V6,
        }
    }
}

/// Per-host resolution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Allocated; the socket is not open yet.
    InitReq,
    /// Waiting for an interface with its link up.
    InterfaceSelect,
    /// Ready to transmit a query on the track.
    Tx(Track),
    /// Waiting for the response to the track's query.
    Rx(Track),
    /// Terminal: resolved.
    Resolved,
    /// Terminal: failed.
    Failed,
}

impl HostState {
    /// `Resolved` and `Failed`: safe to evict or remove.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Failed)
    }

    #[must_use]
    pub const fn status(self) -> Status {
        match self {
            Self::Resolved => Status::Resolved,
            Self::Failed => Status::Failed,
            Self::InitReq | Self::InterfaceSelect | Self::Tx(_) | Self::Rx(_) => Status::Pending,
        }
    }
}

/// Request parameters attached to a host for the duration of its resolution.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Request {
    pub effective: EffectiveRequest,
    pub flags: LookupFlags,
    /// PTR track of a reverse lookup.
    pub track: Option<Track>,
}

/// Pool usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Hosts linked into the cache.
    pub entries: usize,
    /// Host records still available.
    pub hosts_free: usize,
    /// Address records still available.
    pub addrs_free: usize,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SearchHit {
    pub host: HostKey,
    pub status: Status,
    /// Addresses copied to the caller's buffer.
    pub count: usize,
}

struct CacheEntry {
    host: HostKey,
    next: Option<EntryKey>,
}

struct AddrNode {
    addr: AddrKey,
    next: Option<NodeKey>,
}

#[derive(Debug, Default)]
struct AddrList {
    head: Option<NodeKey>,
    tail: Option<NodeKey>,
    v4: usize,
    v6: usize,
}

impl AddrList {
    const fn len(&self) -> usize {
        self.v4 + self.v6
    }

    fn push(&mut self, nodes: &mut Pool<NodeKey, AddrNode>, key: NodeKey, family: Family) {
        match self.tail.and_then(|t| nodes.block_mut(t)) {
            Some(tail) => tail.next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        match family {
            Family::V4 => self.v4 += 1,
            Family::V6 => self.v6 += 1,
        }
    }
}

struct Host {
    name: NameKey,
    canonical: Option<NameKey>,
    reverse: Option<NameKey>,
    state: HostState,
    addrs: AddrList,
    query_id: u16,
    retries: u8,
    last_tx_ms: u64,
    link_wait_since_ms: Option<u64>,
    wire: Arc<Mutex<Wire>>,
    interface: Option<usize>,
    req: Option<ReqKey>,
    waiter: Option<Arc<Completion>>,
    error: Option<ResolverError>,
}

impl Host {
    fn new(name: NameKey) -> Self {
        Self {
            name,
            canonical: None,
            reverse: None,
            state: HostState::InitReq,
            addrs: AddrList::default(),
            query_id: 0,
            retries: 0,
            last_tx_ms: 0,
            link_wait_since_ms: None,
            wire: Arc::default(),
            interface: None,
            req: None,
            waiter: None,
            error: None,
        }
    }
}

/// Socket of a host. Whichever driver steps the host holds this lock for
/// the whole step, network I/O included; the cache lock is not held then.
#[derive(Default)]
struct Wire {
    conn: Option<Box<dyn Connection>>,
    /// Completed steps. A driver whose plan is older stands down.
    steps: u64,
}

/// Outcome of [`CacheStore::plan`].
enum Plan {
    /// No network work this time.
    Idle(Status),
    /// Network work to carry out without the cache lock.
    Run(Step),
}

/// One planned step of a host.
struct Step {
    wire: Arc<Mutex<Wire>>,
    steps: u64,
    io: Io,
}

enum Io {
    Open { server: Option<IpAddr>, port: u16 },
    Select { last: Option<usize> },
    Transmit { track: Track, id: u16, qname: String, query: Vec<u8> },
    Receive { track: Track },
}

enum Outcome {
    Opened(Result<Box<dyn Connection>>),
    Selected(Result<usize>),
    Sent {
        track: Track,
        id: u16,
        qname: String,
        result: Result<()>,
    },
    Received {
        track: Track,
        result: Result<Vec<u8>>,
    },
}

impl Io {
    fn run(self, conn: &mut Option<Box<dyn Connection>>, net: &Network<'_>) -> Outcome {
        match self {
            Self::Open { server, port } => Outcome::Opened(transport::open(
                net.platform.transport.as_ref(),
                server,
                port,
                net.default_server,
            )),
            Self::Select { last } => Outcome::Selected(match conn.as_deref_mut() {
                Some(c) => transport::select_interface(net.platform.interfaces.as_ref(), last, c),
                None => Err(ResolverError::Fault("interface select without socket")),
            }),
            Self::Transmit {
                track,
                id,
                qname,
                query,
            } => {
                let result = match conn.as_deref_mut() {
                    Some(c) => transport::send(c, net.platform.clock.as_ref(), &query),
                    None => Err(ResolverError::Fault("transmit without socket")),
                };
                Outcome::Sent {
                    track,
                    id,
                    qname,
                    result,
                }
            }
            Self::Receive { track } => {
                let mut buf = [0u8; MAX_MESSAGE_SIZE];
                let result = match conn.as_deref_mut() {
                    Some(c) => transport::receive(c, &mut buf).map(|len| buf[..len].to_vec()),
                    None => Err(ResolverError::Fault("receive without socket")),
                };
                Outcome::Received { track, result }
            }
        }
    }
}

/// Collaborators one driver pass needs.
pub(crate) struct Network<'a> {
    pub platform: &'a Platform,
    pub default_server: Option<IpAddr>,
    pub ids: &'a QueryIds,
}

impl Network<'_> {
    fn now_ms(&self) -> u64 {
        self.platform.clock.now_ms()
    }
}

/// The locked host cache.
pub(crate) struct Cache {
    store: Mutex<CacheStore>,
}

impl Cache {
    pub(crate) fn new(config: &ResolverConfig) -> Self {
        Self {
            store: Mutex::new(CacheStore::new(config)),
        }
    }

    /// Acquires the cache lock.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::CacheLock`] if the lock stays busy.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, CacheStore>> {
        self.store
            .try_lock_for(LOCK_WAIT)
            .ok_or(ResolverError::CacheLock)
    }
}

impl Cache {
    /// Advances one host by one step.
    ///
    /// The step is planned under the cache lock, its network I/O runs with
    /// only the host's socket locked, and the result is applied under the
    /// cache lock again. A host another driver is stepping reports
    /// [`Status::Pending`].
    ///
    /// # Errors
    ///
    /// - [`ResolverError::CacheLock`] if the cache stays locked; the host is
    ///   left as it was before the step
    /// - [`ResolverError::CacheHostNotFound`] for a stale handle
    pub(crate) fn resolve_host(&self, key: HostKey, net: &Network<'_>) -> Result<Status> {
        let Step { wire: slot, steps, io } = match self.lock()?.plan(key, net)? {
            Plan::Idle(status) => return Ok(status),
            Plan::Run(step) => step,
        };
        let Some(mut wire) = slot.try_lock() else {
            return Ok(Status::Pending);
        };
        if wire.steps != steps {
            return Ok(Status::Pending);
        }
        let outcome = io.run(&mut wire.conn, net);
        self.lock()?.apply(key, outcome, &mut wire, net)
    }

    /// Advances every in-flight host by one step.
    ///
    /// Returns how many reached a terminal state during this pass.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::CacheLock`] if the pending list cannot be
    /// read. Failures on single hosts are logged and skipped.
    pub(crate) fn resolve_all(&self, net: &Network<'_>) -> Result<usize> {
        let pending = self.lock()?.pending_hosts();
        let mut done = 0;
        for key in pending {
            match self.resolve_host(key, net) {
                Ok(Status::Pending) => {}
                Ok(_) => done += 1,
                Err(e) => tracing::warn!(error = %e, "Failed to drive cached host"),
            }
        }
        Ok(done)
    }
}

pub(crate) struct CacheStore {
    name_len_max: usize,
    v4_max: usize,
    v6_max: usize,
    head: Option<EntryKey>,
    entries: Pool<EntryKey, CacheEntry>,
    hosts: Pool<HostKey, Host>,
    names: Pool<NameKey, String>,
    addrs: Pool<AddrKey, HostAddr>,
    nodes: Pool<NodeKey, AddrNode>,
    reqs: Pool<ReqKey, Request>,
}

fn iter_addrs<'a>(
    nodes: &'a Pool<NodeKey, AddrNode>,
    addrs: &'a Pool<AddrKey, HostAddr>,
    head: Option<NodeKey>,
) -> impl Iterator<Item = &'a HostAddr> + 'a {
    std::iter::successors(head.and_then(|k| nodes.block(k)), move |n| {
        n.next.and_then(|k| nodes.block(k))
    })
    .filter_map(move |n| addrs.block(n.addr))
}

impl CacheStore {
    fn new(config: &ResolverConfig) -> Self {
        let entries = config.cache_entries_max;
        let addrs = config.addr_capacity() + 1;
        let v6_max = if cfg!(feature = "ipv6") {
            config.addr_ipv6_max_per_host
        } else {
            0
        };
        Self {
            name_len_max: config.host_name_len_max,
            v4_max: config.addr_ipv4_max_per_host,
            v6_max,
            head: None,
            entries: Pool::with_capacity("cache entry", entries),
            hosts: Pool::with_capacity("host", entries),
            names: Pool::with_capacity("host name", entries * 3),
            addrs: Pool::with_capacity("address", addrs),
            nodes: Pool::with_capacity("address list", addrs),
            reqs: Pool::with_capacity("request config", entries),
        }
    }

    fn host(&self, key: HostKey) -> Result<&Host> {
        self.hosts.block(key).ok_or(ResolverError::CacheHostNotFound)
    }

    fn host_mut(&mut self, key: HostKey) -> Result<&mut Host> {
        self.hosts
            .block_mut(key)
            .ok_or(ResolverError::CacheHostNotFound)
    }

    fn name(&self, key: NameKey) -> &str {
        self.names.block(key).map_or("", String::as_str)
    }

    fn request(&self, key: HostKey) -> Result<Request> {
        let req = self.host(key)?.req.ok_or(ResolverError::Fault("host without request"))?;
        self.reqs
            .block(req)
            .copied()
            .ok_or(ResolverError::Fault("dangling request handle"))
    }

    fn entry_of(&self, key: HostKey) -> Option<EntryKey> {
        let mut cur = self.head;
        while let Some(ek) = cur {
            let entry = self.entries.block(ek)?;
            if entry.host == key {
                return Some(ek);
            }
            cur = entry.next;
        }
        None
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Walks the cache for `name`.
    ///
    /// Forward lookups compare host names. Reverse lookups compare `name`
    /// against each host's resolved addresses, so a host resolved forward can
    /// answer a later reverse query for one of its addresses while a host
    /// resolved in reverse never answers a forward query for its PTR name.
    /// With `UPDATE_PREF` the matching address of the found host becomes its
    /// preferred one. The found entry moves to the head of the list, so
    /// eviction takes the least recently looked-up entry.
    pub(crate) fn search_by_name(&mut self, name: &str, flags: LookupFlags) -> Option<HostKey> {
        let plain = flags.without(LookupFlags::UPDATE_PREF);
        let mut cur = self.head;
        while let Some(ek) = cur {
            let entry = self.entries.block(ek)?;
            cur = entry.next;
            let host = entry.host;
            if self.matches(host, name, plain) {
                if flags.contains(LookupFlags::UPDATE_PREF) {
                    self.matches(host, name, flags);
                }
                self.promote(ek);
                return Some(host);
            }
        }
        None
    }

    fn matches(&mut self, key: HostKey, name: &str, flags: LookupFlags) -> bool {
        let Some(host) = self.hosts.block(key) else {
            return false;
        };
        let host_name = self.names.block(host.name).map_or("", String::as_str);
        if !flags.is_reverse() {
            return host_name == name;
        }

        // A reverse host that has not transmitted yet holds no addresses.
        if host.addrs.len() == 0 {
            return host_name == name;
        }

        let update = flags.contains(LookupFlags::UPDATE_PREF);
        let own_literal = host_name.parse::<Ipv4Addr>().is_ok();
        let query_v4 = name.parse::<Ipv4Addr>().ok();
        let query_v6 = name.parse::<Ipv6Addr>().ok();

        let mut found = false;
        let mut cur = host.addrs.head;
        while let Some(nk) = cur {
            let Some(node) = self.nodes.block(nk) else {
                break;
            };
            cur = node.next;
            let Some(addr) = self.addrs.block_mut(node.addr) else {
                continue;
            };
            let hit = !found
                && match addr.ip {
                    IpAddr::V4(v4) => {
                        if own_literal {
                            host_name == name
                        } else {
                            query_v4 == Some(v4)
                        }
                    }
                    IpAddr::V6(v6) => query_v6 == Some(v6),
                };
            found |= hit;
            if update {
                addr.preferred = hit;
            }
        }
        found
    }

    /// Finds `name` and copies its addresses into `out`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::CacheHostNotFound`] if no entry matches.
    pub(crate) fn search(&mut self, name: &str, out: &mut [HostAddr], flags: LookupFlags) -> Result<SearchHit> {
        let key = self
            .search_by_name(name, flags)
            .ok_or(ResolverError::CacheHostNotFound)?;
        self.snapshot(key, name, out, flags.without(LookupFlags::UPDATE_PREF))
    }

    /// Copies the addresses of `key` into `out`, filtered by the family flags.
    ///
    /// Nothing is copied unless the host is resolved.
    pub(crate) fn snapshot(
        &mut self,
        key: HostKey,
        name: &str,
        out: &mut [HostAddr],
        flags: LookupFlags,
    ) -> Result<SearchHit> {
        if flags.is_reverse() && flags.contains(LookupFlags::UPDATE_PREF) {
            self.matches(key, name, flags);
        }

        let host = self.host(key)?;
        let status = host.state.status();
        let mut count = 0;
        if status == Status::Resolved {
            let no_v4 = flags.is_ipv6_only();
            let no_v6 = flags.is_ipv4_only();
            for addr in iter_addrs(&self.nodes, &self.addrs, host.addrs.head) {
                if count == out.len() {
                    break;
                }
                let skip = match addr.ip {
                    IpAddr::V4(_) => no_v4,
                    IpAddr::V6(_) => no_v6,
                };
                if !skip {
                    out[count] = *addr;
                    count += 1;
                }
            }
        }
        Ok(SearchHit {
            host: key,
            status,
            count,
        })
    }

    pub(crate) fn state(&self, key: HostKey) -> Result<HostState> {
        Ok(self.host(key)?.state)
    }

    /// Reverse name resolved for `key`, if any.
    pub(crate) fn reverse_name(&self, key: HostKey) -> Option<String> {
        let name = self.name(self.hosts.block(key)?.reverse?);
        (!name.is_empty()).then(|| name.to_owned())
    }

    /// Canonical name recorded for `key`, if any.
    pub(crate) fn canonical_name(&self, key: HostKey) -> Option<String> {
        let name = self.name(self.hosts.block(key)?.canonical?);
        (!name.is_empty()).then(|| name.to_owned())
    }

    /// Returns `true` if `ip` is on the host and flagged preferred.
    pub(crate) fn is_preferred(&self, key: HostKey, ip: IpAddr) -> bool {
        self.hosts.block(key).is_some_and(|host| {
            iter_addrs(&self.nodes, &self.addrs, host.addrs.head).any(|a| a.ip == ip && a.preferred)
        })
    }

    /// Marks the only address of `key` as preferred.
    pub(crate) fn mark_single_preferred(&mut self, key: HostKey) {
        let Some(host) = self.hosts.block(key) else {
            return;
        };
        if host.addrs.len() != 1 {
            return;
        }
        let addr = host
            .addrs
            .head
            .and_then(|n| self.nodes.block(n))
            .map(|n| n.addr);
        if let Some(addr) = addr.and_then(|a| self.addrs.block_mut(a)) {
            addr.preferred = true;
        }
    }

    pub(crate) fn take_error(&mut self, key: HostKey) -> Option<ResolverError> {
        self.hosts.block_mut(key)?.error.take()
    }

    /// Completion fired when `key` reaches a terminal state.
    pub(crate) fn waiter(&mut self, key: HostKey) -> Result<Arc<Completion>> {
        let host = self.host_mut(key)?;
        if host.state.is_terminal() {
            return Ok(Arc::new(Completion::finished()));
        }
        Ok(Arc::clone(
            host.waiter.get_or_insert_with(|| Arc::new(Completion::new())),
        ))
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.used(),
            hosts_free: self.hosts.available(),
            addrs_free: self.addrs.available(),
        }
    }

    // -----------------------------------------------------------------------
    // Allocation and lifecycle
    // -----------------------------------------------------------------------

    /// Returns a host record in `InitReq` state for `name`.
    ///
    /// With `RESET_REQ` an existing matching host is reused: it keeps its
    /// addresses and is rewound to `InitReq` if it had resolved. Otherwise a
    /// fresh record is allocated, evicting the oldest terminal entry when the
    /// host pool is exhausted. Canonical and reverse name buffers are only
    /// taken when the flags ask for them.
    ///
    /// # Errors
    ///
    /// - [`ResolverError::InvalidArg`] if `name` is longer than the limit
    /// - [`ResolverError::MemAlloc`] if a pool is exhausted and nothing can be
    ///   evicted
    pub(crate) fn get_or_create_host(&mut self, name: &str, request: Request) -> Result<HostKey> {
        if name.len() > self.name_len_max {
            return Err(ResolverError::InvalidArg("host name too long"));
        }

        if request.flags.contains(LookupFlags::RESET_REQ) {
            if let Some(key) = self.search_by_name(name, request.flags) {
                self.attach_request(key, request)?;
                tracing::debug!(host = name, "Rewinding cached host");
                return Ok(key);
            }
        }

        if self.hosts.available() == 0 {
            self.evict()?;
        }

        let name_key = self.names.get(name.to_owned())?;
        let key = match self.hosts.get(Host::new(name_key)) {
            Ok(key) => key,
            Err(e) => {
                self.names.free(name_key);
                return Err(e);
            }
        };
        if let Err(e) = self.attach_request(key, request) {
            self.release_host(key);
            return Err(e);
        }
        Ok(key)
    }

    fn attach_request(&mut self, key: HostKey, request: Request) -> Result<()> {
        let reset = request.flags.contains(LookupFlags::RESET_REQ);
        let request = Request {
            flags: request.flags.without(LookupFlags::RESET_REQ),
            ..request
        };

        let (need_canon, need_rev, req) = {
            let host = self.host(key)?;
            (
                request.flags.is_canonical() && host.canonical.is_none(),
                request.flags.is_reverse() && host.reverse.is_none(),
                host.req,
            )
        };
        if need_canon {
            let k = self.names.get(String::new())?;
            self.host_mut(key)?.canonical = Some(k);
        }
        if need_rev {
            let k = self.names.get(String::new())?;
            self.host_mut(key)?.reverse = Some(k);
        }
        match req {
            Some(k) if self.reqs.contains(k) => {
                if let Some(slot) = self.reqs.block_mut(k) {
                    *slot = request;
                }
            }
            _ => {
                let k = self.reqs.get(request)?;
                self.host_mut(key)?.req = Some(k);
            }
        }

        let host = self.host_mut(key)?;
        host.last_tx_ms = 0;
        host.link_wait_since_ms = None;
        host.interface = None;
        host.wire = Arc::default();
        host.error = None;
        if reset && host.state == HostState::Resolved {
            host.state = HostState::InitReq;
        }
        Ok(())
    }

    /// Picks the terminal entry nearest the tail, the least recently
    /// inserted or looked up, and releases it.
    fn evict(&mut self) -> Result<()> {
        let mut victim = None;
        let mut cur = self.head;
        while let Some(ek) = cur {
            let Some(entry) = self.entries.block(ek) else {
                break;
            };
            cur = entry.next;
            if self
                .hosts
                .block(entry.host)
                .is_some_and(|h| h.state.is_terminal())
            {
                victim = Some((ek, entry.host));
            }
        }

        let (ek, hk) = victim.ok_or(ResolverError::MemAlloc {
            pool: self.hosts.name(),
        })?;
        if let Some(host) = self.hosts.block(hk) {
            tracing::debug!(host = self.name(host.name), "Evicting cache entry");
        }
        self.unlink(ek);
        self.release_host(hk);
        Ok(())
    }

    /// Links `key` at the head of the cache. Already linked hosts stay put.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::CacheHostNotFound`] for a stale handle and
    /// [`ResolverError::MemAlloc`] if the entry pool is exhausted.
    pub(crate) fn insert(&mut self, key: HostKey) -> Result<()> {
        if !self.hosts.contains(key) {
            return Err(ResolverError::CacheHostNotFound);
        }
        if self.entry_of(key).is_some() {
            return Ok(());
        }
        let ek = self.entries.get(CacheEntry {
            host: key,
            next: self.head,
        })?;
        self.head = Some(ek);
        Ok(())
    }

    /// Removes a host that is not mid-resolution.
    ///
    /// # Errors
    ///
    /// - [`ResolverError::CacheHostNotFound`] for a stale handle
    /// - [`ResolverError::CacheHostPending`] if the host is in flight
    pub(crate) fn remove(&mut self, key: HostKey) -> Result<()> {
        if !self.host(key)?.state.is_terminal() {
            return Err(ResolverError::CacheHostPending);
        }
        self.discard(key);
        Ok(())
    }

    /// Removes the host registered under `name`.
    ///
    /// # Errors
    ///
    /// As for [`remove`](Self::remove), with
    /// [`ResolverError::CacheHostNotFound`] when no entry matches.
    pub(crate) fn remove_by_name(&mut self, name: &str) -> Result<()> {
        let key = self
            .search_by_name(name, LookupFlags::NONE)
            .ok_or(ResolverError::CacheHostNotFound)?;
        self.remove(key)
    }

    /// Unlinks and releases `key` whatever its state.
    pub(crate) fn discard(&mut self, key: HostKey) {
        if let Some(ek) = self.entry_of(key) {
            self.unlink(ek);
        }
        self.release_host(key);
    }

    /// Releases every entry that is not in flight.
    pub(crate) fn clear(&mut self) -> usize {
        let mut removed = 0;
        let mut cur = self.head;
        while let Some(ek) = cur {
            let Some(entry) = self.entries.block(ek) else {
                break;
            };
            cur = entry.next;
            let hk = entry.host;
            if self.hosts.block(hk).is_none_or(|h| h.state.is_terminal()) {
                self.unlink(ek);
                self.release_host(hk);
                removed += 1;
            }
        }
        removed
    }

    /// Abandons every blocked waiter.
    pub(crate) fn abandon_waiters(&mut self) {
        let mut cur = self.head;
        while let Some(ek) = cur {
            let Some(entry) = self.entries.block(ek) else {
                break;
            };
            cur = entry.next;
            if let Some(waiter) = self
                .hosts
                .block_mut(entry.host)
                .and_then(|h| h.waiter.take())
            {
                waiter.abandon();
            }
        }
    }

    fn unlink(&mut self, target: EntryKey) {
        self.detach(target);
        self.entries.free(target);
    }

    /// Moves `target` to the head of the list.
    fn promote(&mut self, target: EntryKey) {
        if self.head == Some(target) || !self.detach(target) {
            return;
        }
        if let Some(entry) = self.entries.block_mut(target) {
            entry.next = self.head;
            self.head = Some(target);
        }
    }

    /// Takes `target` out of the list without releasing it.
    fn detach(&mut self, target: EntryKey) -> bool {
        let Some(next) = self.entries.block(target).map(|e| e.next) else {
            return false;
        };
        if self.head == Some(target) {
            self.head = next;
            return true;
        }
        let mut cur = self.head;
        while let Some(ek) = cur {
            let Some(entry) = self.entries.block_mut(ek) else {
                break;
            };
            if entry.next == Some(target) {
                entry.next = next;
                return true;
            }
            cur = entry.next;
        }
        false
    }

    fn release_host(&mut self, key: HostKey) {
        let Some(mut host) = self.hosts.free(key) else {
            return;
        };
        self.free_addrs(std::mem::take(&mut host.addrs));
        self.names.free(host.name);
        if let Some(k) = host.canonical {
            self.names.free(k);
        }
        if let Some(k) = host.reverse {
            self.names.free(k);
        }
        if let Some(k) = host.req {
            self.reqs.free(k);
        }
        if let Some(waiter) = host.waiter.take() {
            waiter.abandon();
        }
    }

    fn free_addrs(&mut self, list: AddrList) {
        let mut cur = list.head;
        while let Some(nk) = cur {
            let Some(node) = self.nodes.free(nk) else {
                break;
            };
            self.addrs.free(node.addr);
            cur = node.next;
        }
    }

    /// Appends `ip` to the host's address list.
    fn add_addr(&mut self, key: HostKey, ip: IpAddr, preferred: bool) -> Result<()> {
        let family = Family::of(&ip);
        if family == Family::V6 && !cfg!(feature = "ipv6") {
            return Err(ResolverError::AddrInvalid);
        }
        let host = self.host(key)?;
        let (count, max) = match family {
            Family::V4 => (host.addrs.v4, self.v4_max),
            Family::V6 => (host.addrs.v6, self.v6_max),
        };
        if count >= max {
            return Err(ResolverError::MemAlloc {
                pool: "host address",
            });
        }

        let ak = self.addrs.get(HostAddr { ip, preferred })?;
        let nk = match self.nodes.get(AddrNode { addr: ak, next: None }) {
            Ok(k) => k,
            Err(e) => {
                self.addrs.free(ak);
                return Err(e);
            }
        };
        let host = self
            .hosts
            .block_mut(key)
            .ok_or(ResolverError::CacheHostNotFound)?;
        host.addrs.push(&mut self.nodes, nk, family);
        Ok(())
    }

    /// Drops every address of `family` from the host.
    fn drop_family(&mut self, key: HostKey, family: Family) {
        let Some(host) = self.hosts.block_mut(key) else {
            return;
        };
        let list = std::mem::take(&mut host.addrs);
        let mut kept = AddrList::default();
        let mut cur = list.head;
        while let Some(nk) = cur {
            let Some(node) = self.nodes.block_mut(nk) else {
                break;
            };
            cur = node.next.take();
            let addr = node.addr;
            match self.addrs.block(addr).map(|a| Family::of(&a.ip)) {
                Some(f) if f != family => kept.push(&mut self.nodes, nk, f),
                _ => {
                    self.nodes.free(nk);
                    self.addrs.free(addr);
                }
            }
        }
        if let Some(host) = self.hosts.block_mut(key) {
            host.addrs = kept;
        }
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    /// Plans the next step of `key`.
    ///
    /// Terminal hosts, and hosts another driver is stepping, plan nothing.
    /// A step that cannot even be planned fails the host.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::CacheHostNotFound`] for a stale handle.
    fn plan(&mut self, key: HostKey, net: &Network<'_>) -> Result<Plan> {
        let (state, slot) = {
            let host = self.host(key)?;
            (host.state, Arc::clone(&host.wire))
        };
        if state.is_terminal() {
            return Ok(Plan::Idle(state.status()));
        }
        let Some(mut wire) = slot.try_lock() else {
            return Ok(Plan::Idle(Status::Pending));
        };

        match self.prepare(key, state, wire.conn.is_some(), net) {
            Ok(io) => {
                let steps = wire.steps;
                drop(wire);
                Ok(Plan::Run(Step {
                    wire: slot,
                    steps,
                    io,
                }))
            }
            Err(e) => {
                wire.steps = wire.steps.wrapping_add(1);
                Ok(Plan::Idle(self.conclude(key, Err(e), &mut wire.conn)?))
            }
        }
    }

    fn prepare(
        &mut self,
        key: HostKey,
        state: HostState,
        connected: bool,
        net: &Network<'_>,
    ) -> Result<Io> {
        if !connected && state != HostState::InitReq {
            return Err(ResolverError::Fault("step without socket"));
        }
        match state {
            HostState::InitReq => {
                let request = self.request(key)?;
                Ok(Io::Open {
                    server: request.effective.server,
                    port: request.effective.port,
                })
            }
            HostState::InterfaceSelect => Ok(Io::Select {
                last: self.host(key)?.interface,
            }),
            HostState::Tx(track) => {
                let qname = match track {
                    Track::A | Track::Aaaa => self.name(self.host(key)?.name).to_owned(),
                    Track::PtrV4 | Track::PtrV6 => self.ptr_query_name(key, track)?,
                };
                let id = net.ids.next_id();
                let mut buf = [0u8; MAX_MESSAGE_SIZE];
                let len = codec::encode_query(&mut buf, &qname, track.kind(), id)?;
                Ok(Io::Transmit {
                    track,
                    id,
                    qname,
                    query: buf[..len].to_vec(),
                })
            }
            HostState::Rx(track) => Ok(Io::Receive { track }),
            HostState::Resolved | HostState::Failed => {
                Err(ResolverError::Fault("stepping a finished host"))
            }
        }
    }

    /// Applies the result of a step carried out on `wire`.
    ///
    /// A host that finished while the step ran keeps its state and the
    /// result is dropped.
    fn apply(
        &mut self,
        key: HostKey,
        outcome: Outcome,
        wire: &mut Wire,
        net: &Network<'_>,
    ) -> Result<Status> {
        let state = self.host(key)?.state;
        if state.is_terminal() {
            return Ok(state.status());
        }
        wire.steps = wire.steps.wrapping_add(1);
        let step = self.transition(key, outcome, &mut wire.conn, net);
        self.conclude(key, step, &mut wire.conn)
    }

    /// Records a failed step on the host and wraps up terminal hosts.
    fn conclude(
        &mut self,
        key: HostKey,
        step: Result<Status>,
        conn: &mut Option<Box<dyn Connection>>,
    ) -> Result<Status> {
        let status = match step {
            Ok(status) => status,
            Err(e) => {
                let host = self.host_mut(key)?;
                host.state = HostState::Failed;
                host.error = Some(e);
                Status::Failed
            }
        };
        if status != Status::Pending {
            self.finish(key, conn);
        }
        Ok(status)
    }

    /// Collects the hosts that still need driving.
    pub(crate) fn pending_hosts(&self) -> Vec<HostKey> {
        let mut pending = Vec::new();
        let mut cur = self.head;
        while let Some(ek) = cur {
            let Some(entry) = self.entries.block(ek) else {
                break;
            };
            cur = entry.next;
            if self
                .hosts
                .block(entry.host)
                .is_some_and(|h| !h.state.is_terminal())
            {
                pending.push(entry.host);
            }
        }
        pending
    }

    fn finish(&mut self, key: HostKey, conn: &mut Option<Box<dyn Connection>>) {
        *conn = None;
        let Some(host) = self.hosts.block_mut(key) else {
            return;
        };
        if let Some(waiter) = host.waiter.take() {
            waiter.signal();
        }
        let host = &*host;
        let name = self.names.block(host.name).map_or("", String::as_str);
        match &host.error {
            Some(e) if host.state == HostState::Failed => {
                tracing::info!(host = name, error = %e, "Host resolution failed");
            }
            _ => tracing::info!(host = name, addrs = host.addrs.len(), "Host resolved"),
        }
    }

    fn transition(
        &mut self,
        key: HostKey,
        outcome: Outcome,
        conn: &mut Option<Box<dyn Connection>>,
        net: &Network<'_>,
    ) -> Result<Status> {
        match outcome {
            Outcome::Opened(result) => {
                *conn = Some(result?);
                let host = self.host_mut(key)?;
                host.retries = 0;
                host.interface = None;
                host.state = HostState::InterfaceSelect;
                Ok(Status::Pending)
            }
            Outcome::Selected(result) => self.on_selected(key, result, net),
            Outcome::Sent {
                track,
                id,
                qname,
                result,
            } => self.on_sent(key, track, id, &qname, result, net),
            Outcome::Received { track, result } => self.on_received(key, track, result, net),
        }
    }

    fn on_selected(
        &mut self,
        key: HostKey,
        result: Result<usize>,
        net: &Network<'_>,
    ) -> Result<Status> {
        let request = self.request(key)?;
        let now = net.now_ms();
        let host = self.host_mut(key)?;
        match result {
            Ok(pos) => {
                host.interface = Some(pos);
                host.link_wait_since_ms = None;
                host.retries = 0;
                host.state = HostState::Tx(request.track.unwrap_or(Track::A));
                Ok(Status::Pending)
            }
            Err(ResolverError::IfLinkDown) => {
                // Keep waiting for a link, but not past the request's whole
                // retry budget.
                let since = *host.link_wait_since_ms.get_or_insert(now);
                let budget = request
                    .effective
                    .timeout_ms
                    .saturating_mul(u64::from(request.effective.retry_max));
                if now.saturating_sub(since) >= budget {
                    return Err(ResolverError::IfLinkDown);
                }
                tracing::debug!("No interface link up, waiting");
                Ok(Status::Pending)
            }
            Err(e) => Err(e),
        }
    }

    fn on_sent(
        &mut self,
        key: HostKey,
        track: Track,
        id: u16,
        qname: &str,
        result: Result<()>,
        net: &Network<'_>,
    ) -> Result<Status> {
        let host = self.host_mut(key)?;
        match result {
            Ok(()) => {
                host.query_id = id;
                host.state = HostState::Rx(track);
                host.last_tx_ms = net.now_ms();
                host.retries = host.retries.saturating_add(1);
                tracing::debug!(
                    qname,
                    query_id = id,
                    track = ?track,
                    attempt = host.retries,
                    "Query sent"
                );
                Ok(Status::Pending)
            }
            Err(ResolverError::IfLinkDown) => {
                tracing::debug!(qname, "Link down while sending, selecting another interface");
                host.state = HostState::InterfaceSelect;
                Ok(Status::Pending)
            }
            Err(e) => Err(e),
        }
    }

    /// Builds the reverse-mapping name for a PTR track.
    ///
    /// An address literal host name is used directly and recorded on the host
    /// as its preferred address. Otherwise the host's preferred address of
    /// the track's family is used, falling back to any address of that
    /// family.
    fn ptr_query_name(&mut self, key: HostKey, track: Track) -> Result<String> {
        let family = track.family();
        let host = self.host(key)?;
        let literal = self
            .name(host.name)
            .parse::<IpAddr>()
            .ok()
            .filter(|ip| Family::of(ip) == family);

        let ip = if let Some(ip) = literal {
            let known = iter_addrs(&self.nodes, &self.addrs, host.addrs.head).any(|a| a.ip == ip);
            if !known {
                self.add_addr(key, ip, true)?;
            }
            ip
        } else {
            let mut fallback = None;
            let mut preferred = None;
            for addr in iter_addrs(&self.nodes, &self.addrs, host.addrs.head) {
                if Family::of(&addr.ip) != family {
                    continue;
                }
                fallback = Some(addr.ip);
                if addr.preferred {
                    preferred = Some(addr.ip);
                    break;
                }
            }
            preferred
                .or(fallback)
                .ok_or(ResolverError::InvalidHostName)?
        };

        let name = addr::reverse_name(ip);
        if name.len() > self.name_len_max {
            return Err(ResolverError::InvalidHostName);
        }
        Ok(name)
    }

    fn on_received(
        &mut self,
        key: HostKey,
        track: Track,
        result: Result<Vec<u8>>,
        net: &Network<'_>,
    ) -> Result<Status> {
        let request = self.request(key)?;
        let host = self.host_mut(key)?;
        let expected = host.query_id;

        match result {
            Ok(msg) => {
                let mut sink = HostSink { store: self, key };
                match codec::decode_response(&msg, expected, &mut sink) {
                    Ok(_) => self.advance(key, track),
                    Err(e @ (ResolverError::NotAResponse | ResolverError::BadResponseId { .. })) => {
                        tracing::warn!(error = %e, "Dropping unexpected datagram");
                        Ok(Status::Pending)
                    }
                    Err(e) if track == Track::Aaaa && e.is_server_reported() => {
                        self.keep_ipv4(key, e)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(ResolverError::Rx) => {
                let elapsed = net.now_ms().saturating_sub(host.last_tx_ms);
                if elapsed < request.effective.timeout_ms {
                    return Ok(Status::Pending);
                }
                if host.retries < request.effective.retry_max {
                    tracing::debug!(query_id = expected, track = ?track, "Response timed out, retrying");
                    host.state = HostState::Tx(track);
                    return Ok(Status::Pending);
                }
                self.give_up(key, track)
            }
            Err(e) => Err(e),
        }
    }

    /// A server error on the AAAA query resolves the host with the IPv4
    /// addresses already collected, if any.
    fn keep_ipv4(&mut self, key: HostKey, error: ResolverError) -> Result<Status> {
        let host = self.host_mut(key)?;
        if host.addrs.len() == 0 {
            return Err(error);
        }
        tracing::debug!(error = %error, "AAAA query refused, keeping IPv4 addresses");
        host.state = HostState::Resolved;
        Ok(Status::Resolved)
    }

    fn advance(&mut self, key: HostKey, track: Track) -> Result<Status> {
        let host = self.host_mut(key)?;
        match track {
            Track::PtrV4 | Track::PtrV6 => {
                host.state = HostState::Resolved;
                Ok(Status::Resolved)
            }
            Track::A if cfg!(feature = "ipv6") => {
                host.retries = 0;
                host.state = HostState::Tx(Track::Aaaa);
                Ok(Status::Pending)
            }
            Track::A | Track::Aaaa => {
                if host.addrs.len() > 0 {
                    host.state = HostState::Resolved;
                    Ok(Status::Resolved)
                } else {
                    // Nothing of either family: try the next interface.
                    host.state = HostState::InterfaceSelect;
                    Ok(Status::Pending)
                }
            }
        }
    }

    fn give_up(&mut self, key: HostKey, track: Track) -> Result<Status> {
        match track {
            Track::PtrV4 | Track::PtrV6 => {
                self.drop_family(key, track.family());
            }
            Track::Aaaa => {
                let host = self.host_mut(key)?;
                if host.addrs.len() > 0 {
                    host.state = HostState::Resolved;
                    return Ok(Status::Resolved);
                }
            }
            Track::A => {}
        }
        Err(ResolverError::NoServer)
    }
}

/// Stores decoded answers on a host.
struct HostSink<'a> {
    store: &'a mut CacheStore,
    key: HostKey,
}

impl HostSink<'_> {
    fn set_name(&mut self, slot: Option<NameKey>, name: &str) -> Result<()> {
        if name.len() > self.store.name_len_max {
            return Err(ResolverError::InvalidHostName);
        }
        if let Some(buf) = slot.and_then(|k| self.store.names.block_mut(k)) {
            buf.clear();
            buf.push_str(name);
        }
        Ok(())
    }
}

impl AnswerSink for HostSink<'_> {
    fn on_address(&mut self, ip: IpAddr) -> Result<()> {
        self.store.add_addr(self.key, ip, false)
    }

    fn on_canonical_name(&mut self, name: &str) -> Result<()> {
        let slot = self.store.host(self.key)?.canonical;
        self.set_name(slot, name)
    }

    fn on_reverse_name(&mut self, name: &str) -> Result<()> {
        let slot = self.store.host(self.key)?.reverse;
        self.set_name(slot, name)
    }
}
