//! UDP transport adapter and interface selection.
//!
//! The resolver talks to the network only through [`Transport`],
//! [`Connection`] and [`InterfaceDirectory`]. The std implementations
//! ([`UdpTransport`], [`SystemInterfaces`]) are used by
//! [`Resolver::init`](crate::Resolver::init); tests inject scripted ones.
//!
//! Every connection is non-blocking. An empty receive queue is reported as
//! [`ResolverError::Rx`] and left to the state machine's retry timer.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{ResolverError, Result};

/// Transmit attempts on a transient send error.
pub const TX_RETRY_MAX: u32 = 5;

/// Delay between transmit attempts.
pub const TX_RETRY_DELAY: Duration = Duration::from_millis(10);

/// One configured network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// OS interface index.
    pub index: u32,
    /// Interface name (`eth0`, `en0`, ...).
    pub name: String,
    /// Administratively up and running.
    pub link_up: bool,
}

impl Interface {
    /// Creates an interface entry.
    #[must_use]
    pub fn new(index: u32, name: impl Into<String>, link_up: bool) -> Self {
        Self {
            index,
            name: name.into(),
            link_up,
        }
    }
}

/// Enumerates interfaces and their link state.
pub trait InterfaceDirectory: Send + Sync {
    /// Lists configured interfaces in a stable order.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the interface table cannot be read.
    fn interfaces(&self) -> io::Result<Vec<Interface>>;
}

/// Opens UDP associations to DNS servers.
pub trait Transport: Send + Sync {
    /// Opens a non-blocking socket bound to the wildcard address of the
    /// server's family and connected to `server`.
    ///
    /// # Errors
    ///
    /// Returns the OS error from socket creation, bind or connect.
    fn open(&self, server: SocketAddr) -> io::Result<Box<dyn Connection>>;
}

/// A connected, non-blocking UDP association.
///
/// Dropping the connection closes it.
pub trait Connection: Send {
    /// Restricts traffic to `interface`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the binding is refused.
    fn bind_interface(&mut self, interface: &Interface) -> io::Result<()>;

    /// Sends one datagram. `WouldBlock` means try again shortly.
    ///
    /// # Errors
    ///
    /// Returns the OS error.
    fn send(&mut self, datagram: &[u8]) -> io::Result<usize>;

    /// Receives one datagram into `buf`. `WouldBlock` means nothing is queued.
    ///
    /// # Errors
    ///
    /// Returns the OS error.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Opens a connection to `server`, or to `default` when no explicit server
/// is given.
///
/// # Errors
///
/// - [`ResolverError::InvalidServer`] if neither address is set
/// - [`ResolverError::AddrInvalid`] for an IPv6 server without IPv6 support
/// - [`ResolverError::SockOpenFail`] if the socket cannot be set up
pub fn open(
    transport: &dyn Transport,
    server: Option<IpAddr>,
    port: u16,
    default: Option<IpAddr>,
) -> Result<Box<dyn Connection>> {
    let ip = server.or(default).ok_or(ResolverError::InvalidServer)?;
    if ip.is_ipv6() && !cfg!(feature = "ipv6") {
        return Err(ResolverError::AddrInvalid);
    }

    let target = SocketAddr::new(ip, port);
    transport.open(target).map_err(|e| {
        tracing::warn!(server = %target, error = %e, "Failed to open DNS socket");
        ResolverError::SockOpenFail
    })
}

/// Picks the first interface with its link up after position `last`, or
/// from the start when `last` is `None`, and binds `conn` to it.
///
/// Returns the position of the chosen interface in the directory listing.
///
/// # Errors
///
/// - [`ResolverError::NoResponse`] if `last` was the final interface
/// - [`ResolverError::IfLinkDown`] if no remaining interface is up
/// - [`ResolverError::SockOpenFail`] if binding fails
pub fn select_interface(
    directory: &dyn InterfaceDirectory,
    last: Option<usize>,
    conn: &mut dyn Connection,
) -> Result<usize> {
    let interfaces = directory.interfaces().map_err(|e| {
        tracing::warn!(error = %e, "Failed to list interfaces");
        ResolverError::IfLinkDown
    })?;

    let start = match last {
        Some(pos) if pos + 1 >= interfaces.len() => return Err(ResolverError::NoResponse),
        Some(pos) => pos + 1,
        None => 0,
    };

    let (pos, interface) = interfaces
        .iter()
        .enumerate()
        .skip(start)
        .find(|(_, i)| i.link_up)
        .ok_or(ResolverError::IfLinkDown)?;

    conn.bind_interface(interface).map_err(|e| {
        tracing::warn!(interface = %interface.name, error = %e, "Failed to bind interface");
        ResolverError::SockOpenFail
    })?;

    tracing::debug!(interface = %interface.name, index = interface.index, "Interface selected");
    Ok(pos)
}

/// Sends `datagram`, retrying transient errors up to [`TX_RETRY_MAX`] times.
///
/// # Errors
///
/// - [`ResolverError::IfLinkDown`] if the network is down or unreachable
/// - [`ResolverError::Tx`] if the transient error persists
/// - [`ResolverError::TxFault`] for any other error
pub fn send(conn: &mut dyn Connection, clock: &dyn Clock, datagram: &[u8]) -> Result<()> {
    for _ in 0..TX_RETRY_MAX {
        match conn.send(datagram) {
            Ok(_) => return Ok(()),
            Err(e) if is_transient(&e) => clock.sleep(TX_RETRY_DELAY),
            Err(e) if is_link_down(&e) => return Err(ResolverError::IfLinkDown),
            Err(e) => {
                tracing::warn!(error = %e, "DNS transmit fault");
                return Err(ResolverError::TxFault);
            }
        }
    }
    Err(ResolverError::Tx)
}

/// Receives one datagram without waiting.
///
/// # Errors
///
/// - [`ResolverError::Rx`] if nothing is queued
/// - [`ResolverError::RxFault`] for any other error
pub fn receive(conn: &mut dyn Connection, buf: &mut [u8]) -> Result<usize> {
    match conn.recv(buf) {
        Ok(n) => Ok(n),
        // A refused port on a connected UDP socket surfaces here; treat it
        // like silence and let the retry budget decide.
        Err(e) if is_transient(&e) || e.kind() == io::ErrorKind::ConnectionRefused => {
            Err(ResolverError::Rx)
        }
        Err(e) => {
            tracing::warn!(error = %e, "DNS receive fault");
            Err(ResolverError::RxFault)
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

fn is_link_down(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NetworkDown | io::ErrorKind::NetworkUnreachable
    )
}

// ---------------------------------------------------------------------------
// std implementations
// ---------------------------------------------------------------------------

/// [`Transport`] over [`std::net::UdpSocket`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpTransport;

impl Transport for UdpTransport {
    fn open(&self, server: SocketAddr) -> io::Result<Box<dyn Connection>> {
        let local: SocketAddr = match server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(server)?;
        socket.set_nonblocking(true)?;
        Ok(Box::new(UdpConnection { socket }))
    }
}

struct UdpConnection {
    socket: UdpSocket,
}

impl Connection for UdpConnection {
    #[cfg(target_os = "linux")]
    fn bind_interface(&mut self, interface: &Interface) -> io::Result<()> {
        use std::os::fd::AsRawFd;

        // A loopback server is reachable whatever the device.
        if self.socket.peer_addr()?.ip().is_loopback() {
            return Ok(());
        }

        let name = interface.name.as_bytes();
        let len = libc::socklen_t::try_from(name.len())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        // SAFETY: `name` is valid for `len` bytes and the fd is owned by
        // `self.socket` for the duration of the call.
        let rc = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                name.as_ptr().cast(),
                len,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        // Unprivileged processes may not pin a device; routing picks the
        // interface instead.
        if err.raw_os_error() == Some(libc::EPERM) {
            tracing::debug!(interface = %interface.name, "Interface binding not permitted, using routing");
            return Ok(());
        }
        Err(err)
    }

    #[cfg(not(target_os = "linux"))]
    fn bind_interface(&mut self, interface: &Interface) -> io::Result<()> {
        tracing::debug!(interface = %interface.name, "Interface binding left to routing");
        Ok(())
    }

    fn send(&mut self, datagram: &[u8]) -> io::Result<usize> {
        self.socket.send(datagram)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }
}

/// [`InterfaceDirectory`] backed by `getifaddrs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceDirectory for SystemInterfaces {
    fn interfaces(&self) -> io::Result<Vec<Interface>> {
        let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
        // SAFETY: `head` is a valid out-pointer; the list is released below.
        if unsafe { libc::getifaddrs(&raw mut head) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut found: Vec<(bool, Interface)> = Vec::new();
        let mut cur = head;
        while !cur.is_null() {
            // SAFETY: `cur` walks the list returned by getifaddrs, which stays
            // valid until freeifaddrs.
            let entry = unsafe { &*cur };
            cur = entry.ifa_next;
            if entry.ifa_name.is_null() {
                continue;
            }
            // SAFETY: ifa_name is a NUL-terminated string owned by the list.
            let name = unsafe { std::ffi::CStr::from_ptr(entry.ifa_name) };
            let name = name.to_string_lossy().into_owned();
            if found.iter().any(|(_, i)| i.name == name) {
                continue;
            }
            let flags = entry.ifa_flags;
            let up = flags & libc::IFF_UP as libc::c_uint != 0
                && flags & libc::IFF_RUNNING as libc::c_uint != 0;
            let loopback = flags & libc::IFF_LOOPBACK as libc::c_uint != 0;
            // SAFETY: ifa_name is a valid C string.
            let index = unsafe { libc::if_nametoindex(entry.ifa_name) };
            found.push((loopback, Interface::new(index, name, up)));
        }

        // SAFETY: `head` came from a successful getifaddrs call.
        unsafe { libc::freeifaddrs(head) };

        // Loopback last, so failover reaches it only after real links.
        found.sort_by_key(|(loopback, i)| (*loopback, i.index));
        Ok(found.into_iter().map(|(_, i)| i).collect())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted collaborators for unit tests.

    use std::collections::{HashMap, VecDeque};
    use std::io;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{Connection, Interface, InterfaceDirectory, Transport};
    use crate::clock::Clock;
    use crate::codec::{self, Question};

    /// One scripted answer record.
    #[derive(Debug, Clone)]
    pub enum Record {
        Addr(IpAddr),
        Cname(String),
        Ptr(String),
    }

    /// What the fake server knows and what it has been asked.
    #[derive(Default)]
    pub struct Script {
        pub answers: HashMap<(String, u16), Vec<Record>>,
        pub rcodes: HashMap<(String, u16), u16>,
        pub silent: bool,
        /// Errors returned by upcoming sends, one per call.
        pub send_errors: VecDeque<io::ErrorKind>,
        pub sent: Vec<(u64, Question)>,
        pub servers: Vec<SocketAddr>,
        /// Interfaces connections were bound to, in order.
        pub bound: Vec<String>,
    }

    /// A transport whose connections answer from a shared [`Script`].
    #[derive(Clone)]
    pub struct ScriptedTransport {
        pub script: Arc<Mutex<Script>>,
        clock: Arc<dyn Clock>,
    }

    impl ScriptedTransport {
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                script: Arc::default(),
                clock,
            }
        }

        pub fn answer(&self, name: &str, qtype: u16, records: Vec<Record>) {
            self.script
                .lock()
                .answers
                .insert((name.to_string(), qtype), records);
        }

        pub fn rcode(&self, name: &str, qtype: u16, rcode: u16) {
            self.script
                .lock()
                .rcodes
                .insert((name.to_string(), qtype), rcode);
        }

        pub fn sent(&self) -> Vec<(u64, Question)> {
            self.script.lock().sent.clone()
        }

        pub fn bound(&self) -> Vec<String> {
            self.script.lock().bound.clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn open(&self, server: SocketAddr) -> io::Result<Box<dyn Connection>> {
            self.script.lock().servers.push(server);
            Ok(Box::new(ScriptedConnection {
                script: Arc::clone(&self.script),
                clock: Arc::clone(&self.clock),
                queue: VecDeque::new(),
            }))
        }
    }

    struct ScriptedConnection {
        script: Arc<Mutex<Script>>,
        clock: Arc<dyn Clock>,
        queue: VecDeque<Vec<u8>>,
    }

    impl Connection for ScriptedConnection {
        fn bind_interface(&mut self, interface: &Interface) -> io::Result<()> {
            self.script.lock().bound.push(interface.name.clone());
            Ok(())
        }

        fn send(&mut self, datagram: &[u8]) -> io::Result<usize> {
            let question = codec::parse_query(datagram)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            let mut script = self.script.lock();
            if let Some(kind) = script.send_errors.pop_front() {
                return Err(kind.into());
            }
            script.sent.push((self.clock.now_ms(), question.clone()));
            if !script.silent {
                let key = (question.name, question.qtype);
                let rcode = script.rcodes.get(&key).copied().unwrap_or(0);
                let records = script.answers.get(&key).cloned().unwrap_or_default();
                self.queue.push_back(response(datagram, rcode, &records));
            }
            Ok(datagram.len())
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let msg = self
                .queue
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
            buf[..msg.len()].copy_from_slice(&msg);
            Ok(msg.len())
        }
    }

    /// Builds a response echoing `query` with `records` as answers.
    pub fn response(query: &[u8], rcode: u16, records: &[Record]) -> Vec<u8> {
        let mut msg = query.to_vec();
        msg[2..4].copy_from_slice(&(0x8180 | rcode).to_be_bytes());
        let count = u16::try_from(records.len()).unwrap();
        msg[6..8].copy_from_slice(&count.to_be_bytes());
        for record in records {
            let (rtype, rdata) = match record {
                Record::Addr(IpAddr::V4(ip)) => (1u16, ip.octets().to_vec()),
                Record::Addr(IpAddr::V6(ip)) => (28, ip.octets().to_vec()),
                Record::Cname(name) => (5, labels(name)),
                Record::Ptr(name) => (12, labels(name)),
            };
            msg.extend_from_slice(&[0xc0, 0x0c]);
            msg.extend_from_slice(&rtype.to_be_bytes());
            msg.extend_from_slice(&1u16.to_be_bytes());
            msg.extend_from_slice(&60u32.to_be_bytes());
            let len = u16::try_from(rdata.len()).unwrap();
            msg.extend_from_slice(&len.to_be_bytes());
            msg.extend_from_slice(&rdata);
        }
        msg
    }

    fn labels(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for label in name.split('.') {
            out.push(u8::try_from(label.len()).unwrap());
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out
    }

    /// An interface table whose link states tests can flip.
    pub struct StaticInterfaces(Mutex<Vec<Interface>>);

    impl StaticInterfaces {
        pub fn new(interfaces: Vec<Interface>) -> Self {
            Self(Mutex::new(interfaces))
        }

        pub fn one_up() -> Self {
            Self::new(vec![Interface::new(1, "eth0", true)])
        }

        pub fn two_up() -> Self {
            Self::new(vec![
                Interface::new(1, "eth0", true),
                Interface::new(2, "eth1", true),
            ])
        }

        pub fn set_link(&self, name: &str, up: bool) {
            for interface in self.0.lock().iter_mut().filter(|i| i.name == name) {
                interface.link_up = up;
            }
        }
    }

    impl InterfaceDirectory for StaticInterfaces {
        fn interfaces(&self) -> io::Result<Vec<Interface>> {
            Ok(self.0.lock().clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use crate::clock::mock::ManualClock;

    struct FakeConn {
        send_results: VecDeque<io::Result<usize>>,
        recv_result: Option<io::ErrorKind>,
        bound: Option<String>,
    }

    impl FakeConn {
        fn new() -> Self {
            Self {
                send_results: VecDeque::new(),
                recv_result: None,
                bound: None,
            }
        }
    }

    impl Connection for FakeConn {
        fn bind_interface(&mut self, interface: &Interface) -> io::Result<()> {
            self.bound = Some(interface.name.clone());
            Ok(())
        }

        fn send(&mut self, datagram: &[u8]) -> io::Result<usize> {
            self.send_results.pop_front().unwrap_or(Ok(datagram.len()))
        }

        fn recv(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            match self.recv_result {
                Some(kind) => Err(kind.into()),
                None => Ok(0),
            }
        }
    }

    fn directory() -> mock::StaticInterfaces {
        mock::StaticInterfaces::new(vec![
            Interface::new(1, "lo", false),
            Interface::new(2, "eth0", true),
            Interface::new(3, "wlan0", true),
        ])
    }

    #[test]
    fn open_requires_a_server() {
        let transport = UdpTransport;
        assert!(matches!(
            open(&transport, None, 53, None),
            Err(ResolverError::InvalidServer)
        ));
    }

    #[test]
    fn open_prefers_explicit_server() {
        let clock = std::sync::Arc::new(ManualClock::default());
        let transport = mock::ScriptedTransport::new(clock);
        let explicit: IpAddr = "192.0.2.1".parse().unwrap();
        let default: IpAddr = "192.0.2.2".parse().unwrap();

        open(&transport, Some(explicit), 5353, Some(default)).unwrap();
        open(&transport, None, 53, Some(default)).unwrap();

        let servers = transport.script.lock().servers.clone();
        assert_eq!(
            servers,
            vec![SocketAddr::new(explicit, 5353), SocketAddr::new(default, 53)]
        );
    }

    #[test]
    fn select_walks_interfaces_in_order() {
        let dir = directory();
        let mut conn = FakeConn::new();

        let first = select_interface(&dir, None, &mut conn).unwrap();
        assert_eq!(first, 1);
        assert_eq!(conn.bound.as_deref(), Some("eth0"));

        let second = select_interface(&dir, Some(first), &mut conn).unwrap();
        assert_eq!(second, 2);
        assert_eq!(conn.bound.as_deref(), Some("wlan0"));

        assert!(matches!(
            select_interface(&dir, Some(second), &mut conn),
            Err(ResolverError::NoResponse)
        ));
    }

    #[test]
    fn select_reports_link_down() {
        let dir = mock::StaticInterfaces::new(vec![
            Interface::new(1, "eth0", false),
            Interface::new(2, "eth1", false),
        ]);
        let mut conn = FakeConn::new();
        assert!(matches!(
            select_interface(&dir, None, &mut conn),
            Err(ResolverError::IfLinkDown)
        ));
        assert!(conn.bound.is_none());
    }

    #[test]
    fn send_retries_transient_errors() {
        let clock = ManualClock::default();
        let mut conn = FakeConn::new();
        conn.send_results.push_back(Err(io::ErrorKind::WouldBlock.into()));
        conn.send_results.push_back(Err(io::ErrorKind::WouldBlock.into()));

        send(&mut conn, &clock, b"q").unwrap();
        assert_eq!(clock.now_ms(), 20);
    }

    #[test]
    fn send_gives_up_after_retry_budget() {
        let clock = ManualClock::default();
        let mut conn = FakeConn::new();
        for _ in 0..TX_RETRY_MAX {
            conn.send_results.push_back(Err(io::ErrorKind::WouldBlock.into()));
        }
        assert!(matches!(
            send(&mut conn, &clock, b"q"),
            Err(ResolverError::Tx)
        ));
        assert_eq!(clock.now_ms(), 50);
    }

    #[test]
    fn send_classifies_errors() {
        let clock = ManualClock::default();

        let mut conn = FakeConn::new();
        conn.send_results.push_back(Err(io::ErrorKind::NetworkDown.into()));
        assert!(matches!(
            send(&mut conn, &clock, b"q"),
            Err(ResolverError::IfLinkDown)
        ));

        let mut conn = FakeConn::new();
        conn.send_results.push_back(Err(io::ErrorKind::PermissionDenied.into()));
        assert!(matches!(
            send(&mut conn, &clock, b"q"),
            Err(ResolverError::TxFault)
        ));
    }

    #[test]
    fn receive_classifies_errors() {
        let mut buf = [0u8; 16];

        let mut conn = FakeConn::new();
        conn.recv_result = Some(io::ErrorKind::WouldBlock);
        assert!(matches!(
            receive(&mut conn, &mut buf),
            Err(ResolverError::Rx)
        ));

        conn.recv_result = Some(io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            receive(&mut conn, &mut buf),
            Err(ResolverError::Rx)
        ));

        conn.recv_result = Some(io::ErrorKind::BrokenPipe);
        assert!(matches!(
            receive(&mut conn, &mut buf),
            Err(ResolverError::RxFault)
        ));
    }

    #[test]
    fn udp_transport_opens_loopback() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut conn = UdpTransport.open(server.local_addr().unwrap()).unwrap();
        conn.bind_interface(&Interface::new(1, "lo", true)).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            receive(conn.as_mut(), &mut buf),
            Err(ResolverError::Rx)
        ));
    }

    #[test]
    #[ignore = "depends on the host's interface table"]
    fn system_interfaces_lists_something() {
        let list = SystemInterfaces.interfaces().unwrap();
        assert!(!list.is_empty());
    }
}
