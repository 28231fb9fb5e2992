//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stub_resolver::codec::{self, Question};
use stub_resolver::{
    Clock, Connection, Interface, InterfaceDirectory, Platform, Resolver, ResolverConfig,
    TaskConfig, Transport,
};

pub const SERVER: &str = "192.0.2.53";

/// One canned answer record.
#[derive(Debug, Clone)]
pub enum Answer {
    Addr(IpAddr),
    Cname(String),
    Ptr(String),
}

#[derive(Debug, Default)]
struct Script {
    answers: HashMap<(String, u16), Vec<Answer>>,
    rcodes: HashMap<String, u16>,
    silent: bool,
    sent: Vec<(u64, Question)>,
    servers: Vec<SocketAddr>,
}

/// Answers every query from a table and records what was sent.
#[derive(Clone)]
pub struct FakeDns {
    script: Arc<Mutex<Script>>,
    clock: Arc<TestClock>,
}

impl FakeDns {
    pub fn new(clock: Arc<TestClock>) -> Self {
        Self {
            script: Arc::default(),
            clock,
        }
    }

    pub fn a(&self, name: &str, ips: &[&str]) {
        self.answer(
            name,
            1,
            ips.iter().map(|ip| Answer::Addr(ip.parse().unwrap())).collect(),
        );
    }

    pub fn answer(&self, name: &str, qtype: u16, answers: Vec<Answer>) {
        self.script
            .lock()
            .unwrap()
            .answers
            .insert((name.to_string(), qtype), answers);
    }

    pub fn rcode(&self, name: &str, rcode: u16) {
        self.script
            .lock()
            .unwrap()
            .rcodes
            .insert(name.to_string(), rcode);
    }

    pub fn go_silent(&self) {
        self.script.lock().unwrap().silent = true;
    }

    pub fn sent(&self) -> Vec<(u64, Question)> {
        self.script.lock().unwrap().sent.clone()
    }

    pub fn servers(&self) -> Vec<SocketAddr> {
        self.script.lock().unwrap().servers.clone()
    }
}

impl Transport for FakeDns {
    fn open(&self, server: SocketAddr) -> io::Result<Box<dyn Connection>> {
        self.script.lock().unwrap().servers.push(server);
        Ok(Box::new(FakeConnection {
            script: Arc::clone(&self.script),
            clock: Arc::clone(&self.clock),
            queue: VecDeque::new(),
        }))
    }
}

struct FakeConnection {
    script: Arc<Mutex<Script>>,
    clock: Arc<TestClock>,
    queue: VecDeque<Vec<u8>>,
}

impl Connection for FakeConnection {
    fn bind_interface(&mut self, _interface: &Interface) -> io::Result<()> {
        Ok(())
    }

    fn send(&mut self, datagram: &[u8]) -> io::Result<usize> {
        let question = codec::parse_query(datagram)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let mut script = self.script.lock().unwrap();
        script.sent.push((self.clock.now_ms(), question.clone()));
        if !script.silent {
            let rcode = script.rcodes.get(&question.name).copied().unwrap_or(0);
            let answers = script
                .answers
                .get(&(question.name, question.qtype))
                .cloned()
                .unwrap_or_default();
            self.queue.push_back(response(datagram, rcode, &answers));
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

/// Builds a response that echoes `query` and carries `answers`, each owned by
/// a compression pointer to the question name.
pub fn response(query: &[u8], rcode: u16, answers: &[Answer]) -> Vec<u8> {
    let mut msg = query.to_vec();
    msg[2..4].copy_from_slice(&(0x8180 | rcode).to_be_bytes());
    msg[6..8].copy_from_slice(&u16::try_from(answers.len()).unwrap().to_be_bytes());
    for answer in answers {
        let (rtype, rdata): (u16, Vec<u8>) = match answer {
            Answer::Addr(IpAddr::V4(ip)) => (1, ip.octets().to_vec()),
            Answer::Addr(IpAddr::V6(ip)) => (28, ip.octets().to_vec()),
            Answer::Cname(name) => (5, labels(name)),
            Answer::Ptr(name) => (12, labels(name)),
        };
        msg.extend_from_slice(&[0xc0, 0x0c]);
        msg.extend_from_slice(&rtype.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&300u32.to_be_bytes());
        msg.extend_from_slice(&u16::try_from(rdata.len()).unwrap().to_be_bytes());
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

/// One interface, link up.
pub struct OneInterface;

impl InterfaceDirectory for OneInterface {
    fn interfaces(&self) -> io::Result<Vec<Interface>> {
        Ok(vec![Interface::new(1, "eth0", true)])
    }
}

/// Simulated time: `sleep` advances the clock and only yields the thread.
#[derive(Debug, Default)]
pub struct TestClock {
    now: AtomicU64,
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.now.fetch_add(ms, Ordering::SeqCst);
        std::thread::yield_now();
    }
}

/// A resolver wired to a [`FakeDns`] with [`SERVER`] as default server.
pub fn resolver(config: ResolverConfig, task: Option<TaskConfig>) -> (Resolver, FakeDns) {
    let clock = Arc::new(TestClock::default());
    let dns = FakeDns::new(Arc::clone(&clock));
    let platform = Platform::new(Arc::new(dns.clone()), Arc::new(OneInterface), clock);
    let resolver = Resolver::with_platform(config.with_server(SERVER), task, platform).unwrap();
    (resolver, dns)
}

/// Same, without a default server.
pub fn resolver_without_server(config: ResolverConfig) -> (Resolver, FakeDns) {
    let clock = Arc::new(TestClock::default());
    let dns = FakeDns::new(Arc::clone(&clock));
    let platform = Platform::new(Arc::new(dns.clone()), Arc::new(OneInterface), clock);
    (Resolver::with_platform(config, None, platform).unwrap(), dns)
}
