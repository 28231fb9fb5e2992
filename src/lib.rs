//! # stub-resolver
//!
//! A DNS stub resolver for constrained systems: A, AAAA, CNAME and PTR
//! lookups over UDP, answered from a bounded host cache whose storage is
//! sized once at initialization.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use stub_resolver::{HostAddr, LookupFlags, Resolver, ResolverConfig};
//!
//! let resolver = Resolver::init(ResolverConfig::new().with_server("192.0.2.53"), None)?;
//!
//! let mut addrs = [HostAddr::default(); 4];
//! let lookup = resolver.resolve("example.com", &mut addrs, LookupFlags::NONE, None)?;
//! println!("{:?}", lookup.addrs(&addrs));
//!
//! // Reverse lookup.
//! let lookup = resolver.resolve("192.0.2.10", &mut addrs, LookupFlags::REVERSE_LOOKUP, None)?;
//! println!("{:?}", lookup.name);
//! ```
//!
//! ## Drivers
//!
//! Without a [`TaskConfig`] every lookup is polled to completion on the
//! calling thread. With one, a background thread drives all pending lookups
//! and callers may pass [`LookupFlags::NO_BLOCK`] to get
//! [`Status::Pending`] back immediately, then call
//! [`Resolver::resolve`] again later to collect the answer from the cache.
//!
//! ```rust,ignore
//! use stub_resolver::{LookupFlags, Resolver, ResolverConfig, Status, TaskConfig};
//!
//! let resolver = Resolver::init(ResolverConfig::new(), Some(TaskConfig::default()))?;
//! resolver.set_default_server_str("192.0.2.53")?;
//!
//! let lookup = resolver.resolve("example.com", &mut addrs, LookupFlags::NO_BLOCK, None)?;
//! if lookup.status == Status::Pending {
//!     // come back later
//! }
//! ```
//!
//! ## Cache
//!
//! Resolved and failed hosts are kept until evicted, oldest first, when a new
//! name needs room. Hosts still being resolved are never evicted. A host
//! resolved forward answers later reverse lookups for its addresses; a host
//! resolved in reverse never answers a forward lookup for its PTR name.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod addr;
mod cache;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod flags;
mod pool;
mod resolver;
mod task;
pub mod transport;

pub use addr::HostAddr;
pub use cache::{CacheStats, Status};
pub use clock::{Clock, SystemClock};
pub use config::{RequestConfig, ResolverConfig, TaskConfig};
pub use error::{ResolverError, Result};
pub use flags::LookupFlags;
pub use resolver::{Lookup, Platform, Resolver};
pub use transport::{Connection, Interface, InterfaceDirectory, Transport};
