//! Error types.

use thiserror::Error;

/// Result alias for resolver operations.
pub type Result<T> = std::result::Result<T, ResolverError>;

/// Errors returned by resolver operations.
///
/// Callers branch on [`Status`](crate::Status) first; these variants carry the
/// diagnostic detail. A pending lookup is never reported as an error.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// A caller-supplied argument is empty, out of range or internal-only.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// Conflicting flags or configuration values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed address text, or an address family that is not supported.
    #[error("invalid or unsupported address")]
    AddrInvalid,

    /// A fixed-capacity pool is exhausted and nothing could be evicted.
    #[error("{pool} pool exhausted")]
    MemAlloc {
        /// Name of the exhausted pool.
        pool: &'static str,
    },

    /// A shared primitive could not be created during initialization.
    #[error("initialization fault: {0}")]
    FaultInit(String),

    /// The cache lock was busy.
    #[error("cache lock unavailable")]
    CacheLock,

    /// No explicit server was given and no default server is configured.
    #[error("no DNS server configured")]
    InvalidServer,

    /// The UDP association could not be opened, bound or connected.
    #[error("failed to open DNS socket")]
    SockOpenFail,

    /// No network interface has its link up.
    #[error("no interface link up")]
    IfLinkDown,

    /// Every interface has been tried without a usable answer.
    #[error("no response on any interface")]
    NoResponse,

    /// Transient transmit error persisted past the retry budget.
    #[error("transmit failed")]
    Tx,

    /// Unrecoverable transmit error; the socket must be closed.
    #[error("transmit fault")]
    TxFault,

    /// The receive queue is empty.
    #[error("nothing received")]
    Rx,

    /// Unrecoverable receive error.
    #[error("receive fault")]
    RxFault,

    /// A label does not fit in the query message.
    #[error("invalid host name")]
    InvalidHostName,

    /// The datagram is a query, not a response.
    #[error("message is not a response")]
    NotAResponse,

    /// The response id does not match the outstanding query.
    #[error("response id {got} does not match query id {expected}")]
    BadResponseId {
        /// Id of the outstanding query.
        expected: u16,
        /// Id carried by the response.
        got: u16,
    },

    /// The response does not echo exactly one question.
    #[error("bad question count {0}")]
    BadQuestionCount(u16),

    /// Unknown response code or answer record type.
    #[error("bad response type {0}")]
    BadResponseType(u16),

    /// The message ends before a field it announces.
    #[error("truncated DNS message")]
    Truncated,

    /// The server reported a format error (rcode 1).
    #[error("server reported format error")]
    FormatError,

    /// The server reported a failure (rcode 2).
    #[error("server failure")]
    ServerFailure,

    /// The name does not exist (rcode 3).
    #[error("name does not exist")]
    NameNotExist,

    /// The retry budget ran out without a response.
    #[error("no response from server")]
    NoServer,

    /// No cache entry matches.
    #[error("host not found in cache")]
    CacheHostNotFound,

    /// The matching cache entry is still being resolved.
    #[error("host resolution pending")]
    CacheHostPending,

    /// Waiting for the background driver failed.
    #[error("task signal failed")]
    TaskSignal,

    /// Internal state is inconsistent.
    #[error("internal fault: {0}")]
    Fault(&'static str),

    /// I/O error raised while setting up a system collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResolverError {
    /// Returns `true` for errors the state machine absorbs by staying pending.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Rx | Self::IfLinkDown)
    }

    /// Returns `true` if the error was reported by the server in the rcode field.
    #[must_use]
    pub const fn is_server_reported(&self) -> bool {
        matches!(
            self,
            Self::FormatError | Self::ServerFailure | Self::NameNotExist
        )
    }
}
