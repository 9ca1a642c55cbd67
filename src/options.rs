use std::time::Duration;

/// Default maximum size of an incoming message: 1 MiB.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default time allowed for the opening handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait for the peer's close frame after sending ours.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default size of the transport read buffer: 64 KiB.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default cap on concurrently open server connections.
pub const MAX_CONNECTIONS: usize = 1000;

/// Default time the server waits for connection tasks during shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration options for a WebSocket connection.
///
/// `Options` governs size limits, timeouts and the optional send rate limit of a connection.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use haru_ws::{Options, RateLimit};
///
/// let options = Options::default()
///     .with_max_message_size(64 * 1024)
///     .with_handshake_timeout(Duration::from_secs(10))
///     .with_rate_limit(RateLimit::new(100, Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum size of an incoming frame and of a reassembled message, in bytes. Outgoing
    /// messages above it are refused as well.
    ///
    /// Default: 1 MiB as defined in [`MAX_MESSAGE_SIZE`]. `None` removes the limit.
    pub max_message_size: Option<usize>,

    /// Bound on the whole opening handshake. `None` waits forever.
    ///
    /// Default: 30 seconds.
    pub handshake_timeout: Option<Duration>,

    /// How long `close` waits for the peer to answer before tearing the transport down.
    ///
    /// Default: 5 seconds.
    pub close_timeout: Duration,

    /// Size of the buffer each transport read fills.
    ///
    /// Default: 64 KiB.
    pub read_buffer_size: usize,

    /// Optional budget for outgoing messages.
    pub rate_limit: Option<RateLimit>,

    /// Sets `TCP_NODELAY` on accepted and dialed sockets.
    ///
    /// Default: `true`.
    pub no_delay: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_message_size: Some(MAX_MESSAGE_SIZE),
            handshake_timeout: Some(HANDSHAKE_TIMEOUT),
            close_timeout: CLOSE_TIMEOUT,
            read_buffer_size: READ_BUFFER_SIZE,
            rate_limit: None,
            no_delay: true,
        }
    }
}

impl Options {
    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: Some(size),
            ..self
        }
    }

    /// Accepts messages of any size. Only sensible with trusted peers.
    pub fn without_max_message_size(self) -> Self {
        Self {
            max_message_size: None,
            ..self
        }
    }

    pub fn with_handshake_timeout(self, timeout: Duration) -> Self {
        Self {
            handshake_timeout: Some(timeout),
            ..self
        }
    }

    pub fn without_handshake_timeout(self) -> Self {
        Self {
            handshake_timeout: None,
            ..self
        }
    }

    pub fn with_close_timeout(self, timeout: Duration) -> Self {
        Self {
            close_timeout: timeout,
            ..self
        }
    }

    /// Sets the read buffer size. Values below 1 KiB are raised to 1 KiB.
    pub fn with_read_buffer_size(self, size: usize) -> Self {
        Self {
            read_buffer_size: size.max(1024),
            ..self
        }
    }

    pub fn with_rate_limit(self, rate_limit: RateLimit) -> Self {
        Self {
            rate_limit: Some(rate_limit),
            ..self
        }
    }

    pub fn with_no_delay(self, no_delay: bool) -> Self {
        Self { no_delay, ..self }
    }
}

/// Fixed-window budget for outgoing messages: at most `messages` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub messages: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(messages: u32, window: Duration) -> Self {
        Self { messages, window }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(10))
    }
}

/// Server-wide configuration: the options every accepted connection gets, the connection cap
/// and the shutdown grace period.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub options: Options,
    pub max_connections: usize,
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            options: Options::default(),
            max_connections: MAX_CONNECTIONS,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn with_options(self, options: Options) -> Self {
        Self { options, ..self }
    }

    pub fn with_max_connections(self, max_connections: usize) -> Self {
        Self {
            max_connections,
            ..self
        }
    }

    pub fn with_shutdown_timeout(self, shutdown_timeout: Duration) -> Self {
        Self {
            shutdown_timeout,
            ..self
        }
    }
}
