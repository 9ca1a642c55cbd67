//! Handshake key helpers, constant-time comparison and deadline tracking.

use std::{
    future::Future,
    time::{Duration, Instant},
};

use base64::prelude::*;
use sha1::{Digest, Sha1};

use crate::{Result, WebSocketError};

/// The GUID appended to the client key before hashing, fixed by RFC 6455.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Generates a fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
pub fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Derives the `Sec-WebSocket-Accept` value for a client key:
/// `base64(SHA-1(key + GUID))`.
pub fn compute_accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Compares two byte strings in time independent of where they differ.
///
/// Inputs of different length compare unequal immediately; the length of a key is not secret.
pub fn compare_digest(a: impl AsRef<[u8]>, b: impl AsRef<[u8]>) -> bool {
    let (a, b) = (a.as_ref(), b.as_ref());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// A point in time after which an operation should give up.
///
/// Built from a monotonic start and an optional timeout; an unbounded deadline never expires.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    timeout: Option<Duration>,
}

impl Deadline {
    /// Starts a deadline now.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            timeout,
        }
    }

    /// Time left before expiry, saturating at zero. `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.timeout
            .map(|timeout| timeout.saturating_sub(self.start.elapsed()))
    }

    pub fn has_expired(&self) -> bool {
        self.remaining().is_some_and(|remaining| remaining.is_zero())
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Drives `future` to completion unless the deadline passes first, in which case
    /// [`WebSocketError::Timeout`] is returned.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output> {
        match self.remaining() {
            None => Ok(future.await),
            Some(remaining) => tokio::time::timeout(remaining, future)
                .await
                .map_err(|_| WebSocketError::Timeout),
        }
    }
}
