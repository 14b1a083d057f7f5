//! Concrete transport paths.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Non-blocking datagram egress. The I/O layer implements this; the core
/// never owns a socket.
pub trait DatagramSink: Send + Sync {
    /// Send `data` from the named local socket. Returns false if the write
    /// was refused; senders treat that as packet loss.
    fn send(&self, local_socket: i64, to: SocketAddr, data: &[u8]) -> bool;
}

/// A `(local socket, remote address)` tuple through which a peer is
/// reachable, with receive/send activity stamps.
pub struct Path {
    local_socket: i64,
    address: SocketAddr,
    last_received: AtomicI64,
    last_sent: AtomicI64,
    sink: Arc<dyn DatagramSink>,
}

impl Path {
    pub fn new(local_socket: i64, address: SocketAddr, sink: Arc<dyn DatagramSink>) -> Self {
        Path {
            local_socket,
            address,
            last_received: AtomicI64::new(0),
            last_sent: AtomicI64::new(0),
            sink,
        }
    }

    pub fn local_socket(&self) -> i64 {
        self.local_socket
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn received(&self, now: i64) {
        self.last_received.store(now, Ordering::Relaxed);
    }

    pub fn last_received(&self) -> i64 {
        self.last_received.load(Ordering::Relaxed)
    }

    pub fn last_sent(&self) -> i64 {
        self.last_sent.load(Ordering::Relaxed)
    }

    /// Fire-and-forget datagram write.
    pub fn send(&self, data: &[u8], now: i64) -> bool {
        let ok = self.sink.send(self.local_socket, self.address, data);
        if ok {
            self.last_sent.store(now, Ordering::Relaxed);
        }
        ok
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Path")
            .field("local_socket", &self.local_socket)
            .field("address", &self.address)
            .finish()
    }
}
