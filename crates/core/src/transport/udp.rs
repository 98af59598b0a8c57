use std::net::SocketAddr;
use std::ops::Range;

use rand::Rng;
use tokio::net::UdpSocket;

use crate::error::{Result, StreamError};
use crate::session::params::AddressFamily;

/// Default ephemeral range return sockets are drawn from.
pub const DEFAULT_PORT_RANGE: Range<u16> = 10000..40000;

/// Default bind attempts before giving up.
pub const DEFAULT_MAX_BIND_ATTEMPTS: u32 = 32;

/// Binds UDP return sockets on pseudo-random ports.
///
/// Each call is independent: a port is drawn from the range, and a bind
/// that collides with another socket (ours or anyone else's) simply moves
/// on to the next draw. The bind itself is the confirmation that the
/// socket is listening.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: Range<u16>,
    max_attempts: u32,
}

impl PortAllocator {
    pub fn new(range: Range<u16>, max_attempts: u32) -> Self {
        Self {
            range,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Bind a UDP socket of the given family on a random port in range.
    ///
    /// Returns the bound socket and the port the OS actually assigned.
    /// Fails with [`StreamError::PortsExhausted`] once every attempt in the
    /// budget has been refused.
    pub async fn allocate(&self, family: AddressFamily) -> Result<(UdpSocket, u16)> {
        for attempt in 1..=self.max_attempts {
            let port = self.pick();
            let addr = SocketAddr::new(family.unspecified(), port);

            match UdpSocket::bind(addr).await {
                Ok(socket) => {
                    let port = socket.local_addr()?.port();
                    tracing::debug!(port, attempt, ?family, "return socket bound");
                    return Ok((socket, port));
                }
                Err(e) => {
                    tracing::trace!(port, attempt, error = %e, "bind refused, retrying");
                }
            }
        }

        tracing::warn!(attempts = self.max_attempts, range = ?self.range, "port range exhausted");
        Err(StreamError::PortsExhausted {
            attempts: self.max_attempts,
        })
    }

    fn pick(&self) -> u16 {
        if self.range.is_empty() {
            return self.range.start;
        }
        rand::rng().random_range(self.range.clone())
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE, DEFAULT_MAX_BIND_ATTEMPTS)
    }
}
