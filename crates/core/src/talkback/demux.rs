use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::media::RtpHeader;
use crate::session::params::AddressFamily;

use super::TalkbackRelay;

/// Largest possible UDP payload, so no datagram is ever truncated.
const RECV_BUFFER_LEN: usize = 65_535;

/// Where a datagram from the audio-return socket goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Talkback audio, forwarded verbatim to the relay port.
    Media,
    /// Control or keepalive traffic, handed to the relay's heartbeat handler.
    Control,
}

/// Classify a datagram by its RTP payload type.
pub fn classify(datagram: &[u8], audio_payload_type: u8) -> Result<Route> {
    let header = RtpHeader::parse(datagram)?;
    if header.payload_type == audio_payload_type {
        Ok(Route::Media)
    } else {
        Ok(Route::Control)
    }
}

/// Routes traffic arriving on a session's audio-return socket.
///
/// Datagrams are never modified: routing is decided from the header alone.
pub struct Demultiplexer {
    socket: Arc<UdpSocket>,
    audio_payload_type: u8,
    relay: Arc<dyn TalkbackRelay>,
    relay_addr: SocketAddr,
}

impl Demultiplexer {
    pub fn new(
        socket: Arc<UdpSocket>,
        family: AddressFamily,
        audio_payload_type: u8,
        relay: Arc<dyn TalkbackRelay>,
    ) -> Self {
        let relay_addr = SocketAddr::new(family.loopback(), relay.port());
        Self {
            socket,
            audio_payload_type,
            relay,
            relay_addr,
        }
    }

    /// Route a single datagram.
    pub async fn route(&self, datagram: &[u8]) -> Result<Route> {
        let route = classify(datagram, self.audio_payload_type)?;
        match route {
            Route::Media => {
                self.socket.send_to(datagram, self.relay_addr).await?;
            }
            Route::Control => {
                self.relay.heartbeat(&self.socket, datagram).await;
            }
        }
        tracing::trace!(?route, len = datagram.len(), "talkback datagram routed");
        Ok(route)
    }

    /// Receive and route until the socket fails. Malformed datagrams are
    /// logged and dropped.
    pub async fn run(self, session_id: String) {
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            let len = match self.socket.recv_from(&mut buf).await {
                Ok((len, _from)) => len,
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                    tracing::trace!(%session_id, error = %e, "transient receive error");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(%session_id, error = %e, "audio return socket failed, demux stopped");
                    return;
                }
            };

            if let Err(e) = self.route(&buf[..len]).await {
                tracing::warn!(%session_id, error = %e, len, "talkback datagram dropped");
            }
        }
    }

    /// Run on a background task. The caller owns the handle and aborts it at
    /// teardown.
    pub fn spawn(self, session_id: String) -> JoinHandle<()> {
        tokio::spawn(self.run(session_id))
    }
}
