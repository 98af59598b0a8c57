//! Bidirectional ("talkback") audio.
//!
//! When the device has an intercom input, the controller sends audio back
//! over the same audio-return socket it uses for RTCP. The
//! [`Demultiplexer`](demux::Demultiplexer) splits that socket's traffic:
//! talkback RTP goes verbatim to a local [`TalkbackRelay`] port, everything
//! else goes to the relay's heartbeat handler.
//!
//! ```text
//!  controller ──SRTP audio + SRTCP──► audio-return socket
//!                                         │
//!                              payload type == audio pt?
//!                                 yes │          │ no
//!                                     ▼          ▼
//!                           relay.port()   relay.heartbeat()
//!                                     │
//!                                     ▼
//!                        device intercom input (decoder)
//! ```

pub mod demux;
pub mod sink;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::device::IntercomInput;
use crate::error::Result;
use crate::session::params::{AddressFamily, AudioParams, SrtpParams};

pub use demux::{Demultiplexer, Route};
pub use sink::{RtpSink, RtpSinkFactory};

/// Parameters for building a talkback relay.
#[derive(Debug, Clone)]
pub struct TalkbackParams {
    pub session_id: String,
    pub family: AddressFamily,
    /// Controller the talkback audio comes from.
    pub controller_address: IpAddr,
    /// The session's audio key material.
    pub srtp: SrtpParams,
    /// Negotiated audio parameters.
    pub audio: AudioParams,
}

/// Receives a session's talkback audio and feeds it to the device.
#[async_trait]
pub trait TalkbackRelay: Send + Sync {
    /// Local port talkback RTP is forwarded to.
    fn port(&self) -> u16;

    /// Media handle for [`Device::start_intercom`](crate::device::Device::start_intercom).
    fn intercom_input(&self) -> IntercomInput;

    /// Handle a non-media datagram received on `socket`.
    async fn heartbeat(&self, socket: &UdpSocket, datagram: &[u8]);

    /// Release the relay. Must be idempotent.
    fn destroy(&self);
}

/// Builds talkback relays.
#[async_trait]
pub trait TalkbackRelayFactory: Send + Sync {
    async fn create(&self, params: TalkbackParams) -> Result<Arc<dyn TalkbackRelay>>;
}
