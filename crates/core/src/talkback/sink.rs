use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::device::IntercomInput;
use crate::error::{Result, StreamError};
use crate::session::params::{AddressFamily, AudioCodec};
use crate::transport::PortAllocator;
use crate::transport::ffmpeg::SRTP_SUITE;

use super::{TalkbackParams, TalkbackRelay, TalkbackRelayFactory};

/// Talkback relay that hands the device a decoder-readable SDP.
///
/// The device's decoder binds [`port`](TalkbackRelay::port) (and RTCP on
/// `port + 1`) and decrypts the SRTP itself using the `a=crypto` key in
/// the SDP. The sink never touches the audio.
pub struct RtpSink {
    session_id: String,
    family: AddressFamily,
    rtp_port: u16,
    sdp: String,
    destroyed: AtomicBool,
}

impl RtpSink {
    pub fn new(rtp_port: u16, params: &TalkbackParams) -> Self {
        Self {
            session_id: params.session_id.clone(),
            family: params.family,
            rtp_port,
            sdp: build_sdp(rtp_port, params),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TalkbackRelay for RtpSink {
    fn port(&self) -> u16 {
        self.rtp_port
    }

    fn intercom_input(&self) -> IntercomInput {
        IntercomInput {
            sdp: self.sdp.clone(),
        }
    }

    /// Pass the controller's reports on to the decoder's RTCP port.
    async fn heartbeat(&self, socket: &UdpSocket, datagram: &[u8]) {
        if self.is_destroyed() {
            return;
        }
        let rtcp = SocketAddr::new(self.family.loopback(), self.rtp_port.wrapping_add(1));
        if let Err(e) = socket.send_to(datagram, rtcp).await {
            tracing::debug!(session_id = %self.session_id, error = %e, "heartbeat forward failed");
        }
    }

    fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            tracing::debug!(session_id = %self.session_id, port = self.rtp_port, "talkback sink destroyed");
        }
    }
}

/// Builds [`RtpSink`]s on ports picked by a [`PortAllocator`].
#[derive(Debug, Clone, Default)]
pub struct RtpSinkFactory {
    allocator: PortAllocator,
}

impl RtpSinkFactory {
    pub fn new(allocator: PortAllocator) -> Self {
        Self { allocator }
    }
}

#[async_trait]
impl TalkbackRelayFactory for RtpSinkFactory {
    async fn create(&self, params: TalkbackParams) -> Result<Arc<dyn TalkbackRelay>> {
        // Bind only to find a free port; the decoder binds it for real.
        let (probe, port) = self
            .allocator
            .allocate(params.family)
            .await
            .map_err(|e| StreamError::Talkback(format!("no port for talkback sink: {e}")))?;
        drop(probe);

        tracing::debug!(session_id = %params.session_id, port, "talkback sink created");
        Ok(Arc::new(RtpSink::new(port, &params)))
    }
}

fn build_sdp(port: u16, params: &TalkbackParams) -> String {
    let (addr_type, addr) = match params.family {
        AddressFamily::Ipv4 => ("IP4", params.family.loopback()),
        AddressFamily::Ipv6 => ("IP6", params.family.loopback()),
    };
    let audio = &params.audio;
    let pt = audio.payload_type;

    let mut sdp = String::new();
    let _ = writeln!(sdp, "v=0");
    let _ = writeln!(sdp, "o=- 0 0 IN {addr_type} {addr}");
    let _ = writeln!(sdp, "s=Talkback");
    let _ = writeln!(sdp, "c=IN {addr_type} {addr}");
    let _ = writeln!(sdp, "t=0 0");
    let _ = writeln!(sdp, "m=audio {port} RTP/SAVP {pt}");
    if audio.max_bitrate > 0 {
        let _ = writeln!(sdp, "b=AS:{}", audio.max_bitrate);
    }
    match audio.codec {
        // RFC 7587: always advertised as 48 kHz stereo.
        AudioCodec::Opus => {
            let _ = writeln!(sdp, "a=rtpmap:{pt} opus/48000/2");
        }
        AudioCodec::AacEld => {
            let _ = writeln!(
                sdp,
                "a=rtpmap:{pt} MPEG4-GENERIC/{}/{}",
                audio.sample_rate * 1000,
                audio.channels
            );
            let _ = writeln!(
                sdp,
                "a=fmtp:{pt} profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config={}",
                eld_config(audio.sample_rate, audio.channels)
            );
        }
    }
    let _ = writeln!(sdp, "a=crypto:1 {SRTP_SUITE} inline:{}", params.srtp.to_base64());
    sdp
}

/// AudioSpecificConfig for AAC-ELD (object type 39) as hex.
fn eld_config(sample_rate_khz: u32, channels: u8) -> String {
    let frequency_index: u32 = match sample_rate_khz {
        48 => 3,
        32 => 5,
        24 => 6,
        16 => 8,
        _ => 11,
    };
    // 5 bits escape (31), 6 bits (39 - 32), 4 bits frequency, 4 bits channels,
    // then the fixed ELD-specific config (480-sample frames, no SBR).
    let head: u32 = (31 << 14) | (7 << 8) | (frequency_index << 4) | u32::from(channels & 0x0f);
    let head = (head << 5) | 1;
    format!("{:06X}2C00BC00", head)
}
