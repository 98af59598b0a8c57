use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Address family the controller asked the stream to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Wildcard address for binding return sockets.
    pub fn unspecified(self) -> IpAddr {
        match self {
            Self::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// Loopback address, used to reach local relays.
    pub fn loopback(self) -> IpAddr {
        match self {
            Self::Ipv4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Self::Ipv6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }
}

/// SRTP master key and salt for one media flow.
///
/// The controller picks these; the accessory echoes them back in the
/// negotiate response and uses them for both directions of the flow.
#[derive(Clone, PartialEq, Eq)]
pub struct SrtpParams {
    /// Master key (16 bytes for AES_CM_128_HMAC_SHA1_80).
    pub key: Vec<u8>,
    /// Master salt (14 bytes).
    pub salt: Vec<u8>,
}

impl SrtpParams {
    pub fn new(key: impl Into<Vec<u8>>, salt: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            salt: salt.into(),
        }
    }

    /// `key || salt`, the form encoders and SDP `a=crypto` lines expect.
    pub fn key_material(&self) -> Vec<u8> {
        let mut material = Vec::with_capacity(self.key.len() + self.salt.len());
        material.extend_from_slice(&self.key);
        material.extend_from_slice(&self.salt);
        material
    }

    /// Base64 of [`key_material`](Self::key_material).
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.key_material())
    }
}

// Key material never goes to logs.
impl std::fmt::Debug for SrtpParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtpParams")
            .field("key_len", &self.key.len())
            .field("salt_len", &self.salt.len())
            .finish()
    }
}

/// Where the controller wants one media flow delivered.
#[derive(Debug, Clone)]
pub struct MediaEndpoint {
    /// Controller's receive port.
    pub port: u16,
    pub srtp: SrtpParams,
}

/// The signaling connection the negotiate request arrived on.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Local address of the signaling socket, as the platform reports it
    /// (may be an IPv4-mapped IPv6 literal such as `::ffff:10.0.0.2`).
    pub local_address: String,
    /// Name of the local network interface carrying the connection.
    pub interface: String,
}

/// Transport negotiation parameters.
#[derive(Debug, Clone)]
pub struct NegotiateRequest {
    pub session_id: String,
    /// Address of the controller, used for hub classification and as the
    /// media destination.
    pub controller_address: IpAddr,
    pub family: AddressFamily,
    pub video: MediaEndpoint,
    pub audio: MediaEndpoint,
    pub connection: ConnectionInfo,
}

/// One accessory-side flow in the negotiate response.
#[derive(Debug, Clone)]
pub struct StreamEndpoint {
    /// Accessory return port (bound by the port allocator).
    pub port: u16,
    pub ssrc: u32,
    /// Echo of the controller's key material.
    pub srtp: SrtpParams,
}

/// Negotiate response.
#[derive(Debug, Clone)]
pub struct NegotiateResponse {
    pub video: StreamEndpoint,
    pub audio: StreamEndpoint,
    /// Address to advertise as the stream source. `None` lets the protocol
    /// layer fall back to its own default-address heuristic.
    pub address: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Profile {
    Baseline,
    Main,
    High,
}

impl H264Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Main => "main",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Level {
    Level3_1,
    Level3_2,
    Level4_0,
}

impl H264Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Level3_1 => "3.1",
            Self::Level3_2 => "3.2",
            Self::Level4_0 => "4.0",
        }
    }
}

/// Video parameters of a START request.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoParams {
    pub profile: H264Profile,
    pub level: H264Level,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Upper bound requested by the controller, in kilobits per second.
    pub max_bitrate: u32,
    pub payload_type: u8,
    pub mtu: u16,
    /// Seconds between RTCP reports.
    pub rtcp_interval: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Opus,
    AacEld,
}

/// Audio parameters of a START request. The same parameters describe the
/// talkback flow coming back from the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioParams {
    pub codec: AudioCodec,
    pub channels: u8,
    /// Sample rate in kHz (8, 16 or 24).
    pub sample_rate: u32,
    /// Kilobits per second.
    pub max_bitrate: u32,
    pub payload_type: u8,
    /// Milliseconds of audio per packet.
    pub packet_time: u32,
    pub rtcp_interval: f32,
}

/// START payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub video: VideoParams,
    pub audio: AudioParams,
}

/// RECONFIGURE payload: the controller only ever renegotiates video.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconfigureRequest {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Kilobits per second.
    pub max_bitrate: u32,
    pub rtcp_interval: f32,
}

/// A stream request for an already negotiated session.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRequest {
    Start(StartRequest),
    Reconfigure(ReconfigureRequest),
    Stop,
}

impl StreamRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start(_) => "START",
            Self::Reconfigure(_) => "RECONFIGURE",
            Self::Stop => "STOP",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_material_is_key_then_salt() {
        let srtp = SrtpParams::new(vec![1u8; 16], vec![2u8; 14]);
        let material = srtp.key_material();
        assert_eq!(material.len(), 30);
        assert_eq!(&material[..16], &[1u8; 16]);
        assert_eq!(&material[16..], &[2u8; 14]);
    }

    #[test]
    fn base64_encodes_key_material() {
        let srtp = SrtpParams::new(vec![0u8; 3], vec![0u8; 3]);
        assert_eq!(srtp.to_base64(), "AAAAAAAA");
    }

    #[test]
    fn debug_hides_key_material() {
        let srtp = SrtpParams::new(vec![0xAB; 16], vec![0xCD; 14]);
        let out = format!("{srtp:?}");
        assert!(out.contains("key_len: 16"));
        assert!(!out.contains("171"));
    }

    #[test]
    fn families() {
        assert_eq!(AddressFamily::Ipv4.loopback().to_string(), "127.0.0.1");
        assert_eq!(AddressFamily::Ipv6.unspecified().to_string(), "::");
    }
}
