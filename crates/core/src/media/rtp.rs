use rand::Rng;

use crate::error::{Result, RtpErrorKind, StreamError};

/// Length of the RTP fixed header in bytes.
pub const FIXED_HEADER_LEN: usize = 12;

/// RTP fixed header view (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Only the fixed part is read. CSRC lists, extensions and the payload are
/// never touched: the talkback demultiplexer routes the original datagram
/// as-is and only needs the payload type.
///
/// RTCP packets share the first two bits, so an RTCP sender report parses
/// too. Its packet type (200..=204) lands in the marker + PT byte and reads
/// back as a payload type of 72..=76, which never collides with the dynamic
/// range used for audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub payload_type: u8,
    /// Marker bit.
    pub marker: bool,
    /// Sequence number.
    pub sequence: u16,
    /// Media timestamp.
    pub timestamp: u32,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parse the fixed header of an RTP datagram without copying it.
    pub fn parse(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < FIXED_HEADER_LEN {
            return Err(StreamError::MalformedRtp {
                kind: RtpErrorKind::Truncated(datagram.len()),
            });
        }

        let version = datagram[0] >> 6;
        if version != 2 {
            return Err(StreamError::MalformedRtp {
                kind: RtpErrorKind::UnsupportedVersion(version),
            });
        }

        Ok(Self {
            payload_type: datagram[1] & 0x7f,
            marker: datagram[1] & 0x80 != 0,
            sequence: u16::from_be_bytes([datagram[2], datagram[3]]),
            timestamp: u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]),
            ssrc: u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]),
        })
    }
}

/// Generate a synchronization source identifier.
///
/// Per RFC 3550 §8.1, the SSRC should be chosen randomly to minimize
/// the probability of collisions between independent sessions. Zero is
/// skipped because some controllers treat it as "unset".
pub fn generate_ssrc() -> u32 {
    let mut rng = rand::rng();
    loop {
        let ssrc = rng.random::<u32>();
        if ssrc != 0 {
            return ssrc;
        }
    }
}
