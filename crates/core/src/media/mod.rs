//! RTP header handling.
//!
//! The controller never packetizes or decodes media itself: encoding is the
//! transport collaborator's job. What it does need from RTP (RFC 3550) is:
//!
//! - **SSRC generation** for the video and audio flows announced at
//!   negotiation time.
//! - **Header inspection** on the audio-return socket, to tell talkback
//!   media apart from control/heartbeat traffic.

pub mod rtp;

pub use rtp::{RtpHeader, generate_ssrc};
