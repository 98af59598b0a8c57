//! Error types for the stream session controller.

use std::fmt;

/// Errors that can occur while negotiating, running or tearing down a stream.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Request**: [`UnknownSession`](Self::UnknownSession): a start,
///   reconfigure or stop for an identifier that was never negotiated (or is
///   already torn down).
/// - **Resources**: [`Io`](Self::Io), [`PortsExhausted`](Self::PortsExhausted).
/// - **Talkback**: [`MalformedRtp`](Self::MalformedRtp): an inbound datagram
///   on the audio-return socket that is not RTP.
/// - **Collaborators**: [`Device`](Self::Device),
///   [`Transport`](Self::Transport), [`Talkback`](Self::Talkback).
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No session with the given ID exists in the [`SessionRegistry`](crate::session::SessionRegistry).
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// The port allocator could not bind a UDP socket within its attempt budget.
    #[error("no free UDP port after {attempts} bind attempts")]
    PortsExhausted { attempts: u32 },

    /// A datagram could not be read as an RTP packet (RFC 3550 §5.1).
    #[error("malformed RTP packet: {kind}")]
    MalformedRtp { kind: RtpErrorKind },

    /// A device capability call (stream options, intercom) failed. Returned
    /// by [`Device`](crate::device::Device) implementations; the controller
    /// logs it and carries on.
    #[error("device error: {0}")]
    Device(String),

    /// The media transport could not be started.
    #[error("transport error: {0}")]
    Transport(String),

    /// The talkback relay could not be created. Returned by
    /// [`RtpSinkFactory`](crate::talkback::RtpSinkFactory) and other
    /// [`TalkbackRelayFactory`](crate::talkback::TalkbackRelayFactory)
    /// implementations.
    #[error("talkback relay error: {0}")]
    Talkback(String),
}

/// Specific kind of RTP header parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpErrorKind {
    /// Fewer bytes than the 12-byte fixed header.
    Truncated(usize),
    /// Version field was not 2.
    UnsupportedVersion(u8),
}

impl fmt::Display for RtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated(len) => write!(f, "truncated header ({len} bytes)"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported version {v}"),
        }
    }
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
