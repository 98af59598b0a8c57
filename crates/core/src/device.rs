//! Collaborators the controller talks to but does not implement: the
//! camera device itself and the platform's session/identity layer.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::Result;

/// What a device supports, fixed for the lifetime of the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// The device has an intercom input (bidirectional audio).
    pub intercom: bool,
    /// The device accepts per-stream configuration (bitrate) at runtime.
    pub video_configuration: bool,
}

/// Video settings of one device stream profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoStreamConfig {
    pub codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    /// Bits per second.
    pub bitrate: Option<u32>,
}

/// A stream profile advertised by the device (e.g. "main", "sub").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOptions {
    /// Device-specific stream identifier. `None` addresses the default stream.
    pub id: Option<String>,
    pub name: Option<String>,
    pub video: VideoStreamConfig,
}

/// Location of a device stream an encoder can read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    pub url: String,
    /// Arguments that must precede `-i <url>` (e.g. `-rtsp_transport tcp`).
    pub input_args: Vec<String>,
}

/// Media handle handed to [`Device::start_intercom`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntercomInput {
    /// SDP describing the inbound talkback RTP stream.
    pub sdp: String,
}

/// The camera device a controller streams from.
#[async_trait]
pub trait Device: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities;

    /// Stream profiles the device offers.
    async fn video_stream_options(&self) -> Result<Vec<StreamOptions>>;

    /// Push a new configuration for the profile identified by `options.id`.
    async fn set_video_stream_options(&self, options: StreamOptions) -> Result<()>;

    /// Source for the given profile, or the default stream when `None`.
    async fn video_stream_source(&self, options: Option<&StreamOptions>) -> Result<MediaSource>;

    async fn start_intercom(&self, input: IntercomInput) -> Result<()>;

    async fn stop_intercom(&self) -> Result<()>;
}

/// The platform's view of controllers and operator overrides.
pub trait PlatformSession: Send + Sync {
    /// Whether `controller` is a hub (a home relay) rather than an end-user
    /// client.
    fn is_hub(&self, controller: IpAddr) -> bool;

    /// Operator-configured address to advertise for every stream.
    fn address_override(&self) -> Option<IpAddr>;
}
