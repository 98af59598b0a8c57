//! Session lifecycle: negotiate, START, RECONFIGURE, STOP and the kill path.
//!
//! The controller is the only component that creates or destroys sessions.
//! Everything else (transport starters, watchdogs, the talkback relay) asks
//! for a teardown through a [`KillSwitch`], which lands on the controller's
//! kill channel and runs the same teardown a STOP does.

use std::ops::Range;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::device::{Device, PlatformSession, StreamOptions};
use crate::error::{Result, StreamError};
use crate::media::generate_ssrc;
use crate::session::params::{
    NegotiateRequest, NegotiateResponse, ReconfigureRequest, StartRequest, StreamEndpoint,
    StreamRequest,
};
use crate::session::watchdog::{DEFAULT_IDLE_TIMEOUT, spawn_idle_watchdog};
use crate::session::{ReturnSockets, Session, SessionRegistry, SessionState};
use crate::talkback::{Demultiplexer, RtpSinkFactory, TalkbackParams, TalkbackRelayFactory};
use crate::transport::ffmpeg::FfmpegTransport;
use crate::transport::udp::{DEFAULT_MAX_BIND_ATTEMPTS, DEFAULT_PORT_RANGE};
use crate::transport::{
    AddressSelector, InterfaceLookup, KillRequest, KillSwitch, MediaTransport, OutboundFlow,
    PortAllocator, SystemInterfaces, TransportContext,
};

/// Controller-level configuration.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Ports return sockets are drawn from.
    pub port_range: Range<u16>,
    /// Bind attempts per socket before negotiation fails.
    pub max_bind_attempts: u32,
    /// Push the controller's requested bitrate to the device for hub
    /// sessions.
    pub dynamic_bitrate: bool,
    /// Preferred stream profile name for end-user controllers.
    pub streaming_channel: Option<String>,
    /// Preferred stream profile name for hubs.
    pub streaming_channel_hub: Option<String>,
    /// Kill a streaming session after this long without RTCP on its video
    /// return socket. `None` disables the watchdog.
    pub idle_timeout: Option<Duration>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            port_range: DEFAULT_PORT_RANGE,
            max_bind_attempts: DEFAULT_MAX_BIND_ATTEMPTS,
            dynamic_bitrate: false,
            streaming_channel: None,
            streaming_channel_hub: None,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

impl StreamingConfig {
    pub fn port_range(mut self, range: Range<u16>) -> Self {
        self.port_range = range;
        self
    }

    pub fn max_bind_attempts(mut self, attempts: u32) -> Self {
        self.max_bind_attempts = attempts;
        self
    }

    pub fn dynamic_bitrate(mut self, enabled: bool) -> Self {
        self.dynamic_bitrate = enabled;
        self
    }

    pub fn streaming_channel(mut self, name: impl Into<String>) -> Self {
        self.streaming_channel = Some(name.into());
        self
    }

    pub fn streaming_channel_hub(mut self, name: impl Into<String>) -> Self {
        self.streaming_channel_hub = Some(name.into());
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Port allocator drawing from the configured range.
    pub fn port_allocator(&self) -> PortAllocator {
        PortAllocator::new(self.port_range.clone(), self.max_bind_attempts)
    }
}

/// Drives the stream sessions of one camera device.
///
/// Requests for different sessions run concurrently. Requests for the same
/// session are expected in protocol order; when they race, teardown wins:
/// anything a START creates after a STOP is released on the spot.
pub struct StreamController {
    device: Arc<dyn Device>,
    platform: Arc<dyn PlatformSession>,
    transport: Arc<dyn MediaTransport>,
    talkback: Arc<dyn TalkbackRelayFactory>,
    selector: AddressSelector,
    allocator: PortAllocator,
    registry: SessionRegistry,
    config: Arc<StreamingConfig>,
    kill_tx: mpsc::UnboundedSender<KillRequest>,
}

impl StreamController {
    /// Create a controller with the ffmpeg transport, the RTP sink talkback
    /// relay and the host's network interfaces.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        device: Arc<dyn Device>,
        platform: Arc<dyn PlatformSession>,
        config: StreamingConfig,
    ) -> Arc<Self> {
        let talkback = RtpSinkFactory::new(config.port_allocator());
        Self::with_parts(
            device,
            platform,
            Arc::new(FfmpegTransport::default()),
            Arc::new(talkback),
            Arc::new(SystemInterfaces),
            config,
        )
    }

    /// Create a controller with custom collaborators.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_parts(
        device: Arc<dyn Device>,
        platform: Arc<dyn PlatformSession>,
        transport: Arc<dyn MediaTransport>,
        talkback: Arc<dyn TalkbackRelayFactory>,
        interfaces: Arc<dyn InterfaceLookup>,
        config: StreamingConfig,
    ) -> Arc<Self> {
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let controller = Arc::new(Self {
            device,
            platform,
            transport,
            talkback,
            selector: AddressSelector::new(interfaces),
            allocator: config.port_allocator(),
            registry: SessionRegistry::new(),
            config: Arc::new(config),
            kill_tx,
        });

        tokio::spawn(kill_listener(Arc::downgrade(&controller), kill_rx));
        controller
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Prepare a session: bind both return sockets, pick SSRCs and decide
    /// the address to advertise.
    ///
    /// A live session already registered under the same id is torn down
    /// first.
    pub async fn negotiate(&self, request: NegotiateRequest) -> Result<NegotiateResponse> {
        let session_id = request.session_id.clone();
        let family = request.family;

        let video_ssrc = generate_ssrc();
        let audio_ssrc = generate_ssrc();
        let (video, video_port) = self.allocator.allocate(family).await?;
        let (audio, audio_port) = self.allocator.allocate(family).await?;

        let is_hub = self.platform.is_hub(request.controller_address);
        let address = self.selector.select(
            family,
            &request.connection.local_address,
            &request.connection.interface,
            self.platform.address_override(),
        );

        let response = NegotiateResponse {
            video: StreamEndpoint {
                port: video_port,
                ssrc: video_ssrc,
                srtp: request.video.srtp.clone(),
            },
            audio: StreamEndpoint {
                port: audio_port,
                ssrc: audio_ssrc,
                srtp: request.audio.srtp.clone(),
            },
            address,
        };

        let sockets = ReturnSockets {
            video,
            video_port,
            audio,
            audio_port,
        };
        let session = Arc::new(Session::new(request, is_hub, sockets, video_ssrc, audio_ssrc));
        if let Some(previous) = self.registry.insert(session) {
            tracing::warn!(%session_id, serial = previous.serial, "session renegotiated, tearing down previous instance");
            self.teardown(previous, "renegotiated").await;
        }

        tracing::info!(
            %session_id,
            is_hub,
            video_port,
            audio_port,
            address = ?address,
            "session negotiated"
        );
        Ok(response)
    }

    /// Dispatch a stream request for a negotiated session.
    ///
    /// Returns as soon as the request is accepted; START and RECONFIGURE
    /// continue on a background task. STOP runs to completion before
    /// returning.
    pub async fn handle_request(self: &Arc<Self>, session_id: &str, request: StreamRequest) -> Result<()> {
        tracing::debug!(session_id, request = request.kind(), "stream request");
        match request {
            StreamRequest::Stop => self.stop(session_id).await,
            StreamRequest::Start(start) => {
                let session = self.lookup(session_id)?;
                let controller = Arc::clone(self);
                tokio::spawn(async move { controller.run_start(session, start).await });
                Ok(())
            }
            StreamRequest::Reconfigure(reconfigure) => {
                let session = self.lookup(session_id)?;
                let controller = Arc::clone(self);
                tokio::spawn(async move { controller.run_reconfigure(session, reconfigure).await });
                Ok(())
            }
        }
    }

    /// Run a START to completion.
    pub async fn start(&self, session_id: &str, request: StartRequest) -> Result<()> {
        let session = self.lookup(session_id)?;
        self.run_start(session, request).await;
        Ok(())
    }

    /// Run a RECONFIGURE to completion.
    pub async fn reconfigure(&self, session_id: &str, request: ReconfigureRequest) -> Result<()> {
        let session = self.lookup(session_id)?;
        self.run_reconfigure(session, request).await;
        Ok(())
    }

    /// Tear a session down. Fails with [`StreamError::UnknownSession`] when
    /// no such session is registered, which includes a second STOP.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        if self.kill_session(session_id).await {
            Ok(())
        } else {
            tracing::warn!(session_id, "stop for unknown session");
            Err(StreamError::UnknownSession(session_id.to_string()))
        }
    }

    /// Tear a session down if it exists. Returns whether one was found.
    pub async fn kill_session(&self, session_id: &str) -> bool {
        match self.registry.take(session_id, None) {
            Some(session) => {
                self.teardown(session, "stopped").await;
                true
            }
            None => false,
        }
    }

    /// Tear down every registered session.
    pub async fn shutdown(&self) {
        for id in self.registry.ids() {
            self.kill_session(&id).await;
        }
    }

    fn lookup(&self, session_id: &str) -> Result<Arc<Session>> {
        self.registry.get(session_id).ok_or_else(|| {
            tracing::warn!(session_id, "request for unknown session");
            StreamError::UnknownSession(session_id.to_string())
        })
    }

    async fn handle_kill(&self, request: KillRequest) {
        match self.registry.take(&request.session_id, Some(request.serial)) {
            Some(session) => self.teardown(session, &request.reason).await,
            None => tracing::debug!(
                session_id = %request.session_id,
                serial = request.serial,
                "kill for a session that is already gone"
            ),
        }
    }

    /// Release a session already removed from the registry.
    async fn teardown(&self, session: Arc<Session>, reason: &str) {
        tracing::info!(session_id = %session.id, serial = session.serial, reason, "session torn down");
        if session.release() {
            if let Err(e) = self.device.stop_intercom().await {
                tracing::warn!(session_id = %session.id, error = %e, "failed to stop intercom");
            }
        }
    }

    async fn run_start(&self, session: Arc<Session>, start: StartRequest) {
        let session_id = session.id.clone();
        session.set_start_request(start.clone());

        let selected = self.select_stream(&session).await;
        self.reconfigure_bitrate(&session, selected.as_ref(), start.video.max_bitrate)
            .await;

        if session.is_killed() {
            tracing::debug!(%session_id, "session killed before transport start");
            return;
        }

        tracing::info!(
            %session_id,
            is_hub = session.is_hub,
            stream = selected.as_ref().and_then(|s| s.name.as_deref()).unwrap_or("default"),
            width = start.video.width,
            height = start.video.height,
            fps = start.video.fps,
            max_bitrate = start.video.max_bitrate,
            packet_time = start.audio.packet_time,
            "starting stream"
        );

        let kill = KillSwitch::new(&session_id, session.serial, self.kill_tx.clone());
        let ctx = TransportContext {
            session_id: session_id.clone(),
            device: Arc::clone(&self.device),
            selected,
            family: session.negotiate.family,
            controller_address: session.controller_address(),
            video: OutboundFlow {
                controller_port: session.negotiate.video.port,
                return_port: session.video_port,
                ssrc: session.video_ssrc,
                srtp: session.negotiate.video.srtp.clone(),
            },
            audio: OutboundFlow {
                controller_port: session.negotiate.audio.port,
                return_port: session.audio_port,
                ssrc: session.audio_ssrc,
                srtp: session.negotiate.audio.srtp.clone(),
            },
            start: start.clone(),
            kill: kill.clone(),
        };

        match self.transport.start(ctx).await {
            Ok(handle) => {
                if let Err(mut handle) = session.attach_transport(handle) {
                    tracing::debug!(%session_id, "session killed during transport start, releasing");
                    handle.release();
                    return;
                }
                if let (Some(timeout), Some(socket)) = (self.config.idle_timeout, session.video_return()) {
                    session.attach_watchdog(spawn_idle_watchdog(socket, timeout, kill));
                }
            }
            Err(e) => tracing::error!(%session_id, error = %e, "streaming error"),
        }

        if session.is_killed() {
            return;
        }
        session.set_state(SessionState::Streaming);

        if self.device.capabilities().intercom {
            self.start_talkback(&session, &start).await;
        }
    }

    async fn start_talkback(&self, session: &Arc<Session>, start: &StartRequest) {
        let session_id = session.id.clone();
        let params = TalkbackParams {
            session_id: session_id.clone(),
            family: session.negotiate.family,
            controller_address: session.controller_address(),
            srtp: session.negotiate.audio.srtp.clone(),
            audio: start.audio.clone(),
        };

        let relay = match self.talkback.create(params).await {
            Ok(relay) => relay,
            Err(e) => {
                tracing::error!(%session_id, error = %e, "failed to create talkback relay");
                return;
            }
        };
        let Some(socket) = session.audio_return() else {
            relay.destroy();
            return;
        };

        let demux = Demultiplexer::new(
            socket,
            session.negotiate.family,
            start.audio.payload_type,
            Arc::clone(&relay),
        )
        .spawn(session_id.clone());
        let replaced = match session.attach_talkback(Arc::clone(&relay), demux) {
            Ok(replaced) => replaced,
            Err(relay) => {
                relay.destroy();
                return;
            }
        };

        // The device only takes one intercom input at a time.
        if replaced {
            tracing::debug!(%session_id, "replacing talkback from an earlier start");
            if let Err(e) = self.device.stop_intercom().await {
                tracing::warn!(%session_id, error = %e, "failed to stop intercom");
            }
        }

        if let Err(e) = self.device.start_intercom(relay.intercom_input()).await {
            tracing::warn!(%session_id, error = %e, "failed to start intercom");
            return;
        }
        tracing::info!(%session_id, port = relay.port(), "talkback started");

        // A teardown that ran while the intercom was starting stopped it too
        // early.
        if session.is_killed() {
            if let Err(e) = self.device.stop_intercom().await {
                tracing::warn!(%session_id, error = %e, "failed to stop intercom");
            }
        }
    }

    async fn run_reconfigure(&self, session: Arc<Session>, request: ReconfigureRequest) {
        tracing::info!(
            session_id = %session.id,
            width = request.width,
            height = request.height,
            fps = request.fps,
            max_bitrate = request.max_bitrate,
            "reconfiguring stream"
        );
        let selected = self.select_stream(&session).await;
        self.reconfigure_bitrate(&session, selected.as_ref(), request.max_bitrate)
            .await;
    }

    /// Look up the configured stream profile for the session's controller
    /// class. `None` means the device default.
    async fn select_stream(&self, session: &Session) -> Option<StreamOptions> {
        let preference = if session.is_hub {
            self.config.streaming_channel_hub.as_deref()
        } else {
            self.config.streaming_channel.as_deref()
        }?;

        match self.device.video_stream_options().await {
            Ok(options) => {
                let found = options
                    .into_iter()
                    .find(|o| o.name.as_deref() == Some(preference));
                if found.is_none() {
                    tracing::debug!(session_id = %session.id, preference, "preferred stream not offered, using default");
                }
                found
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "failed to list stream options");
                None
            }
        }
    }

    /// Push the controller's bitrate to the device.
    ///
    /// Only for hub sessions on a device with runtime video configuration
    /// and with dynamic bitrate enabled. Returns whether the device accepted
    /// the new configuration.
    async fn reconfigure_bitrate(
        &self,
        session: &Session,
        selected: Option<&StreamOptions>,
        max_bitrate_kbps: u32,
    ) -> bool {
        if !session.is_hub
            || !self.device.capabilities().video_configuration
            || !self.config.dynamic_bitrate
            || session.is_killed()
        {
            return false;
        }

        let mut options = selected.cloned().unwrap_or_default();
        let bitrate = max_bitrate_kbps.saturating_mul(1000);
        options.video.bitrate = Some(bitrate);

        match self.device.set_video_stream_options(options).await {
            Ok(()) => {
                tracing::debug!(session_id = %session.id, bitrate, "stream bitrate updated");
                true
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id, bitrate, error = %e, "failed to update stream bitrate");
                false
            }
        }
    }
}

async fn kill_listener(controller: Weak<StreamController>, mut rx: mpsc::UnboundedReceiver<KillRequest>) {
    while let Some(request) = rx.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.handle_kill(request).await;
    }
}
