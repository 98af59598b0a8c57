//! Network plumbing and the media transport seam.
//!
//! - **UDP** ([`udp`]): binds the accessory-side return sockets.
//! - **Address** ([`address`]): chooses the address advertised to the
//!   controller.
//! - **Transport starters** ([`MediaTransport`]): produce the outbound media
//!   flow over the negotiated ports. [`ffmpeg::FfmpegTransport`] is the
//!   default implementation.
//!
//! A starter never tears a session down itself. When its media flow dies
//! it pulls the session's [`KillSwitch`], and the controller runs the same
//! teardown a STOP would.

pub mod address;
pub mod ffmpeg;
pub mod udp;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};

use crate::device::{Device, StreamOptions};
use crate::error::Result;
use crate::session::params::{AddressFamily, SrtpParams, StartRequest};

pub use address::{AddressSelector, InterfaceLookup, SystemInterfaces};
pub use udp::PortAllocator;

/// A request to tear down one session, sent over the controller's kill
/// channel.
#[derive(Debug, Clone)]
pub struct KillRequest {
    pub session_id: String,
    /// Serial of the session instance the request targets.
    pub serial: u64,
    pub reason: String,
}

/// Handle a collaborator uses to report that a session can no longer stream.
#[derive(Debug, Clone)]
pub struct KillSwitch {
    session_id: String,
    serial: u64,
    tx: mpsc::UnboundedSender<KillRequest>,
}

impl KillSwitch {
    pub(crate) fn new(session_id: &str, serial: u64, tx: mpsc::UnboundedSender<KillRequest>) -> Self {
        Self {
            session_id: session_id.to_string(),
            serial,
            tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Ask the controller to tear the session down.
    pub fn trigger(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(session_id = %self.session_id, %reason, "session kill requested");
        // The receiver only goes away with the controller, and then there is
        // nothing left to tear down.
        let _ = self.tx.send(KillRequest {
            session_id: self.session_id.clone(),
            serial: self.serial,
            reason,
        });
    }
}

/// A packet-rewriting UDP relay a transport places between the encoder and
/// the controller.
pub trait PacketRelay: Send {
    fn close(&mut self);
}

/// Exclusive handle on a spawned encoder process.
///
/// The child itself is owned by a supervisor task; this handle only carries
/// the kill order. Dropping the handle kills the process too.
#[derive(Debug)]
pub struct EncoderProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl EncoderProcess {
    /// Hand `child` to a supervisor task.
    ///
    /// If the process exits on its own, the supervisor pulls `kill` so the
    /// session does not linger without media.
    pub fn supervise(mut child: Child, kill: KillSwitch) -> Self {
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => tracing::error!(session_id = %kill.session_id(), ?pid, %status, "encoder exited"),
                        Err(e) => tracing::error!(session_id = %kill.session_id(), ?pid, error = %e, "encoder wait failed"),
                    }
                    kill.trigger("encoder exited");
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(session_id = %kill.session_id(), ?pid, error = %e, "failed to kill encoder");
                    }
                }
            }
        });

        Self {
            pid,
            kill_tx: Some(kill_tx),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Forcibly terminate the process. Idempotent.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            tracing::debug!(pid = ?self.pid, "killing encoder");
            let _ = tx.send(());
        }
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// One outbound media flow, accessory to controller.
#[derive(Debug, Clone)]
pub struct OutboundFlow {
    /// Controller's receive port.
    pub controller_port: u16,
    /// Accessory return port the controller sends RTCP to.
    pub return_port: u16,
    pub ssrc: u32,
    pub srtp: SrtpParams,
}

/// Everything a transport starter needs to bring one session's media up.
pub struct TransportContext {
    pub session_id: String,
    pub device: Arc<dyn Device>,
    /// Selected stream profile; `None` means the device default.
    pub selected: Option<StreamOptions>,
    pub family: AddressFamily,
    pub controller_address: IpAddr,
    pub video: OutboundFlow,
    pub audio: OutboundFlow,
    pub start: StartRequest,
    pub kill: KillSwitch,
}

/// Resources a transport starter created for a session. Ownership moves to
/// the session, which releases them at teardown.
#[derive(Default)]
pub struct TransportHandle {
    pub encoder: Option<EncoderProcess>,
    pub relay: Option<Box<dyn PacketRelay>>,
}

impl TransportHandle {
    /// Release everything this handle owns.
    pub fn release(&mut self) {
        if let Some(mut encoder) = self.encoder.take() {
            encoder.kill();
        }
        if let Some(mut relay) = self.relay.take() {
            relay.close();
        }
    }
}

/// Starts the media flow of a session.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn start(&self, ctx: TransportContext) -> Result<TransportHandle>;
}
