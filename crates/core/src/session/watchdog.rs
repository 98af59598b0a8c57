use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::transport::KillSwitch;

/// Default time without RTCP on the video-return socket before a session is
/// considered abandoned.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Watch a return socket and pull `kill` once the controller goes quiet.
///
/// A live controller sends RTCP receiver reports every few seconds; a
/// controller that vanished without a STOP sends nothing.
pub fn spawn_idle_watchdog(socket: Arc<UdpSocket>, timeout: Duration, kill: KillSwitch) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {}
                Ok(Err(e)) => {
                    tracing::warn!(session_id = %kill.session_id(), error = %e, "video return socket failed, watchdog stopped");
                    return;
                }
                Err(_) => {
                    kill.trigger(format!("no RTCP from controller for {}s", timeout.as_secs()));
                    return;
                }
            }
        }
    })
}
