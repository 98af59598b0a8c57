//! Stream sessions and the registry that owns them.
//!
//! A session is created by negotiate and keyed by the identifier the
//! controller picked. It owns every OS resource of the stream: the two
//! return sockets, the encoder process, any packet relay, the talkback relay
//! and the background tasks reading the return sockets.
//!
//! ## Session lifecycle
//!
//! ```text
//! negotiate            -> Prepared
//! START                -> Streaming
//! RECONFIGURE          -> (unchanged; may push a new bitrate)
//! STOP / kill switch   -> Killed (removed from the registry)
//! ```
//!
//! `Killed` is terminal. A task that suspended before the kill observes it
//! when it resumes, and any resource it created in the meantime is released
//! on the spot instead of being attached.

pub mod params;
pub mod watchdog;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::talkback::TalkbackRelay;
use crate::transport::TransportHandle;
pub use params::{NegotiateRequest, StartRequest, StreamRequest};

static SESSION_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Externally visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Negotiated; return sockets bound, no media yet.
    Prepared,
    /// START accepted and the transport launched.
    Streaming,
    /// Teardown has begun.
    Killed,
}

/// Return sockets bound at negotiation time.
pub struct ReturnSockets {
    pub video: UdpSocket,
    pub video_port: u16,
    pub audio: UdpSocket,
    pub audio_port: u16,
}

/// A talkback relay and the demux task feeding it.
struct ActiveTalkback {
    relay: Arc<dyn TalkbackRelay>,
    demux: JoinHandle<()>,
}

impl ActiveTalkback {
    fn release(self) {
        self.demux.abort();
        self.relay.destroy();
    }
}

#[derive(Default)]
struct SessionResources {
    video_return: Option<Arc<UdpSocket>>,
    audio_return: Option<Arc<UdpSocket>>,
    transport: TransportHandle,
    /// Idle watchdog of the attached transport.
    watchdog: Option<JoinHandle<()>>,
    talkback: Option<ActiveTalkback>,
}

/// One negotiated stream.
pub struct Session {
    /// Identifier chosen by the controller.
    pub id: String,
    /// Distinguishes successive sessions negotiated under the same id.
    pub serial: u64,
    /// Hub classification of the controller, fixed at negotiation.
    pub is_hub: bool,
    /// The original negotiate request.
    pub negotiate: NegotiateRequest,
    pub video_ssrc: u32,
    pub audio_ssrc: u32,
    pub video_port: u16,
    pub audio_port: u16,
    killed: AtomicBool,
    state: Mutex<SessionState>,
    start_request: Mutex<Option<StartRequest>>,
    resources: Mutex<SessionResources>,
}

impl Session {
    pub(crate) fn new(
        negotiate: NegotiateRequest,
        is_hub: bool,
        sockets: ReturnSockets,
        video_ssrc: u32,
        audio_ssrc: u32,
    ) -> Self {
        Self {
            id: negotiate.session_id.clone(),
            serial: SESSION_SERIAL.fetch_add(1, Ordering::Relaxed),
            is_hub,
            negotiate,
            video_ssrc,
            audio_ssrc,
            video_port: sockets.video_port,
            audio_port: sockets.audio_port,
            killed: AtomicBool::new(false),
            state: Mutex::new(SessionState::Prepared),
            start_request: Mutex::new(None),
            resources: Mutex::new(SessionResources {
                video_return: Some(Arc::new(sockets.video)),
                audio_return: Some(Arc::new(sockets.audio)),
                ..Default::default()
            }),
        }
    }

    pub fn controller_address(&self) -> IpAddr {
        self.negotiate.controller_address
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        if self.is_killed() {
            return SessionState::Killed;
        }
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        tracing::debug!(session_id = %self.id, old_state = ?*current, new_state = ?state, "state transition");
        *current = state;
    }

    /// The most recently accepted START parameters.
    pub fn start_request(&self) -> Option<StartRequest> {
        self.start_request.lock().clone()
    }

    pub(crate) fn set_start_request(&self, request: StartRequest) {
        *self.start_request.lock() = Some(request);
    }

    pub fn video_return(&self) -> Option<Arc<UdpSocket>> {
        self.resources.lock().video_return.clone()
    }

    pub fn audio_return(&self) -> Option<Arc<UdpSocket>> {
        self.resources.lock().audio_return.clone()
    }

    pub fn has_talkback(&self) -> bool {
        self.resources.lock().talkback.is_some()
    }

    /// Take ownership of a started transport. If the session was killed in
    /// the meantime the handle is given back for the caller to release.
    ///
    /// A transport from an earlier START is released along with its
    /// watchdog.
    pub(crate) fn attach_transport(
        &self,
        handle: TransportHandle,
    ) -> std::result::Result<(), TransportHandle> {
        let mut resources = self.resources.lock();
        if self.is_killed() {
            return Err(handle);
        }
        resources.transport.release();
        if let Some(watchdog) = resources.watchdog.take() {
            watchdog.abort();
        }
        resources.transport = handle;
        Ok(())
    }

    /// Take ownership of the idle watchdog of the attached transport.
    /// Aborts it right away if the session is already dead.
    pub(crate) fn attach_watchdog(&self, task: JoinHandle<()>) -> bool {
        let mut resources = self.resources.lock();
        if self.is_killed() {
            task.abort();
            return false;
        }
        if let Some(previous) = resources.watchdog.replace(task) {
            previous.abort();
        }
        true
    }

    /// Take ownership of a talkback relay and the demux task reading the
    /// audio-return socket for it.
    ///
    /// Returns whether a relay from an earlier START was replaced; that
    /// relay is destroyed and its demux aborted. If the session was killed
    /// in the meantime the demux is aborted and the relay given back.
    pub(crate) fn attach_talkback(
        &self,
        relay: Arc<dyn TalkbackRelay>,
        demux: JoinHandle<()>,
    ) -> std::result::Result<bool, Arc<dyn TalkbackRelay>> {
        let mut resources = self.resources.lock();
        if self.is_killed() {
            demux.abort();
            return Err(relay);
        }
        let previous = resources.talkback.replace(ActiveTalkback { relay, demux });
        Ok(match previous {
            Some(previous) => {
                previous.release();
                true
            }
            None => false,
        })
    }

    fn mark_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    /// Release every owned resource. Returns whether a talkback relay was
    /// active, in which case the device intercom must be stopped.
    pub(crate) fn release(&self) -> bool {
        let mut resources = std::mem::take(&mut *self.resources.lock());
        *self.state.lock() = SessionState::Killed;

        if let Some(watchdog) = resources.watchdog.take() {
            watchdog.abort();
        }
        resources.transport.release();
        drop(resources.video_return.take());
        drop(resources.audio_return.take());

        match resources.talkback.take() {
            Some(talkback) => {
                talkback.release();
                true
            }
            None => false,
        }
    }
}

/// Registry of in-flight sessions.
///
/// The only state shared across requests. Negotiate inserts, teardown
/// removes; every other path only looks sessions up.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. A session already registered under the same id
    /// is displaced, marked killed and returned for teardown.
    pub(crate) fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let id = session.id.clone();
        let mut sessions = self.sessions.write();
        let displaced = sessions.insert(id.clone(), session);
        if let Some(old) = &displaced {
            old.mark_killed();
        }
        tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session registered");
        displaced
    }

    /// Look up a session by ID.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove a session and mark it killed in one step, so no lookup can
    /// observe a removed-but-alive session.
    ///
    /// With `serial`, only the session instance carrying that serial is
    /// taken.
    pub(crate) fn take(&self, id: &str, serial: Option<u64>) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let matches = sessions
            .get(id)
            .is_some_and(|s| serial.is_none_or(|serial| s.serial == serial));
        if !matches {
            return None;
        }

        let session = sessions.remove(id)?;
        session.mark_killed();
        tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::params::{AddressFamily, ConnectionInfo, MediaEndpoint, SrtpParams};
    use crate::transport::PacketRelay;

    fn negotiate(id: &str) -> NegotiateRequest {
        let srtp = SrtpParams::new(vec![1u8; 16], vec![2u8; 14]);
        NegotiateRequest {
            session_id: id.to_string(),
            controller_address: "10.0.0.9".parse().unwrap(),
            family: AddressFamily::Ipv4,
            video: MediaEndpoint {
                port: 51000,
                srtp: srtp.clone(),
            },
            audio: MediaEndpoint { port: 51002, srtp },
            connection: ConnectionInfo {
                local_address: "10.0.0.2".into(),
                interface: "eth0".into(),
            },
        }
    }

    async fn session(id: &str) -> Arc<Session> {
        let video = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let audio = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sockets = ReturnSockets {
            video_port: video.local_addr().unwrap().port(),
            audio_port: audio.local_addr().unwrap().port(),
            video,
            audio,
        };
        Arc::new(Session::new(negotiate(id), false, sockets, 1, 2))
    }

    struct FlagRelay(Arc<AtomicBool>);

    async fn aborted(task: &tokio::task::AbortHandle) -> bool {
        for _ in 0..100 {
            if task.is_finished() {
                return true;
            }
            tokio::task::yield_now().await;
        }
        false
    }

    #[derive(Default)]
    struct NullRelay {
        destroyed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl TalkbackRelay for NullRelay {
        fn port(&self) -> u16 {
            0
        }

        fn intercom_input(&self) -> crate::device::IntercomInput {
            crate::device::IntercomInput { sdp: String::new() }
        }

        async fn heartbeat(&self, _socket: &UdpSocket, _datagram: &[u8]) {}

        fn destroy(&self) {
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }

    impl PacketRelay for FlagRelay {
        fn close(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn take_is_single_shot() {
        let registry = SessionRegistry::new();
        assert!(registry.insert(session("a").await).is_none());

        let first = registry.take("a", None).unwrap();
        assert!(first.is_killed());
        assert_eq!(first.state(), SessionState::Killed);
        assert!(registry.take("a", None).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn take_respects_serial() {
        let registry = SessionRegistry::new();
        let s = session("a").await;
        let serial = s.serial;
        registry.insert(s);

        assert!(registry.take("a", Some(serial + 1000)).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.take("a", Some(serial)).is_some());
    }

    #[tokio::test]
    async fn insert_displaces_same_id() {
        let registry = SessionRegistry::new();
        let old = session("a").await;
        assert!(registry.insert(old.clone()).is_none());

        let displaced = registry.insert(session("a").await).unwrap();
        assert_eq!(displaced.serial, old.serial);
        assert!(old.is_killed());
        assert_eq!(registry.len(), 1);
        assert!(!registry.get("a").unwrap().is_killed());
    }

    #[tokio::test]
    async fn serials_are_unique() {
        assert_ne!(session("a").await.serial, session("a").await.serial);
    }

    #[tokio::test]
    async fn attach_after_kill_hands_resources_back() {
        let registry = SessionRegistry::new();
        let s = session("a").await;
        registry.insert(s.clone());
        registry.take("a", None).unwrap();

        let closed = Arc::new(AtomicBool::new(false));
        let handle = TransportHandle {
            encoder: None,
            relay: Some(Box::new(FlagRelay(closed.clone()))),
        };
        let mut returned = s.attach_transport(handle).err().unwrap();
        returned.release();
        assert!(closed.load(Ordering::SeqCst));

        let task = tokio::spawn(std::future::pending::<()>());
        assert!(!s.attach_watchdog(task));

        let relay = Arc::new(NullRelay::default());
        let demux = tokio::spawn(std::future::pending::<()>());
        assert!(s.attach_talkback(relay, demux).is_err());
    }

    #[tokio::test]
    async fn new_transport_aborts_previous_watchdog() {
        let s = session("a").await;
        let watchdog = tokio::spawn(std::future::pending::<()>());
        let abort = watchdog.abort_handle();
        assert!(s.attach_watchdog(watchdog));

        let closed = Arc::new(AtomicBool::new(false));
        s.attach_transport(TransportHandle {
            encoder: None,
            relay: Some(Box::new(FlagRelay(closed.clone()))),
        })
        .ok()
        .unwrap();
        assert!(aborted(&abort).await);
        assert!(!closed.load(Ordering::SeqCst));

        s.attach_transport(TransportHandle::default()).ok().unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn replacing_talkback_aborts_previous_demux() {
        let s = session("a").await;
        let first = Arc::new(NullRelay::default());
        let first_demux = tokio::spawn(std::future::pending::<()>());
        let first_abort = first_demux.abort_handle();
        assert!(!s.attach_talkback(first.clone(), first_demux).ok().unwrap());

        let second = Arc::new(NullRelay::default());
        let second_demux = tokio::spawn(std::future::pending::<()>());
        let second_abort = second_demux.abort_handle();
        assert!(s.attach_talkback(second.clone(), second_demux).ok().unwrap());

        assert!(first.destroyed.load(Ordering::SeqCst));
        assert!(aborted(&first_abort).await);
        assert!(!second.destroyed.load(Ordering::SeqCst));
        assert!(!second_abort.is_finished());

        assert!(s.release());
        assert!(second.destroyed.load(Ordering::SeqCst));
        assert!(aborted(&second_abort).await);
    }

    #[tokio::test]
    async fn release_closes_everything() {
        let s = session("a").await;
        let closed = Arc::new(AtomicBool::new(false));
        s.attach_transport(TransportHandle {
            encoder: None,
            relay: Some(Box::new(FlagRelay(closed.clone()))),
        })
        .ok()
        .unwrap();
        let port = s.video_port;

        assert!(!s.release());
        assert!(closed.load(Ordering::SeqCst));
        assert!(s.video_return().is_none());
        assert!(s.audio_return().is_none());
        UdpSocket::bind(("127.0.0.1", port)).await.unwrap();
    }

    #[tokio::test]
    async fn state_transitions() {
        let s = session("a").await;
        assert_eq!(s.state(), SessionState::Prepared);
        s.set_state(SessionState::Streaming);
        assert_eq!(s.state(), SessionState::Streaming);
    }
}
