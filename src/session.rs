//! Tunnel sessions
//!
//! One [`Session`] per proxied connection. A session owns a [`TransmissionControl`] whose
//! uplink and downlink are in-memory pipes drained and filled by the DNS carrier, and an
//! explicit state machine:
//!
//! ```text
//! Initial ──Authorized──▶ Established ──RemoteClosed──▶ Draining
//!    │                         │                           │
//!    └───────── Teardown / ConnectionClosed / Inactive / TransportFailed ──▶ Closed
//! ```
//!
//! Only `Established` sessions move application bytes upstream. Entering `Closed` closes the
//! transmission control and cancels the session's token, which stops the pump and the carrier.
//!
//! [`Session::close`] is graceful: writes stop at once, but the carrier keeps running until the
//! responder has acknowledged every accepted byte and only then tells it the stream is over.
//! [`Session::abort`] closes immediately.

use crate::carrier::{Carrier, QueryExchange};
use crate::codec::{DownstreamMode, SegmentCodec};
use crate::otp::OtpAuthorizer;
use crate::transmission::{SegmentLimits, TransmissionControl};
use crate::{DnswayError, Result};
use rand::Rng;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Session identifier carried in every query name of the session
pub type SessionId = u16;

/// Transmission control over the carrier pipes
pub(crate) type SessionStream = TransmissionControl<DuplexStream, DuplexStream>;

/// Attempts at drawing an unused random session id
const ALLOCATION_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, not yet authorized by the responder
    Initial,
    /// Authorized, data flows both ways
    Established,
    /// Responder closed its end; buffered downstream bytes remain readable
    Draining,
    /// Terminal
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// Responder accepted the one-time code
    Authorized,
    /// Responder reported its end of the stream closed
    RemoteClosed,
    /// Explicit teardown (shutdown, close frame)
    Teardown,
    /// Owning proxy connection closed
    ConnectionClosed,
    /// No traffic either way for the inactivity timeout
    Inactive,
    /// Carrier hit a fatal error
    TransportFailed,
}

impl SessionState {
    /// Next state for an event, rejecting illegal transitions
    pub fn transition(self, event: SessionEvent) -> Result<SessionState> {
        use SessionEvent::*;
        use SessionState::*;

        let next = match (self, event) {
            (Initial, Authorized) => Established,
            (Established, RemoteClosed) => Draining,
            // Responder refused the stream before it started
            (Initial, RemoteClosed) => Closed,
            (Initial | Established | Draining, Teardown | ConnectionClosed | Inactive | TransportFailed) => {
                Closed
            }
            (state, event) => return Err(DnswayError::InvalidTransition { state, event }),
        };
        Ok(next)
    }

    pub fn carries_data(self) -> bool {
        self == SessionState::Established
    }

    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

/// Everything a client session needs to reach the responder
#[derive(Clone)]
pub struct TunnelContext {
    pub codec: Arc<SegmentCodec>,
    pub otp: Arc<OtpAuthorizer>,
    pub exchange: Arc<dyn QueryExchange>,
    pub mode: DownstreamMode,
    pub limits: SegmentLimits,
    /// Base delay between idle polls
    pub poll_interval: Duration,
    pub inactivity_timeout: Duration,
    /// Parent of every session token
    pub cancel: CancellationToken,
}

impl TunnelContext {
    pub fn new(
        codec: SegmentCodec,
        otp: OtpAuthorizer,
        exchange: Arc<dyn QueryExchange>,
        mode: DownstreamMode,
    ) -> Self {
        let limits = SegmentLimits::for_codec(&codec, mode);
        Self {
            codec: Arc::new(codec),
            otp: Arc::new(otp),
            exchange,
            mode,
            limits,
            poll_interval: Duration::from_millis(50),
            inactivity_timeout: Duration::from_secs(60),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_limits(mut self, limits: SegmentLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_timing(mut self, poll_interval: Duration, inactivity_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.inactivity_timeout = inactivity_timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// One tunnelled connection, client side
pub struct Session {
    id: SessionId,
    stream: Arc<SessionStream>,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    /// Owner is done writing; the carrier drains the uplink, then closes
    closing: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Create a session and start its pump and carrier
    pub fn spawn(ctx: &TunnelContext, id: SessionId) -> Result<Arc<Session>> {
        let limits = ctx.limits;
        let (tc_uplink, carrier_uplink) = duplex(limits.max_upstream);
        let (carrier_downlink, tc_downlink) = duplex(limits.max_downstream * 4);

        let stream = Arc::new(TransmissionControl::new(limits, tc_uplink, tc_downlink)?);
        let cancel = ctx.cancel.child_token();
        stream.start(cancel.clone())?;

        let (state, _) = watch::channel(SessionState::Initial);
        let session = Arc::new(Session {
            id,
            stream,
            state,
            cancel,
            closing: CancellationToken::new(),
        });

        let carrier = Carrier::new(
            ctx.clone(),
            Arc::clone(&session),
            carrier_uplink,
            carrier_downlink,
        );
        let owner = Arc::clone(&session);
        tokio::spawn(async move {
            let event = match carrier.run().await {
                Ok(()) if owner.cancel.is_cancelled() => SessionEvent::Teardown,
                Ok(()) if owner.closing.is_cancelled() => SessionEvent::ConnectionClosed,
                Ok(()) => return,
                Err(e) => {
                    log::warn!("Session {:04x} carrier failed: {}", owner.id, e);
                    SessionEvent::TransportFailed
                }
            };
            if !owner.state().is_closed() {
                let _ = owner.apply(event);
            }
        });

        log::debug!("Session {:04x} created", id);
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Feed an event through the state machine
    pub fn apply(&self, event: SessionEvent) -> Result<SessionState> {
        let mut outcome = Err(DnswayError::TransportClosed);
        self.state.send_if_modified(|state| match state.transition(event) {
            Ok(next) => {
                let changed = next != *state;
                *state = next;
                outcome = Ok(next);
                changed
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });

        let next = outcome?;
        log::info!("Session {:04x} {:?} -> {:?}", self.id, event, next);
        if next.is_closed() {
            self.stream.close();
            self.cancel.cancel();
        }
        Ok(next)
    }

    /// Wait until the session leaves `Initial`
    ///
    /// Fails with `TransportClosed` if it closed without being established.
    pub async fn wait_established(&self) -> Result<()> {
        let mut rx = self.subscribe();
        let state = *rx
            .wait_for(|s| *s != SessionState::Initial)
            .await
            .map_err(|_| DnswayError::TransportClosed)?;

        match state {
            SessionState::Established | SessionState::Draining => Ok(()),
            _ => Err(DnswayError::TransportClosed),
        }
    }

    /// Send application bytes upstream
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.wait_established().await?;
        if self.is_closing() || !self.state().carries_data() {
            return Err(DnswayError::TransportClosed);
        }
        self.stream.write(data).await
    }

    /// Receive downstream bytes
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).await
    }

    /// Close because the owning connection went away
    ///
    /// Bytes already accepted by `write` are still delivered. Sessions that are not
    /// established have nothing in flight and close at once.
    pub fn close(&self) {
        self.closing.cancel();
        if self.state() != SessionState::Established {
            self.finish();
        }
    }

    /// Close immediately, dropping anything not yet acknowledged
    pub fn abort(&self) {
        if !self.state().is_closed() {
            let _ = self.apply(SessionEvent::Teardown);
        }
    }

    /// Whether `close` has been called
    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    pub(crate) fn finish(&self) {
        if !self.state().is_closed() {
            let _ = self.apply(SessionEvent::ConnectionClosed);
        }
    }

    pub(crate) fn stream(&self) -> &Arc<SessionStream> {
        &self.stream
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn closing_token(&self) -> &CancellationToken {
        &self.closing
    }
}

/// Live sessions of one proxy front-end, keyed by id
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw an unused id, spawn a session under it and register it
    pub fn open(&self, ctx: &TunnelContext) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|_, s| !s.state().is_closed());

        let mut rng = rand::thread_rng();
        let id = (0..ALLOCATION_ATTEMPTS)
            .map(|_| rng.gen::<SessionId>())
            .find(|id| !sessions.contains_key(id))
            .ok_or_else(|| {
                DnswayError::Io(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "no free session id",
                ))
            })?;

        let session = Session::spawn(ctx, id)?;
        sessions.insert(id, Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every session
    pub fn close_all(&self) {
        let sessions: Vec<_> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in sessions {
            session.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::LocalExchange;
    use crate::responder::{AcceptedSession, TunnelResponder};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    #[test]
    fn test_transitions() {
        use SessionEvent::*;
        use SessionState::*;

        assert_eq!(Initial.transition(Authorized).unwrap(), Established);
        assert_eq!(Established.transition(RemoteClosed).unwrap(), Draining);
        assert_eq!(Draining.transition(ConnectionClosed).unwrap(), Closed);
        assert_eq!(Initial.transition(Inactive).unwrap(), Closed);
        assert_eq!(Established.transition(TransportFailed).unwrap(), Closed);
        assert_eq!(Initial.transition(RemoteClosed).unwrap(), Closed);
    }

    #[test]
    fn test_illegal_transitions() {
        use SessionEvent::*;
        use SessionState::*;

        for event in [Authorized, RemoteClosed, Teardown, ConnectionClosed, Inactive, TransportFailed] {
            assert!(matches!(
                Closed.transition(event),
                Err(DnswayError::InvalidTransition { state: Closed, .. })
            ));
        }
        assert!(Established.transition(Authorized).is_err());
        assert!(Draining.transition(Authorized).is_err());
        assert!(Draining.transition(RemoteClosed).is_err());
    }

    #[test]
    fn test_only_established_carries_data() {
        assert!(SessionState::Established.carries_data());
        assert!(!SessionState::Initial.carries_data());
        assert!(!SessionState::Draining.carries_data());
        assert!(!SessionState::Closed.carries_data());
    }

    fn context(
        client_secret: &[u8],
        responder_secret: &[u8],
    ) -> (TunnelContext, Arc<TunnelResponder>, mpsc::UnboundedReceiver<AcceptedSession>) {
        let codec = SegmentCodec::new("t.example.com").unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let responder = Arc::new(TunnelResponder::new(
            codec.clone(),
            OtpAuthorizer::new(responder_secret),
            Arc::new(tx),
        ));
        let exchange = Arc::new(LocalExchange::new(responder.clone()));
        let ctx = TunnelContext::new(
            codec,
            OtpAuthorizer::new(client_secret),
            exchange,
            DownstreamMode::Text,
        )
        .with_timing(Duration::from_millis(5), Duration::from_millis(400));
        (ctx, responder, rx)
    }

    #[tokio::test]
    async fn test_session_echo() {
        let (ctx, _responder, mut accepted) = context(b"secret", b"secret");
        let session = Session::spawn(&ctx, 0x0042).unwrap();

        let remote = accepted.recv().await.unwrap();
        assert_eq!(remote.id, 0x0042);
        let mut remote = remote.stream;

        session.wait_established().await.unwrap();
        assert_eq!(session.state(), SessionState::Established);

        let message: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        session.write(&message).await.unwrap();

        let mut received = vec![0u8; message.len()];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(received, message);

        remote.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < 4 {
            filled += session.read(&mut buf[filled..]).await.unwrap();
        }
        assert_eq!(&buf, b"pong");

        session.close();
        assert!(session.write(b"late").await.is_err());
        wait_closed(&session).await;
    }

    async fn wait_closed(session: &Session) {
        let mut states = session.subscribe();
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| s.is_closed()))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_delivers_accepted_bytes() {
        for id in 0..10u16 {
            let (ctx, responder, mut accepted) = context(b"secret", b"secret");
            let session = Session::spawn(&ctx, id).unwrap();
            let mut remote = accepted.recv().await.unwrap().stream;
            session.wait_established().await.unwrap();

            assert_eq!(session.write(b"QUIT\r\n").await.unwrap(), 6);
            session.close();

            let mut received = Vec::new();
            tokio::time::timeout(Duration::from_secs(5), remote.read_to_end(&mut received))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received, b"QUIT\r\n");

            wait_closed(&session).await;
            assert_eq!(responder.session_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_close_before_established_is_immediate() {
        let (ctx, _responder, _accepted) = context(b"client", b"responder");
        let session = Session::spawn(&ctx, 3).unwrap();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_remote_close_drains() {
        let (ctx, _responder, mut accepted) = context(b"secret", b"secret");
        let session = Session::spawn(&ctx, 7).unwrap();
        let mut remote = accepted.recv().await.unwrap().stream;
        session.wait_established().await.unwrap();

        remote.write_all(b"last words").await.unwrap();
        drop(remote);

        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match session.read(&mut buf).await {
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) => {
                    assert!(e.is_closed());
                    break;
                }
            }
        }
        assert_eq!(out, b"last words");
        assert_eq!(session.state(), SessionState::Draining);
    }

    #[tokio::test]
    async fn test_bad_secret_never_establishes() {
        let (ctx, responder, _accepted) = context(b"client", b"responder");
        let session = Session::spawn(&ctx, 9).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), session.wait_established())
            .await
            .unwrap();
        assert!(matches!(result, Err(DnswayError::TransportClosed)));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(responder.session_count(), 0);
    }

    #[tokio::test]
    async fn test_table_allocates_unique_ids() {
        let (ctx, _responder, _accepted) = context(b"s", b"s");
        let table = SessionTable::new();

        let a = table.open(&ctx).unwrap();
        let b = table.open(&ctx).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(table.len(), 2);
        assert!(table.get(a.id()).is_some());

        table.remove(a.id());
        assert_eq!(table.len(), 1);

        table.close_all();
        assert!(table.is_empty());
        assert!(b.state().is_closed());
    }
}
