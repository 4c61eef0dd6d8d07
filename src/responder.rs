//! Responder-side session multiplexer
//!
//! Takes a query name, returns either nothing ("not mine", resolve normally) or the
//! downstream record to answer with. Each authorized session is backed by an in-memory pipe
//! whose other end is handed to a [`SessionAcceptor`].
//!
//! All work done per query is non-blocking: upstream bytes the application has not taken
//! yet wait in a per-session backlog, and downstream bytes are only taken if already there.

use crate::codec::{Direction, DownstreamMode, DownstreamRecord, SegmentCodec};
use crate::dns::{DnsQuestion, DnsRecord};
use crate::frame::{DownstreamFrame, StreamStatus, UpstreamFrame, DOWNSTREAM_HEADER_LEN};
use crate::otp::{self, OtpAuthorizer};
use crate::relay::QueryHandler;
use crate::session::SessionId;
use crate::DnswayError;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

/// Capacity of the pipe between the responder and the application
const PIPE_CAPACITY: usize = 64 * 1024;

/// Protocol violations tolerated per session
const MAX_STRIKES: u32 = 8;

/// TTL of tunnel answers
const ANSWER_TTL: u32 = 0;

/// How long an accepted open code stays valid and must not be reused
const REPLAY_WINDOW: Duration = Duration::from_secs((2 * otp::SKEW_STEPS + 1) * otp::TIME_STEP);

/// Application end of a freshly authorized session
#[derive(Debug)]
pub struct AcceptedSession {
    pub id: SessionId,
    pub stream: DuplexStream,
}

/// Receives newly authorized sessions
pub trait SessionAcceptor: Send + Sync {
    fn accept(&self, session: AcceptedSession);
}

impl SessionAcceptor for mpsc::UnboundedSender<AcceptedSession> {
    fn accept(&self, session: AcceptedSession) {
        if let Err(e) = self.send(session) {
            log::warn!("Session {:04x} dropped: acceptor gone", e.0.id);
        }
    }
}

struct ResponderSession {
    /// None once the application end closed
    stream: Option<DuplexStream>,
    last_seq: u32,
    /// Reply to `last_seq`, resent for retransmissions
    cached: DownstreamFrame,
    /// Upstream bytes accepted but not yet taken by the application
    backlog: Vec<u8>,
    /// Cumulative upstream bytes handed to the application
    delivered: u32,
    /// Cumulative downstream payload bytes sent
    sent: u32,
    max_downstream: usize,
    strikes: u32,
    last_seen: Instant,
}

impl ResponderSession {
    /// Push as much of the backlog into the pipe as it takes right now
    fn flush_backlog(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            self.backlog.clear();
            return false;
        };

        while !self.backlog.is_empty() {
            match stream.write(&self.backlog).now_or_never() {
                Some(Ok(0)) | Some(Err(_)) => {
                    self.stream = None;
                    self.backlog.clear();
                    return false;
                }
                Some(Ok(n)) => {
                    self.backlog.drain(..n);
                    self.delivered = self.delivered.wrapping_add(n as u32);
                }
                None => break,
            }
        }
        true
    }

    /// Take whatever downstream bytes are ready; None once the stream ended
    fn take_downstream(&mut self, limit: usize) -> Option<Vec<u8>> {
        let stream = self.stream.as_mut()?;
        let mut buf = vec![0u8; limit];
        match stream.read(&mut buf).now_or_never() {
            Some(Ok(0)) | Some(Err(_)) => {
                self.stream = None;
                None
            }
            Some(Ok(n)) => {
                buf.truncate(n);
                Some(buf)
            }
            None => Some(Vec::new()),
        }
    }

    fn status(&self) -> StreamStatus {
        if self.stream.is_some() {
            StreamStatus::Open
        } else {
            StreamStatus::Closed
        }
    }
}

/// Turns tunnel query names into answers
pub struct TunnelResponder {
    codec: SegmentCodec,
    otp: OtpAuthorizer,
    acceptor: std::sync::Arc<dyn SessionAcceptor>,
    sessions: Mutex<HashMap<SessionId, ResponderSession>>,
    /// Open codes that created a session, per id, until they expire
    used_codes: Mutex<HashMap<(SessionId, u32), Instant>>,
}

impl TunnelResponder {
    pub fn new(
        codec: SegmentCodec,
        otp: OtpAuthorizer,
        acceptor: std::sync::Arc<dyn SessionAcceptor>,
    ) -> Self {
        Self {
            codec,
            otp,
            acceptor,
            sessions: Mutex::new(HashMap::new()),
            used_codes: Mutex::new(HashMap::new()),
        }
    }

    pub fn codec(&self) -> &SegmentCodec {
        &self.codec
    }

    /// Answer a query name, or None if it is not a tunnel segment this responder accepts
    pub fn respond(&self, qname: &str, mode: DownstreamMode) -> Option<DownstreamRecord> {
        let segment = match self.codec.decode_upstream(qname) {
            Ok(segment) => segment,
            Err(e) => {
                log::debug!("Ignoring {}: {}", qname, e);
                return None;
            }
        };

        let id = segment.session_id;
        let frame = match UpstreamFrame::decode(&segment.payload) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Session {:04x} seq {}: {}", id, segment.seq, e);
                self.strike(id);
                return None;
            }
        };

        let reply = match frame {
            UpstreamFrame::Open {
                code,
                max_downstream,
            } => self.open(id, segment.seq, code, max_downstream)?,
            UpstreamFrame::Data { ack, payload } => {
                self.data(id, segment.seq, ack, payload, mode)?
            }
            UpstreamFrame::Close => self.close(id, segment.seq)?,
        };

        match self.codec.encode_downstream(mode, &reply.encode()) {
            Ok(record) => Some(record),
            Err(e) => {
                log::error!("Session {:04x} reply not encodable: {}", id, e);
                None
            }
        }
    }

    fn open(&self, id: SessionId, seq: u32, code: u32, max_downstream: u16) -> Option<DownstreamFrame> {
        if !self.otp.verify(code) {
            log::debug!("Session {:04x} rejected: {}", id, DnswayError::AuthorizationFailed);
            return None;
        }
        if seq != 0 {
            return None;
        }

        let mut sessions = self.lock();
        if let Some(existing) = sessions.get_mut(&id) {
            // Retransmitted open
            if existing.last_seq == 0 {
                existing.last_seen = Instant::now();
                return Some(existing.cached.clone());
            }
            return None;
        }

        {
            let mut used = self.used_codes.lock().unwrap_or_else(PoisonError::into_inner);
            used.retain(|_, at| at.elapsed() < REPLAY_WINDOW);
            if used.contains_key(&(id, code)) {
                log::warn!("Session {:04x} open replayed", id);
                return None;
            }
            used.insert((id, code), Instant::now());
        }

        let (app, ours) = duplex(PIPE_CAPACITY);
        let reply = DownstreamFrame {
            status: StreamStatus::Open,
            ack: 0,
            payload: Vec::new(),
        };
        sessions.insert(
            id,
            ResponderSession {
                stream: Some(ours),
                last_seq: 0,
                cached: reply.clone(),
                backlog: Vec::new(),
                delivered: 0,
                sent: 0,
                max_downstream: usize::from(max_downstream).max(1),
                strikes: 0,
                last_seen: Instant::now(),
            },
        );
        drop(sessions);

        log::info!("Session {:04x} authorized", id);
        self.acceptor.accept(AcceptedSession { id, stream: app });
        Some(reply)
    }

    fn data(
        &self,
        id: SessionId,
        seq: u32,
        ack: u32,
        payload: Vec<u8>,
        mode: DownstreamMode,
    ) -> Option<DownstreamFrame> {
        let limit = self.codec.capacity(Direction::Downstream(mode)) - DOWNSTREAM_HEADER_LEN;
        let mut sessions = self.lock();
        let session = sessions.get_mut(&id)?;

        if seq == session.last_seq {
            session.last_seen = Instant::now();
            return Some(session.cached.clone());
        }
        if seq != session.last_seq.wrapping_add(1) {
            log::debug!(
                "Session {:04x} out of order: seq {} after {}",
                id,
                seq,
                session.last_seq
            );
            session.strikes += 1;
            if session.strikes > MAX_STRIKES {
                log::warn!("Session {:04x} dropped after {} strikes", id, session.strikes);
                sessions.remove(&id);
            }
            return None;
        }

        if ack != session.sent {
            log::warn!(
                "Session {:04x} ack {} does not match {} bytes sent",
                id,
                ack,
                session.sent
            );
        }

        let was_open = session.stream.is_some();
        if was_open {
            session.backlog.extend_from_slice(&payload);
        }
        session.flush_backlog();

        let limit = limit.min(session.max_downstream);
        let downstream = session.take_downstream(limit).unwrap_or_default();
        let status = session.status();

        session.sent = session.sent.wrapping_add(downstream.len() as u32);
        session.last_seq = seq;
        session.last_seen = Instant::now();
        session.cached = DownstreamFrame {
            status,
            ack: session.delivered,
            payload: downstream,
        };

        if was_open && status == StreamStatus::Closed {
            log::info!("Session {:04x} stream closed", id);
        }
        Some(session.cached.clone())
    }

    fn close(&self, id: SessionId, seq: u32) -> Option<DownstreamFrame> {
        let mut session = self.lock().remove(&id)?;
        log::info!("Session {:04x} closed by client at seq {}", id, seq);

        // Whatever the pipe could not take yet is handed over before the stream ends
        session.flush_backlog();
        if let Some(mut stream) = session.stream.take() {
            if !session.backlog.is_empty() {
                let backlog = std::mem::take(&mut session.backlog);
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            if let Err(e) = stream.write_all(&backlog).await {
                                log::debug!("Session {:04x} backlog lost: {}", id, e);
                            }
                        });
                    }
                    Err(_) => log::warn!(
                        "Session {:04x}: {} backlog bytes dropped",
                        id,
                        backlog.len()
                    ),
                }
            }
        }

        Some(DownstreamFrame {
            status: StreamStatus::Closed,
            ack: session.delivered,
            payload: Vec::new(),
        })
    }

    fn strike(&self, id: SessionId) {
        let mut sessions = self.lock();
        if let Some(session) = sessions.get_mut(&id) {
            session.strikes += 1;
            if session.strikes > MAX_STRIKES {
                log::warn!("Session {:04x} dropped after {} strikes", id, session.strikes);
                sessions.remove(&id);
            }
        }
    }

    /// Drop sessions without a segment for `timeout`; returns how many went
    pub fn reap_idle(&self, timeout: Duration) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = session.last_seen.elapsed() < timeout;
            if !keep {
                log::info!("Session {:04x} idle, removed", id);
            }
            keep
        });
        before - sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, ResponderSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl QueryHandler for TunnelResponder {
    async fn answer(&self, question: &DnsQuestion) -> Option<DnsRecord> {
        let mode = DownstreamMode::for_query_type(question.qtype);
        self.respond(&question.qname, mode)
            .map(|record| record.to_dns_record(&question.qname, ANSWER_TTL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const DOMAIN: &str = "t.example.com";

    struct Client {
        codec: SegmentCodec,
        otp: OtpAuthorizer,
    }

    impl Client {
        fn new(secret: &[u8]) -> Self {
            Self {
                codec: SegmentCodec::new(DOMAIN).unwrap(),
                otp: OtpAuthorizer::new(secret),
            }
        }

        fn query(&self, id: SessionId, seq: u32, frame: UpstreamFrame) -> String {
            self.codec.encode_upstream(id, seq, &frame.encode()).unwrap()
        }

        fn open(&self, id: SessionId) -> String {
            self.query(
                id,
                0,
                UpstreamFrame::Open {
                    code: self.otp.current(),
                    max_downstream: 600,
                },
            )
        }

        fn data(&self, id: SessionId, seq: u32, ack: u32, payload: &[u8]) -> String {
            self.query(
                id,
                seq,
                UpstreamFrame::Data {
                    ack,
                    payload: payload.to_vec(),
                },
            )
        }

        fn reply(&self, record: DownstreamRecord) -> DownstreamFrame {
            DownstreamFrame::decode(&self.codec.decode_downstream(&record).unwrap()).unwrap()
        }
    }

    fn responder(secret: &[u8]) -> (TunnelResponder, mpsc::UnboundedReceiver<AcceptedSession>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let responder = TunnelResponder::new(
            SegmentCodec::new(DOMAIN).unwrap(),
            OtpAuthorizer::new(secret),
            Arc::new(tx),
        );
        (responder, rx)
    }

    #[tokio::test]
    async fn test_bad_code_leaves_no_state() {
        let (responder, mut accepted) = responder(b"right");
        let client = Client::new(b"wrong");

        assert!(responder.respond(&client.open(5), DownstreamMode::Alias).is_none());
        assert_eq!(responder.session_count(), 0);
        assert!(accepted.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_foreign_and_garbage_names() {
        let (responder, _accepted) = responder(b"s");
        assert!(responder.respond("www.example.com", DownstreamMode::Alias).is_none());
        assert!(responder.respond("junk.t.example.com", DownstreamMode::Text).is_none());
        assert_eq!(responder.session_count(), 0);
    }

    #[tokio::test]
    async fn test_open_data_and_retransmission() {
        let (responder, mut accepted) = responder(b"s");
        let client = Client::new(b"s");

        let reply = client.reply(responder.respond(&client.open(1), DownstreamMode::Text).unwrap());
        assert_eq!(reply.status, StreamStatus::Open);
        let mut app = accepted.try_recv().unwrap().stream;

        app.write_all(b"welcome").await.unwrap();

        let name = client.data(1, 1, 0, b"hello");
        let first = client.reply(responder.respond(&name, DownstreamMode::Text).unwrap());
        assert_eq!(first.ack, 5);
        assert_eq!(first.payload, b"welcome");

        // Same name again gets the identical reply, nothing is delivered twice
        let again = client.reply(responder.respond(&name, DownstreamMode::Text).unwrap());
        assert_eq!(again, first);

        let mut buf = [0u8; 16];
        let n = app.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        let poll = client.reply(
            responder
                .respond(&client.data(1, 2, 7, b""), DownstreamMode::Alias)
                .unwrap(),
        );
        assert_eq!(poll.ack, 5);
        assert!(poll.payload.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_strikes() {
        let (responder, _accepted) = responder(b"s");
        let client = Client::new(b"s");
        responder.respond(&client.open(3), DownstreamMode::Alias).unwrap();

        for _ in 0..MAX_STRIKES {
            assert!(responder
                .respond(&client.data(3, 9, 0, b"x"), DownstreamMode::Alias)
                .is_none());
        }
        assert_eq!(responder.session_count(), 1);

        responder.respond(&client.data(3, 9, 0, b"x"), DownstreamMode::Alias);
        assert_eq!(responder.session_count(), 0);
    }

    #[tokio::test]
    async fn test_application_close() {
        let (responder, mut accepted) = responder(b"s");
        let client = Client::new(b"s");
        responder.respond(&client.open(4), DownstreamMode::Text).unwrap();
        drop(accepted.try_recv().unwrap());

        let reply = client.reply(
            responder
                .respond(&client.data(4, 1, 0, b"anyone?"), DownstreamMode::Text)
                .unwrap(),
        );
        assert_eq!(reply.status, StreamStatus::Closed);
    }

    #[tokio::test]
    async fn test_client_close_and_reap() {
        let (responder, _accepted) = responder(b"s");
        let client = Client::new(b"s");

        responder.respond(&client.open(10), DownstreamMode::Alias).unwrap();
        responder.respond(&client.open(11), DownstreamMode::Alias).unwrap();
        assert_eq!(responder.session_count(), 2);

        let bye = client.reply(
            responder
                .respond(&client.query(10, 1, UpstreamFrame::Close), DownstreamMode::Alias)
                .unwrap(),
        );
        assert_eq!(bye.status, StreamStatus::Closed);
        assert_eq!(responder.session_count(), 1);

        assert_eq!(responder.reap_idle(Duration::from_secs(60)), 0);
        assert_eq!(responder.reap_idle(Duration::ZERO), 1);
        assert_eq!(responder.session_count(), 0);
    }

    #[tokio::test]
    async fn test_client_close_hands_over_backlog() {
        let (responder, mut accepted) = responder(b"s");
        let client = Client::new(b"s");
        responder.respond(&client.open(30), DownstreamMode::Text).unwrap();
        let mut app = accepted.try_recv().unwrap().stream;

        // More than the pipe holds while the application is not reading
        let chunk = [0x5au8; 100];
        let segments = PIPE_CAPACITY / chunk.len() + 50;
        for seq in 1..=segments as u32 {
            responder
                .respond(&client.data(30, seq, 0, &chunk), DownstreamMode::Text)
                .unwrap();
        }

        let bye = client.reply(
            responder
                .respond(
                    &client.query(30, segments as u32 + 1, UpstreamFrame::Close),
                    DownstreamMode::Text,
                )
                .unwrap(),
        );
        assert_eq!(bye.status, StreamStatus::Closed);

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), app.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), segments * chunk.len());
    }

    #[tokio::test]
    async fn test_open_replay_rejected() {
        let (responder, mut accepted) = responder(b"s");
        let client = Client::new(b"s");

        let open = client.open(40);
        responder.respond(&open, DownstreamMode::Alias).unwrap();
        responder
            .respond(&client.query(40, 1, UpstreamFrame::Close), DownstreamMode::Alias)
            .unwrap();
        assert_eq!(responder.session_count(), 0);
        assert!(accepted.try_recv().is_ok());

        // Captured name sent again after the session ended
        assert!(responder.respond(&open, DownstreamMode::Alias).is_none());
        assert_eq!(responder.session_count(), 0);
        assert!(accepted.try_recv().is_err());

        // The code itself is not burned for other sessions
        assert!(responder.respond(&client.open(41), DownstreamMode::Alias).is_some());
    }

    #[tokio::test]
    async fn test_query_handler_answers_by_type() {
        use crate::dns::{RData, RecordType};

        let (responder, _accepted) = responder(b"s");
        let client = Client::new(b"s");

        let name = client.open(12);
        let record = responder
            .answer(&DnsQuestion::new(&name, RecordType::Txt))
            .await
            .unwrap();
        assert!(matches!(record.rdata, RData::Txt(_)));
        assert_eq!(record.name, name);

        let record = responder
            .answer(&DnsQuestion::new(&name, RecordType::A))
            .await
            .unwrap();
        assert!(matches!(record.rdata, RData::Cname(_)));
    }
}
