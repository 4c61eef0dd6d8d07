//! DNS carrier
//!
//! Moves one session's bytes through DNS exchanges. The carrier reads upstream bytes out of
//! the session's uplink pipe, sends them as query names, and writes the payload of every
//! answer into the downlink pipe. Exactly one query per session is outstanding; an unanswered
//! query is resent with the same name so the responder can recognise the retransmission.

use crate::codec::DownstreamRecord;
use crate::dns::{DnsMessage, RCODE_NOERROR};
use crate::frame::{DownstreamFrame, StreamStatus, UpstreamFrame};
use crate::relay::{answer_locally, QueryHandler};
use crate::session::{Session, SessionEvent, SessionState, TunnelContext};
use crate::{DnswayError, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// Consecutive malformed replies tolerated before the session fails
const MALFORMED_TOLERANCE: u32 = 8;

/// Idle poll delay grows up to this multiple of the poll interval
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Time allowed for the close notification on the way out
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest DNS message accepted over UDP
const MAX_UDP_MESSAGE: usize = 4096;

/// One DNS query/response round trip
#[async_trait]
pub trait QueryExchange: Send + Sync {
    async fn exchange(&self, query: DnsMessage) -> Result<DnsMessage>;
}

/// Exchange over UDP with a recursive resolver
#[derive(Debug, Clone)]
pub struct UdpExchange {
    resolver: SocketAddr,
    timeout: Duration,
}

impl UdpExchange {
    pub fn new(resolver: SocketAddr, timeout: Duration) -> Self {
        Self { resolver, timeout }
    }
}

#[async_trait]
impl QueryExchange for UdpExchange {
    async fn exchange(&self, query: DnsMessage) -> Result<DnsMessage> {
        let reply = udp_round_trip(&query.to_bytes(), self.resolver, self.timeout).await?;
        DnsMessage::parse(&reply)
    }
}

/// Exchange answered in-process by a query handler
///
/// Messages still go through the wire encoding in both directions.
pub struct LocalExchange {
    handler: Arc<dyn QueryHandler>,
}

impl LocalExchange {
    pub fn new(handler: Arc<dyn QueryHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl QueryExchange for LocalExchange {
    async fn exchange(&self, query: DnsMessage) -> Result<DnsMessage> {
        let query = DnsMessage::parse(&query.to_bytes())?;
        let response = answer_locally(self.handler.as_ref(), &query).await;
        DnsMessage::parse(&response.to_bytes())
    }
}

/// Send a raw DNS message and wait for the response with the same transaction id
pub(crate) async fn udp_round_trip(
    packet: &[u8],
    server: SocketAddr,
    timeout: Duration,
) -> Result<Vec<u8>> {
    if packet.len() < 2 {
        return Err(DnswayError::InvalidMessage("query too short".into()));
    }
    let id = [packet[0], packet[1]];

    let bind_addr: SocketAddr = if server.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(server).await?;
    socket.send(packet).await?;

    let mut buf = vec![0u8; MAX_UDP_MESSAGE];
    let deadline = Instant::now() + timeout;
    loop {
        let n = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| DnswayError::Exchange(format!("no answer from {} in {:?}", server, timeout)))??;

        // Stray datagrams with another id are skipped
        if n >= 12 && buf[..2] == id && buf[2] & 0x80 != 0 {
            buf.truncate(n);
            return Ok(buf);
        }
    }
}

/// Drives one client session over DNS
pub(crate) struct Carrier {
    ctx: TunnelContext,
    session: Arc<Session>,
    /// Upstream bytes written by the transmission control
    uplink: DuplexStream,
    /// Downstream bytes for the transmission control
    downlink: DuplexStream,
    seq: u32,
    /// Cumulative downstream payload bytes received
    received: u32,
    /// Last cumulative upstream ack from the responder
    acked: u32,
    malformed: u32,
    close_sent: bool,
}

impl Carrier {
    pub(crate) fn new(
        ctx: TunnelContext,
        session: Arc<Session>,
        uplink: DuplexStream,
        downlink: DuplexStream,
    ) -> Self {
        Self {
            ctx,
            session,
            uplink,
            downlink,
            seq: 0,
            received: 0,
            acked: 0,
            malformed: 0,
            close_sent: false,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        if !self.handshake().await? {
            return Ok(());
        }

        let result = self.transfer().await;
        if self.session.cancel_token().is_cancelled() {
            self.send_close().await;
        }
        result
    }

    /// Open the session; false if it ended before being established
    async fn handshake(&mut self) -> Result<bool> {
        let started = Instant::now();
        let max_downstream = u16::try_from(self.ctx.limits.max_downstream).unwrap_or(u16::MAX);

        loop {
            if self.session.cancel_token().is_cancelled() {
                return Ok(false);
            }
            if started.elapsed() >= self.ctx.inactivity_timeout {
                info!("Session {:04x} not authorized in time", self.session.id());
                self.session.apply(SessionEvent::Inactive)?;
                return Ok(false);
            }

            let frame = UpstreamFrame::Open {
                code: self.ctx.otp.current(),
                max_downstream,
            };
            let name = self
                .ctx
                .codec
                .encode_upstream(self.session.id(), 0, &frame.encode())?;

            match self.round_trip(&name).await {
                Ok(reply) => {
                    self.malformed = 0;
                    self.seq = 1;
                    if reply.status == StreamStatus::Closed {
                        self.session.apply(SessionEvent::RemoteClosed)?;
                        return Ok(false);
                    }
                    if self.session.apply(SessionEvent::Authorized).is_err() {
                        // Closed while the open was in flight
                        self.send_close().await;
                        return Ok(false);
                    }
                    return Ok(true);
                }
                Err(e) => {
                    self.note_failure(&e)?;
                    debug!("Session {:04x} open failed: {}", self.session.id(), e);
                    if !self.pause(self.ctx.poll_interval).await {
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn transfer(&mut self) -> Result<()> {
        let max_upstream = self.ctx.limits.max_upstream;
        let mut buf = vec![0u8; max_upstream];
        let mut delay = Duration::ZERO;
        let mut last_activity = Instant::now();
        let mut uplink_open = true;

        loop {
            let n = if uplink_open {
                tokio::select! {
                    _ = self.session.cancel_token().cancelled() => return Ok(()),
                    read = tokio::time::timeout(delay, self.uplink.read(&mut buf)) => match read {
                        Ok(Ok(0)) => {
                            uplink_open = false;
                            0
                        }
                        Ok(Ok(n)) => n,
                        Ok(Err(e)) => return Err(e.into()),
                        Err(_) => 0,
                    },
                }
            } else if self.pause(delay).await {
                0
            } else {
                return Ok(());
            };

            let frame = UpstreamFrame::Data {
                ack: self.received,
                payload: buf[..n].to_vec(),
            };
            let name = self
                .ctx
                .codec
                .encode_upstream(self.session.id(), self.seq, &frame.encode())?;

            let reply = loop {
                match self.round_trip(&name).await {
                    Ok(reply) => break reply,
                    Err(e) => {
                        self.note_failure(&e)?;
                        debug!("Session {:04x} seq {} retry: {}", self.session.id(), self.seq, e);
                    }
                }
                if last_activity.elapsed() >= self.ctx.inactivity_timeout {
                    self.session.apply(SessionEvent::Inactive)?;
                    return Ok(());
                }
                if !self.pause(self.ctx.poll_interval).await {
                    return Ok(());
                }
            };
            self.malformed = 0;
            self.seq = self.seq.wrapping_add(1);

            let delta = reply.ack.wrapping_sub(self.acked);
            self.acked = reply.ack;
            if delta > 0 {
                if let Err(e) = self.session.stream().acknowledge(delta as usize) {
                    warn!("Session {:04x}: {}", self.session.id(), e);
                }
            }

            if !reply.payload.is_empty() {
                // Nobody reads downstream any more once the owner closed
                if !self.session.is_closing() {
                    tokio::select! {
                        written = self.downlink.write_all(&reply.payload) => written?,
                        _ = self.session.closing_token().cancelled() => {}
                    }
                }
                self.received = self.received.wrapping_add(reply.payload.len() as u32);
            }

            if reply.status == StreamStatus::Closed {
                self.session.apply(SessionEvent::RemoteClosed)?;
                return Ok(());
            }

            if self.session.is_closing() && self.session.stream().in_transit() == 0 {
                debug!("Session {:04x} drained, closing", self.session.id());
                self.send_close().await;
                self.session.finish();
                return Ok(());
            }

            if n > 0 || !reply.payload.is_empty() {
                last_activity = Instant::now();
                delay = Duration::ZERO;
            } else {
                if last_activity.elapsed() >= self.ctx.inactivity_timeout {
                    self.session.apply(SessionEvent::Inactive)?;
                    return Ok(());
                }
                delay = if delay.is_zero() {
                    self.ctx.poll_interval
                } else {
                    (delay * 2).min(self.ctx.poll_interval * MAX_BACKOFF_FACTOR)
                };
            }
        }
    }

    /// One query for `name`, decoded into a downstream frame
    async fn round_trip(&self, name: &str) -> Result<DownstreamFrame> {
        let query = DnsMessage::new_query(name, self.ctx.mode.query_type(), rand::random());
        let response = self.ctx.exchange.exchange(query).await?;

        let record = response
            .answers
            .iter()
            .filter(|r| r.name.eq_ignore_ascii_case(name))
            .find_map(DownstreamRecord::from_dns_record);

        let record = match record {
            Some(record) => record,
            None if response.header.rcode() != RCODE_NOERROR => {
                return Err(DnswayError::Exchange(format!(
                    "rcode {}",
                    response.header.rcode()
                )))
            }
            None => return Err(DnswayError::MalformedSegment("no tunnel answer".into())),
        };

        let payload = self.ctx.codec.decode_downstream(&record)?;
        DownstreamFrame::decode(&payload)
    }

    /// Count malformed replies; too many in a row is fatal
    fn note_failure(&mut self, error: &DnswayError) -> Result<()> {
        if !matches!(error, DnswayError::MalformedSegment(_)) {
            return Ok(());
        }
        self.malformed += 1;
        if self.malformed > MALFORMED_TOLERANCE {
            return Err(DnswayError::MalformedSegment(format!(
                "{} malformed replies in a row",
                self.malformed
            )));
        }
        Ok(())
    }

    /// Sleep unless the session is cancelled first; false when cancelled
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.session.cancel_token().cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Best-effort teardown notification, sent at most once
    async fn send_close(&mut self) {
        if self.close_sent || self.session.state() == SessionState::Draining {
            return;
        }
        self.close_sent = true;
        let frame = UpstreamFrame::Close.encode();
        let Ok(name) = self
            .ctx
            .codec
            .encode_upstream(self.session.id(), self.seq, &frame)
        else {
            return;
        };

        match tokio::time::timeout(CLOSE_TIMEOUT, self.round_trip(&name)).await {
            Ok(Ok(_)) => debug!("Session {:04x} close acknowledged", self.session.id()),
            Ok(Err(e)) => debug!("Session {:04x} close not acknowledged: {}", self.session.id(), e),
            Err(_) => debug!("Session {:04x} close timed out", self.session.id()),
        }
    }
}
