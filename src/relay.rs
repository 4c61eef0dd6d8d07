//! Recursive DNS relay
//!
//! A loopback stub resolver. Queries under the tunnel domain are answered by a
//! [`QueryHandler`]; everything else is forwarded byte-for-byte to an upstream resolver and
//! the reply relayed unmodified.

use crate::carrier::udp_round_trip;
use crate::codec::SegmentCodec;
use crate::dns::{
    peek_query, DnsMessage, DnsQuestion, DnsRecord, RCODE_NOERROR, RCODE_NXDOMAIN, RCODE_REFUSED,
    RCODE_SERVFAIL,
};
use crate::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Resolver used when nothing usable is configured on the system
pub const FALLBACK_RESOLVER: &str = "8.8.8.8:53";

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Largest query accepted from local clients
const MAX_QUERY_LEN: usize = 4096;

/// Answers queries under the tunnel domain
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Record to answer with, or None for "not mine"
    async fn answer(&self, question: &DnsQuestion) -> Option<DnsRecord>;
}

/// Build the response to a query from a handler's answer
///
/// None from the handler is answered NXDOMAIN.
pub async fn answer_locally(handler: &dyn QueryHandler, query: &DnsMessage) -> DnsMessage {
    let Some(question) = query.question() else {
        return query.response(RCODE_NXDOMAIN);
    };

    match handler.answer(question).await {
        Some(record) => {
            let mut response = query.response(RCODE_NOERROR);
            response.push_answer(record);
            response
        }
        None => query.response(RCODE_NXDOMAIN),
    }
}

/// Client-side handler: local applications never see tunnel names resolve
pub struct TunnelGuard {
    codec: Arc<SegmentCodec>,
}

impl TunnelGuard {
    pub fn new(codec: Arc<SegmentCodec>) -> Self {
        Self { codec }
    }
}

#[async_trait]
impl QueryHandler for TunnelGuard {
    async fn answer(&self, question: &DnsQuestion) -> Option<DnsRecord> {
        match self.codec.decode_upstream(&question.qname) {
            Ok(segment) => debug!(
                "Local lookup of tunnel segment (session {:04x}, seq {}) refused",
                segment.session_id, segment.seq
            ),
            Err(e) => debug!("Local lookup of {} refused: {}", question.qname, e),
        }
        None
    }
}

pub struct RecursiveRelay {
    codec: Arc<SegmentCodec>,
    handler: Arc<dyn QueryHandler>,
    upstream: Option<SocketAddr>,
    timeout: Duration,
}

impl RecursiveRelay {
    pub fn new(
        codec: Arc<SegmentCodec>,
        handler: Arc<dyn QueryHandler>,
        upstream: Option<SocketAddr>,
        timeout: Duration,
    ) -> Self {
        Self {
            codec,
            handler,
            upstream,
            timeout,
        }
    }

    pub fn upstream(&self) -> Option<SocketAddr> {
        self.upstream
    }

    /// Serve queries arriving on `socket` until cancelled
    pub async fn serve(self: Arc<Self>, socket: UdpSocket, cancel: CancellationToken) -> Result<()> {
        let socket = Arc::new(socket);
        info!(
            "DNS relay listening on {} (upstream: {})",
            socket.local_addr()?,
            self.upstream
                .map(|u| u.to_string())
                .unwrap_or_else(|| "none".into())
        );

        let mut buf = vec![0u8; MAX_QUERY_LEN];
        loop {
            let (n, peer) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("DNS relay stopped");
                    return Ok(());
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP port unreachable from an earlier reply surfaces here
                        warn!("DNS relay receive failed: {}", e);
                        continue;
                    }
                },
            };

            let packet = buf[..n].to_vec();
            let relay = Arc::clone(&self);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                if let Some(reply) = relay.process(&packet).await {
                    if let Err(e) = socket.send_to(&reply, peer).await {
                        error!("DNS relay reply to {} failed: {}", peer, e);
                    }
                }
            });
        }
    }

    /// Response bytes for one query packet; None drops it
    ///
    /// Only tunnel names need a full parse. Anything else is forwarded as received, even
    /// when it uses features the local parser does not understand.
    pub async fn process(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let Some((header, qname)) = peek_query(packet) else {
            debug!("Dropping {}-byte datagram without a DNS header", packet.len());
            return None;
        };
        if header.is_response() {
            return None;
        }

        if qname.is_some_and(|name| self.codec.is_tunnel_name(&name)) {
            return match DnsMessage::parse(packet) {
                Ok(query) => Some(answer_locally(self.handler.as_ref(), &query).await.to_bytes()),
                Err(e) => {
                    debug!("Dropping unparsable tunnel query: {}", e);
                    None
                }
            };
        }

        let Some(upstream) = self.upstream else {
            return DnsMessage::parse(packet)
                .ok()
                .map(|query| query.response(RCODE_REFUSED).to_bytes());
        };

        match udp_round_trip(packet, upstream, self.timeout).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!("Forwarding to {} failed: {}", upstream, e);
                DnsMessage::parse(packet)
                    .ok()
                    .map(|query| query.response(RCODE_SERVFAIL).to_bytes())
            }
        }
    }
}

/// First usable nameserver of the system configuration, or the public fallback
pub async fn detect_system_resolver() -> SocketAddr {
    let detected = match tokio::fs::read_to_string(RESOLV_CONF).await {
        Ok(contents) => parse_resolv_conf(&contents),
        Err(e) => {
            debug!("Cannot read {}: {}", RESOLV_CONF, e);
            None
        }
    };

    detected.unwrap_or_else(|| {
        info!("No usable system resolver, using {}", FALLBACK_RESOLVER);
        ([8, 8, 8, 8], 53).into()
    })
}

/// First non-loopback `nameserver` entry
pub fn parse_resolv_conf(contents: &str) -> Option<SocketAddr> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(addr)) => {
                    // Drop a zone index such as fe80::1%eth0
                    addr.split('%').next()?.parse::<IpAddr>().ok()
                }
                _ => None,
            }
        })
        .find(|ip| !ip.is_loopback())
        .map(|ip| SocketAddr::new(ip, 53))
}
