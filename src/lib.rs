//! dnsway: HTTP proxy over a DNS tunnel
//!
//! dnsway carries an arbitrary byte stream inside the query names and response records of
//! ordinary-looking DNS messages, so a client on a network that only permits DNS resolution
//! can still reach the wider Internet through a cooperating DNS responder.
//!
//! ## Features
//!
//! - **Loopback HTTP proxy**: CONNECT and absolute-URI requests, one tunnel session per connection
//! - **Reliable stream over DNS**: ordered, flow-controlled byte stream on stop-and-wait queries
//! - **Two downstream encodings**: CNAME targets (survive caching resolvers) or larger TXT records
//! - **One-time authorization**: sessions open only with a valid time-based code
//! - **Recursive relay**: a loopback stub resolver splitting tunnel and ordinary lookups
//!
//! ## Quick Start
//!
//! ```bash
//! # Responder side (authoritative for t.example.com, forwarding to a local HTTP proxy)
//! dnsway server --domain t.example.com --secret hunter2 --forward 127.0.0.1:3128
//!
//! # Client side (browser proxy on 127.0.0.1:8080)
//! dnsway client --domain t.example.com --secret hunter2 --port 8080
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌───────────┐   ┌─────────┐   ┌──────────────┐   ┌─────────┐
//! │ Application │──▶│   Proxy   │──▶│ Session │──▶│ Transmission │──▶│ Carrier │──▶ DNS query
//! │             │◀──│ Front-End │◀──│         │◀──│   Control    │◀──│         │◀── DNS response
//! └─────────────┘   └───────────┘   └─────────┘   └──────────────┘   └─────────┘
//! ```

pub mod carrier;
pub mod codec;
pub mod config;
pub mod dns;
pub mod frame;
pub mod otp;
pub mod proxy;
pub mod relay;
pub mod responder;
pub mod session;
pub mod transmission;

// Re-export core types
pub use carrier::{QueryExchange, UdpExchange};
pub use codec::{DownstreamMode, DownstreamRecord, SegmentCodec, UpstreamSegment};
pub use config::{ClientConfig, DnswayConfig, ServerConfig, TunnelConfig};
pub use otp::OtpAuthorizer;
pub use proxy::ProxyFrontEnd;
pub use relay::{QueryHandler, RecursiveRelay, TunnelGuard};
pub use responder::{AcceptedSession, SessionAcceptor, TunnelResponder};
pub use session::{Session, SessionEvent, SessionId, SessionState, SessionTable, TunnelContext};
pub use transmission::{SegmentLimits, TransmissionControl};

/// dnsway error types
#[derive(Debug, thiserror::Error)]
pub enum DnswayError {
    /// Bad encoding, wrong length or unparsable session/sequence label
    #[error("Malformed segment: {0}")]
    MalformedSegment(String),

    /// One-time code did not verify
    #[error("Authorization failed")]
    AuthorizationFailed,

    /// More bytes acknowledged than were ever in transit
    #[error("Flow control exceeded: {acknowledged} bytes acknowledged, {in_transit} in transit")]
    FlowControlExceeded { acknowledged: usize, in_transit: usize },

    /// The stream or its transport has been closed
    #[error("Transport closed")]
    TransportClosed,

    /// Payload larger than the selected encoding can carry
    #[error("Codec capacity exceeded: {len} bytes (max: {max})")]
    CodecCapacityExceeded { len: usize, max: usize },

    /// Session state machine rejected an event
    #[error("Invalid session transition: {event:?} in state {state:?}")]
    InvalidTransition {
        state: SessionState,
        event: SessionEvent,
    },

    /// DNS query/response exchange failed
    #[error("DNS exchange failed: {0}")]
    Exchange(String),

    /// DNS message could not be parsed
    #[error("Invalid DNS message: {0}")]
    InvalidMessage(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DnswayError>;

impl DnswayError {
    /// Whether this error means the stream ended rather than failed
    pub fn is_closed(&self) -> bool {
        match self {
            Self::TransportClosed => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
