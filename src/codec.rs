//! Segment codec
//!
//! Converts tunnel segments to DNS-safe wire forms and back.
//!
//! Upstream segments ride in query names:
//!
//! ```text
//! <base32 labels>.<session id: 4 hex>.<seq: 8 hex>.<tunnel domain>
//! ```
//!
//! Downstream segments ride either in a CNAME target (`<base32 labels>.<tunnel domain>`),
//! which survives caching resolvers, or in TXT character-strings holding base64, which carry
//! several times more per response.

use crate::dns::{DnsRecord, RData, RecordType, MAX_LABEL_LEN, MAX_NAME_LEN};
use crate::session::SessionId;
use crate::{DnswayError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use data_encoding::BASE32_DNSSEC;
use serde::{Deserialize, Serialize};

/// Characters of TXT text per response; keeps a maximal response under the EDNS0 payload
pub const TXT_TEXT_BUDGET: usize = 880;

/// Maximum length of one TXT character-string
const TXT_STRING_LEN: usize = 255;

/// Label lengths of the session id and sequence number labels
const SESSION_LABEL_LEN: usize = 4;
const SEQ_LABEL_LEN: usize = 8;

/// How downstream segments are represented in responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownstreamMode {
    /// CNAME target under the tunnel domain (A queries)
    #[default]
    Alias,
    /// TXT record strings (TXT queries)
    Text,
}

impl DownstreamMode {
    /// Query type the client asks with in this mode
    pub fn query_type(self) -> RecordType {
        match self {
            Self::Alias => RecordType::A,
            Self::Text => RecordType::Txt,
        }
    }

    /// Mode a responder answers in for a given query type
    pub fn for_query_type(qtype: u16) -> Self {
        if qtype == RecordType::Txt as u16 {
            Self::Text
        } else {
            Self::Alias
        }
    }
}

/// Segment direction, used to look up capacities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upstream,
    Downstream(DownstreamMode),
}

/// A decoded upstream query name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSegment {
    pub session_id: SessionId,
    pub seq: u32,
    pub payload: Vec<u8>,
}

/// Wire form of a downstream segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownstreamRecord {
    /// Fully qualified CNAME target
    Alias(String),
    /// TXT character-strings
    Text(Vec<String>),
}

impl DownstreamRecord {
    /// Build the answer record for a query name
    pub fn to_dns_record(&self, owner: &str, ttl: u32) -> DnsRecord {
        match self {
            Self::Alias(target) => DnsRecord::new_cname(owner, target, ttl),
            Self::Text(strings) => DnsRecord::new_txt(
                owner,
                strings.iter().map(|s| s.as_bytes().to_vec()).collect(),
                ttl,
            ),
        }
    }

    /// Pick the downstream segment out of an answer record
    pub fn from_dns_record(record: &DnsRecord) -> Option<Self> {
        match &record.rdata {
            RData::Cname(target) => Some(Self::Alias(target.clone())),
            RData::Txt(strings) => Some(Self::Text(
                strings
                    .iter()
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .collect(),
            )),
            RData::Raw(_) => None,
        }
    }
}

/// Encoder/decoder bound to one tunnel domain
#[derive(Debug, Clone)]
pub struct SegmentCodec {
    /// Lowercase, no trailing dot
    domain: String,
}

impl SegmentCodec {
    /// Create a codec for a tunnel domain (e.g. "t.example.com")
    pub fn new(domain: &str) -> Result<Self> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();

        if domain.is_empty() {
            return Err(DnswayError::InvalidConfig("Tunnel domain is empty".into()));
        }

        for label in domain.split('.') {
            let valid = !label.is_empty()
                && label.len() <= MAX_LABEL_LEN
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-');
            if !valid {
                return Err(DnswayError::InvalidConfig(format!(
                    "Invalid label {:?} in tunnel domain",
                    label
                )));
            }
        }

        let codec = Self { domain };
        if codec.capacity(Direction::Upstream) < 16 {
            return Err(DnswayError::InvalidConfig(format!(
                "Tunnel domain {} too long to leave room for payload",
                codec.domain
            )));
        }

        Ok(codec)
    }

    /// The normalized tunnel domain
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Maximum payload bytes one segment can carry in a direction
    pub fn capacity(&self, direction: Direction) -> usize {
        match direction {
            Direction::Upstream => {
                // data labels + ".sid.seq." + domain
                let fixed = SESSION_LABEL_LEN + 1 + SEQ_LABEL_LEN + 1 + 1 + self.domain.len();
                let chars = label_chars(MAX_NAME_LEN.saturating_sub(fixed));
                chars * 5 / 8
            }
            Direction::Downstream(DownstreamMode::Alias) => {
                let chars = label_chars(MAX_NAME_LEN.saturating_sub(self.domain.len() + 1));
                chars * 5 / 8
            }
            Direction::Downstream(DownstreamMode::Text) => TXT_TEXT_BUDGET / 4 * 3,
        }
    }

    /// Whether a query name belongs to the tunnel domain
    pub fn is_tunnel_name(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.');
        self.strip_domain(&name.to_ascii_lowercase()).is_some()
    }

    /// Encode an upstream segment into a query name
    pub fn encode_upstream(&self, session_id: SessionId, seq: u32, payload: &[u8]) -> Result<String> {
        let max = self.capacity(Direction::Upstream);
        if payload.len() > max {
            return Err(DnswayError::CodecCapacityExceeded {
                len: payload.len(),
                max,
            });
        }

        let mut name = String::with_capacity(MAX_NAME_LEN);
        let encoded = BASE32_DNSSEC.encode(payload);
        for label in split_labels(&encoded) {
            name.push_str(label);
            name.push('.');
        }
        name.push_str(&hex::encode(session_id.to_be_bytes()));
        name.push('.');
        name.push_str(&hex::encode(seq.to_be_bytes()));
        name.push('.');
        name.push_str(&self.domain);

        debug_assert!(name.len() <= MAX_NAME_LEN);
        Ok(name)
    }

    /// Decode a query name back into an upstream segment
    pub fn decode_upstream(&self, name: &str) -> Result<UpstreamSegment> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        if name.len() > MAX_NAME_LEN {
            return Err(malformed(format!("name is {} characters", name.len())));
        }

        let prefix = self
            .strip_domain(&name)
            .ok_or_else(|| malformed("name outside tunnel domain"))?;

        let mut labels: Vec<&str> = prefix.split('.').collect();
        if prefix.is_empty() || labels.len() < 2 {
            return Err(malformed("missing session or sequence label"));
        }

        let seq_label = labels.pop().unwrap_or_default();
        let session_label = labels.pop().unwrap_or_default();

        let session_id = parse_hex_label::<2>(session_label, SESSION_LABEL_LEN)
            .map(u16::from_be_bytes)
            .ok_or_else(|| malformed(format!("bad session label {:?}", session_label)))?;
        let seq = parse_hex_label::<4>(seq_label, SEQ_LABEL_LEN)
            .map(u32::from_be_bytes)
            .ok_or_else(|| malformed(format!("bad sequence label {:?}", seq_label)))?;

        let payload = decode_base32_labels(&labels)?;
        let max = self.capacity(Direction::Upstream);
        if payload.len() > max {
            return Err(malformed(format!("{} bytes exceeds {}", payload.len(), max)));
        }

        Ok(UpstreamSegment {
            session_id,
            seq,
            payload,
        })
    }

    /// Encode a downstream segment for the selected response representation
    pub fn encode_downstream(&self, mode: DownstreamMode, payload: &[u8]) -> Result<DownstreamRecord> {
        let max = self.capacity(Direction::Downstream(mode));
        if payload.len() > max {
            return Err(DnswayError::CodecCapacityExceeded {
                len: payload.len(),
                max,
            });
        }

        match mode {
            DownstreamMode::Alias => {
                let encoded = BASE32_DNSSEC.encode(payload);
                let mut target = String::with_capacity(MAX_NAME_LEN);
                for label in split_labels(&encoded) {
                    target.push_str(label);
                    target.push('.');
                }
                target.push_str(&self.domain);
                Ok(DownstreamRecord::Alias(target))
            }
            DownstreamMode::Text => {
                let encoded = BASE64.encode(payload);
                // base64 output is ASCII, so byte chunks are valid strings
                let strings = if encoded.is_empty() {
                    vec![String::new()]
                } else {
                    encoded
                        .as_bytes()
                        .chunks(TXT_STRING_LEN)
                        .map(|c| String::from_utf8_lossy(c).into_owned())
                        .collect()
                };
                Ok(DownstreamRecord::Text(strings))
            }
        }
    }

    /// Decode a downstream record back into segment bytes
    pub fn decode_downstream(&self, record: &DownstreamRecord) -> Result<Vec<u8>> {
        let (payload, mode) = match record {
            DownstreamRecord::Alias(target) => {
                let target = target.trim_end_matches('.').to_ascii_lowercase();
                let prefix = self
                    .strip_domain(&target)
                    .ok_or_else(|| malformed("alias target outside tunnel domain"))?;
                let labels: Vec<&str> = if prefix.is_empty() {
                    Vec::new()
                } else {
                    prefix.split('.').collect()
                };
                (decode_base32_labels(&labels)?, DownstreamMode::Alias)
            }
            DownstreamRecord::Text(strings) => {
                if strings.iter().any(|s| s.len() > TXT_STRING_LEN) {
                    return Err(malformed("TXT string longer than 255"));
                }
                let text: String = strings.concat();
                let payload = BASE64
                    .decode(text.as_bytes())
                    .map_err(|e| malformed(format!("base64: {}", e)))?;
                (payload, DownstreamMode::Text)
            }
        };

        let max = self.capacity(Direction::Downstream(mode));
        if payload.len() > max {
            return Err(malformed(format!("{} bytes exceeds {}", payload.len(), max)));
        }
        Ok(payload)
    }

    /// Labels in front of the tunnel domain; `Some("")` for the domain itself
    fn strip_domain<'a>(&self, name: &'a str) -> Option<&'a str> {
        if name == self.domain {
            return Some("");
        }
        name.strip_suffix(self.domain.as_str())
            .and_then(|rest| rest.strip_suffix('.'))
    }
}

fn malformed(reason: impl Into<String>) -> DnswayError {
    DnswayError::MalformedSegment(reason.into())
}

/// Characters of label data that fit into `avail` name characters, one dot per label
fn label_chars(avail: usize) -> usize {
    avail - avail.div_ceil(MAX_LABEL_LEN + 1)
}

/// Split encoded text into label-sized pieces
fn split_labels(encoded: &str) -> impl Iterator<Item = &str> {
    // base32 output is ASCII, so byte offsets are char boundaries
    (0..encoded.len())
        .step_by(MAX_LABEL_LEN)
        .map(move |start| &encoded[start..(start + MAX_LABEL_LEN).min(encoded.len())])
}

fn parse_hex_label<const N: usize>(label: &str, expected_len: usize) -> Option<[u8; N]> {
    if label.len() != expected_len {
        return None;
    }
    hex::decode(label).ok()?.try_into().ok()
}

fn decode_base32_labels(labels: &[&str]) -> Result<Vec<u8>> {
    let mut encoded = String::new();
    for label in labels {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(malformed(format!("bad label length {}", label.len())));
        }
        encoded.push_str(label);
    }

    BASE32_DNSSEC
        .decode(encoded.as_bytes())
        .map_err(|e| malformed(format!("base32: {}", e)))
}
