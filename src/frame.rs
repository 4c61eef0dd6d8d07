//! Session frames carried inside tunnel segments
//!
//! Upstream (client to responder):
//!
//! ```text
//! Open:  [0x01][code: u32][max downstream segment: u16]
//! Data:  [0x02][downstream ack: u32][payload...]   (empty payload = poll)
//! Close: [0x03]
//! ```
//!
//! Downstream (responder to client):
//!
//! ```text
//! [status: u8][upstream ack: u32][payload...]
//! ```
//!
//! All integers are big-endian. Acks are cumulative byte counts modulo 2^32.

use crate::{DnswayError, Result};
use bytes::{Buf, BufMut, BytesMut};

const TAG_OPEN: u8 = 0x01;
const TAG_DATA: u8 = 0x02;
const TAG_CLOSE: u8 = 0x03;

const STATUS_OPEN: u8 = 0x00;
const STATUS_CLOSED: u8 = 0x01;

/// Bytes in front of the payload of an upstream Data frame
pub const UPSTREAM_HEADER_LEN: usize = 5;

/// Bytes in front of the payload of a downstream frame
pub const DOWNSTREAM_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFrame {
    /// Session establishment, authorized by a one-time code
    Open { code: u32, max_downstream: u16 },
    /// Stream bytes plus the downstream bytes received so far
    Data { ack: u32, payload: Vec<u8> },
    /// Client is done with the session
    Close,
}

impl UpstreamFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match self {
            Self::Open {
                code,
                max_downstream,
            } => {
                buf.put_u8(TAG_OPEN);
                buf.put_u32(*code);
                buf.put_u16(*max_downstream);
            }
            Self::Data { ack, payload } => {
                buf.put_u8(TAG_DATA);
                buf.put_u32(*ack);
                buf.put_slice(payload);
            }
            Self::Close => buf.put_u8(TAG_CLOSE),
        }
        buf.to_vec()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(DnswayError::MalformedSegment("empty frame".into()));
        }

        match data.get_u8() {
            TAG_OPEN => {
                if data.len() != 6 {
                    return Err(DnswayError::MalformedSegment(format!(
                        "open frame body is {} bytes",
                        data.len()
                    )));
                }
                Ok(Self::Open {
                    code: data.get_u32(),
                    max_downstream: data.get_u16(),
                })
            }
            TAG_DATA => {
                if data.len() < 4 {
                    return Err(DnswayError::MalformedSegment("truncated data frame".into()));
                }
                let ack = data.get_u32();
                Ok(Self::Data {
                    ack,
                    payload: data.to_vec(),
                })
            }
            TAG_CLOSE if data.is_empty() => Ok(Self::Close),
            tag => Err(DnswayError::MalformedSegment(format!(
                "unknown frame tag 0x{:02x}",
                tag
            ))),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Open { .. } => 7,
            Self::Data { payload, .. } => UPSTREAM_HEADER_LEN + payload.len(),
            Self::Close => 1,
        }
    }
}

/// Whether the responder end of the stream is still open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamFrame {
    pub status: StreamStatus,
    /// Upstream payload bytes accepted so far
    pub ack: u32,
    pub payload: Vec<u8>,
}

impl DownstreamFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(DOWNSTREAM_HEADER_LEN + self.payload.len());
        buf.put_u8(match self.status {
            StreamStatus::Open => STATUS_OPEN,
            StreamStatus::Closed => STATUS_CLOSED,
        });
        buf.put_u32(self.ack);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < DOWNSTREAM_HEADER_LEN {
            return Err(DnswayError::MalformedSegment(format!(
                "downstream frame is {} bytes",
                data.len()
            )));
        }

        let status = match data.get_u8() {
            STATUS_OPEN => StreamStatus::Open,
            STATUS_CLOSED => StreamStatus::Closed,
            other => {
                return Err(DnswayError::MalformedSegment(format!(
                    "unknown stream status 0x{:02x}",
                    other
                )))
            }
        };
        let ack = data.get_u32();

        Ok(Self {
            status,
            ack,
            payload: data.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_layout() {
        let frame = UpstreamFrame::Open {
            code: 123456,
            max_downstream: 660,
        };
        let bytes = frame.encode();
        assert_eq!(bytes, vec![0x01, 0x00, 0x01, 0xe2, 0x40, 0x02, 0x94]);
        assert_eq!(bytes.len(), frame.encoded_len());
        assert_eq!(UpstreamFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_data_and_poll() {
        let poll = UpstreamFrame::Data {
            ack: 7,
            payload: vec![],
        };
        assert_eq!(poll.encode().len(), UPSTREAM_HEADER_LEN);
        assert_eq!(UpstreamFrame::decode(&poll.encode()).unwrap(), poll);

        let data = UpstreamFrame::Data {
            ack: u32::MAX,
            payload: b"GET / HTTP/1.1".to_vec(),
        };
        assert_eq!(UpstreamFrame::decode(&data.encode()).unwrap(), data);
    }

    #[test]
    fn test_bad_upstream_frames() {
        for bad in [&[][..], &[0x01, 0, 0], &[0x02, 0, 0, 0], &[0x03, 0], &[0x7f]] {
            assert!(matches!(
                UpstreamFrame::decode(bad),
                Err(DnswayError::MalformedSegment(_))
            ));
        }
    }

    #[test]
    fn test_downstream_frame() {
        let frame = DownstreamFrame {
            status: StreamStatus::Closed,
            ack: 0x01020304,
            payload: b"bye".to_vec(),
        };
        let bytes = frame.encode();
        assert_eq!(&bytes[..5], &[0x01, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(DownstreamFrame::decode(&bytes).unwrap(), frame);

        assert!(DownstreamFrame::decode(&[0x00, 0, 0]).is_err());
        assert!(DownstreamFrame::decode(&[0x09, 0, 0, 0, 0]).is_err());
    }
}
