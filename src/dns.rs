//! Minimal DNS message model
//!
//! Implements just enough of RFC 1035 (plus the EDNS0 OPT pseudo-record) to:
//! - Build tunnel queries (A/TXT) and parse their answers (CNAME/TXT)
//! - Parse arbitrary queries far enough to route them by question name
//! - Build authoritative responses and error responses (NXDOMAIN, REFUSED)

use crate::{DnswayError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;

/// Maximum DNS label length (RFC 1035)
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum DNS name length in text form, without the trailing dot (RFC 1035)
pub const MAX_NAME_LEN: usize = 253;

/// UDP payload size advertised in EDNS0 (DNS flag day 2020 recommendation)
pub const EDNS_UDP_PAYLOAD: u16 = 1232;

/// Maximum pointer hops followed while reading a compressed name
const MAX_POINTER_HOPS: usize = 16;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_REFUSED: u8 = 5;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;

/// Resource record types used by the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RecordType {
    A = 1,
    Cname = 5,
    Txt = 16,
    Opt = 41,
}

/// Record class IN
pub const CLASS_IN: u16 = 1;

/// DNS message header (12 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,      // Transaction ID
    pub flags: u16,   // Flags
    pub qdcount: u16, // Question count
    pub ancount: u16, // Answer count
    pub nscount: u16, // Authority count
    pub arcount: u16, // Additional count
}

impl DnsHeader {
    /// Create a new query header
    pub fn new_query(id: u16) -> Self {
        Self {
            id,
            flags: FLAG_RD, // Standard query, recursion desired
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    /// Parse header from bytes
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        if buf.remaining() < 12 {
            return Err(DnswayError::InvalidMessage("Header too short".into()));
        }

        Ok(Self {
            id: buf.get_u16(),
            flags: buf.get_u16(),
            qdcount: buf.get_u16(),
            ancount: buf.get_u16(),
            nscount: buf.get_u16(),
            arcount: buf.get_u16(),
        })
    }

    /// Write header to buffer
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.id);
        buf.put_u16(self.flags);
        buf.put_u16(self.qdcount);
        buf.put_u16(self.ancount);
        buf.put_u16(self.nscount);
        buf.put_u16(self.arcount);
    }

    /// Check if this is a response
    pub fn is_response(&self) -> bool {
        (self.flags & FLAG_QR) != 0
    }

    /// Response code (low four bits of the flags)
    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000f) as u8
    }
}

/// DNS question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn new(qname: &str, qtype: RecordType) -> Self {
        Self {
            qname: qname.to_string(),
            qtype: qtype as u16,
            qclass: CLASS_IN,
        }
    }

    /// Parse question from bytes
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let qname = read_name(buf)?;

        if buf.remaining() < 4 {
            return Err(DnswayError::InvalidMessage("Question too short".into()));
        }

        Ok(Self {
            qname,
            qtype: buf.get_u16(),
            qclass: buf.get_u16(),
        })
    }

    /// Write question to buffer
    pub fn write(&self, buf: &mut BytesMut) {
        write_name(&self.qname, buf);
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);
    }
}

/// Record data, decoded for the types the tunnel reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    Cname(String),
    /// TXT character-strings, each at most 255 bytes
    Txt(Vec<Vec<u8>>),
    Raw(Vec<u8>),
}

/// DNS resource record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: RData,
}

impl DnsRecord {
    /// Create a CNAME record
    pub fn new_cname(name: &str, target: &str, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: RecordType::Cname as u16,
            rclass: CLASS_IN,
            ttl,
            rdata: RData::Cname(target.to_string()),
        }
    }

    /// Create a TXT record from its character-strings
    pub fn new_txt(name: &str, strings: Vec<Vec<u8>>, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: RecordType::Txt as u16,
            rclass: CLASS_IN,
            ttl,
            rdata: RData::Txt(strings),
        }
    }

    /// Create an EDNS0 OPT pseudo-record advertising a UDP payload size
    pub fn new_opt(udp_payload: u16) -> Self {
        Self {
            name: String::new(),
            rtype: RecordType::Opt as u16,
            rclass: udp_payload,
            ttl: 0,
            rdata: RData::Raw(Vec::new()),
        }
    }

    /// Parse record from bytes
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let name = read_name(buf)?;

        if buf.remaining() < 10 {
            return Err(DnswayError::InvalidMessage("Record too short".into()));
        }

        let rtype = buf.get_u16();
        let rclass = buf.get_u16();
        let ttl = buf.get_u32();
        let rdlen = buf.get_u16() as usize;

        if buf.remaining() < rdlen {
            return Err(DnswayError::InvalidMessage("Truncated record data".into()));
        }

        let rdata_end = buf.position() as usize + rdlen;
        let rdata = if rtype == RecordType::Cname as u16 {
            // CNAME targets may be compressed against the whole message
            let target = read_name(buf)?;
            if buf.position() as usize != rdata_end {
                return Err(DnswayError::InvalidMessage("CNAME length mismatch".into()));
            }
            RData::Cname(target)
        } else if rtype == RecordType::Txt as u16 {
            let mut raw = vec![0u8; rdlen];
            buf.copy_to_slice(&mut raw);
            RData::Txt(parse_character_strings(&raw)?)
        } else {
            let mut raw = vec![0u8; rdlen];
            buf.copy_to_slice(&mut raw);
            RData::Raw(raw)
        };

        Ok(Self {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        })
    }

    /// Write record to buffer
    pub fn write(&self, buf: &mut BytesMut) {
        write_name(&self.name, buf);
        self.write_body(buf);
    }

    /// Everything after the owner name
    fn write_body(&self, buf: &mut BytesMut) {
        buf.put_u16(self.rtype);
        buf.put_u16(self.rclass);
        buf.put_u32(self.ttl);

        let mut rdata = BytesMut::new();
        match &self.rdata {
            RData::Cname(target) => write_name(target, &mut rdata),
            RData::Txt(strings) => {
                for s in strings {
                    rdata.put_u8(s.len() as u8);
                    rdata.put_slice(s);
                }
            }
            RData::Raw(raw) => rdata.put_slice(raw),
        }

        buf.put_u16(rdata.len() as u16);
        buf.put_slice(&rdata);
    }
}

/// DNS message (complete query or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl DnsMessage {
    /// Create a recursive query for one name, advertising EDNS0
    pub fn new_query(name: &str, qtype: RecordType, id: u16) -> Self {
        let mut header = DnsHeader::new_query(id);
        header.arcount = 1;
        Self {
            header,
            questions: vec![DnsQuestion::new(name, qtype)],
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: vec![DnsRecord::new_opt(EDNS_UDP_PAYLOAD)],
        }
    }

    /// Start a response to this query: same id and question, QR/AA/RA set, RD echoed
    pub fn response(&self, rcode: u8) -> Self {
        let flags = FLAG_QR
            | FLAG_AA
            | FLAG_RA
            | (self.header.flags & (FLAG_RD | 0x7800))
            | (rcode as u16 & 0x000f);
        let additionals = if self.has_edns() {
            vec![DnsRecord::new_opt(EDNS_UDP_PAYLOAD)]
        } else {
            Vec::new()
        };
        let mut header = DnsHeader {
            id: self.header.id,
            flags,
            qdcount: self.questions.len() as u16,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        };
        header.arcount = additionals.len() as u16;
        Self {
            header,
            questions: self.questions.clone(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals,
        }
    }

    /// Add an answer record, keeping ANCOUNT in step
    pub fn push_answer(&mut self, record: DnsRecord) {
        self.answers.push(record);
        self.header.ancount = self.answers.len() as u16;
    }

    /// Parse DNS message from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let header = DnsHeader::parse(&mut cursor)?;

        let mut questions = Vec::new();
        for _ in 0..header.qdcount {
            questions.push(DnsQuestion::parse(&mut cursor)?);
        }

        let mut sections: [Vec<DnsRecord>; 3] = Default::default();
        let counts = [header.ancount, header.nscount, header.arcount];
        for (section, count) in sections.iter_mut().zip(counts) {
            for _ in 0..count {
                section.push(DnsRecord::parse(&mut cursor)?);
            }
        }
        let [answers, authorities, additionals] = sections;

        Ok(Self {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Serialize DNS message to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(512);

        self.header.write(&mut buf);

        for q in &self.questions {
            q.write(&mut buf);
        }

        // Owners equal to the question name point back at it (offset 12, right after the header)
        let qname = self.question().map(|q| q.qname.as_str()).unwrap_or("");
        for r in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            if !qname.is_empty() && r.name.eq_ignore_ascii_case(qname) {
                buf.put_u16(0xC00C);
                r.write_body(&mut buf);
            } else {
                r.write(&mut buf);
            }
        }

        buf.to_vec()
    }

    /// Get the first question, if any
    pub fn question(&self) -> Option<&DnsQuestion> {
        self.questions.first()
    }

    /// Whether the message carries an EDNS0 OPT record
    pub fn has_edns(&self) -> bool {
        self.additionals
            .iter()
            .any(|r| r.rtype == RecordType::Opt as u16)
    }
}

/// Split TXT RDATA into its length-prefixed character-strings
fn parse_character_strings(raw: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut strings = Vec::new();
    let mut cursor = Cursor::new(raw);

    while cursor.has_remaining() {
        let len = cursor.get_u8() as usize;
        if cursor.remaining() < len {
            return Err(DnswayError::InvalidMessage("Truncated TXT data".into()));
        }
        let mut chunk = vec![0u8; len];
        cursor.copy_to_slice(&mut chunk);
        strings.push(chunk);
    }

    Ok(strings)
}

/// Header and first question name of a query, for messages the full parser may reject
///
/// Labels that are not UTF-8 are decoded lossily.
pub fn peek_query(data: &[u8]) -> Option<(DnsHeader, Option<String>)> {
    let mut cursor = Cursor::new(data);
    let header = DnsHeader::parse(&mut cursor).ok()?;
    let qname = if header.qdcount > 0 {
        read_labels(&mut cursor, true).ok()
    } else {
        None
    };
    Some((header, qname))
}

/// Read a domain name, following compression pointers
fn read_name(buf: &mut Cursor<&[u8]>) -> Result<String> {
    read_labels(buf, false)
}

fn read_labels(buf: &mut Cursor<&[u8]>, lossy: bool) -> Result<String> {
    let data: &[u8] = *buf.get_ref();
    let mut labels = Vec::new();
    let mut pos = buf.position() as usize;
    // Where the cursor resumes once the first pointer has been followed
    let mut resume_at: Option<usize> = None;
    let mut hops = 0;

    loop {
        let len = *data
            .get(pos)
            .ok_or_else(|| DnswayError::InvalidMessage("Truncated domain name".into()))?;

        if len == 0 {
            pos += 1;
            break;
        }

        if (len & 0xC0) == 0xC0 {
            let low = *data
                .get(pos + 1)
                .ok_or_else(|| DnswayError::InvalidMessage("Truncated pointer".into()))?;
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(DnswayError::InvalidMessage("Pointer loop".into()));
            }
            resume_at.get_or_insert(pos + 2);
            pos = (((len & 0x3F) as usize) << 8) | low as usize;
            continue;
        }

        if (len & 0xC0) != 0 {
            return Err(DnswayError::InvalidMessage("Unsupported label type".into()));
        }

        let start = pos + 1;
        let end = start + len as usize;
        let label = data
            .get(start..end)
            .ok_or_else(|| DnswayError::InvalidMessage("Truncated label".into()))?;

        let label = if lossy {
            String::from_utf8_lossy(label).into_owned()
        } else {
            String::from_utf8(label.to_vec())
                .map_err(|_| DnswayError::InvalidMessage("Invalid UTF-8 in domain name".into()))?
        };
        labels.push(label);
        pos = end;

        if labels.len() > 127 {
            return Err(DnswayError::InvalidMessage("Too many labels".into()));
        }
    }

    buf.set_position(resume_at.unwrap_or(pos) as u64);
    Ok(labels.join("."))
}

/// Write a domain name (uncompressed)
fn write_name(domain: &str, buf: &mut BytesMut) {
    for label in domain.split('.').filter(|l| !l.is_empty()) {
        let bytes = label.as_bytes();
        buf.put_u8(bytes.len() as u8);
        buf.put_slice(bytes);
    }
    buf.put_u8(0); // End of name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_query_tolerates_binary_labels() {
        let mut packet = vec![0x42, 0x42, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(b"\x03\xff\xfe\xfd\x07example\x03org\x00\x00\x01\x00\x01");
        assert!(DnsMessage::parse(&packet).is_err());

        let (header, qname) = peek_query(&packet).unwrap();
        assert_eq!(header.id, 0x4242);
        let qname = qname.unwrap();
        assert!(qname.ends_with(".example.org"));

        assert!(peek_query(&packet[..8]).is_none());
        let query = DnsMessage::new_query("a.t.example.com", RecordType::A, 1).to_bytes();
        assert_eq!(peek_query(&query).unwrap().1.as_deref(), Some("a.t.example.com"));
    }

    #[test]
    fn test_dns_query_construction() {
        let msg = DnsMessage::new_query("tunnel.example.com", RecordType::Txt, 0x1234);
        let bytes = msg.to_bytes();

        assert!(bytes.len() > 12);
        assert_eq!(&bytes[0..2], &[0x12, 0x34]); // Transaction ID

        let parsed = DnsMessage::parse(&bytes).unwrap();
        assert_eq!(parsed, msg);
        assert!(parsed.has_edns());
        assert!(!parsed.header.is_response());
    }

    #[test]
    fn test_response_carries_question_and_answers() {
        let query = DnsMessage::new_query("abc.t.example.com", RecordType::A, 7);
        let mut response = query.response(RCODE_NOERROR);
        response.push_answer(DnsRecord::new_cname(
            "abc.t.example.com",
            "payload.t.example.com",
            0,
        ));

        let parsed = DnsMessage::parse(&response.to_bytes()).unwrap();
        assert!(parsed.header.is_response());
        assert_eq!(parsed.header.id, 7);
        assert_eq!(parsed.header.rcode(), RCODE_NOERROR);
        assert_eq!(parsed.question().unwrap().qname, "abc.t.example.com");
        assert_eq!(
            parsed.answers[0].rdata,
            RData::Cname("payload.t.example.com".into())
        );
    }

    #[test]
    fn test_txt_record_strings() {
        let strings = vec![b"first".to_vec(), vec![b'x'; 255]];
        let record = DnsRecord::new_txt("example.com", strings.clone(), 300);
        let mut buf = BytesMut::new();
        record.write(&mut buf);

        let mut cursor = Cursor::new(&buf[..]);
        let parsed = DnsRecord::parse(&mut cursor).unwrap();
        assert_eq!(parsed.rdata, RData::Txt(strings));
    }

    #[test]
    fn test_compressed_names() {
        // Header, question "a.example.com", then a CNAME whose owner points at the
        // question and whose target is "b" + pointer to "example.com"
        let mut packet = vec![0x00, 0x01, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0, 0, 0, 0];
        packet.extend_from_slice(b"\x01a\x07example\x03com\x00");
        packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        packet.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x05, 0x00, 0x01, 0, 0, 0, 60]);
        packet.extend_from_slice(&[0x00, 0x04, 0x01, b'b', 0xc0, 0x0e]);

        let msg = DnsMessage::parse(&packet).unwrap();
        assert_eq!(msg.answers[0].name, "a.example.com");
        assert_eq!(msg.answers[0].rdata, RData::Cname("b.example.com".into()));
    }

    #[test]
    fn test_pointer_loop_rejected() {
        let mut packet = vec![0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01]);
        assert!(DnsMessage::parse(&packet).is_err());
    }

    #[test]
    fn test_truncated_packets_rejected() {
        let bytes = DnsMessage::new_query("x.example.com", RecordType::A, 1).to_bytes();
        for len in 0..bytes.len() {
            assert!(DnsMessage::parse(&bytes[..len]).is_err(), "len {}", len);
        }
    }

    #[test]
    fn test_answer_owner_compressed() {
        let label = "a".repeat(MAX_LABEL_LEN);
        let name = format!("{0}.{0}.{0}.{1}", label, "b".repeat(61));
        assert_eq!(name.len(), MAX_NAME_LEN);

        let query = DnsMessage::new_query(&name, RecordType::Txt, 3);
        let mut response = query.response(RCODE_NOERROR);
        let strings = vec![vec![b'Q'; 255], vec![b'Q'; 255], vec![b'Q'; 255], vec![b'Q'; 115]];
        response.push_answer(DnsRecord::new_txt(&name, strings.clone(), 0));

        let bytes = response.to_bytes();
        assert!(bytes.len() <= EDNS_UDP_PAYLOAD as usize, "{} bytes", bytes.len());

        let parsed = DnsMessage::parse(&bytes).unwrap();
        assert_eq!(parsed.answers[0].name, name);
        assert_eq!(parsed.answers[0].rdata, RData::Txt(strings));
    }
}
