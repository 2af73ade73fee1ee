// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DNS wire format for the authoritative responder.
//!
//! Only single-question queries are handled. Answers reuse the question
//! name through a compression pointer to offset 12:
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+
//! | ID     | FLAGS  | QDCOUNT| ANCOUNT| NSCOUNT| ARCOUNT|   12-byte header
//! +--------+--------+--------+--------+--------+--------+
//! | QNAME (labels) | QTYPE | QCLASS |                       question
//! +----------------+-------+--------+
//! | C0 0C | TYPE | CLASS | TTL | RDLENGTH | RDATA |        answers
//! ```

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Header length in bytes.
pub const HEADER_LEN: usize = 12;

/// Largest UDP payload read or written without EDNS.
pub const MAX_UDP_PAYLOAD: usize = 512;

/// Class IN.
pub const CLASS_IN: u16 = 1;

/// Flags of a successful authoritative answer: QR, AA, RD, RA.
pub const FLAGS_ANSWER: u16 = 0x8580;

/// Truncation bit, set when answers were dropped to fit the payload.
pub const FLAG_TC: u16 = 0x0200;

/// Pointer to the question name at offset 12.
const NAME_POINTER: u16 = 0xC00C;

const MAX_LABEL_LEN: usize = 63;
const MAX_TXT_LEN: usize = 255;

/// Errors from parsing queries or encoding answers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("question truncated")]
    Truncated,

    #[error("compressed names are not accepted in the question")]
    CompressedQuestion,

    #[error("invalid label")]
    InvalidLabel,

    #[error("cannot encode {record_type} value '{value}'")]
    InvalidRdata { record_type: String, value: String },
}

/// Response codes used by the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Rcode {
    NoError = 0,
    FormErr = 1,
    ServFail = 2,
    NxDomain = 3,
    NotImp = 4,
}

/// Record types understood by the store and the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Txt,
    Aaaa,
    Srv,
}

impl RecordType {
    pub fn code(&self) -> u16 {
        match self {
            Self::A => 1,
            Self::Ns => 2,
            Self::Cname => 5,
            Self::Soa => 6,
            Self::Ptr => 12,
            Self::Mx => 15,
            Self::Txt => 16,
            Self::Aaaa => 28,
            Self::Srv => 33,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => Self::A,
            2 => Self::Ns,
            5 => Self::Cname,
            6 => Self::Soa,
            12 => Self::Ptr,
            15 => Self::Mx,
            16 => Self::Txt,
            28 => Self::Aaaa,
            33 => Self::Srv,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::Ns => "NS",
            Self::Cname => "CNAME",
            Self::Soa => "SOA",
            Self::Ptr => "PTR",
            Self::Mx => "MX",
            Self::Txt => "TXT",
            Self::Aaaa => "AAAA",
            Self::Srv => "SRV",
        }
    }

    /// Types that can be answered from stored records.
    pub fn is_answerable(&self) -> bool {
        !matches!(self, Self::Soa)
    }
}

impl FromStr for RecordType {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "A" => Self::A,
            "NS" => Self::Ns,
            "CNAME" => Self::Cname,
            "SOA" => Self::Soa,
            "PTR" => Self::Ptr,
            "MX" => Self::Mx,
            "TXT" => Self::Txt,
            "AAAA" => Self::Aaaa,
            "SRV" => Self::Srv,
            _ => {
                return Err(DnsError::InvalidRdata {
                    record_type: s.to_string(),
                    value: String::new(),
                });
            }
        })
    }
}

/// The single question of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub transaction_id: u16,
    /// Lowercased, without trailing dot.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A record to place in the answer section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub record_type: RecordType,
    pub ttl: u32,
    pub value: String,
    pub priority: Option<u16>,
    pub weight: Option<u16>,
    pub port: Option<u16>,
}

/// Parse the header and first question of a query packet.
pub fn parse_query(packet: &[u8]) -> Result<Question, DnsError> {
    if packet.len() < HEADER_LEN {
        return Err(DnsError::TooShort(packet.len()));
    }
    let transaction_id = u16::from_be_bytes([packet[0], packet[1]]);

    let mut pos = HEADER_LEN;
    let mut labels: Vec<String> = Vec::new();
    loop {
        let len = *packet.get(pos).ok_or(DnsError::Truncated)? as usize;
        pos += 1;
        if len == 0 {
            break;
        }
        if len & 0xC0 != 0 {
            return Err(DnsError::CompressedQuestion);
        }
        let label = packet.get(pos..pos + len).ok_or(DnsError::Truncated)?;
        if !label.is_ascii() {
            return Err(DnsError::InvalidLabel);
        }
        labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
        pos += len;
    }

    let tail = packet.get(pos..pos + 4).ok_or(DnsError::Truncated)?;
    Ok(Question {
        transaction_id,
        name: labels.join("."),
        qtype: u16::from_be_bytes([tail[0], tail[1]]),
        qclass: u16::from_be_bytes([tail[2], tail[3]]),
    })
}

fn put_name(buf: &mut BytesMut, name: &str) -> Result<(), DnsError> {
    for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
        if label.len() > MAX_LABEL_LEN || !label.is_ascii() {
            return Err(DnsError::InvalidLabel);
        }
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    Ok(())
}

fn rdata(answer: &Answer) -> Result<BytesMut, DnsError> {
    let invalid = || DnsError::InvalidRdata {
        record_type: answer.record_type.as_str().to_string(),
        value: answer.value.clone(),
    };
    let mut buf = BytesMut::new();
    match answer.record_type {
        RecordType::A => {
            let addr: Ipv4Addr = answer.value.trim().parse().map_err(|_| invalid())?;
            buf.put_slice(&addr.octets());
        }
        RecordType::Aaaa => {
            let addr: Ipv6Addr = answer.value.trim().parse().map_err(|_| invalid())?;
            buf.put_slice(&addr.octets());
        }
        RecordType::Cname | RecordType::Ns | RecordType::Ptr => {
            put_name(&mut buf, &answer.value).map_err(|_| invalid())?;
        }
        RecordType::Mx => {
            buf.put_u16(answer.priority.unwrap_or(10));
            put_name(&mut buf, &answer.value).map_err(|_| invalid())?;
        }
        RecordType::Txt => {
            let bytes = answer.value.as_bytes();
            let len = bytes.len().min(MAX_TXT_LEN);
            buf.put_u8(len as u8);
            buf.put_slice(&bytes[..len]);
        }
        RecordType::Srv => {
            buf.put_u16(answer.priority.unwrap_or(0));
            buf.put_u16(answer.weight.unwrap_or(0));
            buf.put_u16(answer.port.ok_or_else(invalid)?);
            put_name(&mut buf, &answer.value).map_err(|_| invalid())?;
        }
        RecordType::Soa => return Err(invalid()),
    }
    Ok(buf)
}

fn put_header(buf: &mut BytesMut, transaction_id: u16, flags: u16, qdcount: u16) {
    buf.put_u16(transaction_id);
    buf.put_u16(flags);
    buf.put_u16(qdcount);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(0);
}

fn put_question(buf: &mut BytesMut, question: &Question) -> Result<(), DnsError> {
    put_name(buf, &question.name)?;
    buf.put_u16(question.qtype);
    buf.put_u16(CLASS_IN);
    Ok(())
}

/// Build an authoritative answer echoing the question.
///
/// Answers that would push the packet past [`MAX_UDP_PAYLOAD`] are left out
/// and the TC bit is set so the client can retry over TCP.
pub fn build_response(question: &Question, answers: &[Answer]) -> Result<Bytes, DnsError> {
    let mut buf = BytesMut::with_capacity(MAX_UDP_PAYLOAD);
    put_header(&mut buf, question.transaction_id, FLAGS_ANSWER, 1);
    put_question(&mut buf, question)?;

    let mut count: u16 = 0;
    let mut flags = FLAGS_ANSWER;
    for answer in answers {
        let data = rdata(answer)?;
        let record_len = 12 + data.len();
        if buf.len() + record_len > MAX_UDP_PAYLOAD || count == u16::MAX {
            flags |= FLAG_TC;
            break;
        }
        buf.put_u16(NAME_POINTER);
        buf.put_u16(answer.record_type.code());
        buf.put_u16(CLASS_IN);
        buf.put_u32(answer.ttl);
        buf.put_u16(data.len() as u16);
        buf.put_slice(&data);
        count += 1;
    }
    buf[2..4].copy_from_slice(&flags.to_be_bytes());
    buf[6..8].copy_from_slice(&count.to_be_bytes());
    Ok(buf.freeze())
}

/// Authoritative response carrying `rcode` and echoing the question. A
/// question whose name cannot be re-encoded is left out.
pub fn build_error(question: &Question, rcode: Rcode) -> Bytes {
    let flags = FLAGS_ANSWER | rcode as u16;
    let mut buf = BytesMut::with_capacity(MAX_UDP_PAYLOAD);
    put_header(&mut buf, question.transaction_id, flags, 1);
    if put_question(&mut buf, question).is_err() {
        buf.truncate(HEADER_LEN);
        buf[4..6].copy_from_slice(&0u16.to_be_bytes());
    }
    buf.freeze()
}

/// Encode a query packet. Used by clients and tests.
pub fn build_query(transaction_id: u16, name: &str, qtype: u16) -> Result<Bytes, DnsError> {
    let mut buf = BytesMut::with_capacity(MAX_UDP_PAYLOAD);
    buf.put_u16(transaction_id);
    buf.put_u16(0x0100);
    buf.put_u16(1);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(0);
    put_name(&mut buf, name)?;
    buf.put_u16(qtype);
    buf.put_u16(CLASS_IN);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lowercases_name() {
        let packet = build_query(0x1234, "API.Example.COM", 1).unwrap();
        let q = parse_query(&packet).unwrap();
        assert_eq!(q.transaction_id, 0x1234);
        assert_eq!(q.name, "api.example.com");
        assert_eq!(q.qtype, 1);
        assert_eq!(q.qclass, CLASS_IN);
    }

    #[test]
    fn test_parse_rejects_short_and_truncated() {
        assert_eq!(parse_query(&[0u8; 5]), Err(DnsError::TooShort(5)));
        let packet = build_query(1, "example.com", 1).unwrap();
        assert_eq!(
            parse_query(&packet[..packet.len() - 2]),
            Err(DnsError::Truncated)
        );
    }

    #[test]
    fn test_parse_rejects_pointer_in_question() {
        let mut packet = vec![0u8; HEADER_LEN];
        packet.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1]);
        assert_eq!(parse_query(&packet), Err(DnsError::CompressedQuestion));
    }

    #[test]
    fn test_record_type_codes() {
        for t in [
            RecordType::A,
            RecordType::Ns,
            RecordType::Cname,
            RecordType::Soa,
            RecordType::Ptr,
            RecordType::Mx,
            RecordType::Txt,
            RecordType::Aaaa,
            RecordType::Srv,
        ] {
            assert_eq!(RecordType::from_code(t.code()), Some(t));
            assert_eq!(t.as_str().parse::<RecordType>().unwrap(), t);
        }
        assert_eq!(RecordType::from_code(255), None);
    }

    #[test]
    fn test_mx_default_priority() {
        let answer = Answer {
            record_type: RecordType::Mx,
            ttl: 300,
            value: "mail.example.com".into(),
            priority: None,
            weight: None,
            port: None,
        };
        let data = rdata(&answer).unwrap();
        assert_eq!(&data[..2], &[0, 10]);
    }

    #[test]
    fn test_txt_truncated_to_255() {
        let answer = Answer {
            record_type: RecordType::Txt,
            ttl: 60,
            value: "x".repeat(400),
            priority: None,
            weight: None,
            port: None,
        };
        let data = rdata(&answer).unwrap();
        assert_eq!(data[0], 255);
        assert_eq!(data.len(), 256);
    }

    #[test]
    fn test_invalid_a_value() {
        let question = Question {
            transaction_id: 1,
            name: "a.example".into(),
            qtype: 1,
            qclass: 1,
        };
        let answer = Answer {
            record_type: RecordType::A,
            ttl: 60,
            value: "not-an-ip".into(),
            priority: None,
            weight: None,
            port: None,
        };
        assert!(matches!(
            build_response(&question, &[answer]),
            Err(DnsError::InvalidRdata { .. })
        ));
    }

    fn a_record(ttl: u32, value: &str) -> Answer {
        Answer {
            record_type: RecordType::A,
            ttl,
            value: value.into(),
            priority: None,
            weight: None,
            port: None,
        }
    }

    #[test]
    fn test_error_echoes_question() {
        let query = build_query(0xBEEF, "gone.example.test", 28).unwrap();
        let question = parse_query(&query).unwrap();
        let packet = build_error(&question, Rcode::NxDomain);

        assert_eq!(&packet[..HEADER_LEN], &[0xBE, 0xEF, 0x85, 0x83, 0, 1, 0, 0, 0, 0, 0, 0]);
        // Authoritative.
        assert_ne!(u16::from_be_bytes([packet[2], packet[3]]) & 0x0400, 0);
        assert_eq!(&packet[HEADER_LEN..], &query[HEADER_LEN..]);
        assert_eq!(parse_query(&packet).unwrap().name, "gone.example.test");
    }

    #[test]
    fn test_error_without_encodable_name_is_header_only() {
        let question = Question {
            transaction_id: 2,
            name: "x".repeat(70),
            qtype: 1,
            qclass: 1,
        };
        let packet = build_error(&question, Rcode::ServFail);
        assert_eq!(&packet[..], &[0, 2, 0x85, 0x82, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_response_truncates_at_udp_limit() {
        let question = Question {
            transaction_id: 3,
            name: "many.example.test".into(),
            qtype: 1,
            qclass: 1,
        };
        let answers: Vec<Answer> = (0..100)
            .map(|i| a_record(60, &format!("10.0.0.{i}")))
            .collect();
        let packet = build_response(&question, &answers).unwrap();

        assert!(packet.len() <= MAX_UDP_PAYLOAD);
        let flags = u16::from_be_bytes([packet[2], packet[3]]);
        assert_eq!(flags, FLAGS_ANSWER | FLAG_TC);
        // 12 header + 23 question leaves room for 29 sixteen-byte A records.
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 29);
        assert_eq!(packet.len(), HEADER_LEN + 23 + 29 * 16);
    }

    #[test]
    fn test_response_within_limit_is_not_truncated() {
        let question = Question {
            transaction_id: 4,
            name: "few.example.test".into(),
            qtype: 1,
            qclass: 1,
        };
        let answers = vec![a_record(60, "10.0.0.1"), a_record(60, "10.0.0.2")];
        let packet = build_response(&question, &answers).unwrap();
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), FLAGS_ANSWER);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 2);
    }
}
