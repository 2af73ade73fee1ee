// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DNS encoding tests for mockcloud-protocol.

use mockcloud_protocol::dns::{
    Answer, CLASS_IN, FLAGS_ANSWER, HEADER_LEN, Rcode, RecordType, build_error, build_query,
    build_response, parse_query,
};

fn answer(record_type: RecordType, value: &str) -> Answer {
    Answer {
        record_type,
        ttl: 300,
        value: value.to_string(),
        priority: None,
        weight: None,
        port: None,
    }
}

fn u16_at(packet: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([packet[offset], packet[offset + 1]])
}

#[test]
fn test_a_record_answer_carries_exact_octets() {
    let query = build_query(0x4242, "app.env-abc.mock", RecordType::A.code()).unwrap();
    let question = parse_query(&query).unwrap();
    let response = build_response(&question, &[answer(RecordType::A, "10.1.2.3")]).unwrap();

    assert_eq!(u16_at(&response, 0), 0x4242);
    assert_eq!(u16_at(&response, 2), FLAGS_ANSWER);
    assert_eq!(u16_at(&response, 4), 1, "QDCOUNT");
    assert_eq!(u16_at(&response, 6), 1, "ANCOUNT");

    // The question is echoed verbatim after the header.
    let question_len = query.len() - HEADER_LEN;
    assert_eq!(
        &response[HEADER_LEN..HEADER_LEN + question_len],
        &query[HEADER_LEN..]
    );

    let answer_start = HEADER_LEN + question_len;
    let rr = &response[answer_start..];
    assert_eq!(u16_at(rr, 0), 0xC00C, "name pointer");
    assert_eq!(u16_at(rr, 2), 1, "TYPE A");
    assert_eq!(u16_at(rr, 4), CLASS_IN);
    assert_eq!(u32::from_be_bytes([rr[6], rr[7], rr[8], rr[9]]), 300);
    assert_eq!(u16_at(rr, 10), 4, "RDLENGTH");
    assert_eq!(&rr[12..16], &[10, 1, 2, 3]);
    assert_eq!(rr.len(), 16);
}

#[test]
fn test_aaaa_record_is_sixteen_octets() {
    let query = build_query(7, "v6.example", RecordType::Aaaa.code()).unwrap();
    let question = parse_query(&query).unwrap();
    let response = build_response(&question, &[answer(RecordType::Aaaa, "2001:db8::1")]).unwrap();
    let rr = &response[query.len()..];
    assert_eq!(u16_at(rr, 10), 16);
    assert_eq!(
        &rr[12..28],
        &[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]
    );
}

#[test]
fn test_srv_record_layout() {
    let query = build_query(9, "_sip._tcp.example", RecordType::Srv.code()).unwrap();
    let question = parse_query(&query).unwrap();
    let srv = Answer {
        priority: Some(5),
        weight: Some(20),
        port: Some(5060),
        ..answer(RecordType::Srv, "sip.example")
    };
    let response = build_response(&question, &[srv]).unwrap();
    let rr = &response[query.len()..];
    let rdata = &rr[12..];
    assert_eq!(u16_at(rdata, 0), 5);
    assert_eq!(u16_at(rdata, 2), 20);
    assert_eq!(u16_at(rdata, 4), 5060);
    assert_eq!(&rdata[6..], b"\x03sip\x07example\x00");
}

#[test]
fn test_multiple_answers_counted() {
    let query = build_query(1, "multi.example", RecordType::A.code()).unwrap();
    let question = parse_query(&query).unwrap();
    let response = build_response(
        &question,
        &[
            answer(RecordType::A, "10.0.0.1"),
            answer(RecordType::A, "10.0.0.2"),
        ],
    )
    .unwrap();
    assert_eq!(u16_at(&response, 6), 2);
}

#[test]
fn test_nxdomain_response() {
    let packet = build_error(0x0102, Rcode::NxDomain);
    assert_eq!(packet.len(), HEADER_LEN);
    assert_eq!(u16_at(&packet, 2) & 0x000F, 3);
    assert_eq!(u16_at(&packet, 2) & 0x8000, 0x8000);
    assert_eq!(u16_at(&packet, 6), 0);
}
