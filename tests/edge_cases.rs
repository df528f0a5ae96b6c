#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Boundary conditions and hostile input for the decoders and the unicast
//! exchange. Every failure must surface as an error, never a panic.

use bytes::BufMut;
use discovery_protocol::constraints::InvocationConstraints;
use discovery_protocol::core::packet::Datagram;
use discovery_protocol::core::wire::ServiceId;
use discovery_protocol::error::{constants, DiscoveryError};
use discovery_protocol::format::plaintext::{self, Plaintext};
use discovery_protocol::format::{FormatId, FormatRegistry};
use discovery_protocol::marshal::{FramedMarshaller, MarshalContext, RegistrarProxy};
use discovery_protocol::protocol::{
    peek_version, serve_unicast_discovery, Discovery, Locator, MulticastAnnouncement,
    MulticastRequest, UnicastResponse,
};
use discovery_protocol::security::AllowAll;
use std::io::{self, Cursor, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

fn none() -> InvocationConstraints {
    InvocationConstraints::empty()
}

fn source() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 9], 40000))
}

fn datagram(bytes: Vec<u8>) -> Datagram {
    Datagram::new(source(), bytes)
}

fn ctx() -> MarshalContext {
    MarshalContext::new(Arc::new(FramedMarshaller::new(1024)))
}

fn v2() -> Discovery {
    Discovery::with_providers(Plaintext::providers())
}

fn assert_malformed(err: &DiscoveryError, needle: &str) {
    match err {
        DiscoveryError::Malformed { message, .. } => {
            assert!(message.contains(needle), "expected '{needle}', got '{message}'")
        }
        other => panic!("expected malformed input, got {other:?}"),
    }
}

/// Scripted peer: reads come from `input`, writes are captured
struct Scripted {
    input: Cursor<Vec<u8>>,
    output: Vec<u8>,
}

impl Scripted {
    fn new(input: Vec<u8>) -> Self {
        Self {
            input: Cursor::new(input),
            output: Vec::new(),
        }
    }
}

impl Read for Scripted {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for Scripted {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn v1_request_bytes(port: i32, id_count: i32, groups: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_i32(1);
    buf.put_i32(port);
    buf.put_i32(id_count);
    for i in 0..id_count.max(0) {
        buf.put_u64(i as u64);
        buf.put_u64(0);
    }
    buf.put_i32(groups.len() as i32);
    for group in groups {
        buf.put_u16(group.len() as u16);
        buf.put_slice(group);
    }
    buf
}

// ============================================================================
// MULTICAST DATAGRAMS
// ============================================================================

#[test]
fn test_every_truncation_of_a_request_is_rejected() {
    let full = v1_request_bytes(4160, 1, &[b"public", b"ops"]);
    assert!(Discovery::protocol1()
        .decode_multicast_request_checked(&datagram(full.clone()), &none(), None)
        .is_ok());

    for cut in 0..full.len() {
        let err = Discovery::protocol1()
            .decode_multicast_request_checked(&datagram(full[..cut].to_vec()), &none(), None)
            .unwrap_err();
        assert!(err.is_protocol_error(), "cut at {cut}: {err:?}");
    }
}

#[test]
fn test_trailing_bytes_are_rejected() {
    let mut bytes = v1_request_bytes(4160, 0, &[b"public"]);
    bytes.push(0);
    let err = Discovery::protocol1()
        .decode_multicast_request_checked(&datagram(bytes), &none(), None)
        .unwrap_err();
    assert_malformed(&err, constants::ERR_TRAILING_BYTES);
}

#[test]
fn test_negative_and_oversized_counts() {
    let negative = v1_request_bytes(4160, -1, &[]);
    let err = Discovery::protocol1()
        .decode_multicast_request_checked(&datagram(negative), &none(), None)
        .unwrap_err();
    assert_malformed(&err, "negative element count");

    // claims a billion identifiers in a 20-byte datagram
    let mut huge = Vec::new();
    huge.put_i32(1);
    huge.put_i32(4160);
    huge.put_i32(1_000_000_000);
    huge.put_i32(0);
    huge.put_i32(0);
    let err = Discovery::protocol1()
        .decode_multicast_request_checked(&datagram(huge), &none(), None)
        .unwrap_err();
    assert_malformed(&err, constants::ERR_COUNT_EXCEEDS_BUFFER);
}

#[test]
fn test_port_out_of_range() {
    let bytes = v1_request_bytes(70_000, 0, &[]);
    let err = Discovery::protocol1()
        .decode_multicast_request_checked(&datagram(bytes), &none(), None)
        .unwrap_err();
    assert_malformed(&err, "out of range");
}

#[test]
fn test_invalid_utf8_group() {
    let bytes = v1_request_bytes(4160, 0, &[&[0xC3, 0x28]]);
    let err = Discovery::protocol1()
        .decode_multicast_request_checked(&datagram(bytes), &none(), None)
        .unwrap_err();
    assert_malformed(&err, constants::ERR_INVALID_UTF8);
}

#[test]
fn test_unknown_version_and_empty_datagram() {
    let mut bytes = v1_request_bytes(4160, 0, &[]);
    bytes[..4].copy_from_slice(&7i32.to_be_bytes());
    let err = Discovery::protocol1()
        .decode_multicast_request_checked(&datagram(bytes.clone()), &none(), None)
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::UnsupportedVersion(7)));
    assert_eq!(peek_version(&bytes).unwrap(), 7);

    assert!(peek_version(&[]).is_err());
    assert!(v2()
        .decode_multicast_announcement_checked(&datagram(Vec::new()), &none())
        .unwrap_err()
        .is_protocol_error());
}

#[test]
fn test_unknown_packet_type() {
    let mut bytes = Vec::new();
    bytes.put_i32(2);
    bytes.put_u8(9);
    bytes.put_u64(FormatId::from_name(plaintext::FORMAT_NAME).as_u64());
    let err = v2()
        .decode_multicast_request_checked(&datagram(bytes), &none(), None)
        .unwrap_err();
    assert!(matches!(
        err,
        DiscoveryError::UnexpectedPacketType { expected: 1, found: 9 }
    ));
}

#[test]
fn test_header_without_body() {
    let mut bytes = Vec::new();
    bytes.put_i32(2);
    bytes.put_u8(0);
    bytes.put_u64(FormatId::from_name(plaintext::FORMAT_NAME).as_u64());
    let err = v2()
        .decode_multicast_announcement_checked(&datagram(bytes.clone()), &none())
        .unwrap_err();
    assert!(err.is_protocol_error());

    let err = v2()
        .decode_multicast_announcement_checked(&datagram(bytes[..10].to_vec()), &none())
        .unwrap_err();
    assert!(err.is_protocol_error());
}

#[test]
fn test_empty_group_list_still_produces_one_datagram() {
    for discovery in [Discovery::protocol1(), v2()] {
        let request = MulticastRequest::new("10.0.0.9", 4160, Vec::<String>::new(), []);
        let datagrams: Vec<_> = discovery
            .encode_multicast_request(&request, 512, &none())
            .unwrap()
            .flat_map(|batch| batch.unwrap())
            .collect();
        assert_eq!(datagrams.len(), 1);
        let decoded = discovery
            .decode_multicast_request_checked(&Datagram::new(source(), datagrams[0].payload.clone()), &none(), None)
            .unwrap();
        assert!(decoded.groups().is_empty());
    }
}

#[test]
fn test_oversized_strings() {
    let request = MulticastRequest::new("h".repeat(70_000), 4160, ["g"], []);
    let result = v2()
        .encode_multicast_request(&request, 512, &none())
        .unwrap()
        .next()
        .unwrap();
    assert!(matches!(
        result,
        Err(DiscoveryError::ItemTooLong { kind: "string", .. })
    ));

    let announcement =
        MulticastAnnouncement::new(1, "reggie", 4160, ["g".repeat(65_536)], ServiceId::new(0, 0));
    let result = Discovery::protocol1()
        .encode_multicast_announcement(&announcement, 65_507, &none())
        .unwrap()
        .next()
        .unwrap();
    assert!(matches!(
        result,
        Err(DiscoveryError::ItemTooLong { kind: "group", .. })
    ));
}

#[test]
fn test_known_ids_are_truncated_to_fit() {
    let ids: Vec<ServiceId> = (0..100).map(|i| ServiceId::new(i, i)).collect();
    let request = MulticastRequest::new("10.0.0.9", 4160, ["public"], ids.clone());
    let datagrams = Discovery::protocol1()
        .encode_multicast_request(&request, 512, &none())
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(datagrams.len(), 1);
    assert!(datagrams[0].len() <= 512);

    let decoded = Discovery::protocol1()
        .decode_multicast_request_checked(&Datagram::new(source(), datagrams[0].payload.clone()), &none(), None)
        .unwrap();
    assert!(decoded.service_ids().len() < ids.len());
    assert_eq!(decoded.service_ids(), &ids[..decoded.service_ids().len()]);
}

// ============================================================================
// UNICAST EXCHANGE
// ============================================================================

#[test]
fn test_server_rejects_unknown_client_version() {
    let formats = Arc::new(FormatRegistry::new(Plaintext::providers()));
    let response = UnicastResponse::new("reggie", 4160, ["a"], RegistrarProxy::new(vec![1]));
    let mut peer = Scripted::new(9i32.to_be_bytes().to_vec());

    let err = serve_unicast_discovery(&formats, &response, &mut peer, &none(), &AllowAll, &ctx()).unwrap_err();
    assert!(matches!(err, DiscoveryError::UnsupportedVersion(9)));
    assert!(peer.output.is_empty());
}

#[test]
fn test_server_truncated_proposal_list() {
    let response = UnicastResponse::new("reggie", 4160, ["a"], RegistrarProxy::new(vec![1]));
    let mut input = Vec::new();
    input.put_i32(2);
    input.put_u16(3);
    input.put_u64(FormatId::from_name(plaintext::FORMAT_NAME).as_u64());
    let mut peer = Scripted::new(input);

    let err = v2()
        .handle_unicast_discovery(&response, &mut peer, &none(), &AllowAll, &ctx())
        .unwrap_err();
    assert_malformed(&err, constants::ERR_TRUNCATED_STREAM);
    assert!(peer.output.is_empty(), "nothing is selected from a partial list");
}

#[test]
fn test_server_answers_empty_proposal_with_zero() {
    let response = UnicastResponse::new("reggie", 4160, ["a"], RegistrarProxy::new(vec![1]));
    let mut input = Vec::new();
    input.put_i32(2);
    input.put_u16(0);
    let mut peer = Scripted::new(input);

    let err = v2()
        .handle_unicast_discovery(&response, &mut peer, &none(), &AllowAll, &ctx())
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::NegotiationFailed(_)));

    let mut expected = Vec::new();
    expected.put_i32(2);
    expected.put_u64(0);
    assert_eq!(peer.output, expected);
}

#[test]
fn test_client_rejects_unproposed_selection() {
    let locator = Locator::new("reggie", 4160);
    let mut reply = Vec::new();
    reply.put_i32(2);
    reply.put_u64(12345);
    let mut peer = Scripted::new(reply);

    let err = v2()
        .do_unicast_discovery(&mut peer, &locator, &none(), &ctx())
        .unwrap_err();
    match err {
        DiscoveryError::NegotiationFailed(message) => {
            assert!(message.starts_with(constants::ERR_UNPROPOSED_FORMAT))
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let mut proposal = Vec::new();
    proposal.put_i32(2);
    proposal.put_u16(1);
    proposal.put_u64(FormatId::from_name(plaintext::FORMAT_NAME).as_u64());
    assert_eq!(peer.output, proposal);
}

#[test]
fn test_client_rejects_reply_version() {
    let mut reply = Vec::new();
    reply.put_i32(3);
    reply.put_u64(FormatId::from_name(plaintext::FORMAT_NAME).as_u64());
    let mut peer = Scripted::new(reply);

    let err = v2()
        .do_unicast_discovery(&mut peer, &Locator::new("reggie", 4160), &none(), &ctx())
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::UnsupportedVersion(3)));
}

#[test]
fn test_v1_client_negative_group_count() {
    let mut reply = Vec::new();
    reply.put_u32(2);
    reply.put_slice(&[0xAA, 0xBB]);
    reply.put_i32(-5);
    let mut peer = Scripted::new(reply);

    let err = Discovery::protocol1()
        .do_unicast_discovery(&mut peer, &Locator::new("reggie", 4160), &none(), &ctx())
        .unwrap_err();
    assert_malformed(&err, "negative group count");
    assert_eq!(peer.output, 1i32.to_be_bytes());
}

#[test]
fn test_v1_client_oversized_registrar() {
    let mut reply = Vec::new();
    reply.put_u32(4096);
    reply.put_slice(&[0u8; 16]);
    let mut peer = Scripted::new(reply);

    let err = Discovery::protocol1()
        .do_unicast_discovery(&mut peer, &Locator::new("reggie", 4160), &none(), &ctx())
        .unwrap_err();
    assert_malformed(&err, "exceeds limit");
}

#[test]
fn test_v1_client_stream_ends_mid_group() {
    let mut reply = Vec::new();
    reply.put_u32(0);
    reply.put_i32(2);
    reply.put_u16(6);
    reply.put_slice(b"public");
    reply.put_u16(10);
    reply.put_slice(b"op");
    let mut peer = Scripted::new(reply);

    let err = Discovery::protocol1()
        .do_unicast_discovery(&mut peer, &Locator::new("reggie", 4160), &none(), &ctx())
        .unwrap_err();
    assert_malformed(&err, constants::ERR_TRUNCATED_STREAM);
}
