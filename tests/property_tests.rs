//! Property-based tests using proptest
//!
//! Packing invariants across randomly generated messages and ceilings, and
//! decoder robustness against arbitrary bytes.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use discovery_protocol::constraints::InvocationConstraints;
use discovery_protocol::core::packet::Datagram;
use discovery_protocol::core::wire::ServiceId;
use discovery_protocol::format::hmac::HmacSha256Format;
use discovery_protocol::format::plaintext::Plaintext;
use discovery_protocol::format::FormatId;
use discovery_protocol::marshal::{FramedMarshaller, MarshalContext};
use discovery_protocol::protocol::{Discovery, Locator, MulticastAnnouncement, MulticastRequest};
use proptest::prelude::*;
use std::io::{self, Cursor, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

fn none() -> InvocationConstraints {
    InvocationConstraints::empty()
}

fn source() -> SocketAddr {
    SocketAddr::from(([172, 16, 0, 3], 40000))
}

fn facades() -> Vec<Discovery> {
    let mut providers = Plaintext::providers();
    providers.extend(HmacSha256Format::providers(&[0x5A; 32]).unwrap());
    vec![Discovery::protocol1(), Discovery::with_providers(providers)]
}

fn groups_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-zA-Z0-9.\\-é]{0,120}", 0..60)
}

fn ids_strategy() -> impl Strategy<Value = Vec<ServiceId>> {
    prop::collection::vec(
        (any::<u64>(), any::<u64>()).prop_map(|(hi, lo)| ServiceId::new(hi, lo)),
        0..40,
    )
}

// Property: every datagram respects the ceiling, and groups survive in order
proptest! {
    #[test]
    fn prop_request_packing(
        groups in groups_strategy(),
        ids in ids_strategy(),
        ceiling in 512usize..2048,
    ) {
        let request = MulticastRequest::new("172.16.0.3", 4160, groups.clone(), ids.clone());
        for discovery in facades() {
            for batch in discovery.encode_multicast_request(&request, ceiling, &none()).unwrap() {
                let datagrams = batch.unwrap();
                prop_assert!(!datagrams.is_empty());

                let mut seen = Vec::new();
                for datagram in datagrams {
                    prop_assert!(datagram.len() <= ceiling);
                    let decoded = discovery
                        .decode_multicast_request_checked(&Datagram::new(source(), datagram.payload), &none(), None)
                        .unwrap();
                    prop_assert_eq!(decoded.port(), 4160);
                    // the same identifier prefix is repeated in every datagram
                    prop_assert_eq!(decoded.service_ids(), &ids[..decoded.service_ids().len()]);
                    seen.extend_from_slice(decoded.groups());
                }
                prop_assert_eq!(&seen, &groups);
            }
        }
    }
}

proptest! {
    #[test]
    fn prop_announcement_packing(
        groups in groups_strategy(),
        sequence in any::<i64>(),
        ceiling in 512usize..2048,
    ) {
        let announcement = MulticastAnnouncement::new(sequence, "reggie.local", 4160, groups.clone(), ServiceId::new(1, 2));
        for discovery in facades() {
            for batch in discovery.encode_multicast_announcement(&announcement, ceiling, &none()).unwrap() {
                let mut seen = Vec::new();
                for datagram in batch.unwrap() {
                    prop_assert!(datagram.len() <= ceiling);
                    let decoded = discovery
                        .decode_multicast_announcement_checked(&Datagram::new(source(), datagram.payload), &none())
                        .unwrap();
                    prop_assert_eq!(decoded.host(), "reggie.local");
                    prop_assert_eq!(decoded.service_id(), ServiceId::new(1, 2));
                    seen.extend_from_slice(decoded.groups());
                }
                prop_assert_eq!(&seen, &groups);
            }
        }
    }
}

// Property: decoders never panic on arbitrary bytes
proptest! {
    #[test]
    fn prop_decoders_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..1500)) {
        for discovery in facades() {
            let datagram = Datagram::new(source(), bytes.clone());
            let _ = discovery.decode_multicast_request(&datagram, &none(), None, true);
            let _ = discovery.decode_multicast_announcement(&datagram, &none(), true);
            let _ = discovery.decode_multicast_request_checked(&datagram, &none(), None);
            let _ = discovery.decode_multicast_announcement_checked(&datagram, &none());
        }
    }
}

// Property: a valid generation-2 header over an arbitrary body is rejected cleanly
proptest! {
    #[test]
    fn prop_arbitrary_bodies_are_rejected_cleanly(
        packet_type in 0u8..2,
        body in prop::collection::vec(any::<u8>(), 0..600),
    ) {
        let discovery = Discovery::with_providers(Plaintext::providers());
        let mut bytes = 2i32.to_be_bytes().to_vec();
        bytes.push(packet_type);
        bytes.extend_from_slice(&FormatId::from_name(discovery_protocol::format::plaintext::FORMAT_NAME).as_u64().to_be_bytes());
        bytes.extend_from_slice(&body);
        let datagram = Datagram::new(source(), bytes);

        if let Err(e) = discovery.decode_multicast_request_checked(&datagram, &none(), None) {
            prop_assert!(e.is_protocol_error(), "{:?}", e);
        }
        if let Err(e) = discovery.decode_multicast_announcement_checked(&datagram, &none()) {
            prop_assert!(e.is_protocol_error(), "{:?}", e);
        }
    }
}

struct Replay {
    input: Cursor<Vec<u8>>,
}

impl Read for Replay {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for Replay {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// Property: unicast clients never panic on an arbitrary server reply
proptest! {
    #[test]
    fn prop_unicast_client_survives_arbitrary_replies(reply in prop::collection::vec(any::<u8>(), 0..512)) {
        let ctx = MarshalContext::new(Arc::new(FramedMarshaller::new(4096)));
        let locator = Locator::new("reggie", 4160);
        for discovery in facades() {
            let mut peer = Replay { input: Cursor::new(reply.clone()) };
            let _ = discovery.do_unicast_discovery(&mut peer, &locator, &none(), &ctx);
        }
    }
}
