#![no_main]

use discovery_protocol::constraints::InvocationConstraints;
use discovery_protocol::core::packet::Datagram;
use discovery_protocol::format::hmac::HmacSha256Format;
use discovery_protocol::format::plaintext::Plaintext;
use discovery_protocol::protocol::Discovery;
use libfuzzer_sys::fuzz_target;
use std::net::SocketAddr;

fuzz_target!(|data: &[u8]| {
    // Decoders must reject, never panic or over-allocate
    let mut providers = Plaintext::providers();
    if let Ok(hmac) = HmacSha256Format::providers(&[0x11; 32]) {
        providers.extend(hmac);
    }
    let none = InvocationConstraints::empty();
    let datagram = Datagram::new(SocketAddr::from(([10, 0, 0, 1], 4160)), data.to_vec());

    for discovery in [Discovery::protocol1(), Discovery::with_providers(providers)] {
        if let Ok(pending) = discovery.decode_multicast_request(&datagram, &none, None, true) {
            let _ = pending.verify();
        }
        if let Ok(pending) = discovery.decode_multicast_announcement(&datagram, &none, true) {
            let _ = pending.verify();
        }
    }
});
