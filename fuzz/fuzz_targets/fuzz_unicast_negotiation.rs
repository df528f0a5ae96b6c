#![no_main]

use discovery_protocol::constraints::InvocationConstraints;
use discovery_protocol::format::plaintext::Plaintext;
use discovery_protocol::format::FormatRegistry;
use discovery_protocol::marshal::{FramedMarshaller, MarshalContext, RegistrarProxy};
use discovery_protocol::protocol::{serve_unicast_discovery, Discovery, Locator, UnicastResponse};
use discovery_protocol::security::AllowAll;
use libfuzzer_sys::fuzz_target;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

struct Peer {
    input: Cursor<Vec<u8>>,
}

impl Read for Peer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for Peer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    let none = InvocationConstraints::empty();
    let ctx = MarshalContext::new(Arc::new(FramedMarshaller::new(64 * 1024)));

    // Fuzz bytes as the client's proposal
    let formats = Arc::new(FormatRegistry::new(Plaintext::providers()));
    let response = UnicastResponse::new("reggie", 4160, ["public"], RegistrarProxy::new(vec![0u8; 8]));
    let mut peer = Peer { input: Cursor::new(data.to_vec()) };
    let _ = serve_unicast_discovery(&formats, &response, &mut peer, &none, &AllowAll, &ctx);

    // Fuzz bytes as the server's reply
    let locator = Locator::new("reggie", 4160);
    for discovery in [Discovery::protocol1(), Discovery::with_providers(Plaintext::providers())] {
        let mut peer = Peer { input: Cursor::new(data.to_vec()) };
        let _ = discovery.do_unicast_discovery(&mut peer, &locator, &none, &ctx);
    }
});
