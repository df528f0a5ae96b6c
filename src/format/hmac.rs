//! Shared-key HMAC-SHA256 generation-2 format.
//!
//! Uses the plaintext payload layouts. Each multicast datagram ends with a
//! 32-byte tag over everything before it, header included. The unicast
//! payload is followed by a tag over the whole exchange: the client's
//! proposal, the server's selection, then the payload, so a tampered
//! negotiation fails verification.
//!
//! Structural decoding is always eager; tag verification is the part a
//! caller may postpone.

use super::plaintext::{self, body};
use super::{
    DiscoveryFormat, DiscoveryStream, FormatProvider, MulticastAnnouncementDecoder,
    MulticastAnnouncementEncoder, MulticastRequestDecoder, MulticastRequestEncoder,
    UnicastDiscoveryClient, UnicastDiscoveryServer,
};
use crate::constraints::{InvocationConstraint, ResolvedConstraints};
use crate::core::packet::DatagramBuffers;
use crate::core::wire::stream;
use crate::error::{constants, DiscoveryError, Result};
use crate::marshal::MarshalContext;
use crate::protocol::message::{MulticastAnnouncement, MulticastRequest, PendingCheck, UnicastResponse};
use crate::security::ClientSubjectChecker;
use crate::utils::metrics::global_metrics;
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

pub const FORMAT_NAME: &str = "discovery.hmac-sha256";

/// Tag length appended to every datagram and unicast payload
pub const MAC_LEN: usize = 32;

/// Shortest key accepted
pub const MIN_KEY_LEN: usize = 16;

const SUPPORTED: &[InvocationConstraint] = &[InvocationConstraint::Integrity];

#[derive(Clone)]
pub struct HmacSha256Format {
    keyed: HmacSha256,
}

impl HmacSha256Format {
    /// # Errors
    /// `InvalidArgument` for keys shorter than [`MIN_KEY_LEN`].
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() < MIN_KEY_LEN {
            return Err(DiscoveryError::InvalidArgument(format!(
                "HMAC key must be at least {MIN_KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let keyed = HmacSha256::new_from_slice(key)
            .map_err(|e| DiscoveryError::InvalidArgument(format!("HMAC key rejected: {e}")))?;
        Ok(Self { keyed })
    }

    /// This format in every role
    pub fn providers(key: &[u8]) -> Result<Vec<FormatProvider>> {
        Ok(FormatProvider::all(Arc::new(Self::new(key)?)))
    }

    fn tag(&self, parts: &[&[u8]]) -> [u8; MAC_LEN] {
        let mut mac = self.keyed.clone();
        for part in parts {
            mac.update(part);
        }
        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    fn verify(&self, parts: &[&[u8]], tag: &[u8]) -> Result<()> {
        let mut mac = self.keyed.clone();
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(tag).map_err(|_| {
            global_metrics().record_integrity_failure();
            warn!(format = FORMAT_NAME, "Rejected message with invalid tag");
            DiscoveryError::malformed(constants::ERR_MAC_MISMATCH)
        })
    }

    fn check(constraints: &ResolvedConstraints) -> Result<()> {
        constraints.ensure_requirements_supported(FORMAT_NAME, SUPPORTED)
    }

    fn seal_datagrams(&self, buffers: &mut DatagramBuffers) -> Result<()> {
        let format = self.clone();
        buffers.set_trailer(MAC_LEN, move |buf: &mut BytesMut| {
            let tag = format.tag(&[&buf[..]]);
            buf.put_slice(&tag);
        })
    }

    /// Split a datagram into its signed part and tag
    fn split_tag(packet: &Bytes) -> Result<(Bytes, Bytes)> {
        body(packet, MAC_LEN)?;
        let at = packet.len() - MAC_LEN;
        Ok((packet.slice(..at), packet.slice(at..)))
    }
}

impl fmt::Debug for HmacSha256Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacSha256Format").finish_non_exhaustive()
    }
}

impl DiscoveryFormat for HmacSha256Format {
    fn format_name(&self) -> &str {
        FORMAT_NAME
    }
}

impl MulticastRequestEncoder for HmacSha256Format {
    fn encode_multicast_request(
        &self,
        request: &MulticastRequest,
        buffers: &mut DatagramBuffers,
        constraints: &ResolvedConstraints,
    ) -> Result<()> {
        Self::check(constraints)?;
        self.seal_datagrams(buffers)?;
        plaintext::write_request(request, buffers)
    }
}

impl MulticastRequestDecoder for HmacSha256Format {
    fn decode_multicast_request(
        &self,
        packet: &Bytes,
        _source: SocketAddr,
        constraints: &ResolvedConstraints,
        checker: Option<Arc<dyn ClientSubjectChecker>>,
        delay_constraint_check: bool,
    ) -> Result<PendingCheck<MulticastRequest>> {
        let request = plaintext::read_request(body(packet, MAC_LEN)?)?;
        let (signed, tag) = Self::split_tag(packet)?;
        let format = self.clone();
        let constraints = constraints.clone();
        let check = move || -> Result<()> {
            Self::check(&constraints)?;
            format.verify(&[signed.as_ref()], &tag)?;
            if let Some(checker) = &checker {
                checker.check_client_subject(None)?;
            }
            Ok(())
        };
        if delay_constraint_check {
            return Ok(PendingCheck::deferred(request, check));
        }
        check()?;
        Ok(PendingCheck::checked(request))
    }
}

impl MulticastAnnouncementEncoder for HmacSha256Format {
    fn encode_multicast_announcement(
        &self,
        announcement: &MulticastAnnouncement,
        buffers: &mut DatagramBuffers,
        constraints: &ResolvedConstraints,
    ) -> Result<()> {
        Self::check(constraints)?;
        self.seal_datagrams(buffers)?;
        plaintext::write_announcement(announcement, buffers)
    }
}

impl MulticastAnnouncementDecoder for HmacSha256Format {
    fn decode_multicast_announcement(
        &self,
        packet: &Bytes,
        constraints: &ResolvedConstraints,
        delay_constraint_check: bool,
    ) -> Result<PendingCheck<MulticastAnnouncement>> {
        let announcement = plaintext::read_announcement(body(packet, MAC_LEN)?)?;
        let (signed, tag) = Self::split_tag(packet)?;
        let format = self.clone();
        let constraints = constraints.clone();
        let check = move || -> Result<()> {
            Self::check(&constraints)?;
            format.verify(&[signed.as_ref()], &tag)
        };
        if delay_constraint_check {
            return Ok(PendingCheck::deferred(announcement, check));
        }
        check()?;
        Ok(PendingCheck::checked(announcement))
    }
}

/// Copies everything read through it
struct Transcript<'a> {
    inner: &'a mut dyn DiscoveryStream,
    seen: Vec<u8>,
}

impl Read for Transcript<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.seen.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

impl UnicastDiscoveryClient for HmacSha256Format {
    fn check_unicast_discovery_constraints(&self, constraints: &ResolvedConstraints) -> Result<()> {
        Self::check(constraints)
    }

    fn do_unicast_discovery(
        &self,
        stream: &mut dyn DiscoveryStream,
        constraints: &ResolvedConstraints,
        ctx: &MarshalContext,
        sent: &[u8],
        received: &[u8],
    ) -> Result<UnicastResponse> {
        Self::check(constraints)?;
        let mut transcript = Transcript {
            inner: stream,
            seen: Vec::new(),
        };
        let response = plaintext::read_unicast_payload(&mut transcript, ctx)?;
        let tag: [u8; MAC_LEN] = stream::read_array(transcript.inner)?;
        self.verify(&[sent, received, transcript.seen.as_slice()], &tag)?;
        Ok(response)
    }
}

impl UnicastDiscoveryServer for HmacSha256Format {
    fn check_unicast_discovery_constraints(&self, constraints: &ResolvedConstraints) -> Result<()> {
        Self::check(constraints)
    }

    fn handle_unicast_discovery(
        &self,
        response: &UnicastResponse,
        stream: &mut dyn DiscoveryStream,
        constraints: &ResolvedConstraints,
        checker: &dyn ClientSubjectChecker,
        ctx: &MarshalContext,
        received: &[u8],
        sent: &[u8],
    ) -> Result<()> {
        Self::check(constraints)?;
        checker.check_client_subject(None)?;
        let mut payload = plaintext::write_unicast_payload(response, ctx)?;
        let tag = self.tag(&[received, sent, payload.as_slice()]);
        payload.extend_from_slice(&tag);
        stream.write_all(&payload)?;
        stream.flush()?;
        Ok(())
    }
}
