//! Plaintext generation-2 format.
//!
//! Payload layouts (after the 13-byte multicast header):
//!
//! ```text
//! request:      utf host | u16 port | u16 idCount | ids | u16 groupCount | groups
//! announcement: utf host | u16 port | i64 seq | id | u16 groupCount | groups
//! unicast:      utf host | u16 port | u16 groupCount | groups | registrar
//! ```
//!
//! Offers no security properties, so any unfulfilled security requirement
//! excludes it.

use super::{
    DiscoveryFormat, DiscoveryStream, FormatProvider, MulticastAnnouncementDecoder,
    MulticastAnnouncementEncoder, MulticastRequestDecoder, MulticastRequestEncoder,
    UnicastDiscoveryClient, UnicastDiscoveryServer,
};
use crate::constraints::ResolvedConstraints;
use crate::core::packet::{pack_message, CountField, DatagramBuffers, MessageLayout};
use crate::core::wire::{put_service_id, put_utf, stream, WireReader};
use crate::error::{DiscoveryError, Result};
use crate::marshal::MarshalContext;
use crate::protocol::message::{MulticastAnnouncement, MulticastRequest, PendingCheck, UnicastResponse};
use crate::protocol::v2::MULTICAST_HEADER_LEN;
use crate::security::ClientSubjectChecker;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

pub const FORMAT_NAME: &str = "discovery.plaintext";

#[derive(Debug, Default, Clone, Copy)]
pub struct Plaintext;

impl Plaintext {
    /// This format in every role
    pub fn providers() -> Vec<FormatProvider> {
        FormatProvider::all(Arc::new(Plaintext))
    }
}

fn host_port_prefix(host: &str, port: u16) -> Result<BytesMut> {
    let mut prefix = BytesMut::with_capacity(host.len() + 4);
    put_utf(&mut prefix, host)?;
    prefix.put_u16(port);
    Ok(prefix)
}

/// Payload of a datagram past its header, with `trailer_len` bytes cut from the end
pub(crate) fn body(packet: &[u8], trailer_len: usize) -> Result<&[u8]> {
    packet
        .len()
        .checked_sub(trailer_len)
        .filter(|end| *end >= MULTICAST_HEADER_LEN)
        .map(|end| &packet[MULTICAST_HEADER_LEN..end])
        .ok_or_else(|| DiscoveryError::malformed(crate::error::constants::ERR_TRUNCATED))
}

pub(crate) fn write_request(request: &MulticastRequest, buffers: &mut DatagramBuffers) -> Result<()> {
    let prefix = host_port_prefix(request.host(), request.port())?;
    pack_message(
        buffers,
        &MessageLayout {
            prefix: &prefix,
            service_ids: Some((request.service_ids(), CountField::U16)),
            groups: request.groups(),
            group_count: CountField::U16,
        },
    )?;
    Ok(())
}

pub(crate) fn read_request(body: &[u8]) -> Result<MulticastRequest> {
    let mut r = WireReader::new(body);
    let host = r.utf()?;
    let port = r.u16()?;
    let id_count = r.u16()? as usize;
    let service_ids = r.service_ids(id_count)?;
    let group_count = r.u16()? as usize;
    let groups = r.utfs(group_count)?;
    r.finish()?;
    Ok(MulticastRequest::new(host, port, groups, service_ids))
}

pub(crate) fn write_announcement(
    announcement: &MulticastAnnouncement,
    buffers: &mut DatagramBuffers,
) -> Result<()> {
    let mut prefix = host_port_prefix(announcement.host(), announcement.port())?;
    prefix.put_i64(announcement.sequence_number());
    put_service_id(&mut prefix, &announcement.service_id());
    pack_message(
        buffers,
        &MessageLayout {
            prefix: &prefix,
            service_ids: None,
            groups: announcement.groups(),
            group_count: CountField::U16,
        },
    )?;
    Ok(())
}

pub(crate) fn read_announcement(body: &[u8]) -> Result<MulticastAnnouncement> {
    let mut r = WireReader::new(body);
    let host = r.utf()?;
    let port = r.u16()?;
    let sequence_number = r.i64()?;
    let service_id = r.service_id()?;
    let group_count = r.u16()? as usize;
    let groups = r.utfs(group_count)?;
    r.finish()?;
    Ok(MulticastAnnouncement::new(
        sequence_number,
        host,
        port,
        groups,
        service_id,
    ))
}

pub(crate) fn write_unicast_payload(response: &UnicastResponse, ctx: &MarshalContext) -> Result<Vec<u8>> {
    let groups = response.groups();
    if groups.len() > u16::MAX as usize {
        return Err(DiscoveryError::ItemTooLong {
            kind: "group list",
            len: groups.len(),
            capacity: u16::MAX as usize,
        });
    }
    let mut out = Vec::new();
    put_utf(&mut out, response.host())?;
    out.put_u16(response.port());
    out.put_u16(groups.len() as u16);
    for group in groups {
        put_utf(&mut out, group)?;
    }
    ctx.marshaller().write_registrar(response.registrar(), &mut out)?;
    Ok(out)
}

pub(crate) fn read_unicast_payload(input: &mut dyn Read, ctx: &MarshalContext) -> Result<UnicastResponse> {
    let host = stream::read_utf(input)?;
    let port = stream::read_u16(input)?;
    let group_count = stream::read_u16(input)? as usize;
    let groups = (0..group_count)
        .map(|_| stream::read_utf(input))
        .collect::<Result<Vec<_>>>()?;
    let registrar = ctx.marshaller().read_registrar(input, ctx)?;
    Ok(UnicastResponse::new(host, port, groups, registrar))
}

impl Plaintext {
    fn check(constraints: &ResolvedConstraints) -> Result<()> {
        constraints.ensure_requirements_supported(FORMAT_NAME, &[])
    }
}

impl DiscoveryFormat for Plaintext {
    fn format_name(&self) -> &str {
        FORMAT_NAME
    }
}

impl MulticastRequestEncoder for Plaintext {
    fn encode_multicast_request(
        &self,
        request: &MulticastRequest,
        buffers: &mut DatagramBuffers,
        constraints: &ResolvedConstraints,
    ) -> Result<()> {
        Self::check(constraints)?;
        write_request(request, buffers)
    }
}

impl MulticastRequestDecoder for Plaintext {
    fn decode_multicast_request(
        &self,
        packet: &Bytes,
        _source: SocketAddr,
        constraints: &ResolvedConstraints,
        checker: Option<Arc<dyn ClientSubjectChecker>>,
        delay_constraint_check: bool,
    ) -> Result<PendingCheck<MulticastRequest>> {
        let request = read_request(body(packet, 0)?)?;
        let constraints = constraints.clone();
        let check = move || -> Result<()> {
            Self::check(&constraints)?;
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

impl MulticastAnnouncementEncoder for Plaintext {
    fn encode_multicast_announcement(
        &self,
        announcement: &MulticastAnnouncement,
        buffers: &mut DatagramBuffers,
        constraints: &ResolvedConstraints,
    ) -> Result<()> {
        Self::check(constraints)?;
        write_announcement(announcement, buffers)
    }
}

impl MulticastAnnouncementDecoder for Plaintext {
    fn decode_multicast_announcement(
        &self,
        packet: &Bytes,
        constraints: &ResolvedConstraints,
        delay_constraint_check: bool,
    ) -> Result<PendingCheck<MulticastAnnouncement>> {
        let announcement = read_announcement(body(packet, 0)?)?;
        if delay_constraint_check {
            let constraints = constraints.clone();
            return Ok(PendingCheck::deferred(announcement, move || {
                Self::check(&constraints)
            }));
        }
        Self::check(constraints)?;
        Ok(PendingCheck::checked(announcement))
    }
}

impl UnicastDiscoveryClient for Plaintext {
    fn check_unicast_discovery_constraints(&self, constraints: &ResolvedConstraints) -> Result<()> {
        Self::check(constraints)
    }

    fn do_unicast_discovery(
        &self,
        stream: &mut dyn DiscoveryStream,
        constraints: &ResolvedConstraints,
        ctx: &MarshalContext,
        _sent: &[u8],
        _received: &[u8],
    ) -> Result<UnicastResponse> {
        Self::check(constraints)?;
        let mut input = &mut *stream;
        read_unicast_payload(&mut input, ctx)
    }
}

impl UnicastDiscoveryServer for Plaintext {
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
        _received: &[u8],
        _sent: &[u8],
    ) -> Result<()> {
        Self::check(constraints)?;
        checker.check_client_subject(None)?;
        let payload = write_unicast_payload(response, ctx)?;
        stream.write_all(&payload)?;
        stream.flush()?;
        Ok(())
    }
}
