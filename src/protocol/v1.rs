//! Generation-1 discovery.
//!
//! Fixed layouts, no pluggable formats and no transport security:
//!
//! ```text
//! request:      i32 version | i32 port | i32 idCount | ids | i32 groupCount | groups
//! announcement: i32 version | utf host | i32 port | id | i32 groupCount | groups
//! unicast (c):  i32 version
//! unicast (s):  registrar | i32 groupCount | groups
//! ```
//!
//! The request carries no host; it is taken from the datagram source.
//! Announcements carry no sequence number and decode with
//! [`UNKNOWN_SEQUENCE_NUMBER`].

use super::message::{
    Locator, MulticastAnnouncement, MulticastRequest, UnicastResponse, UNKNOWN_SEQUENCE_NUMBER,
};
use super::{MulticastGroups, ProtocolGeneration};
use crate::constraints::ResolvedConstraints;
use crate::core::packet::{pack_message, CountField, Datagram, DatagramBuffers, MessageLayout};
use crate::core::wire::{put_service_id, put_utf, stream, WireReader, SERVICE_ID_LEN};
use crate::error::{DiscoveryError, Result};
use crate::format::DiscoveryStream;
use crate::marshal::MarshalContext;
use crate::security::ClientSubjectChecker;
use bytes::{BufMut, Bytes};
use std::io::Write;
use std::net::SocketAddr;
use tracing::{debug, instrument};

pub const VERSION: i32 = ProtocolGeneration::V1.as_i32();

/// Upper bound on the preallocation for a streamed group list
const GROUP_PREALLOC: usize = 64;

fn read_count(r: &mut WireReader<'_>, min_item_len: usize) -> Result<usize> {
    let count = r.i32()?;
    let count = usize::try_from(count)
        .map_err(|_| DiscoveryError::malformed(format!("negative element count {count}")))?;
    r.check_count(count, min_item_len)
}

fn read_port(r: &mut WireReader<'_>) -> Result<u16> {
    let port = r.i32()?;
    u16::try_from(port).map_err(|_| DiscoveryError::malformed(format!("port {port} out of range")))
}

fn read_version(r: &mut WireReader<'_>) -> Result<()> {
    match r.i32()? {
        VERSION => Ok(()),
        other => Err(DiscoveryError::UnsupportedVersion(other)),
    }
}

/// Encode a request into as many datagrams as its groups need
pub fn encode_request(request: &MulticastRequest, capacity: usize, addr: SocketAddr) -> Result<Vec<Datagram>> {
    let mut buffers = DatagramBuffers::new(VERSION.to_be_bytes().to_vec(), capacity, addr)?;
    let prefix = i32::from(request.port()).to_be_bytes();
    pack_message(
        &mut buffers,
        &MessageLayout {
            prefix: &prefix,
            service_ids: Some((request.service_ids(), CountField::I32)),
            groups: request.groups(),
            group_count: CountField::I32,
        },
    )?;
    Ok(buffers.into_datagrams())
}

pub fn decode_request(packet: &[u8], source: SocketAddr) -> Result<MulticastRequest> {
    let mut r = WireReader::new(packet);
    read_version(&mut r)?;
    let port = read_port(&mut r)?;
    let id_count = read_count(&mut r, SERVICE_ID_LEN)?;
    let service_ids = r.service_ids(id_count)?;
    let group_count = read_count(&mut r, 2)?;
    let groups = r.utfs(group_count)?;
    r.finish()?;
    Ok(MulticastRequest::new(
        source.ip().to_string(),
        port,
        groups,
        service_ids,
    ))
}

pub fn encode_announcement(
    announcement: &MulticastAnnouncement,
    capacity: usize,
    addr: SocketAddr,
) -> Result<Vec<Datagram>> {
    let mut buffers = DatagramBuffers::new(VERSION.to_be_bytes().to_vec(), capacity, addr)?;
    let mut prefix = Vec::with_capacity(announcement.host().len() + 2 + 4 + SERVICE_ID_LEN);
    put_utf(&mut prefix, announcement.host())?;
    prefix.put_i32(i32::from(announcement.port()));
    put_service_id(&mut prefix, &announcement.service_id());
    pack_message(
        &mut buffers,
        &MessageLayout {
            prefix: &prefix,
            service_ids: None,
            groups: announcement.groups(),
            group_count: CountField::I32,
        },
    )?;
    Ok(buffers.into_datagrams())
}

pub fn decode_announcement(packet: &[u8]) -> Result<MulticastAnnouncement> {
    let mut r = WireReader::new(packet);
    read_version(&mut r)?;
    let host = r.utf()?;
    let port = read_port(&mut r)?;
    let service_id = r.service_id()?;
    let group_count = read_count(&mut r, 2)?;
    let groups = r.utfs(group_count)?;
    r.finish()?;
    Ok(MulticastAnnouncement::new(
        UNKNOWN_SEQUENCE_NUMBER,
        host,
        port,
        groups,
        service_id,
    ))
}

/// Generation-1 arm of the discovery facade
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveryV1 {
    groups: MulticastGroups,
}

impl DiscoveryV1 {
    pub fn with_groups(groups: MulticastGroups) -> Self {
        Self { groups }
    }

    pub fn groups(&self) -> MulticastGroups {
        self.groups
    }

    /// Generation 1 fulfills nothing beyond what the resolver handles itself.
    pub fn check_constraints(&self, constraints: &ResolvedConstraints) -> Result<()> {
        constraints.check_protocol_version(VERSION)?;
        constraints.ensure_requirements_supported("protocol version 1", &[])
    }

    pub fn encode_multicast_request(
        &self,
        request: &MulticastRequest,
        capacity: usize,
        constraints: &ResolvedConstraints,
    ) -> Result<Vec<Datagram>> {
        self.check_constraints(constraints)?;
        encode_request(request, capacity, self.groups.request)
    }

    pub fn decode_multicast_request(
        &self,
        packet: &Bytes,
        source: SocketAddr,
        constraints: &ResolvedConstraints,
        checker: Option<&dyn ClientSubjectChecker>,
    ) -> Result<MulticastRequest> {
        let request = decode_request(packet, source)?;
        self.check_constraints(constraints)?;
        if let Some(checker) = checker {
            checker.check_client_subject(None)?;
        }
        Ok(request)
    }

    pub fn encode_multicast_announcement(
        &self,
        announcement: &MulticastAnnouncement,
        capacity: usize,
        constraints: &ResolvedConstraints,
    ) -> Result<Vec<Datagram>> {
        self.check_constraints(constraints)?;
        encode_announcement(announcement, capacity, self.groups.announcement)
    }

    pub fn decode_multicast_announcement(
        &self,
        packet: &Bytes,
        constraints: &ResolvedConstraints,
    ) -> Result<MulticastAnnouncement> {
        let announcement = decode_announcement(packet)?;
        self.check_constraints(constraints)?;
        Ok(announcement)
    }

    /// Client side; the response host and port come from `locator`.
    #[instrument(level = "debug", skip_all, fields(locator = %locator))]
    pub fn do_unicast_discovery(
        &self,
        stream: &mut dyn DiscoveryStream,
        locator: &Locator,
        constraints: &ResolvedConstraints,
        ctx: &MarshalContext,
    ) -> Result<UnicastResponse> {
        self.check_constraints(constraints)?;
        stream.write_all(&VERSION.to_be_bytes())?;
        stream.flush()?;

        let registrar = {
            let mut input = &mut *stream;
            ctx.marshaller().read_registrar(&mut input, ctx)?
        };
        let count = stream::read_i32(&mut *stream)?;
        let count = usize::try_from(count)
            .map_err(|_| DiscoveryError::malformed(format!("negative group count {count}")))?;
        let mut groups = Vec::with_capacity(count.min(GROUP_PREALLOC));
        for _ in 0..count {
            groups.push(stream::read_utf(&mut *stream)?);
        }
        debug!(groups = groups.len(), "Received generation 1 unicast response");
        Ok(UnicastResponse::new(
            locator.host(),
            locator.port(),
            groups,
            registrar,
        ))
    }

    /// Server side, after the client's version has been consumed.
    pub fn handle_unicast_discovery(
        &self,
        response: &UnicastResponse,
        stream: &mut dyn DiscoveryStream,
        constraints: &ResolvedConstraints,
        checker: &dyn ClientSubjectChecker,
        ctx: &MarshalContext,
    ) -> Result<()> {
        self.check_constraints(constraints)?;
        checker.check_client_subject(None)?;

        let groups = response.groups();
        let count = i32::try_from(groups.len()).map_err(|_| DiscoveryError::ItemTooLong {
            kind: "group list",
            len: groups.len(),
            capacity: i32::MAX as usize,
        })?;
        let mut out = Vec::new();
        ctx.marshaller().write_registrar(response.registrar(), &mut out)?;
        out.put_i32(count);
        for group in groups {
            put_utf(&mut out, group)?;
        }
        stream.write_all(&out)?;
        stream.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::wire::ServiceId;
    use crate::protocol::MULTICAST_REQUEST_GROUP;

    fn source() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 7], 40000))
    }

    #[test]
    fn test_request_host_comes_from_source() {
        let request = MulticastRequest::new("ignored", 5000, ["public"], [ServiceId::new(1, 1)]);
        let datagrams = encode_request(&request, 512, MULTICAST_REQUEST_GROUP).unwrap();
        assert_eq!(datagrams.len(), 1);

        let decoded = decode_request(&datagrams[0].payload, source()).unwrap();
        assert_eq!(decoded.host(), "10.0.0.7");
        assert_eq!(decoded.port(), 5000);
        assert_eq!(decoded.groups(), request.groups());
        assert_eq!(decoded.service_ids(), request.service_ids());
    }

    #[test]
    fn test_announcement_has_unknown_sequence() {
        let announcement = MulticastAnnouncement::new(42, "reggie", 4160, ["a"], ServiceId::new(8, 9));
        let datagrams = encode_announcement(&announcement, 512, MULTICAST_REQUEST_GROUP).unwrap();
        let decoded = decode_announcement(&datagrams[0].payload).unwrap();
        assert_eq!(decoded.sequence_number(), UNKNOWN_SEQUENCE_NUMBER);
        assert_eq!(decoded.host(), "reggie");
        assert_eq!(decoded.service_id(), ServiceId::new(8, 9));
    }

    #[test]
    fn test_negative_counts_rejected() {
        let mut packet = Vec::new();
        packet.put_i32(VERSION);
        packet.put_i32(4160);
        packet.put_i32(-1);
        assert!(decode_request(&packet, source()).unwrap_err().is_protocol_error());
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut packet = Vec::new();
        packet.put_i32(2);
        assert!(matches!(
            decode_announcement(&packet),
            Err(DiscoveryError::UnsupportedVersion(2))
        ));
    }
}
