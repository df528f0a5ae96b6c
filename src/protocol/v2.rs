//! Generation-2 discovery: routing to pluggable formats.
//!
//! Every multicast datagram starts with a 13-byte header:
//!
//! ```text
//! i32 version (2) | u8 packet type | u64 format id
//! ```
//!
//! Unicast discovery opens with a negotiation:
//!
//! ```text
//! client -> server: i32 version (2) | u16 count | u64 format id * count
//! server -> client: i32 version (2) | u64 selected id (0 = none acceptable)
//! ```
//!
//! after which the selected format owns the rest of the stream.

use super::discovery::EncodeStep;
use super::message::{MulticastAnnouncement, MulticastRequest, PendingCheck, UnicastResponse};
use super::{MulticastGroups, ProtocolGeneration};
use crate::constraints::ResolvedConstraints;
use crate::core::packet::DatagramBuffers;
use crate::core::wire::{stream, WireReader};
use crate::error::{constants, DiscoveryError, Result};
use crate::format::{DiscoveryStream, FormatId, FormatRegistry};
use crate::marshal::MarshalContext;
use crate::security::ClientSubjectChecker;
use crate::utils::metrics::global_metrics;
use bytes::{BufMut, Bytes};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

pub const VERSION: i32 = ProtocolGeneration::V2.as_i32();

pub const MULTICAST_HEADER_LEN: usize = 4 + 1 + 8;

/// Type octet of a generation-2 multicast datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Announcement = 0,
    Request = 1,
}

impl PacketType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Header prefixed to every datagram of one encoding
pub fn multicast_header(packet_type: PacketType, format: FormatId) -> Bytes {
    let mut header = Vec::with_capacity(MULTICAST_HEADER_LEN);
    header.put_i32(VERSION);
    header.put_u8(packet_type.as_u8());
    header.put_u64(format.as_u64());
    Bytes::from(header)
}

/// Parsed generation-2 multicast header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastHeader {
    pub version: i32,
    pub packet_type: u8,
    pub format: FormatId,
}

impl MulticastHeader {
    pub fn parse(packet: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(packet);
        Ok(Self {
            version: r.i32()?,
            packet_type: r.u8()?,
            format: FormatId::from_raw(r.u64()?),
        })
    }

    fn expect(packet: &[u8], packet_type: PacketType) -> Result<Self> {
        let header = Self::parse(packet)?;
        if header.version != VERSION {
            return Err(DiscoveryError::UnsupportedVersion(header.version));
        }
        if header.packet_type != packet_type.as_u8() {
            return Err(DiscoveryError::UnexpectedPacketType {
                expected: packet_type.as_u8(),
                found: header.packet_type,
            });
        }
        Ok(header)
    }
}

/// Generation-2 arm of the discovery facade
#[derive(Debug, Clone)]
pub struct DiscoveryV2 {
    formats: Arc<FormatRegistry>,
    groups: MulticastGroups,
}

impl DiscoveryV2 {
    pub fn new(formats: Arc<FormatRegistry>) -> Self {
        Self::with_groups(formats, MulticastGroups::default())
    }

    pub fn with_groups(formats: Arc<FormatRegistry>, groups: MulticastGroups) -> Self {
        Self { formats, groups }
    }

    pub fn groups(&self) -> MulticastGroups {
        self.groups
    }

    pub fn formats(&self) -> &Arc<FormatRegistry> {
        &self.formats
    }

    /// One lazy step per registered request encoder
    pub(crate) fn multicast_request_steps(
        &self,
        request: Arc<MulticastRequest>,
        capacity: usize,
        constraints: Arc<ResolvedConstraints>,
    ) -> Vec<(String, EncodeStep)> {
        let group = self.groups.request;
        self.formats
            .request_encoders()
            .iter()
            .map(|(id, encoder)| {
                let name = encoder.format_name().to_owned();
                let encoder = Arc::clone(encoder);
                let request = Arc::clone(&request);
                let constraints = Arc::clone(&constraints);
                let step: EncodeStep = Box::new(move || {
                    let mut buffers = DatagramBuffers::new(
                        multicast_header(PacketType::Request, id),
                        capacity,
                        group,
                    )?;
                    encoder.encode_multicast_request(&request, &mut buffers, &constraints)?;
                    Ok(buffers.into_datagrams())
                });
                (name, step)
            })
            .collect()
    }

    pub(crate) fn multicast_announcement_steps(
        &self,
        announcement: Arc<MulticastAnnouncement>,
        capacity: usize,
        constraints: Arc<ResolvedConstraints>,
    ) -> Vec<(String, EncodeStep)> {
        let group = self.groups.announcement;
        self.formats
            .announcement_encoders()
            .iter()
            .map(|(id, encoder)| {
                let name = encoder.format_name().to_owned();
                let encoder = Arc::clone(encoder);
                let announcement = Arc::clone(&announcement);
                let constraints = Arc::clone(&constraints);
                let step: EncodeStep = Box::new(move || {
                    let mut buffers = DatagramBuffers::new(
                        multicast_header(PacketType::Announcement, id),
                        capacity,
                        group,
                    )?;
                    encoder.encode_multicast_announcement(&announcement, &mut buffers, &constraints)?;
                    Ok(buffers.into_datagrams())
                });
                (name, step)
            })
            .collect()
    }

    pub fn decode_multicast_request(
        &self,
        packet: &Bytes,
        source: SocketAddr,
        constraints: &ResolvedConstraints,
        checker: Option<Arc<dyn ClientSubjectChecker>>,
        delay_constraint_check: bool,
    ) -> Result<PendingCheck<MulticastRequest>> {
        let header = MulticastHeader::expect(packet, PacketType::Request)?;
        constraints.check_protocol_version(VERSION)?;
        let decoder = self
            .formats
            .request_decoders()
            .get(header.format)
            .ok_or_else(|| reject_format(header.format))?;
        trace!(format = decoder.format_name(), %source, "Decoding multicast request");
        decoder.decode_multicast_request(packet, source, constraints, checker, delay_constraint_check)
    }

    pub fn decode_multicast_announcement(
        &self,
        packet: &Bytes,
        constraints: &ResolvedConstraints,
        delay_constraint_check: bool,
    ) -> Result<PendingCheck<MulticastAnnouncement>> {
        let header = MulticastHeader::expect(packet, PacketType::Announcement)?;
        constraints.check_protocol_version(VERSION)?;
        let decoder = self
            .formats
            .announcement_decoders()
            .get(header.format)
            .ok_or_else(|| reject_format(header.format))?;
        trace!(format = decoder.format_name(), "Decoding multicast announcement");
        decoder.decode_multicast_announcement(packet, constraints, delay_constraint_check)
    }

    /// Propose every client format that accepts `constraints`, in
    /// registration order, and finish with whichever the server selects.
    ///
    /// # Errors
    /// - the last constraint or authorization failure when no format qualifies
    /// - `NegotiationFailed` when there are no formats, the server rejects the
    ///   proposal, or it selects a format that was not proposed
    #[instrument(level = "debug", skip_all)]
    pub fn do_unicast_discovery(
        &self,
        stream: &mut dyn DiscoveryStream,
        constraints: &ResolvedConstraints,
        ctx: &MarshalContext,
    ) -> Result<UnicastResponse> {
        global_metrics().record_negotiation_started();
        let result = self.negotiate_client(stream, constraints, ctx);
        match &result {
            Ok(_) => global_metrics().record_negotiation_succeeded(),
            Err(_) => global_metrics().record_negotiation_failed(),
        }
        result
    }

    fn negotiate_client(
        &self,
        stream: &mut dyn DiscoveryStream,
        constraints: &ResolvedConstraints,
        ctx: &MarshalContext,
    ) -> Result<UnicastResponse> {
        constraints.check_protocol_version(VERSION)?;

        let mut last_failure = None;
        let mut candidates = Vec::new();
        for (id, client) in self.formats.unicast_clients().iter() {
            match client.check_unicast_discovery_constraints(constraints) {
                Ok(()) => candidates.push((id, client)),
                Err(e @ (DiscoveryError::UnsupportedConstraint(_) | DiscoveryError::AccessDenied(_))) => {
                    debug!(format = client.format_name(), error = %e, "Excluding unicast format");
                    last_failure = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        if candidates.is_empty() {
            return Err(last_failure
                .unwrap_or_else(|| DiscoveryError::NegotiationFailed(constants::ERR_NO_FORMATS.into())));
        }
        if candidates.len() > u16::MAX as usize {
            warn!(count = candidates.len(), "Too many unicast formats, proposing the first 65535");
            candidates.truncate(u16::MAX as usize);
        }

        let mut sent = Vec::with_capacity(6 + 8 * candidates.len());
        sent.put_i32(VERSION);
        sent.put_u16(candidates.len() as u16);
        for (id, _) in &candidates {
            sent.put_u64(id.as_u64());
        }
        stream.write_all(&sent)?;
        stream.flush()?;

        let received: [u8; 12] = stream::read_array(&mut *stream)?;
        let mut r = WireReader::new(&received);
        let version = r.i32()?;
        if version != VERSION {
            return Err(DiscoveryError::UnsupportedVersion(version));
        }
        let selected = FormatId::from_raw(r.u64()?);
        if selected.is_none() {
            return Err(DiscoveryError::NegotiationFailed(constants::ERR_SERVER_REJECTED.into()));
        }
        let (_, client) = candidates
            .iter()
            .find(|(id, _)| *id == selected)
            .ok_or_else(|| {
                DiscoveryError::NegotiationFailed(format!("{}: {selected}", constants::ERR_UNPROPOSED_FORMAT))
            })?;
        debug!(format = client.format_name(), "Server selected unicast format");
        client.do_unicast_discovery(stream, constraints, ctx, &sent, &received)
    }

    /// Server side, after the client's version has been consumed.
    ///
    /// Selects the first proposed format this side supports and whose
    /// constraint check passes. The selection, or the zero identifier, is
    /// always written back before any failure is reported.
    #[instrument(level = "debug", skip_all)]
    pub fn handle_unicast_discovery(
        &self,
        response: &UnicastResponse,
        stream: &mut dyn DiscoveryStream,
        constraints: &ResolvedConstraints,
        checker: &dyn ClientSubjectChecker,
        ctx: &MarshalContext,
    ) -> Result<()> {
        constraints.check_protocol_version(VERSION)?;

        let count_bytes: [u8; 2] = stream::read_array(&mut *stream)?;
        let count = u16::from_be_bytes(count_bytes) as usize;
        let id_bytes = stream::read_vec(&mut *stream, count * 8)?;

        let mut received = Vec::with_capacity(4 + 2 + id_bytes.len());
        received.put_i32(VERSION);
        received.put_slice(&count_bytes);
        received.put_slice(&id_bytes);

        let proposed: Vec<FormatId> = id_bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                FormatId::from_raw(u64::from_be_bytes(raw))
            })
            .collect();

        let mut chosen = None;
        for id in &proposed {
            let Some(server) = self.formats.unicast_servers().get(*id) else {
                continue;
            };
            match server.check_unicast_discovery_constraints(constraints) {
                Ok(()) => {
                    chosen = Some((*id, server));
                    break;
                }
                Err(e) => debug!(format = server.format_name(), error = %e, "Skipping unicast format"),
            }
        }

        let selected = chosen.map_or(FormatId::NONE, |(id, _)| id);
        let mut sent = Vec::with_capacity(12);
        sent.put_i32(VERSION);
        sent.put_u64(selected.as_u64());
        stream.write_all(&sent)?;
        stream.flush()?;

        let Some((_, server)) = chosen else {
            global_metrics().record_format_rejection();
            return Err(DiscoveryError::NegotiationFailed(format!(
                "{}: {proposed:?}",
                constants::ERR_NO_MATCHING_FORMAT
            )));
        };
        debug!(format = server.format_name(), "Selected unicast format");
        server.handle_unicast_discovery(response, stream, constraints, checker, ctx, &received, &sent)
    }
}

fn reject_format(id: FormatId) -> DiscoveryError {
    global_metrics().record_format_rejection();
    debug!(format_id = %id, "No decoder for format");
    DiscoveryError::UnsupportedFormat(id)
}
