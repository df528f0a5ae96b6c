//! # Generation-2 Discovery Formats
//!
//! Generation 2 delegates message payloads to pluggable formats. Each format
//! declares a name; its 64-bit [`FormatId`] is derived from that name so
//! peers can route packets without a central registry.
//!
//! A format takes on any of six roles, one trait per role:
//! - [`MulticastRequestEncoder`] / [`MulticastRequestDecoder`]
//! - [`MulticastAnnouncementEncoder`] / [`MulticastAnnouncementDecoder`]
//! - [`UnicastDiscoveryClient`] / [`UnicastDiscoveryServer`]
//!
//! Providers are handed to a [`FormatRegistry`] as an explicit ordered list
//! of [`FormatProvider`] values.
//!
//! ## Built-in formats
//! - [`plaintext::Plaintext`]: no security properties
//! - [`hmac::HmacSha256Format`]: shared-key integrity for datagrams and the
//!   unicast handshake

pub mod hmac;
pub mod plaintext;
mod registry;

pub use registry::{FormatRegistry, FormatTable};

use crate::constraints::ResolvedConstraints;
use crate::core::packet::DatagramBuffers;
use crate::error::Result;
use crate::marshal::MarshalContext;
use crate::protocol::message::{MulticastAnnouncement, MulticastRequest, PendingCheck, UnicastResponse};
use crate::security::ClientSubjectChecker;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

/// 64-bit identifier of a discovery format
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FormatId(u64);

impl FormatId {
    /// Sent by a unicast server when no proposed format is acceptable
    pub const NONE: FormatId = FormatId(0);

    /// Last 8 bytes of the SHA-256 digest of the UTF-8 name, big-endian.
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&digest[digest.len() - 8..]);
        FormatId(u64::from_be_bytes(tail))
    }

    pub const fn from_raw(raw: u64) -> Self {
        FormatId(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FormatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::Debug for FormatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FormatId({self})")
    }
}

/// A byte stream carrying one unicast discovery exchange
pub trait DiscoveryStream: Read + Write {}

impl<T: Read + Write + ?Sized> DiscoveryStream for T {}

/// Common surface of every format role
pub trait DiscoveryFormat: Send + Sync {
    fn format_name(&self) -> &str;

    fn format_id(&self) -> FormatId {
        FormatId::from_name(self.format_name())
    }
}

pub trait MulticastRequestEncoder: DiscoveryFormat {
    /// Write `request` into `buffers`, whose datagrams already carry this
    /// format's header.
    fn encode_multicast_request(
        &self,
        request: &MulticastRequest,
        buffers: &mut DatagramBuffers,
        constraints: &ResolvedConstraints,
    ) -> Result<()>;
}

pub trait MulticastRequestDecoder: DiscoveryFormat {
    /// Decode a full datagram whose header has already been validated.
    ///
    /// With `delay_constraint_check` the constraint and subject checks are
    /// left to [`PendingCheck::check_constraints`]; structural validation is
    /// always eager.
    fn decode_multicast_request(
        &self,
        packet: &Bytes,
        source: SocketAddr,
        constraints: &ResolvedConstraints,
        checker: Option<Arc<dyn ClientSubjectChecker>>,
        delay_constraint_check: bool,
    ) -> Result<PendingCheck<MulticastRequest>>;
}

pub trait MulticastAnnouncementEncoder: DiscoveryFormat {
    fn encode_multicast_announcement(
        &self,
        announcement: &MulticastAnnouncement,
        buffers: &mut DatagramBuffers,
        constraints: &ResolvedConstraints,
    ) -> Result<()>;
}

pub trait MulticastAnnouncementDecoder: DiscoveryFormat {
    fn decode_multicast_announcement(
        &self,
        packet: &Bytes,
        constraints: &ResolvedConstraints,
        delay_constraint_check: bool,
    ) -> Result<PendingCheck<MulticastAnnouncement>>;
}

pub trait UnicastDiscoveryClient: DiscoveryFormat {
    /// Whether this format can run under `constraints`; failures exclude it
    /// from the proposal.
    fn check_unicast_discovery_constraints(&self, constraints: &ResolvedConstraints) -> Result<()>;

    /// Finish the exchange after the server selected this format.
    ///
    /// `sent` and `received` hold the negotiation bytes exchanged so far.
    fn do_unicast_discovery(
        &self,
        stream: &mut dyn DiscoveryStream,
        constraints: &ResolvedConstraints,
        ctx: &MarshalContext,
        sent: &[u8],
        received: &[u8],
    ) -> Result<UnicastResponse>;
}

pub trait UnicastDiscoveryServer: DiscoveryFormat {
    fn check_unicast_discovery_constraints(&self, constraints: &ResolvedConstraints) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn handle_unicast_discovery(
        &self,
        response: &UnicastResponse,
        stream: &mut dyn DiscoveryStream,
        constraints: &ResolvedConstraints,
        checker: &dyn ClientSubjectChecker,
        ctx: &MarshalContext,
        received: &[u8],
        sent: &[u8],
    ) -> Result<()>;
}

/// One format in one role, as handed to [`FormatRegistry::new`]
#[derive(Clone)]
pub enum FormatProvider {
    RequestEncoder(Arc<dyn MulticastRequestEncoder>),
    RequestDecoder(Arc<dyn MulticastRequestDecoder>),
    AnnouncementEncoder(Arc<dyn MulticastAnnouncementEncoder>),
    AnnouncementDecoder(Arc<dyn MulticastAnnouncementDecoder>),
    UnicastClient(Arc<dyn UnicastDiscoveryClient>),
    UnicastServer(Arc<dyn UnicastDiscoveryServer>),
}

impl FormatProvider {
    /// Register `format` in all six roles
    pub fn all<F>(format: Arc<F>) -> Vec<FormatProvider>
    where
        F: MulticastRequestEncoder
            + MulticastRequestDecoder
            + MulticastAnnouncementEncoder
            + MulticastAnnouncementDecoder
            + UnicastDiscoveryClient
            + UnicastDiscoveryServer
            + 'static,
    {
        vec![
            FormatProvider::RequestEncoder(format.clone()),
            FormatProvider::RequestDecoder(format.clone()),
            FormatProvider::AnnouncementEncoder(format.clone()),
            FormatProvider::AnnouncementDecoder(format.clone()),
            FormatProvider::UnicastClient(format.clone()),
            FormatProvider::UnicastServer(format),
        ]
    }

    pub fn format_name(&self) -> &str {
        match self {
            FormatProvider::RequestEncoder(p) => p.format_name(),
            FormatProvider::RequestDecoder(p) => p.format_name(),
            FormatProvider::AnnouncementEncoder(p) => p.format_name(),
            FormatProvider::AnnouncementDecoder(p) => p.format_name(),
            FormatProvider::UnicastClient(p) => p.format_name(),
            FormatProvider::UnicastServer(p) => p.format_name(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            FormatProvider::RequestEncoder(_) => "multicast request encoder",
            FormatProvider::RequestDecoder(_) => "multicast request decoder",
            FormatProvider::AnnouncementEncoder(_) => "multicast announcement encoder",
            FormatProvider::AnnouncementDecoder(_) => "multicast announcement decoder",
            FormatProvider::UnicastClient(_) => "unicast discovery client",
            FormatProvider::UnicastServer(_) => "unicast discovery server",
        }
    }
}

impl fmt::Debug for FormatProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FormatProvider({}: {})", self.role(), self.format_name())
    }
}
