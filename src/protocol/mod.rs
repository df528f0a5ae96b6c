//! # Discovery Protocol
//!
//! Two wire generations share the same messages:
//!
//! | Generation | Multicast header                     | Payload layout           |
//! |------------|--------------------------------------|--------------------------|
//! | 1          | `i32` version                        | fixed, built in          |
//! | 2          | `i32` version, `u8` type, `u64` format | owned by a pluggable format |
//!
//! [`Discovery`] is the facade over both; [`DiscoveryCache`] hands out
//! generation-2 facades per loading context.

pub mod discovery;
pub mod message;
pub mod v1;
pub mod v2;

pub use discovery::{peek_version, serve_unicast_discovery, Discovery, DiscoveryCache, EncodeIter};
pub use message::{
    Locator, MulticastAnnouncement, MulticastRequest, PendingCheck, UnicastResponse,
    UNKNOWN_SEQUENCE_NUMBER,
};

use crate::error::DiscoveryError;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Well-known port for unicast discovery and both multicast groups
pub const DISCOVERY_PORT: u16 = 4160;

/// Group that lookup services listen on for requests
pub const MULTICAST_REQUEST_GROUP: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(224, 0, 1, 85), DISCOVERY_PORT));

/// Group that clients listen on for announcements
pub const MULTICAST_ANNOUNCEMENT_GROUP: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(224, 0, 1, 84), DISCOVERY_PORT));

/// Destination groups stamped on encoded multicast datagrams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MulticastGroups {
    pub request: SocketAddr,
    pub announcement: SocketAddr,
}

impl Default for MulticastGroups {
    fn default() -> Self {
        Self {
            request: MULTICAST_REQUEST_GROUP,
            announcement: MULTICAST_ANNOUNCEMENT_GROUP,
        }
    }
}

pub const DEFAULT_MAX_PACKET_SIZE: usize = crate::core::packet::MIN_PACKET_SIZE;
pub const DEFAULT_TIME_TO_LIVE: u8 = 15;
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);

/// Wire protocol generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum ProtocolGeneration {
    V1 = 1,
    V2 = 2,
}

impl ProtocolGeneration {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for ProtocolGeneration {
    type Error = DiscoveryError;

    fn try_from(version: i32) -> Result<Self, Self::Error> {
        match version {
            1 => Ok(ProtocolGeneration::V1),
            2 => Ok(ProtocolGeneration::V2),
            other => Err(DiscoveryError::UnsupportedVersion(other)),
        }
    }
}

impl fmt::Display for ProtocolGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_i32())
    }
}
