//! Multicast send and receive.
//!
//! Datagrams carry their destination group; [`send_batches_to`] redirects
//! them, which loopback tests and unicast relays rely on.

use crate::config::MulticastConfig;
use crate::constraints::{InvocationConstraints, ResolvedConstraints};
use crate::core::packet::Datagram;
use crate::error::{DiscoveryError, Result};
use crate::protocol::{
    Discovery, EncodeIter, MulticastAnnouncement, MulticastRequest, DEFAULT_MAX_PACKET_SIZE,
    DEFAULT_TIME_TO_LIVE,
};
use crate::security::ClientSubjectChecker;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, instrument, warn};

/// Receive buffer; large enough for any UDP payload
pub const RECV_BUFFER_SIZE: usize = 65_536;

/// Outcome of sending an [`EncodeIter`]
#[derive(Debug, Default)]
pub struct SendSummary {
    pub datagrams_sent: usize,
    pub bytes_sent: usize,
    /// Encoders that failed; their batches were skipped
    pub failed_formats: Vec<DiscoveryError>,
}

/// Unbound sender socket on `interface`, multicast loop enabled
pub async fn bind_sender(interface: Option<Ipv4Addr>) -> Result<UdpSocket> {
    let local = SocketAddr::new(IpAddr::V4(interface.unwrap_or(Ipv4Addr::UNSPECIFIED)), 0);
    let socket = UdpSocket::bind(local).await?;
    socket.set_multicast_loop_v4(true)?;
    Ok(socket)
}

/// Socket joined to `group` on `interface` (any interface when `None`)
#[instrument(level = "debug")]
pub async fn bind_listener(group: SocketAddr, interface: Option<Ipv4Addr>) -> Result<UdpSocket> {
    let IpAddr::V4(group_ip) = group.ip() else {
        return Err(DiscoveryError::InvalidArgument(format!(
            "only IPv4 multicast groups are supported: {group}"
        )));
    };
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port())).await?;
    socket.join_multicast_v4(group_ip, interface.unwrap_or(Ipv4Addr::UNSPECIFIED))?;
    debug!(%group, "Joined multicast group");
    Ok(socket)
}

/// Sender on the configured interface
pub async fn sender_for(config: &MulticastConfig) -> Result<UdpSocket> {
    bind_sender(config.interface_addr()?).await
}

/// Lookup-service socket on the configured request group and interface
pub async fn request_listener(config: &MulticastConfig) -> Result<UdpSocket> {
    bind_listener(config.request_group_addr()?, config.interface_addr()?).await
}

pub async fn announcement_listener(config: &MulticastConfig) -> Result<UdpSocket> {
    bind_listener(config.announcement_group_addr()?, config.interface_addr()?).await
}

/// Send every batch to the group each datagram names.
pub async fn send_batches(socket: &UdpSocket, batches: EncodeIter) -> Result<SendSummary> {
    send(socket, batches, None).await
}

/// Send every batch to `target` instead of the datagrams' own group.
pub async fn send_batches_to(socket: &UdpSocket, batches: EncodeIter, target: SocketAddr) -> Result<SendSummary> {
    send(socket, batches, Some(target)).await
}

async fn send(socket: &UdpSocket, batches: EncodeIter, target: Option<SocketAddr>) -> Result<SendSummary> {
    let mut summary = SendSummary::default();
    for batch in batches {
        let datagrams = match batch {
            Ok(datagrams) => datagrams,
            Err(e) => {
                warn!(error = %e, "Skipping multicast batch");
                summary.failed_formats.push(e);
                continue;
            }
        };
        for datagram in datagrams {
            let addr = target.unwrap_or(datagram.addr);
            socket.send_to(&datagram.payload, addr).await?;
            summary.datagrams_sent += 1;
            summary.bytes_sent += datagram.len();
        }
    }
    if summary.datagrams_sent == 0 {
        if let Some(e) = summary.failed_formats.pop() {
            return Err(e);
        }
    }
    Ok(summary)
}

/// Encode `request`, apply the resolved time-to-live and send it.
#[instrument(level = "debug", skip_all, fields(generation = %discovery.generation()))]
pub async fn send_request(
    socket: &UdpSocket,
    discovery: &Discovery,
    request: &MulticastRequest,
    constraints: &InvocationConstraints,
) -> Result<SendSummary> {
    apply_ttl(socket, constraints)?;
    let batches = discovery.encode_multicast_request(request, DEFAULT_MAX_PACKET_SIZE, constraints)?;
    send_batches(socket, batches).await
}

#[instrument(level = "debug", skip_all, fields(generation = %discovery.generation()))]
pub async fn send_announcement(
    socket: &UdpSocket,
    discovery: &Discovery,
    announcement: &MulticastAnnouncement,
    constraints: &InvocationConstraints,
) -> Result<SendSummary> {
    apply_ttl(socket, constraints)?;
    let batches =
        discovery.encode_multicast_announcement(announcement, DEFAULT_MAX_PACKET_SIZE, constraints)?;
    send_batches(socket, batches).await
}

fn apply_ttl(socket: &UdpSocket, constraints: &InvocationConstraints) -> Result<()> {
    let ttl = ResolvedConstraints::resolve(constraints)?.multicast_time_to_live(DEFAULT_TIME_TO_LIVE);
    socket.set_multicast_ttl_v4(u32::from(ttl))?;
    Ok(())
}

/// Next datagram, tagged with its sender
pub async fn recv_datagram(socket: &UdpSocket) -> Result<Datagram> {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let (n, source) = socket.recv_from(&mut buf).await?;
    buf.truncate(n);
    Ok(Datagram::new(source, Bytes::from(buf)))
}

/// Receive and fully check one multicast request
pub async fn recv_request(
    socket: &UdpSocket,
    discovery: &Discovery,
    constraints: &InvocationConstraints,
    checker: Option<Arc<dyn ClientSubjectChecker>>,
) -> Result<MulticastRequest> {
    let datagram = recv_datagram(socket).await?;
    discovery.decode_multicast_request_checked(&datagram, constraints, checker)
}

pub async fn recv_announcement(
    socket: &UdpSocket,
    discovery: &Discovery,
    constraints: &InvocationConstraints,
) -> Result<MulticastAnnouncement> {
    let datagram = recv_datagram(socket).await?;
    discovery.decode_multicast_announcement_checked(&datagram, constraints)
}
