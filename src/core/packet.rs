//! # Datagram Assembly
//!
//! Splits a logical discovery message into one or more bounded datagrams.
//!
//! [`DatagramBuffers`] hands out buffers that already carry the protocol
//! header (the version for generation 1; version, packet type and format
//! identifier for generation 2). [`pack_message`] lays a message out across
//! those buffers:
//!
//! ```text
//! [header] [prefix] [idCount] [ids...] [groupCount] [groups...]
//! ```
//!
//! The identifier list is truncated to whatever fits next to the largest
//! group and repeated in every datagram. Groups are packed greedily; when one
//! does not fit the current datagram is sealed and a new one is opened, so
//! every datagram decodes on its own.

use crate::core::wire::{put_service_id, put_utf, utf_len, ServiceId, MAX_UTF_LEN, SERVICE_ID_LEN};
use crate::error::{constants, DiscoveryError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use tracing::debug;

/// Smallest maximum packet size any encoder accepts
pub const MIN_PACKET_SIZE: usize = 512;

/// Unused capacity above this many bytes is released when a datagram is sealed
const TRIM_SLACK: usize = 64;

type Sealer = Box<dyn Fn(&mut BytesMut) + Send + Sync>;

/// An encoded datagram and the multicast group it is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub addr: SocketAddr,
    pub payload: Bytes,
}

impl Datagram {
    pub fn new(addr: SocketAddr, payload: impl Into<Bytes>) -> Self {
        Self {
            addr,
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Factory of header-prefixed, size-bounded datagram buffers
pub struct DatagramBuffers {
    header: Bytes,
    capacity: usize,
    trailer_len: usize,
    sealer: Option<Sealer>,
    addr: SocketAddr,
    current: Option<BytesMut>,
    sealed: Vec<Bytes>,
}

impl fmt::Debug for DatagramBuffers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramBuffers")
            .field("header_len", &self.header.len())
            .field("capacity", &self.capacity)
            .field("trailer_len", &self.trailer_len)
            .field("addr", &self.addr)
            .field("sealed", &self.sealed.len())
            .finish()
    }
}

impl DatagramBuffers {
    /// # Errors
    /// `InvalidArgument` when `capacity` is below [`MIN_PACKET_SIZE`]; that is a
    /// caller error, not a protocol failure.
    pub fn new(header: impl Into<Bytes>, capacity: usize, addr: SocketAddr) -> Result<Self> {
        if capacity < MIN_PACKET_SIZE {
            return Err(DiscoveryError::InvalidArgument(format!(
                "{}: {capacity} < {MIN_PACKET_SIZE}",
                constants::ERR_PACKET_TOO_SMALL
            )));
        }
        let header = header.into();
        if header.len() >= capacity {
            return Err(DiscoveryError::InvalidArgument(format!(
                "header of {} bytes leaves no room in {capacity}-byte packet",
                header.len()
            )));
        }
        Ok(Self {
            header,
            capacity,
            trailer_len: 0,
            sealer: None,
            addr,
            current: None,
            sealed: Vec::new(),
        })
    }

    /// Reserve `len` bytes at the end of every datagram and fill them at seal time.
    ///
    /// The sealer receives the complete datagram and must append exactly `len` bytes.
    pub fn set_trailer<F>(&mut self, len: usize, sealer: F) -> Result<()>
    where
        F: Fn(&mut BytesMut) + Send + Sync + 'static,
    {
        if self.header.len() + len >= self.capacity {
            return Err(DiscoveryError::InvalidArgument(format!(
                "trailer of {len} bytes leaves no room in {}-byte packet",
                self.capacity
            )));
        }
        self.trailer_len = len;
        self.sealer = Some(Box::new(sealer));
        Ok(())
    }

    pub fn header_len(&self) -> usize {
        self.header.len()
    }

    /// Maximum datagram size including header and trailer
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes available for header and payload in each datagram
    pub fn usable_capacity(&self) -> usize {
        self.capacity - self.trailer_len
    }

    /// Bytes still free in the current datagram
    pub fn remaining(&self) -> usize {
        let used = self
            .current
            .as_ref()
            .map_or(self.header.len(), BytesMut::len);
        self.usable_capacity().saturating_sub(used)
    }

    /// Seal the current datagram, if any, and start a fresh one
    pub fn open(&mut self) -> &mut BytesMut {
        self.seal();
        let mut buf = BytesMut::with_capacity(self.capacity);
        buf.put_slice(&self.header);
        self.current.insert(buf)
    }

    /// The datagram being filled, opened on first use
    pub fn current(&mut self) -> &mut BytesMut {
        match self.current {
            Some(ref mut buf) => buf,
            None => self.open(),
        }
    }

    pub fn seal(&mut self) {
        let Some(mut buf) = self.current.take() else {
            return;
        };
        if let Some(sealer) = &self.sealer {
            sealer(&mut buf);
        }
        let packet = if buf.capacity() - buf.len() > TRIM_SLACK {
            Bytes::copy_from_slice(&buf)
        } else {
            buf.freeze()
        };
        self.sealed.push(packet);
    }

    pub fn into_datagrams(mut self) -> Vec<Datagram> {
        self.seal();
        let addr = self.addr;
        self.sealed
            .into_iter()
            .map(|payload| Datagram { addr, payload })
            .collect()
    }
}

/// Width of a count prefix on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountField {
    U16,
    I32,
}

impl CountField {
    pub fn len(self) -> usize {
        match self {
            CountField::U16 => 2,
            CountField::I32 => 4,
        }
    }

    pub fn max(self) -> usize {
        match self {
            CountField::U16 => u16::MAX as usize,
            CountField::I32 => i32::MAX as usize,
        }
    }

    fn put(self, buf: &mut BytesMut, n: usize) {
        match self {
            CountField::U16 => buf.put_u16(n as u16),
            CountField::I32 => buf.put_i32(n as i32),
        }
    }

    fn patch(self, buf: &mut BytesMut, pos: usize, n: usize) {
        match self {
            CountField::U16 => buf[pos..pos + 2].copy_from_slice(&(n as u16).to_be_bytes()),
            CountField::I32 => buf[pos..pos + 4].copy_from_slice(&(n as i32).to_be_bytes()),
        }
    }
}

/// Message body laid out after the header of each datagram
#[derive(Debug, Clone, Copy)]
pub struct MessageLayout<'a> {
    /// Fixed fields repeated in every datagram (host, port, sequence...)
    pub prefix: &'a [u8],
    /// Known identifiers and the width of their count field, if the message carries them
    pub service_ids: Option<(&'a [ServiceId], CountField)>,
    pub groups: &'a [String],
    pub group_count: CountField,
}

/// Lay a message out across as many datagrams as needed.
///
/// Returns how many service identifiers were included in each datagram.
///
/// # Errors
/// `ItemTooLong` when the fixed fields plus a single group cannot fit in an
/// empty datagram.
pub fn pack_message(buffers: &mut DatagramBuffers, layout: &MessageLayout<'_>) -> Result<usize> {
    let usable = buffers.usable_capacity();
    let id_field = layout.service_ids.map_or(0, |(_, field)| field.len());
    let fixed = buffers.header_len() + layout.prefix.len() + id_field + layout.group_count.len();

    let mut largest = 0;
    for group in layout.groups {
        if group.len() > MAX_UTF_LEN {
            return Err(DiscoveryError::ItemTooLong {
                kind: "group",
                len: group.len(),
                capacity: MAX_UTF_LEN,
            });
        }
        largest = largest.max(utf_len(group));
    }
    if fixed + largest > usable {
        return Err(DiscoveryError::ItemTooLong {
            kind: if largest > 0 { "group" } else { "message" },
            len: fixed + largest,
            capacity: usable,
        });
    }

    let ids = match layout.service_ids {
        Some((ids, field)) => {
            let room = (usable - fixed - largest) / SERVICE_ID_LEN;
            let n = ids.len().min(room).min(field.max());
            if n < ids.len() {
                debug!(
                    included = n,
                    total = ids.len(),
                    "Truncated known service id list to fit packet"
                );
            }
            &ids[..n]
        }
        None => &[],
    };

    let mut count_pos = start_datagram(buffers, layout, ids);
    let mut count = 0;
    for group in layout.groups {
        let len = utf_len(group);
        if buffers.remaining() < len || count == layout.group_count.max() {
            layout
                .group_count
                .patch(buffers.current(), count_pos, count);
            count_pos = start_datagram(buffers, layout, ids);
            count = 0;
        }
        put_utf(buffers.current(), group)?;
        count += 1;
    }
    layout
        .group_count
        .patch(buffers.current(), count_pos, count);
    buffers.seal();

    Ok(ids.len())
}

fn start_datagram(buffers: &mut DatagramBuffers, layout: &MessageLayout<'_>, ids: &[ServiceId]) -> usize {
    let buf = buffers.open();
    buf.put_slice(layout.prefix);
    if let Some((_, field)) = layout.service_ids {
        field.put(buf, ids.len());
        for id in ids {
            put_service_id(buf, id);
        }
    }
    let pos = buf.len();
    layout.group_count.put(buf, 0);
    pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::wire::WireReader;

    fn addr() -> SocketAddr {
        SocketAddr::from(([224, 0, 1, 85], 4160))
    }

    fn decode_groups(packet: &[u8], header_len: usize, prefix_len: usize) -> (usize, Vec<String>) {
        let mut r = WireReader::new(&packet[header_len + prefix_len..]);
        let ids = r.u16().unwrap() as usize;
        r.service_ids(ids).unwrap();
        let n = r.u16().unwrap() as usize;
        let groups = r.utfs(n).unwrap();
        r.finish().unwrap();
        (ids, groups)
    }

    #[test]
    fn test_rejects_undersized_capacity() {
        let err = DatagramBuffers::new(vec![0u8; 4], 100, addr()).unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidArgument(_)));
    }

    #[test]
    fn test_current_opens_once_and_reuses_buffer() {
        let mut buffers = DatagramBuffers::new(vec![0xABu8, 0xCD], 512, addr()).unwrap();
        assert_eq!(&buffers.current()[..], b"\xAB\xCD");
        buffers.current().put_u8(7);
        assert_eq!(&buffers.current()[..], b"\xAB\xCD\x07");

        buffers.seal();
        assert_eq!(&buffers.current()[..], b"\xAB\xCD");
        let datagrams = buffers.into_datagrams();
        assert_eq!(datagrams.len(), 2);
        assert_eq!(&datagrams[0].payload[..], b"\xAB\xCD\x07");
    }

    #[test]
    fn test_empty_message_is_single_minimal_datagram() {
        let mut buffers = DatagramBuffers::new(vec![0, 0, 0, 2], 512, addr()).unwrap();
        let layout = MessageLayout {
            prefix: &[],
            service_ids: Some((&[], CountField::U16)),
            groups: &[],
            group_count: CountField::U16,
        };
        assert_eq!(pack_message(&mut buffers, &layout).unwrap(), 0);
        let datagrams = buffers.into_datagrams();
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0].len(), 4 + 2 + 2);
    }

    #[test]
    fn test_groups_split_across_datagrams() {
        let groups: Vec<String> = (0..40).map(|i| format!("group-{i:02}-{}", "x".repeat(40))).collect();
        let mut buffers = DatagramBuffers::new(vec![0, 0, 0, 2], 512, addr()).unwrap();
        let layout = MessageLayout {
            prefix: b"pfx",
            service_ids: Some((&[ServiceId::new(1, 2)], CountField::U16)),
            groups: &groups,
            group_count: CountField::U16,
        };
        pack_message(&mut buffers, &layout).unwrap();
        let datagrams = buffers.into_datagrams();
        assert!(datagrams.len() >= 2);

        let mut seen = Vec::new();
        for d in &datagrams {
            assert!(d.len() <= 512);
            let (ids, groups) = decode_groups(&d.payload, 4, 3);
            assert_eq!(ids, 1);
            seen.extend(groups);
        }
        assert_eq!(seen, groups);
    }

    #[test]
    fn test_ids_truncated_to_leave_room_for_largest_group() {
        let ids: Vec<ServiceId> = (0..100).map(|i| ServiceId::new(i, i)).collect();
        let groups = vec!["g".repeat(200)];
        let mut buffers = DatagramBuffers::new(vec![0, 0, 0, 2], 512, addr()).unwrap();
        let layout = MessageLayout {
            prefix: &[],
            service_ids: Some((&ids, CountField::U16)),
            groups: &groups,
            group_count: CountField::U16,
        };
        let included = pack_message(&mut buffers, &layout).unwrap();
        assert_eq!(included, (512 - 8 - 202) / 16);
        let datagrams = buffers.into_datagrams();
        assert_eq!(datagrams.len(), 1);
    }

    #[test]
    fn test_group_too_long_for_empty_datagram() {
        let groups = vec!["g".repeat(600)];
        let mut buffers = DatagramBuffers::new(vec![0, 0, 0, 2], 512, addr()).unwrap();
        let layout = MessageLayout {
            prefix: &[],
            service_ids: None,
            groups: &groups,
            group_count: CountField::I32,
        };
        assert!(matches!(
            pack_message(&mut buffers, &layout),
            Err(DiscoveryError::ItemTooLong { kind: "group", .. })
        ));
    }

    #[test]
    fn test_trailer_is_appended_and_reserved() {
        let groups: Vec<String> = (0..30).map(|i| format!("{i}{}", "y".repeat(30))).collect();
        let mut buffers = DatagramBuffers::new(vec![9; 13], 512, addr()).unwrap();
        buffers
            .set_trailer(4, |buf: &mut BytesMut| buf.put_slice(&[0xAA; 4]))
            .unwrap();
        let layout = MessageLayout {
            prefix: &[],
            service_ids: None,
            groups: &groups,
            group_count: CountField::U16,
        };
        pack_message(&mut buffers, &layout).unwrap();
        for d in buffers.into_datagrams() {
            assert!(d.len() <= 512);
            assert_eq!(&d.payload[d.len() - 4..], &[0xAA; 4]);
        }
    }
}
