//! # Wire Primitives
//!
//! Big-endian field codecs shared by both protocol generations.
//!
//! Strings are written as a 16-bit byte length followed by UTF-8 bytes.
//! Service identifiers are two big-endian 64-bit halves.
//!
//! Every read is bounds-checked against the remaining input before any
//! allocation, so adversarial counts and lengths fail with
//! [`DiscoveryError::Malformed`] instead of panicking.

use crate::error::{constants, DiscoveryError, Result};
use bytes::{Buf, BufMut};
use std::fmt;
use std::io::Read;

/// Encoded size of a service identifier
pub const SERVICE_ID_LEN: usize = 16;

/// Largest byte length a length-prefixed string can carry
pub const MAX_UTF_LEN: usize = u16::MAX as usize;

/// 128-bit identifier of a lookup service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId {
    most_significant: u64,
    least_significant: u64,
}

impl ServiceId {
    pub const fn new(most_significant: u64, least_significant: u64) -> Self {
        Self {
            most_significant,
            least_significant,
        }
    }

    pub fn most_significant_bits(&self) -> u64 {
        self.most_significant
    }

    pub fn least_significant_bits(&self) -> u64 {
        self.least_significant
    }

    pub fn from_bytes(bytes: [u8; SERVICE_ID_LEN]) -> Self {
        let mut buf = &bytes[..];
        Self::new(buf.get_u64(), buf.get_u64())
    }

    pub fn to_bytes(&self) -> [u8; SERVICE_ID_LEN] {
        let mut out = [0u8; SERVICE_ID_LEN];
        out[..8].copy_from_slice(&self.most_significant.to_be_bytes());
        out[8..].copy_from_slice(&self.least_significant.to_be_bytes());
        out
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{}-{}-{}-{}-{}",
            hex::encode(&b[0..4]),
            hex::encode(&b[4..6]),
            hex::encode(&b[6..8]),
            hex::encode(&b[8..10]),
            hex::encode(&b[10..16])
        )
    }
}

/// Encoded size of a length-prefixed string
pub fn utf_len(s: &str) -> usize {
    2 + s.len()
}

/// Write a length-prefixed UTF-8 string
pub fn put_utf<B: BufMut>(buf: &mut B, s: &str) -> Result<()> {
    if s.len() > MAX_UTF_LEN {
        return Err(DiscoveryError::ItemTooLong {
            kind: "string",
            len: s.len(),
            capacity: MAX_UTF_LEN,
        });
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub fn put_service_id<B: BufMut>(buf: &mut B, id: &ServiceId) {
    buf.put_u64(id.most_significant);
    buf.put_u64(id.least_significant);
}

/// Bounds-checked reader over an untrusted datagram
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Unread tail of the input
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.len() < n {
            Err(DiscoveryError::malformed(constants::ERR_TRUNCATED))
        } else {
            Ok(())
        }
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn utf(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|e| DiscoveryError::malformed_by(constants::ERR_INVALID_UTF8, e))
    }

    pub fn service_id(&mut self) -> Result<ServiceId> {
        self.need(SERVICE_ID_LEN)?;
        Ok(ServiceId::new(self.buf.get_u64(), self.buf.get_u64()))
    }

    /// Validate a declared element count against the bytes left.
    ///
    /// `min_item_len` is the smallest encoding of one element.
    pub fn check_count(&self, count: usize, min_item_len: usize) -> Result<usize> {
        match count.checked_mul(min_item_len) {
            Some(needed) if needed <= self.buf.len() => Ok(count),
            _ => Err(DiscoveryError::malformed(constants::ERR_COUNT_EXCEEDS_BUFFER)),
        }
    }

    pub fn service_ids(&mut self, count: usize) -> Result<Vec<ServiceId>> {
        self.check_count(count, SERVICE_ID_LEN)?;
        (0..count).map(|_| self.service_id()).collect()
    }

    pub fn utfs(&mut self, count: usize) -> Result<Vec<String>> {
        self.check_count(count, 2)?;
        (0..count).map(|_| self.utf()).collect()
    }

    pub fn finish(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DiscoveryError::malformed(constants::ERR_TRAILING_BYTES))
        }
    }
}

/// Stream-side counterparts used by the unicast handshake.
///
/// A stream that ends before a field is complete is a protocol failure, so
/// `UnexpectedEof` is wrapped; every other I/O error passes through.
pub(crate) mod stream {
    use super::*;
    use std::io;

    fn read_exact<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> Result<()> {
        r.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                DiscoveryError::malformed_by(constants::ERR_TRUNCATED_STREAM, e)
            } else {
                DiscoveryError::Io(e)
            }
        })
    }

    pub fn read_array<const N: usize, R: Read + ?Sized>(r: &mut R) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        read_exact(r, &mut buf)?;
        Ok(buf)
    }

    pub fn read_u16<R: Read + ?Sized>(r: &mut R) -> Result<u16> {
        Ok(u16::from_be_bytes(read_array(r)?))
    }

    pub fn read_i32<R: Read + ?Sized>(r: &mut R) -> Result<i32> {
        Ok(i32::from_be_bytes(read_array(r)?))
    }

    pub fn read_u64<R: Read + ?Sized>(r: &mut R) -> Result<u64> {
        Ok(u64::from_be_bytes(read_array(r)?))
    }

    pub fn read_vec<R: Read + ?Sized>(r: &mut R, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        read_exact(r, &mut buf)?;
        Ok(buf)
    }

    pub fn read_utf<R: Read + ?Sized>(r: &mut R) -> Result<String> {
        let len = read_u16(r)? as usize;
        let raw = read_vec(r, len)?;
        String::from_utf8(raw)
            .map_err(|e| DiscoveryError::malformed_by(constants::ERR_INVALID_UTF8, e))
    }
}
