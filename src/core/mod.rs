//! # Core Wire Components
//!
//! Big-endian primitives and datagram assembly shared by both protocol
//! generations.
//!
//! ## Components
//! - **Wire**: field encoders, a bounds-checked slice reader, stream readers
//! - **Packet**: header/trailer-aware datagram buffers and message packing
//!
//! ## Security
//! - Element counts are checked against the remaining buffer before allocation
//! - Multicast datagrams never exceed the caller's size ceiling

pub mod packet;
pub mod wire;
