//! # Transport Layer
//!
//! Socket plumbing around the codec: multicast datagrams over
//! `tokio::net::UdpSocket`, and unicast discovery over a blocking
//! `std::net::TcpStream` with async wrappers.

pub mod multicast;
pub mod unicast;
