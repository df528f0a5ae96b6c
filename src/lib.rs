//! # Discovery Protocol
//!
//! Wire engine for lookup-service discovery: multicast requests from
//! clients, multicast announcements from lookup services, and a unicast
//! exchange that hands a client the lookup service's registrar.
//!
//! Two protocol generations are supported. Generation 1 has fixed layouts.
//! Generation 2 tags every datagram with a format identifier and negotiates
//! a format for each unicast exchange, so formats such as
//! [`format::hmac::HmacSha256Format`] can add integrity protection.
//!
//! ## Layout
//! - [`constraints`]: caller requirements and preferences, resolved to transport parameters
//! - [`core`]: wire primitives and datagram assembly
//! - [`protocol`]: messages, both generations, the [`Discovery`] facade
//! - [`format`]: pluggable generation-2 formats and their registry
//! - [`transport`]: UDP multicast and TCP unicast helpers
//! - [`config`], [`utils`]: configuration, logging, metrics
//!
//! ## Example
//! ```no_run
//! use discovery_protocol::constraints::InvocationConstraints;
//! use discovery_protocol::format::plaintext::Plaintext;
//! use discovery_protocol::marshal::{FramedMarshaller, MarshalContext};
//! use discovery_protocol::protocol::{Discovery, Locator};
//! use discovery_protocol::transport::unicast;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let discovery = Discovery::with_providers(Plaintext::providers());
//! let ctx = MarshalContext::new(Arc::new(FramedMarshaller::default()));
//! let locator = Locator::new("reggie.example.com", 4160);
//! let response = unicast::discover(
//!     &discovery,
//!     &locator,
//!     &InvocationConstraints::empty(),
//!     &ctx,
//!     Duration::from_secs(5),
//! )?;
//! println!("{} groups", response.groups().len());
//! # Ok::<(), discovery_protocol::error::DiscoveryError>(())
//! ```

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod constraints;
pub mod core;
pub mod error;
pub mod format;
pub mod marshal;
pub mod protocol;
pub mod security;
pub mod transport;
pub mod utils;

pub use constraints::{InvocationConstraint, InvocationConstraints, ResolvedConstraints};
pub use error::{DiscoveryError, Result};
pub use format::{FormatId, FormatProvider, FormatRegistry};
pub use protocol::{
    Discovery, DiscoveryCache, Locator, MulticastAnnouncement, MulticastGroups, MulticastRequest,
    PendingCheck, ProtocolGeneration, UnicastResponse,
};
