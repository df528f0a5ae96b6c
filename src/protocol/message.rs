//! Discovery messages exchanged by both protocol generations.
//!
//! All messages are immutable once built. Decoders that postpone part of
//! their validation wrap the message in a [`PendingCheck`].

use crate::core::wire::ServiceId;
use crate::error::Result;
use crate::marshal::RegistrarProxy;
use std::fmt;

/// Sequence number carried by announcements decoded from generation 1,
/// which has no sequence field.
pub const UNKNOWN_SEQUENCE_NUMBER: i64 = -1;

/// Unicast address of a lookup service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    host: String,
    port: u16,
}

impl Locator {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "discovery://{}:{}", self.host, self.port)
    }
}

/// Multicast request sent by a client looking for lookup services
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MulticastRequest {
    host: String,
    port: u16,
    groups: Vec<String>,
    service_ids: Vec<ServiceId>,
}

impl MulticastRequest {
    /// `host` and `port` are where the client listens for unicast responses;
    /// `service_ids` lists lookup services the client has already heard from.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        groups: impl IntoIterator<Item = impl Into<String>>,
        service_ids: impl IntoIterator<Item = ServiceId>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            groups: groups.into_iter().map(Into::into).collect(),
            service_ids: service_ids.into_iter().collect(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn service_ids(&self) -> &[ServiceId] {
        &self.service_ids
    }
}

/// Multicast announcement sent by a lookup service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MulticastAnnouncement {
    sequence_number: i64,
    host: String,
    port: u16,
    groups: Vec<String>,
    service_id: ServiceId,
}

impl MulticastAnnouncement {
    pub fn new(
        sequence_number: i64,
        host: impl Into<String>,
        port: u16,
        groups: impl IntoIterator<Item = impl Into<String>>,
        service_id: ServiceId,
    ) -> Self {
        Self {
            sequence_number,
            host: host.into(),
            port,
            groups: groups.into_iter().map(Into::into).collect(),
            service_id,
        }
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }
}

/// Result of unicast discovery: where the lookup service lives and a reference to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnicastResponse {
    host: String,
    port: u16,
    groups: Vec<String>,
    registrar: RegistrarProxy,
}

impl UnicastResponse {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        groups: impl IntoIterator<Item = impl Into<String>>,
        registrar: RegistrarProxy,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            groups: groups.into_iter().map(Into::into).collect(),
            registrar,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn registrar(&self) -> &RegistrarProxy {
        &self.registrar
    }
}

type DeferredCheck = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// A decoded message whose remaining constraint checks have been postponed.
///
/// Everything needed to build the message was validated eagerly. Call
/// [`check_constraints`](Self::check_constraints) or [`verify`](Self::verify)
/// before trusting it.
pub struct PendingCheck<T> {
    message: T,
    check: Option<DeferredCheck>,
}

impl<T> PendingCheck<T> {
    /// A message with nothing left to check
    pub fn checked(message: T) -> Self {
        Self {
            message,
            check: None,
        }
    }

    pub fn deferred<F>(message: T, check: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        Self {
            message,
            check: Some(Box::new(check)),
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.check.is_some()
    }

    /// The message before deferred checks have run
    pub fn message_unchecked(&self) -> &T {
        &self.message
    }

    /// Run the deferred checks; may be called repeatedly.
    pub fn check_constraints(&self) -> Result<()> {
        match &self.check {
            Some(check) => check(),
            None => Ok(()),
        }
    }

    pub fn verify(self) -> Result<T> {
        self.check_constraints()?;
        Ok(self.message)
    }
}

impl<T: fmt::Debug> fmt::Debug for PendingCheck<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCheck")
            .field("message", &self.message)
            .field("deferred", &self.check.is_some())
            .finish()
    }
}
