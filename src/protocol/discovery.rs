//! # Discovery Facade
//!
//! [`Discovery`] picks a protocol generation and exposes one entry point per
//! operation. Every operation resolves the caller's constraints first, so
//! contradictory constraints fail before any bytes are produced or read.
//!
//! Multicast encoding returns an [`EncodeIter`]: generation 1 yields one
//! batch of datagrams, generation 2 yields one batch per registered format.
//!
//! ```no_run
//! use discovery_protocol::constraints::InvocationConstraints;
//! use discovery_protocol::format::plaintext::Plaintext;
//! use discovery_protocol::protocol::{Discovery, MulticastRequest};
//!
//! let discovery = Discovery::with_providers(Plaintext::providers());
//! let request = MulticastRequest::new("10.0.0.2", 4160, ["public"], []);
//! for batch in discovery.encode_multicast_request(&request, 512, &InvocationConstraints::empty())? {
//!     for datagram in batch? {
//!         println!("{} bytes to {}", datagram.len(), datagram.addr);
//!     }
//! }
//! # Ok::<(), discovery_protocol::error::DiscoveryError>(())
//! ```

use super::message::{Locator, MulticastAnnouncement, MulticastRequest, PendingCheck, UnicastResponse};
use super::v1::DiscoveryV1;
use super::v2::DiscoveryV2;
use super::{MulticastGroups, ProtocolGeneration};
use crate::constraints::{InvocationConstraints, ResolvedConstraints};
use crate::core::packet::{Datagram, MIN_PACKET_SIZE};
use crate::core::wire::{stream, WireReader};
use crate::error::{constants, DiscoveryError, Result};
use crate::format::{DiscoveryStream, FormatProvider, FormatRegistry};
use crate::marshal::{LoaderId, MarshalContext};
use crate::security::ClientSubjectChecker;
use crate::utils::metrics::{global_metrics, Timer};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, instrument, trace};

/// Deferred encoding of one format's datagrams
pub(crate) type EncodeStep = Box<dyn FnOnce() -> Result<Vec<Datagram>> + Send>;

/// Single-use sequence of datagram batches, one per encoder.
///
/// Each encoder runs only when its batch is requested. A failing encoder
/// yields its error without preventing later batches.
pub struct EncodeIter {
    steps: VecDeque<(String, EncodeStep)>,
}

impl EncodeIter {
    pub(crate) fn new(steps: Vec<(String, EncodeStep)>) -> Self {
        Self {
            steps: steps.into(),
        }
    }

    pub fn has_next(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Encoders not yet visited
    pub fn remaining(&self) -> usize {
        self.steps.len()
    }

    /// Format that the next batch will be encoded with
    pub fn next_format(&self) -> Option<&str> {
        self.steps.front().map(|(name, _)| name.as_str())
    }
}

impl Iterator for EncodeIter {
    type Item = Result<Vec<Datagram>>;

    fn next(&mut self) -> Option<Self::Item> {
        let (format, step) = self.steps.pop_front()?;
        let result = step();
        match &result {
            Ok(datagrams) => {
                let bytes: usize = datagrams.iter().map(Datagram::len).sum();
                global_metrics().record_encoded(datagrams.len() as u64, bytes as u64);
                trace!(%format, packets = datagrams.len(), bytes, "Encoded multicast message");
            }
            Err(e) => debug!(%format, error = %e, "Multicast encoder failed"),
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.steps.len(), Some(self.steps.len()))
    }
}

impl ExactSizeIterator for EncodeIter {}

impl fmt::Debug for EncodeIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formats: Vec<&str> = self.steps.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("EncodeIter").field("remaining", &formats).finish()
    }
}

/// Version field of a received multicast datagram
pub fn peek_version(packet: &[u8]) -> Result<i32> {
    WireReader::new(packet).i32()
}

fn record_decode<T>(result: Result<T>) -> Result<T> {
    match &result {
        Ok(_) => global_metrics().record_decoded(),
        Err(_) => global_metrics().record_decode_failure(),
    }
    result
}

/// Protocol engine for one generation
#[derive(Debug, Clone)]
pub enum Discovery {
    V1(DiscoveryV1),
    V2(DiscoveryV2),
}

impl Discovery {
    pub fn protocol1() -> Self {
        Discovery::V1(DiscoveryV1::default())
    }

    pub fn protocol2(formats: Arc<FormatRegistry>) -> Self {
        Discovery::V2(DiscoveryV2::new(formats))
    }

    /// Generation 2 over a registry built from `providers`
    pub fn with_providers(providers: impl IntoIterator<Item = FormatProvider>) -> Self {
        Self::protocol2(Arc::new(FormatRegistry::new(providers)))
    }

    pub fn for_generation(generation: ProtocolGeneration, formats: Arc<FormatRegistry>) -> Self {
        match generation {
            ProtocolGeneration::V1 => Self::protocol1(),
            ProtocolGeneration::V2 => Self::protocol2(formats),
        }
    }

    /// Same facade, addressing multicast datagrams to `groups`
    pub fn with_groups(self, groups: MulticastGroups) -> Self {
        match self {
            Discovery::V1(_) => Discovery::V1(DiscoveryV1::with_groups(groups)),
            Discovery::V2(v2) => Discovery::V2(DiscoveryV2::with_groups(Arc::clone(v2.formats()), groups)),
        }
    }

    pub fn groups(&self) -> MulticastGroups {
        match self {
            Discovery::V1(v1) => v1.groups(),
            Discovery::V2(v2) => v2.groups(),
        }
    }

    pub fn generation(&self) -> ProtocolGeneration {
        match self {
            Discovery::V1(_) => ProtocolGeneration::V1,
            Discovery::V2(_) => ProtocolGeneration::V2,
        }
    }

    fn resolve(&self, constraints: &InvocationConstraints) -> Result<ResolvedConstraints> {
        let resolved = ResolvedConstraints::resolve(constraints)?;
        resolved.check_protocol_version(self.generation().as_i32())?;
        Ok(resolved)
    }

    fn packet_capacity(resolved: &ResolvedConstraints, max_packet_size: usize) -> Result<usize> {
        let capacity = resolved.multicast_max_packet_size(max_packet_size);
        if capacity < MIN_PACKET_SIZE {
            return Err(DiscoveryError::InvalidArgument(format!(
                "{}: {capacity} < {MIN_PACKET_SIZE}",
                constants::ERR_PACKET_TOO_SMALL
            )));
        }
        Ok(capacity)
    }

    /// Encode `request` for every format this facade carries.
    ///
    /// `max_packet_size` applies unless a packet-size constraint overrides it.
    ///
    /// # Errors
    /// Constraint errors and a ceiling below 512 bytes are raised here;
    /// per-format failures surface from the iterator.
    #[instrument(level = "debug", skip_all, fields(generation = %self.generation()))]
    pub fn encode_multicast_request(
        &self,
        request: &MulticastRequest,
        max_packet_size: usize,
        constraints: &InvocationConstraints,
    ) -> Result<EncodeIter> {
        let resolved = self.resolve(constraints)?;
        let capacity = Self::packet_capacity(&resolved, max_packet_size)?;
        let steps = match self {
            Discovery::V1(v1) => {
                v1.check_constraints(&resolved)?;
                let v1 = *v1;
                let request = request.clone();
                let step: EncodeStep =
                    Box::new(move || v1.encode_multicast_request(&request, capacity, &resolved));
                vec![("protocol-1".to_owned(), step)]
            }
            Discovery::V2(v2) => {
                v2.multicast_request_steps(Arc::new(request.clone()), capacity, Arc::new(resolved))
            }
        };
        Ok(EncodeIter::new(steps))
    }

    #[instrument(level = "debug", skip_all, fields(generation = %self.generation()))]
    pub fn encode_multicast_announcement(
        &self,
        announcement: &MulticastAnnouncement,
        max_packet_size: usize,
        constraints: &InvocationConstraints,
    ) -> Result<EncodeIter> {
        let resolved = self.resolve(constraints)?;
        let capacity = Self::packet_capacity(&resolved, max_packet_size)?;
        let steps = match self {
            Discovery::V1(v1) => {
                v1.check_constraints(&resolved)?;
                let v1 = *v1;
                let announcement = announcement.clone();
                let step: EncodeStep = Box::new(move || {
                    v1.encode_multicast_announcement(&announcement, capacity, &resolved)
                });
                vec![("protocol-1".to_owned(), step)]
            }
            Discovery::V2(v2) => v2.multicast_announcement_steps(
                Arc::new(announcement.clone()),
                capacity,
                Arc::new(resolved),
            ),
        };
        Ok(EncodeIter::new(steps))
    }

    /// Decode a multicast request, optionally postponing constraint checks.
    ///
    /// `datagram.addr` is the sender; generation 1 takes the request host
    /// from it.
    pub fn decode_multicast_request(
        &self,
        datagram: &Datagram,
        constraints: &InvocationConstraints,
        checker: Option<Arc<dyn ClientSubjectChecker>>,
        delay_constraint_check: bool,
    ) -> Result<PendingCheck<MulticastRequest>> {
        let resolved = self.resolve(constraints)?;
        record_decode(match self {
            Discovery::V1(v1) => v1
                .decode_multicast_request(&datagram.payload, datagram.addr, &resolved, checker.as_deref())
                .map(PendingCheck::checked),
            Discovery::V2(v2) => v2.decode_multicast_request(
                &datagram.payload,
                datagram.addr,
                &resolved,
                checker,
                delay_constraint_check,
            ),
        })
    }

    /// Decode with every check applied eagerly
    pub fn decode_multicast_request_checked(
        &self,
        datagram: &Datagram,
        constraints: &InvocationConstraints,
        checker: Option<Arc<dyn ClientSubjectChecker>>,
    ) -> Result<MulticastRequest> {
        self.decode_multicast_request(datagram, constraints, checker, false)?
            .verify()
    }

    pub fn decode_multicast_announcement(
        &self,
        datagram: &Datagram,
        constraints: &InvocationConstraints,
        delay_constraint_check: bool,
    ) -> Result<PendingCheck<MulticastAnnouncement>> {
        let resolved = self.resolve(constraints)?;
        record_decode(match self {
            Discovery::V1(v1) => v1
                .decode_multicast_announcement(&datagram.payload, &resolved)
                .map(PendingCheck::checked),
            Discovery::V2(v2) => {
                v2.decode_multicast_announcement(&datagram.payload, &resolved, delay_constraint_check)
            }
        })
    }

    pub fn decode_multicast_announcement_checked(
        &self,
        datagram: &Datagram,
        constraints: &InvocationConstraints,
    ) -> Result<MulticastAnnouncement> {
        self.decode_multicast_announcement(datagram, constraints, false)?
            .verify()
    }

    /// Client side of unicast discovery over an already-open stream.
    ///
    /// The caller applies the resolved socket timeout to the stream.
    #[instrument(level = "debug", skip_all, fields(generation = %self.generation(), %locator))]
    pub fn do_unicast_discovery(
        &self,
        stream: &mut dyn DiscoveryStream,
        locator: &Locator,
        constraints: &InvocationConstraints,
        ctx: &MarshalContext,
    ) -> Result<UnicastResponse> {
        let _timer = Timer::start("unicast_discovery_client");
        let resolved = self.resolve(constraints)?;
        match self {
            Discovery::V1(v1) => v1.do_unicast_discovery(stream, locator, &resolved, ctx),
            Discovery::V2(v2) => v2.do_unicast_discovery(stream, &resolved, ctx),
        }
    }

    /// Server side for this generation only; the client's version is read
    /// here and must match.
    #[instrument(level = "debug", skip_all, fields(generation = %self.generation()))]
    pub fn handle_unicast_discovery(
        &self,
        response: &UnicastResponse,
        stream: &mut dyn DiscoveryStream,
        constraints: &InvocationConstraints,
        checker: &dyn ClientSubjectChecker,
        ctx: &MarshalContext,
    ) -> Result<()> {
        let _timer = Timer::start("unicast_discovery_server");
        let resolved = self.resolve(constraints)?;
        let version = stream::read_i32(&mut *stream)?;
        if version != self.generation().as_i32() {
            return Err(DiscoveryError::UnsupportedVersion(version));
        }
        self.serve(response, stream, &resolved, checker, ctx)
    }

    fn serve(
        &self,
        response: &UnicastResponse,
        stream: &mut dyn DiscoveryStream,
        resolved: &ResolvedConstraints,
        checker: &dyn ClientSubjectChecker,
        ctx: &MarshalContext,
    ) -> Result<()> {
        match self {
            Discovery::V1(v1) => v1.handle_unicast_discovery(response, stream, resolved, checker, ctx),
            Discovery::V2(v2) => v2.handle_unicast_discovery(response, stream, resolved, checker, ctx),
        }?;
        global_metrics().record_unicast_served();
        Ok(())
    }
}

/// Answer one unicast discovery request in whichever generation the client speaks.
///
/// Reads the client's version, then serves it with generation 1 or with
/// generation 2 over `formats`. Returns the generation used.
#[instrument(level = "debug", skip_all)]
pub fn serve_unicast_discovery(
    formats: &Arc<FormatRegistry>,
    response: &UnicastResponse,
    stream: &mut dyn DiscoveryStream,
    constraints: &InvocationConstraints,
    checker: &dyn ClientSubjectChecker,
    ctx: &MarshalContext,
) -> Result<ProtocolGeneration> {
    let _timer = Timer::start("unicast_discovery_server");
    let resolved = ResolvedConstraints::resolve(constraints)?;
    let version = stream::read_i32(&mut *stream)?;
    let generation = ProtocolGeneration::try_from(version)?;
    resolved.check_protocol_version(version)?;
    debug!(%generation, "Serving unicast discovery");
    Discovery::for_generation(generation, Arc::clone(formats))
        .serve(response, stream, &resolved, checker, ctx)?;
    Ok(generation)
}

/// Generation-2 facades shared per loading context.
///
/// Building a facade builds its format registry, so concurrent first use of
/// a context constructs exactly one and every caller receives it.
#[derive(Default)]
pub struct DiscoveryCache {
    entries: RwLock<HashMap<LoaderId, Discovery>>,
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Facade for `generation`; `providers` runs only on the first
    /// generation-2 request for `loader`.
    pub fn get<F>(&self, generation: ProtocolGeneration, loader: &LoaderId, providers: F) -> Result<Discovery>
    where
        F: FnOnce() -> Vec<FormatProvider>,
    {
        match generation {
            ProtocolGeneration::V1 => Ok(Discovery::protocol1()),
            ProtocolGeneration::V2 => self.protocol2(loader, providers),
        }
    }

    pub fn protocol2<F>(&self, loader: &LoaderId, providers: F) -> Result<Discovery>
    where
        F: FnOnce() -> Vec<FormatProvider>,
    {
        {
            let entries = self
                .entries
                .read()
                .map_err(|_| DiscoveryError::Internal(constants::ERR_CACHE_READ_LOCK.into()))?;
            if let Some(discovery) = entries.get(loader) {
                return Ok(discovery.clone());
            }
        }

        let mut entries = self
            .entries
            .write()
            .map_err(|_| DiscoveryError::Internal(constants::ERR_CACHE_WRITE_LOCK.into()))?;
        let discovery = entries.entry(loader.clone()).or_insert_with(|| {
            debug!(%loader, "Building discovery facade");
            Discovery::with_providers(providers())
        });
        Ok(discovery.clone())
    }

    pub fn contains(&self, loader: &LoaderId) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(loader))
            .unwrap_or(false)
    }

    /// Drop the facade for `loader`; returns whether one was cached.
    pub fn evict(&self, loader: &LoaderId) -> Result<bool> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| DiscoveryError::Internal(constants::ERR_CACHE_WRITE_LOCK.into()))?;
        Ok(entries.remove(loader).is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for DiscoveryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryCache").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::InvocationConstraint;
    use crate::core::wire::ServiceId;
    use crate::format::plaintext::Plaintext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_encode_iter_is_single_use() {
        let discovery = Discovery::with_providers(Plaintext::providers());
        let request = MulticastRequest::new("host", 4160, ["g"], []);
        let mut iter = discovery
            .encode_multicast_request(&request, 512, &InvocationConstraints::empty())
            .unwrap();
        assert!(iter.has_next());
        assert_eq!(iter.remaining(), 1);
        assert_eq!(iter.next_format(), Some(crate::format::plaintext::FORMAT_NAME));
        assert_eq!(iter.next().unwrap().unwrap().len(), 1);
        assert!(!iter.has_next());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_groups_address_every_generation() {
        let groups = MulticastGroups {
            request: "239.255.7.7:5555".parse().unwrap(),
            announcement: "239.255.7.8:5556".parse().unwrap(),
        };
        let request = MulticastRequest::new("host", 4160, ["g"], []);
        let announcement = MulticastAnnouncement::new(3, "host", 4160, ["g"], ServiceId::new(1, 1));
        let none = InvocationConstraints::empty();

        for discovery in [
            Discovery::protocol1().with_groups(groups),
            Discovery::with_providers(Plaintext::providers()).with_groups(groups),
        ] {
            assert_eq!(discovery.groups(), groups);
            for batch in discovery.encode_multicast_request(&request, 512, &none).unwrap() {
                assert!(batch.unwrap().iter().all(|d| d.addr == groups.request));
            }
            for batch in discovery.encode_multicast_announcement(&announcement, 512, &none).unwrap() {
                assert!(batch.unwrap().iter().all(|d| d.addr == groups.announcement));
            }
        }
        assert_eq!(Discovery::protocol1().groups(), MulticastGroups::default());
    }

    #[test]
    fn test_generation_mismatch_fails_before_encoding() {
        let request = MulticastRequest::new("host", 4160, ["g"], []);
        let v2_only = InvocationConstraints::required([InvocationConstraint::ProtocolVersion(2)]);
        let err = Discovery::protocol1()
            .encode_multicast_request(&request, 512, &v2_only)
            .unwrap_err();
        assert!(err.is_constraint_error());
    }

    #[test]
    fn test_small_ceiling_is_caller_error() {
        let request = MulticastRequest::new("host", 4160, ["g"], []);
        let err = Discovery::protocol1()
            .encode_multicast_request(&request, 100, &InvocationConstraints::empty())
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidArgument(_)));
    }

    #[test]
    fn test_cache_builds_once_per_loader() {
        let cache = DiscoveryCache::new();
        let builds = AtomicUsize::new(0);
        let loader = LoaderId::new("app");
        for _ in 0..3 {
            let discovery = cache
                .get(ProtocolGeneration::V2, &loader, || {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Plaintext::providers()
                })
                .unwrap();
            assert_eq!(discovery.generation(), ProtocolGeneration::V2);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(cache.contains(&loader));
        assert!(cache.evict(&loader).unwrap());
        assert!(cache.is_empty());

        let v1 = cache
            .get(ProtocolGeneration::V1, &loader, Vec::new)
            .unwrap();
        assert_eq!(v1.generation(), ProtocolGeneration::V1);
        assert!(cache.is_empty());
    }
}
