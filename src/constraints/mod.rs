//! # Invocation Constraints
//!
//! Caller-supplied requirements and preferences that shape a discovery
//! operation: which protocol generation may be used, how large multicast
//! datagrams may grow, their time-to-live, the unicast socket timeout, the
//! connection deadline, and transport security properties that only some
//! generation-2 formats can provide.
//!
//! [`ResolvedConstraints`] turns an [`InvocationConstraints`] set into
//! concrete transport parameters.

mod resolver;

pub use resolver::ResolvedConstraints;

use crate::error::{DiscoveryError, Result};
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

/// Stand-in deadline for relative times too large to add to the clock
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// A single constraint on a discovery operation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InvocationConstraint {
    /// Use exactly this discovery protocol version
    ProtocolVersion(i32),
    /// Upper bound on the size of each multicast datagram
    MulticastMaxPacketSize(usize),
    /// Upper bound on multicast hops
    MulticastTimeToLive(u8),
    /// Upper bound on a blocking unicast read
    UnicastSocketTimeout(Duration),
    /// Connection must complete before this instant
    ConnectionAbsoluteTime(SystemTime),
    /// Connection must complete within this long of the call
    ConnectionRelativeTime(Duration),
    Integrity,
    Confidentiality,
    ClientAuthentication,
    ServerAuthentication,
    /// Constraint understood only by some outer layer
    Other(String),
    /// Satisfied when any one element is satisfied
    Alternatives(ConstraintAlternatives),
}

impl InvocationConstraint {
    /// Build an alternatives constraint.
    ///
    /// Nested alternatives are flattened and duplicates removed; a single
    /// remaining element is returned as itself.
    ///
    /// # Errors
    /// `InvalidArgument` when no alternatives are given.
    pub fn any_of(alternatives: impl IntoIterator<Item = InvocationConstraint>) -> Result<Self> {
        let mut set = BTreeSet::new();
        for c in alternatives {
            match c {
                InvocationConstraint::Alternatives(nested) => set.extend(nested.0),
                other => {
                    set.insert(other);
                }
            }
        }
        if set.len() > 1 {
            return Ok(InvocationConstraint::Alternatives(ConstraintAlternatives(set)));
        }
        set.into_iter().next().ok_or_else(|| {
            DiscoveryError::InvalidArgument("constraint alternatives cannot be empty".into())
        })
    }

    /// Replace relative connection times with deadlines measured from `now`
    pub fn make_absolute(&self, now: SystemTime) -> Self {
        match self {
            InvocationConstraint::ConnectionRelativeTime(d) => {
                InvocationConstraint::ConnectionAbsoluteTime(
                    now.checked_add(*d).unwrap_or(now + FAR_FUTURE),
                )
            }
            InvocationConstraint::Alternatives(alts) => InvocationConstraint::Alternatives(
                ConstraintAlternatives(alts.0.iter().map(|c| c.make_absolute(now)).collect()),
            ),
            other => other.clone(),
        }
    }

    pub fn is_relative(&self) -> bool {
        match self {
            InvocationConstraint::ConnectionRelativeTime(_) => true,
            InvocationConstraint::Alternatives(alts) => alts.iter().any(Self::is_relative),
            _ => false,
        }
    }
}

/// Two or more distinct, non-nested alternatives
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConstraintAlternatives(BTreeSet<InvocationConstraint>);

impl ConstraintAlternatives {
    pub fn iter(&self) -> impl Iterator<Item = &InvocationConstraint> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Requirements must be met; preferences are honored when possible
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct InvocationConstraints {
    requirements: BTreeSet<InvocationConstraint>,
    preferences: BTreeSet<InvocationConstraint>,
}

impl InvocationConstraints {
    /// A preference that duplicates a requirement is dropped.
    pub fn new(
        requirements: impl IntoIterator<Item = InvocationConstraint>,
        preferences: impl IntoIterator<Item = InvocationConstraint>,
    ) -> Self {
        let requirements: BTreeSet<_> = requirements.into_iter().collect();
        let preferences = preferences
            .into_iter()
            .filter(|p| !requirements.contains(p))
            .collect();
        Self {
            requirements,
            preferences,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn required(requirements: impl IntoIterator<Item = InvocationConstraint>) -> Self {
        Self::new(requirements, [])
    }

    pub fn preferred(preferences: impl IntoIterator<Item = InvocationConstraint>) -> Self {
        Self::new([], preferences)
    }

    pub fn requirements(&self) -> impl Iterator<Item = &InvocationConstraint> {
        self.requirements.iter()
    }

    pub fn preferences(&self) -> impl Iterator<Item = &InvocationConstraint> {
        self.preferences.iter()
    }

    pub fn has_requirements(&self) -> bool {
        !self.requirements.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty() && self.preferences.is_empty()
    }

    /// Union of both sets
    pub fn combine(&self, other: &InvocationConstraints) -> Self {
        Self::new(
            self.requirements.iter().chain(&other.requirements).cloned(),
            self.preferences.iter().chain(&other.preferences).cloned(),
        )
    }

    pub fn make_absolute(&self, now: SystemTime) -> Self {
        if !self.requirements().chain(self.preferences()).any(InvocationConstraint::is_relative) {
            return self.clone();
        }
        Self::new(
            self.requirements.iter().map(|c| c.make_absolute(now)),
            self.preferences.iter().map(|c| c.make_absolute(now)),
        )
    }
}
