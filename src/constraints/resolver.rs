//! Constraint resolution.
//!
//! Requirements and preferences are partitioned by constraint type and each
//! type is reduced on its own: protocol versions intersect, every other
//! recognized type keeps its tightest (smallest) bound. Alternatives that mix
//! recognized and foreign constraints keep only the recognized ones. Whatever
//! is left over is returned as the unfulfilled set for the transport layer.

use super::{InvocationConstraint, InvocationConstraints};
use crate::error::{constants, DiscoveryError, Result};
use crate::protocol::ProtocolGeneration;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ConstraintKind {
    ProtocolVersion,
    MaxPacketSize,
    TimeToLive,
    SocketTimeout,
    ConnectionTime,
}

fn kind_of(c: &InvocationConstraint) -> Option<ConstraintKind> {
    use InvocationConstraint::*;
    match c {
        ProtocolVersion(_) => Some(ConstraintKind::ProtocolVersion),
        MulticastMaxPacketSize(_) => Some(ConstraintKind::MaxPacketSize),
        MulticastTimeToLive(_) => Some(ConstraintKind::TimeToLive),
        UnicastSocketTimeout(_) => Some(ConstraintKind::SocketTimeout),
        ConnectionAbsoluteTime(_) | ConnectionRelativeTime(_) => Some(ConstraintKind::ConnectionTime),
        _ => None,
    }
}

/// Each entry is one constraint's set of acceptable alternatives.
type Groups<'a> = Vec<Vec<&'a InvocationConstraint>>;

#[derive(Default)]
struct Partition<'a> {
    by_kind: BTreeMap<ConstraintKind, Groups<'a>>,
    unfulfilled: Vec<InvocationConstraint>,
}

impl<'a> Partition<'a> {
    fn groups(&self, kind: ConstraintKind) -> &[Vec<&'a InvocationConstraint>] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Mixed-type alternatives are an error among requirements and ignored among preferences.
fn partition<'a>(
    constraints: impl Iterator<Item = &'a InvocationConstraint>,
    required: bool,
) -> Result<Partition<'a>> {
    let mut out = Partition::default();
    for c in constraints {
        if let Some(kind) = kind_of(c) {
            out.by_kind.entry(kind).or_default().push(vec![c]);
            continue;
        }
        let InvocationConstraint::Alternatives(alts) = c else {
            out.unfulfilled.push(c.clone());
            continue;
        };
        let known: Vec<_> = alts.iter().filter(|a| kind_of(a).is_some()).collect();
        let kinds: BTreeSet<_> = known.iter().filter_map(|a| kind_of(a)).collect();
        match kinds.len() {
            0 => out.unfulfilled.push(c.clone()),
            1 => {
                if known.len() < alts.len() {
                    debug!(
                        discarded = alts.len() - known.len(),
                        "Discarding alternatives handled by discovery constraints"
                    );
                }
                if let Some(kind) = kinds.into_iter().next() {
                    out.by_kind.entry(kind).or_default().push(known);
                }
            }
            _ if required => {
                return Err(DiscoveryError::UnsupportedConstraint(format!(
                    "{}: {c:?}",
                    constants::ERR_MIXED_ALTERNATIVES
                )))
            }
            _ => debug!(constraint = ?c, "Ignoring mixed-type preference alternatives"),
        }
    }
    Ok(out)
}

fn version_set(group: &[&InvocationConstraint]) -> BTreeSet<i32> {
    group
        .iter()
        .filter_map(|c| match c {
            InvocationConstraint::ProtocolVersion(v) => Some(*v),
            _ => None,
        })
        .collect()
}

/// Intersect required version sets; an empty intersection is a conflict.
fn reduce_required_versions(groups: &[Vec<&InvocationConstraint>]) -> Result<Option<BTreeSet<i32>>> {
    let mut allowed: Option<BTreeSet<i32>> = None;
    for group in groups {
        let set = version_set(group);
        let next: BTreeSet<i32> = match allowed {
            Some(prev) => prev.intersection(&set).copied().collect(),
            None => set,
        };
        if next.is_empty() {
            return Err(DiscoveryError::UnsupportedConstraint(
                constants::ERR_VERSION_CONFLICT.into(),
            ));
        }
        allowed = Some(next);
    }
    Ok(allowed)
}

/// Intersect preferred version sets, skipping any preference that would empty the result.
fn reduce_preferred_versions(groups: &[Vec<&InvocationConstraint>]) -> Option<BTreeSet<i32>> {
    let mut preferred: Option<BTreeSet<i32>> = None;
    for group in groups {
        let set = version_set(group);
        preferred = match preferred {
            Some(prev) => {
                let next: BTreeSet<i32> = prev.intersection(&set).copied().collect();
                if next.is_empty() {
                    debug!(?set, "Ignoring conflicting protocol version preference");
                    Some(prev)
                } else {
                    Some(next)
                }
            }
            None => Some(set),
        };
    }
    preferred
}

/// Tightest bound: the minimum within each group, then across groups.
fn reduce_min<T, F>(groups: &[Vec<&InvocationConstraint>], extract: F) -> Option<T>
where
    T: Ord + Copy,
    F: Fn(&InvocationConstraint) -> Option<T>,
{
    groups
        .iter()
        .filter_map(|group| group.iter().filter_map(|&c| extract(c)).min())
        .min()
}

/// Requirements win; preferences only fill in a type with no requirement.
fn reduce_bound<T, F>(req: &Partition<'_>, pref: &Partition<'_>, kind: ConstraintKind, extract: F) -> Option<T>
where
    T: Ord + Copy,
    F: Fn(&InvocationConstraint) -> Option<T>,
{
    reduce_min(req.groups(kind), &extract).or_else(|| reduce_min(pref.groups(kind), &extract))
}

/// Pick a protocol generation.
///
/// With nothing unfulfilled the cheaper generation 1 is favored; otherwise
/// generation 2, whose formats can satisfy transport constraints. Peers rely
/// on this exact bias.
fn choose_protocol_version(
    allowed: Option<&BTreeSet<i32>>,
    preferred: Option<&BTreeSet<i32>>,
    bias: ProtocolGeneration,
) -> Result<ProtocolGeneration> {
    let b = bias.as_i32();
    let permitted = |v: i32| allowed.map_or(true, |a| a.contains(&v));

    if preferred.is_some_and(|p| p.contains(&b)) && permitted(b) {
        return Ok(bias);
    }
    if allowed.is_some_and(|a| a.contains(&b)) {
        return Ok(bias);
    }
    let Some(allowed) = allowed else {
        return Ok(bias);
    };
    let supported = |v: &i32| ProtocolGeneration::try_from(*v).ok();
    preferred
        .and_then(|p| p.iter().filter(|v| allowed.contains(*v)).find_map(supported))
        .or_else(|| allowed.iter().find_map(supported))
        .ok_or_else(|| {
            DiscoveryError::UnsupportedConstraint(format!(
                "{}: {allowed:?}",
                constants::ERR_NO_SUPPORTED_VERSION
            ))
        })
}

/// Per-type reductions of one absolute constraint set
struct Reduced {
    allowed_versions: Option<BTreeSet<i32>>,
    preferred_versions: Option<BTreeSet<i32>>,
    max_packet_size: Option<usize>,
    time_to_live: Option<u8>,
    socket_timeout: Option<Duration>,
    connection_deadline: Option<SystemTime>,
    unfulfilled: InvocationConstraints,
}

impl Reduced {
    fn from_constraints(constraints: &InvocationConstraints) -> Result<Self> {
        use InvocationConstraint::*;

        let req = partition(constraints.requirements(), true)?;
        let pref = partition(constraints.preferences(), false)?;

        Ok(Self {
            allowed_versions: reduce_required_versions(req.groups(ConstraintKind::ProtocolVersion))?,
            preferred_versions: reduce_preferred_versions(
                pref.groups(ConstraintKind::ProtocolVersion),
            ),
            max_packet_size: reduce_bound(&req, &pref, ConstraintKind::MaxPacketSize, |c| match c {
                MulticastMaxPacketSize(n) => Some(*n),
                _ => None,
            }),
            time_to_live: reduce_bound(&req, &pref, ConstraintKind::TimeToLive, |c| match c {
                MulticastTimeToLive(ttl) => Some(*ttl),
                _ => None,
            }),
            socket_timeout: reduce_bound(&req, &pref, ConstraintKind::SocketTimeout, |c| match c {
                UnicastSocketTimeout(d) => Some(*d),
                _ => None,
            }),
            connection_deadline: reduce_bound(&req, &pref, ConstraintKind::ConnectionTime, |c| {
                match c {
                    ConnectionAbsoluteTime(t) => Some(*t),
                    _ => None,
                }
            }),
            unfulfilled: InvocationConstraints::new(req.unfulfilled, pref.unfulfilled),
        })
    }
}

/// Concrete transport parameters derived from an [`InvocationConstraints`] set.
///
/// Two resolutions of equal absolute constraints compare equal. Relative
/// connection times are converted to deadlines once per resolution, so they
/// may yield different deadlines on each call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedConstraints {
    constraints: InvocationConstraints,
    protocol_version: ProtocolGeneration,
    allowed_versions: Option<BTreeSet<i32>>,
    max_packet_size: Option<usize>,
    time_to_live: Option<u8>,
    socket_timeout: Option<Duration>,
    connection_deadline: Option<SystemTime>,
    unfulfilled: InvocationConstraints,
}

impl ResolvedConstraints {
    /// Resolve against the current clock.
    ///
    /// # Errors
    /// `UnsupportedConstraint` when requirements contradict each other or
    /// allow no supported protocol version.
    pub fn resolve(constraints: &InvocationConstraints) -> Result<Self> {
        Self::resolve_at(constraints, SystemTime::now())
    }

    pub fn resolve_at(constraints: &InvocationConstraints, now: SystemTime) -> Result<Self> {
        let constraints = constraints.make_absolute(now);
        let reduced = Reduced::from_constraints(&constraints)?;

        let bias = if reduced.unfulfilled.is_empty() {
            ProtocolGeneration::V1
        } else {
            ProtocolGeneration::V2
        };
        let protocol_version = choose_protocol_version(
            reduced.allowed_versions.as_ref(),
            reduced.preferred_versions.as_ref(),
            bias,
        )?;

        Ok(Self {
            constraints,
            protocol_version,
            allowed_versions: reduced.allowed_versions,
            max_packet_size: reduced.max_packet_size,
            time_to_live: reduced.time_to_live,
            socket_timeout: reduced.socket_timeout,
            connection_deadline: reduced.connection_deadline,
            unfulfilled: reduced.unfulfilled,
        })
    }

    /// The input constraints with relative times made absolute
    pub fn constraints(&self) -> &InvocationConstraints {
        &self.constraints
    }

    pub fn protocol_version(&self) -> ProtocolGeneration {
        self.protocol_version
    }

    /// `None` when no requirement restricts the version
    pub fn allowed_protocol_versions(&self) -> Option<&BTreeSet<i32>> {
        self.allowed_versions.as_ref()
    }

    /// Verify a version observed on the wire is acceptable.
    pub fn check_protocol_version(&self, version: i32) -> Result<()> {
        match &self.allowed_versions {
            Some(allowed) if !allowed.contains(&version) => Err(DiscoveryError::UnsupportedConstraint(
                format!("protocol version {version} not in {allowed:?}"),
            )),
            _ => Ok(()),
        }
    }

    pub fn multicast_max_packet_size(&self, default: usize) -> usize {
        self.max_packet_size.unwrap_or(default)
    }

    pub fn multicast_time_to_live(&self, default: u8) -> u8 {
        self.time_to_live.unwrap_or(default)
    }

    pub fn unicast_socket_timeout(&self, default: Duration) -> Duration {
        self.socket_timeout.unwrap_or(default)
    }

    pub fn connection_deadline(&self) -> Option<SystemTime> {
        self.connection_deadline
    }

    pub fn connection_deadline_or(&self, default: SystemTime) -> SystemTime {
        self.connection_deadline.unwrap_or(default)
    }

    /// Constraints left for transport layers this engine does not control
    pub fn unfulfilled(&self) -> &InvocationConstraints {
        &self.unfulfilled
    }

    /// Fail unless every unfulfilled requirement is one of `supported`.
    ///
    /// An unfulfilled alternatives requirement passes when any of its elements
    /// is supported. Unfulfilled preferences never fail.
    pub fn ensure_requirements_supported(
        &self,
        format: &str,
        supported: &[InvocationConstraint],
    ) -> Result<()> {
        for c in self.unfulfilled.requirements() {
            let ok = match c {
                InvocationConstraint::Alternatives(alts) => alts.iter().any(|a| supported.contains(a)),
                other => supported.contains(other),
            };
            if !ok {
                return Err(DiscoveryError::UnsupportedConstraint(format!(
                    "{} ({format}): {c:?}",
                    constants::ERR_SECURITY_UNSUPPORTED
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InvocationConstraint::*;

    fn resolve(reqs: Vec<InvocationConstraint>, prefs: Vec<InvocationConstraint>) -> Result<ResolvedConstraints> {
        ResolvedConstraints::resolve(&InvocationConstraints::new(reqs, prefs))
    }

    #[test]
    fn test_unconstrained_defaults_to_v1() {
        let r = resolve(vec![], vec![]).unwrap();
        assert_eq!(r.protocol_version(), ProtocolGeneration::V1);
        assert_eq!(r.multicast_max_packet_size(512), 512);
        assert_eq!(r.multicast_time_to_live(15), 15);
        assert!(r.connection_deadline().is_none());
        assert!(r.unfulfilled().is_empty());
        assert!(r.check_protocol_version(7).is_ok());
    }

    #[test]
    fn test_unfulfilled_biases_toward_v2() {
        let r = resolve(vec![Integrity], vec![]).unwrap();
        assert_eq!(r.protocol_version(), ProtocolGeneration::V2);
        assert_eq!(r.unfulfilled().requirements().count(), 1);
    }

    #[test]
    fn test_bias_yields_to_allowed_set() {
        let r = resolve(vec![ProtocolVersion(2)], vec![]).unwrap();
        assert_eq!(r.protocol_version(), ProtocolGeneration::V2);
        assert!(r.check_protocol_version(1).is_err());
        assert!(r.check_protocol_version(2).is_ok());

        let r = resolve(vec![ProtocolVersion(1), Integrity], vec![]).unwrap();
        assert_eq!(r.protocol_version(), ProtocolGeneration::V1);
    }

    #[test]
    fn test_preferences_pick_among_allowed() {
        let alts = InvocationConstraint::any_of([ProtocolVersion(1), ProtocolVersion(2)]).unwrap();
        let r = resolve(vec![alts.clone()], vec![ProtocolVersion(2)]).unwrap();
        assert_eq!(r.protocol_version(), ProtocolGeneration::V1);

        let r = resolve(vec![alts, Integrity], vec![ProtocolVersion(1)]).unwrap();
        assert_eq!(r.protocol_version(), ProtocolGeneration::V2);
    }

    #[test]
    fn test_only_unsupported_versions_allowed() {
        let err = resolve(vec![ProtocolVersion(3)], vec![]).unwrap_err();
        assert!(err.is_constraint_error());
    }

    #[test]
    fn test_version_conflict() {
        let err = resolve(vec![ProtocolVersion(1), ProtocolVersion(2)], vec![]).unwrap_err();
        assert!(err.to_string().contains("conflict"));
    }

    #[test]
    fn test_conflicting_version_preferences_are_ignored() {
        let r = resolve(vec![], vec![ProtocolVersion(1), ProtocolVersion(2)]).unwrap();
        assert_eq!(r.protocol_version(), ProtocolGeneration::V1);
    }

    #[test]
    fn test_mixed_alternatives_discard_foreign_members() {
        let alts = InvocationConstraint::any_of([ProtocolVersion(2), Integrity]).unwrap();
        let r = resolve(vec![alts], vec![]).unwrap();
        assert_eq!(r.protocol_version(), ProtocolGeneration::V2);
        assert!(r.unfulfilled().is_empty());
    }

    #[test]
    fn test_alternatives_of_foreign_constraints_are_unfulfilled() {
        let alts = InvocationConstraint::any_of([Integrity, Confidentiality]).unwrap();
        let r = resolve(vec![alts.clone(), Other("x".into())], vec![ClientAuthentication]).unwrap();
        assert_eq!(r.unfulfilled().requirements().count(), 2);
        assert_eq!(r.unfulfilled().preferences().count(), 1);
        assert!(r.ensure_requirements_supported("hmac", &[Integrity]).is_err());

        let r = resolve(vec![alts], vec![]).unwrap();
        assert!(r.ensure_requirements_supported("hmac", &[Integrity]).is_ok());
        assert!(r.ensure_requirements_supported("plaintext", &[]).is_err());
    }

    #[test]
    fn test_alternatives_across_recognized_types_rejected() {
        let alts = InvocationConstraint::any_of([ProtocolVersion(1), MulticastMaxPacketSize(1024)]).unwrap();
        assert!(resolve(vec![alts.clone()], vec![]).is_err());
        assert!(resolve(vec![], vec![alts]).is_ok());
    }

    #[test]
    fn test_bounds_take_minimum() {
        let r = resolve(
            vec![
                MulticastMaxPacketSize(2048),
                MulticastMaxPacketSize(1024),
                MulticastTimeToLive(8),
                UnicastSocketTimeout(Duration::from_secs(30)),
            ],
            vec![MulticastMaxPacketSize(600), MulticastTimeToLive(2)],
        )
        .unwrap();
        assert_eq!(r.multicast_max_packet_size(512), 1024);
        assert_eq!(r.multicast_time_to_live(15), 8);
        assert_eq!(r.unicast_socket_timeout(Duration::from_secs(60)), Duration::from_secs(30));

        let r = resolve(vec![], vec![MulticastMaxPacketSize(600)]).unwrap();
        assert_eq!(r.multicast_max_packet_size(512), 600);
    }

    #[test]
    fn test_connection_deadline_uses_earliest() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000);
        let c = InvocationConstraints::required([
            ConnectionRelativeTime(Duration::from_secs(5)),
            ConnectionAbsoluteTime(now + Duration::from_secs(60)),
        ]);
        let r = ResolvedConstraints::resolve_at(&c, now).unwrap();
        assert_eq!(r.connection_deadline(), Some(now + Duration::from_secs(5)));
        assert!(r.constraints().requirements().all(|c| !c.is_relative()));
    }

    #[test]
    fn test_equal_inputs_resolve_equal() {
        let c = InvocationConstraints::required([MulticastMaxPacketSize(1024), Integrity]);
        assert_eq!(
            ResolvedConstraints::resolve(&c).unwrap(),
            ResolvedConstraints::resolve(&c).unwrap()
        );
    }
}
