//! Constraint resolution through the public API

#![allow(clippy::unwrap_used, clippy::expect_used)]

use discovery_protocol::constraints::{InvocationConstraint, InvocationConstraints, ResolvedConstraints};
use discovery_protocol::protocol::ProtocolGeneration;
use std::time::{Duration, SystemTime};
use InvocationConstraint::*;

fn resolve(reqs: Vec<InvocationConstraint>, prefs: Vec<InvocationConstraint>) -> ResolvedConstraints {
    ResolvedConstraints::resolve(&InvocationConstraints::new(reqs, prefs)).unwrap()
}

#[test]
fn bounds_take_the_tightest_requirement() {
    let r = resolve(
        vec![
            MulticastMaxPacketSize(2048),
            MulticastMaxPacketSize(1024),
            MulticastTimeToLive(8),
            MulticastTimeToLive(3),
            UnicastSocketTimeout(Duration::from_secs(30)),
            UnicastSocketTimeout(Duration::from_secs(5)),
        ],
        vec![MulticastMaxPacketSize(600), MulticastTimeToLive(1)],
    );
    assert_eq!(r.multicast_max_packet_size(512), 1024);
    assert_eq!(r.multicast_time_to_live(15), 3);
    assert_eq!(r.unicast_socket_timeout(Duration::from_secs(60)), Duration::from_secs(5));
}

#[test]
fn preferences_fill_types_without_requirements() {
    let r = resolve(
        vec![MulticastTimeToLive(4)],
        vec![MulticastMaxPacketSize(1500), MulticastMaxPacketSize(900)],
    );
    assert_eq!(r.multicast_max_packet_size(512), 900);
    assert_eq!(r.multicast_time_to_live(15), 4);
    assert_eq!(r.unicast_socket_timeout(Duration::from_secs(60)), Duration::from_secs(60));
}

#[test]
fn alternatives_within_a_type_use_their_smallest_member() {
    let ttl = InvocationConstraint::any_of([MulticastTimeToLive(9), MulticastTimeToLive(2)]).unwrap();
    let r = resolve(vec![ttl], vec![]);
    assert_eq!(r.multicast_time_to_live(15), 2);
}

#[test]
fn mixed_type_alternatives() {
    let mixed = InvocationConstraint::any_of([ProtocolVersion(2), MulticastTimeToLive(4)]).unwrap();

    let err = ResolvedConstraints::resolve(&InvocationConstraints::required([mixed.clone()])).unwrap_err();
    assert!(err.is_constraint_error());

    let r = resolve(vec![], vec![mixed]);
    assert_eq!(r.multicast_time_to_live(15), 15);
}

#[test]
fn single_alternative_collapses() {
    let one = InvocationConstraint::any_of([Integrity, Integrity]).unwrap();
    assert_eq!(one, Integrity);
    assert!(InvocationConstraint::any_of([]).is_err());
}

#[test]
fn conflicting_versions_fail_before_io() {
    let err = ResolvedConstraints::resolve(&InvocationConstraints::required([
        ProtocolVersion(1),
        ProtocolVersion(2),
    ]))
    .unwrap_err();
    assert!(err.is_constraint_error());

    let err = ResolvedConstraints::resolve(&InvocationConstraints::required([ProtocolVersion(3)])).unwrap_err();
    assert!(err.is_constraint_error());
}

#[test]
fn conflicting_version_preferences_are_ignored() {
    let r = resolve(vec![], vec![ProtocolVersion(2), ProtocolVersion(1)]);
    assert_eq!(r.protocol_version(), ProtocolGeneration::V1);
    assert!(r.allowed_protocol_versions().is_none());
}

#[test]
fn foreign_constraints_are_left_for_the_transport() {
    let r = resolve(vec![Other("kerberos".into()), MulticastTimeToLive(2)], vec![Confidentiality]);
    assert_eq!(r.unfulfilled().requirements().collect::<Vec<_>>(), vec![&Other("kerberos".into())]);
    assert_eq!(r.unfulfilled().preferences().collect::<Vec<_>>(), vec![&Confidentiality]);
    assert_eq!(r.protocol_version(), ProtocolGeneration::V2);
    assert!(r.ensure_requirements_supported("test", &[]).is_err());
    assert!(r
        .ensure_requirements_supported("test", &[Other("kerberos".into())])
        .is_ok());
}

#[test]
fn relative_connection_time_becomes_a_deadline() {
    let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
    let constraints = InvocationConstraints::required([
        ConnectionRelativeTime(Duration::from_secs(30)),
        ConnectionAbsoluteTime(now + Duration::from_secs(10)),
    ]);
    let r = ResolvedConstraints::resolve_at(&constraints, now).unwrap();
    assert_eq!(r.connection_deadline(), Some(now + Duration::from_secs(10)));

    let again = ResolvedConstraints::resolve_at(&constraints, now).unwrap();
    assert_eq!(r, again);
}

#[test]
fn combine_merges_requirement_and_preference_sets() {
    let a = InvocationConstraints::required([MulticastTimeToLive(5)]);
    let b = InvocationConstraints::new([Integrity], [MulticastMaxPacketSize(1024)]);
    let merged = a.combine(&b);
    assert_eq!(merged.requirements().count(), 2);
    assert_eq!(merged.preferences().count(), 1);
    assert!(merged.has_requirements());
}
