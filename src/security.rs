//! # Client Subject Authorization
//!
//! The engine never interprets security policy itself. Multicast request
//! decoding and unicast server handling hand the (possibly absent) subject of
//! the remote client to a [`ClientSubjectChecker`]; a returned
//! [`AccessDenied`] aborts the operation and is propagated untouched.

use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Authorization failure raised by a subject checker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Access denied: {reason}")]
pub struct AccessDenied {
    reason: String,
}

impl AccessDenied {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// A named identity attached to an authenticated peer
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Principal(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read-only set of principals describing the remote client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    principals: BTreeSet<Principal>,
}

impl Subject {
    pub fn new(principals: impl IntoIterator<Item = Principal>) -> Self {
        Self {
            principals: principals.into_iter().collect(),
        }
    }

    pub fn principals(&self) -> impl Iterator<Item = &Principal> {
        self.principals.iter()
    }

    pub fn contains(&self, principal: &Principal) -> bool {
        self.principals.contains(principal)
    }
}

/// Authorizes the client side of a discovery exchange.
///
/// `subject` is `None` when the format does not authenticate clients
/// (plaintext multicast requests, plaintext unicast).
pub trait ClientSubjectChecker: Send + Sync {
    fn check_client_subject(&self, subject: Option<&Subject>) -> Result<(), AccessDenied>;
}

/// Checker that authorizes every client, including anonymous ones
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ClientSubjectChecker for AllowAll {
    fn check_client_subject(&self, _subject: Option<&Subject>) -> Result<(), AccessDenied> {
        Ok(())
    }
}

/// Checker that requires the client to carry at least one listed principal
#[derive(Debug, Clone, Default)]
pub struct PrincipalAllowList {
    allowed: BTreeSet<Principal>,
}

impl PrincipalAllowList {
    pub fn new(allowed: impl IntoIterator<Item = Principal>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl ClientSubjectChecker for PrincipalAllowList {
    fn check_client_subject(&self, subject: Option<&Subject>) -> Result<(), AccessDenied> {
        let subject = subject.ok_or_else(|| AccessDenied::new("anonymous client"))?;
        if subject.principals().any(|p| self.allowed.contains(p)) {
            Ok(())
        } else {
            Err(AccessDenied::new("no allowed principal in client subject"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_list_rejects_anonymous() {
        let checker = PrincipalAllowList::new([Principal::new("reggie")]);
        assert!(checker.check_client_subject(None).is_err());

        let subject = Subject::new([Principal::new("reggie"), Principal::new("ops")]);
        assert!(checker.check_client_subject(Some(&subject)).is_ok());

        let stranger = Subject::new([Principal::new("mallory")]);
        let err = checker.check_client_subject(Some(&stranger)).unwrap_err();
        assert!(err.reason().contains("no allowed principal"));
    }

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.check_client_subject(None).is_ok());
        let subject = Subject::new([Principal::new("anyone")]);
        assert!(AllowAll.check_client_subject(Some(&subject)).is_ok());
    }
}
