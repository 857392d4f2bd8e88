//! Cache key strategy.
//!
//! Every cached datum lives under a colon-delimited key whose leading
//! segment names its data class:
//!
//! | Class               | Key                              |
//! |---------------------|----------------------------------|
//! | user auth           | `auth:user:{user}`               |
//! | permissions         | `perm:{user}:{scope}`            |
//! | role hierarchy      | `roles:{user}:{role_type}`       |
//! | org membership      | `org:{user}:{org}`               |
//! | project membership  | `project:{user}:{project}`       |
//! | batched checks      | `batch:perm:{user}:{checksum}`   |
//! | sessions            | `session:{session}`              |
//!
//! Pattern builders stop their wildcard at a segment boundary, so the
//! pattern for user `4` never touches user `42`.

use std::fmt;
use std::time::Duration;

use sha2::{Digest, Sha256};

use super::InvalidationPattern;

/// Separator used when hashing permission lists. Never valid inside a name.
const CHECKSUM_SEPARATOR: char = '\u{1f}';

/// Prefix for in-flight warm-up markers.
const WARMING_PREFIX: &str = "warming";

/// The class of data a key belongs to. Drives the default TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataClass {
    UserAuth,
    Permissions,
    Roles,
    Organizations,
    Projects,
    Sessions,
    PermissionBatch,
}

impl DataClass {
    /// Default time-to-live for this class.
    pub const fn default_ttl(self) -> Duration {
        match self {
            Self::UserAuth => Duration::from_secs(300),      // 5 minutes
            Self::Permissions => Duration::from_secs(600),   // 10 minutes
            Self::Roles => Duration::from_secs(900),         // 15 minutes
            Self::Organizations => Duration::from_secs(1800), // 30 minutes
            Self::Projects => Duration::from_secs(1800),
            Self::Sessions => Duration::from_secs(3600), // 1 hour
            Self::PermissionBatch => Duration::from_secs(300),
        }
    }

    /// Classify a key by its leading segment.
    ///
    /// Returns `None` for keys outside the naming scheme.
    pub fn from_key(key: &str) -> Option<Self> {
        let mut segments = key.split(':');
        match segments.next()? {
            "auth" => Some(Self::UserAuth),
            "perm" => Some(Self::Permissions),
            "roles" => Some(Self::Roles),
            "org" => Some(Self::Organizations),
            "project" => Some(Self::Projects),
            "session" => Some(Self::Sessions),
            "batch" if segments.next() == Some("perm") => Some(Self::PermissionBatch),
            _ => None,
        }
    }
}

/// Where a set of permissions applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PermissionScope {
    Global,
    Org(String),
    Project(String),
}

impl PermissionScope {
    /// Narrowest scope implied by an optional org/project pair.
    pub fn from_ids(org_id: Option<&str>, project_id: Option<&str>) -> Self {
        match (org_id, project_id) {
            (_, Some(project)) => Self::Project(project.to_string()),
            (Some(org), None) => Self::Org(org.to_string()),
            (None, None) => Self::Global,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Self::Global)
    }
}

impl fmt::Display for PermissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Org(id) => write!(f, "org:{id}"),
            Self::Project(id) => write!(f, "project:{id}"),
        }
    }
}

pub fn user_auth(user_id: &str) -> String {
    format!("auth:user:{user_id}")
}

pub fn user_permissions(user_id: &str, scope: &PermissionScope) -> String {
    format!("perm:{user_id}:{scope}")
}

pub fn user_roles(user_id: &str, role_type: &str) -> String {
    format!("roles:{user_id}:{role_type}")
}

pub fn user_org(user_id: &str, org_id: &str) -> String {
    format!("org:{user_id}:{org_id}")
}

pub fn user_project(user_id: &str, project_id: &str) -> String {
    format!("project:{user_id}:{project_id}")
}

/// Key for a memoized batch of permission checks.
pub fn permission_batch<S: AsRef<str>>(user_id: &str, permissions: &[S]) -> String {
    format!(
        "batch:perm:{user_id}:{}",
        compute_permission_checksum(permissions)
    )
}

pub fn session(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Marker key signalling that `key` is being populated.
pub fn warming(key: &str) -> String {
    format!("{WARMING_PREFIX}:{key}")
}

pub fn user_auth_pattern(user_id: &str) -> InvalidationPattern {
    InvalidationPattern::subtree(user_auth(user_id))
}

pub fn user_permissions_pattern(user_id: &str) -> InvalidationPattern {
    InvalidationPattern::prefix(format!("perm:{user_id}:"))
}

/// Pattern for one permission scope of a user.
pub fn user_permission_scope_pattern(
    user_id: &str,
    scope: &PermissionScope,
) -> InvalidationPattern {
    InvalidationPattern::subtree(user_permissions(user_id, scope))
}

pub fn user_roles_pattern(user_id: &str) -> InvalidationPattern {
    InvalidationPattern::prefix(format!("roles:{user_id}:"))
}

pub fn user_orgs_pattern(user_id: &str) -> InvalidationPattern {
    InvalidationPattern::prefix(format!("org:{user_id}:"))
}

pub fn user_projects_pattern(user_id: &str) -> InvalidationPattern {
    InvalidationPattern::prefix(format!("project:{user_id}:"))
}

pub fn user_permission_batch_pattern(user_id: &str) -> InvalidationPattern {
    InvalidationPattern::prefix(format!("batch:perm:{user_id}:"))
}

pub fn session_pattern(session_id: &str) -> InvalidationPattern {
    InvalidationPattern::subtree(session(session_id))
}

/// Order-independent checksum over a permission list.
///
/// Only used to build memoization keys. Not a security primitive.
pub fn compute_permission_checksum<S: AsRef<str>>(permissions: &[S]) -> String {
    let mut sorted: Vec<&str> = permissions.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    for (i, permission) in sorted.iter().enumerate() {
        if i > 0 {
            let mut buf = [0u8; 4];
            hasher.update(CHECKSUM_SEPARATOR.encode_utf8(&mut buf).as_bytes());
        }
        hasher.update(permission.as_bytes());
    }

    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(user_auth("42"), "auth:user:42");
        assert_eq!(user_permissions("7", &PermissionScope::Global), "perm:7:global");
        assert_eq!(
            user_permissions("7", &PermissionScope::Org("1".into())),
            "perm:7:org:1"
        );
        assert_eq!(user_roles("7", "org"), "roles:7:org");
        assert_eq!(user_org("7", "3"), "org:7:3");
        assert_eq!(user_project("7", "9"), "project:7:9");
        assert_eq!(session("abc"), "session:abc");
        assert_eq!(warming("auth:user:42"), "warming:auth:user:42");
    }

    #[test]
    fn test_checksum_ignores_order() {
        let a = compute_permission_checksum(&["ledger.read", "ledger.write", "inventory.read"]);
        let b = compute_permission_checksum(&["inventory.read", "ledger.write", "ledger.read"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_checksum_separates_items() {
        let joined = compute_permission_checksum(&["ab", "c"]);
        let split = compute_permission_checksum(&["a", "bc"]);
        assert_ne!(joined, split);
    }

    #[test]
    fn test_batch_key_uses_checksum() {
        let key = permission_batch("5", &["b", "a"]);
        assert_eq!(key, format!("batch:perm:5:{}", compute_permission_checksum(&["a", "b"])));
    }

    #[test]
    fn test_data_class_from_key() {
        assert_eq!(DataClass::from_key("auth:user:1"), Some(DataClass::UserAuth));
        assert_eq!(DataClass::from_key("perm:1:global"), Some(DataClass::Permissions));
        assert_eq!(DataClass::from_key("batch:perm:1:ff"), Some(DataClass::PermissionBatch));
        assert_eq!(DataClass::from_key("batch:other"), None);
        assert_eq!(DataClass::from_key("reports:monthly"), None);
        assert_eq!(
            DataClass::from_key("session:x").map(DataClass::default_ttl),
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_auth_pattern_stops_at_segment() {
        let pattern = user_auth_pattern("4");
        assert!(pattern.matches("auth:user:4"));
        assert!(pattern.matches("auth:user:4:profile"));
        assert!(!pattern.matches("auth:user:42"));
    }

    #[test]
    fn test_scope_from_ids() {
        assert_eq!(PermissionScope::from_ids(None, None), PermissionScope::Global);
        assert_eq!(
            PermissionScope::from_ids(Some("1"), None),
            PermissionScope::Org("1".into())
        );
        assert_eq!(
            PermissionScope::from_ids(Some("1"), Some("2")),
            PermissionScope::Project("2".into())
        );
    }
}
