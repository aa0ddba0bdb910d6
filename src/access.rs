//! Access control: share-level gatekeeping and POSIX mode evaluation.
//!
//! Everything here is pure over snapshots; the backends load the file and
//! share records and delegate the decisions.

use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::auth::{AuthContext, AuthMethod, Identity};
use crate::error::{StoreError, StoreResult};
use crate::model::{File, ShareOptions, SquashMode, MODE_STICKY};

/// Mask of granted or requested permissions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Permissions(u32);

impl Permissions {
    pub const READ: Permissions = Permissions(0o001);
    pub const WRITE: Permissions = Permissions(0o002);
    /// Execute on files, traverse on directories.
    pub const EXECUTE: Permissions = Permissions(0o004);
    pub const DELETE: Permissions = Permissions(0o010);
    pub const CHANGE_PERMISSIONS: Permissions = Permissions(0o020);
    pub const CHANGE_OWNERSHIP: Permissions = Permissions(0o040);

    pub const NONE: Permissions = Permissions(0);
    pub const ALL: Permissions = Permissions(0o077);

    pub fn union(self, other: Permissions) -> Permissions {
        Permissions(self.0 | other.0)
    }

    pub fn intersect(self, other: Permissions) -> Permissions {
        Permissions(self.0 & other.0)
    }

    pub fn remove(self, other: Permissions) -> Permissions {
        Permissions(self.0 & !other.0)
    }

    pub fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Outcome of a share-access evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: String,
    pub read_only: bool,
}

impl AccessDecision {
    fn denied(reason: impl Into<String>, read_only: bool) -> AccessDecision {
        AccessDecision { allowed: false, reason: reason.into(), read_only }
    }
}

/// Evaluate share options against a connecting session, in strict order:
/// authentication requirement, allowed methods, denied clients, allowed
/// clients, then identity mapping. The returned context carries the
/// effective identity every downstream operation must use.
pub fn evaluate_share_access(
    opts: &ShareOptions,
    auth: &AuthContext,
) -> (AccessDecision, AuthContext) {
    let read_only = opts.read_only;

    if opts.require_auth && auth.method == AuthMethod::Anonymous {
        return (
            AccessDecision::denied("share requires authentication", read_only),
            auth.clone(),
        );
    }

    if !opts.allowed_auth_methods.is_empty()
        && !opts.allowed_auth_methods.iter().any(|m| m == auth.method.as_str())
    {
        return (
            AccessDecision::denied(
                format!("auth method {} is not allowed", auth.method.as_str()),
                read_only,
            ),
            auth.clone(),
        );
    }

    // Deny is evaluated first and takes precedence.
    if let Some(pattern) = first_match(&opts.denied_clients, auth.client_addr) {
        return (
            AccessDecision::denied(format!("client denied by {pattern}"), read_only),
            auth.clone(),
        );
    }

    if !opts.allowed_clients.is_empty() && first_match(&opts.allowed_clients, auth.client_addr).is_none()
    {
        return (
            AccessDecision::denied("client is not in the allowed list", read_only),
            auth.clone(),
        );
    }

    let effective = AuthContext::new(
        effective_identity(opts.identity_mapping.as_ref(), &auth.identity),
        auth.method,
        auth.client_addr,
    );

    (AccessDecision { allowed: true, reason: String::new(), read_only }, effective)
}

/// First pattern in `patterns` matching `addr`, if any. A pattern is `*`,
/// an exact address, or a CIDR block.
fn first_match(patterns: &[String], addr: IpAddr) -> Option<&str> {
    patterns.iter().map(String::as_str).find(|pattern| matches_client(pattern, addr))
}

fn matches_client(pattern: &str, addr: IpAddr) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Ok(exact) = pattern.parse::<IpAddr>() {
        return exact == addr;
    }
    if let Ok(network) = pattern.parse::<IpNetwork>() {
        return network.contains(addr);
    }
    false
}

fn effective_identity(mapping: Option<&crate::model::IdentityMapping>, claimed: &Identity) -> Identity {
    let Some(mapping) = mapping else {
        return claimed.clone();
    };
    let mut identity = match mapping.squash {
        SquashMode::All => Identity::anonymous(),
        SquashMode::Root if claimed.is_root() => Identity::anonymous(),
        _ => claimed.clone(),
    };
    if let Some(uid) = mapping.map_uid {
        identity.uid = Some(uid);
    }
    if let Some(gid) = mapping.map_gid {
        identity.gid = Some(gid);
    }
    identity
}

/// Map a file's mode bits to granted permissions for the caller, honoring
/// ownership, group membership, root, and read-only shares.
pub fn check_permissions(
    auth: &AuthContext,
    file: &File,
    opts: &ShareOptions,
    requested: Permissions,
) -> Permissions {
    let granted = granted_permissions(auth, file, opts);
    granted.intersect(requested)
}

fn granted_permissions(auth: &AuthContext, file: &File, opts: &ShareOptions) -> Permissions {
    let read_only_mask = Permissions::WRITE.union(Permissions::DELETE);

    if auth.is_anonymous() {
        let mut granted = triplet_permissions(file.mode);
        if opts.read_only {
            granted = granted.remove(read_only_mask);
        }
        return granted;
    }

    if auth.is_root() {
        let mut granted = Permissions::ALL;
        if opts.read_only {
            granted = granted.remove(read_only_mask);
        }
        return granted;
    }

    let identity = &auth.identity;
    let mut granted = if identity.uid == Some(file.uid) {
        triplet_permissions(file.mode >> 6)
    } else if identity.has_gid(file.gid) {
        triplet_permissions(file.mode >> 3)
    } else {
        triplet_permissions(file.mode)
    };

    // The owner may always re-chmod and chown their own file.
    if identity.uid == Some(file.uid) {
        granted = granted.union(Permissions::CHANGE_PERMISSIONS).union(Permissions::CHANGE_OWNERSHIP);
    }

    if opts.read_only {
        granted = granted.remove(read_only_mask);
    }
    granted
}

/// Map the low rwx triplet of `bits` to the permission vocabulary. Write
/// implies delete of entries beneath a directory.
fn triplet_permissions(bits: u32) -> Permissions {
    let mut granted = Permissions::NONE;
    if bits & 0o4 != 0 {
        granted = granted.union(Permissions::READ);
    }
    if bits & 0o2 != 0 {
        granted = granted.union(Permissions::WRITE).union(Permissions::DELETE);
    }
    if bits & 0o1 != 0 {
        granted = granted.union(Permissions::EXECUTE);
    }
    granted
}

/// Sticky-bit restriction on removals and renames: when the parent carries
/// the sticky bit, only root, the parent owner, or the victim owner may
/// remove or displace the entry.
pub fn check_sticky_bit(auth: &AuthContext, parent: &File, victim: &File) -> StoreResult<()> {
    if parent.mode & MODE_STICKY == 0 {
        return Ok(());
    }
    if auth.is_root() {
        return Ok(());
    }
    let uid = auth.identity.uid;
    if uid.is_some() && (uid == Some(parent.uid) || uid == Some(victim.uid)) {
        return Ok(());
    }
    Err(StoreError::access_denied(format!(
        "sticky bit on {} forbids removing {}",
        parent.path, victim.path
    )))
}

/// Shorthand used by the backends: fail with access-denied unless every
/// requested bit was granted.
pub fn require(
    auth: &AuthContext,
    file: &File,
    opts: &ShareOptions,
    requested: Permissions,
) -> StoreResult<()> {
    if check_permissions(auth, file, opts, requested) == requested {
        Ok(())
    } else {
        Err(StoreError::access_denied(format!("permission denied on {}", file.path)))
    }
}
