//! Authentication context handed in by the protocol layers.

use std::net::IpAddr;

/// How the session authenticated.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Anonymous,
    Unix,
    Kerberos,
}

impl AuthMethod {
    /// Name used in share `allowed_auth_methods` lists.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Anonymous => "anonymous",
            AuthMethod::Unix => "unix",
            AuthMethod::Kerberos => "kerberos",
        }
    }
}

/// Claimed (or squashed) caller identity. `uid` of `None` is anonymous.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub auxiliary_gids: Vec<u32>,
}

impl Identity {
    pub fn anonymous() -> Identity {
        Identity::default()
    }

    pub fn unix(uid: u32, gid: u32) -> Identity {
        Identity { uid: Some(uid), gid: Some(gid), auxiliary_gids: Vec::new() }
    }

    pub fn is_anonymous(&self) -> bool {
        self.uid.is_none()
    }

    pub fn is_root(&self) -> bool {
        self.uid == Some(0)
    }

    /// True when `gid` is the primary or an auxiliary group.
    pub fn has_gid(&self, gid: u32) -> bool {
        self.gid == Some(gid) || self.auxiliary_gids.contains(&gid)
    }
}

/// Everything the store needs to know about the caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub identity: Identity,
    pub method: AuthMethod,
    pub client_addr: IpAddr,
}

impl AuthContext {
    pub fn new(identity: Identity, method: AuthMethod, client_addr: IpAddr) -> AuthContext {
        AuthContext { identity, method, client_addr }
    }

    pub fn is_root(&self) -> bool {
        self.identity.is_root()
    }

    pub fn is_anonymous(&self) -> bool {
        self.identity.is_anonymous()
    }
}
