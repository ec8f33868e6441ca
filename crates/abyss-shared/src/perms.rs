use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::ROOT_UUID;
use crate::error::AbyssError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    Security,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Peer,
    Other,
}

/// One `[r-][w-]` pair of the permission triplet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPair {
    pub read: bool,
    pub write: bool,
}

impl FromStr for PermissionPair {
    type Err = AbyssError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 2 {
            return Err(AbyssError::Malformed(format!("permission pair: {s:?}")));
        }
        let read = match bytes[0] {
            b'r' => true,
            b'-' => false,
            _ => return Err(AbyssError::Malformed(format!("permission pair: {s:?}"))),
        };
        let write = match bytes[1] {
            b'w' => true,
            b'-' => false,
            _ => return Err(AbyssError::Malformed(format!("permission pair: {s:?}"))),
        };
        Ok(Self { read, write })
    }
}

impl fmt::Display for PermissionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' }
        )
    }
}

impl PermissionPair {
    pub fn allows(&self, access: AccessKind) -> bool {
        match access {
            AccessKind::Read => self.read,
            AccessKind::Write => self.write,
            // Security is decided above the pair level, see `decide`
            AccessKind::Security => false,
        }
    }
}

/// Full `"oo,pp,tt"` triplet: owner / same-privilege peer / other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Permission {
    pub owner: PermissionPair,
    pub peer: PermissionPair,
    pub other: PermissionPair,
}

impl Permission {
    pub fn pair_for(&self, role: Role) -> PermissionPair {
        match role {
            Role::Owner => self.owner,
            Role::Peer => self.peer,
            Role::Other => self.other,
        }
    }

    /// Default for freshly initialized resources: `"rw,--,--"`.
    pub fn owner_only() -> Self {
        Self {
            owner: PermissionPair { read: true, write: true },
            peer: PermissionPair { read: false, write: false },
            other: PermissionPair { read: false, write: false },
        }
    }

    /// Bootstrap default for reserved directories: `"rw,r-,r-"`.
    pub fn world_readable() -> Self {
        Self {
            owner: PermissionPair { read: true, write: true },
            peer: PermissionPair { read: true, write: false },
            other: PermissionPair { read: true, write: false },
        }
    }
}

impl FromStr for Permission {
    type Err = AbyssError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',');
        let (Some(oo), Some(pp), Some(tt), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AbyssError::Malformed(format!("permission triplet: {s:?}")));
        };
        Ok(Self {
            owner: oo.parse()?,
            peer: pp.parse()?,
            other: tt.parse()?,
        })
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.owner, self.peer, self.other)
    }
}

impl TryFrom<String> for Permission {
    type Error = AbyssError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Permission> for String {
    fn from(p: Permission) -> Self {
        p.to_string()
    }
}

/// Requester or resource owner as the decision sees them.
#[derive(Debug, Clone, Copy)]
pub struct Principal {
    pub uuid: i64,
    pub privilege: i64,
}

pub fn resolve_role(attr_owner: i64, requester: Principal, owner: Principal) -> Role {
    if attr_owner == requester.uuid {
        Role::Owner
    } else if requester.privilege == owner.privilege {
        Role::Peer
    } else {
        Role::Other
    }
}

/// The access decision for one (requester, attribute) pair.
///
/// Strictly greater privilege overrides Read/Write denials; Security stays
/// with owners holding write and with root.
pub fn decide(
    permission: &Permission,
    attr_owner: i64,
    owner: Principal,
    requester: Principal,
    access: AccessKind,
) -> bool {
    let role = resolve_role(attr_owner, requester, owner);
    let pair = permission.pair_for(role);
    match access {
        AccessKind::Read | AccessKind::Write => {
            pair.allows(access) || requester.privilege > owner.privilege
        }
        AccessKind::Security => {
            (role == Role::Owner && pair.write) || requester.uuid == ROOT_UUID
        }
    }
}

/// `ls`-style rendering: `[d-]` then three `r?w?-` groups. The execute bit
/// is not modeled and always renders as `-`.
pub fn render_listing(permission: &Permission, is_dir: bool) -> String {
    let group = |p: PermissionPair| {
        format!(
            "{}{}-",
            if p.read { 'r' } else { '-' },
            if p.write { 'w' } else { '-' }
        )
    };
    format!(
        "{}{}{}{}",
        if is_dir { 'd' } else { '-' },
        group(permission.owner),
        group(permission.peer),
        group(permission.other)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perm(s: &str) -> Permission {
        s.parse().unwrap()
    }

    #[test]
    fn parse_render_roundtrip() {
        for s in ["rw,r-,--", "--,--,--", "rw,rw,rw", "r-,w-,r-"] {
            assert_eq!(perm(s).to_string(), s);
        }
    }

    #[test]
    fn malformed_rejected() {
        for s in ["", "rw", "rw,r-", "rw,r-,--,--", "xw,r-,--", "rw,r,--", "rw;r-;--"] {
            assert!(s.parse::<Permission>().is_err(), "accepted {s:?}");
        }
    }

    #[test]
    fn owner_role_wins_over_privilege() {
        let owner = Principal { uuid: 7, privilege: 10 };
        // Owner with a peer-level privilege still reads through the owner pair.
        let requester = Principal { uuid: 7, privilege: 10 };
        assert!(decide(&perm("rw,--,--"), 7, owner, requester, AccessKind::Read));
        assert!(decide(&perm("rw,--,--"), 7, owner, requester, AccessKind::Write));
    }

    #[test]
    fn decision_matrix() {
        // (perm, role, requester privilege relative to owner) -> expectations
        // from the role algebra: pair bit OR strictly-greater privilege.
        let p = perm("rw,r-,--");
        let owner = Principal { uuid: 1000, privilege: 10 };

        let peer = Principal { uuid: 2, privilege: 10 };
        assert!(decide(&p, 1000, owner, peer, AccessKind::Read));
        assert!(!decide(&p, 1000, owner, peer, AccessKind::Write));

        let lesser = Principal { uuid: 3, privilege: 5 };
        assert!(!decide(&p, 1000, owner, lesser, AccessKind::Read));
        assert!(!decide(&p, 1000, owner, lesser, AccessKind::Write));

        let greater = Principal { uuid: 4, privilege: 20 };
        assert!(decide(&p, 1000, owner, greater, AccessKind::Read));
        assert!(decide(&p, 1000, owner, greater, AccessKind::Write));
    }

    #[test]
    fn security_restricted_to_owner_and_root() {
        let p = perm("rw,rw,rw");
        let owner = Principal { uuid: 9, privilege: 10 };

        // Owner with write holds Security.
        let requester = Principal { uuid: 9, privilege: 10 };
        assert!(decide(&p, 9, owner, requester, AccessKind::Security));

        // Owner without write does not.
        let readonly = perm("r-,rw,rw");
        assert!(!decide(&readonly, 9, owner, requester, AccessKind::Security));

        // Higher privilege alone never grants Security.
        let admin = Principal { uuid: 5, privilege: 100 };
        assert!(!decide(&p, 9, owner, admin, AccessKind::Security));

        // Root always does.
        let root = Principal { uuid: ROOT_UUID, privilege: 0 };
        assert!(decide(&readonly, 9, owner, root, AccessKind::Security));
    }

    #[test]
    fn listing_render() {
        assert_eq!(render_listing(&perm("rw,r-,--"), true), "drw-r-----");
        assert_eq!(render_listing(&perm("rw,rw,rw"), false), "-rw-rw-rw-");
    }
}
