use abyss_shared::perms::{Permission, Principal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub uuid: i64,
    pub username: String,
    pub parent_id: i64,
    pub public_key: [u8; 32],
    pub privilege: i64,
}

impl User {
    pub fn principal(&self) -> Principal {
        Principal {
            uuid: self.uuid,
            privilege: self.privilege,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAttribute {
    pub uid: String,
    pub owner: i64,
    pub permission: Permission,
}
