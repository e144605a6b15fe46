//! Core types for the virtual connection layer
//!
//! Entity roles, names, addresses and instances. All of them are immutable
//! values compared structurally, so they can be used directly as map keys.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

// ----------------------------------------------------------------------------
// Entity Type
// ----------------------------------------------------------------------------

/// Participant role of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Monitor,
    Metadata,
    Storage,
    Client,
    Manager,
}

impl EntityType {
    /// Whether this role is a cluster member keyed by its numeric id
    pub fn is_member(self) -> bool {
        matches!(self, EntityType::Storage)
    }

    /// Four-bit role code, used in the high bits of message ids
    pub fn type_code(self) -> u64 {
        match self {
            EntityType::Monitor => 1,
            EntityType::Metadata => 2,
            EntityType::Storage => 3,
            EntityType::Client => 4,
            EntityType::Manager => 5,
        }
    }

    /// Short role name
    pub fn type_name(self) -> &'static str {
        match self {
            EntityType::Monitor => "mon",
            EntityType::Metadata => "mds",
            EntityType::Storage => "osd",
            EntityType::Client => "client",
            EntityType::Manager => "mgr",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

// ----------------------------------------------------------------------------
// Entity Name
// ----------------------------------------------------------------------------

/// Role plus role-scoped numeric id (`-1` when unset)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityName {
    pub entity_type: EntityType,
    pub num: i64,
}

impl EntityName {
    pub const UNSET_NUM: i64 = -1;

    pub fn new(entity_type: EntityType, num: i64) -> Self {
        Self { entity_type, num }
    }

    pub fn storage(num: i64) -> Self {
        Self::new(EntityType::Storage, num)
    }

    pub fn client(num: i64) -> Self {
        Self::new(EntityType::Client, num)
    }

    pub fn monitor(num: i64) -> Self {
        Self::new(EntityType::Monitor, num)
    }

    pub fn is_member(&self) -> bool {
        self.entity_type.is_member()
    }

    pub fn has_num(&self) -> bool {
        self.num != Self::UNSET_NUM
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_num() {
            write!(f, "{}.{}", self.entity_type, self.num)
        } else {
            write!(f, "{}.?", self.entity_type)
        }
    }
}

// ----------------------------------------------------------------------------
// Entity Address
// ----------------------------------------------------------------------------

/// Network address of an entity; blank until the process learns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityAddr {
    pub addr: Option<SocketAddr>,
    pub nonce: u32,
}

impl EntityAddr {
    pub fn new(addr: SocketAddr, nonce: u32) -> Self {
        Self {
            addr: Some(addr),
            nonce,
        }
    }

    /// An address the process has not learned yet
    pub const fn blank() -> Self {
        Self {
            addr: None,
            nonce: 0,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.addr.is_none()
    }
}

impl Default for EntityAddr {
    fn default() -> Self {
        Self::blank()
    }
}

impl fmt::Display for EntityAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "{}/{}", addr, self.nonce),
            None => f.write_str("-"),
        }
    }
}

// ----------------------------------------------------------------------------
// Owner Key
// ----------------------------------------------------------------------------

/// Index key for registry and dispatcher tables.
///
/// Cluster members are keyed by their numeric id; every other role shares
/// the `NON_MEMBER` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerKey(pub i64);

impl OwnerKey {
    pub const NON_MEMBER: Self = Self(-1);

    pub fn member(num: i64) -> Self {
        Self(num)
    }

    pub fn is_member(&self) -> bool {
        *self != Self::NON_MEMBER
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_member() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("non-member")
        }
    }
}

// ----------------------------------------------------------------------------
// Entity Instance
// ----------------------------------------------------------------------------

/// A peer's logical address: name plus network address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityInstance {
    pub name: EntityName,
    pub addr: EntityAddr,
}

impl EntityInstance {
    pub fn new(name: EntityName, addr: EntityAddr) -> Self {
        Self { name, addr }
    }

    pub fn entity_type(&self) -> EntityType {
        self.name.entity_type
    }

    pub fn is_member(&self) -> bool {
        self.name.is_member()
    }

    /// Key under which this entity's connections and dispatchers are filed
    pub fn owner_key(&self) -> OwnerKey {
        if self.is_member() {
            OwnerKey::member(self.name.num)
        } else {
            OwnerKey::NON_MEMBER
        }
    }

    pub fn has_blank_addr(&self) -> bool {
        self.addr.is_blank()
    }

    /// Same name at a different address
    pub fn with_addr(&self, addr: EntityAddr) -> Self {
        Self {
            name: self.name,
            addr,
        }
    }
}

impl fmt::Display for EntityInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.addr)
    }
}
