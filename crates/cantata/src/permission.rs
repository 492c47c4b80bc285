use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

bitflags! {
    /// What a session is allowed to do. Seeded from the configured default
    /// on accept; the command layer may tighten or widen it later.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Permission: u32 {
        const READ = 1 << 0;
        const ADD = 1 << 1;
        const CONTROL = 1 << 2;
        const ADMIN = 1 << 3;
    }
}

// On the wire and in config dumps a mask is just its bits.
impl Serialize for Permission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_bits_truncate(u32::deserialize(deserializer)?))
    }
}

impl Default for Permission {
    /// With no access control configured every session gets full access.
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown permission {0:?}")]
pub struct UnknownPermission(pub String);

impl Permission {
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "read" => Some(Self::READ),
            "add" => Some(Self::ADD),
            "control" => Some(Self::CONTROL),
            "admin" => Some(Self::ADMIN),
            _ => None,
        }
    }

    /// Parses a comma-separated permission list, e.g. `read,add,control`.
    /// An empty string yields the empty mask.
    pub fn parse_list(list: &str) -> Result<Self, UnknownPermission> {
        let mut mask = Self::empty();
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            mask |= Self::from_wire_name(name).ok_or_else(|| UnknownPermission(name.to_owned()))?;
        }
        Ok(mask)
    }
}
