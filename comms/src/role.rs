use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the three cooperating parties.
///
/// `Role0` and `Role1` own the plaintext data, `Role2` is the helper that never sees
/// inputs or targets. `Role0` also hosts the batch barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PartyRole {
    Role0,
    Role1,
    Role2,
}

impl PartyRole {
    /// Every role, ordered by id.
    pub const ALL: [PartyRole; 3] = [PartyRole::Role0, PartyRole::Role1, PartyRole::Role2];

    /// The number of parties taking part in a computation.
    pub const COUNT: usize = Self::ALL.len();

    /// Returns the small integer id of this role.
    pub fn id(self) -> usize {
        match self {
            PartyRole::Role0 => 0,
            PartyRole::Role1 => 1,
            PartyRole::Role2 => 2,
        }
    }

    /// Gets the role for a given id.
    ///
    /// # Arguments
    /// * `id` - The integer id, `0..3`.
    ///
    /// # Returns
    /// The role or `None` if the id is out of range.
    pub fn from_id(id: usize) -> Option<Self> {
        Self::ALL.get(id).copied()
    }

    /// Whether this role is authorized to see plaintext inputs and targets.
    pub fn sees_plaintext(self) -> bool {
        matches!(self, PartyRole::Role0 | PartyRole::Role1)
    }

    /// Whether this role hosts the batch barrier.
    pub fn is_master(self) -> bool {
        self == PartyRole::Role0
    }

    /// The role that hosts the batch barrier.
    pub fn master() -> Self {
        PartyRole::Role0
    }

    /// The helper role that reconstructs values for non-linear layers.
    pub fn helper() -> Self {
        PartyRole::Role2
    }

    /// Iterates over every other role, ordered by id.
    pub fn peers(self) -> impl Iterator<Item = PartyRole> {
        Self::ALL.into_iter().filter(move |&r| r != self)
    }
}

impl fmt::Display for PartyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "role{}", self.id())
    }
}

/// Error returned when converting an out of range id into a `PartyRole`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRole(pub u8);

impl fmt::Display for InvalidRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid party role id {}, expected 0, 1 or 2", self.0)
    }
}

impl std::error::Error for InvalidRole {}

impl TryFrom<u8> for PartyRole {
    type Error = InvalidRole;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_id(value as usize).ok_or(InvalidRole(value))
    }
}

impl From<PartyRole> for u8 {
    fn from(value: PartyRole) -> Self {
        value.id() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_skip_self() {
        let peers: Vec<_> = PartyRole::Role1.peers().collect();
        assert_eq!(peers, vec![PartyRole::Role0, PartyRole::Role2]);
    }

    #[test]
    fn only_data_owners_see_plaintext() {
        assert!(PartyRole::Role0.sees_plaintext());
        assert!(PartyRole::Role1.sees_plaintext());
        assert!(!PartyRole::Role2.sees_plaintext());
    }

    #[test]
    fn serde_uses_the_numeric_id() {
        let json = serde_json::to_string(&PartyRole::Role2).unwrap();
        assert_eq!(json, "2");

        let role: PartyRole = serde_json::from_str("1").unwrap();
        assert_eq!(role, PartyRole::Role1);

        assert!(serde_json::from_str::<PartyRole>("3").is_err());
    }
}
