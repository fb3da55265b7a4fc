use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a split transfer.
///
/// # Examples
///
/// ```
/// use msh_reliability::group::GroupId;
/// use uuid::Uuid;
/// let id = GroupId::new(Uuid::nil());
/// assert_eq!(id.get(), Uuid::nil());
/// ```
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Into, Serialize, Deserialize,
)]
#[display("{_0}")]
pub struct GroupId(Uuid);

impl GroupId {
    /// Wrap an existing UUID.
    #[must_use]
    pub const fn new(value: Uuid) -> Self { Self(value) }

    /// Return the inner UUID.
    #[must_use]
    pub const fn get(self) -> Uuid { self.0 }
}

/// Supplier of collision-resistant group identifiers.
pub trait GroupIdGenerator: Send + Sync {
    /// Produce a fresh identifier.
    fn next_group_id(&self) -> GroupId;
}

/// Random (version 4) UUID generator.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomGroupIds;

impl GroupIdGenerator for RandomGroupIds {
    fn next_group_id(&self) -> GroupId { GroupId(Uuid::new_v4()) }
}
