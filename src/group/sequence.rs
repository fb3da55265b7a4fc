//! Zero-based fragment positioning within a group.
//!
//! Provides [`SequenceNumber`], a type-safe wrapper around `u32` with
//! overflow-safe conversions for tracking fragment order.

use std::num::TryFromIntError;

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// Zero-based ordinal of a fragment inside its group.
///
/// # Examples
///
/// ```
/// use msh_reliability::group::SequenceNumber;
/// let sequence = SequenceNumber::new(3);
/// assert_eq!(sequence.get(), 3);
/// assert!(sequence.is_within(4));
/// assert!(!sequence.is_within(3));
/// ```
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    From,
    Serialize,
    Deserialize,
)]
#[display("{_0}")]
pub struct SequenceNumber(u32);

impl SequenceNumber {
    /// Construct a sequence number from a `u32` value.
    #[must_use]
    pub const fn new(value: u32) -> Self { Self(value) }

    /// Return the first valid sequence number.
    #[must_use]
    pub const fn zero() -> Self { Self(0) }

    /// Return the underlying numeric value.
    #[must_use]
    pub const fn get(self) -> u32 { self.0 }

    /// Whether this sequence number is valid for a group of `total` fragments.
    #[must_use]
    pub const fn is_within(self, total: u32) -> bool { self.0 < total }
}

impl TryFrom<usize> for SequenceNumber {
    type Error = TryFromIntError;

    fn try_from(value: usize) -> Result<Self, Self::Error> { u32::try_from(value).map(Self) }
}

impl From<SequenceNumber> for u32 {
    fn from(value: SequenceNumber) -> Self { value.0 }
}
