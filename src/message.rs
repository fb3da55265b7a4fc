//! Identifier of the logical business message handled by the core.
//!
//! Both the split-and-join and the reliability subsystems refer to the
//! enclosing ebMS user message by its [`MessageId`]. Neither owns the message
//! itself; the identifier is only a correlation key.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Identifier of a logical (business) message.
///
/// # Examples
///
/// ```
/// use msh_reliability::MessageId;
/// let id = MessageId::new("msg-1@sender.example");
/// assert_eq!(id.as_str(), "msg-1@sender.example");
/// ```
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    From,
    Into,
    Serialize,
    Deserialize,
)]
#[display("{_0}")]
pub struct MessageId(String);

impl MessageId {
    /// Create a new identifier.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self { Self(value.into()) }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str { self.0.as_str() }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self { Self(value.to_owned()) }
}

/// Side of an exchange the local access point plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum Role {
    /// The local access point sends the message.
    #[display("sending")]
    Sending,
    /// The local access point receives the message.
    #[display("receiving")]
    Receiving,
}
