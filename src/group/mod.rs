//! Split-and-join of oversized payloads.
//!
//! This module collects the domain types and services used to cut an outbound
//! payload into stored fragments and to rebuild an inbound one. Each
//! sub-module focuses on a single concept; the public API is re-exported
//! here.

mod cleanup;
pub mod error;
pub mod fragmenter;
pub mod id;
pub mod reassembler;
pub mod sequence;
pub mod sweeper;
pub mod types;

pub use error::{FragmentationError, ReassemblyError};
pub use fragmenter::{Fragmenter, SplitOptions, SplitOutcome};
pub use id::{GroupId, GroupIdGenerator, RandomGroupIds};
pub use reassembler::{AcceptOutcome, InboundFragment, ReassembledMessage, Reassembler};
pub use sequence::SequenceNumber;
pub use sweeper::{GroupExpirationSweeper, SweepReport};
pub use types::{Fragment, FragmentRef, GroupStatus, MessageGroup};
