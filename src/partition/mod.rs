//! Containers used by the load coordinator.
//!
//! - [`PartitionIndex`]: waiting load groups ordered by partition key
//! - [`MemberList`]: union members with O(1) removal by handle

mod index;
mod members;

pub use index::{PartitionHandle, PartitionIndex};
pub use members::{Iter, MemberList, MembershipHandle, Removed};
