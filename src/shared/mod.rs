//! Collections whose handles can be merged.
//!
//! Two handles that [`encounter`](SharedQueue::encounter) each other end up
//! operating on a single storage. Retired storage forwards to the merged one,
//! so old handles and their clones keep working.

mod body;
mod hierarchy;
mod queue;

pub use body::MergeDomain;
pub use hierarchy::{MemberId, Placement, SharedHierarchy};
pub use queue::{QueuePolicy, SharedQueue};
