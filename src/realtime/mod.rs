//! Realtime session routing over a bounded streaming-worker pool.

mod router;

pub use router::{Allocation, SessionEnd, SessionRequest, SessionRouter};
