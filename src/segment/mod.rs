//! Immutable sorted segment files and the on-disk segment store.

pub mod heap;
pub mod store;

pub use heap::{Segment, SegmentWriter};
pub use store::SegmentStore;
