//! Durable representation of volumes, leases and completed operations.
//!
//! Every piece of coordinator state lives here: the coordinator itself
//! holds no authoritative in-memory state. All writes go through
//! optimistic-concurrency generation checks on the [`RecordStore`].

mod adaptors;
mod record_store;
mod volume;


pub use adaptors::*;
pub use record_store::*;
pub use volume::*;
