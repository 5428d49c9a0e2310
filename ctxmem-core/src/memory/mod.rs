//! Memory record model.
//!
//! [`MemoryRecord`] is the canonical representation of one stored fact.
//! [`MemoryPatch`] and [`StoreOptions`] describe partial records used by
//! update and store calls.

pub mod patch;
pub mod record;

pub use patch::{MemoryPatch, MetadataPatch, StoreOptions};
pub use record::{MemoryContent, MemoryMetadata, MemoryRecord, Relationship, clamp_unit};
