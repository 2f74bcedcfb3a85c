//! The two cache layers: persistent disk entries and decoded images in
//! memory.

pub mod disk;
mod disk_journal;
pub mod memory;

pub use disk::{DiskCache, DiskCacheBuilder, Editor, Snapshot};
pub use memory::{ImagePin, MemoryCache};
