pub mod memory;

pub use memory::{CallLog, MemoryAsset, MemoryContents, MemoryDestination, MemorySource, Operation};
