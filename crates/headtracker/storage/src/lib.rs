//! Chain history storage for the head tracker.
//!
//! The [`HeadStorageReader`] and [`HeadStorageWriter`] traits describe everything the tracker
//! needs from persisted chain state: the latest processed block, point lookups by number and
//! hash, the logs associated with each block, and the truncation used to discard a
//! non-canonical suffix after a reorg. [`InMemoryHeadSaver`] is the bounded, in-memory
//! implementation used by the service.
mod error;
pub use error::StorageError;

mod models;
pub use models::SavedBlock;

mod traits;
pub use traits::{HeadStorage, HeadStorageReader, HeadStorageWriter};

mod memory;
pub use memory::InMemoryHeadSaver;
