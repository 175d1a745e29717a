//! Chunk storage, payload storage and the root-hash registry.

// Re-export
pub use self::chunk::ChunkHash;
pub use self::chunk::ChunkStore;
pub use self::chunk::DirectoryChunkStore;
pub use self::chunk::MemoryChunkStore;
pub use self::chunk::CHUNK_SIZE;
pub use self::payload::DirectoryPayloadStore;
pub use self::payload::MemoryPayloadStore;
pub use self::payload::PayloadStore;
pub use self::registry::Registry;

mod chunk;
mod payload;
mod registry;

pub(crate) use self::chunk::retrieve_expected;
