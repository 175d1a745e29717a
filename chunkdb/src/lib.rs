#![warn(missing_docs)]
//! ChunkDB
//!
//! # Implementation Details
//!
//! Provides ordered and unordered key/value indices persisted as
//! content-addressed chunk trees.
//!
//! A table binds up to 30 typed columns to per-column indices. Each index is
//! one of two shapes: a copy-on-write B-tree (point lookups plus range
//! scans) or a 64-way hash trie (point lookups only). Every index node
//! serializes to a fixed 4096-byte chunk whose address is the SHA-256 digest
//! of its bytes, and parents reference children by that digest, so an index
//! root hash pins an immutable snapshot of the entire index.
//!
//! The only mutable cell in the system is a registry entry mapping a table
//! name to the current root of its descriptor chunk. Writes buffer dirty
//! nodes in memory; a flush rehashes the modified subtree bottom-up, stores
//! the new chunks, rewrites the table descriptor and finally moves the
//! registry entry. Readers observe either the old root or the new one,
//! never a torn tree, because chunks are written before the registry entry
//! and are addressed by content.
//!
//! Row bodies are not embedded in the indices. The primary column of a
//! table maps keys to the content hash of the row body held in an external
//! payload store; secondary columns map their own keys back to the owning
//! row's primary key.

pub mod btree;
mod error;
pub mod hashtrie;
pub mod key;
pub mod store;
pub mod table;

pub use error::ChunkDbError;
