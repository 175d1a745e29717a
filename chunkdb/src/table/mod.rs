//! Tables, descriptors and the database dispatcher.
//!

// Re-export
pub use self::database::ChunkDb;
pub use self::descriptor::ColumnSpec;
pub use self::descriptor::IndexKind;
pub use self::descriptor::TableDescriptor;
pub use self::descriptor::MAX_COLUMNS;
pub use self::descriptor::MAX_COLUMN_NAME;
pub use self::row::Row;
pub use self::table::Table;

mod database;
pub mod descriptor;
mod row;
mod table;

#[cfg(test)]
mod tests;
