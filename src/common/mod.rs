// Common utilities shared across record sources and the engine

pub mod audit;
pub mod binary;

// Re-exports for convenience
pub use binary::{read_bytes_at, read_u8_at, read_uint_be_at};

// Shared constants
pub const SQLITE_PAGE_ROWS: usize = 1024; // Rows fetched per paged SQLite query
