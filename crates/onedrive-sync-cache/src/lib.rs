//! onedrive-sync Cache - Local state persistence
//!
//! SQLite-based cache for:
//! - File metadata and sync state
//! - Delta tokens
//! - Account information
//! - Audit trail
