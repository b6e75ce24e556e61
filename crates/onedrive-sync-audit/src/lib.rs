//! onedrive-sync Audit - Structured logging and audit trail
//!
//! Provides:
//! - Structured event logging
//! - Human-readable explanations
//! - Queryable audit history
//! - Integration with `onedrive-sync explain`
