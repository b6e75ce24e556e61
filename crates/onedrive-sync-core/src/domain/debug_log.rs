//! Debug log entry domain entity
//!
//! Append-only, per-account diagnostic log line. Distinct from
//! [`super::audit::AuditEntry`]: audit entries record *what operation
//! happened* for every account regardless of settings, while debug log
//! entries record low-level diagnostic detail and are only written when the
//! owning account has opted in via `debugLoggingEnabled`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::HashedAccountId;

/// Severity of a debug log entry, mirroring `tracing`'s level vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for DebugLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DebugLogLevel::Debug => "debug",
            DebugLogLevel::Info => "info",
            DebugLogLevel::Warn => "warn",
            DebugLogLevel::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// A single diagnostic log line scoped to one account.
///
/// Written only when `Account::debug_logging_enabled()` is true; the
/// `onedrive-sync-audit` crate's `AuditLogger` is responsible for gating on
/// that flag before ever constructing one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugLogEntry {
    /// Account this entry belongs to
    hashed_account_id: HashedAccountId,
    /// When the entry was recorded
    ts_utc: DateTime<Utc>,
    /// Severity level
    level: DebugLogLevel,
    /// Originating component, e.g. "reconciler", "transfer_pool"
    source: String,
    /// The log message
    message: String,
    /// Exception/error detail, if any
    exception_text: Option<String>,
}

impl DebugLogEntry {
    /// Creates a new debug log entry timestamped at creation time.
    pub fn new(
        hashed_account_id: HashedAccountId,
        level: DebugLogLevel,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            hashed_account_id,
            ts_utc: Utc::now(),
            level,
            source: source.into(),
            message: message.into(),
            exception_text: None,
        }
    }

    /// Attaches exception/error detail to this entry.
    pub fn with_exception_text(mut self, text: impl Into<String>) -> Self {
        self.exception_text = Some(text.into());
        self
    }

    pub fn hashed_account_id(&self) -> &HashedAccountId {
        &self.hashed_account_id
    }

    pub fn ts_utc(&self) -> DateTime<Utc> {
        self.ts_utc
    }

    pub fn level(&self) -> DebugLogLevel {
        self.level
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn exception_text(&self) -> Option<&str> {
        self.exception_text.as_deref()
    }
}
