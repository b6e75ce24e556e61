//! Account domain entity
//!
//! This module defines the Account entity which represents a user's
//! OneDrive account and its synchronization state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    errors::DomainError,
    newtypes::{AccountId, DeltaToken, Email, HashedAccountId, SyncPath},
};

/// Default bound for [`Account::max_parallel_transfers`] when unset.
pub const DEFAULT_MAX_PARALLEL_TRANSFERS: u32 = 4;
/// Default bound for [`Account::max_batch_items`] when unset.
pub const DEFAULT_MAX_BATCH_ITEMS: u32 = 50;

/// T031: Represents the current state of an account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    /// Account is active and can sync
    #[default]
    Active,
    /// OAuth token has expired, needs refresh
    TokenExpired,
    /// Account has been suspended (e.g., by Microsoft)
    Suspended,
    /// Account is in an error state with a description
    Error(String),
}

impl AccountState {
    /// Returns true if the account can perform sync operations
    pub fn can_sync(&self) -> bool {
        matches!(self, AccountState::Active)
    }

    /// Returns true if the account needs token refresh
    pub fn needs_token_refresh(&self) -> bool {
        matches!(self, AccountState::TokenExpired)
    }
}

impl std::fmt::Display for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountState::Active => write!(f, "active"),
            AccountState::TokenExpired => write!(f, "token_expired"),
            AccountState::Suspended => write!(f, "suspended"),
            AccountState::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// T032: Represents a user's OneDrive account
///
/// An Account entity contains all information needed to identify and
/// manage a user's OneDrive connection, including authentication state,
/// quota information, and sync configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Internal storage row identifier (not the log-safe account key)
    id: AccountId,
    /// Stable, log-safe hashed account identifier; the core's only key for
    /// this account outside of the Authenticator call.
    hashed_id: HashedAccountId,
    /// User's email address (Microsoft account). Held only long enough to
    /// derive `hashed_id` and to pass to the Authenticator; never logged.
    email: Email,
    /// Display name from Microsoft profile
    display_name: String,
    /// OneDrive drive ID from Microsoft Graph API
    onedrive_id: String,
    /// Local path where files are synchronized
    sync_root: SyncPath,
    /// Bounded 1..10: max concurrent TransferPool workers for this account
    max_parallel_transfers: u32,
    /// Bounded 1..100: max items applied per delta/reconcile batch
    max_batch_items: u32,
    /// Whether DebugLogEntry rows are written for this account
    debug_logging_enabled: bool,
    /// Whether a SessionLog row is written per sync run for this account
    detailed_session_logging_enabled: bool,
    /// Bytes used in OneDrive storage
    quota_used: u64,
    /// Total bytes available in OneDrive storage
    quota_total: u64,
    /// Delta token for incremental sync (None for initial sync)
    delta_token: Option<DeltaToken>,
    /// Timestamp of last successful sync (None if never synced)
    last_sync: Option<DateTime<Utc>>,
    /// Current account state
    state: AccountState,
    /// When this account was created
    created_at: DateTime<Utc>,
}

impl Account {
    /// T033: Creates a new Account with the provided details
    ///
    /// # Arguments
    /// * `email` - User's Microsoft account email
    /// * `display_name` - User's display name
    /// * `onedrive_id` - OneDrive drive ID from Graph API
    /// * `sync_root` - Local path for file synchronization
    ///
    /// # Returns
    /// A new Account in Active state with zero quota usage
    pub fn new(
        email: Email,
        display_name: impl Into<String>,
        onedrive_id: impl Into<String>,
        sync_root: SyncPath,
    ) -> Self {
        let hashed_id = HashedAccountId::from_plain(email.as_str());
        Self {
            id: AccountId::new(),
            hashed_id,
            email,
            display_name: display_name.into(),
            onedrive_id: onedrive_id.into(),
            sync_root,
            max_parallel_transfers: DEFAULT_MAX_PARALLEL_TRANSFERS,
            max_batch_items: DEFAULT_MAX_BATCH_ITEMS,
            debug_logging_enabled: false,
            detailed_session_logging_enabled: false,
            quota_used: 0,
            quota_total: 0,
            delta_token: None,
            last_sync: None,
            state: AccountState::Active,
            created_at: Utc::now(),
        }
    }

    /// Creates an Account with a specific ID and hashed id (for reconstitution from storage)
    #[allow(clippy::too_many_arguments)]
    pub fn with_id(
        id: AccountId,
        hashed_id: HashedAccountId,
        email: Email,
        display_name: impl Into<String>,
        onedrive_id: impl Into<String>,
        sync_root: SyncPath,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            hashed_id,
            email,
            display_name: display_name.into(),
            onedrive_id: onedrive_id.into(),
            sync_root,
            max_parallel_transfers: DEFAULT_MAX_PARALLEL_TRANSFERS,
            max_batch_items: DEFAULT_MAX_BATCH_ITEMS,
            debug_logging_enabled: false,
            detailed_session_logging_enabled: false,
            quota_used: 0,
            quota_total: 0,
            delta_token: None,
            last_sync: None,
            state: AccountState::Active,
            created_at,
        }
    }

    // --- Getters ---

    /// Returns the account's internal storage identifier
    pub fn id(&self) -> &AccountId {
        &self.id
    }

    /// Returns the account's stable, log-safe hashed identifier
    pub fn hashed_id(&self) -> &HashedAccountId {
        &self.hashed_id
    }

    /// Returns the account's email address
    pub fn email(&self) -> &Email {
        &self.email
    }

    /// Returns the configured maximum concurrent transfers (1..10)
    pub fn max_parallel_transfers(&self) -> u32 {
        self.max_parallel_transfers
    }

    /// Returns the configured maximum batch size for delta/reconcile passes (1..100)
    pub fn max_batch_items(&self) -> u32 {
        self.max_batch_items
    }

    /// Returns whether debug log entries are recorded for this account
    pub fn debug_logging_enabled(&self) -> bool {
        self.debug_logging_enabled
    }

    /// Returns whether a SessionLog row is recorded per sync run
    pub fn detailed_session_logging_enabled(&self) -> bool {
        self.detailed_session_logging_enabled
    }

    /// Sets the maximum concurrent transfers, clamped to the valid 1..10 range
    pub fn set_max_parallel_transfers(&mut self, value: u32) {
        self.max_parallel_transfers = value.clamp(1, 10);
    }

    /// Sets the maximum batch size, clamped to the valid 1..100 range
    pub fn set_max_batch_items(&mut self, value: u32) {
        self.max_batch_items = value.clamp(1, 100);
    }

    /// Enables or disables per-item debug logging
    pub fn set_debug_logging_enabled(&mut self, enabled: bool) {
        self.debug_logging_enabled = enabled;
    }

    /// Enables or disables per-session summary logging
    pub fn set_detailed_session_logging_enabled(&mut self, enabled: bool) {
        self.detailed_session_logging_enabled = enabled;
    }

    /// Returns the account's display name
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Returns the OneDrive drive ID
    pub fn onedrive_id(&self) -> &str {
        &self.onedrive_id
    }

    /// Returns the sync root path
    pub fn sync_root(&self) -> &SyncPath {
        &self.sync_root
    }

    /// Returns bytes used in storage
    pub fn quota_used(&self) -> u64 {
        self.quota_used
    }

    /// Returns total bytes available
    pub fn quota_total(&self) -> u64 {
        self.quota_total
    }

    /// Returns the current delta token if any
    pub fn delta_token(&self) -> Option<&DeltaToken> {
        self.delta_token.as_ref()
    }

    /// Returns the last sync timestamp if any
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }

    /// Returns the current account state
    pub fn state(&self) -> &AccountState {
        &self.state
    }

    /// Returns when the account was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // --- T033: Methods ---

    /// T033: Calculates the percentage of quota used
    ///
    /// # Returns
    /// - Percentage as f64 between 0.0 and 100.0
    /// - Returns 0.0 if quota_total is 0 to avoid division by zero
    pub fn quota_percent(&self) -> f64 {
        if self.quota_total == 0 {
            return 0.0;
        }
        (self.quota_used as f64 / self.quota_total as f64) * 100.0
    }

    // --- Setters / State Mutations ---

    /// Updates the quota information
    pub fn update_quota(&mut self, used: u64, total: u64) {
        self.quota_used = used;
        self.quota_total = total;
    }

    /// Updates the delta token after a successful sync
    pub fn update_delta_token(&mut self, token: DeltaToken) {
        self.delta_token = Some(token);
    }

    /// Clears the delta token (forces full resync)
    pub fn clear_delta_token(&mut self) {
        self.delta_token = None;
    }

    /// Records a successful sync
    pub fn record_sync(&mut self, timestamp: DateTime<Utc>) {
        self.last_sync = Some(timestamp);
    }

    /// Updates the account state
    pub fn set_state(&mut self, state: AccountState) {
        self.state = state;
    }

    /// Marks the account as active
    pub fn activate(&mut self) {
        self.state = AccountState::Active;
    }

    /// Marks the token as expired
    pub fn mark_token_expired(&mut self) {
        self.state = AccountState::TokenExpired;
    }

    /// Marks the account as suspended
    pub fn suspend(&mut self) {
        self.state = AccountState::Suspended;
    }

    /// Marks the account with an error
    pub fn mark_error(&mut self, reason: impl Into<String>) {
        self.state = AccountState::Error(reason.into());
    }

    /// Updates the sync root path
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the new path is not absolute
    pub fn update_sync_root(&mut self, path: SyncPath) -> Result<(), DomainError> {
        self.sync_root = path;
        Ok(())
    }

    /// Returns true if the account can perform sync operations
    pub fn can_sync(&self) -> bool {
        self.state.can_sync()
    }
}
