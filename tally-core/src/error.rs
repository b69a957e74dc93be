// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Error types for the counting pipeline

use crate::resilience::{ResilienceError, Transient};
use std::time::Duration;
use thiserror::Error;

/// Result type for storage calls
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for pipeline operations
pub type TallyResult<T> = Result<T, TallyError>;

/// Errors raised by a backing store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Timeout, connection reset or similar; safe to retry
    #[error("Transient storage error: {0}")]
    Transient(String),

    /// Backend refused the call outright
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Constraint violation or conflicting concurrent write
    #[error("Storage conflict: {0}")]
    Conflict(String),

    /// Anything else reported by the backend
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_) | StorageError::Unavailable(_))
    }
}

/// Errors surfaced by queries and admin operations
#[derive(Debug, Error)]
pub enum TallyError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Resilience(#[from] ResilienceError<StorageError>),

    /// An admin transaction step exceeded its ceiling
    #[error("Admin operation timed out after {0:?}")]
    AdminTimeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TallyError {
    /// True when the failure came from an open circuit rather than the store.
    pub fn is_circuit_open(&self) -> bool {
        matches!(
            self,
            TallyError::Resilience(ResilienceError::CircuitOpen { .. })
        )
    }
}
