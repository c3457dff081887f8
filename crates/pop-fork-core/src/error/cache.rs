// SPDX-License-Identifier: GPL-3.0

//! Cache-related error types.

use super::ErrorKind;
use thiserror::Error;

/// Errors that can occur when interacting with the storage cache.
#[derive(Debug, Error)]
pub enum CacheError {
	/// A thread panicked while holding the cache lock.
	#[error("Cache lock poisoned: {0}")]
	Lock(String),
	/// Duplicated keys used
	#[error("Duplicated keys")]
	DuplicatedKeys,
}

impl CacheError {
	/// Classify this error.
	pub fn kind(&self) -> ErrorKind {
		match self {
			CacheError::Lock(_) => ErrorKind::Internal,
			CacheError::DuplicatedKeys => ErrorKind::InvariantViolation,
		}
	}
}
