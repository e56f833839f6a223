// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Header traversal and the synchronizer loop that persists headers and
//! contract events for a dynamic set of watched addresses.

use crate::error::CallerError;
use crate::storage::StorageError;
use ethers::types::H256;

pub mod header_traversal;
pub mod synchronizer;

pub use header_traversal::HeaderTraversal;
pub use synchronizer::{SyncState, Synchronizer, SynchronizerHandle};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Client(#[from] CallerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("traversal ahead of provider: last traversed {last}, provider safe end {safe_end}")]
    TraversalAheadOfProvider { last: u64, safe_end: u64 },

    #[error("traversal and provider diverged: expected parent {expected:?}, found {found:?}")]
    TraversalAndProviderMismatchedState { expected: H256, found: H256 },

    #[error(
        "log provider returned to-header {found_number} {found_hash:?}, batch ends at {expected_number} {expected_hash:?}"
    )]
    ToHeaderMismatch {
        expected_number: u64,
        expected_hash: H256,
        found_number: u64,
        found_hash: H256,
    },

    #[error("persisting batch failed: {0}")]
    Persistence(String),

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// The traversal cursor and the provider disagree. Retrying on a timer
    /// only repeats the same comparison.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::TraversalAheadOfProvider { .. }
                | SyncError::TraversalAndProviderMismatchedState { .. }
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
