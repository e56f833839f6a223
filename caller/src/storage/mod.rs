// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Storage boundary used by the synchronizer.
//!
//! A [`Store`] answers the resume and watch-list queries and opens
//! [`StoreTransaction`]s. Writes staged in a transaction become visible only
//! when it is committed; dropping it discards them.

use crate::types::{BlockHeader, ContractEvent};
use async_trait::async_trait;
use ethers::types::Address as EthAddress;

pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Highest stored header, if any.
    async fn latest_block_header(&self) -> StorageResult<Option<BlockHeader>>;

    /// Contracts whose logs must be collected. May grow between calls.
    async fn watch_addresses(&self) -> StorageResult<Vec<EthAddress>>;

    async fn begin(&self) -> StorageResult<Box<dyn StoreTransaction + '_>>;
}

#[async_trait]
pub trait StoreTransaction: Send {
    /// Idempotent on the header hash.
    async fn store_block_headers(&mut self, headers: &[BlockHeader]) -> StorageResult<()>;

    /// Idempotent on `(block_hash, log_index)`.
    async fn store_contract_events(&mut self, events: &[ContractEvent]) -> StorageResult<()>;

    async fn commit(self: Box<Self>) -> StorageResult<()>;
}

/// Store headers and events in one transaction.
pub async fn store_batch(
    store: &dyn Store,
    headers: &[BlockHeader],
    events: &[ContractEvent],
) -> StorageResult<()> {
    let mut tx = store.begin().await?;
    tx.store_block_headers(headers).await?;
    tx.store_contract_events(events).await?;
    tx.commit().await
}
