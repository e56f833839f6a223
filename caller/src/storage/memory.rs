// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{StorageResult, Store, StoreTransaction};
use crate::types::{BlockHeader, ContractEvent};
use async_trait::async_trait;
use ethers::types::{Address as EthAddress, H256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    headers: HashMap<H256, BlockHeader>,
    latest: Option<BlockHeader>,
    events: Vec<ContractEvent>,
    #[serde(skip)]
    event_keys: BTreeSet<(H256, u64)>,
    watch_addresses: BTreeSet<EthAddress>,
}

impl StoreState {
    fn apply(&mut self, headers: Vec<BlockHeader>, events: Vec<ContractEvent>) {
        for header in headers {
            if self
                .latest
                .as_ref()
                .map_or(true, |latest| header.number >= latest.number)
            {
                self.latest = Some(header.clone());
            }
            self.headers.insert(header.hash, header);
        }
        for event in events {
            if self.event_keys.insert(event.key()) {
                self.events.push(event);
            }
        }
    }

    fn rebuild_indexes(&mut self) {
        self.event_keys = self.events.iter().map(ContractEvent::key).collect();
    }
}

/// Process local [`Store`].
///
/// With a snapshot path every commit rewrites the snapshot file (temp file
/// plus rename) before it becomes visible, so a restart resumes from the
/// last committed header.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path` if it exists, and persist every later commit to it.
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mut state: StoreState = serde_json::from_slice(&bytes)?;
                state.rebuild_indexes();
                info!(
                    "Loaded store snapshot {} (latest header: {:?})",
                    path.display(),
                    state.latest.as_ref().map(|h| h.number)
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            snapshot_path: Some(path),
        })
    }

    pub async fn add_watch_address(&self, address: EthAddress) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        if !next.watch_addresses.insert(address) {
            return Ok(());
        }
        self.write_snapshot(&next).await?;
        *state = next;
        Ok(())
    }

    pub async fn block_headers(&self) -> Vec<BlockHeader> {
        let mut headers: Vec<_> = self.state.read().await.headers.values().cloned().collect();
        headers.sort_by_key(|h| h.number);
        headers
    }

    pub async fn contract_events(&self) -> Vec<ContractEvent> {
        self.state.read().await.events.clone()
    }

    async fn commit(&self, headers: Vec<BlockHeader>, events: Vec<ContractEvent>) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.apply(headers, events);
        self.write_snapshot(&next).await?;
        *state = next;
        Ok(())
    }

    async fn write_snapshot(&self, state: &StoreState) -> StorageResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(state)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Wrote store snapshot {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn latest_block_header(&self) -> StorageResult<Option<BlockHeader>> {
        Ok(self.state.read().await.latest.clone())
    }

    async fn watch_addresses(&self) -> StorageResult<Vec<EthAddress>> {
        Ok(self
            .state
            .read()
            .await
            .watch_addresses
            .iter()
            .copied()
            .collect())
    }

    async fn begin(&self) -> StorageResult<Box<dyn StoreTransaction + '_>> {
        Ok(Box::new(MemoryTransaction {
            store: self,
            headers: Vec::new(),
            events: Vec::new(),
        }))
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    headers: Vec<BlockHeader>,
    events: Vec<ContractEvent>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction<'_> {
    async fn store_block_headers(&mut self, headers: &[BlockHeader]) -> StorageResult<()> {
        self.headers.extend_from_slice(headers);
        Ok(())
    }

    async fn store_contract_events(&mut self, events: &[ContractEvent]) -> StorageResult<()> {
        self.events.extend_from_slice(events);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let MemoryTransaction {
            store,
            headers,
            events,
        } = *self;
        store.commit(headers, events).await
    }
}
