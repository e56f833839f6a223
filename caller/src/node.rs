// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::chain_syncer::{Synchronizer, SynchronizerHandle};
use crate::config::{CallerNodeConfig, StoreConfig};
use crate::eth_client::EthClient;
use crate::metrics::CallerMetrics;
use crate::storage::MemoryStore;
use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Open the configured snapshot, or an in-memory store, and add the seed
/// watch list to it.
pub async fn open_store(config: &StoreConfig) -> anyhow::Result<MemoryStore> {
    let store = match &config.snapshot_path {
        Some(path) => MemoryStore::open(path)
            .await
            .with_context(|| format!("Failed to open store snapshot {}", path.display()))?,
        None => MemoryStore::new(),
    };
    for address in &config.watch_addresses {
        store.add_watch_address(*address).await?;
    }
    Ok(store)
}

/// Connect to the chain and start the synchronizer.
///
/// The returned handle resolves when `shutdown` is cancelled or the
/// synchronizer escalates a divergence, in which case it also cancels
/// `shutdown`.
pub async fn run_caller_node(
    config: CallerNodeConfig,
    metrics: Arc<CallerMetrics>,
    shutdown: CancellationToken,
) -> anyhow::Result<SynchronizerHandle> {
    config.validate()?;
    let client = Arc::new(EthClient::dial(&config.chain, metrics.clone(), &shutdown).await?);
    let store = Arc::new(open_store(&config.store).await?);

    let synchronizer = Synchronizer::new(
        client,
        store,
        &config.chain,
        config.syncer.clone(),
        shutdown,
    )
    .await?
    .with_metrics(metrics);
    info!(
        "[{}] Synchronizer configured: confirmation depth {}, block step {}, interval {:?}",
        config.chain.chain_name,
        config.chain.confirmation_depth,
        config.chain.block_step,
        config.chain.main_loop_interval
    );
    Ok(synchronizer.start())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use ethers::types::Address as EthAddress;

    #[tokio::test]
    async fn test_open_store_seeds_watch_list() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            snapshot_path: Some(dir.path().join("caller.json")),
            watch_addresses: vec![EthAddress::repeat_byte(1), EthAddress::repeat_byte(2)],
        };
        let store = open_store(&config).await.unwrap();
        assert_eq!(store.watch_addresses().await.unwrap().len(), 2);

        // Seeding again on restart keeps the list as is.
        let store = open_store(&config).await.unwrap();
        assert_eq!(
            store.watch_addresses().await.unwrap(),
            config.watch_addresses
        );
    }
}
