// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::header_traversal::HeaderTraversal;
use super::{SyncError, SyncResult};
use crate::config::{ChainConfig, SyncerConfig};
use crate::eth_client::{ChainClient, LogQuery};
use crate::metrics::CallerMetrics;
use crate::retry::{self, RetryError};
use crate::storage::{store_batch, Store};
use crate::types::{BlockHeader, ContractEvent};
use ethers::types::H256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the next tick works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    // Handed out by the traversal but not committed yet.
    PendingBatch(Vec<BlockHeader>),
}

pub struct Synchronizer<C: ?Sized> {
    chain_name: String,
    client: Arc<C>,
    store: Arc<dyn Store>,
    traversal: HeaderTraversal<C>,
    config: SyncerConfig,
    block_step: u64,
    interval: Duration,
    state: SyncState,
    mismatch_count: u32,
    shutdown: CancellationToken,
    metrics: Option<Arc<CallerMetrics>>,
}

impl<C> Synchronizer<C>
where
    C: ChainClient + ?Sized + 'static,
{
    /// Resume from the latest stored header, else from
    /// `chain.starting_height`, else from genesis.
    ///
    /// `shutdown` is cancelled when the loop hits a divergence it cannot
    /// resolve, and cancelling it stops the loop.
    pub async fn new(
        client: Arc<C>,
        store: Arc<dyn Store>,
        chain: &ChainConfig,
        config: SyncerConfig,
        shutdown: CancellationToken,
    ) -> SyncResult<Self> {
        let traversal = match store.latest_block_header().await? {
            Some(header) => {
                info!(
                    "[{}] Resuming after stored header {} {:?}",
                    chain.chain_name, header.number, header.hash
                );
                HeaderTraversal::new(
                    client.clone(),
                    &chain.chain_name,
                    Some(header),
                    chain.confirmation_depth,
                )
            }
            None => {
                let start = chain.starting_height.unwrap_or_default();
                info!(
                    "[{}] No stored header, starting at height {}",
                    chain.chain_name, start
                );
                HeaderTraversal::starting_at(
                    client.clone(),
                    &chain.chain_name,
                    start,
                    chain.confirmation_depth,
                )
            }
        };
        Ok(Self {
            chain_name: chain.chain_name.clone(),
            client,
            store,
            traversal,
            config,
            block_step: chain.block_step,
            interval: chain.main_loop_interval,
            state: SyncState::Idle,
            mismatch_count: 0,
            shutdown,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<CallerMetrics>) -> Self {
        self.traversal = self.traversal.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn traversal(&self) -> &HeaderTraversal<C> {
        &self.traversal
    }

    /// Run the polling loop on its own task.
    pub fn start(self) -> SynchronizerHandle {
        let stop = self.shutdown.child_token();
        let handle = tokio::spawn(self.run(stop.clone()));
        SynchronizerHandle { stop, handle }
    }

    async fn run(mut self, stop: CancellationToken) -> SyncResult<()> {
        info!("[{}] Starting synchronizer", self.chain_name);
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("[{}] Synchronizer stopped", self.chain_name);
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            // In-flight RPC and persistence calls are dropped on stop.
            let result = tokio::select! {
                _ = stop.cancelled() => Err(SyncError::Cancelled),
                result = self.tick(&stop) => result,
            };
            match result {
                Ok(()) => {}
                Err(SyncError::Cancelled) => {
                    info!("[{}] Synchronizer stopped mid-iteration", self.chain_name);
                    return Ok(());
                }
                Err(e) if self.should_escalate(&e) => {
                    error!(
                        "[{}] Synchronizer diverged from provider, shutting down: {}",
                        self.chain_name, e
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.sync_divergence_errors.inc();
                    }
                    self.shutdown.cancel();
                    return Err(e);
                }
                Err(e) => {
                    if let (SyncError::Client(client_err), Some(metrics)) = (&e, &self.metrics) {
                        metrics
                            .eth_rpc_errors
                            .with_label_values(&[client_err.error_type()])
                            .inc();
                    }
                    warn!(
                        "[{}] Sync iteration failed, retrying next tick: {}",
                        self.chain_name, e
                    );
                }
            }
        }
    }

    /// `mismatch_count` already includes `err`, so `max_mismatch_retries`
    /// mismatches are retried before the next one escalates.
    fn should_escalate(&self, err: &SyncError) -> bool {
        err.is_fatal()
            || (matches!(err, SyncError::ToHeaderMismatch { .. })
                && self.mismatch_count > self.config.max_mismatch_retries)
    }

    /// One iteration: retry the pending batch or fetch the next one, then
    /// process it. A batch that fails stays pending.
    async fn tick(&mut self, stop: &CancellationToken) -> SyncResult<()> {
        let headers = match std::mem::replace(&mut self.state, SyncState::Idle) {
            SyncState::PendingBatch(headers) => {
                debug!(
                    "[{}] Retrying pending batch of {} headers",
                    self.chain_name,
                    headers.len()
                );
                headers
            }
            SyncState::Idle => {
                let headers = self.traversal.next_headers(self.block_step).await?;
                if headers.is_empty() {
                    debug!("[{}] No new confirmed headers, at head", self.chain_name);
                    return Ok(());
                }
                headers
            }
        };

        match self.process_batch(&headers, stop).await {
            Ok(()) => {
                self.mismatch_count = 0;
                Ok(())
            }
            Err(e) => {
                if matches!(e, SyncError::ToHeaderMismatch { .. }) {
                    self.mismatch_count += 1;
                }
                self.state = SyncState::PendingBatch(headers);
                Err(e)
            }
        }
    }

    async fn process_batch(
        &self,
        headers: &[BlockHeader],
        stop: &CancellationToken,
    ) -> SyncResult<()> {
        let (Some(first), Some(last)) = (headers.first(), headers.last()) else {
            return Ok(());
        };
        let header_map: HashMap<H256, &BlockHeader> =
            headers.iter().map(|header| (header.hash, header)).collect();

        // Read per batch. Contracts created inside this batch must already be
        // part of its log filter.
        let addresses = self.store.watch_addresses().await?;
        let batch = self
            .client
            .filter_logs(&LogQuery {
                addresses,
                from_block: first.number,
                to_block: last.number,
            })
            .await?;
        if batch.to_header.number != last.number || batch.to_header.hash != last.hash {
            return Err(SyncError::ToHeaderMismatch {
                expected_number: last.number,
                expected_hash: last.hash,
                found_number: batch.to_header.number,
                found_hash: batch.to_header.hash,
            });
        }

        let events = batch
            .logs
            .iter()
            .filter_map(|log| {
                let header = log.block_hash.and_then(|hash| header_map.get(&hash));
                if header.is_none() {
                    warn!(
                        "[{}] Skipping log {:?}/{:?} from block {:?} outside the batch",
                        self.chain_name, log.transaction_hash, log.log_index, log.block_hash
                    );
                }
                header.map(|header| ContractEvent::from_log(log, header.timestamp))
            })
            .collect::<Vec<_>>();

        let store = self.store.as_ref();
        let events_ref = &events;
        let strategy = self.config.persist_strategy();
        retry::execute(stop, self.config.persist_max_attempts, &strategy, move || {
            store_batch(store, headers, events_ref)
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled => SyncError::Cancelled,
            other => {
                if let Some(metrics) = &self.metrics {
                    metrics.persist_failures.inc();
                }
                SyncError::Persistence(other.to_string())
            }
        })?;

        if let Some(metrics) = &self.metrics {
            metrics.persisted_headers.inc_by(headers.len() as u64);
            metrics.persisted_events.inc_by(events.len() as u64);
        }
        info!(
            "[{}] Persisted headers {}..={} with {} events",
            self.chain_name,
            first.number,
            last.number,
            events.len()
        );
        Ok(())
    }
}

/// Running synchronizer loop.
pub struct SynchronizerHandle {
    stop: CancellationToken,
    handle: JoinHandle<SyncResult<()>>,
}

impl SynchronizerHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn close(self) -> SyncResult<()> {
        self.stop.cancel();
        self.join().await
    }

    /// Wait for the loop to exit on its own, after shutdown or escalation.
    pub async fn join(self) -> SyncResult<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(SyncError::Cancelled),
        }
    }
}
