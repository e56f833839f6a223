// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transaction submission with fee bumping.
//!
//! [`TxManager::send`] publishes a freshly priced variant of one logical
//! transaction every `resubmission_timeout` until one of them reaches
//! `num_confirmations`. Attempts run as concurrent tasks that share a
//! [`SendState`] and hand their receipt to the caller through a single slot
//! channel, so only the first confirmed receipt is ever returned.

use crate::error::CallerResult;
use crate::metrics::CallerMetrics;
use crate::types::TxCandidate;
use async_trait::async_trait;
use ethers::types::{TransactionReceipt, H256, U256};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod send_state;

pub use send_state::{is_nonce_too_low, SendState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TxManagerError {
    #[error("num confirmations must not be 0")]
    ZeroConfirmations,

    #[error("safe abort nonce too low count must not be 0")]
    ZeroAbortThreshold,

    #[error("send cancelled")]
    Cancelled,

    #[error("unable to update gas price: {0}")]
    GasPricing(String),

    #[error("aborted after repeated nonce too low errors: {0}")]
    NonceTooLowAbort(String),
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TxManagerConfig {
    // Time to wait before publishing a re-priced variant.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "resubmission-timeout-ms", default = "default_resubmission_timeout")]
    pub resubmission_timeout: Duration,
    // Polling interval for receipts and the chain tip.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "receipt-query-interval-ms", default = "default_receipt_query_interval")]
    pub receipt_query_interval: Duration,
    // Blocks, including the inclusion block, before a receipt is returned.
    #[serde(default = "default_num_confirmations")]
    pub num_confirmations: u64,
    // Nonce too low errors tolerated before giving up when nothing is mined.
    #[serde(default = "default_safe_abort_nonce_too_low_count")]
    pub safe_abort_nonce_too_low_count: u64,
}

fn default_resubmission_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_receipt_query_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_num_confirmations() -> u64 {
    1
}

fn default_safe_abort_nonce_too_low_count() -> u64 {
    3
}

impl Default for TxManagerConfig {
    fn default() -> Self {
        Self {
            resubmission_timeout: default_resubmission_timeout(),
            receipt_query_interval: default_receipt_query_interval(),
            num_confirmations: default_num_confirmations(),
            safe_abort_nonce_too_low_count: default_safe_abort_nonce_too_low_count(),
        }
    }
}

impl TxManagerConfig {
    pub fn validate(&self) -> Result<(), TxManagerError> {
        if self.num_confirmations == 0 {
            return Err(TxManagerError::ZeroConfirmations);
        }
        if self.safe_abort_nonce_too_low_count == 0 {
            return Err(TxManagerError::ZeroAbortThreshold);
        }
        Ok(())
    }
}

/// Receipt and tip queries needed to wait for confirmations.
#[async_trait]
pub trait ReceiptSource: Send + Sync {
    async fn block_number(&self) -> CallerResult<u64>;

    /// `None` while the transaction is not included.
    async fn transaction_receipt(&self, hash: H256) -> CallerResult<Option<TransactionReceipt>>;
}

/// Caller supplied pricing, signing and publishing of one logical transaction.
#[async_trait]
pub trait TxPublisher: Send + Sync {
    /// Build and sign a variant priced for the current fee market.
    async fn update_gas_price(&self) -> anyhow::Result<TxCandidate>;

    async fn send_transaction(&self, tx: &TxCandidate) -> anyhow::Result<()>;
}

/// Fee cap that absorbs one doubling of the base fee before inclusion.
pub fn calc_gas_fee_cap(base_fee: U256, gas_tip_cap: U256) -> U256 {
    gas_tip_cap.saturating_add(base_fee.saturating_mul(U256::from(2)))
}

pub struct TxManager<B: ?Sized> {
    chain_name: String,
    config: TxManagerConfig,
    backend: Arc<B>,
    metrics: Option<Arc<CallerMetrics>>,
}

impl<B> TxManager<B>
where
    B: ReceiptSource + ?Sized + 'static,
{
    pub fn new(
        chain_name: &str,
        config: TxManagerConfig,
        backend: Arc<B>,
    ) -> Result<Self, TxManagerError> {
        config.validate()?;
        Ok(Self {
            chain_name: chain_name.to_string(),
            config,
            backend,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<CallerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &TxManagerConfig {
        &self.config
    }

    /// Publish variants from `publisher` until one is confirmed.
    ///
    /// Returns the first confirmed receipt, [`TxManagerError::Cancelled`] when
    /// `cancel` fires, or the fatal pricing / nonce condition that stopped the
    /// send. All attempt tasks have finished when this returns.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        publisher: Arc<dyn TxPublisher>,
    ) -> Result<TransactionReceipt, TxManagerError> {
        let ctx = cancel.child_token();
        // Also stops the attempts if this future is dropped mid-send.
        let _cancel_on_drop = ctx.clone().drop_guard();

        let send_state = Arc::new(SendState::new(
            self.config.safe_abort_nonce_too_low_count,
        )?);
        let fatal = Arc::new(OnceLock::new());
        let (receipt_tx, mut receipt_rx) = mpsc::channel(1);
        let mut attempts = JoinSet::new();

        let new_attempt = || Attempt {
            ctx: ctx.clone(),
            chain_name: self.chain_name.clone(),
            config: self.config.clone(),
            publisher: publisher.clone(),
            backend: self.backend.clone(),
            send_state: send_state.clone(),
            receipt_tx: receipt_tx.clone(),
            fatal: fatal.clone(),
            metrics: self.metrics.clone(),
        };
        attempts.spawn(new_attempt().run());

        let period = self.config.resubmission_timeout;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                biased;
                Some(receipt) = receipt_rx.recv() => break Ok(receipt),
                _ = ctx.cancelled() => {
                    break Err(fatal.get().cloned().unwrap_or(TxManagerError::Cancelled));
                }
                _ = ticker.tick() => {
                    reap_finished(&self.chain_name, &mut attempts);
                    if send_state.is_waiting_for_confirmation() {
                        debug!(
                            "[{}] A variant is mined, skipping resubmission",
                            self.chain_name
                        );
                        continue;
                    }
                    attempts.spawn(new_attempt().run());
                }
            }
        };

        ctx.cancel();
        while attempts.join_next().await.is_some() {}

        if let (Ok(receipt), Some(metrics)) = (&result, &self.metrics) {
            metrics.tx_confirmed.inc();
            debug!(
                "[{}] Send returned receipt for {:?}",
                self.chain_name, receipt.transaction_hash
            );
        }
        result
    }
}

/// Drop attempts that already returned, so a long send holds only the live
/// ones.
fn reap_finished(chain_name: &str, attempts: &mut JoinSet<()>) -> usize {
    let mut reaped = 0;
    while let Some(joined) = attempts.try_join_next() {
        if let Err(e) = joined {
            warn!("[{}] Send attempt ended abnormally: {}", chain_name, e);
        }
        reaped += 1;
    }
    reaped
}

struct Attempt<B: ?Sized> {
    ctx: CancellationToken,
    chain_name: String,
    config: TxManagerConfig,
    publisher: Arc<dyn TxPublisher>,
    backend: Arc<B>,
    send_state: Arc<SendState>,
    receipt_tx: mpsc::Sender<TransactionReceipt>,
    fatal: Arc<OnceLock<TxManagerError>>,
    metrics: Option<Arc<CallerMetrics>>,
}

impl<B> Attempt<B>
where
    B: ReceiptSource + ?Sized + 'static,
{
    fn abort(&self, err: TxManagerError) {
        let _ = self.fatal.set(err);
        self.ctx.cancel();
    }

    async fn run(self) {
        let Some(priced) = until_cancelled(&self.ctx, self.publisher.update_gas_price()).await
        else {
            return;
        };
        let tx = match priced {
            Ok(tx) => tx,
            Err(e) => {
                if !self.ctx.is_cancelled() {
                    error!("[{}] Unable to update gas price: {:#}", self.chain_name, e);
                    self.abort(TxManagerError::GasPricing(format!("{:#}", e)));
                }
                return;
            }
        };

        info!(
            "[{}] Publishing transaction {:?} nonce={} gas_tip_cap={} gas_fee_cap={}",
            self.chain_name, tx.hash, tx.nonce, tx.gas_tip_cap, tx.gas_fee_cap
        );
        if let Some(metrics) = &self.metrics {
            metrics.tx_attempts.inc();
        }
        let Some(sent) = until_cancelled(&self.ctx, self.publisher.send_transaction(&tx)).await
        else {
            return;
        };
        self.send_state.process_send_error(sent.as_ref().err());
        if let Err(e) = sent {
            if self.ctx.is_cancelled() {
                return;
            }
            warn!(
                "[{}] Unable to publish transaction {:?}: {:#}",
                self.chain_name, tx.hash, e
            );
            if let Some(metrics) = &self.metrics {
                metrics.tx_send_errors.inc();
                if is_nonce_too_low(&e) {
                    metrics.tx_nonce_too_low.inc();
                }
            }
            if self.send_state.should_abort_immediately() {
                error!(
                    "[{}] Aborting send after {} nonce too low errors",
                    self.chain_name,
                    self.send_state.nonce_too_low_count()
                );
                self.abort(TxManagerError::NonceTooLowAbort(e.to_string()));
            }
            return;
        }

        debug!("[{}] Waiting for transaction {:?}", self.chain_name, tx.hash);
        let confirmed = wait_mined_with_state(
            &self.ctx,
            self.backend.as_ref(),
            tx.hash,
            self.config.receipt_query_interval,
            self.config.num_confirmations,
            Some(self.send_state.as_ref()),
        )
        .await;
        if let Ok(receipt) = confirmed {
            // A faster sibling may already have filled the slot.
            let _ = self.receipt_tx.try_send(receipt);
        }
    }
}

async fn until_cancelled<F: Future>(ctx: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        _ = ctx.cancelled() => None,
        output = fut => Some(output),
    }
}

/// Poll `backend` until `tx_hash` has `num_confirmations` confirmations.
///
/// A transaction included at the current tip counts as one confirmation.
/// Query errors are logged and polling continues; only `cancel` ends the wait
/// early.
pub async fn wait_mined<B>(
    cancel: &CancellationToken,
    backend: &B,
    tx_hash: H256,
    query_interval: Duration,
    num_confirmations: u64,
) -> Result<TransactionReceipt, TxManagerError>
where
    B: ReceiptSource + ?Sized,
{
    if num_confirmations == 0 {
        return Err(TxManagerError::ZeroConfirmations);
    }
    wait_mined_with_state(
        cancel,
        backend,
        tx_hash,
        query_interval,
        num_confirmations,
        None,
    )
    .await
}

async fn wait_mined_with_state<B>(
    cancel: &CancellationToken,
    backend: &B,
    tx_hash: H256,
    query_interval: Duration,
    num_confirmations: u64,
    send_state: Option<&SendState>,
) -> Result<TransactionReceipt, TxManagerError>
where
    B: ReceiptSource + ?Sized,
{
    let mut ticker = time::interval_at(Instant::now() + query_interval, query_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let queried = until_cancelled(cancel, backend.transaction_receipt(tx_hash))
            .await
            .ok_or(TxManagerError::Cancelled)?;
        match queried {
            Ok(Some(receipt)) if receipt.block_number.is_some() => {
                if let Some(state) = send_state {
                    state.tx_mined(tx_hash);
                }
                let tx_height = receipt.block_number.unwrap_or_default().as_u64();
                match until_cancelled(cancel, backend.block_number())
                    .await
                    .ok_or(TxManagerError::Cancelled)?
                {
                    Ok(tip_height) => {
                        if tx_height.saturating_add(num_confirmations) <= tip_height + 1 {
                            info!("Transaction {:?} confirmed at block {}", tx_hash, tx_height);
                            return Ok(receipt);
                        }
                        debug!(
                            "Transaction {:?} mined at {}, tip {}, waiting for {} confirmations",
                            tx_hash, tx_height, tip_height, num_confirmations
                        );
                    }
                    Err(e) => error!("Unable to fetch block number: {}", e),
                }
            }
            Ok(_) => {
                if let Some(state) = send_state {
                    state.tx_not_mined(tx_hash);
                }
                debug!("Transaction {:?} not yet mined", tx_hash);
            }
            Err(e) => warn!("Receipt retrieval for {:?} failed: {}", tx_hash, e),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(TxManagerError::Cancelled),
            _ = ticker.tick() => {}
        }
    }
}
