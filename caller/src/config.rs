// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::retry::ExponentialStrategy;
use crate::txmgr::TxManagerConfig;
use anyhow::{anyhow, Context};
use contract_caller_config::Config;
use ethers::signers::LocalWallet;
use ethers::types::Address as EthAddress;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::path::PathBuf;
use std::time::Duration;

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    // Used as a log prefix.
    #[serde(default = "default_chain_name")]
    pub chain_name: String,
    // Rpc url of the Eth fullnode.
    pub rpc_url: String,
    // When set, the provider must report this chain id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    // Header to resume after when storage holds no header yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_height: Option<u64>,
    // Blocks kept between the head and the newest header handed out.
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,
    // Maximum number of headers per synchronizer batch.
    #[serde(default = "default_block_step")]
    pub block_step: u64,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "main-loop-interval-ms", default = "default_main_loop_interval")]
    pub main_loop_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "request-timeout-secs", default = "default_request_timeout")]
    pub request_timeout: Duration,
    // Headers fetched per concurrent sub-range request.
    #[serde(default = "default_header_fetch_chunk_size")]
    pub header_fetch_chunk_size: u64,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "min-request-delay-ms", default)]
    pub min_request_delay: Duration,
}

fn default_chain_name() -> String {
    "eth".to_string()
}

fn default_confirmation_depth() -> u64 {
    64
}

fn default_block_step() -> u64 {
    500
}

fn default_main_loop_interval() -> Duration {
    Duration::from_millis(5000)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(100)
}

fn default_header_fetch_chunk_size() -> u64 {
    100
}

fn default_max_concurrent_requests() -> usize {
    8
}

impl ChainConfig {
    pub fn new(rpc_url: &str) -> Self {
        Self {
            chain_name: default_chain_name(),
            rpc_url: rpc_url.to_string(),
            chain_id: None,
            starting_height: None,
            confirmation_depth: default_confirmation_depth(),
            block_step: default_block_step(),
            main_loop_interval: default_main_loop_interval(),
            request_timeout: default_request_timeout(),
            header_fetch_chunk_size: default_header_fetch_chunk_size(),
            max_concurrent_requests: default_max_concurrent_requests(),
            min_request_delay: Duration::ZERO,
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncerConfig {
    // Attempts for one storage transaction before the batch is left pending.
    #[serde(default = "default_persist_max_attempts")]
    pub persist_max_attempts: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "persist-min-backoff-ms", default = "default_persist_min_backoff")]
    pub persist_min_backoff: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "persist-max-backoff-ms", default = "default_persist_max_backoff")]
    pub persist_max_backoff: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "persist-max-jitter-ms", default = "default_persist_max_jitter")]
    pub persist_max_jitter: Duration,
    // To-header mismatches retried on one batch; the next one escalates.
    #[serde(default = "default_max_mismatch_retries")]
    pub max_mismatch_retries: u32,
}

fn default_persist_max_attempts() -> usize {
    10
}

fn default_persist_min_backoff() -> Duration {
    Duration::from_millis(1000)
}

fn default_persist_max_backoff() -> Duration {
    Duration::from_millis(20_000)
}

fn default_persist_max_jitter() -> Duration {
    Duration::from_millis(250)
}

fn default_max_mismatch_retries() -> u32 {
    3
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            persist_max_attempts: default_persist_max_attempts(),
            persist_min_backoff: default_persist_min_backoff(),
            persist_max_backoff: default_persist_max_backoff(),
            persist_max_jitter: default_persist_max_jitter(),
            max_mismatch_retries: default_max_mismatch_retries(),
        }
    }
}

impl SyncerConfig {
    pub fn persist_strategy(&self) -> ExponentialStrategy {
        ExponentialStrategy::new(
            self.persist_min_backoff,
            self.persist_max_backoff,
            self.persist_max_jitter,
        )
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    // Snapshot file used to resume after a restart. In-memory only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
    // Contracts watched from the first batch on. More can be added at runtime.
    #[serde(default)]
    pub watch_addresses: Vec<EthAddress>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CallerNodeConfig {
    pub chain: ChainConfig,
    #[serde(default)]
    pub syncer: SyncerConfig,
    #[serde(default)]
    pub txmgr: TxManagerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    // Hex encoded secp256k1 key, only needed to submit transactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_metrics_port() -> u16 {
    9184
}

impl Config for CallerNodeConfig {}

impl CallerNodeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chain.rpc_url.is_empty() {
            return Err(anyhow!("chain.rpc-url must be set"));
        }
        if self.chain.block_step == 0 {
            return Err(anyhow!("chain.block-step must be greater than 0"));
        }
        if self.chain.header_fetch_chunk_size == 0 {
            return Err(anyhow!("chain.header-fetch-chunk-size must be greater than 0"));
        }
        if self.syncer.persist_max_attempts == 0 {
            return Err(anyhow!("syncer.persist-max-attempts must be greater than 0"));
        }
        self.txmgr.validate()?;
        Ok(())
    }

    pub fn wallet(&self) -> anyhow::Result<LocalWallet> {
        let key = self
            .private_key
            .as_deref()
            .ok_or_else(|| anyhow!("private-key is required to submit transactions"))?;
        let wallet = key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .context("Invalid private-key")?;
        Ok(match self.chain.chain_id {
            Some(chain_id) => ethers::signers::Signer::with_chain_id(wallet, chain_id),
            None => wallet,
        })
    }
}
