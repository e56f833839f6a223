// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::config::ChainConfig;
use crate::error::{CallerError, CallerResult};
use crate::metered_eth_provider::{new_metered_eth_provider, MeteredEthHttpProvider, RequestLimits};
use crate::metrics::CallerMetrics;
use crate::retry;
use crate::txmgr::ReceiptSource;
use crate::types::{BlockHeader, LogBatch};
use async_trait::async_trait;
use ethers::providers::{JsonRpcClient, Middleware, Provider};
use ethers::types::{Address as EthAddress, BlockNumber, Bytes, Filter, TransactionReceipt, H256};
use futures::{StreamExt, TryStreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tap::TapFallible;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const DIAL_ATTEMPTS: usize = 5;

/// Log query over an inclusive block range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub addresses: Vec<EthAddress>,
    pub from_block: u64,
    pub to_block: u64,
}

/// Read access to the chain used by the header traversal and synchronizer.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// `None` asks for the latest header.
    async fn header_by_number(&self, number: Option<u64>) -> CallerResult<Option<BlockHeader>>;

    /// Headers `from..=to` in order. May be shorter than requested when the
    /// provider does not have the tail yet, but never has gaps.
    async fn headers_by_range(&self, from: u64, to: u64) -> CallerResult<Vec<BlockHeader>>;

    /// Logs matching `query` plus the header of `query.to_block` as seen by
    /// the same provider.
    async fn filter_logs(&self, query: &LogQuery) -> CallerResult<LogBatch>;
}

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    pub header_chunk_size: u64,
    pub max_concurrent_chunks: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(100),
            header_chunk_size: 100,
            max_concurrent_chunks: 4,
        }
    }
}

impl From<&ChainConfig> for ClientOptions {
    fn from(config: &ChainConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            header_chunk_size: config.header_fetch_chunk_size.max(1),
            max_concurrent_chunks: config.max_concurrent_requests.max(1),
        }
    }
}

pub struct EthClient<P> {
    provider: Provider<P>,
    chain_name: String,
    options: ClientOptions,
}

impl EthClient<MeteredEthHttpProvider> {
    /// Connect to `config.rpc_url`, retrying the first `eth_chainId` call.
    pub async fn dial(
        config: &ChainConfig,
        metrics: Arc<CallerMetrics>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Self> {
        let limits = RequestLimits {
            max_concurrent_requests: config.max_concurrent_requests,
            min_request_delay: config.min_request_delay,
        };
        let provider = new_metered_eth_provider(&config.rpc_url, metrics, limits, cancel.clone())?;
        let client = Self::new(provider, &config.chain_name, ClientOptions::from(config));

        let chain_id =
            retry::execute(cancel, DIAL_ATTEMPTS, &retry::exponential(), || client.chain_id())
                .await?;
        if let Some(configured) = config.chain_id {
            if configured != chain_id {
                return Err(CallerError::ChainIdMismatch {
                    configured,
                    actual: chain_id,
                }
                .into());
            }
        }
        info!(
            "[{}] Connected to {} (chain id {})",
            config.chain_name, config.rpc_url, chain_id
        );
        Ok(client)
    }
}

impl<P> EthClient<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(provider: Provider<P>, chain_name: &str, options: ClientOptions) -> Self {
        Self {
            provider,
            chain_name: chain_name.to_string(),
            options,
        }
    }

    pub fn provider(&self) -> &Provider<P> {
        &self.provider
    }

    pub fn chain_name(&self) -> &str {
        &self.chain_name
    }

    pub(crate) async fn call<T, F>(&self, fut: F) -> CallerResult<T>
    where
        F: Future<Output = Result<T, ethers::providers::ProviderError>>,
    {
        match tokio::time::timeout(self.options.request_timeout, fut).await {
            Ok(result) => result.map_err(CallerError::from),
            Err(_) => Err(CallerError::Timeout(self.options.request_timeout)),
        }
    }

    pub async fn chain_id(&self) -> CallerResult<u64> {
        Ok(self.call(self.provider.get_chainid()).await?.as_u64())
    }

    pub async fn send_raw_transaction(&self, raw: Bytes) -> CallerResult<H256> {
        let pending = self
            .call(self.provider.send_raw_transaction(raw))
            .await
            .tap_err(|e| error!("[{}] send_raw_transaction failed: {}", self.chain_name, e))?;
        Ok(pending.tx_hash())
    }

    async fn fetch_header(&self, number: BlockNumber) -> CallerResult<Option<BlockHeader>> {
        self.call(self.provider.get_block(number))
            .await?
            .as_ref()
            .map(BlockHeader::try_from)
            .transpose()
    }

    async fn fetch_chunk(&self, from: u64, to: u64) -> CallerResult<Vec<Option<BlockHeader>>> {
        futures::future::try_join_all(
            (from..=to).map(|n| self.fetch_header(BlockNumber::Number(n.into()))),
        )
        .await
    }
}

/// Keep the leading run of present headers and check it is hash linked.
fn contiguous_prefix(
    from: u64,
    fetched: impl IntoIterator<Item = Option<BlockHeader>>,
) -> CallerResult<Vec<BlockHeader>> {
    let mut headers: Vec<BlockHeader> = Vec::new();
    for (offset, header) in fetched.into_iter().enumerate() {
        let Some(header) = header else { break };
        let expected = from + offset as u64;
        if header.number != expected {
            return Err(CallerError::InvalidResponse(format!(
                "expected header {} but got {}",
                expected, header.number
            )));
        }
        if let Some(parent) = headers.last() {
            if header.parent_hash != parent.hash {
                return Err(CallerError::InvalidResponse(format!(
                    "header {} does not follow parent {}",
                    header.number, parent.number
                )));
            }
        }
        headers.push(header);
    }
    Ok(headers)
}

#[async_trait]
impl<P> ChainClient for EthClient<P>
where
    P: JsonRpcClient + 'static,
{
    async fn header_by_number(&self, number: Option<u64>) -> CallerResult<Option<BlockHeader>> {
        let number = match number {
            Some(n) => BlockNumber::Number(n.into()),
            None => BlockNumber::Latest,
        };
        self.fetch_header(number).await
    }

    async fn headers_by_range(&self, from: u64, to: u64) -> CallerResult<Vec<BlockHeader>> {
        if from > to {
            return Err(CallerError::InvalidInput(format!(
                "invalid header range {}..={}",
                from, to
            )));
        }
        let chunk = self.options.header_chunk_size;
        let chunks = (from..=to)
            .step_by(chunk as usize)
            .map(move |start| (start, start.saturating_add(chunk - 1).min(to)));
        let fetched: Vec<Vec<Option<BlockHeader>>> = futures::stream::iter(chunks)
            .map(|(start, end)| self.fetch_chunk(start, end))
            .buffered(self.options.max_concurrent_chunks)
            .try_collect()
            .await
            .tap_err(|e| {
                error!(
                    "[{}] headers_by_range {}..={} failed: {}",
                    self.chain_name, from, to, e
                )
            })?;
        contiguous_prefix(from, fetched.into_iter().flatten())
    }

    async fn filter_logs(&self, query: &LogQuery) -> CallerResult<LogBatch> {
        let to_header = async {
            self.fetch_header(BlockNumber::Number(query.to_block.into()))
                .await?
                .ok_or(CallerError::HeaderNotFound(query.to_block))
        };
        if query.addresses.is_empty() {
            return Ok(LogBatch {
                logs: Vec::new(),
                to_header: to_header.await?,
            });
        }

        let filter = Filter::new()
            .from_block(query.from_block)
            .to_block(query.to_block)
            .address(query.addresses.clone());
        let logs = async {
            self.call(self.provider.get_logs(&filter))
                .await
                .tap_err(|e| {
                    error!(
                        "[{}] filter_logs failed. Filter: {:?}. Error {:?}",
                        self.chain_name, filter, e
                    )
                })
        };
        let (logs, to_header) = tokio::try_join!(logs, to_header)?;

        if let Some(stray) = logs.iter().find(|log| !query.addresses.contains(&log.address)) {
            return Err(CallerError::ProviderError(format!(
                "Provider returned a log from unrequested contract {:?}",
                stray.address
            )));
        }
        Ok(LogBatch { logs, to_header })
    }
}

#[async_trait]
impl<P> ReceiptSource for EthClient<P>
where
    P: JsonRpcClient + 'static,
{
    async fn block_number(&self) -> CallerResult<u64> {
        Ok(self.call(self.provider.get_block_number()).await?.as_u64())
    }

    async fn transaction_receipt(&self, hash: H256) -> CallerResult<Option<TransactionReceipt>> {
        self.call(self.provider.get_transaction_receipt(hash)).await
    }
}
