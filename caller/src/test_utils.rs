// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{CallerError, CallerResult};
use crate::eth_client::{ChainClient, LogQuery};
use crate::types::{BlockHeader, LogBatch};
use async_trait::async_trait;
use ethers::types::{Address as EthAddress, Log, H256, U256, U64};
use std::sync::Mutex;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Deterministic hash for header `number` on the fork identified by `seed`.
pub fn header_hash(number: u64, seed: u64) -> H256 {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&seed.to_be_bytes());
    bytes[24..].copy_from_slice(&(number + 1).to_be_bytes());
    H256(bytes)
}

pub fn make_header(number: u64, seed: u64, parent_hash: H256) -> BlockHeader {
    BlockHeader::new(number, header_hash(number, seed), parent_hash, 1_000 + 12 * number)
}

pub fn make_log(address: EthAddress, header: &BlockHeader, log_index: u64) -> Log {
    Log {
        address,
        topics: vec![H256::repeat_byte(0xee)],
        block_hash: Some(header.hash),
        block_number: Some(U64::from(header.number)),
        transaction_hash: Some(H256::from_low_u64_be(header.number * 1_000 + log_index)),
        log_index: Some(U256::from(log_index)),
        ..Default::default()
    }
}

#[derive(Default)]
struct MockChain {
    headers: Vec<BlockHeader>,
    head: u64,
    seed: u64,
    logs: Vec<Log>,
    to_header_override: Option<BlockHeader>,
    fail_latest: bool,
    fail_range: bool,
    fail_logs: bool,
    range_empty: bool,
    log_queries: Vec<LogQuery>,
}

impl MockChain {
    fn extend_to(&mut self, number: u64) {
        while self.headers.len() as u64 <= number {
            let next = self.headers.len() as u64;
            let parent = self.headers.last().map(|h| h.hash).unwrap_or_default();
            self.headers.push(make_header(next, self.seed, parent));
        }
    }
}

/// In-memory canonical chain with switchable failures.
pub struct MockChainClient {
    chain: Mutex<MockChain>,
}

impl MockChainClient {
    /// Chain of `len` headers with the head at `len - 1`.
    pub fn new(len: u64) -> Self {
        let mut chain = MockChain::default();
        chain.extend_to(len.saturating_sub(1));
        chain.head = len.saturating_sub(1);
        Self {
            chain: Mutex::new(chain),
        }
    }

    pub fn header(&self, number: u64) -> BlockHeader {
        self.chain.lock().unwrap().headers[number as usize].clone()
    }

    /// Move the reported head, growing the chain when needed.
    pub fn set_head(&self, number: u64) {
        let mut chain = self.chain.lock().unwrap();
        chain.extend_to(number);
        chain.head = number;
    }

    /// Replace every header from `number` on with a fork built from `seed`.
    pub fn reorg_from(&self, number: u64, seed: u64) {
        let mut chain = self.chain.lock().unwrap();
        let len = chain.headers.len() as u64;
        chain.headers.truncate(number as usize);
        chain.seed = seed;
        chain.extend_to(len - 1);
    }

    pub fn add_log(&self, log: Log) {
        self.chain.lock().unwrap().logs.push(log);
    }

    pub fn set_to_header_override(&self, header: Option<BlockHeader>) {
        self.chain.lock().unwrap().to_header_override = header;
    }

    pub fn set_fail_latest(&self, fail: bool) {
        self.chain.lock().unwrap().fail_latest = fail;
    }

    pub fn set_fail_range(&self, fail: bool) {
        self.chain.lock().unwrap().fail_range = fail;
    }

    pub fn set_fail_logs(&self, fail: bool) {
        self.chain.lock().unwrap().fail_logs = fail;
    }

    pub fn set_range_empty(&self, empty: bool) {
        self.chain.lock().unwrap().range_empty = empty;
    }

    pub fn log_queries(&self) -> Vec<LogQuery> {
        self.chain.lock().unwrap().log_queries.clone()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn header_by_number(&self, number: Option<u64>) -> CallerResult<Option<BlockHeader>> {
        let chain = self.chain.lock().unwrap();
        match number {
            None if chain.fail_latest => Err(CallerError::TransientProviderError(
                "connection reset".into(),
            )),
            None => Ok(chain.headers.get(chain.head as usize).cloned()),
            Some(n) if n > chain.head => Ok(None),
            Some(n) => Ok(chain.headers.get(n as usize).cloned()),
        }
    }

    async fn headers_by_range(&self, from: u64, to: u64) -> CallerResult<Vec<BlockHeader>> {
        let chain = self.chain.lock().unwrap();
        if chain.fail_range {
            return Err(CallerError::TransientProviderError("range fetch failed".into()));
        }
        if from > to {
            return Err(CallerError::InvalidInput(format!("{from} > {to}")));
        }
        if chain.range_empty || from > chain.head {
            return Ok(vec![]);
        }
        let to = to.min(chain.head);
        Ok(chain.headers[from as usize..=to as usize].to_vec())
    }

    async fn filter_logs(&self, query: &LogQuery) -> CallerResult<LogBatch> {
        let mut chain = self.chain.lock().unwrap();
        if chain.fail_logs {
            return Err(CallerError::TransientProviderError("get_logs failed".into()));
        }
        chain.log_queries.push(query.clone());
        let logs = chain
            .logs
            .iter()
            .filter(|log| query.addresses.contains(&log.address))
            .filter(|log| {
                let number = log.block_number.map(|n| n.as_u64()).unwrap_or_default();
                (query.from_block..=query.to_block).contains(&number)
            })
            .cloned()
            .collect();
        let to_header = match &chain.to_header_override {
            Some(header) => header.clone(),
            None => chain
                .headers
                .get(query.to_block as usize)
                .cloned()
                .ok_or(CallerError::HeaderNotFound(query.to_block))?,
        };
        Ok(LogBatch { logs, to_header })
    }
}
