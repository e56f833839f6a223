// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::CallerError;
use ethers::core::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Block, Bytes, Log, Signature, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

/// The part of a block the synchronizer cares about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub timestamp: u64,
}

impl BlockHeader {
    pub fn new(number: u64, hash: H256, parent_hash: H256, timestamp: u64) -> Self {
        Self {
            number,
            hash,
            parent_hash,
            timestamp,
        }
    }

    /// True if `self` directly extends `parent`.
    pub fn is_child_of(&self, parent: &BlockHeader) -> bool {
        self.parent_hash == parent.hash && self.number == parent.number + 1
    }
}

impl<TX> TryFrom<&Block<TX>> for BlockHeader {
    type Error = CallerError;

    fn try_from(block: &Block<TX>) -> Result<Self, Self::Error> {
        // Pending blocks come back without number or hash.
        let number = block
            .number
            .ok_or_else(|| CallerError::InvalidResponse("block without number".into()))?;
        let hash = block
            .hash
            .ok_or_else(|| CallerError::InvalidResponse("block without hash".into()))?;
        Ok(Self {
            number: number.as_u64(),
            hash,
            parent_hash: block.parent_hash,
            timestamp: block.timestamp.low_u64(),
        })
    }
}

/// Logs returned by a filter query together with the header of its `to` block,
/// fetched from the same provider so the two views can be compared.
#[derive(Debug, Clone, PartialEq)]
pub struct LogBatch {
    pub logs: Vec<Log>,
    pub to_header: BlockHeader,
}

/// A decoded log ready for storage. `(block_hash, log_index)` is the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractEvent {
    pub block_hash: H256,
    pub block_number: u64,
    pub contract_address: Address,
    pub transaction_hash: H256,
    pub log_index: u64,
    pub event_signature: H256,
    pub timestamp: u64,
    pub log: Log,
}

impl ContractEvent {
    pub fn from_log(log: &Log, timestamp: u64) -> Self {
        Self {
            block_hash: log.block_hash.unwrap_or_default(),
            block_number: log.block_number.map(|n| n.as_u64()).unwrap_or_default(),
            contract_address: log.address,
            transaction_hash: log.transaction_hash.unwrap_or_default(),
            log_index: log.log_index.map(|i| i.low_u64()).unwrap_or_default(),
            event_signature: log.topics.first().copied().unwrap_or_default(),
            timestamp,
            log: log.clone(),
        }
    }

    pub fn key(&self) -> (H256, u64) {
        (self.block_hash, self.log_index)
    }
}

/// One priced and signed variant of a logical transaction.
///
/// Variants of the same intent share `nonce` and differ in fees and `hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxCandidate {
    pub nonce: U256,
    pub gas_tip_cap: U256,
    pub gas_fee_cap: U256,
    pub hash: H256,
    pub raw: Bytes,
}

impl TxCandidate {
    pub fn from_signed(tx: &TypedTransaction, signature: &Signature) -> Self {
        let raw = tx.rlp_signed(signature);
        let hash = H256::from(keccak256(&raw));
        let (gas_tip_cap, gas_fee_cap) = match tx {
            TypedTransaction::Eip1559(inner) => (
                inner.max_priority_fee_per_gas.unwrap_or_default(),
                inner.max_fee_per_gas.unwrap_or_default(),
            ),
            other => {
                let price = other.gas_price().unwrap_or_default();
                (price, price)
            }
        };
        Self {
            nonce: tx.nonce().copied().unwrap_or_default(),
            gas_tip_cap,
            gas_fee_cap,
            hash,
            raw,
        }
    }
}
