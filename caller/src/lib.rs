// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod chain_syncer;
pub mod config;
pub mod driver;
pub mod error;
pub mod eth_client;
pub mod metered_eth_provider;
pub mod metrics;
pub mod node;
pub mod retry;
pub mod storage;
pub mod txmgr;
pub mod types;

#[cfg(test)]
pub mod test_utils;
