// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! EIP-1559 pricing and signing for contract calls sent through
//! [`crate::txmgr::TxManager`].

use crate::error::{CallerError, CallerResult};
use crate::eth_client::EthClient;
use crate::txmgr::{calc_gas_fee_cap, TxPublisher};
use crate::types::TxCandidate;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ethers::core::types::transaction::eip2718::TypedTransaction;
use ethers::providers::{JsonRpcClient, Middleware};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address as EthAddress, BlockNumber, Bytes, Eip1559TransactionRequest, U256};
use std::sync::Arc;
use tap::TapFallible;
use tracing::{info, warn};

/// Tip used when the node does not implement `eth_maxPriorityFeePerGas`.
pub const FALLBACK_GAS_TIP_CAP: u64 = 1_500_000_000;

const MAX_PRIORITY_FEE_METHOD: &str = "eth_maxPriorityFeePerGas";

/// What to call. Every priced variant carries the same payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIntent {
    pub to: EthAddress,
    pub data: Bytes,
    pub value: U256,
    // Estimated on every pricing round when unset.
    pub gas_limit: Option<U256>,
}

fn is_max_priority_fee_not_found(err: &CallerError) -> bool {
    err.to_string()
        .contains(&format!("Method {} not found", MAX_PRIORITY_FEE_METHOD))
}

/// Suggested tip, or [`FALLBACK_GAS_TIP_CAP`] when the method is missing.
fn tip_cap_or_fallback(suggested: CallerResult<U256>) -> CallerResult<U256> {
    match suggested {
        Err(e) if is_max_priority_fee_not_found(&e) => {
            info!("Node does not support {}, using fallback tip", MAX_PRIORITY_FEE_METHOD);
            Ok(U256::from(FALLBACK_GAS_TIP_CAP))
        }
        other => other,
    }
}

/// Prices, signs and publishes variants of one [`TxIntent`] from a local key.
///
/// The nonce is fixed at construction so every variant replaces the previous
/// one instead of queueing behind it.
pub struct EthTxDriver<P> {
    client: Arc<EthClient<P>>,
    wallet: LocalWallet,
    intent: TxIntent,
    nonce: U256,
}

impl<P> EthTxDriver<P>
where
    P: JsonRpcClient + 'static,
{
    /// Use the pending nonce of `wallet` and sign for the provider's chain.
    pub async fn new(
        client: Arc<EthClient<P>>,
        wallet: LocalWallet,
        intent: TxIntent,
    ) -> anyhow::Result<Self> {
        let chain_id = client.chain_id().await.context("Failed to query chain id")?;
        let nonce = client
            .call(
                client
                    .provider()
                    .get_transaction_count(wallet.address(), Some(BlockNumber::Pending.into())),
            )
            .await
            .context("Failed to query pending nonce")?;
        info!(
            "[{}] Sending from {:?} with nonce {}",
            client.chain_name(),
            wallet.address(),
            nonce
        );
        Ok(Self::with_nonce(
            client,
            wallet.with_chain_id(chain_id),
            intent,
            nonce,
        ))
    }

    pub fn with_nonce(
        client: Arc<EthClient<P>>,
        wallet: LocalWallet,
        intent: TxIntent,
        nonce: U256,
    ) -> Self {
        Self {
            client,
            wallet,
            intent,
            nonce,
        }
    }

    pub fn sender(&self) -> EthAddress {
        self.wallet.address()
    }

    async fn suggest_gas_tip_cap(&self) -> CallerResult<U256> {
        tip_cap_or_fallback(
            self.client
                .call(
                    self.client
                        .provider()
                        .request::<_, U256>(MAX_PRIORITY_FEE_METHOD, ()),
                )
                .await,
        )
    }

    async fn base_fee(&self) -> CallerResult<U256> {
        let block = self
            .client
            .call(self.client.provider().get_block(BlockNumber::Latest))
            .await?
            .ok_or(CallerError::LatestHeaderNotFound)?;
        block.base_fee_per_gas.ok_or_else(|| {
            CallerError::InvalidResponse("latest block has no base fee, chain is not EIP-1559".into())
        })
    }

    fn priced_request(&self, gas_tip_cap: U256, base_fee: U256) -> TypedTransaction {
        Eip1559TransactionRequest::new()
            .from(self.wallet.address())
            .to(self.intent.to)
            .data(self.intent.data.clone())
            .value(self.intent.value)
            .nonce(self.nonce)
            .chain_id(self.wallet.chain_id())
            .max_priority_fee_per_gas(gas_tip_cap)
            .max_fee_per_gas(calc_gas_fee_cap(base_fee, gas_tip_cap))
            .into()
    }

    fn sign(&self, tx: &TypedTransaction) -> anyhow::Result<TxCandidate> {
        let signature = self
            .wallet
            .sign_transaction_sync(tx)
            .map_err(|e| anyhow!("Failed to sign transaction: {}", e))?;
        Ok(TxCandidate::from_signed(tx, &signature))
    }
}

#[async_trait]
impl<P> TxPublisher for EthTxDriver<P>
where
    P: JsonRpcClient + 'static,
{
    async fn update_gas_price(&self) -> anyhow::Result<TxCandidate> {
        let gas_tip_cap = self.suggest_gas_tip_cap().await?;
        let base_fee = self.base_fee().await?;
        let mut tx = self.priced_request(gas_tip_cap, base_fee);

        let gas = match self.intent.gas_limit {
            Some(gas) => gas,
            None => self
                .client
                .call(self.client.provider().estimate_gas(&tx, None))
                .await
                .context("Failed to estimate gas")?,
        };
        tx.set_gas(gas);
        self.sign(&tx)
    }

    async fn send_transaction(&self, tx: &TxCandidate) -> anyhow::Result<()> {
        self.client
            .send_raw_transaction(tx.raw.clone())
            .await
            .tap_err(|e| {
                warn!(
                    "[{}] Raw transaction {:?} rejected: {}",
                    self.client.chain_name(),
                    tx.hash,
                    e
                )
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth_client::ClientOptions;
    use ethers::providers::{MockProvider, Provider};

    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn driver(gas_limit: Option<U256>) -> (EthTxDriver<MockProvider>, MockProvider) {
        let (provider, mock) = Provider::mocked();
        let client = Arc::new(EthClient::new(provider, "test", ClientOptions::default()));
        let wallet = KEY.parse::<LocalWallet>().unwrap().with_chain_id(5u64);
        let intent = TxIntent {
            to: EthAddress::repeat_byte(0x11),
            data: Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]),
            value: U256::zero(),
            gas_limit,
        };
        (
            EthTxDriver::with_nonce(client, wallet, intent, U256::from(9)),
            mock,
        )
    }

    #[test]
    fn test_tip_cap_fallback() {
        let missing = CallerError::TransientProviderError(
            "(code: -32601, message: Method eth_maxPriorityFeePerGas not found, data: None)"
                .into(),
        );
        assert_eq!(
            tip_cap_or_fallback(Err(missing)).unwrap(),
            U256::from(FALLBACK_GAS_TIP_CAP)
        );
        assert_eq!(
            tip_cap_or_fallback(Ok(U256::from(3))).unwrap(),
            U256::from(3)
        );
        assert!(tip_cap_or_fallback(Err(CallerError::Timeout(
            std::time::Duration::from_secs(1)
        )))
        .is_err());
    }

    #[tokio::test]
    async fn test_suggest_gas_tip_cap() {
        let (driver, mock) = driver(None);
        mock.push(U256::from(2_000_000_000u64)).unwrap();
        assert_eq!(
            driver.suggest_gas_tip_cap().await.unwrap(),
            U256::from(2_000_000_000u64)
        );
    }

    #[test]
    fn test_variants_share_nonce_and_payload() {
        let (driver, _mock) = driver(Some(U256::from(60_000)));
        let mut low = driver.priced_request(U256::from(5), U256::from(7));
        low.set_gas(60_000u64);
        let mut high = driver.priced_request(U256::from(10), U256::from(14));
        high.set_gas(60_000u64);

        let low = driver.sign(&low).unwrap();
        let high = driver.sign(&high).unwrap();
        assert_eq!(low.nonce, U256::from(9));
        assert_eq!(high.nonce, low.nonce);
        assert_eq!(low.gas_fee_cap, U256::from(19));
        assert_eq!(high.gas_fee_cap, U256::from(38));
        assert_ne!(low.hash, high.hash);
    }
}
