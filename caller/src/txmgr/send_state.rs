// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::TxManagerError;
use ethers::types::H256;
use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Mutex;

const NONCE_TOO_LOW: &str = "nonce too low";

/// Returns true when a publish error reports an already used nonce.
pub fn is_nonce_too_low<E: Display + ?Sized>(err: &E) -> bool {
    err.to_string().to_lowercase().contains(NONCE_TOO_LOW)
}

#[derive(Debug, Default)]
struct Inner {
    mined_txs: HashSet<H256>,
    nonce_too_low_count: u64,
}

/// Tracks the outcomes of every variant published for one logical transaction.
///
/// A "nonce too low" rejection is ambiguous: either the nonce is stale or one
/// of our own variants was already included. Repeated rejections with no
/// variant seen on chain end the send; any variant seen on chain overrides
/// that, however many rejections were counted.
#[derive(Debug)]
pub struct SendState {
    inner: Mutex<Inner>,
    safe_abort_nonce_too_low_count: u64,
}

impl SendState {
    pub fn new(safe_abort_nonce_too_low_count: u64) -> Result<Self, TxManagerError> {
        if safe_abort_nonce_too_low_count == 0 {
            return Err(TxManagerError::ZeroAbortThreshold);
        }
        Ok(Self {
            inner: Mutex::new(Inner::default()),
            safe_abort_nonce_too_low_count,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Every critical section leaves Inner consistent, so a poisoned lock
        // still holds usable state.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the result of one publish. Only nonce-too-low errors count.
    pub fn process_send_error<E: Display + ?Sized>(&self, err: Option<&E>) {
        if let Some(err) = err {
            if is_nonce_too_low(err) {
                self.lock().nonce_too_low_count += 1;
            }
        }
    }

    pub fn tx_mined(&self, hash: H256) {
        self.lock().mined_txs.insert(hash);
    }

    /// Forget a previously mined variant. Losing the last one (for example
    /// to a reorg) also resets the nonce-too-low count.
    pub fn tx_not_mined(&self, hash: H256) {
        let mut inner = self.lock();
        let was_mined = inner.mined_txs.remove(&hash);
        if was_mined && inner.mined_txs.is_empty() {
            inner.nonce_too_low_count = 0;
        }
    }

    pub fn should_abort_immediately(&self) -> bool {
        let inner = self.lock();
        if !inner.mined_txs.is_empty() {
            return false;
        }
        inner.nonce_too_low_count >= self.safe_abort_nonce_too_low_count
    }

    pub fn is_waiting_for_confirmation(&self) -> bool {
        !self.lock().mined_txs.is_empty()
    }

    pub fn nonce_too_low_count(&self) -> u64 {
        self.lock().nonce_too_low_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    const SAFE_ABORT_NONCE_TOO_LOW_COUNT: u64 = 3;

    fn new_send_state() -> SendState {
        SendState::new(SAFE_ABORT_NONCE_TOO_LOW_COUNT).unwrap()
    }

    fn process_nonce_too_low(state: &SendState) {
        let err = anyhow!("nonce too low");
        state.process_send_error(Some(&err));
    }

    fn test_hash(n: u64) -> H256 {
        H256::from_low_u64_be(n)
    }

    #[test]
    fn test_zero_threshold_rejected() {
        assert!(matches!(
            SendState::new(0),
            Err(TxManagerError::ZeroAbortThreshold)
        ));
    }

    #[test]
    fn test_no_abort_after_init() {
        let state = new_send_state();
        assert!(!state.should_abort_immediately());
        assert!(!state.is_waiting_for_confirmation());
    }

    #[test]
    fn test_no_abort_after_processing_nil_err() {
        let state = new_send_state();
        state.process_send_error::<anyhow::Error>(None);
        assert!(!state.should_abort_immediately());
        assert_eq!(state.nonce_too_low_count(), 0);
    }

    #[test]
    fn test_no_abort_after_processing_other_error() {
        let state = new_send_state();
        for _ in 0..SAFE_ABORT_NONCE_TOO_LOW_COUNT {
            state.process_send_error(Some(&anyhow!("insufficient funds for gas")));
        }
        assert!(!state.should_abort_immediately());
    }

    #[test]
    fn test_abort_exactly_at_threshold() {
        let state = new_send_state();
        process_nonce_too_low(&state);
        assert!(!state.should_abort_immediately());
        process_nonce_too_low(&state);
        assert!(!state.should_abort_immediately());
        process_nonce_too_low(&state);
        assert!(state.should_abort_immediately());
    }

    #[test]
    fn test_no_abort_after_mined() {
        let state = new_send_state();
        state.tx_mined(test_hash(1));
        for _ in 0..SAFE_ABORT_NONCE_TOO_LOW_COUNT {
            process_nonce_too_low(&state);
        }
        assert!(!state.should_abort_immediately());
        assert!(state.is_waiting_for_confirmation());
    }

    #[test]
    fn test_mined_overrides_count_reached_earlier() {
        let state = new_send_state();
        for _ in 0..SAFE_ABORT_NONCE_TOO_LOW_COUNT {
            process_nonce_too_low(&state);
        }
        assert!(state.should_abort_immediately());
        state.tx_mined(test_hash(1));
        assert!(!state.should_abort_immediately());
    }

    #[test]
    fn test_abort_after_unmining_needs_fresh_errors() {
        let state = new_send_state();
        state.tx_mined(test_hash(1));
        state.tx_mined(test_hash(2));
        for _ in 0..SAFE_ABORT_NONCE_TOO_LOW_COUNT {
            process_nonce_too_low(&state);
        }

        // One variant is still mined, the count is untouched.
        state.tx_not_mined(test_hash(1));
        assert!(!state.should_abort_immediately());
        assert_eq!(state.nonce_too_low_count(), SAFE_ABORT_NONCE_TOO_LOW_COUNT);

        state.tx_not_mined(test_hash(2));
        assert!(!state.is_waiting_for_confirmation());
        assert_eq!(state.nonce_too_low_count(), 0);
        assert!(!state.should_abort_immediately());

        for _ in 0..SAFE_ABORT_NONCE_TOO_LOW_COUNT {
            process_nonce_too_low(&state);
        }
        assert!(state.should_abort_immediately());
    }

    #[test]
    fn test_unmining_unknown_hash_keeps_count() {
        let state = new_send_state();
        process_nonce_too_low(&state);
        state.tx_not_mined(test_hash(9));
        assert_eq!(state.nonce_too_low_count(), 1);
    }

    #[test]
    fn test_nonce_too_low_matching() {
        assert!(is_nonce_too_low(
            "(code: -32000, message: nonce too low, data: None)"
        ));
        assert!(is_nonce_too_low("Nonce too low: next nonce 5"));
        assert!(!is_nonce_too_low("replacement transaction underpriced"));
    }
}
