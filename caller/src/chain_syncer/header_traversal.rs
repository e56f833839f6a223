// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{SyncError, SyncResult};
use crate::error::CallerError;
use crate::eth_client::ChainClient;
use crate::metrics::CallerMetrics;
use crate::types::BlockHeader;
use std::sync::Arc;
use tracing::debug;

/// Cursor over confirmed headers.
///
/// Each call to [`HeaderTraversal::next_headers`] hands out the next window of
/// headers that are at least `confirmation_depth` blocks below the head and
/// linked to the previously handed out header.
pub struct HeaderTraversal<C: ?Sized> {
    client: Arc<C>,
    chain_name: String,
    confirmation_depth: u64,
    latest_header: Option<BlockHeader>,
    last_traversed_header: Option<BlockHeader>,
    // First height handed out while there is no cursor yet.
    start_height: u64,
    metrics: Option<Arc<CallerMetrics>>,
}

impl<C> HeaderTraversal<C>
where
    C: ChainClient + ?Sized,
{
    /// Resume after `from_header`, or start at genesis when it is `None`.
    pub fn new(
        client: Arc<C>,
        chain_name: &str,
        from_header: Option<BlockHeader>,
        confirmation_depth: u64,
    ) -> Self {
        Self {
            client,
            chain_name: chain_name.to_string(),
            confirmation_depth,
            latest_header: None,
            last_traversed_header: from_header,
            start_height: 0,
            metrics: None,
        }
    }

    /// Start at `start_height` without a cursor to link the first batch to.
    pub fn starting_at(
        client: Arc<C>,
        chain_name: &str,
        start_height: u64,
        confirmation_depth: u64,
    ) -> Self {
        Self {
            start_height,
            ..Self::new(client, chain_name, None, confirmation_depth)
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<CallerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Head reported by the provider on the last call.
    pub fn latest_header(&self) -> Option<&BlockHeader> {
        self.latest_header.as_ref()
    }

    pub fn last_traversed_header(&self) -> Option<&BlockHeader> {
        self.last_traversed_header.as_ref()
    }

    /// Up to `max_size` headers following the cursor. An empty batch means
    /// nothing new is confirmed yet.
    ///
    /// The cursor only advances when a non-empty batch is returned, so a
    /// failed call can simply be repeated.
    pub async fn next_headers(&mut self, max_size: u64) -> SyncResult<Vec<BlockHeader>> {
        let latest = self
            .client
            .header_by_number(None)
            .await?
            .ok_or(CallerError::LatestHeaderNotFound)?;
        if let Some(metrics) = &self.metrics {
            metrics.latest_observed_block.set(latest.number as i64);
        }
        let latest_number = latest.number;
        self.latest_header = Some(latest);

        let Some(safe_end) = latest_number.checked_sub(self.confirmation_depth) else {
            debug!(
                "[{}] Head {} is within confirmation depth {}",
                self.chain_name, latest_number, self.confirmation_depth
            );
            return Ok(vec![]);
        };
        if max_size == 0 {
            return Ok(vec![]);
        }

        let next_height = match &self.last_traversed_header {
            Some(last) if last.number == safe_end => return Ok(vec![]),
            Some(last) if last.number > safe_end => {
                return Err(SyncError::TraversalAheadOfProvider {
                    last: last.number,
                    safe_end,
                });
            }
            Some(last) => last.number + 1,
            None if self.start_height > safe_end => return Ok(vec![]),
            None => self.start_height,
        };
        let end = safe_end.min(next_height.saturating_add(max_size - 1));

        let headers = self.client.headers_by_range(next_height, end).await?;
        let Some(first) = headers.first() else {
            return Ok(vec![]);
        };
        if first.number != next_height {
            return Err(CallerError::InvalidResponse(format!(
                "range {}..={} started at {}",
                next_height, end, first.number
            ))
            .into());
        }
        if let Some(last) = &self.last_traversed_header {
            if first.parent_hash != last.hash {
                return Err(SyncError::TraversalAndProviderMismatchedState {
                    expected: last.hash,
                    found: first.parent_hash,
                });
            }
        }
        if let Some(pair) = headers.windows(2).find(|pair| !pair[1].is_child_of(&pair[0])) {
            return Err(CallerError::InvalidResponse(format!(
                "header {} does not extend header {}",
                pair[1].number, pair[0].number
            ))
            .into());
        }

        self.last_traversed_header = headers.last().cloned();
        if let (Some(metrics), Some(last)) = (&self.metrics, &self.last_traversed_header) {
            metrics.last_traversed_block.set(last.number as i64);
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockChainClient;

    fn numbers(headers: &[BlockHeader]) -> Vec<u64> {
        headers.iter().map(|h| h.number).collect()
    }

    #[tokio::test]
    async fn test_first_batch_from_genesis() {
        let client = Arc::new(MockChainClient::new(101));
        let mut traversal = HeaderTraversal::new(client, "test", None, 0);
        assert!(traversal.latest_header().is_none());

        let headers = traversal.next_headers(10).await.unwrap();
        assert_eq!(numbers(&headers), (0..10).collect::<Vec<_>>());
        assert_eq!(traversal.last_traversed_header().unwrap().number, 9);
        assert_eq!(traversal.latest_header().unwrap().number, 100);
    }

    #[tokio::test]
    async fn test_first_batch_from_starting_height() {
        let client = Arc::new(MockChainClient::new(101));
        let mut traversal = HeaderTraversal::starting_at(client, "test", 20, 0);
        let headers = traversal.next_headers(10).await.unwrap();
        assert_eq!(numbers(&headers), (20..30).collect::<Vec<_>>());

        // Starting point above the confirmed range waits.
        let client = Arc::new(MockChainClient::new(10));
        let mut traversal = HeaderTraversal::starting_at(client, "test", 20, 0);
        assert!(traversal.next_headers(10).await.unwrap().is_empty());
        assert!(traversal.last_traversed_header().is_none());
    }

    #[tokio::test]
    async fn test_resumes_after_stored_header() {
        let client = Arc::new(MockChainClient::new(50));
        let from = client.header(14);
        let mut traversal = HeaderTraversal::new(client, "test", Some(from), 0);
        let headers = traversal.next_headers(5).await.unwrap();
        assert_eq!(numbers(&headers), vec![15, 16, 17, 18, 19]);
    }

    #[tokio::test]
    async fn test_confirmation_depth_clamp() {
        let client = Arc::new(MockChainClient::new(101));
        let mut traversal = HeaderTraversal::new(client.clone(), "test", None, 95);
        let headers = traversal.next_headers(10).await.unwrap();
        assert_eq!(numbers(&headers), vec![0, 1, 2, 3, 4, 5]);
        assert!(traversal.next_headers(10).await.unwrap().is_empty());

        client.set_head(103);
        let headers = traversal.next_headers(10).await.unwrap();
        assert_eq!(numbers(&headers), vec![6, 7, 8]);
        for pair in headers.windows(2) {
            assert_eq!(pair[1].parent_hash, pair[0].hash);
        }
    }

    #[tokio::test]
    async fn test_head_within_confirmation_depth() {
        let client = Arc::new(MockChainClient::new(4));
        let mut traversal = HeaderTraversal::new(client, "test", None, 10);
        assert!(traversal.next_headers(10).await.unwrap().is_empty());
        assert_eq!(traversal.latest_header().unwrap().number, 3);
        assert!(traversal.next_headers(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_fetch_repeats_same_window() {
        let client = Arc::new(MockChainClient::new(30));
        let mut traversal = HeaderTraversal::new(client.clone(), "test", None, 0);
        traversal.next_headers(10).await.unwrap();

        client.set_fail_range(true);
        assert!(matches!(
            traversal.next_headers(10).await,
            Err(SyncError::Client(_))
        ));
        assert_eq!(traversal.last_traversed_header().unwrap().number, 9);

        client.set_fail_range(false);
        let headers = traversal.next_headers(10).await.unwrap();
        assert_eq!(numbers(&headers), (10..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_missing_latest_header() {
        let client = Arc::new(MockChainClient::new(30));
        client.set_fail_latest(true);
        let mut traversal = HeaderTraversal::new(client, "test", None, 0);
        let err = traversal.next_headers(10).await.unwrap_err();
        assert!(matches!(err, SyncError::Client(ref e) if e.is_transient()));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_empty_range_is_empty_batch() {
        let client = Arc::new(MockChainClient::new(30));
        client.set_range_empty(true);
        let mut traversal = HeaderTraversal::new(client, "test", None, 0);
        assert!(traversal.next_headers(10).await.unwrap().is_empty());
        assert!(traversal.last_traversed_header().is_none());
    }

    #[tokio::test]
    async fn test_ahead_of_provider() {
        let client = Arc::new(MockChainClient::new(30));
        let mut traversal = HeaderTraversal::new(client.clone(), "test", None, 0);
        traversal.next_headers(10).await.unwrap();

        client.set_head(5);
        let err = traversal.next_headers(10).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::TraversalAheadOfProvider { last: 9, safe_end: 5 }
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_provider_diverged() {
        let client = Arc::new(MockChainClient::new(30));
        let mut traversal = HeaderTraversal::new(client.clone(), "test", None, 0);
        traversal.next_headers(10).await.unwrap();
        let last = traversal.last_traversed_header().unwrap().clone();

        client.reorg_from(8, 2);
        let err = traversal.next_headers(10).await.unwrap_err();
        match &err {
            SyncError::TraversalAndProviderMismatchedState { expected, found } => {
                assert_eq!(*expected, last.hash);
                assert_eq!(*found, client.header(9).hash);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.is_fatal());
        // The cursor is left where it was.
        assert_eq!(traversal.last_traversed_header(), Some(&last));
    }
}
