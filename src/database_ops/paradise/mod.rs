//! Paradise Station stats API: client, paging, detail fan-out and the merge that turns
//! the three endpoints into one record per round.

pub mod client;
pub mod fetcher;
pub mod merge;
pub mod models;
pub mod paginator;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::{BTreeSet, HashSet};
    use std::ops::RangeInclusive;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use rand::Rng;
    use serde_json::{json, Value};

    use super::client::RoundApi;
    use super::models::{PlayerCountSample, RoundMetadata};
    use crate::error::FetchError;

    /// In-process stand-in for the stats API. Round ids double as payload markers:
    /// playercount samples carry `count == round_id` and blackbox entries carry
    /// `round_id` plus a string-encoded `raw_data`.
    pub struct FakeApi {
        rounds: BTreeSet<i64>,
        page_size: usize,
        fail_listing_at: Option<i64>,
        fail_blackbox: HashSet<i64>,
        fail_player_counts: HashSet<i64>,
        random_latency_ms: u64,
        latency_fn: Option<fn(i64) -> u64>,
        offsets: Mutex<Vec<i64>>,
        completions: Mutex<Vec<i64>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        started: AtomicUsize,
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn fake_round(round_id: i64) -> RoundMetadata {
        let mut m = RoundMetadata::new(round_id);
        m.game_mode = Some("extended".into());
        m.map_name = Some("Cyberiad".into());
        m.server_id = Some("paradise_main".into());
        m
    }

    impl FakeApi {
        pub fn with_rounds(ids: RangeInclusive<i64>) -> Self {
            Self {
                rounds: ids.collect(),
                page_size: 10,
                fail_listing_at: None,
                fail_blackbox: HashSet::new(),
                fail_player_counts: HashSet::new(),
                random_latency_ms: 0,
                latency_fn: None,
                offsets: Mutex::new(Vec::new()),
                completions: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                started: AtomicUsize::new(0),
            }
        }

        pub fn page_size(mut self, n: usize) -> Self {
            self.page_size = n.max(1);
            self
        }

        pub fn fail_listing_at(mut self, offset: i64) -> Self {
            self.fail_listing_at = Some(offset);
            self
        }

        pub fn random_latency_ms(mut self, ms: u64) -> Self {
            self.random_latency_ms = ms;
            self
        }

        pub fn latency_fn(mut self, f: fn(i64) -> u64) -> Self {
            self.latency_fn = Some(f);
            self
        }

        pub fn fail_blackbox(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
            self.fail_blackbox.extend(ids);
            self
        }

        pub fn fail_player_counts(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
            self.fail_player_counts.extend(ids);
            self
        }

        pub fn requested_offsets(&self) -> Vec<i64> {
            self.offsets.lock().unwrap().clone()
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        pub fn completion_order(&self) -> Vec<i64> {
            self.completions.lock().unwrap().clone()
        }

        pub fn started_calls(&self) -> usize {
            self.started.load(Ordering::SeqCst)
        }

        async fn detail_call(&self, round_id: i64) {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            let ms = match self.latency_fn {
                Some(f) => f(round_id),
                None if self.random_latency_ms > 0 => {
                    rand::thread_rng().gen_range(0..=self.random_latency_ms)
                }
                None => 0,
            };
            if ms > 0 {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            } else {
                tokio::task::yield_now().await;
            }
            self.completions.lock().unwrap().push(round_id);
        }

        fn rejected(endpoint: String) -> FetchError {
            FetchError::Permanent {
                endpoint,
                status: 404,
                message: "injected failure".into(),
            }
        }
    }

    #[async_trait]
    impl RoundApi for FakeApi {
        async fn round_list(&self, offset: i64) -> Result<Vec<RoundMetadata>, FetchError> {
            self.offsets.lock().unwrap().push(offset);
            if self.fail_listing_at == Some(offset) {
                return Err(FetchError::Transient {
                    endpoint: format!("/roundlist?offset={offset}"),
                    attempts: 3,
                    message: "status 503 Service Unavailable".into(),
                });
            }
            let page = self
                .rounds
                .iter()
                .rev()
                .filter(|&&id| offset == 0 || id <= offset)
                .take(self.page_size)
                .map(|&id| fake_round(id))
                .collect();
            Ok(page)
        }

        async fn blackbox(&self, round_id: i64) -> Result<Vec<Value>, FetchError> {
            self.detail_call(round_id).await;
            if self.fail_blackbox.contains(&round_id) {
                return Err(Self::rejected(format!("/blackbox/{round_id}")));
            }
            Ok(vec![json!({
                "round_id": round_id,
                "key_name": "round_end_stats",
                "raw_data": json!({ "value": round_id }).to_string(),
            })])
        }

        async fn player_counts(&self, round_id: i64) -> Result<Vec<PlayerCountSample>, FetchError> {
            self.detail_call(round_id).await;
            if self.fail_player_counts.contains(&round_id) {
                return Err(Self::rejected(format!("/playercounts/{round_id}")));
            }
            Ok(vec![PlayerCountSample {
                timestamp: "2024-03-01T12:00:00".into(),
                count: round_id,
            }])
        }

        async fn metadata(&self, round_id: i64) -> Result<RoundMetadata, FetchError> {
            if self.rounds.contains(&round_id) {
                Ok(fake_round(round_id))
            } else {
                Err(Self::rejected(format!("/metadata/{round_id}")))
            }
        }
    }
}
