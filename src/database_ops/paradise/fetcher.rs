use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{stream, StreamExt};
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::client::RoundApi;
use super::models::{normalize_blackbox, PlayerCountSample};
use crate::error::{FetchError, IngestError, RoundFailure, Stage};

/// Outcome of one per-round fetch, stored at the round's input position.
#[derive(Debug, Clone)]
pub enum Slot<T> {
    Ready(T),
    Failed(FetchError),
}

impl<T> Slot<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Slot::Ready(_))
    }

    pub fn failure(&self) -> Option<&FetchError> {
        match self {
            Slot::Ready(_) => None,
            Slot::Failed(e) => Some(e),
        }
    }
}

/// Detail payloads aligned index-for-index with `round_ids`.
#[derive(Debug, Clone)]
pub struct DetailBatch {
    pub round_ids: Vec<i64>,
    pub player_counts: Vec<Slot<Vec<PlayerCountSample>>>,
    pub stats: Vec<Slot<Vec<Value>>>,
}

impl DetailBatch {
    pub fn failures(&self) -> Vec<RoundFailure> {
        collect_failures(&self.round_ids, &self.player_counts, &self.stats)
    }
}

/// Cancelled slots are not failures of their own; they only exist after an abort.
fn collect_failures(
    round_ids: &[i64],
    player_counts: &[Slot<Vec<PlayerCountSample>>],
    stats: &[Slot<Vec<Value>>],
) -> Vec<RoundFailure> {
    let mut out = Vec::new();
    for (i, &round_id) in round_ids.iter().enumerate() {
        let pc = player_counts.get(i).map(|s| (Stage::PlayerCounts, s.failure()));
        let bb = stats.get(i).map(|s| (Stage::Blackbox, s.failure()));
        for (stage, err) in [pc, bb].into_iter().flatten() {
            match err {
                None | Some(FetchError::Cancelled { .. }) => {}
                Some(e) => out.push(RoundFailure {
                    round_id,
                    stage,
                    error: e.to_string(),
                }),
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy)]
struct Job {
    index: usize,
    round_id: i64,
    stage: Stage,
}

enum Payload {
    PlayerCounts(Vec<PlayerCountSample>),
    Blackbox(Vec<Value>),
}

impl Job {
    fn endpoint(&self) -> String {
        match self.stage {
            Stage::PlayerCounts => format!("/playercounts/{}", self.round_id),
            _ => format!("/blackbox/{}", self.round_id),
        }
    }

    async fn run<A: RoundApi + ?Sized>(self, api: &A, timeout: Duration) -> Result<Payload, FetchError> {
        let call = async {
            match self.stage {
                Stage::PlayerCounts => api.player_counts(self.round_id).await.map(Payload::PlayerCounts),
                _ => api.blackbox(self.round_id).await.map(Payload::Blackbox),
            }
        };
        match tokio::time::timeout(timeout, call).await {
            Ok(res) => res,
            Err(_) => Err(FetchError::Timeout {
                endpoint: self.endpoint(),
                after: timeout,
            }),
        }
    }
}

/// Fetches blackbox and playercount payloads for many rounds on a bounded pool.
pub struct DetailFetcher<A: ?Sized> {
    api: Arc<A>,
    workers: usize,
    call_timeout: Duration,
    abort_on_partial_failure: bool,
}

impl<A: RoundApi + ?Sized> DetailFetcher<A> {
    pub fn new(api: Arc<A>, workers: usize, call_timeout: Duration) -> Self {
        Self {
            api,
            workers: workers.max(1),
            call_timeout,
            abort_on_partial_failure: false,
        }
    }

    pub fn abort_on_partial_failure(mut self, abort: bool) -> Self {
        self.abort_on_partial_failure = abort;
        self
    }

    /// Results land in pre-sized slots keyed by input position, so completion order
    /// never affects alignment. A failed round keeps a `Failed` slot.
    #[instrument(skip_all, fields(rounds = round_ids.len(), workers = self.workers))]
    pub async fn fetch(&self, round_ids: &[i64]) -> Result<DetailBatch, IngestError> {
        let t0 = Instant::now();
        let n = round_ids.len();
        let mut counts: Vec<Option<Slot<Vec<PlayerCountSample>>>> = (0..n).map(|_| None).collect();
        let mut raw_stats: Vec<Option<Slot<Vec<Value>>>> = (0..n).map(|_| None).collect();

        let jobs = round_ids.iter().enumerate().flat_map(|(index, &round_id)| {
            [Stage::Blackbox, Stage::PlayerCounts].map(|stage| Job {
                index,
                round_id,
                stage,
            })
        });

        let timeout = self.call_timeout;
        let mut results = stream::iter(jobs)
            .map(|job| {
                let api = Arc::clone(&self.api);
                async move {
                    let res = job.run(&*api, timeout).await;
                    (job, res)
                }
            })
            .buffer_unordered(self.workers);

        let mut failed = 0usize;
        while let Some((job, res)) = results.next().await {
            let ok = res.is_ok();
            match res {
                Ok(Payload::PlayerCounts(v)) => counts[job.index] = Some(Slot::Ready(v)),
                Ok(Payload::Blackbox(v)) => raw_stats[job.index] = Some(Slot::Ready(v)),
                Err(e) => {
                    warn!(
                        round_id = job.round_id,
                        stage = %job.stage,
                        endpoint = e.endpoint(),
                        error = %e,
                        "round detail fetch failed"
                    );
                    match job.stage {
                        Stage::PlayerCounts => counts[job.index] = Some(Slot::Failed(e)),
                        _ => raw_stats[job.index] = Some(Slot::Failed(e)),
                    }
                }
            }
            if !ok {
                failed += 1;
                if self.abort_on_partial_failure {
                    // Dropping the stream cancels in-flight and queued jobs; filled slots stay.
                    drop(results);
                    let (counts, stats) = finish_slots(round_ids, counts, raw_stats);
                    let failures = collect_failures(round_ids, &counts, &stats);
                    return Err(IngestError::PartialFailure { failures });
                }
            }
        }
        drop(results);

        let (player_counts, raw) = finish_slots(round_ids, counts, raw_stats);
        let stats = raw
            .into_iter()
            .map(|slot| match slot {
                Slot::Ready(entries) => Slot::Ready(normalize_blackbox(entries)),
                failed => failed,
            })
            .collect();

        info!(
            rounds = n,
            failed_calls = failed,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "round details fetched"
        );
        Ok(DetailBatch {
            round_ids: round_ids.to_vec(),
            player_counts,
            stats,
        })
    }
}

/// Unfilled slots can only come from a cancelled pool; mark them so alignment holds.
fn finish_slots(
    round_ids: &[i64],
    counts: Vec<Option<Slot<Vec<PlayerCountSample>>>>,
    stats: Vec<Option<Slot<Vec<Value>>>>,
) -> (Vec<Slot<Vec<PlayerCountSample>>>, Vec<Slot<Vec<Value>>>) {
    fn cancelled<T>(endpoint: String) -> Slot<T> {
        Slot::Failed(FetchError::Cancelled { endpoint })
    }
    let counts = counts
        .into_iter()
        .zip(round_ids)
        .map(|(s, id)| s.unwrap_or_else(|| cancelled(format!("/playercounts/{id}"))))
        .collect();
    let stats = stats
        .into_iter()
        .zip(round_ids)
        .map(|(s, id)| s.unwrap_or_else(|| cancelled(format!("/blackbox/{id}"))))
        .collect();
    (counts, stats)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::FakeApi;
    use super::*;
    use rand::seq::SliceRandom;

    fn ready_ids(batch: &DetailBatch) -> Vec<i64> {
        batch
            .player_counts
            .iter()
            .map(|s| match s {
                Slot::Ready(samples) => samples[0].count,
                Slot::Failed(e) => panic!("unexpected failure: {e}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn output_stays_aligned_under_random_latency() {
        let api = Arc::new(FakeApi::with_rounds(1..=40).random_latency_ms(15));
        let mut input: Vec<i64> = (1..=40).collect();
        input.shuffle(&mut rand::thread_rng());

        let batch = DetailFetcher::new(api.clone(), 8, Duration::from_secs(5))
            .fetch(&input)
            .await
            .unwrap();

        assert_eq!(batch.round_ids, input);
        // FakeApi encodes the round id as the sample count and blackbox key.
        assert_eq!(ready_ids(&batch), input);
        for (i, slot) in batch.stats.iter().enumerate() {
            match slot {
                Slot::Ready(entries) => assert_eq!(entries[0]["round_id"], input[i]),
                Slot::Failed(e) => panic!("unexpected failure: {e}"),
            }
        }
        assert!(api.max_in_flight() <= 8);
    }

    #[tokio::test]
    async fn out_of_order_completion_is_forced_and_still_aligned() {
        // Earlier inputs sleep longer, so completion order is the reverse of input order.
        let input: Vec<i64> = (1..=12).collect();
        let api = Arc::new(FakeApi::with_rounds(1..=12).latency_fn(|id| (13 - id as u64) * 4));
        let batch = DetailFetcher::new(api.clone(), 24, Duration::from_secs(5))
            .fetch(&input)
            .await
            .unwrap();
        assert_eq!(ready_ids(&batch), input);
        let completions = api.completion_order();
        assert_ne!(completions, {
            let mut sorted = completions.clone();
            sorted.sort_unstable();
            sorted
        });
    }

    #[tokio::test]
    async fn raw_data_is_normalized_after_collection() {
        let api = Arc::new(FakeApi::with_rounds(1..=3));
        let batch = DetailFetcher::new(api, 2, Duration::from_secs(5))
            .fetch(&[3, 1])
            .await
            .unwrap();
        match &batch.stats[0] {
            Slot::Ready(entries) => assert_eq!(entries[0]["raw_data"]["value"], 3),
            Slot::Failed(e) => panic!("{e}"),
        }
    }

    #[tokio::test]
    async fn failed_round_keeps_its_slot() {
        let api = Arc::new(
            FakeApi::with_rounds(1..=6)
                .random_latency_ms(5)
                .fail_blackbox([4]),
        );
        let input = vec![6, 5, 4, 3, 2, 1];
        let batch = DetailFetcher::new(api, 3, Duration::from_secs(5))
            .fetch(&input)
            .await
            .unwrap();

        assert_eq!(batch.stats.len(), 6);
        assert_eq!(batch.player_counts.len(), 6);
        assert!(!batch.stats[2].is_ready());
        assert!(batch.player_counts[2].is_ready());
        assert!(batch.stats.iter().enumerate().all(|(i, s)| i == 2 || s.is_ready()));

        let failures = batch.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].round_id, 4);
        assert_eq!(failures[0].stage, Stage::Blackbox);
    }

    #[tokio::test]
    async fn failures_land_in_the_slot_of_their_own_stage() {
        let api = Arc::new(
            FakeApi::with_rounds(1..=5)
                .fail_player_counts([2])
                .fail_blackbox([4]),
        );
        let batch = DetailFetcher::new(api, 3, Duration::from_secs(5))
            .fetch(&[1, 2, 3, 4, 5])
            .await
            .unwrap();

        assert!(!batch.player_counts[1].is_ready());
        assert!(batch.stats[1].is_ready());
        assert!(batch.player_counts[3].is_ready());
        assert!(!batch.stats[3].is_ready());

        let mut failed: Vec<(i64, Stage)> = batch
            .failures()
            .into_iter()
            .map(|f| (f.round_id, f.stage))
            .collect();
        failed.sort_by_key(|(id, _)| *id);
        assert_eq!(failed, vec![(2, Stage::PlayerCounts), (4, Stage::Blackbox)]);
    }

    #[tokio::test]
    async fn slow_call_times_out_without_shifting_others() {
        let api = Arc::new(FakeApi::with_rounds(1..=4).latency_fn(|id| if id == 2 { 500 } else { 1 }));
        let batch = DetailFetcher::new(api, 4, Duration::from_millis(100))
            .fetch(&[1, 2, 3, 4])
            .await
            .unwrap();
        assert!(matches!(
            batch.player_counts[1],
            Slot::Failed(FetchError::Timeout { .. })
        ));
        assert!(batch.player_counts[0].is_ready());
        assert!(batch.player_counts[2].is_ready());
        assert!(batch.player_counts[3].is_ready());
    }

    #[tokio::test]
    async fn abort_policy_stops_the_pool() {
        let api = Arc::new(
            FakeApi::with_rounds(1..=50)
                .latency_fn(|id| if id == 1 { 0 } else { 20 })
                .fail_player_counts([1]),
        );
        let input: Vec<i64> = (1..=50).collect();
        let err = DetailFetcher::new(api.clone(), 2, Duration::from_secs(5))
            .abort_on_partial_failure(true)
            .fetch(&input)
            .await
            .unwrap_err();
        match err {
            IngestError::PartialFailure { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].round_id, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Most of the 100 calls never started.
        assert!(api.started_calls() < 20);
    }

    #[tokio::test]
    async fn empty_input_yields_empty_batch() {
        let api = Arc::new(FakeApi::with_rounds(1..=3));
        let batch = DetailFetcher::new(api, 2, Duration::from_secs(1))
            .fetch(&[])
            .await
            .unwrap();
        assert!(batch.round_ids.is_empty());
        assert!(batch.stats.is_empty());
    }
}
