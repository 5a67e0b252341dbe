//! Daily per-queue execution statistics.
//!
//! Counters live in one hash per queue with fields `{date}:{counter}`, so a
//! single `HGETALL` serves any window of days.

use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::broker::MessageBroker;
use crate::policy::Decision;
use crate::topology::QueueDetail;

const SUCCESS: &str = "success";
const FAILURE: &str = "failure";
const RETRY: &str = "retry";
const DEAD_LETTER: &str = "dead_letter";
const DISCARD: &str = "discard";
const EXEC_COUNT: &str = "exec_count";
const EXEC_MS: &str = "exec_ms";

fn field(date: NaiveDate, counter: &str) -> String {
    format!("{}:{}", date.format("%Y-%m-%d"), counter)
}

/// Oldest day whose counters survive `retention`. Today is always kept.
fn oldest_kept_day(today: NaiveDate, retention: Duration) -> NaiveDate {
    let days = i64::try_from(retention.as_secs() / 86_400).unwrap_or(i64::MAX);
    chrono::Duration::try_days(days)
        .and_then(|back| today.checked_sub_signed(back))
        .unwrap_or(NaiveDate::MIN)
}

/// Counters of one queue for one day.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub success: i64,
    pub failure: i64,
    pub retry: i64,
    pub dead_letter: i64,
    pub discard: i64,
    /// Mean handler execution time, when anything ran that day
    pub mean_execution_ms: Option<f64>,
}

impl DailyStats {
    /// Extract one day from the raw counters of a statistics hash.
    pub fn from_counters(date: NaiveDate, counters: &HashMap<String, i64>) -> Self {
        let get = |counter: &str| counters.get(&field(date, counter)).copied().unwrap_or(0);
        let exec_count = get(EXEC_COUNT);
        Self {
            date,
            success: get(SUCCESS),
            failure: get(FAILURE),
            retry: get(RETRY),
            dead_letter: get(DEAD_LETTER),
            discard: get(DISCARD),
            mean_execution_ms: (exec_count > 0).then(|| get(EXEC_MS) as f64 / exec_count as f64),
        }
    }
}

/// Writes counters for the worker pool and the enforcer. Failures to record
/// are logged and otherwise ignored.
#[derive(Clone)]
pub(crate) struct StatsRecorder {
    broker: Arc<dyn MessageBroker>,
    retention: Duration,
    enabled: bool,
}

impl StatsRecorder {
    pub fn new(broker: Arc<dyn MessageBroker>, retention: Duration, enabled: bool) -> Self {
        Self {
            broker,
            retention,
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Handler succeeded after `elapsed`.
    pub async fn success(&self, queue: &QueueDetail, elapsed: Duration) {
        let today = Utc::now().date_naive();
        self.record(
            queue,
            vec![
                (field(today, SUCCESS), 1),
                (field(today, EXEC_COUNT), 1),
                (field(today, EXEC_MS), elapsed.as_millis() as i64),
            ],
        )
        .await;
    }

    /// Delivery failed and `decision` was applied. `elapsed` is set when a
    /// handler actually ran.
    pub async fn failure(
        &self,
        queue: &QueueDetail,
        decision: Decision,
        elapsed: Option<Duration>,
    ) {
        let today = Utc::now().date_naive();
        let outcome = match decision {
            Decision::RequeueImmediate | Decision::RequeueDelayed(_) => RETRY,
            Decision::DeadLetter => DEAD_LETTER,
            Decision::Discard => DISCARD,
        };
        let mut increments = vec![(field(today, FAILURE), 1), (field(today, outcome), 1)];
        if let Some(elapsed) = elapsed {
            increments.push((field(today, EXEC_COUNT), 1));
            increments.push((field(today, EXEC_MS), elapsed.as_millis() as i64));
        }
        self.record(queue, increments).await;
    }

    async fn record(&self, queue: &QueueDetail, increments: Vec<(String, i64)>) {
        if !self.enabled {
            return;
        }
        let cutoff = oldest_kept_day(Utc::now().date_naive(), self.retention);
        let prune_before = cutoff.format("%Y-%m-%d").to_string();
        if let Err(e) = self
            .broker
            .increment_stats(
                &queue.keys.stats,
                &increments,
                &prune_before,
                self.retention,
            )
            .await
        {
            debug!(queue = %queue.name, error = %e, "Failed to record queue statistics");
        }
    }
}
