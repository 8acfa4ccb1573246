// GTFS-Realtime trip updates, fetched per query with bounded retries.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use gtfs_rt::FeedMessage;
use prost::Message;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::fetch::Fetcher;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed pause between two attempts.
    pub delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeArrivalCandidate {
    /// Absent when the feed leaves the route out of the trip descriptor.
    pub route_id: Option<String>,
    pub trip_id: String,
    pub arrival_time: DateTime<Tz>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedOutcome {
    Live(Vec<RealtimeArrivalCandidate>),
    /// Every attempt failed or the deadline passed; callers use the schedule.
    Degraded,
}

pub struct RealtimeClient {
    fetcher: Arc<dyn Fetcher>,
    url: String,
    policy: RetryPolicy,
}

impl RealtimeClient {
    pub fn new(fetcher: Arc<dyn Fetcher>, url: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            fetcher,
            url: url.into(),
            policy,
        }
    }

    /// Live arrivals at `stop_id` no earlier than `now`.
    ///
    /// Blocks the calling thread across retries. No attempt starts after
    /// `deadline`, and a pause that would run past it ends the loop early.
    pub fn fetch_trip_updates(&self, stop_id: &str, now: &DateTime<Tz>, deadline: Instant) -> FeedOutcome {
        let max_attempts = self.policy.max_attempts;

        for attempt in 1..=max_attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(stop_id, attempt, "Realtime deadline reached");
                break;
            }

            match self.fetch_feed(self.policy.attempt_timeout.min(remaining)) {
                Ok(feed) => {
                    let candidates = arrivals_at_stop(&feed, stop_id, now);
                    debug!(
                        stop_id,
                        attempt,
                        entities = feed.entity.len(),
                        matched = candidates.len(),
                        "Decoded realtime feed"
                    );
                    return FeedOutcome::Live(candidates);
                }
                Err(e) => {
                    warn!(error = %e, stop_id, attempt, max_attempts, "Realtime fetch attempt failed");
                }
            }

            if attempt < max_attempts {
                if deadline.saturating_duration_since(Instant::now()) <= self.policy.delay {
                    warn!(stop_id, attempt, "No time left for another realtime attempt");
                    break;
                }
                thread::sleep(self.policy.delay);
            }
        }

        error!(stop_id, url = %self.url, "Realtime feed unavailable, falling back to schedule");
        FeedOutcome::Degraded
    }

    fn fetch_feed(&self, timeout: Duration) -> Result<FeedMessage> {
        let body = self.fetcher.get(&self.url, timeout)?;
        Ok(FeedMessage::decode(&*body)?)
    }
}

/// Every stop-time update for `stop_id` whose predicted arrival is at or after `now`.
pub fn arrivals_at_stop(feed: &FeedMessage, stop_id: &str, now: &DateTime<Tz>) -> Vec<RealtimeArrivalCandidate> {
    let tz = now.timezone();
    let mut candidates = Vec::new();

    for entity in &feed.entity {
        let Some(trip_update) = &entity.trip_update else {
            continue;
        };
        let trip = &trip_update.trip;

        for stop_time_update in &trip_update.stop_time_update {
            if stop_time_update.stop_id.as_deref() != Some(stop_id) {
                continue;
            }

            let Some(epoch) = stop_time_update.arrival.as_ref().and_then(|a| a.time) else {
                continue;
            };
            let Some(arrival_time) = Utc.timestamp_opt(epoch, 0).single() else {
                continue;
            };
            let arrival_time = arrival_time.with_timezone(&tz);

            if arrival_time >= *now {
                candidates.push(RealtimeArrivalCandidate {
                    route_id: trip.route_id.clone(),
                    trip_id: trip.trip_id.clone().unwrap_or_default(),
                    arrival_time,
                });
            }
        }
    }

    candidates
}
