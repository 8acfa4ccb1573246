// Merges live and scheduled arrivals for one stop into a short, ranked board.

use chrono::{DateTime, Duration};
use chrono_tz::Tz;
use std::collections::HashSet;
use std::time::Instant;
use tracing::debug;

use crate::countdown;
use crate::error::{Result, TransitError};
use crate::models::{Arrival, ArrivalSource};
use crate::realtime::{FeedOutcome, RealtimeArrivalCandidate, RealtimeClient};
use crate::schedule::{ScheduledCandidate, StaticSnapshot};

pub const MAX_ARRIVALS: usize = 5;
pub const LOOK_AHEAD_HOURS: i64 = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum NextArrivals {
    Upcoming {
        arrivals: Vec<Arrival>,
        realtime_available: bool,
    },
    NoUpcomingService,
}

/// Range in which schedule-derived arrivals are kept, both ends inclusive.
///
/// The lower end sits on the latest live arrival so a scheduled run already
/// overtaken by live data does not come back as a near-term entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LookAheadWindow {
    pub lower: DateTime<Tz>,
    pub upper: DateTime<Tz>,
}

impl LookAheadWindow {
    pub fn new(realtime_sorted: &[Arrival], now: DateTime<Tz>, look_ahead: Duration) -> Self {
        Self {
            lower: realtime_sorted.last().map_or(now, |a| a.arrival_time),
            upper: now + look_ahead,
        }
    }

    pub fn contains(&self, instant: DateTime<Tz>) -> bool {
        self.lower <= instant && instant <= self.upper
    }
}

/// Whole minutes until `arrival`, never negative.
pub fn countdown_minutes(arrival: DateTime<Tz>, now: DateTime<Tz>) -> u64 {
    ((arrival - now).num_seconds().max(0) / 60) as u64
}

pub struct Reconciler {
    realtime: RealtimeClient,
    max_results: usize,
    look_ahead: Duration,
}

impl Reconciler {
    pub fn new(realtime: RealtimeClient) -> Self {
        Self {
            realtime,
            max_results: MAX_ARRIVALS,
            look_ahead: Duration::hours(LOOK_AHEAD_HOURS),
        }
    }

    /// Up to five arrivals at `stop_id`, soonest first.
    ///
    /// Blocks while the realtime feed is fetched; run it on a blocking worker.
    pub fn next_arrivals(
        &self,
        snapshot: &StaticSnapshot,
        stop_id: &str,
        now: DateTime<Tz>,
        deadline: Instant,
    ) -> Result<NextArrivals> {
        if snapshot.stop(stop_id).is_none() {
            return Err(TransitError::UnknownStop(stop_id.to_string()));
        }

        let outcome = self.realtime.fetch_trip_updates(stop_id, &now, deadline);
        Ok(self.reconcile(snapshot, stop_id, now, outcome))
    }

    pub fn reconcile(
        &self,
        snapshot: &StaticSnapshot,
        stop_id: &str,
        now: DateTime<Tz>,
        outcome: FeedOutcome,
    ) -> NextArrivals {
        let realtime_available = matches!(outcome, FeedOutcome::Live(_));

        let mut arrivals: Vec<Arrival> = match outcome {
            FeedOutcome::Live(candidates) => candidates
                .into_iter()
                .map(|c| realtime_arrival(snapshot, stop_id, c))
                .collect(),
            FeedOutcome::Degraded => Vec::new(),
        };
        arrivals.sort_by_key(|a| a.arrival_time);

        let window = LookAheadWindow::new(&arrivals, now, self.look_ahead);
        let live_count = arrivals.len();

        if live_count < self.max_results {
            let live_trips: HashSet<&str> = arrivals
                .iter()
                .map(|a| a.trip_id.as_str())
                .filter(|id| !id.is_empty())
                .collect();

            let mut scheduled: Vec<ScheduledCandidate<'_>> = snapshot
                .scheduled_at(stop_id, &now)
                .into_iter()
                .filter(|c| !live_trips.contains(c.trip.trip_id.as_str()))
                .filter(|c| window.contains(c.arrival_time))
                .collect();
            scheduled.sort_by_key(|c| c.arrival_time);

            arrivals.extend(
                scheduled
                    .into_iter()
                    .take(self.max_results - live_count)
                    .map(|c| scheduled_arrival(snapshot, stop_id, c)),
            );
        }

        arrivals.sort_by_key(|a| a.arrival_time);
        arrivals.truncate(self.max_results);

        for arrival in &mut arrivals {
            arrival.countdown_minutes = countdown_minutes(arrival.arrival_time, now);
            arrival.countdown_text = countdown::format(arrival.countdown_minutes, arrival.source);
        }

        debug!(
            stop_id,
            live = live_count,
            returned = arrivals.len(),
            realtime_available,
            "Reconciled arrivals"
        );

        if arrivals.is_empty() {
            NextArrivals::NoUpcomingService
        } else {
            NextArrivals::Upcoming { arrivals, realtime_available }
        }
    }
}

fn realtime_arrival(snapshot: &StaticSnapshot, stop_id: &str, candidate: RealtimeArrivalCandidate) -> Arrival {
    // Updates without a trip descriptor id match no trip
    let trip = Some(candidate.trip_id.as_str())
        .filter(|id| !id.is_empty())
        .and_then(|id| snapshot.trip(id));
    let route_id = candidate
        .route_id
        .or_else(|| trip.map(|t| t.route_id.clone()))
        .unwrap_or_default();

    Arrival {
        stop_id: stop_id.to_string(),
        route_name: snapshot.route_name(&route_id).to_string(),
        route_id,
        headsign: trip.map(|t| t.trip_headsign.clone()).unwrap_or_default(),
        trip_id: candidate.trip_id,
        arrival_time: candidate.arrival_time,
        source: ArrivalSource::Realtime,
        countdown_minutes: 0,
        countdown_text: String::new(),
    }
}

fn scheduled_arrival(snapshot: &StaticSnapshot, stop_id: &str, candidate: ScheduledCandidate<'_>) -> Arrival {
    let trip = candidate.trip;

    Arrival {
        stop_id: stop_id.to_string(),
        route_id: trip.route_id.clone(),
        route_name: snapshot.route_name(&trip.route_id).to_string(),
        headsign: trip.trip_headsign.clone(),
        trip_id: trip.trip_id.clone(),
        arrival_time: candidate.arrival_time,
        source: ArrivalSource::Scheduled,
        countdown_minutes: 0,
        countdown_text: String::new(),
    }
}
