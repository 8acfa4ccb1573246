use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

// ============================================================================
// Static schedule records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stop {
    pub stop_id: String,
    pub stop_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Route {
    pub route_id: String,
    pub route_short_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Trip {
    pub trip_id: String,
    pub route_id: String,
    pub trip_headsign: String,
}

/// One scheduled visit of a trip to a stop, straight from `stop_times.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledStopTime {
    pub trip_id: String,
    pub stop_id: String,
    pub time_of_day: ServiceTime,
}

/// A GTFS time of day. Hours may run past 24 for trips that cross midnight
/// (`25:30:00` is 01:30 on the following calendar day).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceTime {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

// ============================================================================
// Query results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalSource {
    Realtime,
    Scheduled,
}

impl ArrivalSource {
    pub fn label(self) -> &'static str {
        match self {
            ArrivalSource::Realtime => "Arriving",
            ArrivalSource::Scheduled => "Scheduled",
        }
    }

    pub fn is_realtime(self) -> bool {
        self == ArrivalSource::Realtime
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arrival {
    pub stop_id: String,
    pub route_id: String,
    pub route_name: String,
    pub headsign: String,
    pub trip_id: String,
    pub arrival_time: DateTime<Tz>,
    pub source: ArrivalSource,
    pub countdown_minutes: u64,
    pub countdown_text: String,
}
