// Static GTFS schedule: archive parsing, on-disk cache and the shared snapshot.
//
// The raw zip is kept verbatim on disk; its modification time decides when the
// next download happens. Queries hold an `Arc<StaticSnapshot>` for their whole
// lifetime, and a refresh swaps in a new `Arc` without touching the old one.

use bytes::Bytes;
use chrono::{DateTime, Days, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};
use zip::ZipArchive;
use zip::result::ZipError;

use crate::error::{Result, TransitError};
use crate::fetch::Fetcher;
use crate::models::{Route, ScheduledStopTime, ServiceTime, Stop, Trip};

// ============================================================================
// GTFS time of day
// ============================================================================

impl ServiceTime {
    /// Parse `HH:MM:SS`, allowing hours of 24 and above.
    pub fn parse(time_str: &str) -> Result<Self> {
        let invalid = || TransitError::Dataset(format!("Invalid GTFS time: {:?}", time_str));

        let parts: Vec<&str> = time_str.trim().split(':').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }

        let hours: u32 = parts[0].parse().map_err(|_| invalid())?;
        let minutes: u32 = parts[1].parse().map_err(|_| invalid())?;
        let seconds: u32 = parts[2].parse().map_err(|_| invalid())?;

        if minutes >= 60 || seconds >= 60 {
            return Err(invalid());
        }

        Ok(Self { hours, minutes, seconds })
    }

    /// Split into `(extra_days, hour, minute, second)` with `hour < 24`.
    pub fn decompose(&self) -> (u32, u32, u32, u32) {
        (self.hours / 24, self.hours % 24, self.minutes, self.seconds)
    }

    /// Place this time on `base_date` (plus any extra days) in the agency timezone.
    ///
    /// Ambiguous local times (DST fall-back) take the earlier instant. Times
    /// inside a DST gap are shifted forward by one hour.
    pub fn resolve(&self, base_date: NaiveDate, tz: &Tz) -> Option<DateTime<Tz>> {
        let (extra_days, hour, minute, second) = self.decompose();
        let date = base_date.checked_add_days(Days::new(u64::from(extra_days)))?;
        let local = date.and_hms_opt(hour, minute, second)?;

        match tz.from_local_datetime(&local) {
            LocalResult::Single(dt) => Some(dt),
            LocalResult::Ambiguous(earliest, _) => Some(earliest),
            LocalResult::None => tz
                .from_local_datetime(&(local + chrono::Duration::hours(1)))
                .earliest(),
        }
    }
}

/// Resolve a GTFS time string against the local calendar day of `base_date`.
pub fn parse_static_time(time_str: &str, base_date: DateTime<Tz>) -> Result<DateTime<Tz>> {
    let time = ServiceTime::parse(time_str)?;
    time.resolve(base_date.date_naive(), &base_date.timezone())
        .ok_or_else(|| {
            TransitError::Dataset(format!(
                "GTFS time {} cannot be placed on {}",
                time_str,
                base_date.date_naive()
            ))
        })
}

// ============================================================================
// Archive rows
// ============================================================================

#[derive(Debug, Deserialize)]
struct StopTimeRow {
    trip_id: String,
    arrival_time: String,
    stop_id: String,
}

fn read_table<T: DeserializeOwned>(
    archive: &mut ZipArchive<Cursor<Bytes>>,
    name: &str,
) -> Result<Vec<T>> {
    let mut file = archive.by_name(name).map_err(|e| match e {
        ZipError::FileNotFound => {
            TransitError::Dataset(format!("{} not found in GTFS archive", name))
        }
        other => TransitError::Dataset(format!("Failed to open {}: {}", name, other)),
    })?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| TransitError::Dataset(format!("Failed to read {}: {}", name, e)))?;
    drop(file);

    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(contents.as_bytes());

    rdr.deserialize()
        .enumerate()
        .map(|(i, row)| {
            // +2: one for the header, one for 1-based line numbers
            row.map_err(|e| TransitError::Dataset(format!("{} line {}: {}", name, i + 2, e)))
        })
        .collect()
}

// ============================================================================
// Snapshot
// ============================================================================

/// A scheduled visit resolved to an absolute instant for one query.
#[derive(Debug, Clone)]
pub struct ScheduledCandidate<'a> {
    pub trip: &'a Trip,
    pub arrival_time: DateTime<Tz>,
}

#[derive(Debug)]
pub struct StaticSnapshot {
    pub stops: Vec<Stop>,
    /// stop_id -> position in `stops`
    pub stops_by_id: HashMap<String, usize>,
    /// route_id -> route_short_name
    pub routes: HashMap<String, String>,
    pub trips: HashMap<String, Trip>,
    /// File order of stop_times.txt
    pub stop_times: Vec<ScheduledStopTime>,
    stop_times_by_stop: HashMap<String, Vec<usize>>,
    pub loaded_at: DateTime<Utc>,
}

impl StaticSnapshot {
    pub fn from_records(
        stops: Vec<Stop>,
        routes: Vec<Route>,
        trips: Vec<Trip>,
        stop_times: Vec<ScheduledStopTime>,
        loaded_at: DateTime<Utc>,
    ) -> Self {
        let mut unique_stops = Vec::with_capacity(stops.len());
        let mut stops_by_id = HashMap::with_capacity(stops.len());
        for stop in stops {
            if stops_by_id.contains_key(&stop.stop_id) {
                warn!(stop_id = %stop.stop_id, "Duplicate stop_id in stops.txt, keeping the first row");
                continue;
            }
            stops_by_id.insert(stop.stop_id.clone(), unique_stops.len());
            unique_stops.push(stop);
        }

        let routes = routes
            .into_iter()
            .map(|r| (r.route_id, r.route_short_name))
            .collect();

        let trips = trips
            .into_iter()
            .map(|t| (t.trip_id.clone(), t))
            .collect();

        let mut stop_times_by_stop: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, st) in stop_times.iter().enumerate() {
            stop_times_by_stop.entry(st.stop_id.clone()).or_default().push(idx);
        }

        Self {
            stops: unique_stops,
            stops_by_id,
            routes,
            trips,
            stop_times,
            stop_times_by_stop,
            loaded_at,
        }
    }

    /// Parse the four required tables out of a GTFS zip.
    pub fn from_archive(bytes: Bytes, loaded_at: DateTime<Utc>) -> Result<Self> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| TransitError::Dataset(format!("Failed to open GTFS zip archive: {}", e)))?;

        let stops: Vec<Stop> = read_table(&mut archive, "stops.txt")?;
        let routes: Vec<Route> = read_table(&mut archive, "routes.txt")?;
        let trips: Vec<Trip> = read_table(&mut archive, "trips.txt")?;

        let mut stop_times = Vec::new();
        let mut untimed = 0usize;
        for row in read_table::<StopTimeRow>(&mut archive, "stop_times.txt")? {
            // Non-timepoint stops leave arrival_time empty
            if row.arrival_time.is_empty() {
                untimed += 1;
                continue;
            }
            stop_times.push(ScheduledStopTime {
                time_of_day: ServiceTime::parse(&row.arrival_time)?,
                trip_id: row.trip_id,
                stop_id: row.stop_id,
            });
        }

        info!(
            stops = stops.len(),
            routes = routes.len(),
            trips = trips.len(),
            stop_times = stop_times.len(),
            untimed,
            "Parsed GTFS static archive"
        );

        Ok(Self::from_records(stops, routes, trips, stop_times, loaded_at))
    }

    pub fn stop(&self, stop_id: &str) -> Option<&Stop> {
        self.stops_by_id.get(stop_id).map(|&idx| &self.stops[idx])
    }

    pub fn trip(&self, trip_id: &str) -> Option<&Trip> {
        self.trips.get(trip_id)
    }

    /// Short name for display, falling back to the raw id.
    pub fn route_name<'a>(&'a self, route_id: &'a str) -> &'a str {
        self.routes.get(route_id).map(String::as_str).unwrap_or(route_id)
    }

    /// Every scheduled visit to `stop_id`, placed on `now`'s local calendar day.
    ///
    /// Rows whose trip is unknown are skipped. File order is kept.
    pub fn scheduled_at(&self, stop_id: &str, now: &DateTime<Tz>) -> Vec<ScheduledCandidate<'_>> {
        let Some(indices) = self.stop_times_by_stop.get(stop_id) else {
            return Vec::new();
        };

        let base_date = now.date_naive();
        let tz = now.timezone();

        indices
            .iter()
            .filter_map(|&idx| {
                let stop_time = &self.stop_times[idx];
                let trip = self.trips.get(&stop_time.trip_id)?;
                let arrival_time = stop_time.time_of_day.resolve(base_date, &tz)?;
                Some(ScheduledCandidate { trip, arrival_time })
            })
            .collect()
    }

    /// Case-insensitive substring match on stop names, in file order.
    pub fn search_stops(&self, query: &str, limit: usize) -> Vec<&Stop> {
        let needle = query.to_lowercase();
        self.stops
            .iter()
            .filter(|s| s.stop_name.to_lowercase().contains(&needle))
            .take(limit)
            .collect()
    }
}

// ============================================================================
// Cache artifact
// ============================================================================

pub fn default_cache_path() -> PathBuf {
    let mut path = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("next_bus");
    path.push("gtfs_static.zip");
    path
}

/// True iff the cache file exists and is at most `max_age` old.
/// An age of exactly `max_age` is still valid.
pub fn is_cache_valid(path: &Path, now: SystemTime, max_age: Duration) -> bool {
    let Ok(modified) = fs::metadata(path).and_then(|m| m.modified()) else {
        return false;
    };

    // mtime in the future counts as brand new
    let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
    age <= max_age
}

fn write_cache(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| TransitError::File(format!("Failed to create {:?}: {}", parent, e)))?;
    }

    let tmp = path.with_extension("zip.tmp");
    fs::write(&tmp, bytes)
        .map_err(|e| TransitError::File(format!("Failed to write cache: {}", e)))?;
    fs::rename(&tmp, path)
        .map_err(|e| TransitError::File(format!("Failed to move cache into place: {}", e)))?;

    Ok(())
}

fn read_cache(path: &Path) -> Result<StaticSnapshot> {
    let bytes = fs::read(path)
        .map_err(|e| TransitError::File(format!("Failed to read cache {:?}: {}", path, e)))?;
    StaticSnapshot::from_archive(Bytes::from(bytes), Utc::now())
}

/// Download and parse the static dataset. Returns the raw archive alongside
/// the snapshot so the caller can persist it.
pub fn load(fetcher: &dyn Fetcher, url: &str, timeout: Duration) -> Result<(Bytes, StaticSnapshot)> {
    info!(url, "Downloading GTFS static data");
    let bytes = fetcher.get(url, timeout)?;
    info!(kb = bytes.len() / 1024, "Downloaded GTFS archive, extracting");

    let snapshot = StaticSnapshot::from_archive(bytes.clone(), Utc::now())?;
    Ok((bytes, snapshot))
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub static_url: String,
    pub cache_path: PathBuf,
    pub max_age: Duration,
    pub download_timeout: Duration,
    /// Minimum wait after a failed refresh before the next download attempt.
    pub retry_after: Duration,
}

#[derive(Debug, Default)]
struct RefreshState {
    last_failure: Option<Instant>,
}

pub struct ScheduleStore {
    config: ScheduleConfig,
    fetcher: Arc<dyn Fetcher>,
    current: RwLock<Option<Arc<StaticSnapshot>>>,
    refresh: Mutex<RefreshState>,
}

impl ScheduleStore {
    pub fn new(config: ScheduleConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            fetcher,
            current: RwLock::new(None),
            refresh: Mutex::new(RefreshState::default()),
        }
    }

    pub fn current(&self) -> Option<Arc<StaticSnapshot>> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_fresh(&self) -> bool {
        is_cache_valid(&self.config.cache_path, SystemTime::now(), self.config.max_age)
    }

    /// Snapshot for a request. Never waits on a download once data is in
    /// memory; expired data is refreshed by the background task.
    pub fn snapshot_for_query(&self) -> Result<Arc<StaticSnapshot>> {
        match self.current() {
            Some(snapshot) => Ok(snapshot),
            None => self.ensure_fresh(),
        }
    }

    /// Current snapshot, refreshed first when the cache artifact has expired.
    ///
    /// Only one refresh runs at a time. Callers arriving during a refresh get
    /// the snapshot already in memory; with nothing in memory they wait for it.
    pub fn ensure_fresh(&self) -> Result<Arc<StaticSnapshot>> {
        if let Some(snapshot) = self.current() {
            if self.is_fresh() {
                return Ok(snapshot);
            }
        }

        let mut state = match self.refresh.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => match self.current() {
                Some(snapshot) => {
                    debug!("GTFS refresh already in progress, serving current snapshot");
                    return Ok(snapshot);
                }
                None => self.refresh.lock().unwrap_or_else(|e| e.into_inner()),
            },
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };

        if let Some(snapshot) = self.current() {
            if self.is_fresh() {
                return Ok(snapshot);
            }
            let cooling_down = state
                .last_failure
                .is_some_and(|at| at.elapsed() < self.config.retry_after);
            if cooling_down {
                return Ok(snapshot);
            }
        }

        self.refresh_locked(&mut state)
    }

    fn refresh_locked(&self, state: &mut RefreshState) -> Result<Arc<StaticSnapshot>> {
        let path = &self.config.cache_path;

        if self.current().is_none() && self.is_fresh() {
            match read_cache(path) {
                Ok(snapshot) => {
                    info!(path = ?path, "Loaded GTFS static data from cache");
                    return Ok(self.install(snapshot));
                }
                Err(e) => warn!(error = %e, "Cached GTFS archive unusable, downloading"),
            }
        }

        match load(self.fetcher.as_ref(), &self.config.static_url, self.config.download_timeout) {
            Ok((bytes, snapshot)) => {
                match write_cache(path, &bytes) {
                    Ok(()) => {
                        info!(path = ?path, "GTFS cache saved");
                        state.last_failure = None;
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not save GTFS cache");
                        state.last_failure = Some(Instant::now());
                    }
                }
                Ok(self.install(snapshot))
            }
            Err(e) => {
                state.last_failure = Some(Instant::now());
                self.fall_back(e)
            }
        }
    }

    fn fall_back(&self, error: TransitError) -> Result<Arc<StaticSnapshot>> {
        if let Some(snapshot) = self.current() {
            warn!(error = %error, "GTFS refresh failed, keeping previous snapshot");
            return Ok(snapshot);
        }

        let path = &self.config.cache_path;
        if path.exists() {
            warn!(error = %error, path = ?path, "GTFS download failed, falling back to stale cache");
            return match read_cache(path) {
                Ok(snapshot) => Ok(self.install(snapshot)),
                Err(cache_error) => {
                    warn!(error = %cache_error, "Stale GTFS cache unusable");
                    Err(error)
                }
            };
        }

        Err(error)
    }

    fn install(&self, snapshot: StaticSnapshot) -> Arc<StaticSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        snapshot
    }
}
