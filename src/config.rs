// Command-line and environment configuration.

use chrono_tz::Tz;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::realtime::RetryPolicy;
use crate::schedule::{self, ScheduleConfig};

pub const DEFAULT_REALTIME_URL: &str = "https://opendata.hamilton.ca/GTFS-RT/GTFS_TripUpdates.pb";
pub const DEFAULT_STATIC_URL: &str = "https://opendata.hamilton.ca/GTFS-Static/Fall2024_GTFSstatic.zip";

#[derive(Parser, Debug, Clone)]
#[command(name = "next-bus")]
#[command(about = "Next bus arrivals from GTFS static schedules and GTFS-Realtime trip updates")]
pub struct Args {
    /// GTFS-Realtime trip updates feed
    #[arg(long, env = "GTFS_REALTIME_URL", default_value = DEFAULT_REALTIME_URL)]
    pub realtime_url: String,

    /// GTFS static zip archive
    #[arg(long, env = "GTFS_STATIC_URL", default_value = DEFAULT_STATIC_URL)]
    pub static_url: String,

    /// Agency timezone (IANA name)
    #[arg(long, env = "TZ", default_value = "America/Toronto", value_parser = parse_timezone)]
    pub timezone: Tz,

    #[arg(long, env = "AGENCY_NAME")]
    pub agency_name: Option<String>,

    #[arg(long, env = "AGENCY_LOGO_URL")]
    pub logo_url: Option<String>,

    /// Port to run the HTTP server on
    #[arg(short, long, env = "PORT", default_value = "5000")]
    pub port: u16,

    /// Where the downloaded static archive is kept
    #[arg(long, env = "GTFS_CACHE_PATH")]
    pub cache_path: Option<PathBuf>,

    #[arg(long, env = "GTFS_CACHE_MAX_AGE_HOURS", default_value = "24")]
    pub cache_max_age_hours: u64,

    #[arg(long, env = "GTFS_DOWNLOAD_TIMEOUT_SECS", default_value = "120")]
    pub download_timeout_secs: u64,

    /// How often the background task checks the static cache
    #[arg(long, env = "REFRESH_CHECK_INTERVAL_SECS", default_value = "3600")]
    pub refresh_check_interval_secs: u64,

    #[arg(long, env = "REALTIME_TIMEOUT_SECS", default_value = "15")]
    pub realtime_timeout_secs: u64,

    #[arg(long, env = "REALTIME_MAX_ATTEMPTS", default_value = "3", value_parser = clap::value_parser!(u32).range(1..))]
    pub realtime_max_attempts: u32,

    #[arg(long, env = "REALTIME_RETRY_DELAY_SECS", default_value = "5")]
    pub realtime_retry_delay_secs: u64,

    /// Upper bound on the realtime part of one query, retries included
    #[arg(long, env = "QUERY_DEADLINE_SECS", default_value = "30")]
    pub query_deadline_secs: u64,

    /// Directory holding manifest.json and service-worker.js
    #[arg(long, env = "STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,
}

impl Args {
    pub fn schedule_config(&self) -> ScheduleConfig {
        ScheduleConfig {
            static_url: self.static_url.clone(),
            cache_path: self.cache_path.clone().unwrap_or_else(schedule::default_cache_path),
            max_age: Duration::from_secs(self.cache_max_age_hours * 3600),
            download_timeout: Duration::from_secs(self.download_timeout_secs),
            retry_after: Duration::from_secs(self.refresh_check_interval_secs.min(300)),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.realtime_max_attempts,
            delay: Duration::from_secs(self.realtime_retry_delay_secs),
            attempt_timeout: Duration::from_secs(self.realtime_timeout_secs),
        }
    }

    pub fn refresh_check_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_check_interval_secs.max(1))
    }

    pub fn query_deadline(&self) -> Duration {
        Duration::from_secs(self.query_deadline_secs)
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, String> {
    name.parse::<Tz>()
        .map_err(|e| format!("Unknown timezone {:?}: {}", name, e))
}
