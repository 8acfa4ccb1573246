// Helpers shared by the unit tests: in-memory GTFS archives, realtime feeds and
// a scripted `Fetcher`.

use bytes::Bytes;
use prost::Message;
use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use zip::write::FileOptions;

use crate::error::{Result, TransitError};
use crate::fetch::Fetcher;

pub fn build_archive(tables: &[(&str, &str)]) -> Bytes {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in tables {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    Bytes::from(writer.finish().unwrap().into_inner())
}

/// Three stops, two routes, three trips. Stop S1 is served by T1 (08:00),
/// T2 (08:30), T3 (25:10 on the previous service day).
pub fn sample_archive() -> Bytes {
    build_archive(&[
        (
            "stops.txt",
            "stop_id,stop_code,stop_name,stop_lat,stop_lon\n\
             S1,1001,King & James,43.2566,-79.8690\n\
             S2,1002,James & Main,43.2551,-79.8695\n\
             S3,1003,Mountain Terminal,43.2300,-79.8800\n",
        ),
        (
            "routes.txt",
            "route_id,agency_id,route_short_name,route_long_name,route_type\n\
             R1,HSR,1,King,3\n\
             R5,HSR,5,Delaware,3\n",
        ),
        (
            "trips.txt",
            "route_id,service_id,trip_id,trip_headsign,direction_id\n\
             R1,WK,T1,Eastgate,0\n\
             R1,WK,T2,University,1\n\
             R5,WK,T3,Jones,0\n",
        ),
        (
            "stop_times.txt",
            "trip_id,arrival_time,departure_time,stop_id,stop_sequence\n\
             T1,08:00:00,08:00:00,S1,1\n\
             T1,08:10:00,08:10:00,S2,2\n\
             T2,08:30:00,08:30:00,S1,1\n\
             T3,25:10:00,25:10:00,S1,1\n",
        ),
    ])
}

/// One `(trip_id, route_id, stop_id, arrival epoch seconds)` per stop-time update.
pub fn build_feed(updates: &[(&str, Option<&str>, &str, i64)]) -> Bytes {
    let entity = updates
        .iter()
        .enumerate()
        .map(|(i, (trip_id, route_id, stop_id, time))| gtfs_rt::FeedEntity {
            id: format!("e{}", i),
            trip_update: Some(gtfs_rt::TripUpdate {
                trip: gtfs_rt::TripDescriptor {
                    trip_id: Some(trip_id.to_string()),
                    route_id: route_id.map(str::to_string),
                    ..Default::default()
                },
                stop_time_update: vec![gtfs_rt::trip_update::StopTimeUpdate {
                    stop_id: Some(stop_id.to_string()),
                    arrival: Some(gtfs_rt::trip_update::StopTimeEvent {
                        time: Some(*time),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    let feed = gtfs_rt::FeedMessage {
        header: gtfs_rt::FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            ..Default::default()
        },
        entity,
    };

    Bytes::from(feed.encode_to_vec())
}

/// A unique path under the system temp directory, removed if it already exists.
pub fn temp_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("next_bus_test_{}_{}", std::process::id(), name));
    let _ = std::fs::remove_file(&path);
    path
}

/// Replays canned responses in order; the last one repeats forever.
pub struct ScriptedFetcher {
    responses: Mutex<VecDeque<std::result::Result<Bytes, &'static str>>>,
    calls: AtomicUsize,
    latency: Duration,
}

impl ScriptedFetcher {
    pub fn new(responses: Vec<std::result::Result<Bytes, &'static str>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    pub fn always(response: std::result::Result<Bytes, &'static str>) -> Self {
        Self::new(vec![response])
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for ScriptedFetcher {
    fn get(&self, _url: &str, _timeout: Duration) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.latency);

        let mut responses = self.responses.lock().unwrap();
        let response = if responses.len() > 1 {
            responses.pop_front().unwrap()
        } else {
            responses.front().cloned().unwrap()
        };

        response.map_err(|msg| TransitError::Download(msg.to_string()))
    }
}
