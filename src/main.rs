// Next bus arrival server with embedded frontend
// Static GTFS schedule + GTFS-Realtime trip updates behind a small JSON API

use actix_cors::Cors;
use actix_files::NamedFile;
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::{error, info, warn};

mod arrivals;
mod clock;
mod config;
mod countdown;
mod error;
mod fetch;
mod models;
mod realtime;
mod schedule;
#[cfg(test)]
mod test_support;

use arrivals::{NextArrivals, Reconciler};
use clock::{Clock, SystemClock};
use config::Args;
use error::TransitError;
use fetch::{Fetcher, HttpFetcher};
use models::Arrival;
use realtime::RealtimeClient;
use schedule::{ScheduleStore, StaticSnapshot};

// Embed the page at compile time
const INDEX_HTML: &str = include_str!("../static/index.html");

const MAX_SUGGESTIONS: usize = 10;
const DEFAULT_AGENCY_NAME: &str = "Next Bus";

#[derive(Clone)]
struct AppState {
    store: Arc<ScheduleStore>,
    reconciler: Arc<Reconciler>,
    clock: Arc<dyn Clock>,
    agency_name: Arc<str>,
    logo_url: Arc<str>,
    static_dir: Arc<PathBuf>,
    query_deadline: Duration,
}

impl AppState {
    /// Resolve the snapshot and reconcile arrivals. Blocks on network I/O.
    fn lookup(&self, stop_id: &str) -> error::Result<(Arc<StaticSnapshot>, NextArrivals)> {
        let snapshot = self.store.snapshot_for_query()?;
        let now = self.clock.now();
        let deadline = Instant::now() + self.query_deadline;
        let arrivals = self.reconciler.next_arrivals(&snapshot, stop_id, now, deadline)?;
        Ok((snapshot, arrivals))
    }
}

#[derive(Serialize)]
struct BusView {
    route_id: String,
    route_name: String,
    trip_headsign: String,
    arrival_time: String,
    arrival_time_formatted: String,
    arrival_type: &'static str,
    is_realtime: bool,
    countdown: u64,
    countdown_text: String,
}

impl From<Arrival> for BusView {
    fn from(arrival: Arrival) -> Self {
        BusView {
            arrival_time: arrival.arrival_time.to_rfc3339(),
            arrival_time_formatted: arrival.arrival_time.format("%I:%M %p").to_string(),
            arrival_type: arrival.source.label(),
            is_realtime: arrival.source.is_realtime(),
            countdown: arrival.countdown_minutes,
            countdown_text: arrival.countdown_text,
            route_id: arrival.route_id,
            route_name: arrival.route_name,
            trip_headsign: arrival.headsign,
        }
    }
}

#[derive(Serialize)]
struct NextBusResponse {
    buses: Vec<BusView>,
    stop_name: String,
    stop_id: String,
    realtime_available: bool,
}

#[derive(Deserialize)]
struct StopQuery {
    stop_id: Option<String>,
}

#[derive(Deserialize)]
struct AutocompleteQuery {
    #[serde(default)]
    q: String,
}

fn error_body(message: &str) -> serde_json::Value {
    serde_json::json!({ "error": message })
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn render_index(agency_name: &str, logo_url: &str, stop_id: &str) -> String {
    let logo = if logo_url.is_empty() {
        String::new()
    } else {
        format!("<img src=\"{}\" alt=\"\">", escape_html(logo_url))
    };

    INDEX_HTML
        .replace("{{logo}}", &logo)
        .replace("{{agency_name}}", &escape_html(agency_name))
        .replace("{{stop_id}}", &escape_html(stop_id))
}

// ============================================================================
// Frontend Routes
// ============================================================================

async fn serve_index(state: web::Data<AppState>, query: web::Query<StopQuery>) -> HttpResponse {
    let stop_id = query.into_inner().stop_id.unwrap_or_default();

    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(render_index(&state.agency_name, &state.logo_url, &stop_id))
}

async fn serve_manifest(state: web::Data<AppState>) -> actix_web::Result<NamedFile> {
    Ok(NamedFile::open(state.static_dir.join("manifest.json"))?)
}

async fn serve_service_worker(state: web::Data<AppState>) -> actix_web::Result<NamedFile> {
    Ok(NamedFile::open(state.static_dir.join("service-worker.js"))?)
}

// ============================================================================
// API Endpoints
// ============================================================================

async fn next_bus(state: web::Data<AppState>, query: web::Query<StopQuery>) -> HttpResponse {
    let Some(stop_id) = query.into_inner().stop_id.filter(|id| !id.is_empty()) else {
        return HttpResponse::BadRequest().json(error_body("No stop selected"));
    };

    let state = state.get_ref().clone();
    let task_stop_id = stop_id.clone();
    let lookup = tokio::task::spawn_blocking(move || state.lookup(&task_stop_id)).await;

    match lookup {
        Ok(Ok((snapshot, NextArrivals::Upcoming { arrivals, realtime_available }))) => {
            let stop_name = snapshot
                .stop(&stop_id)
                .map(|s| s.stop_name.clone())
                .unwrap_or_default();
            info!(stop_id = %stop_id, buses = arrivals.len(), realtime_available, "Next bus served");

            HttpResponse::Ok().json(NextBusResponse {
                buses: arrivals.into_iter().map(BusView::from).collect(),
                stop_name,
                stop_id,
                realtime_available,
            })
        }
        Ok(Ok((_, NextArrivals::NoUpcomingService))) => {
            info!(stop_id = %stop_id, "No upcoming service");
            HttpResponse::Ok().json(serde_json::json!({
                "error": "No upcoming buses found for this stop.",
                "stop_id": stop_id,
            }))
        }
        Ok(Err(TransitError::UnknownStop(_))) => {
            warn!(stop_id = %stop_id, "Invalid stop requested");
            HttpResponse::BadRequest().json(error_body("Invalid stop ID"))
        }
        Ok(Err(e)) => {
            error!(error = %e, stop_id = %stop_id, "Next bus lookup failed");
            HttpResponse::ServiceUnavailable().json(error_body("Schedule data is unavailable"))
        }
        Err(e) => {
            error!(error = %e, "Next bus task panicked");
            HttpResponse::InternalServerError().json(error_body("Lookup task failed"))
        }
    }
}

async fn autocomplete(state: web::Data<AppState>, query: web::Query<AutocompleteQuery>) -> HttpResponse {
    let Some(snapshot) = state.store.current() else {
        return HttpResponse::Ok().json(Vec::<models::Stop>::new());
    };

    HttpResponse::Ok().json(snapshot.search_stops(&query.q, MAX_SUGGESTIONS))
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let Some(snapshot) = state.store.current() else {
        return HttpResponse::ServiceUnavailable().json(serde_json::json!({ "status": "loading" }));
    };

    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "next-bus",
        "version": env!("CARGO_PKG_VERSION"),
        "stops": snapshot.stops.len(),
        "routes": snapshot.routes.len(),
        "trips": snapshot.trips.len(),
        "stop_times": snapshot.stop_times.len(),
        "loaded_at": snapshot.loaded_at.to_rfc3339(),
        "cache_fresh": state.store.is_fresh(),
    }))
}

// ============================================================================
// Background Task
// ============================================================================

async fn schedule_refresh_task(store: Arc<ScheduleStore>, every: Duration) {
    let mut interval = time::interval(every);
    // The first tick completes immediately and startup has just loaded the data
    interval.tick().await;

    loop {
        interval.tick().await;

        let store = store.clone();
        match tokio::task::spawn_blocking(move || store.ensure_fresh()).await {
            Ok(Ok(snapshot)) => {
                info!(loaded_at = %snapshot.loaded_at, "Static schedule check complete");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Static schedule refresh failed");
            }
            Err(e) => {
                error!(error = %e, "Static schedule refresh task panicked");
            }
        }
    }
}

// ============================================================================
// Server Setup
// ============================================================================

fn build_state(args: &Args, store: Arc<ScheduleStore>, fetcher: Arc<dyn Fetcher>) -> AppState {
    let realtime = RealtimeClient::new(fetcher, args.realtime_url.clone(), args.retry_policy());

    AppState {
        store,
        reconciler: Arc::new(Reconciler::new(realtime)),
        clock: Arc::new(SystemClock::new(args.timezone)),
        agency_name: args.agency_name.as_deref().unwrap_or(DEFAULT_AGENCY_NAME).into(),
        logo_url: args.logo_url.as_deref().unwrap_or_default().into(),
        static_dir: Arc::new(args.static_dir.clone()),
        query_deadline: args.query_deadline(),
    }
}

fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(serve_index))
        .route("/next-bus", web::get().to(next_bus))
        .route("/autocomplete", web::get().to(autocomplete))
        .route("/manifest.json", web::get().to(serve_manifest))
        .route("/service-worker.js", web::get().to(serve_service_worker))
        .route("/health", web::get().to(health_check));
}

async fn run_server(args: Args, store: Arc<ScheduleStore>, fetcher: Arc<dyn Fetcher>) -> std::io::Result<()> {
    let app_state = build_state(&args, store.clone(), fetcher);

    let refresh_every = args.refresh_check_interval();
    tokio::spawn(async move {
        schedule_refresh_task(store, refresh_every).await;
    });

    info!(
        port = args.port,
        realtime_url = %args.realtime_url,
        refresh_every_secs = refresh_every.as_secs(),
        "Server listening on http://0.0.0.0:{}",
        args.port
    );

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(configure_routes)
    })
        .bind(("0.0.0.0", args.port))?
        .run()
        .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), timezone = %args.timezone, "Starting next-bus server");

    let fetcher: Arc<dyn Fetcher> = match HttpFetcher::new() {
        Ok(fetcher) => Arc::new(fetcher),
        Err(e) => {
            error!(error = %e, "Failed to build HTTP client");
            std::process::exit(1);
        }
    };

    let store = Arc::new(ScheduleStore::new(args.schedule_config(), fetcher.clone()));

    match store.ensure_fresh() {
        Ok(snapshot) => {
            info!(
                stops = snapshot.stops.len(),
                trips = snapshot.trips.len(),
                loaded_at = %snapshot.loaded_at,
                "Static schedule ready"
            );
        }
        Err(e) => {
            error!(error = %e, static_url = %args.static_url, "Server cannot start without static schedule data");
            std::process::exit(1);
        }
    }

    actix_web::rt::System::new().block_on(run_server(args, store, fetcher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ArrivalSource;
    use crate::realtime::RetryPolicy;
    use crate::schedule::ScheduleConfig;
    use crate::test_support::{ScriptedFetcher, build_feed, sample_archive, temp_path};
    use actix_web::test;
    use chrono::{DateTime, TimeZone};
    use chrono_tz::America::Toronto;
    use chrono_tz::Tz;

    struct FixedClock(DateTime<Tz>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Tz> {
            self.0
        }
    }

    fn morning() -> DateTime<Tz> {
        Toronto.with_ymd_and_hms(2024, 5, 14, 7, 55, 0).unwrap()
    }

    fn app_state(cache_name: &str, feed: Arc<ScriptedFetcher>) -> AppState {
        let store = ScheduleStore::new(
            ScheduleConfig {
                static_url: "http://example.test/gtfs.zip".to_string(),
                cache_path: temp_path(cache_name),
                max_age: Duration::from_secs(3600),
                download_timeout: Duration::from_secs(5),
                retry_after: Duration::from_secs(60),
            },
            Arc::new(ScriptedFetcher::always(Ok(sample_archive()))),
        );
        let realtime = RealtimeClient::new(
            feed,
            "http://example.test/TripUpdates.pb",
            RetryPolicy {
                max_attempts: 2,
                delay: Duration::ZERO,
                attempt_timeout: Duration::from_secs(1),
            },
        );

        AppState {
            store: Arc::new(store),
            reconciler: Arc::new(Reconciler::new(realtime)),
            clock: Arc::new(FixedClock(morning())),
            agency_name: "HSR".into(),
            logo_url: "".into(),
            static_dir: Arc::new(PathBuf::from("static")),
            query_deadline: Duration::from_secs(5),
        }
    }

    #[::core::prelude::v1::test]
    fn test_bus_view_fields() {
        let arrival = Arrival {
            stop_id: "S1".to_string(),
            route_id: "R1".to_string(),
            route_name: "1".to_string(),
            headsign: "Eastgate".to_string(),
            trip_id: "T1".to_string(),
            arrival_time: Toronto.with_ymd_and_hms(2024, 5, 14, 13, 5, 0).unwrap(),
            source: ArrivalSource::Scheduled,
            countdown_minutes: 12,
            countdown_text: "Scheduled in 12 minutes".to_string(),
        };

        let view = BusView::from(arrival);
        assert_eq!(view.arrival_time, "2024-05-14T13:05:00-04:00");
        assert_eq!(view.arrival_time_formatted, "01:05 PM");
        assert_eq!(view.arrival_type, "Scheduled");
        assert!(!view.is_realtime);
        assert_eq!(view.trip_headsign, "Eastgate");
        assert_eq!(view.countdown, 12);
    }

    #[::core::prelude::v1::test]
    fn test_render_index_escapes_values() {
        let html = render_index("Bus & Co", "", "<S1>");
        assert!(html.contains("Bus &amp; Co"));
        assert!(html.contains("&lt;S1&gt;"));
        assert!(!html.contains("{{agency_name}}"));
        assert!(!html.contains("{{stop_id}}"));
        assert!(!html.contains("<img"));

        let html = render_index("HSR", "https://example.test/logo.png?a=1&b=2", "");
        assert!(html.contains(r#"<img src="https://example.test/logo.png?a=1&amp;b=2" alt="">"#));
        assert!(!html.contains("{{logo}}"));
    }

    #[::core::prelude::v1::test]
    fn test_lookup_does_not_wait_for_expired_schedule() {
        let cache_path = temp_path("routes_stale.zip");
        std::fs::write(&cache_path, sample_archive()).unwrap();
        let static_fetcher = Arc::new(
            ScriptedFetcher::always(Ok(sample_archive())).with_latency(Duration::from_secs(3)),
        );
        let store = ScheduleStore::new(
            ScheduleConfig {
                static_url: "http://example.test/gtfs.zip".to_string(),
                cache_path: cache_path.clone(),
                max_age: Duration::from_secs(3600),
                download_timeout: Duration::from_secs(5),
                retry_after: Duration::from_secs(60),
            },
            static_fetcher.clone(),
        );
        store.ensure_fresh().unwrap();
        let stale = std::fs::File::options().write(true).open(&cache_path).unwrap();
        stale.set_modified(std::time::SystemTime::now() - Duration::from_secs(7200)).unwrap();
        assert!(!store.is_fresh());

        let mut state = app_state("routes_stale_unused.zip", Arc::new(ScriptedFetcher::always(Ok(build_feed(&[])))));
        state.store = Arc::new(store);
        state.query_deadline = Duration::from_secs(1);

        let started = Instant::now();
        let (snapshot, arrivals) = state.lookup("S1").unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(static_fetcher.calls(), 0);
        assert_eq!(snapshot.stops.len(), 3);
        assert!(matches!(arrivals, NextArrivals::Upcoming { .. }));

        std::fs::remove_file(&cache_path).unwrap();
    }

    #[actix_web::test]
    async fn test_next_bus_rejects_missing_and_unknown_stop() {
        let feed = Arc::new(ScriptedFetcher::always(Ok(build_feed(&[]))));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state("routes_reject.zip", feed.clone())))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/next-bus").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "No stop selected");

        let req = test::TestRequest::get().uri("/next-bus?stop_id=nonexistent-id").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "Invalid stop ID");

        assert_eq!(feed.calls(), 0);
    }

    #[actix_web::test]
    async fn test_next_bus_merges_live_and_scheduled() {
        let live_at = Toronto.with_ymd_and_hms(2024, 5, 14, 8, 2, 0).unwrap().timestamp();
        let feed = Arc::new(ScriptedFetcher::always(Ok(build_feed(&[("T1", Some("R1"), "S1", live_at)]))));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state("routes_merge.zip", feed)))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/next-bus?stop_id=S1").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["stop_name"], "King & James");
        assert_eq!(body["realtime_available"], true);
        let buses = body["buses"].as_array().unwrap();
        assert_eq!(buses.len(), 2);
        assert_eq!(buses[0]["route_name"], "1");
        assert_eq!(buses[0]["is_realtime"], true);
        assert_eq!(buses[0]["countdown_text"], "Arriving in 7 minutes");
        assert_eq!(buses[0]["arrival_time_formatted"], "08:02 AM");
        assert_eq!(buses[1]["trip_headsign"], "University");
        assert_eq!(buses[1]["arrival_type"], "Scheduled");
        assert_eq!(buses[1]["countdown"], 35);
    }

    #[actix_web::test]
    async fn test_next_bus_without_service_and_autocomplete() {
        let feed = Arc::new(ScriptedFetcher::always(Err("offline")));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state("routes_empty.zip", feed)))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/next-bus?stop_id=S3").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "No upcoming buses found for this stop.");
        assert_eq!(body["stop_id"], "S3");

        let req = test::TestRequest::get().uri("/autocomplete?q=JAMES").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        let names: Vec<&str> = body.as_array().unwrap().iter().map(|s| s["stop_name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["King & James", "James & Main"]);
    }
}
