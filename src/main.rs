//! station-monitor: keeps weather station data fresh.
//!
//! Single-binary Tokio application that:
//! 1. Refreshes every active station on a persistent per-station timer
//! 2. Shares and throttles requests to the station API
//! 3. Maintains merged daily windows for charts and daily statistics
//! 4. Sheds cached and background work under memory pressure

mod config;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common::{MonitorConfig, StationId, TaskPriority};
use refresh_core::cache::{
    chart_point_cache, daily_stats_cache, history_cache, observation_cache, ChartPointCache,
    DailyStatsCache,
};
use refresh_core::{
    ChartService, ChartShape, CoordinatorSettings, DailyStatsService, HistoricalMergeEngine,
    HistorySpan, JsonTimestampExtractor, MemoryPressureMonitor, PersistentIntervalScheduler,
    PriorityTaskScheduler, ProcessMemorySampler, RequestCoordinator, StatKind,
};
use station_client::StationClient;

/// Weather station monitor
#[derive(Parser)]
#[command(name = "station-monitor", about = "Weather station data refresher")]
struct Cli {
    /// Validate configuration, print the tracked stations, then exit.
    #[arg(long)]
    check_config: bool,

    /// Run one forced refresh of every active station and exit.
    #[arg(long)]
    once: bool,
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Chart drawn in the heartbeat summary.
const SUMMARY_CHART_HOURS: i64 = 24;
const SUMMARY_CHART_POINTS: usize = 96;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "station_monitor=info,refresh_core=info,station_client=info".into()
            }),
        )
        .with_target(true)
        .init();

    info!("Station Monitor starting...");

    let cfg = match config::load_config() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // ── Check-config mode ────────────────────────────────────────────
    if cli.check_config {
        info!("Configuration OK");
        for station in &cfg.stations {
            info!(
                "  → {} {} ({})",
                station.id,
                if station.name.is_empty() { "-" } else { station.name.as_str() },
                if station.active { "active" } else { "inactive" }
            );
        }
        return;
    }

    // ── Shared state ─────────────────────────────────────────────────
    let observations = Arc::new(observation_cache(
        cfg.cache.observation_budget_bytes,
        cfg.cache.observation_max_items,
    ));
    let history = Arc::new(history_cache(
        cfg.cache.history_budget_bytes,
        cfg.cache.history_max_items,
    ));
    let chart_points = Arc::new(chart_point_cache(
        cfg.cache.chart_budget_bytes,
        cfg.cache.chart_max_items,
    ));
    let daily_stats = Arc::new(daily_stats_cache(
        cfg.cache.daily_stats_budget_bytes,
        cfg.cache.daily_stats_max_items,
    ));

    let client = match StationClient::new(&cfg.endpoint) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Station client initialization failed: {}", e);
            std::process::exit(1);
        }
    };

    let scheduler = PriorityTaskScheduler::new(cfg.tasks.max_parallelism);
    let coordinator = RequestCoordinator::new(
        client,
        Arc::new(JsonTimestampExtractor::default()),
        CoordinatorSettings::from_config(&cfg),
        observations.clone(),
        history.clone(),
        HistoricalMergeEngine::from_config(&cfg.history),
    );
    coordinator.sync_stations(&cfg.stations);

    let charts = Arc::new(ChartService::new(chart_points.clone(), scheduler.clone()));
    let stats = Arc::new(DailyStatsService::from_config(
        daily_stats.clone(),
        scheduler.clone(),
        &cfg.history,
    ));

    let monitor = Arc::new(MemoryPressureMonitor::from_config(
        Arc::new(ProcessMemorySampler::new()),
        &cfg.pressure,
    ));
    monitor.add_listener(observations.clone());
    monitor.add_listener(history.clone());
    monitor.add_listener(chart_points.clone());
    monitor.add_listener(daily_stats.clone());
    monitor.add_listener(Arc::new(coordinator.clone()));
    monitor.add_listener(Arc::new(scheduler.clone()));

    let active = cfg.active_stations();
    info!(
        "Tracking {} active of {} configured stations, refresh every {}s",
        active.len(),
        cfg.stations.len(),
        cfg.schedule.refresh_interval_secs
    );

    // ── Once mode ────────────────────────────────────────────────────
    if cli.once {
        info!("Running single forced refresh...");
        refresh_all(&coordinator, &active, true).await;
        for station in &active {
            log_station_summary(&coordinator, &charts, &stats, &cfg, station).await;
        }
        return;
    }

    // ── Spawn tasks ──────────────────────────────────────────────────
    let shutdown = CancellationToken::new();

    // Task 1: Memory pressure sampling
    let monitor_handle = tokio::spawn(monitor.clone().run(shutdown.clone()));

    // Task 2: Initial load, then per-station timers
    refresh_all(&coordinator, &active, false).await;
    let intervals =
        PersistentIntervalScheduler::from_config(Arc::new(coordinator.clone()), &cfg.schedule);
    for station in &active {
        intervals.start_tracking(station.clone(), None);
    }

    // Task 3: Daily windows and auxiliary series
    let daily_coordinator = coordinator.clone();
    let daily_stations = active.clone();
    let daily_every = Duration::from_secs(cfg.history.daily_max_age_secs.max(60));
    let daily_shutdown = shutdown.clone();
    let daily_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(daily_every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut cycle: u64 = 0;

        loop {
            tokio::select! {
                _ = daily_shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }
            for station in &daily_stations {
                if let Err(e) = daily_coordinator
                    .refresh_history(station, HistorySpan::Daily, false)
                    .await
                {
                    warn!("{}: daily history refresh failed: {}", station, e);
                }
                // The auxiliary series changes slowly; refresh it every 6th cycle.
                if cycle % 6 == 0 {
                    if let Err(e) = daily_coordinator.refresh_auxiliary(station).await {
                        warn!("{}: auxiliary refresh failed: {}", station, e);
                    }
                }
            }
            cycle = cycle.saturating_add(1);
        }
    });

    // Task 4: Heartbeat
    let hb_coordinator = coordinator.clone();
    let hb_scheduler = scheduler.clone();
    let hb_charts = charts.clone();
    let hb_stats = stats.clone();
    let hb_chart_cache: Arc<ChartPointCache> = chart_points.clone();
    let hb_stats_cache: Arc<DailyStatsCache> = daily_stats.clone();
    let hb_cfg = cfg.clone();
    let hb_stations = active.clone();
    let hb_shutdown = shutdown.clone();
    let heartbeat_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = hb_shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }
            let diag = hb_coordinator.diagnostics();
            let tasks = hb_scheduler.snapshot();
            info!(
                "HEARTBEAT: stations={} ceiling={}/{} in_flight={} pending={} shared={} pressure={} tasks_running={} tasks_pending={} charts={} daily_stats={}",
                diag.stations,
                diag.concurrency_ceiling,
                diag.max_concurrency,
                diag.in_flight,
                diag.pending,
                diag.shared_requests,
                diag.pressure,
                tasks.running,
                tasks.pending,
                hb_chart_cache.len(),
                hb_stats_cache.len()
            );
            if let Some(warning) = &diag.rate_limit_warning {
                warn!("HEARTBEAT: {}", warning);
            }
            for station in &hb_stations {
                log_station_summary(&hb_coordinator, &hb_charts, &hb_stats, &hb_cfg, station)
                    .await;
            }
        }
    });

    // ── Wait for shutdown ────────────────────────────────────────────
    info!("Station Monitor is running. Press Ctrl+C to stop.");

    let shutdown_reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            "ctrl_c"
        }
        r = daily_handle => {
            error!("Daily history task exited: {:?}", r);
            "daily_task_exit"
        }
        r = heartbeat_handle => {
            error!("Heartbeat task exited: {:?}", r);
            "heartbeat_task_exit"
        }
    };

    intervals.shutdown();
    shutdown.cancel();
    if let Err(e) = monitor_handle.await {
        warn!("Pressure monitor did not stop cleanly: {}", e);
    }

    info!("Station Monitor shut down ({}).", shutdown_reason);
}

// ── Task implementations ────────────────────────────────────────────

async fn refresh_all(coordinator: &RequestCoordinator, stations: &[StationId], force: bool) {
    let report = coordinator.refresh_batch(stations, force).await;
    info!(
        "Batch: fetched={} failed={} fresh={} in_flight={} ceiling={}",
        report.fetched.len(),
        report.failed.len(),
        report.skipped_fresh.len(),
        report.skipped_in_flight.len(),
        report.ceiling
    );
    for (station, err) in &report.failed {
        warn!("{}: refresh failed: {}", station, err);
    }
    if report.skipped_for_pressure {
        warn!("Batch skipped under critical memory pressure");
    }

    for station in stations {
        if let Err(e) = coordinator
            .refresh_history(station, HistorySpan::Daily, force)
            .await
        {
            warn!("{}: daily history refresh failed: {}", station, e);
        }
    }
}

async fn log_station_summary(
    coordinator: &RequestCoordinator,
    charts: &ChartService,
    stats: &DailyStatsService,
    cfg: &MonitorConfig,
    station: &StationId,
) {
    let series = cfg.history.temperature_series.as_str();
    let now = Utc::now();
    let current = coordinator.observation(station).and_then(|obs| {
        obs.payload
            .get("lastData")
            .and_then(|data| data.get(series))
            .or_else(|| obs.payload.get(series))
            .and_then(|v| v.as_f64())
    });
    let daily = coordinator.history_window(station);

    let high = stats
        .statistic(station, StatKind::High, daily.clone(), current, now)
        .await;
    let low = stats
        .statistic(station, StatKind::Low, daily.clone(), current, now)
        .await;

    let points = match &daily {
        Some(window) => {
            let until = window.latest_timestamp().unwrap_or(now);
            let shape = ChartShape::new(
                chrono::Duration::hours(SUMMARY_CHART_HOURS),
                SUMMARY_CHART_POINTS,
                until,
            );
            charts
                .points(window.clone(), series, shape, TaskPriority::Low)
                .await
                .len()
        }
        None => 0,
    };

    let fmt_stat = |stat: &Option<refresh_core::DailyStatistic>| match stat {
        Some(s) if s.estimated => format!("~{:.1}", s.value),
        Some(s) => format!("{:.1}", s.value),
        None => "-".into(),
    };
    info!(
        "  {} current={} high={} low={} chart_points={} updated={} error={} history_error={}",
        station,
        current.map_or_else(|| "-".to_string(), |v| format!("{v:.1}")),
        fmt_stat(&high),
        fmt_stat(&low),
        points,
        coordinator
            .last_updated(station)
            .map_or_else(|| "never".to_string(), |t| t.to_rfc3339()),
        coordinator.error_for(station).unwrap_or_else(|| "none".into()),
        coordinator.history_error_for(station).unwrap_or_else(|| "none".into())
    );
}
