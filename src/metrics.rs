//! Hourly request counters and their aggregation into statistics
//!
//! The collector keeps one bucket per wall-clock hour (UTC) and appends the
//! bucket's running totals to an append-only log after every update, one line
//! per update: `YYYY-MM-DD HH:00 - REQUESTS, ERRORS`. The aggregator wakes on
//! each hour boundary and persists every bucket older than the current hour.
//! A request stamped in an hour that was already persisted counts toward the
//! first open hour, so a persisted hour never changes again.

use crate::db::Database;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Timelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const HOUR_FORMAT: &str = "%Y-%m-%d %H:00";
const REPLAY_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HourBucket {
    pub requests: u64,
    pub errors: u64,
}

/// One hour of counters as read back from the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsEntry {
    pub hour: NaiveDateTime,
    pub requests: u64,
    pub errors: u64,
}

/// Start of the hour containing `ts`
pub fn truncate_to_hour(ts: DateTime<Utc>) -> NaiveDateTime {
    let naive = ts.naive_utc();
    naive
        .date()
        .and_hms_opt(naive.hour(), 0, 0)
        .unwrap_or(naive)
}

pub fn hour_key(hour: NaiveDateTime) -> String {
    hour.format(HOUR_FORMAT).to_string()
}

/// Parse one log line; `None` for anything malformed
pub fn parse_line(line: &str) -> Option<MetricsEntry> {
    let (key, counts) = line.trim().split_once(" - ")?;
    let hour = NaiveDateTime::parse_from_str(key, "%Y-%m-%d %H:%M").ok()?;
    let (requests, errors) = counts.split_once(',')?;
    Some(MetricsEntry {
        hour,
        requests: requests.trim().parse().ok()?,
        errors: errors.trim().parse().ok()?,
    })
}

struct CollectorState {
    buckets: BTreeMap<NaiveDateTime, HourBucket>,
    /// Latest hour persisted and dropped from `buckets`
    flushed_through: Option<NaiveDateTime>,
    log: File,
}

/// Per-hour request and error counters backed by the metrics log
pub struct MetricsCollector {
    state: Mutex<CollectorState>,
    log_path: PathBuf,
}

fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options.open(path)
}

fn read_log(path: &Path) -> std::io::Result<Vec<MetricsEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        match parse_line(&line) {
            Some(entry) => entries.push(entry),
            None if line.trim().is_empty() => {}
            None => warn!(line = %line, "Skipping malformed metrics line"),
        }
    }
    Ok(entries)
}

impl MetricsCollector {
    /// Open the log at `path`, replaying the last day of buckets
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Self::open_at(path, Utc::now())
    }

    pub fn open_at(path: impl AsRef<Path>, now: DateTime<Utc>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cutoff = truncate_to_hour(now) - ChronoDuration::hours(REPLAY_HOURS);

        let mut buckets = BTreeMap::new();
        for entry in read_log(&path)? {
            if entry.hour >= cutoff {
                buckets.insert(
                    entry.hour,
                    HourBucket {
                        requests: entry.requests,
                        errors: entry.errors,
                    },
                );
            }
        }
        if !buckets.is_empty() {
            info!(hours = buckets.len(), "Replayed metrics log");
        }

        let log = open_log(&path)?;
        Ok(Self {
            state: Mutex::new(CollectorState {
                buckets,
                flushed_through: None,
                log,
            }),
            log_path: path,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Count one request in the hour of `ts`
    pub fn record(&self, ts: DateTime<Utc>, is_error: bool) {
        let mut hour = truncate_to_hour(ts);
        let mut state = self.state.lock();
        if let Some(mark) = state.flushed_through {
            if hour <= mark {
                debug!(hour = %hour_key(hour), "Late request counted in the next open hour");
                hour = mark + ChronoDuration::hours(1);
            }
        }

        let bucket = state.buckets.entry(hour).or_default();
        bucket.requests += 1;
        if is_error {
            bucket.errors += 1;
        }
        let line = format!("{} - {}, {}\n", hour_key(hour), bucket.requests, bucket.errors);

        if let Err(e) = state.log.write_all(line.as_bytes()) {
            error!(error = %e, path = %self.log_path.display(), "Failed to append metrics log");
        }
    }

    pub fn bucket(&self, hour: NaiveDateTime) -> Option<HourBucket> {
        self.state.lock().buckets.get(&hour).copied()
    }

    /// Buckets for hours that ended before the hour containing `now`
    pub fn closed_buckets(&self, now: DateTime<Utc>) -> Vec<(NaiveDateTime, HourBucket)> {
        let current = truncate_to_hour(now);
        self.state
            .lock()
            .buckets
            .range(..current)
            .map(|(hour, bucket)| (*hour, *bucket))
            .collect()
    }

    /// Drop `hour` once `persisted` is stored; a bucket that grew since the
    /// snapshot stays for the next flush
    fn forget(&self, hour: NaiveDateTime, persisted: HourBucket) -> bool {
        let mut state = self.state.lock();
        if state.buckets.get(&hour) != Some(&persisted) {
            return false;
        }
        state.buckets.remove(&hour);
        state.flushed_through = state.flushed_through.max(Some(hour));
        true
    }

    /// Hours from the last `days` days, keeping the last line logged for each
    pub fn get_metrics(&self, days: u32) -> std::io::Result<Vec<MetricsEntry>> {
        self.get_metrics_at(days, Utc::now())
    }

    pub fn get_metrics_at(
        &self,
        days: u32,
        now: DateTime<Utc>,
    ) -> std::io::Result<Vec<MetricsEntry>> {
        // Hold the lock so a concurrent record never leaves a half-written line.
        let _state = self.state.lock();
        let cutoff = now.naive_utc() - ChronoDuration::days(i64::from(days));

        let mut latest: BTreeMap<NaiveDateTime, MetricsEntry> = BTreeMap::new();
        for entry in read_log(&self.log_path)? {
            if entry.hour >= cutoff {
                latest.insert(entry.hour, entry);
            }
        }
        Ok(latest.into_values().collect())
    }
}

/// Time left until the next wall-clock hour boundary
pub fn duration_until_next_hour(now: DateTime<Utc>) -> Duration {
    let next = truncate_to_hour(now) + ChronoDuration::hours(1);
    (next - now.naive_utc())
        .to_std()
        .unwrap_or(Duration::from_secs(0))
}

/// Flushes closed hours from the collector into `application_stats`
pub struct Aggregator {
    collector: Arc<MetricsCollector>,
    db: Database,
    application_id: String,
}

impl Aggregator {
    pub fn new(collector: Arc<MetricsCollector>, db: Database, application_id: String) -> Self {
        Self {
            collector,
            db,
            application_id,
        }
    }

    /// Persist every closed hour; a bucket is dropped only once its row is written
    pub fn flush_closed_hours(&self, now: DateTime<Utc>) -> usize {
        let mut flushed = 0;
        for (hour, bucket) in self.collector.closed_buckets(now) {
            match self.db.upsert_application_stat(
                &self.application_id,
                hour,
                bucket.requests,
                bucket.errors,
            ) {
                Ok(()) => {
                    if !self.collector.forget(hour, bucket) {
                        debug!(hour = %hour_key(hour), "Hour grew during flush, keeping it");
                        continue;
                    }
                    flushed += 1;
                    info!(
                        hour = %hour_key(hour),
                        requests = bucket.requests,
                        errors = bucket.errors,
                        "Flushed hourly metrics"
                    );
                }
                Err(e) => {
                    error!(hour = %hour_key(hour), error = %e, "Failed to persist hourly metrics");
                }
            }
        }
        flushed
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(application_id = %self.application_id, "Metrics aggregator started");

        loop {
            let wait = duration_until_next_hour(Utc::now());
            debug!(wait_secs = wait.as_secs(), "Waiting for next hour boundary");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    self.flush_closed_hours(Utc::now());
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Metrics aggregator shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 12, 26, h, m, 0).unwrap()
    }

    #[test]
    fn test_hour_key_format() {
        assert_eq!(hour_key(truncate_to_hour(at(11, 42))), "2024-12-26 11:00");
    }

    #[test]
    fn test_parse_line() {
        let entry = parse_line("2024-12-26 11:00 - 100, 5").unwrap();
        assert_eq!(entry.hour, truncate_to_hour(at(11, 0)));
        assert_eq!(entry.requests, 100);
        assert_eq!(entry.errors, 5);

        assert!(parse_line("garbage").is_none());
        assert!(parse_line("2024-12-26 11:00 - x, 5").is_none());
    }

    #[test]
    fn test_record_appends_monotonic_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics/gateway_metrics.log");
        let collector = MetricsCollector::open_at(&path, at(11, 0)).unwrap();

        collector.record(at(11, 5), false);
        collector.record(at(11, 6), true);
        collector.record(at(11, 7), false);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "2024-12-26 11:00 - 1, 0\n2024-12-26 11:00 - 2, 1\n2024-12-26 11:00 - 3, 1\n"
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }

    #[test]
    fn test_concurrent_records_sum() {
        let dir = tempfile::tempdir().unwrap();
        let collector =
            Arc::new(MetricsCollector::open_at(dir.path().join("m.log"), at(11, 0)).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        collector.record(at(11, 30), false);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let bucket = collector.bucket(truncate_to_hour(at(11, 0))).unwrap();
        assert_eq!(bucket.requests, 400);

        let content = std::fs::read_to_string(collector.log_path()).unwrap();
        let mut last = 0;
        for line in content.lines() {
            let entry = parse_line(line).unwrap();
            assert!(entry.requests > last);
            last = entry.requests;
        }
        assert_eq!(last, 400);
    }

    #[test]
    fn test_get_metrics_collapses_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.log");
        std::fs::write(
            &path,
            "2024-12-20 09:00 - 7, 0\n2024-12-26 10:00 - 1, 0\n2024-12-26 10:00 - 2, 1\nbad line\n",
        )
        .unwrap();
        let collector = MetricsCollector::open_at(&path, at(11, 0)).unwrap();

        let entries = collector.get_metrics_at(1, at(11, 0)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].requests, 2);
        assert_eq!(entries[0].errors, 1);

        assert_eq!(collector.get_metrics_at(30, at(11, 0)).unwrap().len(), 2);
    }

    #[test]
    fn test_replay_restores_recent_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.log");
        std::fs::write(&path, "2024-12-20 09:00 - 7, 0\n2024-12-26 10:00 - 4, 2\n").unwrap();

        let collector = MetricsCollector::open_at(&path, at(11, 15)).unwrap();
        assert_eq!(
            collector.bucket(truncate_to_hour(at(10, 0))),
            Some(HourBucket {
                requests: 4,
                errors: 2
            })
        );
        assert!(collector
            .bucket(truncate_to_hour(Utc.with_ymd_and_hms(2024, 12, 20, 9, 0, 0).unwrap()))
            .is_none());

        collector.record(at(10, 59), true);
        assert_eq!(collector.bucket(truncate_to_hour(at(10, 0))).unwrap().requests, 5);
    }

    #[test]
    fn test_duration_until_next_hour() {
        assert_eq!(duration_until_next_hour(at(11, 45)), Duration::from_secs(15 * 60));
        assert_eq!(duration_until_next_hour(at(11, 0)), Duration::from_secs(3600));
    }

    #[test]
    fn test_aggregation_flushes_closed_hour_once() {
        let dir = tempfile::tempdir().unwrap();
        let collector =
            Arc::new(MetricsCollector::open_at(dir.path().join("m.log"), at(11, 0)).unwrap());
        for i in 0..100 {
            collector.record(at(11, 10), i < 5);
        }
        collector.record(at(12, 0), false);

        let db = Database::open_in_memory().unwrap();
        let aggregator = Aggregator::new(Arc::clone(&collector), db.clone(), "default".into());

        assert_eq!(aggregator.flush_closed_hours(at(11, 59)), 0);
        assert_eq!(aggregator.flush_closed_hours(at(12, 0)), 1);
        assert_eq!(aggregator.flush_closed_hours(at(12, 0)), 0);

        let stats = db.get_application_stats("default").unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].requests, 100);
        assert_eq!(stats[0].errors, 5);
        assert_eq!(stats[0].date, truncate_to_hour(at(11, 0)));

        assert!(collector.bucket(truncate_to_hour(at(11, 0))).is_none());
        assert!(collector.bucket(truncate_to_hour(at(12, 0))).is_some());
    }

    #[test]
    fn test_late_request_after_flush_keeps_persisted_hour() {
        let dir = tempfile::tempdir().unwrap();
        let collector =
            Arc::new(MetricsCollector::open_at(dir.path().join("m.log"), at(11, 0)).unwrap());
        for _ in 0..100 {
            collector.record(at(11, 10), false);
        }

        let db = Database::open_in_memory().unwrap();
        let aggregator = Aggregator::new(Arc::clone(&collector), db.clone(), "default".into());
        assert_eq!(aggregator.flush_closed_hours(at(12, 0)), 1);

        let late = Utc.with_ymd_and_hms(2024, 12, 26, 11, 59, 59).unwrap();
        collector.record(late, false);
        assert!(collector.bucket(truncate_to_hour(at(11, 0))).is_none());
        assert_eq!(collector.bucket(truncate_to_hour(at(12, 0))).unwrap().requests, 1);

        assert_eq!(aggregator.flush_closed_hours(at(13, 0)), 1);
        let stats = db.get_application_stats("default").unwrap();
        let eleven = stats
            .iter()
            .find(|s| s.date == truncate_to_hour(at(11, 0)))
            .unwrap();
        assert_eq!(eleven.requests, 100);
        assert_eq!(stats.len(), 2);

        let content = std::fs::read_to_string(collector.log_path()).unwrap();
        let mut last_eleven = 0;
        for entry in content.lines().filter_map(parse_line) {
            if entry.hour == truncate_to_hour(at(11, 0)) {
                assert!(entry.requests > last_eleven);
                last_eleven = entry.requests;
            }
        }
        assert_eq!(last_eleven, 100);
    }

    #[test]
    fn test_bucket_grown_during_flush_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let collector = MetricsCollector::open_at(dir.path().join("m.log"), at(11, 0)).unwrap();
        collector.record(at(11, 10), false);
        let (hour, snapshot) = collector.closed_buckets(at(12, 0))[0];

        collector.record(at(11, 20), false);
        assert!(!collector.forget(hour, snapshot));
        assert_eq!(collector.bucket(hour).unwrap().requests, 2);

        let (_, grown) = collector.closed_buckets(at(12, 0))[0];
        assert!(collector.forget(hour, grown));
        assert!(collector.bucket(hour).is_none());
    }

    #[tokio::test]
    async fn test_aggregator_stops_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        let collector = Arc::new(MetricsCollector::open(dir.path().join("m.log")).unwrap());
        let aggregator =
            Aggregator::new(collector, Database::open_in_memory().unwrap(), "default".into());

        let handle = crate::worker::WorkerHandle::spawn("aggregator", |rx| aggregator.run(rx));
        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .unwrap();
    }
}
