//! Recorder for slow channels that only expose a rolling history.
//!
//! Every channel becomes a job on a small worker pool. A job polls its history,
//! keeps only rows newer than anything it has written already and appends those to
//! `<dir>/<channel>.csv`. The collector never blocks on one job for longer than the
//! task timeout before moving on to the next.

use std::{
    fmt,
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, trace, warn};

use crate::{
    capture::CancelToken,
    config::{ensure_directory, SlowLogConfig},
    Channel, Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistoryRow {
    pub timestamp: f64,
    pub value: f64,
}

/// Anything that can hand back the recent history of a channel
pub trait HistorySource: Send + Sync {
    fn history(&self, channel: &Channel) -> Result<Vec<HistoryRow>>;
}

/// Rows strictly newer than `last_seen`, oldest first
pub fn new_rows(mut history: Vec<HistoryRow>, last_seen: Option<f64>) -> Vec<HistoryRow> {
    history.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    if let Some(last) = last_seen {
        history.retain(|r| r.timestamp > last);
    }
    history
}

/// Where a channel's rows end up. Anything not filename friendly becomes `_`.
pub fn log_path(dir: &Path, channel: &Channel) -> PathBuf {
    let name: String = channel
        .name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{name}.csv"))
}

/// Newest timestamp already in the log at `path`, so a restarted recorder
/// doesn't append rows it wrote last time
fn last_logged(path: &Path) -> Result<Option<f64>> {
    if !path.exists() {
        return Ok(None);
    }
    // A row cut short by a crash still has its timestamp in front
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut last: Option<f64> = None;
    for record in reader.records() {
        let stamp = record?.get(0).and_then(|t| t.trim().parse::<f64>().ok());
        if let Some(t) = stamp {
            last = Some(last.map_or(t, |l| l.max(t)));
        }
    }
    Ok(last)
}

#[derive(Clone, Copy)]
struct Polling {
    interval: Duration,
    polls: usize,
}

struct Job {
    channel: Channel,
    path: PathBuf,
    result: Sender<Result<usize>>,
}

fn poll_channel<S: HistorySource + ?Sized>(
    source: &S,
    channel: &Channel,
    path: &Path,
    polling: Polling,
    cancel: &CancelToken,
) -> Result<usize> {
    let mut last_seen = last_logged(path)?;
    if let Some(t) = last_seen {
        debug!(channel = %channel.name, last = t, "Resuming slow-log");
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut out = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    let mut written = 0;
    for poll in 0..polling.polls {
        if cancel.is_cancelled() {
            debug!(channel = %channel.name, "Slow-log cancelled");
            break;
        }
        let rows = new_rows(source.history(channel)?, last_seen);
        for row in &rows {
            out.write_record([row.timestamp.to_string(), row.value.to_string()])?;
        }
        out.flush()?;
        if let Some(row) = rows.last() {
            last_seen = Some(row.timestamp);
        }
        written += rows.len();
        trace!(channel = %channel.name, poll, new = rows.len(), "Polled history");
        if poll + 1 < polling.polls {
            cancel.wait(polling.interval);
        }
    }
    Ok(written)
}

#[derive(Clone, Debug)]
pub struct ChannelOutcome {
    pub channel: Channel,
    pub path: PathBuf,
    /// Rows appended, or why the channel failed
    pub rows: std::result::Result<usize, String>,
}

#[derive(Clone, Debug, Default)]
pub struct SlowLogReport {
    pub outcomes: Vec<ChannelOutcome>,
}

impl SlowLogReport {
    pub fn total_rows(&self) -> usize {
        self.outcomes.iter().filter_map(|o| o.rows.as_ref().ok()).sum()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.rows.is_err()).count()
    }
}

impl fmt::Display for SlowLogReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for o in &self.outcomes {
            match &o.rows {
                Ok(n) => writeln!(f, "{}:\t{} rows -> {}", o.channel.name, n, o.path.display())?,
                Err(e) => writeln!(f, "{}:\tfailed: {}", o.channel.name, e)?,
            }
        }
        Ok(())
    }
}

/// Record every channel of `cfg` until each job has done its polls or `cancel`
/// is set. Failing channels are reported, not fatal.
pub fn record<S>(source: Arc<S>, cfg: &SlowLogConfig, cancel: &CancelToken) -> Result<SlowLogReport>
where
    S: HistorySource + 'static,
{
    if cfg.channels.is_empty() {
        return Err(Error::Config("no slow channels selected".into()));
    }
    ensure_directory(&cfg.directory)?;
    let polling = Polling {
        interval: cfg.poll_interval,
        polls: cfg.polls,
    };

    let (job_tx, job_rx) = unbounded::<Job>();
    let mut pending: Vec<(usize, Receiver<Result<usize>>)> = vec![];
    let mut outcomes = vec![];
    for (idx, channel) in cfg.channels.iter().enumerate() {
        let path = log_path(&cfg.directory, channel);
        let (tx, rx) = bounded(1);
        job_tx
            .send(Job {
                channel: channel.clone(),
                path: path.clone(),
                result: tx,
            })
            .map_err(|_| Error::Worker("job queue closed".into()))?;
        pending.push((idx, rx));
        outcomes.push(ChannelOutcome {
            channel: channel.clone(),
            path,
            rows: Err("not collected".into()),
        });
    }
    drop(job_tx);

    let workers = cfg.workers.clamp(1, cfg.channels.len());
    let mut handles = Vec::with_capacity(workers);
    for i in 0..workers {
        let jobs = job_rx.clone();
        let source = source.clone();
        let cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("slowlog-{i}"))
            .spawn(move || {
                for job in jobs.iter() {
                    let res = poll_channel(&*source, &job.channel, &job.path, polling, &cancel);
                    // The collector may have given up on us already
                    let _ = job.result.send(res);
                }
            })?;
        handles.push(handle);
    }
    info!(channels = cfg.channels.len(), workers, "Slow-log started");

    while !pending.is_empty() {
        pending.retain(|(idx, rx)| match rx.recv_timeout(cfg.task_timeout) {
            Ok(res) => {
                outcomes[*idx].rows = res.map_err(|e| e.to_string());
                false
            }
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => {
                outcomes[*idx].rows = Err("worker exited without reporting".into());
                false
            }
        });
    }
    for handle in handles {
        if handle.join().is_err() {
            warn!("Slow-log worker panicked");
        }
    }

    let report = SlowLogReport { outcomes };
    for o in &report.outcomes {
        if let Err(e) = &o.rows {
            warn!(channel = %o.channel.name, "Slow-log channel failed: {e}");
        }
    }
    info!(rows = report.total_rows(), failures = report.failures(), "Slow-log finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        fs,
        sync::atomic::{AtomicUsize, Ordering},
    };

    /// History is a five row window that moves on by one second per call
    #[derive(Default)]
    struct Sliding {
        calls: AtomicUsize,
    }

    impl HistorySource for Sliding {
        fn history(&self, channel: &Channel) -> Result<Vec<HistoryRow>> {
            if channel.name == "BROKEN" {
                return Err(Error::Transport("no such property".into()));
            }
            if channel.name == "SLOW" {
                thread::sleep(Duration::from_millis(50));
            }
            let start = self.calls.fetch_add(1, Ordering::SeqCst) as f64;
            // Newest first, to make sure we sort
            Ok((0..5)
                .rev()
                .map(|i| HistoryRow {
                    timestamp: start + i as f64,
                    value: 2.0 * i as f64,
                })
                .collect())
        }
    }

    fn cfg(dir: &Path, names: &[&str], polls: usize) -> SlowLogConfig {
        let mut cfg = SlowLogConfig::new(
            names.iter().map(|n| Channel::new(*n, "srv")).collect(),
            dir,
        );
        cfg.polls = polls;
        cfg.poll_interval = Duration::ZERO;
        cfg.task_timeout = Duration::from_millis(5);
        cfg
    }

    #[test]
    fn test_new_rows() {
        let rows = |ts: &[f64]| -> Vec<HistoryRow> {
            ts.iter()
                .map(|&t| HistoryRow {
                    timestamp: t,
                    value: 0.0,
                })
                .collect()
        };
        let fresh = new_rows(rows(&[3.0, 1.0, 2.0]), None);
        assert_eq!(fresh, rows(&[1.0, 2.0, 3.0]));
        let fresh = new_rows(rows(&[3.0, 1.0, 4.0, 2.0]), Some(2.0));
        assert_eq!(fresh, rows(&[3.0, 4.0]));
        assert!(new_rows(rows(&[1.0]), Some(1.0)).is_empty());
    }

    #[test]
    fn test_log_path() {
        let path = log_path(Path::new("/data"), &Channel::new("ALPS.DIAG/TEMP 1", ""));
        assert_eq!(path, Path::new("/data/ALPS.DIAG_TEMP_1.csv"));
    }

    #[test]
    fn test_dedupes_across_polls() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg(dir.path(), &["ALPS/TEMP"], 3);
        let report = record(Arc::new(Sliding::default()), &cfg, &CancelToken::new()).unwrap();
        assert_eq!(report.total_rows(), 7);
        let text = fs::read_to_string(&report.outcomes[0].path).unwrap();
        let stamps: Vec<f64> = text
            .lines()
            .map(|l| l.split(',').next().unwrap().parse().unwrap())
            .collect();
        assert_eq!(stamps, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_restart_appends_only_newer_rows() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg(dir.path(), &["ALPS/TEMP"], 3);
        record(Arc::new(Sliding::default()), &cfg, &CancelToken::new()).unwrap();

        // The history has moved on four seconds, overlapping what's on disk
        let later = Sliding {
            calls: AtomicUsize::new(4),
        };
        let report = record(Arc::new(later), &cfg, &CancelToken::new()).unwrap();
        assert_eq!(report.total_rows(), 4);
        let text = fs::read_to_string(&report.outcomes[0].path).unwrap();
        let stamps: Vec<f64> = text
            .lines()
            .map(|l| l.split(',').next().unwrap().parse().unwrap())
            .collect();
        assert_eq!(stamps, (0..=10).map(f64::from).collect::<Vec<_>>());
    }

    #[test]
    fn test_last_logged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        assert_eq!(last_logged(&path).unwrap(), None);
        fs::write(&path, "1.5,2\n3.25,4\n7").unwrap();
        assert_eq!(last_logged(&path).unwrap(), Some(7.0));
    }

    #[test]
    fn test_slow_channel_still_collected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = cfg(dir.path(), &["SLOW", "ALPS/TEMP"], 2);
        cfg.workers = 2;
        let report = record(Arc::new(Sliding::default()), &cfg, &CancelToken::new()).unwrap();
        assert_eq!(report.failures(), 0);
        assert!(report.outcomes.iter().all(|o| o.rows.as_ref().unwrap() >= &5));
    }

    #[test]
    fn test_failing_channel_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = cfg(dir.path(), &["ALPS/TEMP", "BROKEN", "ALPS/PRESSURE"], 1);
        cfg.workers = 1;
        let report = record(Arc::new(Sliding::default()), &cfg, &CancelToken::new()).unwrap();
        assert_eq!(report.failures(), 1);
        assert!(report.outcomes[1].rows.as_ref().unwrap_err().contains("no such property"));
        assert_eq!(report.outcomes[0].rows, Ok(5));
        assert_eq!(report.outcomes[2].rows, Ok(5));
        assert!(report.to_string().contains("BROKEN:\tfailed"));
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg(dir.path(), &["ALPS/TEMP"], 100);
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = record(Arc::new(Sliding::default()), &cfg, &cancel).unwrap();
        assert_eq!(report.total_rows(), 0);
    }

    #[test]
    fn test_needs_channels() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg(dir.path(), &[], 1);
        let res = record(Arc::new(Sliding::default()), &cfg, &CancelToken::new());
        assert!(matches!(res, Err(Error::Config(_))));
    }
}
