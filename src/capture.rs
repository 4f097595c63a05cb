//! This module contains all the capture logic

// The acquisition thread does one thing: pull macropulse groups off the DAQ,
// re-base them to signed, count them, and hand them to whoever is downstream.
// It never buffers; if the consumer is slow, we are slow.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::NaiveDateTime;
use tracing::{debug, error, info, trace, warn};

use crate::{
    device::{Device, Fetch},
    monitoring::RunSummary,
    normalize, Batch, Channel, Error, Result,
};

/// Give up after this many empty polls in a row (about 17 minutes of silence)
pub const MAX_EMPTY_POLLS: u64 = 1_000_000;
pub const EMPTY_BACKOFF: Duration = Duration::from_millis(1);
const NAP: Duration = Duration::from_millis(10);

/// Shared stop flag. Workers read it once per batch, the controller sets it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `dur` in short naps, returning early (true) once cancelled
    pub fn wait(&self, dur: Duration) -> bool {
        let until = Instant::now() + dur;
        while !self.is_cancelled() {
            let now = Instant::now();
            if now >= until {
                return false;
            }
            thread::sleep(NAP.min(until - now));
        }
        true
    }
}

/// What to pull off the DAQ and how patient to be about it
#[derive(Clone, Debug)]
pub struct Acquisition {
    pub channels: Vec<Channel>,
    pub start: NaiveDateTime,
    pub stop: NaiveDateTime,
    pub max_empty_polls: u64,
    pub empty_backoff: Duration,
}

impl Acquisition {
    pub fn new(channels: Vec<Channel>, start: NaiveDateTime, stop: NaiveDateTime) -> Self {
        Self {
            channels,
            start,
            stop,
            max_empty_polls: MAX_EMPTY_POLLS,
            empty_backoff: EMPTY_BACKOFF,
        }
    }
}

/// A connected DAQ session. Dropping it disconnects.
pub struct Session<'d, D: Device> {
    device: &'d mut D,
    max_empty_polls: u64,
    empty_backoff: Duration,
    last_pulse: HashMap<String, u64>,
    summary: RunSummary,
    connected: bool,
}

impl<'d, D: Device> Session<'d, D> {
    /// Connection failures are fatal and never retried
    pub fn connect(device: &'d mut D, acq: &Acquisition) -> Result<Self> {
        device
            .connect(&acq.channels, acq.start, acq.stop)
            .map_err(|e| match e {
                Error::Connection(_) => e,
                other => Error::Connection(other.to_string()),
            })?;
        info!(
            channels = acq.channels.len(),
            start = %acq.start,
            stop = %acq.stop,
            "Connected to DAQ"
        );
        Ok(Self {
            device,
            max_empty_polls: acq.max_empty_polls,
            empty_backoff: acq.empty_backoff,
            last_pulse: HashMap::new(),
            summary: RunSummary::default(),
            connected: true,
        })
    }

    /// Drop batches we've already seen and tally the rest
    fn fresh(&mut self, group: Vec<crate::RawBatch>) -> Vec<Batch> {
        let mut out = Vec::with_capacity(group.len());
        for raw in group {
            let name = &raw.channel.name;
            if let Some(&last) = self.last_pulse.get(name) {
                if raw.pulse_id <= last {
                    trace!(channel = %name, pulse = raw.pulse_id, "Stale macropulse");
                    self.summary.stale_batches += 1;
                    continue;
                }
            }
            self.last_pulse.insert(name.clone(), raw.pulse_id);
            let events = self.summary.tally.record(name);
            trace!(
                channel = %name,
                pulse = raw.pulse_id,
                time = raw.timestamp,
                events,
                "Macropulse"
            );
            out.push(normalize(raw));
        }
        out
    }

    /// Pump groups into `on_group` until the window is done, the DAQ goes quiet,
    /// something fails, or `cancel` is set. Always returns a summary.
    pub fn run<F>(mut self, cancel: &CancelToken, mut on_group: F) -> RunSummary
    where
        F: FnMut(&[Batch]) -> Result<()>,
    {
        let mut empty_in_a_row = 0u64;
        loop {
            // Only ever checked between groups
            if cancel.is_cancelled() {
                info!("Acquisition cancelled");
                self.summary.cancelled = true;
                break;
            }
            if empty_in_a_row >= self.max_empty_polls {
                warn!(empty_in_a_row, "DAQ stayed empty, giving up");
                break;
            }
            let group = match self.device.next_batch() {
                Ok(Fetch::Group(group)) => group,
                Ok(Fetch::Empty) => {
                    empty_in_a_row += 1;
                    self.summary.empty_polls += 1;
                    thread::sleep(self.empty_backoff);
                    continue;
                }
                Ok(Fetch::Done) => break,
                Err(e) => {
                    error!("Something wrong with the DAQ, stopping: {e}");
                    self.summary.error = Some(e.to_string());
                    break;
                }
            };
            let batches = self.fresh(group);
            if batches.is_empty() {
                // Only repeats, i.e. nothing new yet
                empty_in_a_row += 1;
                self.summary.empty_polls += 1;
                thread::sleep(self.empty_backoff);
                continue;
            }
            empty_in_a_row = 0;
            self.summary.total_events += 1;
            debug!(event = self.summary.total_events, batches = batches.len(), "Event");
            if let Err(e) = on_group(&batches) {
                error!("Consumer failed, stopping: {e}");
                self.summary.error = Some(e.to_string());
                break;
            }
        }
        self.disconnect();
        info!(
            events = self.summary.total_events,
            empty = self.summary.empty_polls,
            "Acquisition finished"
        );
        std::mem::take(&mut self.summary)
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.device.disconnect();
            self.connected = false;
        }
    }
}

impl<'d, D: Device> Drop for Session<'d, D> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::ScriptedDevice, RawBatch};

    fn raw(channel: &str, pulse: u64, samples: Vec<u16>) -> RawBatch {
        RawBatch {
            samples,
            channel: Channel::new(channel, "srv"),
            pulse_id: pulse,
            timestamp: pulse as f64 * 0.1,
        }
    }

    fn acquisition() -> Acquisition {
        let start = NaiveDateTime::parse_from_str("2022-01-03T12:23:00", "%Y-%m-%dT%H:%M:%S")
            .unwrap();
        let mut acq = Acquisition::new(
            vec![Channel::new("A", "srv"), Channel::new("B", "srv")],
            start,
            start + chrono::Duration::seconds(1),
        );
        acq.empty_backoff = Duration::ZERO;
        acq
    }

    #[test]
    fn test_wait_wakes_on_cancel() {
        let cancel = CancelToken::new();
        assert!(!cancel.wait(Duration::from_millis(5)));
        let remote = cancel.clone();
        let t = thread::spawn(move || remote.cancel());
        let started = Instant::now();
        assert!(cancel.wait(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(5));
        t.join().unwrap();
    }

    #[test]
    fn test_tally_ignores_repeated_pulses() {
        let mut dev = ScriptedDevice::new([
            Fetch::Group(vec![raw("A", 1, vec![1]), raw("B", 1, vec![1])]),
            Fetch::Group(vec![raw("A", 1, vec![1]), raw("B", 2, vec![2])]),
            Fetch::Group(vec![raw("A", 1, vec![1])]),
            Fetch::Group(vec![raw("A", 2, vec![2]), raw("B", 3, vec![3])]),
        ]);
        let acq = acquisition();
        let mut delivered: HashMap<String, Vec<u64>> = HashMap::new();
        let summary = Session::connect(&mut dev, &acq).unwrap().run(
            &CancelToken::new(),
            |group| {
                for b in group {
                    delivered.entry(b.channel.name.clone()).or_default().push(b.pulse_id);
                }
                Ok(())
            },
        );
        assert_eq!(summary.tally.get("A"), Some(2));
        assert_eq!(summary.tally.get("B"), Some(3));
        assert_eq!(delivered["A"], vec![1, 2]);
        assert_eq!(delivered["B"], vec![1, 2, 3]);
        assert_eq!(summary.stale_batches, 2);
        // The all-stale group counts as nothing new
        assert_eq!(summary.total_events, 3);
        assert_eq!(summary.empty_polls, 1);
    }

    #[test]
    fn test_samples_are_rebased() {
        let mut dev = ScriptedDevice::new([Fetch::Group(vec![raw("A", 1, vec![5, 40000, 65535])])]);
        let mut seen = vec![];
        Session::connect(&mut dev, &acquisition())
            .unwrap()
            .run(&CancelToken::new(), |group| {
                seen.extend_from_slice(&group[0].samples);
                Ok(())
            });
        assert_eq!(seen, vec![5, -25536, -1]);
    }

    #[test]
    fn test_gives_up_after_empty_polls() {
        let mut dev = ScriptedDevice::new((0..10).map(|_| Fetch::Empty));
        let mut acq = acquisition();
        acq.max_empty_polls = 4;
        let summary = Session::connect(&mut dev, &acq)
            .unwrap()
            .run(&CancelToken::new(), |_| Ok(()));
        assert_eq!(summary.empty_polls, 4);
        assert!(summary.is_success());
        assert_eq!(dev.polls, 4);
        assert_eq!(dev.disconnects, 1);
    }

    #[test]
    fn test_data_resets_empty_counter() {
        let script = [
            Fetch::Empty,
            Fetch::Empty,
            Fetch::Group(vec![raw("A", 1, vec![0])]),
            Fetch::Empty,
            Fetch::Empty,
            Fetch::Group(vec![raw("A", 2, vec![0])]),
        ];
        let mut dev = ScriptedDevice::new(script);
        let mut acq = acquisition();
        acq.max_empty_polls = 3;
        let summary = Session::connect(&mut dev, &acq)
            .unwrap()
            .run(&CancelToken::new(), |_| Ok(()));
        assert_eq!(summary.total_events, 2);
        assert_eq!(summary.empty_polls, 4);
    }

    #[test]
    fn test_transport_error_still_disconnects() {
        let mut dev =
            ScriptedDevice::new([Fetch::Group(vec![raw("A", 1, vec![0])])]).then_fail("link down");
        let summary = Session::connect(&mut dev, &acquisition())
            .unwrap()
            .run(&CancelToken::new(), |_| Ok(()));
        assert_eq!(summary.total_events, 1);
        assert!(summary.error.as_deref().unwrap().contains("link down"));
        assert!(!dev.connected);
        assert_eq!(dev.disconnects, 1);
    }

    #[test]
    fn test_connection_failure_is_fatal() {
        let mut dev = ScriptedDevice::refusing_connect("no route to DAQ server");
        let res = Session::connect(&mut dev, &acquisition());
        assert!(matches!(res, Err(Error::Connection(_))));
        drop(res);
        assert_eq!(dev.polls, 0);
    }

    #[test]
    fn test_consumer_error_ends_run() {
        let script = (1..=5).map(|p| Fetch::Group(vec![raw("A", p, vec![0])]));
        let mut dev = ScriptedDevice::new(script);
        let mut calls = 0;
        let summary = Session::connect(&mut dev, &acquisition())
            .unwrap()
            .run(&CancelToken::new(), |_| {
                calls += 1;
                if calls == 2 {
                    return Err(Error::Config("disk full".into()));
                }
                Ok(())
            });
        assert_eq!(calls, 2);
        assert!(summary.error.unwrap().contains("disk full"));
        assert_eq!(dev.disconnects, 1);
    }
}
