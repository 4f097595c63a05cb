//! The DAQ capability the acquisition session drives, plus stand-ins for it.
//!
//! The real transport is opaque to us; all we rely on is that it connects to a
//! channel set over a time window and then yields groups of per-channel batches,
//! "nothing yet", or "done".

use std::{
    collections::VecDeque,
    f64::consts::PI,
    thread,
    time::{Duration, Instant},
};

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    slowlog::{HistoryRow, HistorySource},
    Channel, Error, RawBatch, Result, BASE_SAMPLE_RATE, SAMPLES_PER_BATCH,
};

/// What a single poll of the DAQ produced
#[derive(Debug)]
pub enum Fetch {
    /// One batch for each channel that had a new macropulse
    Group(Vec<RawBatch>),
    /// Nothing ready yet, poll again later
    Empty,
    /// The requested window has been delivered
    Done,
}

pub trait Device {
    fn connect(&mut self, channels: &[Channel], start: NaiveDateTime, stop: NaiveDateTime)
        -> Result<()>;
    fn next_batch(&mut self) -> Result<Fetch>;
    fn disconnect(&mut self);
}

/// Plays back a fixed list of poll results, then reports `Done`
#[derive(Default)]
pub struct ScriptedDevice {
    script: VecDeque<Result<Fetch>>,
    refuse_connect: Option<String>,
    pub connected: bool,
    pub disconnects: usize,
    pub polls: usize,
}

impl ScriptedDevice {
    pub fn new(script: impl IntoIterator<Item = Fetch>) -> Self {
        Self {
            script: script.into_iter().map(Ok).collect(),
            ..Default::default()
        }
    }

    /// Append a transport failure to the script
    pub fn then_fail(mut self, msg: &str) -> Self {
        self.script.push_back(Err(Error::Transport(msg.to_owned())));
        self
    }

    pub fn refusing_connect(msg: &str) -> Self {
        Self {
            refuse_connect: Some(msg.to_owned()),
            ..Default::default()
        }
    }
}

impl Device for ScriptedDevice {
    fn connect(&mut self, _: &[Channel], _: NaiveDateTime, _: NaiveDateTime) -> Result<()> {
        if let Some(msg) = &self.refuse_connect {
            return Err(Error::Connection(msg.clone()));
        }
        self.connected = true;
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Fetch> {
        self.polls += 1;
        self.script.pop_front().unwrap_or(Ok(Fetch::Done))
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.disconnects += 1;
    }
}

/// Synthetic 16 kHz ADC: a tone per channel plus noise, delivered as unsigned words
pub struct SimulatedDevice {
    address: String,
    channels: Vec<Channel>,
    pulses_left: u64,
    next_pulse: u64,
    t0: f64,
    rng: StdRng,
    realtime: bool,
    last_group: Option<Instant>,
}

impl SimulatedDevice {
    pub fn new(address: impl Into<String>, realtime: bool) -> Self {
        Self {
            address: address.into(),
            channels: vec![],
            pulses_left: 0,
            next_pulse: 1_590_942_828,
            t0: 0.0,
            rng: StdRng::seed_from_u64(0xA1B5),
            realtime,
            last_group: None,
        }
    }

    fn batch_for(&mut self, idx: usize, pulse: u64, t: f64) -> RawBatch {
        let tone = 320.0 + 100.0 * idx as f64;
        let n0 = (t - self.t0) * BASE_SAMPLE_RATE as f64;
        let samples = (0..SAMPLES_PER_BATCH)
            .map(|i| {
                let x = 2.0 * PI * tone * (n0 + i as f64) / BASE_SAMPLE_RATE as f64;
                let v = 8000.0 * x.sin() + self.rng.gen_range(-200.0..200.0);
                // The ADC hands out two's complement words as unsigned
                v.round() as i16 as u16
            })
            .collect();
        RawBatch {
            samples,
            channel: self.channels[idx].clone(),
            pulse_id: pulse,
            timestamp: t,
        }
    }
}

impl Device for SimulatedDevice {
    fn connect(
        &mut self,
        channels: &[Channel],
        start: NaiveDateTime,
        stop: NaiveDateTime,
    ) -> Result<()> {
        if channels.is_empty() {
            return Err(Error::Connection("no channels requested".into()));
        }
        if stop <= start {
            return Err(Error::Connection(format!("empty window {start} .. {stop}")));
        }
        self.channels = channels
            .iter()
            .map(|c| Channel::new(c.name.clone(), self.address.clone()))
            .collect();
        let samples = (stop - start).num_milliseconds() as u64 * BASE_SAMPLE_RATE as u64 / 1000;
        self.pulses_left = samples / SAMPLES_PER_BATCH as u64;
        self.t0 = start.and_utc().timestamp() as f64;
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Fetch> {
        if self.pulses_left == 0 {
            return Ok(Fetch::Done);
        }
        if self.realtime {
            let period = Duration::from_secs_f64(SAMPLES_PER_BATCH as f64 / BASE_SAMPLE_RATE as f64);
            if let Some(last) = self.last_group {
                if last.elapsed() < period {
                    thread::sleep(Duration::from_micros(100));
                    return Ok(Fetch::Empty);
                }
            }
            self.last_group = Some(Instant::now());
        }
        let pulse = self.next_pulse;
        let delivered = pulse - 1_590_942_828;
        let t = self.t0 + (delivered * SAMPLES_PER_BATCH as u64) as f64 / BASE_SAMPLE_RATE as f64;
        let group = (0..self.channels.len())
            .map(|idx| self.batch_for(idx, pulse, t))
            .collect();
        self.next_pulse += 1;
        self.pulses_left -= 1;
        Ok(Fetch::Group(group))
    }

    fn disconnect(&mut self) {
        self.channels.clear();
        self.pulses_left = 0;
    }
}

/// Slow channel whose history is a rolling window of 1 Hz readings ending "now"
pub struct SimulatedHistory {
    depth: usize,
    started: Instant,
    rng: Mutex<StdRng>,
}

impl SimulatedHistory {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            started: Instant::now(),
            rng: Mutex::new(StdRng::seed_from_u64(7)),
        }
    }
}

impl HistorySource for SimulatedHistory {
    fn history(&self, channel: &Channel) -> Result<Vec<HistoryRow>> {
        let now = chrono::Utc::now().timestamp() as f64;
        let offset = channel.name.len() as f64;
        let elapsed = self.started.elapsed().as_secs_f64();
        let mut rng = self.rng.lock();
        Ok((0..self.depth)
            .rev()
            .map(|age| HistoryRow {
                timestamp: now - age as f64,
                value: offset + (elapsed - age as f64).sin() + rng.gen_range(-0.01..0.01),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> (NaiveDateTime, NaiveDateTime) {
        let start = NaiveDateTime::parse_from_str("2022-01-03T12:23:00", "%Y-%m-%dT%H:%M:%S")
            .unwrap();
        (start, start + chrono::Duration::seconds(1))
    }

    #[test]
    fn test_simulated_device_delivers_window() {
        let (start, stop) = window();
        let channels = vec![Channel::new("NR/CH_1.00", ""), Channel::new("NR/CH_1.01", "")];
        let mut dev = SimulatedDevice::new("srv", false);
        dev.connect(&channels, start, stop).unwrap();
        let mut groups = 0;
        let mut last_pulse = 0;
        while let Fetch::Group(group) = dev.next_batch().unwrap() {
            assert_eq!(group.len(), 2);
            assert!(group[0].pulse_id > last_pulse);
            assert_eq!(group[1].samples.len(), SAMPLES_PER_BATCH);
            assert_eq!(group[1].channel.address, "srv");
            last_pulse = group[0].pulse_id;
            groups += 1;
        }
        // One second at 16 kHz in 500 sample macropulses
        assert_eq!(groups, 32);
    }

    #[test]
    fn test_scripted_device_runs_dry() {
        let mut dev = ScriptedDevice::new([Fetch::Empty]).then_fail("link down");
        assert!(matches!(dev.next_batch(), Ok(Fetch::Empty)));
        assert!(matches!(dev.next_batch(), Err(Error::Transport(_))));
        assert!(matches!(dev.next_batch(), Ok(Fetch::Done)));
    }

    #[test]
    fn test_simulated_history_is_ordered() {
        let source = SimulatedHistory::new(10);
        let rows = source.history(&Channel::new("ALPS/TEMP", "")).unwrap();
        assert_eq!(rows.len(), 10);
        assert!(rows.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }
}
