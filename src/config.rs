//! Run configuration and the pre-flight checks done before we touch the DAQ

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::NaiveDateTime;

use crate::{
    capture::{Acquisition, EMPTY_BACKOFF, MAX_EMPTY_POLLS},
    container::Format,
    spectrum::{Scaling, WindowFunction},
    window::Eviction,
    Channel, Error, Result, BASE_SAMPLE_RATE, SAMPLES_PER_BATCH,
};

/// Output rates we offer, all reachable by decimating the 16 kHz base rate
pub const SAMPLE_RATES: [u32; 9] = [16_000, 8_000, 4_000, 2_000, 1_000, 500, 100, 64, 32];
/// Ask before writing more than this many bytes
pub const OVERSIZE_BYTES: u64 = 1_000_000_000;
pub const COMMENTS_FILE: &str = "comments.txt";

/// A channel and the file stem its samples get written to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Output {
    pub channel: Channel,
    pub stem: String,
}

/// Everything needed to save one time window to disk
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub outputs: Vec<Output>,
    pub start: NaiveDateTime,
    pub duration: chrono::Duration,
    pub sample_rate: u32,
    pub format: Format,
    pub directory: PathBuf,
    pub comments: Option<String>,
    pub max_empty_polls: u64,
    pub empty_backoff: Duration,
}

/// Things worth asking the user about, but not errors
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Warning {
    Oversize { bytes: u64 },
    Overwrite { path: PathBuf },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::Oversize { bytes } => write!(
                f,
                "The expected filesize is {:.1} GB",
                *bytes as f64 / 1e9
            ),
            Warning::Overwrite { path } => {
                write!(f, "{} already exists and will be overwritten", path.display())
            }
        }
    }
}

impl RunConfig {
    pub fn new(
        outputs: Vec<Output>,
        start: NaiveDateTime,
        duration: chrono::Duration,
        sample_rate: u32,
        format: Format,
        directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            outputs,
            start,
            duration,
            sample_rate,
            format,
            directory: directory.into(),
            comments: None,
            max_empty_polls: MAX_EMPTY_POLLS,
            empty_backoff: EMPTY_BACKOFF,
        }
    }

    pub fn stop(&self) -> NaiveDateTime {
        self.start + self.duration
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.outputs.iter().map(|o| o.channel.clone()).collect()
    }

    pub fn acquisition(&self) -> Acquisition {
        let mut acq = Acquisition::new(self.channels(), self.start, self.stop());
        acq.max_empty_polls = self.max_empty_polls;
        acq.empty_backoff = self.empty_backoff;
        acq
    }

    /// How much to decimate the base rate by to hit `sample_rate`
    pub fn decimation_factor(&self) -> Result<u32> {
        if !SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(Error::Config(format!(
                "unsupported sampling rate {} Hz, pick one of {:?}",
                self.sample_rate, SAMPLE_RATES
            )));
        }
        Ok(BASE_SAMPLE_RATE / self.sample_rate)
    }

    pub fn output_path(&self, output: &Output) -> PathBuf {
        self.directory
            .join(format!("{}.{}", output.stem, self.format.extension()))
    }

    /// Rough total size on disk, as f64 samples
    pub fn estimated_bytes(&self) -> u64 {
        let seconds = self.duration.num_seconds().max(0) as u64;
        self.sample_rate as u64 * 8 * seconds * self.outputs.len() as u64
    }

    /// Validate against the wall clock `now`. Hard problems are errors, the rest
    /// come back as warnings for the caller to confirm.
    pub fn check(&self, now: NaiveDateTime) -> Result<Vec<Warning>> {
        if self.outputs.is_empty() {
            return Err(Error::Config("no channels selected".into()));
        }
        if let Some(o) = self.outputs.iter().find(|o| o.stem.trim().is_empty()) {
            return Err(Error::Config(format!(
                "channel {} has no output file name",
                o.channel.name
            )));
        }
        self.decimation_factor()?;
        if self.stop() > now {
            return Err(Error::Date(self.stop()));
        }
        let mut warnings = vec![];
        let bytes = self.estimated_bytes();
        if bytes > OVERSIZE_BYTES {
            warnings.push(Warning::Oversize { bytes });
        }
        for output in &self.outputs {
            let path = self.output_path(output);
            if path.exists() {
                warnings.push(Warning::Overwrite { path });
            }
        }
        Ok(warnings)
    }

    pub fn overview(&self) -> String {
        let fmt = "%Y-%m-%dT%H:%M:%S";
        format!(
            "###########################################################\n\
             File save configuration overview.\n   \
             This will save data to: {}\n   \
             Data start time: {}\n   \
             Data stop time: {}\n   \
             Data Duration: {} s\n   \
             Sampling rate: {} Hz\n",
            self.directory.display(),
            self.start.format(fmt),
            self.stop().format(fmt),
            self.duration.num_seconds(),
            self.sample_rate
        )
    }

    /// Write the user's comments next to the data. Nothing to do without comments.
    pub fn write_comments(&self) -> Result<Option<PathBuf>> {
        let comments = match &self.comments {
            Some(c) if !c.trim().is_empty() => c,
            _ => return Ok(None),
        };
        let path = self.directory.join(COMMENTS_FILE);
        fs::write(&path, format!("{}\n\n{}\n", self.overview(), comments))?;
        Ok(Some(path))
    }
}

/// Live spectrum of a single channel
#[derive(Clone, Debug)]
pub struct SpectrumConfig {
    pub channel: Channel,
    pub sample_rate: f64,
    pub averages: usize,
    pub segment_length: usize,
    pub window: WindowFunction,
    pub scaling: Scaling,
    /// Multiplies the raw ADC counts before the transform
    pub calibration: f64,
    /// Added after the calibration factor
    pub offset: f64,
    /// Samples shared by neighbouring segments
    pub overlap: usize,
    pub eviction: Eviction,
    /// How often the worker looks at the window
    pub interval: Duration,
}

impl SpectrumConfig {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            sample_rate: BASE_SAMPLE_RATE as f64,
            averages: 8,
            segment_length: BASE_SAMPLE_RATE as usize,
            window: WindowFunction::Hann,
            scaling: Scaling::Density,
            calibration: 1.0,
            offset: 0.0,
            overlap: 0,
            eviction: Eviction::DropOldest,
            interval: Duration::from_millis(1000),
        }
    }

    /// Macropulses the window has to hold
    pub fn window_capacity(&self) -> Result<usize> {
        let capacity = self.segment_length * self.averages / SAMPLES_PER_BATCH;
        if capacity == 0 {
            return Err(Error::Config(format!(
                "{} averages of {} samples is less than one macropulse",
                self.averages, self.segment_length
            )));
        }
        Ok(capacity)
    }
}

/// Recording of slow (history only) channels
#[derive(Clone, Debug)]
pub struct SlowLogConfig {
    pub channels: Vec<Channel>,
    pub directory: PathBuf,
    pub poll_interval: Duration,
    pub polls: usize,
    /// Longest the collector waits on any one channel per round
    pub task_timeout: Duration,
    pub workers: usize,
}

impl SlowLogConfig {
    pub fn new(channels: Vec<Channel>, directory: impl Into<PathBuf>) -> Self {
        let workers = channels.len().max(1);
        Self {
            channels,
            directory: directory.into(),
            poll_interval: Duration::from_secs(1),
            polls: 1,
            task_timeout: Duration::from_millis(100),
            workers,
        }
    }
}

/// Make sure `dir` exists before anything gets written into it
pub fn ensure_directory(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}
