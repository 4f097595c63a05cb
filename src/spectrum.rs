//! Averaged periodograms (Welch's method) of the live window

use std::{
    f64::consts::PI,
    fmt,
    str::FromStr,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::Sender;
use num_traits::AsPrimitive;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::{debug, error, info};

use crate::{
    capture::CancelToken,
    config::SpectrumConfig,
    window::{Eviction, WindowBuffer},
    Error, Result,
};

/// Upper bound on how long a full window waits for the worker
const SNAPSHOT_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowFunction {
    Hann,
    Hamming,
    Blackman,
    Boxcar,
}

impl WindowFunction {
    /// Periodic (DFT-even) coefficients
    pub fn coefficients(self, n: usize) -> Vec<f64> {
        let n_f = n as f64;
        (0..n)
            .map(|i| {
                let x = 2.0 * PI * i as f64 / n_f;
                match self {
                    WindowFunction::Hann => 0.5 - 0.5 * x.cos(),
                    WindowFunction::Hamming => 0.54 - 0.46 * x.cos(),
                    WindowFunction::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
                    WindowFunction::Boxcar => 1.0,
                }
            })
            .collect()
    }
}

impl FromStr for WindowFunction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hann" | "hanning" => Ok(WindowFunction::Hann),
            "hamming" => Ok(WindowFunction::Hamming),
            "blackman" => Ok(WindowFunction::Blackman),
            "boxcar" | "rectangular" | "none" => Ok(WindowFunction::Boxcar),
            other => Err(format!("unknown window function {other}")),
        }
    }
}

impl fmt::Display for WindowFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WindowFunction::Hann => "hann",
            WindowFunction::Hamming => "hamming",
            WindowFunction::Blackman => "blackman",
            WindowFunction::Boxcar => "boxcar",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scaling {
    /// Power per bin, V²
    Spectrum,
    /// Power per Hz, V²/Hz
    Density,
    /// Square root of the density, V/√Hz
    AmplitudeDensity,
}

impl FromStr for Scaling {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spectrum" => Ok(Scaling::Spectrum),
            "density" | "psd" => Ok(Scaling::Density),
            "asd" | "amplitude" => Ok(Scaling::AmplitudeDensity),
            other => Err(format!("unknown scaling {other}")),
        }
    }
}

/// One-sided power spectrum
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Spectrum {
    pub frequencies: Vec<f64>,
    pub power: Vec<f64>,
}

impl Spectrum {
    /// Strongest non-DC bin as (frequency, power)
    pub fn peak(&self) -> Option<(f64, f64)> {
        self.power
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, &p)| (self.frequencies[k], p))
    }

    pub fn len(&self) -> usize {
        self.power.len()
    }

    pub fn is_empty(&self) -> bool {
        self.power.is_empty()
    }
}

/// Welch estimator with a fixed segment geometry and a planned FFT
pub struct Welch {
    sample_rate: f64,
    segment_length: usize,
    step: usize,
    window: Vec<f64>,
    scale: f64,
    amplitude: bool,
    fft: Arc<dyn Fft<f64>>,
}

impl Welch {
    pub fn new(
        sample_rate: f64,
        segment_length: usize,
        overlap: usize,
        window: WindowFunction,
        scaling: Scaling,
    ) -> Result<Self> {
        if segment_length < 2 {
            return Err(Error::Spectrum(format!(
                "segments of {segment_length} samples are too short"
            )));
        }
        if overlap >= segment_length {
            return Err(Error::Spectrum(format!(
                "overlap {overlap} must be shorter than the segment ({segment_length})"
            )));
        }
        if !(sample_rate > 0.0) {
            return Err(Error::Spectrum(format!("bad sample rate {sample_rate}")));
        }
        let window = window.coefficients(segment_length);
        let scale = match scaling {
            Scaling::Spectrum => 1.0 / window.iter().sum::<f64>().powi(2),
            Scaling::Density | Scaling::AmplitudeDensity => {
                1.0 / (sample_rate * window.iter().map(|w| w * w).sum::<f64>())
            }
        };
        let fft = FftPlanner::new().plan_fft_forward(segment_length);
        Ok(Self {
            sample_rate,
            segment_length,
            step: segment_length - overlap,
            window,
            scale,
            amplitude: scaling == Scaling::AmplitudeDensity,
            fft,
        })
    }

    pub fn segment_length(&self) -> usize {
        self.segment_length
    }

    pub fn frequencies(&self) -> Vec<f64> {
        let n = self.segment_length as f64;
        (0..=self.segment_length / 2)
            .map(|k| k as f64 * self.sample_rate / n)
            .collect()
    }

    /// Trailing samples that don't fill a whole segment are ignored
    pub fn compute(&self, samples: &[f64]) -> Result<Spectrum> {
        let n = self.segment_length;
        if samples.len() < n {
            return Err(Error::Spectrum(format!(
                "need at least {n} samples, got {}",
                samples.len()
            )));
        }
        let bins = n / 2 + 1;
        let mut power = vec![0.0; bins];
        let mut buf = vec![Complex::new(0.0, 0.0); n];
        let mut segments = 0usize;
        let mut start = 0;
        while start + n <= samples.len() {
            let seg = &samples[start..start + n];
            let mean = seg.iter().sum::<f64>() / n as f64;
            for ((b, &x), &w) in buf.iter_mut().zip(seg).zip(&self.window) {
                *b = Complex::new((x - mean) * w, 0.0);
            }
            self.fft.process(&mut buf);
            for (p, c) in power.iter_mut().zip(&buf) {
                *p += c.norm_sqr();
            }
            segments += 1;
            start += self.step;
        }
        let norm = self.scale / segments as f64;
        for (k, p) in power.iter_mut().enumerate() {
            *p *= norm;
            // Fold the negative frequencies in, Nyquist has no mirror
            if k > 0 && !(n % 2 == 0 && k == n / 2) {
                *p *= 2.0;
            }
            if self.amplitude {
                *p = p.sqrt();
            }
        }
        Ok(Spectrum {
            frequencies: self.frequencies(),
            power,
        })
    }
}

/// Flatten a window of macropulses into one series in physical units,
/// `calibration * counts + offset`
pub fn flatten<T: AsPrimitive<f64>>(
    entries: &[Vec<T>],
    calibration: f64,
    offset: f64,
) -> Vec<f64> {
    entries
        .iter()
        .flat_map(|e| e.iter().map(move |&v| v.as_() * calibration + offset))
        .collect()
}

/// Spectrum of a whole window, split into `cfg.averages` segments
pub fn power_spectrum<T: AsPrimitive<f64>>(
    entries: &[Vec<T>],
    cfg: &SpectrumConfig,
) -> Result<Spectrum> {
    let samples = flatten(entries, cfg.calibration, cfg.offset);
    if cfg.averages == 0 {
        return Err(Error::Spectrum("need at least one average".into()));
    }
    let segment_length = samples.len() / cfg.averages;
    let welch = Welch::new(
        cfg.sample_rate,
        segment_length,
        cfg.overlap,
        cfg.window,
        cfg.scaling,
    )?;
    welch.compute(&samples)
}

/// Compute spectra off `buffer` on a thread of its own, sending each one to `tx`.
/// Returns how many spectra were sent once cancelled or once the receiver hangs up.
pub fn spawn_worker(
    buffer: Arc<WindowBuffer<Vec<i16>>>,
    cfg: SpectrumConfig,
    cancel: CancelToken,
    tx: Sender<Spectrum>,
) -> std::io::Result<JoinHandle<usize>> {
    thread::Builder::new()
        .name("spectrum".into())
        .spawn(move || {
            let poll = match buffer.eviction() {
                Eviction::SnapshotAndClear => cfg.interval.min(SNAPSHOT_POLL),
                Eviction::DropOldest => cfg.interval,
            };
            let mut sent = 0;
            while !cancel.is_cancelled() {
                let window = match buffer.eviction() {
                    Eviction::SnapshotAndClear => buffer.take_if_full(),
                    // Same resolution every time: wait until the ring has filled
                    Eviction::DropOldest if buffer.is_full() => Some(buffer.snapshot()),
                    Eviction::DropOldest => None,
                };
                if let Some(window) = window {
                    match power_spectrum(&window, &cfg) {
                        Ok(spectrum) => {
                            debug!(bins = spectrum.len(), "Computed spectrum");
                            if tx.send(spectrum).is_err() {
                                debug!("Spectrum receiver hung up");
                                break;
                            }
                            sent += 1;
                        }
                        Err(e) => {
                            error!("Giving up on spectra: {e}");
                            break;
                        }
                    }
                }
                cancel.wait(poll);
            }
            info!(sent, "Spectrum worker stopped");
            sent
        })
}
