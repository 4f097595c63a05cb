//! Anti-aliased downsampling of the 16 kHz ADC stream.
//!
//! Large decimation factors are split into stages of at most [`MAX_STAGE`] so each
//! anti-alias filter stays short and well conditioned. Every stage is a zero-phase
//! FIR (Hamming windowed sinc, `20 * q + 1` taps, cutoff at the new Nyquist).

use std::f64::consts::PI;

use crate::{Error, Result};

/// Largest single-stage decimation factor
pub const MAX_STAGE: u32 = 8;
// Filter half-length in units of the stage factor
const HALF_TAPS_PER_Q: usize = 10;

/// Split `factor` into stages whose product is exactly `factor`.
///
/// While the factor exceeds [`MAX_STAGE`] we peel off its largest divisor in
/// `2..=MAX_STAGE`. A factor with no such divisor (a prime above 8, e.g. 13) is
/// applied as one final stage.
pub fn stage_plan(factor: u32) -> Vec<u32> {
    let mut plan = vec![];
    let mut factor = factor.max(1);
    while factor > MAX_STAGE {
        match (2..=MAX_STAGE).rev().find(|d| factor % d == 0) {
            Some(d) => {
                plan.push(d);
                factor /= d;
            }
            None => break,
        }
    }
    if factor > 1 {
        plan.push(factor);
    }
    plan
}

fn lowpass_taps(q: usize) -> Vec<f64> {
    let half = HALF_TAPS_PER_Q * q;
    let len = 2 * half + 1;
    let mut taps: Vec<f64> = (0..len)
        .map(|n| {
            let k = n as f64 - half as f64;
            let x = k / q as f64;
            let sinc = if k == 0.0 { 1.0 } else { (PI * x).sin() / (PI * x) };
            let window = 0.54 - 0.46 * (2.0 * PI * n as f64 / (len - 1) as f64).cos();
            sinc * window
        })
        .collect();
    let gain: f64 = taps.iter().sum();
    taps.iter_mut().for_each(|t| *t /= gain);
    taps
}

/// One decimate-by-`q` stage that remembers enough history to run across batches
struct Stage {
    q: usize,
    half: usize,
    taps: Vec<f64>,
    history: Vec<f64>,
    // Absolute input index of history[0]
    offset: usize,
    seen: usize,
    next_out: usize,
}

impl Stage {
    fn new(q: u32) -> Self {
        let q = q as usize;
        Self {
            q,
            half: HALF_TAPS_PER_Q * q,
            taps: lowpass_taps(q),
            history: vec![],
            offset: 0,
            seen: 0,
            next_out: 0,
        }
    }

    fn filter_at(&self, center: usize) -> f64 {
        let mut acc = 0.0;
        for (k, tap) in self.taps.iter().enumerate() {
            let idx = center + k;
            // idx is offset by `half` so we can stay in usize
            if idx < self.half || idx - self.half >= self.seen {
                continue;
            }
            acc += tap * self.history[idx - self.half - self.offset];
        }
        acc
    }

    fn process(&mut self, input: &[f64], out: &mut Vec<f64>) {
        self.history.extend_from_slice(input);
        self.seen += input.len();
        while self.next_out * self.q + self.half < self.seen {
            out.push(self.filter_at(self.next_out * self.q));
            self.next_out += 1;
        }
        // Everything before the next output's window is dead
        let keep_from = (self.next_out * self.q).saturating_sub(self.half);
        if keep_from > self.offset {
            self.history.drain(..keep_from - self.offset);
            self.offset = keep_from;
        }
    }

    /// Emit the tail, treating samples past the end as zero
    fn finish(&mut self, out: &mut Vec<f64>) {
        while self.next_out * self.q < self.seen {
            out.push(self.filter_at(self.next_out * self.q));
            self.next_out += 1;
        }
    }
}

/// Staged decimator that can be fed batch by batch.
///
/// Feeding any split of a signal through [`process`](Self::process) followed by
/// [`finish`](Self::finish) yields exactly [`downsample`] of the whole signal.
pub struct StreamingDecimator {
    factor: u32,
    stages: Vec<Stage>,
}

impl StreamingDecimator {
    pub fn new(factor: u32) -> Result<Self> {
        if factor == 0 {
            return Err(Error::Config("decimation factor must be at least 1".into()));
        }
        Ok(Self {
            factor,
            stages: stage_plan(factor).into_iter().map(Stage::new).collect(),
        })
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    pub fn process(&mut self, input: &[f64]) -> Vec<f64> {
        let mut carry = input.to_vec();
        for stage in &mut self.stages {
            let mut out = Vec::with_capacity(carry.len() / stage.q + 1);
            stage.process(&carry, &mut out);
            carry = out;
        }
        carry
    }

    pub fn finish(&mut self) -> Vec<f64> {
        let mut carry = vec![];
        for stage in &mut self.stages {
            let mut out = vec![];
            stage.process(&carry, &mut out);
            stage.finish(&mut out);
            carry = out;
        }
        carry
    }
}

/// Downsample a whole signal by `factor`. A factor of 1 is a copy.
pub fn downsample(samples: &[f64], factor: u32) -> Result<Vec<f64>> {
    let mut decimator = StreamingDecimator::new(factor)?;
    let mut out = decimator.process(samples);
    out.extend(decimator.finish());
    Ok(out)
}
