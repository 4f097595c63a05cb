pub mod args;
pub mod capture;
pub mod config;
pub mod container;
pub mod decimate;
pub mod device;
pub mod error;
pub mod monitoring;
pub mod pipeline;
pub mod slowlog;
pub mod spectrum;
pub mod window;

pub use error::{Error, Result};

/// Samples per macropulse batch out of the ADC
pub const SAMPLES_PER_BATCH: usize = 500;
/// Native ADC sample rate, everything else is a decimation of this
pub const BASE_SAMPLE_RATE: u32 = 16_000;

/// A DAQ channel, named by its DAQ property and the server it lives on
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Channel {
    pub name: String,
    pub address: String,
}

impl Channel {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// One batch exactly as the DAQ hands it to us
#[derive(Clone, Debug)]
pub struct RawBatch {
    pub samples: Vec<u16>,
    pub channel: Channel,
    pub pulse_id: u64,
    pub timestamp: f64,
}

/// A batch after the unsigned ADC words were re-based to signed
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub samples: Vec<i16>,
    pub channel: Channel,
    pub pulse_id: u64,
    pub timestamp: f64,
}

/// Two's complement reinterpretation of an ADC word
pub fn unsigned_to_signed(word: u16) -> i16 {
    if word < 0x8000 {
        word as i16
    } else {
        (word as i32 - 0x1_0000) as i16
    }
}

pub fn normalize(raw: RawBatch) -> Batch {
    let samples = raw.samples.iter().map(|&w| unsigned_to_signed(w)).collect();
    Batch {
        samples,
        channel: raw.channel,
        pulse_id: raw.pulse_id,
        timestamp: raw.timestamp,
    }
}
