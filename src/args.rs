//! Argument parsing for running from the command line

use std::{path::PathBuf, time::Duration};

use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};

use crate::{
    config::{Output, SAMPLE_RATES},
    container::Format,
    spectrum::{Scaling, WindowFunction},
    Channel,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
    /// DAQ server the channels live on
    #[clap(long, global = true, default_value = "TTF2.DAQ/DAQ.SERVER5/DAQ.DATA.SVR/")]
    pub server: String,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pull a past time window off the DAQ into one container file per channel
    Save(SaveArgs),
    /// Live power spectra of one channel
    Spectrum(SpectrumArgs),
    /// Record slow channels from their history
    Slowlog(SlowLogArgs),
}

#[derive(clap::Args, Debug)]
pub struct SaveArgs {
    /// Channel and output file stem, as NAME=STEM
    #[clap(short, long = "channel", required = true, value_parser = parse_output)]
    pub channels: Vec<Output>,
    /// Start of the window, e.g. 2022-01-03T12:23:00
    #[clap(short, long, value_parser = parse_timestamp)]
    pub start: NaiveDateTime,
    /// Length of the window in seconds
    #[clap(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    pub duration: u32,
    /// Output sampling rate in Hz
    #[clap(short, long, default_value_t = 16_000, value_parser = parse_rate)]
    pub rate: u32,
    /// Container format: mat, npy or csv
    #[clap(short, long, default_value = "mat", value_parser = parse_format)]
    pub format: Format,
    /// Directory to write into
    #[clap(long = "dir", default_value = ".")]
    pub directory: PathBuf,
    /// Comments saved next to the data as comments.txt
    #[clap(long)]
    pub comments: Option<String>,
    /// Go ahead even if files get overwritten or the output is huge
    #[clap(short, long)]
    pub yes: bool,
    /// Pace the simulated DAQ like the real ADC
    #[clap(long)]
    pub realtime: bool,
}

#[derive(clap::Args, Debug)]
pub struct SpectrumArgs {
    #[clap(short, long)]
    pub channel: String,
    /// Start of the window, e.g. 2022-01-03T12:23:00
    #[clap(short, long, value_parser = parse_timestamp)]
    pub start: NaiveDateTime,
    /// Length of the window in seconds
    #[clap(short, long, default_value_t = 60, value_parser = clap::value_parser!(u32).range(1..))]
    pub duration: u32,
    /// Segments averaged per spectrum
    #[clap(short, long, default_value_t = 8)]
    pub averages: usize,
    /// Samples per segment
    #[clap(long, default_value_t = 16_000)]
    pub segment: usize,
    #[clap(short, long, default_value = "hann", value_parser = parse_window)]
    pub window: WindowFunction,
    /// density (V²/Hz), asd (V/√Hz) or spectrum (V²)
    #[clap(long, default_value = "density", value_parser = parse_scaling)]
    pub scaling: Scaling,
    /// Multiplier from ADC counts to physical units
    #[clap(long, default_value_t = 1.0)]
    pub calibration: f64,
    /// Added to the calibrated samples
    #[clap(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub offset: f64,
    /// Milliseconds between spectra
    #[clap(long = "interval-ms", default_value = "1000", value_parser = parse_millis)]
    pub interval: Duration,
    /// Overlapping spectra from a ring, instead of disjoint windows
    #[clap(long)]
    pub sliding: bool,
    /// Samples shared by neighbouring segments
    #[clap(long, default_value_t = 0)]
    pub overlap: usize,
    /// Pace the simulated DAQ like the real ADC
    #[clap(long)]
    pub realtime: bool,
}

#[derive(clap::Args, Debug)]
pub struct SlowLogArgs {
    #[clap(short, long = "channel", required = true)]
    pub channels: Vec<String>,
    /// Directory to write the csv files into
    #[clap(long = "dir", default_value = ".")]
    pub directory: PathBuf,
    /// Polls per channel
    #[clap(short, long, default_value_t = 10)]
    pub polls: usize,
    #[clap(long = "poll-interval-ms", default_value = "1000", value_parser = parse_millis)]
    pub poll_interval: Duration,
    /// Longest to wait on one channel before checking the next
    #[clap(long = "timeout-ms", default_value = "100", value_parser = parse_millis)]
    pub timeout: Duration,
    /// Worker threads, defaults to one per channel
    #[clap(long)]
    pub workers: Option<usize>,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn parse_output(s: &str) -> Result<Output, String> {
    let (name, stem) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=STEM, got {s}"))?;
    if name.is_empty() {
        return Err("empty channel name".to_string());
    }
    Ok(Output {
        channel: Channel::new(name, ""),
        stem: stem.to_string(),
    })
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").map_err(|e| e.to_string())
}

fn parse_rate(s: &str) -> Result<u32, String> {
    let rate: u32 = s.parse().map_err(|_| format!("not a rate: {s}"))?;
    if SAMPLE_RATES.contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("rate must be one of {SAMPLE_RATES:?}"))
    }
}

fn parse_format(s: &str) -> Result<Format, String> {
    match s.to_ascii_lowercase().as_str() {
        "mat" => Ok(Format::Mat),
        "npy" => Ok(Format::Npy),
        "csv" => Ok(Format::Csv),
        _ => Err(format!("unknown format {s}, expected mat, npy or csv")),
    }
}

fn parse_window(s: &str) -> Result<WindowFunction, String> {
    s.parse()
}

fn parse_scaling(s: &str) -> Result<Scaling, String> {
    s.parse()
}

fn parse_millis(s: &str) -> Result<Duration, String> {
    s.parse()
        .map(Duration::from_millis)
        .map_err(|_| format!("not a number of milliseconds: {s}"))
}
