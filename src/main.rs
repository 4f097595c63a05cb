use std::{process::ExitCode, sync::Arc, thread};

use clap::Parser;
use daq_slurper::{
    args::{convert_filter, Args, Command, SaveArgs, SlowLogArgs, SpectrumArgs},
    capture::{Acquisition, CancelToken},
    config::{Output, RunConfig, SlowLogConfig, SpectrumConfig},
    device::{SimulatedDevice, SimulatedHistory},
    pipeline::{self, ContainerSink, WindowSink},
    slowlog,
    spectrum::{self, Spectrum},
    window::{Eviction, WindowBuffer},
    Channel, Error, Result,
};
use tracing::{error, info, warn};

/// Rows of history the simulated slow channels keep around
const HISTORY_DEPTH: usize = 60;

fn save(args: SaveArgs, server: &str, cancel: &CancelToken) -> Result<bool> {
    let outputs = args
        .channels
        .into_iter()
        .map(|o| Output {
            channel: Channel::new(o.channel.name, server),
            stem: o.stem,
        })
        .collect();
    let mut cfg = RunConfig::new(
        outputs,
        args.start,
        chrono::Duration::seconds(args.duration as i64),
        args.rate,
        args.format,
        args.directory,
    );
    cfg.comments = args.comments;

    let warnings = cfg.check(chrono::Local::now().naive_local())?;
    for w in &warnings {
        warn!("{w}");
    }
    if !warnings.is_empty() && !args.yes {
        error!("Save canceled, pass --yes to go ahead anyway");
        return Ok(false);
    }
    print!("{}", cfg.overview());

    // Writers first, so a bad directory fails before we connect
    let mut sink = ContainerSink::create(&cfg)?;
    if let Some(path) = cfg.write_comments()? {
        info!(path = %path.display(), "Saved user comments");
    }
    let mut device = SimulatedDevice::new(server, args.realtime);
    let summary = match pipeline::run(&mut device, &cfg.acquisition(), &mut sink, cancel) {
        Ok(summary) => summary,
        Err(e) => {
            sink.discard()?;
            return Err(e);
        }
    };
    print!("{summary}");
    if !summary.is_success() {
        sink.discard()?;
        return Ok(false);
    }
    for (path, len) in sink.finish()? {
        info!(path = %path.display(), samples = len, "Saved");
    }
    Ok(true)
}

fn live_spectrum(args: SpectrumArgs, server: &str, cancel: &CancelToken) -> Result<bool> {
    let channel = Channel::new(args.channel, server);
    let mut cfg = SpectrumConfig::new(channel.clone());
    cfg.averages = args.averages;
    cfg.segment_length = args.segment;
    cfg.window = args.window;
    cfg.scaling = args.scaling;
    cfg.calibration = args.calibration;
    cfg.offset = args.offset;
    cfg.overlap = args.overlap;
    cfg.interval = args.interval;
    cfg.eviction = if args.sliding {
        Eviction::DropOldest
    } else {
        Eviction::SnapshotAndClear
    };

    let buffer = Arc::new(WindowBuffer::new(cfg.window_capacity()?, cfg.eviction)?);
    let (tx, rx) = crossbeam_channel::bounded::<Spectrum>(16);
    let worker = spectrum::spawn_worker(buffer.clone(), cfg.clone(), cancel.clone(), tx)?;
    let printer = thread::Builder::new()
        .name("printer".into())
        .spawn(move || {
            for spectrum in rx {
                if let Some((freq, power)) = spectrum.peak() {
                    info!(freq, power, bins = spectrum.len(), "Spectrum peak");
                }
            }
        })?;

    let stop = args.start + chrono::Duration::seconds(args.duration as i64);
    let acq = Acquisition::new(vec![channel.clone()], args.start, stop);
    let mut device = SimulatedDevice::new(server, args.realtime);
    let mut sink = WindowSink::new(buffer, channel.name);
    let summary = pipeline::run(&mut device, &acq, &mut sink, cancel);

    // Let the worker pick up the last full window before stopping it
    cancel.wait(cfg.interval);
    cancel.cancel();
    let sent = worker
        .join()
        .map_err(|_| Error::Worker("spectrum worker panicked".into()))?;
    printer
        .join()
        .map_err(|_| Error::Worker("spectrum printer panicked".into()))?;

    let summary = summary?;
    print!("{summary}");
    info!(spectra = sent, "Done");
    Ok(summary.is_success())
}

fn slow_log(args: SlowLogArgs, server: &str, cancel: &CancelToken) -> Result<bool> {
    let channels = args
        .channels
        .into_iter()
        .map(|name| Channel::new(name, server))
        .collect();
    let mut cfg = SlowLogConfig::new(channels, args.directory);
    cfg.polls = args.polls;
    cfg.poll_interval = args.poll_interval;
    cfg.task_timeout = args.timeout;
    if let Some(workers) = args.workers {
        cfg.workers = workers;
    }
    let report = slowlog::record(Arc::new(SimulatedHistory::new(HISTORY_DEPTH)), &cfg, cancel)?;
    print!("{report}");
    Ok(report.failures() == 0)
}

fn main() -> ExitCode {
    // Get the CLI options
    let args = Args::parse();

    // Setup logging
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();
    info!("Starting DAQ slurper!");

    // Ctrl-C stops every loop after the batch it's on
    let cancel = CancelToken::new();
    let handler_cancel = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Interrupted, stopping after the current batch");
        handler_cancel.cancel();
    }) {
        warn!("Couldn't install the Ctrl-C handler: {e}");
    }

    let res = match args.command {
        Command::Save(save_args) => save(save_args, &args.server, &cancel),
        Command::Spectrum(spectrum_args) => live_spectrum(spectrum_args, &args.server, &cancel),
        Command::Slowlog(slowlog_args) => slow_log(slowlog_args, &args.server, &cancel),
    };
    match res {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
