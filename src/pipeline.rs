//! Glue between an acquisition session and whatever consumes its batches

use std::{path::PathBuf, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    capture::{Acquisition, CancelToken, Session},
    config::{ensure_directory, RunConfig},
    container::{ContainerWriter, Format},
    decimate::StreamingDecimator,
    device::Device,
    monitoring::RunSummary,
    window::WindowBuffer,
    Batch, Result,
};

/// Receives every group of fresh batches, in device order
pub trait BatchSink {
    fn consume(&mut self, group: &[Batch]) -> Result<()>;
}

impl<F> BatchSink for F
where
    F: FnMut(&[Batch]) -> Result<()>,
{
    fn consume(&mut self, group: &[Batch]) -> Result<()> {
        self(group)
    }
}

/// Connect, stream every group into `sink` until the run ends, disconnect.
///
/// Only a failure to connect is returned as an error. Anything that goes wrong
/// afterwards (transport or sink) ends the run and lands in the summary.
pub fn run<D, S>(
    device: &mut D,
    acq: &Acquisition,
    sink: &mut S,
    cancel: &CancelToken,
) -> Result<RunSummary>
where
    D: Device,
    S: BatchSink + ?Sized,
{
    let session = Session::connect(device, acq)?;
    Ok(session.run(cancel, |group| sink.consume(group)))
}

enum ChannelWriter {
    Raw(ContainerWriter<i16>),
    Decimated {
        decimator: StreamingDecimator,
        writer: ContainerWriter<f64>,
    },
}

impl ChannelWriter {
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        match self {
            ChannelWriter::Raw(writer) => writer.write(samples),
            ChannelWriter::Decimated { decimator, writer } => {
                let input: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
                writer.write(&decimator.process(&input))
            }
        }
    }

    fn finish(self) -> Result<(PathBuf, u64)> {
        match self {
            ChannelWriter::Raw(mut writer) => {
                writer.finalize()?;
                Ok((writer.path().to_path_buf(), writer.len()))
            }
            ChannelWriter::Decimated {
                mut decimator,
                mut writer,
            } => {
                writer.write(&decimator.finish())?;
                writer.finalize()?;
                Ok((writer.path().to_path_buf(), writer.len()))
            }
        }
    }

    fn discard(self) -> Result<()> {
        match self {
            ChannelWriter::Raw(writer) => writer.discard(),
            ChannelWriter::Decimated { writer, .. } => writer.discard(),
        }
    }
}

/// One container file per channel. Samples are written as they arrive, decimated
/// first when the target rate is below the base rate.
pub struct ContainerSink {
    writers: Vec<(String, ChannelWriter)>,
}

impl ContainerSink {
    pub fn new() -> Self {
        Self { writers: vec![] }
    }

    /// Open a writer for every output of `cfg`
    pub fn create(cfg: &RunConfig) -> Result<Self> {
        ensure_directory(&cfg.directory)?;
        let factor = cfg.decimation_factor()?;
        let mut sink = Self::new();
        for output in &cfg.outputs {
            let path = cfg.output_path(output);
            if let Err(e) = sink.add(&output.channel.name, path, cfg.format, factor) {
                sink.discard()?;
                return Err(e);
            }
        }
        info!(files = sink.writers.len(), factor, "Opened output containers");
        Ok(sink)
    }

    pub fn add(
        &mut self,
        channel: &str,
        path: impl Into<PathBuf>,
        format: Format,
        factor: u32,
    ) -> Result<()> {
        let path = path.into();
        let writer = if factor == 1 {
            ChannelWriter::Raw(ContainerWriter::create(&path, format)?)
        } else {
            ChannelWriter::Decimated {
                decimator: StreamingDecimator::new(factor)?,
                writer: ContainerWriter::create(&path, format)?,
            }
        };
        self.writers.push((channel.to_owned(), writer));
        Ok(())
    }

    /// Flush the decimators and patch every header. Returns each file with its
    /// element count.
    pub fn finish(self) -> Result<Vec<(PathBuf, u64)>> {
        let mut files = Vec::with_capacity(self.writers.len());
        for (channel, writer) in self.writers {
            let (path, len) = writer.finish()?;
            debug!(channel = %channel, path = %path.display(), len, "Closed container");
            files.push((path, len));
        }
        Ok(files)
    }

    /// Delete every partial file
    pub fn discard(self) -> Result<()> {
        for (_, writer) in self.writers {
            writer.discard()?;
        }
        Ok(())
    }
}

impl Default for ContainerSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchSink for ContainerSink {
    fn consume(&mut self, group: &[Batch]) -> Result<()> {
        for batch in group {
            match self
                .writers
                .iter_mut()
                .find(|(name, _)| *name == batch.channel.name)
            {
                Some((_, writer)) => writer.write(&batch.samples)?,
                None => warn!(channel = %batch.channel.name, "No output for channel"),
            }
        }
        Ok(())
    }
}

/// Feeds one channel into the window the spectrum worker reads
pub struct WindowSink {
    buffer: Arc<WindowBuffer<Vec<i16>>>,
    channel: String,
}

impl WindowSink {
    pub fn new(buffer: Arc<WindowBuffer<Vec<i16>>>, channel: impl Into<String>) -> Self {
        Self {
            buffer,
            channel: channel.into(),
        }
    }
}

impl BatchSink for WindowSink {
    fn consume(&mut self, group: &[Batch]) -> Result<()> {
        for batch in group.iter().filter(|b| b.channel.name == self.channel) {
            if !self.buffer.push(batch.samples.clone()) {
                warn!(
                    pulse = batch.pulse_id,
                    overruns = self.buffer.overruns(),
                    "Spectrum worker is behind, dropped a batch"
                );
            }
        }
        Ok(())
    }
}

/// Hands every group to each sink in turn, stopping at the first failure
pub struct Fanout<'a>(pub Vec<&'a mut dyn BatchSink>);

impl<'a> BatchSink for Fanout<'a> {
    fn consume(&mut self, group: &[Batch]) -> Result<()> {
        for sink in self.0.iter_mut() {
            sink.consume(group)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        container::ContainerReader,
        device::{Fetch, ScriptedDevice},
        window::Eviction,
        Channel, Error, RawBatch, SAMPLES_PER_BATCH,
    };
    use chrono::NaiveDateTime;
    use std::time::Duration;

    fn acquisition() -> Acquisition {
        let start = NaiveDateTime::parse_from_str("2022-01-03T12:23:00", "%Y-%m-%dT%H:%M:%S")
            .unwrap();
        let mut acq = Acquisition::new(
            vec![Channel::new("A", "srv")],
            start,
            start + chrono::Duration::seconds(1),
        );
        acq.empty_backoff = Duration::ZERO;
        acq
    }

    fn script(pulses: u64) -> ScriptedDevice {
        ScriptedDevice::new((1..=pulses).map(|p| {
            Fetch::Group(vec![RawBatch {
                samples: vec![p as u16; SAMPLES_PER_BATCH],
                channel: Channel::new("A", "srv"),
                pulse_id: p,
                timestamp: p as f64,
            }])
        }))
    }

    #[test]
    fn test_cancel_after_k_batches() {
        for k in [1, 3, 7] {
            let mut dev = script(10);
            let cancel = CancelToken::new();
            let mut seen = 0;
            let mut sink = |_: &[Batch]| -> Result<()> {
                seen += 1;
                if seen == k {
                    cancel.cancel();
                }
                Ok(())
            };
            let summary = run(&mut dev, &acquisition(), &mut sink, &cancel).unwrap();
            assert_eq!(seen, k);
            assert!(summary.cancelled);
            assert_eq!(summary.tally.get("A"), Some(k as u64));
            assert_eq!(dev.disconnects, 1);
        }
    }

    #[test]
    fn test_connect_failure_is_an_error() {
        let mut dev = ScriptedDevice::refusing_connect("nope");
        let mut sink = |_: &[Batch]| -> Result<()> { Ok(()) };
        let res = run(&mut dev, &acquisition(), &mut sink, &CancelToken::new());
        assert!(matches!(res, Err(Error::Connection(_))));
    }

    #[test]
    fn test_container_sink_decimates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.npy");
        let mut sink = ContainerSink::new();
        sink.add("A", &path, Format::Npy, 4).unwrap();
        let summary = run(&mut script(8), &acquisition(), &mut sink, &CancelToken::new())
            .unwrap();
        assert!(summary.is_success());
        let files = sink.finish().unwrap();
        assert_eq!(files, vec![(path.clone(), 1000)]);
        let data: Vec<f64> = ContainerReader::open(&path).unwrap().read_all().unwrap();
        assert_eq!(data.len(), 1000);
    }

    #[test]
    fn test_discard_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mat");
        let mut sink = ContainerSink::new();
        sink.add("A", &path, Format::Mat, 1).unwrap();
        sink.consume(&[Batch {
            samples: vec![1, 2, 3],
            channel: Channel::new("A", "srv"),
            pulse_id: 1,
            timestamp: 0.0,
        }])
        .unwrap();
        sink.discard().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_fanout_feeds_file_and_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mat");
        let mut file = ContainerSink::new();
        file.add("A", &path, Format::Mat, 1).unwrap();
        let buffer = Arc::new(WindowBuffer::new(4, Eviction::DropOldest).unwrap());
        let mut window = WindowSink::new(buffer.clone(), "A");
        let sinks: Vec<&mut dyn BatchSink> = vec![&mut file, &mut window];
        let mut fanout = Fanout(sinks);
        run(&mut script(6), &acquisition(), &mut fanout, &CancelToken::new()).unwrap();
        let files = file.finish().unwrap();
        assert_eq!(files[0].1, 6 * SAMPLES_PER_BATCH as u64);
        let firsts: Vec<i16> = buffer.snapshot().iter().map(|b| b[0]).collect();
        assert_eq!(firsts, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_sink_failure_lands_in_summary() {
        let mut n = 0;
        let mut sink = |_: &[Batch]| -> Result<()> {
            n += 1;
            if n == 2 {
                Err(Error::Container("disk full".into()))
            } else {
                Ok(())
            }
        };
        let summary = run(&mut script(5), &acquisition(), &mut sink, &CancelToken::new())
            .unwrap();
        assert!(!summary.is_success());
        assert_eq!(summary.total_events, 2);
    }
}
