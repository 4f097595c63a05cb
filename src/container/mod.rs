//! Streaming array containers.
//!
//! A [`ContainerWriter`] appends raw elements as they arrive and only learns the
//! final length on [`finalize`](ContainerWriter::finalize), where it seeks back and
//! patches the placeholder sizes in the header. Every format holds one 1-D array.

pub mod mat;
pub mod npy;
pub mod text;

use std::{
    fmt::Display,
    fs::File,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
    str::FromStr,
};

use byte_slice_cast::{AsByteSlice, ToByteSlice};
use tracing::{debug, warn};

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dtype {
    F64,
    I16,
}

impl Dtype {
    pub fn size(self) -> usize {
        match self {
            Dtype::F64 => 8,
            Dtype::I16 => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "little") {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }
}

/// Element types a container can hold
pub trait Element: Copy + ToByteSlice + Display + FromStr + 'static {
    const DTYPE: Dtype;
    fn decode(bytes: &[u8], order: ByteOrder) -> Self;
}

impl Element for f64 {
    const DTYPE: Dtype = Dtype::F64;

    fn decode(bytes: &[u8], order: ByteOrder) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        match order {
            ByteOrder::Little => f64::from_le_bytes(buf),
            ByteOrder::Big => f64::from_be_bytes(buf),
        }
    }
}

impl Element for i16 {
    const DTYPE: Dtype = Dtype::I16;

    fn decode(bytes: &[u8], order: ByteOrder) -> Self {
        let buf = [bytes[0], bytes[1]];
        match order {
            ByteOrder::Little => i16::from_le_bytes(buf),
            ByteOrder::Big => i16::from_be_bytes(buf),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// MATLAB level 5 MAT-file
    Mat,
    /// NumPy npy
    Npy,
    /// One value per row under a type header
    Csv,
}

impl Format {
    pub fn extension(self) -> &'static str {
        match self {
            Format::Mat => "mat",
            Format::Npy => "npy",
            Format::Csv => "csv",
        }
    }
}

enum Sink {
    Mat(BufWriter<File>),
    Npy(BufWriter<File>),
    Csv(csv::Writer<File>),
}

enum State {
    Open,
    Finalized,
    Discarded,
    /// Finalize ran into an I/O error, the header may still hold placeholders
    Failed(String),
}

pub struct ContainerWriter<T: Element> {
    path: PathBuf,
    sink: Sink,
    elements: u64,
    state: State,
    _element: PhantomData<T>,
}

impl<T: Element> ContainerWriter<T> {
    /// Create (truncating) `path` and write a header with placeholder sizes
    pub fn create(path: impl AsRef<Path>, format: Format) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let sink = match format {
            Format::Mat => {
                let mut file = BufWriter::new(file);
                mat::write_header(&mut file, T::DTYPE)?;
                Sink::Mat(file)
            }
            Format::Npy => {
                let mut file = BufWriter::new(file);
                npy::write_header(&mut file, T::DTYPE)?;
                Sink::Npy(file)
            }
            Format::Csv => Sink::Csv(text::writer(file, T::DTYPE)?),
        };
        debug!(path = %path.display(), ?format, dtype = ?T::DTYPE, "Opened container");
        Ok(Self {
            path,
            sink,
            elements: 0,
            state: State::Open,
            _element: PhantomData,
        })
    }

    pub fn write(&mut self, samples: &[T]) -> Result<()> {
        if !matches!(self.state, State::Open) {
            return Err(Error::Container(format!(
                "{} is no longer open for writing",
                self.path.display()
            )));
        }
        match &mut self.sink {
            Sink::Mat(file) | Sink::Npy(file) => file.write_all(samples.as_byte_slice())?,
            Sink::Csv(writer) => text::write_values(writer, samples)?,
        }
        self.elements += samples.len() as u64;
        Ok(())
    }

    /// Elements written so far
    pub fn len(&self) -> u64 {
        self.elements
    }

    pub fn is_empty(&self) -> bool {
        self.elements == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> Format {
        match self.sink {
            Sink::Mat(_) => Format::Mat,
            Sink::Npy(_) => Format::Npy,
            Sink::Csv(_) => Format::Csv,
        }
    }

    /// Patch the header with the real sizes. Once that succeeds further calls do
    /// nothing; once it fails every further call reports the failure.
    pub fn finalize(&mut self) -> Result<()> {
        match &self.state {
            State::Open => {}
            State::Finalized => return Ok(()),
            State::Discarded => {
                return Err(Error::Container(format!(
                    "{} was discarded",
                    self.path.display()
                )))
            }
            State::Failed(reason) => {
                return Err(Error::Container(format!(
                    "{} could not be finalized: {reason}",
                    self.path.display()
                )))
            }
        }
        match self.patch_and_flush() {
            Ok(()) => {
                self.state = State::Finalized;
                debug!(path = %self.path.display(), elements = self.elements, "Finalized container");
                Ok(())
            }
            Err(e) => {
                self.state = State::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn patch_and_flush(&mut self) -> Result<()> {
        let data_end = self.elements * T::DTYPE.size() as u64;
        match &mut self.sink {
            Sink::Mat(file) => {
                file.seek(SeekFrom::Start(mat::DATA_OFFSET + data_end))?;
                mat::patch(file, T::DTYPE)?;
                file.flush()?;
            }
            Sink::Npy(file) => {
                file.seek(SeekFrom::Start(npy::PREAMBLE_LEN + data_end))?;
                npy::patch(file, T::DTYPE)?;
                file.flush()?;
            }
            Sink::Csv(writer) => writer.flush()?,
        }
        Ok(())
    }

    /// Throw away a partial file. If the file can't be removed the writer is left
    /// open, so dropping it still finalizes what was written.
    pub fn discard(mut self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        self.state = State::Discarded;
        warn!(path = %self.path.display(), "Discarded partial container");
        Ok(())
    }
}

impl<T: Element> Drop for ContainerWriter<T> {
    fn drop(&mut self) {
        if let State::Failed(reason) = &self.state {
            warn!(path = %self.path.display(), "Dropping a container whose header was never patched: {reason}");
        } else if matches!(self.state, State::Open) {
            warn!(path = %self.path.display(), "Container dropped before finalize, patching now");
            if let Err(e) = self.finalize() {
                warn!(path = %self.path.display(), "Could not finalize on drop: {e}");
            }
        }
    }
}

enum Source {
    Binary(BufReader<File>),
    Text {
        reader: csv::Reader<File>,
        record: csv::StringRecord,
    },
}

/// Reads back any container format, detected from the first bytes
pub struct ContainerReader {
    source: Source,
    format: Format,
    dtype: Dtype,
    order: ByteOrder,
    len: u64,
    consumed: u64,
}

impl ContainerReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = BufReader::new(File::open(path)?);
        let file_len = file.get_ref().metadata()?.len();
        let mut magic = [0u8; 6];
        file.read_exact(&mut magic)?;
        file.rewind()?;

        if text::sniff(&magic) {
            let (layout, reader) = text::open(path)?;
            return Ok(Self {
                source: Source::Text {
                    reader,
                    record: csv::StringRecord::new(),
                },
                format: Format::Csv,
                dtype: layout.dtype,
                order: ByteOrder::native(),
                len: layout.count,
                consumed: 0,
            });
        }

        let (format, dtype, order, data_offset, len) = if &magic[..] == npy::MAGIC {
            let layout = npy::parse_header(&mut file)?;
            (
                Format::Npy,
                layout.dtype,
                layout.order,
                layout.data_offset,
                layout.count,
            )
        } else {
            let layout = mat::parse_header(&mut file)?;
            (
                Format::Mat,
                layout.dtype,
                layout.order,
                layout.data_offset,
                layout.data_bytes / layout.dtype.size() as u64,
            )
        };
        let data_end = len
            .checked_mul(dtype.size() as u64)
            .and_then(|bytes| bytes.checked_add(data_offset));
        if !matches!(data_end, Some(end) if end <= file_len) {
            return Err(Error::Container(format!(
                "header declares {len} elements but the file is truncated"
            )));
        }
        file.seek(SeekFrom::Start(data_offset))?;
        Ok(Self {
            source: Source::Binary(file),
            format,
            dtype,
            order,
            len,
            consumed: 0,
        })
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Element count declared by the header
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> u64 {
        self.len - self.consumed
    }

    /// Read up to `n` elements, never past the declared end of data
    pub fn read<T: Element>(&mut self, n: usize) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(Error::Container(format!(
                "asked for {:?} but the container holds {:?}",
                T::DTYPE,
                self.dtype
            )));
        }
        if self.remaining() == 0 {
            return Err(Error::EndOfData);
        }
        let take = (n as u64).min(self.remaining()) as usize;
        let values = match &mut self.source {
            Source::Binary(file) => {
                let mut bytes = vec![0u8; take * self.dtype.size()];
                file.read_exact(&mut bytes)?;
                bytes
                    .chunks_exact(self.dtype.size())
                    .map(|chunk| T::decode(chunk, self.order))
                    .collect()
            }
            Source::Text { reader, record } => {
                let mut values = Vec::with_capacity(take);
                for _ in 0..take {
                    if !reader.read_record(record)? {
                        return Err(Error::Container("csv ended before its last row".into()));
                    }
                    let field = record.get(0).unwrap_or_default().trim();
                    let value = field.parse().map_err(|_| {
                        Error::Container(format!("{field:?} is not a {:?} value", T::DTYPE))
                    })?;
                    values.push(value);
                }
                values
            }
        };
        self.consumed += take as u64;
        Ok(values)
    }

    pub fn read_all<T: Element>(&mut self) -> Result<Vec<T>> {
        match self.read(self.remaining() as usize) {
            Err(Error::EndOfData) => Ok(vec![]),
            other => other,
        }
    }
}
