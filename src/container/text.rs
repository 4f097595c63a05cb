//! Plain CSV holding a single column: a header row naming the element type, then
//! one value per row. Nothing is patched on finalize, the row count is the length.

use std::{fmt::Display, fs::File, path::Path};

use super::Dtype;
use crate::{Error, Result};

impl Dtype {
    fn csv_header(self) -> &'static str {
        match self {
            Dtype::F64 => "float64",
            Dtype::I16 => "int16",
        }
    }

    fn from_csv_header(header: &str) -> Result<Self> {
        [Dtype::F64, Dtype::I16]
            .into_iter()
            .find(|d| d.csv_header() == header)
            .ok_or_else(|| Error::Container(format!("unknown csv column type {header:?}")))
    }
}

/// Whether the first bytes of a file look like one of our csv headers
pub fn sniff(magic: &[u8]) -> bool {
    [Dtype::F64, Dtype::I16].into_iter().any(|d| {
        let header = d.csv_header().as_bytes();
        let n = header.len().min(magic.len());
        magic[..n] == header[..n]
    })
}

pub fn writer(file: File, dtype: Dtype) -> Result<csv::Writer<File>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.write_record([dtype.csv_header()])?;
    Ok(writer)
}

pub fn write_values<T: Display>(writer: &mut csv::Writer<File>, values: &[T]) -> Result<()> {
    for v in values {
        writer.write_record([v.to_string()])?;
    }
    Ok(())
}

pub struct Layout {
    pub dtype: Dtype,
    pub count: u64,
}

/// Read the header and count the rows, then hand back a reader positioned at the
/// first value
pub fn open(path: &Path) -> Result<(Layout, csv::Reader<File>)> {
    let mut scan = csv::ReaderBuilder::new().from_path(path)?;
    let dtype = Dtype::from_csv_header(scan.headers()?.get(0).unwrap_or_default())?;
    let mut count = 0u64;
    let mut record = csv::StringRecord::new();
    while scan.read_record(&mut record)? {
        count += 1;
    }
    let mut reader = csv::ReaderBuilder::new().from_path(path)?;
    reader.headers()?;
    Ok((Layout { dtype, count }, reader))
}
