use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to connect to the DAQ: {0}")]
    Connection(String),
    #[error("DAQ transport failed mid-run: {0}")]
    Transport(String),
    #[error("bad configuration: {0}")]
    Config(String),
    #[error("the measurement end time {0} has not been reached yet, it must be in the past")]
    Date(chrono::NaiveDateTime),
    #[error("malformed container: {0}")]
    Container(String),
    #[error("no more samples in the container")]
    EndOfData,
    #[error("cannot compute spectrum: {0}")]
    Spectrum(String),
    #[error("worker pool failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
