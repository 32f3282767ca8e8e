pub mod sys;
pub mod bus;
pub mod chips;
pub mod entity;
pub mod blocks;
pub mod cluster;
pub mod carrier;
pub mod calibration;
pub mod mode;
pub mod daq;
pub mod run;
pub mod protocol;

#[derive(Debug)]
pub enum Error {
    NotDetected(bus::Address),
    Config(String),
    DriverIo(std::io::Error),
    Daq(daq::Fault),
    Run(String),
    Other(Box<dyn std::error::Error + Sync + Send + 'static>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::NotDetected(addr) =>
                write!(f, "no supported hardware identity at {:?}", addr),
            Self::Config(message) =>
                write!(f, "configuration rejected: {}", message),
            Self::DriverIo(io_error) =>
                write!(f, "peripheral driver I/O error: {}", io_error),
            Self::Daq(fault) =>
                write!(f, "data acquisition fault: {}", fault),
            Self::Run(message) =>
                write!(f, "run error: {}", message),
            Self::Other(error) =>
                write!(f, "{}", error),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            &Self::DriverIo(ref io_error) => Some(io_error),
            &Self::Other(ref error) => Some(error.as_ref()),
            _ => None
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::DriverIo(error)
    }
}

pub type Result<T> =
    core::result::Result<T, Error>;

pub use bus::{Address, Bus};
pub use sys::{Driver, Pin, SpiSettings};
pub use entity::{EntityClass, EntityClassifier, Eui64, Version};
pub use carrier::Carrier;
pub use cluster::Cluster;
pub use daq::{DaqConfig, OneshotDaq};
pub use run::{Run, RunConfig, RunManager, RunState};
