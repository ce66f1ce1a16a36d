//! Host library for the CR30 colorimeter.
//!
//! The crate is split into two halves that meet in [`orchestrator`]:
//!
//! - the protocol engine: [`packet`] frames, the [`transport`] that moves them
//!   over a serial link, the [`spd`] chunk assembler and the [`session`] state
//!   machine driving handshake, calibration and measurement;
//! - the colorimetry pipeline: CIE reference data and spline resampling in
//!   [`spectral`], and XYZ/LAB/RGB conversion plus chromatic adaptation in
//!   [`color`].

pub mod chart;
pub mod color;
pub mod command;
pub mod config;
pub mod orchestrator;
pub mod packet;
pub mod session;
pub mod spd;
pub mod spectral;
pub mod transport;

pub use color::{AdaptationMethod, CieColorScience, ColorScience, ColorSpace, Lab, Rgb, WhitePoint, Xyz};
pub use config::Config;
pub use orchestrator::{MeasurementOrchestrator, MeasurementResult};
pub use packet::{Frame, FrameError, PacketCodec};
pub use session::{DeviceInfo, DeviceSession, SessionState, SpectralMeasurement};
pub use spd::{ChunkType, SpdAssembler};
pub use spectral::{Illuminant, Observer, SpectralConverter, SpectrumDataLoader, Viewing};
pub use transport::Transport;

pub type Identifier = uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("serial port {0} is already held by another session")]
    PortBusy(String),
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("payload of {0} bytes exceeds the 52 byte frame payload")]
    PayloadTooLarge(usize),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("{target} calibration failed: {reason}")]
    Calibration {
        target: command::CalibrationTarget,
        reason: String,
    },
    #[error("measurement timed out waiting for {step}")]
    MeasurementTimeout { step: String },
    #[error("spectral data incomplete, missing chunks {missing:?}")]
    IncompleteData { missing: Vec<ChunkType> },
    #[error("invalid spectrum: {0}")]
    InvalidSpectrum(String),
    #[error("operation requires session state {expected}, session is {actual:?}")]
    InvalidState {
        expected: &'static str,
        actual: SessionState,
    },
    #[error("unknown white point '{0}'")]
    UnknownWhitePoint(String),
    #[error("unknown illuminant '{0}'")]
    UnknownIlluminant(String),
    #[error("unknown observer '{0}'")]
    UnknownObserver(String),
    #[error("unknown adaptation method '{0}'")]
    UnknownAdaptation(String),
    #[error("unknown color space '{0}'")]
    UnknownColorSpace(String),
    #[error("reference data error: {0}")]
    ReferenceData(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Non-fatal conditions. These are logged and, where they concern a single
/// measurement, carried on it; they never travel through `Err`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Warning {
    /// The XYZ in the measurement header disagrees with the copy in chunk 0x13.
    DataIntegrity {
        header: Xyz,
        chunk: Xyz,
        difference: f64,
    },
    /// Sample wavelengths are not evenly spaced.
    NonUniformSpacing { min_step: f64, max_step: f64 },
}

impl core::fmt::Display for Warning {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Warning::DataIntegrity { header, chunk, difference } => write!(
                f,
                "header XYZ {header} differs from chunk XYZ {chunk} by {difference:.4}"
            ),
            Warning::NonUniformSpacing { min_step, max_step } => write!(
                f,
                "non-uniform wavelength spacing ({min_step} nm to {max_step} nm)"
            ),
        }
    }
}
