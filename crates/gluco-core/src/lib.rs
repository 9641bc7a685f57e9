//! # gluco-core
//!
//! Core logic for ingesting continuous glucose monitor data.
//!
//! This crate provides:
//! - Decoding and encoding of CGM transmitter messages
//! - Reassembly of chunked text messages
//! - Calibration of raw sensor values into glucose values
//! - Kalman smoothing of noisy raw values
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`wire`] - Fixed-layout binary codec with CRC validation per transmitter family
//! - [`reassembly`] - Stateful accumulator for fragmented messages
//! - [`calibration`] - Slope/intercept calibration strategies per sensor family
//! - [`kalman`] - Generic predict/update filter over scalars and matrices
//! - [`clock`] - Transmitter time to wall-clock conversion
//! - [`config`] - Configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Readings, calibrations and sensor sessions
//!
//! Nothing here performs I/O beyond configuration files. Callers own the
//! radio link and all persisted history.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod calibration;
pub mod clock;
pub mod config;
pub mod error;
pub mod kalman;
pub mod reassembly;
pub mod types;
pub mod wire;

// Re-export primary types for convenience
pub use calibration::{
    CalibrationInput, Calibrator, CalibratorKind, DexcomCalibrator, InitialCalibrationInput,
    Libre1Calibrator, Libre1NonFixedSlopeCalibrator, LibreOopCalibrator, NoCalibrator,
    ReadingInput, SlopeParameters,
};
pub use clock::TransmitterClock;
pub use config::{
    is_valid_transmitter_id, CalibrationSettings, CalibratorVariant, ConfigError, ConfigResult,
    CoreConfig, PhysiologicalBounds, ReassemblyConfig, TransmitterConfig,
};
pub use error::{CoreError, Result};
pub use kalman::{KalmanFilter, KalmanInput, Matrix, SmoothingConfig, SmoothingModel};
pub use reassembly::{split_into_fragments, FragmentReassembler};
pub use types::{CalculatedReading, CalibrationPoint, RawSample, SensorSession};
pub use wire::dexcom::{RxMessage, TxMessage};
pub use wire::miaomiao::{MiaoMiaoCommand, MiaoMiaoPacket, MiaoMiaoResponse};
pub use wire::{DecodeError, TransmitterMessage};
