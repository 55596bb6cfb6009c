//! Acquisition core for FFT spectrometers.
//!
//! A [`Session`] drives a [`Spectrometer`] through connection, acquisition
//! and optional logging of averaged spectra. Each stage runs on its own
//! thread and hands finished spectra to the next through a single-slot
//! [`MeasurementBuffer`].

pub mod acquisition;
pub mod actor;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod datalog;
pub mod device;
pub mod error;
pub mod heartbeat;
pub mod measurement;
pub mod permutation;
pub mod session;
pub mod signal;
pub mod simulator;
pub mod tui;
pub mod utils;
#[cfg(feature = "hdf5")]
pub mod writer;

pub use acquisition::{AcqState, AcquisitionCommand, AcquisitionController, AcquisitionSettings};
pub use actor::{ActorCommand, CommandActor, CommandSender};
pub use buffer::{try_copy_latest, BufferGuard, MeasurementBuffer};
pub use config::Conf;
pub use datalog::{DataLogger, DataLoggerSettings, MemorySink, SpectrumSink};
pub use device::{DeviceHandle, DeviceProperties, MemoryBank, Spectrometer};
pub use error::{AcquisitionError, AssemblyError, DeviceError, InvalidCommand};
pub use measurement::{AcquisitionStatistics, Measurement};
pub use permutation::{PermutationTable, SpectrumAssembler};
pub use session::{Session, SessionCommand, SessionHooks, SessionSettings, SessionState};
pub use signal::Signal;
pub use simulator::{FaultSite, SimulatedSpectrometer, SimulatorSettings};
#[cfg(feature = "hdf5")]
pub use writer::HDF5Writer;
