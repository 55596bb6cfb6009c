use crate::device::MemoryBank;
use thiserror::Error;

/// Failures reported by a spectrometer driver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device is not connected")]
    NotConnected,

    #[error("Connection to {resource} failed: {reason}")]
    ConnectionFailed { resource: String, reason: String },

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Invalid effective sample rate: {0}")]
    InvalidSampleRate(f64),

    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Contract violations detected while reordering raw bank data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("Transform length {0} must be a power of two of at least 32 (16 for complex data)")]
    InvalidTransformLength(u32),

    #[error("Bank {bank:?} holds {actual} words, expected {expected}")]
    LengthMismatch {
        bank: MemoryBank,
        expected: usize,
        actual: usize,
    },
}

/// Anything that can abort an acquisition session inside the controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),
}

/// A command token that is not part of an actor's command set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{actor} ignored invalid command: {token}. Must be one of {valid:?}")]
pub struct InvalidCommand {
    pub actor: &'static str,
    pub token: String,
    pub valid: &'static [&'static str],
}
