//! Spectrometer driver interface.
//!
//! Drivers implement [`Spectrometer`]; the pipeline only ever reaches them
//! through a [`DeviceHandle`], which serialises every call sequence behind
//! one mutex.

use crate::error::DeviceError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One of the two memory banks the FFT engine writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryBank {
    A,
    B,
}

/// Operations the acquisition pipeline needs from an FFT spectrometer.
pub trait Spectrometer: Send + 'static {
    fn resource(&self) -> &str;
    fn set_resource(&mut self, resource: &str);

    fn connect(&mut self) -> Result<(), DeviceError>;
    fn disconnect(&mut self) -> Result<(), DeviceError>;
    fn is_connected(&self) -> bool;

    fn num_averages(&self) -> Result<u32, DeviceError>;
    fn set_num_averages(&mut self, num_averages: u32) -> Result<(), DeviceError>;
    fn continuous_mode(&self) -> Result<bool, DeviceError>;
    fn set_continuous_mode(&mut self, continuous: bool) -> Result<(), DeviceError>;
    fn transform_length(&self) -> Result<u32, DeviceError>;
    fn is_complex(&self) -> Result<bool, DeviceError>;
    /// Sample rate after decimation, in samples per second.
    fn effective_sample_rate(&self) -> Result<f64, DeviceError>;

    /// Arms the FFT engine. Calling it while already processing is harmless.
    fn start_processing(&mut self) -> Result<(), DeviceError>;
    /// Disarms the FFT engine. Calling it while idle is harmless.
    fn stop_processing(&mut self) -> Result<(), DeviceError>;

    /// Number of averaged spectra completed since the last start. Never
    /// decreases while processing.
    fn measurement_count(&mut self) -> Result<u64, DeviceError>;
    /// Raw contents of one memory bank in hardware order.
    fn read_channel(&mut self, bank: MemoryBank) -> Result<Vec<f64>, DeviceError>;
    fn overflow(&self) -> Result<bool, DeviceError>;
    fn memory_error(&self) -> Result<bool, DeviceError>;

    /// Identity and slowly changing values such as temperatures.
    fn properties(&self) -> Result<DeviceProperties, DeviceError>;
}

/// Shared, lock-guarded access to a driver.
///
/// Each caller locks for one call sequence and releases immediately. A lock
/// poisoned by a panicking thread is recovered.
#[derive(Debug)]
pub struct DeviceHandle<D> {
    inner: Arc<Mutex<D>>,
}

impl<D> Clone for DeviceHandle<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Spectrometer> DeviceHandle<D> {
    pub fn new(device: D) -> Self {
        Self {
            inner: Arc::new(Mutex::new(device)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, D> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot of instrument identity and health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceProperties {
    pub model: String,
    pub serial_number: String,
    pub firmware_revision: String,
    pub driver_revision: String,
    pub resource: String,
    pub sample_rate: f64,
    pub transform_length: u32,
    pub is_complex: bool,
    pub num_averages: u32,
    pub temperature_board_c: f64,
    pub temperature_adc_c: f64,
}

impl DeviceProperties {
    /// Multi-line `name: value` dump for the log.
    pub fn report(&self) -> String {
        let entries: [(&str, String); 11] = [
            ("Model", self.model.clone()),
            ("SerialNumber", self.serial_number.clone()),
            ("FirmwareRevision", self.firmware_revision.clone()),
            ("DriverRevision", self.driver_revision.clone()),
            ("Resource", self.resource.clone()),
            ("SampleRate", format!("{:.6e}", self.sample_rate)),
            ("TransformLength", self.transform_length.to_string()),
            ("Complex", self.is_complex.to_string()),
            ("NumAverages", self.num_averages.to_string()),
            ("TempBoard_C", format!("{:.1}", self.temperature_board_c)),
            ("TempADC_C", format!("{:.1}", self.temperature_adc_c)),
        ];

        let mut report = String::new();
        for (name, value) in entries {
            report.push_str(&format!("{}: {}\n", name, value));
        }
        if report.ends_with('\n') {
            report.pop();
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_lists_every_property() {
        let props = DeviceProperties {
            model: "SIM-FFT".into(),
            serial_number: "0001".into(),
            transform_length: 4096,
            ..Default::default()
        };
        let report = props.report();
        assert_eq!(report.lines().count(), 11);
        assert!(report.starts_with("Model: SIM-FFT\n"));
        assert!(report.contains("TransformLength: 4096"));
        assert!(!report.ends_with('\n'));
    }
}
