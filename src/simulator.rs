//! Software stand-in for an FFT spectrometer.
//!
//! Measurements complete on a wall-clock schedule derived from the transform
//! length, sample rate and number of averages, exactly as the hardware
//! would. Spectra are a noise floor plus a single tone, written into the two
//! memory banks in the hardware's bit-reversed, interleaved order.

use crate::device::{DeviceProperties, MemoryBank, Spectrometer};
use crate::error::DeviceError;
use crate::permutation::SpectrumAssembler;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorSettings {
    pub resource: String,
    pub transform_length: u32,
    pub is_complex: bool,
    /// Effective sample rate, in samples per second.
    pub sample_rate: f64,
    pub num_averages: u32,
    pub continuous: bool,
    pub tone_bin: usize,
    pub tone_amplitude: f64,
    pub noise_floor: f64,
    pub seed: u64,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            resource: "SIM::0::INSTR".to_string(),
            transform_length: 4096,
            is_complex: false,
            sample_rate: 40.96e6,
            num_averages: 1000,
            continuous: true,
            tone_bin: 300,
            tone_amplitude: 1.0e3,
            noise_floor: 1.0,
            seed: 0x5eed,
        }
    }
}

/// Calls that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSite {
    Connect,
    StartProcessing,
    MeasurementCount,
    ReadChannel,
}

struct Frame {
    count: u64,
    bank_a: Vec<f64>,
    bank_b: Vec<f64>,
}

pub struct SimulatedSpectrometer {
    settings: SimulatorSettings,
    connected: bool,
    processing: bool,
    started_at: Option<Instant>,
    count: u64,
    scripted_counts: VecDeque<u64>,
    faults: Vec<(FaultSite, DeviceError)>,
    overflow: bool,
    memory_error: bool,
    assembler: Option<SpectrumAssembler>,
    frame: Option<Frame>,
    rng: StdRng,
}

impl SimulatedSpectrometer {
    pub fn new(settings: SimulatorSettings) -> Self {
        let rng = StdRng::seed_from_u64(settings.seed);
        Self {
            settings,
            connected: false,
            processing: false,
            started_at: None,
            count: 0,
            scripted_counts: VecDeque::new(),
            faults: Vec::new(),
            overflow: false,
            memory_error: false,
            assembler: None,
            frame: None,
            rng,
        }
    }

    pub fn settings(&self) -> &SimulatorSettings {
        &self.settings
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    /// Replaces the time-driven counter with a fixed sequence of readings.
    /// Once exhausted the last reading is repeated.
    pub fn script_counts(&mut self, counts: impl IntoIterator<Item = u64>) {
        self.scripted_counts.extend(counts);
    }

    /// Makes the next call at `site` fail with `error`.
    pub fn inject_fault(&mut self, site: FaultSite, error: DeviceError) {
        self.faults.push((site, error));
    }

    pub fn set_transform(&mut self, transform_length: u32, is_complex: bool) {
        self.settings.transform_length = transform_length;
        self.settings.is_complex = is_complex;
        self.frame = None;
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.settings.sample_rate = sample_rate;
    }

    pub fn set_overflow(&mut self, overflow: bool) {
        self.overflow = overflow;
    }

    pub fn set_memory_error(&mut self, memory_error: bool) {
        self.memory_error = memory_error;
    }

    /// Duration of one averaged measurement.
    pub fn measurement_period(&self) -> Duration {
        let seconds = self.settings.transform_length as f64 / self.settings.sample_rate
            * self.settings.num_averages as f64;
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }

    fn take_fault(&mut self, site: FaultSite) -> Result<(), DeviceError> {
        match self.faults.iter().position(|(s, _)| *s == site) {
            Some(i) => Err(self.faults.remove(i).1),
            None => Ok(()),
        }
    }

    fn check_connected(&self) -> Result<(), DeviceError> {
        if self.connected {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }

    fn elapsed_count(&self) -> u64 {
        let Some(started_at) = self.started_at else {
            return 0;
        };
        let period = self.measurement_period().as_secs_f64();
        if period <= 0.0 {
            return 0;
        }
        let completed = (started_at.elapsed().as_secs_f64() / period).floor() as u64;
        if self.settings.continuous {
            completed
        } else {
            completed.min(1)
        }
    }

    fn assembler(&mut self) -> Result<SpectrumAssembler, DeviceError> {
        let n = self.settings.transform_length;
        let complex = self.settings.is_complex;
        if let Some(assembler) = self.assembler.as_ref().filter(|a| a.matches(n, complex)) {
            return Ok(assembler.clone());
        }
        let assembler =
            SpectrumAssembler::new(n, complex).map_err(|e| DeviceError::InvalidParameter {
                name: "transform_length",
                reason: e.to_string(),
            })?;
        self.assembler = Some(assembler.clone());
        Ok(assembler)
    }

    fn render_frame(&mut self) -> Result<Frame, DeviceError> {
        let assembler = self.assembler()?;
        let len = assembler.table().spectrum_len();
        let floor = self.settings.noise_floor;
        let mut spectrum: Vec<f64> = (0..len)
            .map(|_| floor * (0.5 + self.rng.random::<f64>()))
            .collect();
        if let Some(bin) = spectrum.get_mut(self.settings.tone_bin) {
            *bin += self.settings.tone_amplitude;
        }
        let (bank_a, bank_b) = assembler
            .scatter(&spectrum)
            .map_err(|e| DeviceError::Communication(e.to_string()))?;
        Ok(Frame {
            count: self.count,
            bank_a,
            bank_b,
        })
    }
}

impl Spectrometer for SimulatedSpectrometer {
    fn resource(&self) -> &str {
        &self.settings.resource
    }

    fn set_resource(&mut self, resource: &str) {
        self.settings.resource = resource.to_string();
    }

    fn connect(&mut self) -> Result<(), DeviceError> {
        self.take_fault(FaultSite::Connect)
            .map_err(|e| DeviceError::ConnectionFailed {
                resource: self.settings.resource.clone(),
                reason: e.to_string(),
            })?;
        info!("Simulated spectrometer connected at {}", self.settings.resource);
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.processing = false;
        self.started_at = None;
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn num_averages(&self) -> Result<u32, DeviceError> {
        Ok(self.settings.num_averages)
    }

    fn set_num_averages(&mut self, num_averages: u32) -> Result<(), DeviceError> {
        if num_averages == 0 {
            return Err(DeviceError::InvalidParameter {
                name: "num_averages",
                reason: "must be at least 1".to_string(),
            });
        }
        self.settings.num_averages = num_averages;
        Ok(())
    }

    fn continuous_mode(&self) -> Result<bool, DeviceError> {
        Ok(self.settings.continuous)
    }

    fn set_continuous_mode(&mut self, continuous: bool) -> Result<(), DeviceError> {
        self.settings.continuous = continuous;
        Ok(())
    }

    fn transform_length(&self) -> Result<u32, DeviceError> {
        Ok(self.settings.transform_length)
    }

    fn is_complex(&self) -> Result<bool, DeviceError> {
        Ok(self.settings.is_complex)
    }

    fn effective_sample_rate(&self) -> Result<f64, DeviceError> {
        Ok(self.settings.sample_rate)
    }

    fn start_processing(&mut self) -> Result<(), DeviceError> {
        self.check_connected()?;
        self.take_fault(FaultSite::StartProcessing)?;
        if !self.processing {
            debug!("Simulated FFT engine armed");
            self.processing = true;
            self.started_at = Some(Instant::now());
            self.count = 0;
            self.frame = None;
        }
        Ok(())
    }

    fn stop_processing(&mut self) -> Result<(), DeviceError> {
        if self.processing {
            self.count = self.count.max(self.elapsed_count());
            self.processing = false;
            self.started_at = None;
            debug!("Simulated FFT engine disarmed at count {}", self.count);
        }
        Ok(())
    }

    fn measurement_count(&mut self) -> Result<u64, DeviceError> {
        self.check_connected()?;
        self.take_fault(FaultSite::MeasurementCount)?;
        if let Some(next) = self.scripted_counts.pop_front() {
            self.count = next;
        } else if self.processing {
            self.count = self.count.max(self.elapsed_count());
        }
        Ok(self.count)
    }

    fn read_channel(&mut self, bank: MemoryBank) -> Result<Vec<f64>, DeviceError> {
        self.check_connected()?;
        self.take_fault(FaultSite::ReadChannel)?;
        let stale = self.frame.as_ref().map_or(true, |f| f.count != self.count);
        if stale {
            self.frame = Some(self.render_frame()?);
        }
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| DeviceError::Communication("no frame rendered".to_string()))?;
        Ok(match bank {
            MemoryBank::A => frame.bank_a.clone(),
            MemoryBank::B => frame.bank_b.clone(),
        })
    }

    fn overflow(&self) -> Result<bool, DeviceError> {
        Ok(self.overflow)
    }

    fn memory_error(&self) -> Result<bool, DeviceError> {
        Ok(self.memory_error)
    }

    fn properties(&self) -> Result<DeviceProperties, DeviceError> {
        self.check_connected()?;
        let warmup = self
            .started_at
            .map_or(0.0, |t| t.elapsed().as_secs_f64().min(600.0) / 60.0);
        Ok(DeviceProperties {
            model: "SIM-FFT".to_string(),
            serial_number: format!("SIM{:08X}", self.settings.seed),
            firmware_revision: "sim 1.0".to_string(),
            driver_revision: env!("CARGO_PKG_VERSION").to_string(),
            resource: self.settings.resource.clone(),
            sample_rate: self.settings.sample_rate,
            transform_length: self.settings.transform_length,
            is_complex: self.settings.is_complex,
            num_averages: self.settings.num_averages,
            temperature_board_c: 40.0 + warmup,
            temperature_adc_c: 55.0 + 1.5 * warmup,
        })
    }
}
