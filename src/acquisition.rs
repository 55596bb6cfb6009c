//! Polling state machine that moves measurements from the device into the
//! shared [`MeasurementBuffer`].
//!
//! ```text
//! Idle --Start--> Acquiring --count advanced--> Transferring
//!  ^                 |  ^                          |
//!  |                 |  +------ continuous --------+
//!  +---- Stop -------+                             |
//!  +------------------------- one-shot ------------+
//! ```
//!
//! The controller never waits on consumers. A transfer that finds the buffer
//! guarded is counted as blocked and discarded.

use crate::actor::{
    command_set, state_enum, Actor, CommandActor, CommandSender, Mailbox, StateCell,
};
use crate::buffer::MeasurementBuffer;
use crate::device::{DeviceHandle, MemoryBank, Spectrometer};
use crate::error::{AcquisitionError, DeviceError, InvalidCommand};
use crate::measurement::{AcquisitionStatistics, Measurement};
use crate::permutation::SpectrumAssembler;
use crate::signal::Signal;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Device polls per measurement period.
pub const POLLS_PER_PERIOD: f64 = 10.0;

state_enum! {
    pub enum AcqState {
        Idle => "idle",
        Acquiring => "acquiring",
        Transferring => "transferring",
        Terminating => "terminating",
        Terminated => "terminated",
    }
}

command_set! {
    pub enum AcquisitionCommand for "AcquisitionController" {
        Start => "start",
        Stop => "stop",
        Terminate => "terminate",
    }
    terminate = Some(Self::Terminate);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionSettings {
    /// Bound on the command wait while idle.
    pub idle_poll: Duration,
    /// Lower and upper clamp of the device polling interval.
    pub min_poll_interval: Duration,
    pub max_poll_interval: Duration,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_millis(50),
            min_poll_interval: Duration::from_millis(1),
            max_poll_interval: Duration::from_secs(1),
        }
    }
}

impl AcquisitionSettings {
    /// Polling interval for one measurement period of `period` seconds.
    pub fn poll_interval(&self, period: f64) -> Duration {
        let interval = Duration::try_from_secs_f64(period / POLLS_PER_PERIOD)
            .unwrap_or(self.max_poll_interval);
        let max = self.max_poll_interval.max(self.min_poll_interval);
        interval.clamp(self.min_poll_interval, max)
    }
}

/// Everything the controller publishes to other threads.
#[derive(Debug)]
pub struct AcquisitionShared {
    state: StateCell<AcqState>,
    started: Signal,
    stopped: Signal,
    buffer: Arc<MeasurementBuffer>,
    stats: Mutex<AcquisitionStatistics>,
    last_fault: Mutex<Option<AcquisitionError>>,
}

impl AcquisitionShared {
    fn new(buffer: Arc<MeasurementBuffer>) -> Self {
        Self {
            state: StateCell::new(AcqState::Idle),
            started: Signal::new(),
            stopped: Signal::new(),
            buffer,
            stats: Mutex::new(AcquisitionStatistics::new()),
            last_fault: Mutex::new(None),
        }
    }

    pub fn state(&self) -> AcqState {
        self.state.load()
    }

    /// Raised once the device has been armed.
    pub fn started(&self) -> &Signal {
        &self.started
    }

    /// Raised whenever acquisition ends, whether requested, one-shot or
    /// after a fault.
    pub fn stopped(&self) -> &Signal {
        &self.stopped
    }

    /// Raised after every successful publish.
    pub fn data_ready(&self) -> &Signal {
        self.buffer.available()
    }

    pub fn buffer(&self) -> &Arc<MeasurementBuffer> {
        &self.buffer
    }

    /// Statistics as of the last transfer.
    pub fn statistics(&self) -> AcquisitionStatistics {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_fault(&self) -> Option<AcquisitionError> {
        self.last_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish_stats(&self, stats: AcquisitionStatistics) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = stats;
    }

    fn record_fault(&self, fault: AcquisitionError) {
        *self.last_fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(fault);
    }
}

pub struct AcquisitionWorker<D> {
    device: DeviceHandle<D>,
    shared: Arc<AcquisitionShared>,
    settings: AcquisitionSettings,
    assembler: Option<SpectrumAssembler>,
    stats: AcquisitionStatistics,
    num_averages: u32,
    poll_interval: Duration,
}

impl<D: Spectrometer> Actor for AcquisitionWorker<D> {
    type Command = AcquisitionCommand;

    fn run(mut self, mailbox: Mailbox<AcquisitionCommand>) {
        let mut state = AcqState::Idle;
        loop {
            self.shared.state.store(state);
            state = match state {
                AcqState::Idle => self.idle(&mailbox),
                AcqState::Acquiring => self.acquiring(&mailbox),
                AcqState::Transferring => self.transferring(),
                AcqState::Terminating => AcqState::Terminated,
                AcqState::Terminated => break,
            };
        }
        debug!("Acquisition loop finished");
    }
}

impl<D: Spectrometer> AcquisitionWorker<D> {
    fn idle(&mut self, mailbox: &Mailbox<AcquisitionCommand>) -> AcqState {
        match mailbox.receive_timeout(self.settings.idle_poll) {
            Some(AcquisitionCommand::Start) => match self.begin() {
                Ok(()) => {
                    self.shared.started.set();
                    AcqState::Acquiring
                }
                Err(e) => {
                    self.fault(e);
                    AcqState::Idle
                }
            },
            Some(AcquisitionCommand::Stop) => {
                debug!("Acquisition already stopped");
                AcqState::Idle
            }
            Some(AcquisitionCommand::Terminate) => AcqState::Terminating,
            None => AcqState::Idle,
        }
    }

    fn acquiring(&mut self, mailbox: &Mailbox<AcquisitionCommand>) -> AcqState {
        match mailbox.receive_timeout(self.poll_interval) {
            Some(AcquisitionCommand::Start) => {
                debug!("Acquisition already running");
                AcqState::Acquiring
            }
            Some(AcquisitionCommand::Stop) => {
                self.halt();
                AcqState::Idle
            }
            Some(AcquisitionCommand::Terminate) => {
                self.halt();
                AcqState::Terminating
            }
            None => match self.poll() {
                Ok(true) => AcqState::Transferring,
                Ok(false) => AcqState::Acquiring,
                Err(e) => {
                    self.fault(e);
                    AcqState::Idle
                }
            },
        }
    }

    fn transferring(&mut self) -> AcqState {
        match self.transfer() {
            Ok(true) => AcqState::Acquiring,
            Ok(false) => {
                self.halt();
                AcqState::Idle
            }
            Err(e) => {
                self.fault(e);
                AcqState::Idle
            }
        }
    }

    /// Resets the session statistics, derives the polling interval and arms
    /// the device.
    fn begin(&mut self) -> Result<(), AcquisitionError> {
        self.stats = AcquisitionStatistics::new();
        self.shared.publish_stats(self.stats);
        self.shared.stopped.clear();

        let handle = self.device.clone();
        let mut device = handle.lock();
        let num_averages = device.num_averages()?;
        let transform_length = device.transform_length()?;
        let is_complex = device.is_complex()?;
        let sample_rate = device.effective_sample_rate()?;
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(DeviceError::InvalidSampleRate(sample_rate).into());
        }

        let period = transform_length as f64 / sample_rate * num_averages as f64;
        self.poll_interval = self.settings.poll_interval(period);
        self.num_averages = num_averages;
        self.assembler_for(transform_length, is_complex)?;
        device.start_processing()?;
        drop(device);

        info!(
            "Acquisition started: N={} complex={} averages={} period={:.3} s, polling every {:?}",
            transform_length, is_complex, num_averages, period, self.poll_interval
        );
        Ok(())
    }

    /// Reads the device counter and reports whether a new measurement is
    /// waiting.
    fn poll(&mut self) -> Result<bool, AcquisitionError> {
        let count = self.device.lock().measurement_count()?;
        let advance = self.stats.record_count(count);
        if advance > 1 {
            warn!(
                "{} measurements dropped before count {}",
                advance - 1,
                count
            );
        }
        Ok(advance > 0)
    }

    /// Moves one measurement into the buffer. Returns whether the device is
    /// in continuous mode.
    fn transfer(&mut self) -> Result<bool, AcquisitionError> {
        let (bank_a, bank_b, overflow, memory_error, continuous, transform_length, is_complex) = {
            let mut device = self.device.lock();
            (
                device.read_channel(MemoryBank::A)?,
                device.read_channel(MemoryBank::B)?,
                device.overflow()?,
                device.memory_error()?,
                device.continuous_mode()?,
                device.transform_length()?,
                device.is_complex()?,
            )
        };
        self.stats.overflow = overflow;
        self.stats.memory_error = memory_error;
        if overflow {
            warn!("ADC overflow in measurement {}", self.stats.total);
        }
        if memory_error {
            warn!("Memory error in measurement {}", self.stats.total);
        }

        let spectrum = self
            .assembler_for(transform_length, is_complex)?
            .assemble(&bank_a, &bank_b)?;
        let measurement = Measurement {
            spectrum,
            num_averages: self.num_averages,
            stats: self.stats,
        };
        if self.shared.buffer.try_publish(measurement) {
            debug!("Measurement {} published", self.stats.total);
        } else {
            self.stats.blocked += 1;
            warn!("Buffer blocked");
        }
        self.shared.publish_stats(self.stats);
        Ok(continuous)
    }

    fn assembler_for(
        &mut self,
        transform_length: u32,
        is_complex: bool,
    ) -> Result<&SpectrumAssembler, AcquisitionError> {
        let assembler = match self.assembler.take() {
            Some(assembler) if assembler.matches(transform_length, is_complex) => assembler,
            _ => {
                debug!(
                    "Building permutation table for N={} complex={}",
                    transform_length, is_complex
                );
                SpectrumAssembler::new(transform_length, is_complex)?
            }
        };
        Ok(self.assembler.insert(assembler))
    }

    fn halt(&mut self) {
        if let Err(e) = self.device.lock().stop_processing() {
            error!("Failed to stop processing: {e}");
            self.shared.record_fault(e.into());
        }
        self.shared.publish_stats(self.stats);
        self.shared.stopped.set();
        info!(
            "Acquisition stopped: ok={} dropped={} blocked={} total={}",
            self.stats.ok, self.stats.dropped, self.stats.blocked, self.stats.total
        );
    }

    fn fault(&mut self, fault: AcquisitionError) {
        error!("Acquisition fault: {fault}");
        self.shared.record_fault(fault);
        if let Err(e) = self.device.lock().stop_processing() {
            debug!("Stop after fault failed: {e}");
        }
        self.shared.publish_stats(self.stats);
        self.shared.stopped.set();
    }
}

/// Owner handle of the acquisition thread.
pub struct AcquisitionController<D: Spectrometer> {
    actor: CommandActor<AcquisitionWorker<D>>,
    shared: Arc<AcquisitionShared>,
}

impl<D: Spectrometer> AcquisitionController<D> {
    pub fn new(device: DeviceHandle<D>, settings: AcquisitionSettings) -> Self {
        let shared = Arc::new(AcquisitionShared::new(Arc::new(MeasurementBuffer::new())));
        let worker = AcquisitionWorker {
            device,
            shared: Arc::clone(&shared),
            settings,
            assembler: None,
            stats: AcquisitionStatistics::new(),
            num_averages: 0,
            poll_interval: settings.min_poll_interval,
        };
        Self {
            actor: CommandActor::new(worker),
            shared,
        }
    }

    pub fn start(&mut self) -> std::io::Result<()> {
        self.actor.start("Acq")
    }

    pub fn send(&self, command: AcquisitionCommand) {
        self.actor.send(command);
    }

    pub fn send_str(&self, token: &str) -> Result<(), InvalidCommand> {
        self.actor.send_str(token)
    }

    pub fn sender(&self) -> CommandSender<AcquisitionCommand> {
        self.actor.sender()
    }

    pub fn stop(&mut self) {
        self.actor.stop();
    }

    pub fn shared(&self) -> &Arc<AcquisitionShared> {
        &self.shared
    }

    pub fn state(&self) -> AcqState {
        self.shared.state()
    }

    pub fn buffer(&self) -> &Arc<MeasurementBuffer> {
        self.shared.buffer()
    }

    pub fn statistics(&self) -> AcquisitionStatistics {
        self.shared.statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::simulator::{FaultSite, SimulatedSpectrometer, SimulatorSettings};
    use std::thread;
    use std::time::Instant;

    const SETTINGS: AcquisitionSettings = AcquisitionSettings {
        idle_poll: Duration::from_millis(5),
        min_poll_interval: Duration::from_millis(1),
        max_poll_interval: Duration::from_millis(2),
    };

    /// A device whose own clock never completes a measurement, so only
    /// scripted counts advance it.
    fn scripted(continuous: bool) -> DeviceHandle<SimulatedSpectrometer> {
        let mut sim = SimulatedSpectrometer::new(SimulatorSettings {
            transform_length: 64,
            sample_rate: 0.064,
            num_averages: 1,
            continuous,
            tone_bin: 3,
            ..Default::default()
        });
        sim.connect().unwrap();
        DeviceHandle::new(sim)
    }

    fn running(
        device: &DeviceHandle<SimulatedSpectrometer>,
    ) -> AcquisitionController<SimulatedSpectrometer> {
        let mut controller = AcquisitionController::new(device.clone(), SETTINGS);
        controller.start().unwrap();
        controller
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_poll_interval_is_clamped() {
        let settings = AcquisitionSettings::default();
        assert_relative_eq!(settings.poll_interval(0.5).as_secs_f64(), 0.05, epsilon = 1e-9);
        assert_eq!(settings.poll_interval(1e-6), Duration::from_millis(1));
        assert_eq!(settings.poll_interval(3600.0), Duration::from_secs(1));
        assert_eq!(settings.poll_interval(f64::INFINITY), Duration::from_secs(1));
    }

    #[test]
    fn test_drop_accounting_from_counter_sequence() {
        let device = scripted(true);
        device.lock().script_counts([0, 1, 3, 3, 6]);
        let mut controller = running(&device);
        controller.send(AcquisitionCommand::Start);

        assert!(wait_until(|| controller.statistics().total == 6));
        controller.send(AcquisitionCommand::Stop);
        assert!(controller.shared().stopped().wait_timeout(Duration::from_secs(5)));

        let stats = controller.statistics();
        assert_eq!(stats.ok, 3);
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.total, 6);
        assert_eq!(stats.blocked, 0);
        let published = controller.buffer().latest().unwrap();
        assert_eq!(published.spectrum.len(), 32);
        assert_eq!(published.peak().map(|(bin, _)| bin), Some(3));
        controller.stop();
    }

    #[test]
    fn test_held_guard_blocks_exactly_one_transfer() {
        let device = scripted(true);
        device.lock().script_counts([1]);
        let mut controller = running(&device);
        controller.send(AcquisitionCommand::Start);
        assert!(wait_until(|| controller.statistics().ok == 1));
        let before = controller.buffer().latest().unwrap();

        let guard = controller.buffer().try_guard().unwrap();
        device.lock().script_counts([2]);
        assert!(wait_until(|| controller.statistics().blocked == 1));
        thread::sleep(Duration::from_millis(20));
        let stats = controller.statistics();
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.ok, 2);
        assert_eq!(guard.as_ref(), Some(&before));
        drop(guard);

        controller.send(AcquisitionCommand::Stop);
        assert!(controller.shared().stopped().wait_timeout(Duration::from_secs(5)));
        assert_eq!(controller.buffer().latest().unwrap(), before);
        controller.stop();
    }

    #[test]
    fn test_one_shot_transfers_once_then_idles() {
        let device = scripted(false);
        device.lock().script_counts([0, 1, 2]);
        let mut controller = running(&device);
        controller.send(AcquisitionCommand::Start);

        assert!(controller.shared().stopped().wait_timeout(Duration::from_secs(5)));
        assert!(wait_until(|| controller.state() == AcqState::Idle));
        assert!(controller.shared().started().is_set());
        assert_eq!(controller.statistics().ok, 1);
        assert!(controller.buffer().available().is_set());
        assert!(!device.lock().is_processing());
        controller.stop();
        assert_eq!(controller.state(), AcqState::Terminated);
    }

    #[test]
    fn test_continuous_runs_until_stopped() {
        let device = scripted(true);
        device.lock().script_counts([1, 2, 3]);
        let mut controller = running(&device);
        controller.send(AcquisitionCommand::Start);

        assert!(wait_until(|| controller.statistics().ok == 3));
        assert!(!controller.shared().stopped().is_set());
        assert!(device.lock().is_processing());

        controller.send(AcquisitionCommand::Stop);
        assert!(controller.shared().stopped().wait_timeout(Duration::from_secs(5)));
        assert!(!device.lock().is_processing());
        controller.stop();
    }

    #[test]
    fn test_terminate_while_acquiring_stops_device() {
        let device = scripted(true);
        let mut controller = running(&device);
        controller.send(AcquisitionCommand::Start);
        assert!(controller.shared().started().wait_timeout(Duration::from_secs(5)));

        let start = Instant::now();
        controller.send(AcquisitionCommand::Terminate);
        controller.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(controller.state(), AcqState::Terminated);
        assert!(!device.lock().is_processing());
    }

    #[test]
    fn test_stop_without_start_returns_immediately() {
        let mut controller = AcquisitionController::new(scripted(true), SETTINGS);
        let start = Instant::now();
        controller.stop();
        assert!(start.elapsed() < SETTINGS.idle_poll);
    }

    #[test]
    fn test_device_fault_returns_to_idle() {
        let device = scripted(true);
        device.lock().inject_fault(
            FaultSite::MeasurementCount,
            DeviceError::Communication("bus reset".into()),
        );
        let mut controller = running(&device);
        controller.send(AcquisitionCommand::Start);

        assert!(controller.shared().stopped().wait_timeout(Duration::from_secs(5)));
        assert!(wait_until(|| controller.state() == AcqState::Idle));
        assert_eq!(
            controller.shared().last_fault(),
            Some(AcquisitionError::Device(DeviceError::Communication(
                "bus reset".into()
            )))
        );
        assert!(!device.lock().is_processing());

        device.lock().script_counts([1]);
        controller.send(AcquisitionCommand::Start);
        assert!(wait_until(|| controller.statistics().ok == 1));
        controller.stop();
    }

    #[test]
    fn test_invalid_sample_rate_fails_start() {
        let device = scripted(true);
        device.lock().set_sample_rate(0.0);
        let mut controller = running(&device);
        controller.send(AcquisitionCommand::Start);

        assert!(controller.shared().stopped().wait_timeout(Duration::from_secs(5)));
        assert!(!controller.shared().started().is_set());
        assert_eq!(
            controller.shared().last_fault(),
            Some(AcquisitionError::Device(DeviceError::InvalidSampleRate(0.0)))
        );
        controller.stop();
    }

    #[test]
    fn test_invalid_token_is_rejected() {
        let mut controller = running(&scripted(true));
        assert!(controller.send_str("pause").is_err());
        assert!(controller.send_str("start").is_ok());
        assert!(controller.shared().started().wait_timeout(Duration::from_secs(5)));
        controller.stop();
    }
}
