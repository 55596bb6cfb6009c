//! Spectrum data logger.
//!
//! Each acquisition is written as one block of rows through a
//! [`SpectrumSink`]. The logger reads the acquisition buffer on its own
//! thread, so a slow sink only ever costs the producer a blocked transfer.

use crate::actor::{
    command_set, state_enum, Actor, CommandActor, CommandSender, Mailbox, StateCell,
};
use crate::buffer::MeasurementBuffer;
use crate::measurement::Measurement;
use crate::signal::Signal;
use anyhow::Result;
use log::{debug, error, info, warn};
use ndarray::Array1;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

state_enum! {
    pub enum LoggerState {
        Ready => "ready",
        Running => "running",
        Storing => "storing",
    }
}

command_set! {
    pub enum LoggerCommand for "SpectrumDataLogger" {
        Start => "start",
        Stop => "stop",
        Store => "store",
        Terminate => "terminate",
    }
    terminate = Some(Self::Terminate);
}

/// Shape of one logged acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionLayout {
    /// Sequence number of the acquisition, starting at 1.
    pub id: u32,
    /// Maximum number of rows.
    pub capacity: usize,
    pub spectrum_len: usize,
}

/// Destination for logged spectra.
pub trait SpectrumSink: Send + 'static {
    /// Prepares storage for a new acquisition. Called before the first row.
    fn open_acquisition(&mut self, layout: AcquisitionLayout) -> Result<()>;

    /// Writes `measurement` as row `row` of the open acquisition.
    fn append(&mut self, row: usize, measurement: &Measurement) -> Result<()>;

    /// Flushes and closes the open acquisition.
    fn close_acquisition(&mut self) -> Result<()>;
}

/// One acquisition held by a [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAcquisition {
    pub layout: AcquisitionLayout,
    pub spectra: Vec<Array1<f64>>,
    pub num_averages: Vec<u32>,
    pub measurement_numbers: Vec<u64>,
    pub closed: bool,
}

/// Sink that keeps everything in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    acquisitions: Arc<Mutex<Vec<RecordedAcquisition>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn acquisitions(&self) -> Vec<RecordedAcquisition> {
        self.acquisitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with_open<R>(
        &self,
        f: impl FnOnce(&mut RecordedAcquisition) -> Result<R>,
    ) -> Result<R> {
        let mut acquisitions = self
            .acquisitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match acquisitions.last_mut().filter(|a| !a.closed) {
            Some(acquisition) => f(acquisition),
            None => anyhow::bail!("no acquisition open"),
        }
    }
}

impl SpectrumSink for MemorySink {
    fn open_acquisition(&mut self, layout: AcquisitionLayout) -> Result<()> {
        self.acquisitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedAcquisition {
                layout,
                spectra: Vec::new(),
                num_averages: Vec::new(),
                measurement_numbers: Vec::new(),
                closed: false,
            });
        Ok(())
    }

    fn append(&mut self, row: usize, measurement: &Measurement) -> Result<()> {
        self.with_open(|acquisition| {
            anyhow::ensure!(
                row == acquisition.spectra.len() && row < acquisition.layout.capacity,
                "row {} out of order",
                row
            );
            acquisition.spectra.push(measurement.spectrum.clone());
            acquisition.num_averages.push(measurement.num_averages);
            acquisition.measurement_numbers.push(measurement.stats.total);
            Ok(())
        })
    }

    fn close_acquisition(&mut self) -> Result<()> {
        self.with_open(|acquisition| {
            acquisition.closed = true;
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLoggerSettings {
    /// Rows kept per acquisition. Further stores are acknowledged but skipped.
    pub max_measurements_per_acq: usize,
    /// Bound on the command wait.
    pub poll: Duration,
}

impl Default for DataLoggerSettings {
    fn default() -> Self {
        Self {
            max_measurements_per_acq: 100,
            poll: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
pub struct LoggerShared {
    state: StateCell<LoggerState>,
    store_done: Signal,
    stored: AtomicUsize,
}

impl LoggerShared {
    pub fn state(&self) -> LoggerState {
        self.state.load()
    }

    /// Raised once per processed store, including skipped ones.
    pub fn store_done(&self) -> &Signal {
        &self.store_done
    }

    /// Rows written in the current acquisition.
    pub fn stored(&self) -> usize {
        self.stored.load(Ordering::Relaxed)
    }
}

pub struct LoggerWorker {
    buffer: Arc<MeasurementBuffer>,
    sink: Box<dyn SpectrumSink>,
    settings: DataLoggerSettings,
    shared: Arc<LoggerShared>,
    acquisition_id: u32,
    open: bool,
    row: usize,
}

impl Actor for LoggerWorker {
    type Command = LoggerCommand;

    fn run(mut self, mailbox: Mailbox<LoggerCommand>) {
        let mut state = LoggerState::Ready;
        loop {
            self.shared.state.store(state);
            state = match state {
                LoggerState::Storing => {
                    self.store();
                    self.shared.store_done.set();
                    LoggerState::Running
                }
                LoggerState::Ready => match mailbox.receive_timeout(self.settings.poll) {
                    Some(LoggerCommand::Start) => {
                        self.acquisition_id += 1;
                        self.row = 0;
                        self.shared.stored.store(0, Ordering::Relaxed);
                        debug!("Prepared acquisition {}", self.acquisition_id);
                        LoggerState::Running
                    }
                    Some(LoggerCommand::Store) => {
                        warn!("Logger not running, ignoring store");
                        self.shared.store_done.set();
                        LoggerState::Ready
                    }
                    Some(LoggerCommand::Terminate) => break,
                    Some(LoggerCommand::Stop) | None => LoggerState::Ready,
                },
                LoggerState::Running => match mailbox.receive_timeout(self.settings.poll) {
                    Some(LoggerCommand::Store) => LoggerState::Storing,
                    Some(LoggerCommand::Stop) => {
                        self.close();
                        LoggerState::Ready
                    }
                    Some(LoggerCommand::Terminate) => {
                        self.close();
                        break;
                    }
                    Some(LoggerCommand::Start) | None => LoggerState::Running,
                },
            };
        }
    }
}

impl LoggerWorker {
    fn store(&mut self) {
        if self.row >= self.settings.max_measurements_per_acq {
            debug!("Logger full, ignoring store command");
            return;
        }
        let Some(measurement) = self.buffer.latest() else {
            warn!("Store requested but no measurement available");
            return;
        };
        if let Err(e) = self.write(&measurement) {
            error!("Failed to store measurement: {e:#}");
        }
    }

    fn write(&mut self, measurement: &Measurement) -> Result<()> {
        if !self.open {
            self.sink.open_acquisition(AcquisitionLayout {
                id: self.acquisition_id,
                capacity: self.settings.max_measurements_per_acq,
                spectrum_len: measurement.spectrum.len(),
            })?;
            self.open = true;
        }
        debug!("Storing data idx {}", self.row);
        self.sink.append(self.row, measurement)?;
        self.row += 1;
        self.shared.stored.store(self.row, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        match self.sink.close_acquisition() {
            Ok(()) => info!(
                "Acquisition {} logged with {} measurements",
                self.acquisition_id, self.row
            ),
            Err(e) => error!("Failed to close acquisition {}: {e:#}", self.acquisition_id),
        }
    }
}

/// Owner handle of the logger thread.
pub struct DataLogger {
    actor: CommandActor<LoggerWorker>,
    shared: Arc<LoggerShared>,
}

impl DataLogger {
    pub fn new(
        buffer: Arc<MeasurementBuffer>,
        sink: Box<dyn SpectrumSink>,
        settings: DataLoggerSettings,
    ) -> Self {
        let shared = Arc::new(LoggerShared {
            state: StateCell::new(LoggerState::Ready),
            store_done: Signal::new(),
            stored: AtomicUsize::new(0),
        });
        let worker = LoggerWorker {
            buffer,
            sink,
            settings,
            shared: Arc::clone(&shared),
            acquisition_id: 0,
            open: false,
            row: 0,
        };
        Self {
            actor: CommandActor::new(worker),
            shared,
        }
    }

    pub fn start(&mut self) -> std::io::Result<()> {
        self.actor.start("DataLogger")
    }

    pub fn send(&self, command: LoggerCommand) {
        self.actor.send(command);
    }

    pub fn sender(&self) -> CommandSender<LoggerCommand> {
        self.actor.sender()
    }

    pub fn stop(&mut self) {
        self.actor.stop();
    }

    pub fn shared(&self) -> &Arc<LoggerShared> {
        &self.shared
    }
}
