//! Top-level orchestrator.
//!
//! A [`Session`] owns one device and runs the connection manager, the
//! acquisition controller, the data logger and the heartbeat, each on its
//! own thread. Its own loop is the only place that decides how their events
//! are ordered:
//!
//! ```text
//! Disconnected -> Connecting -> Idle -> AcquisitionStarting -> Acquiring
//!       ^             |          ^  |                              |
//!       +---failed----+          |  +--disconnect--> Disconnected  |
//!                                +------- AcquisitionDone <--------+
//! ```

use crate::acquisition::{
    AcqState, AcquisitionCommand, AcquisitionController, AcquisitionSettings, AcquisitionShared,
};
use crate::actor::{command_set, state_enum, Actor, CommandActor, Mailbox, StateCell};
use crate::buffer::{try_copy_latest, MeasurementBuffer};
use crate::connection::{ConnectionManager, ConnectionShared};
use crate::datalog::{DataLogger, DataLoggerSettings, LoggerCommand, LoggerShared, SpectrumSink};
use crate::device::{DeviceHandle, DeviceProperties, Spectrometer};
use crate::error::InvalidCommand;
use crate::heartbeat::Heartbeat;
use crate::measurement::{AcquisitionStatistics, Measurement};
use crate::signal::Signal;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

state_enum! {
    pub enum SessionState {
        Disconnected => "disconnected",
        Connecting => "connecting",
        Idle => "idle",
        AcquisitionStarting => "acq_start",
        Acquiring => "acquiring",
        AcquisitionDone => "acq_done",
    }
}

command_set! {
    pub enum SessionCommand for "Core" {
        Connect => "connect",
        Disconnect => "disconnect",
        Start => "start",
        Stop => "stop",
        Terminate => "terminate",
    }
    terminate = Some(Self::Terminate);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    /// Send every published measurement to the data logger.
    pub enable_data_logging: bool,
    /// Bound on command waits outside of acquisition.
    pub command_poll: Duration,
    /// Bound on the data-ready wait while acquiring.
    pub data_wait: Duration,
    /// How long a store may take before the session moves on.
    pub store_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub acquisition: AcquisitionSettings,
    pub logger: DataLoggerSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            enable_data_logging: false,
            command_poll: Duration::from_millis(20),
            data_wait: Duration::from_millis(50),
            store_timeout: Duration::from_secs(2),
            disconnect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            acquisition: AcquisitionSettings::default(),
            logger: DataLoggerSettings::default(),
        }
    }
}

pub type StateHook = Box<dyn Fn(SessionState) + Send>;
pub type SnapshotHook = Box<dyn Fn(&Measurement) + Send>;
pub type HeartbeatHook = Box<dyn Fn(&DeviceProperties) + Send>;

/// Callbacks run on the session thread. They must return quickly.
#[derive(Default)]
pub struct SessionHooks {
    pub on_state_change: Option<StateHook>,
    /// Runs with the user snapshot guard held.
    pub on_user_data_ready: Option<SnapshotHook>,
    pub on_heartbeat: Option<HeartbeatHook>,
}

/// Signals raised by the session for outside observers. None of them are
/// cleared by the session except `user_data_request`.
#[derive(Debug, Default)]
pub struct SessionEvents {
    pub connect: Signal,
    pub disconnect: Signal,
    pub start: Signal,
    pub stop: Signal,
    pub user_data_request: Signal,
    pub user_data_ready: Signal,
}

#[derive(Debug)]
struct SessionShared {
    state: StateCell<SessionState>,
    events: SessionEvents,
    user_data: MeasurementBuffer,
    properties: Mutex<Option<DeviceProperties>>,
}

pub struct SessionWorker<D: Spectrometer> {
    device: DeviceHandle<D>,
    connection: ConnectionManager<D>,
    acquisition: AcquisitionController<D>,
    logger: DataLogger,
    heartbeat: Heartbeat,
    hooks: SessionHooks,
    settings: SessionSettings,
    shared: Arc<SessionShared>,
    deferred: VecDeque<SessionCommand>,
    terminating: bool,
}

impl<D: Spectrometer> Actor for SessionWorker<D> {
    type Command = SessionCommand;

    fn run(mut self, mailbox: Mailbox<SessionCommand>) {
        if let Err(e) = self.start_children() {
            error!("Failed to start worker threads: {e}");
            self.stop_children();
            return;
        }

        let mut state = SessionState::Disconnected;
        self.enter(state);
        loop {
            let next = match state {
                SessionState::Disconnected => self.disconnected(&mailbox),
                SessionState::Connecting => self.connecting(&mailbox),
                SessionState::Idle => self.idle(&mailbox),
                SessionState::AcquisitionStarting => self.starting(&mailbox),
                SessionState::Acquiring => self.acquiring(&mailbox),
                SessionState::AcquisitionDone => Some(SessionState::Idle),
            };
            match next {
                Some(next) => {
                    if next != state {
                        self.enter(next);
                    }
                    state = next;
                }
                None => break,
            }
        }
        self.stop_children();
    }
}

impl<D: Spectrometer> SessionWorker<D> {
    fn start_children(&mut self) -> std::io::Result<()> {
        self.connection.start()?;
        self.acquisition.start()?;
        self.logger.start()?;
        self.heartbeat.start()?;
        Ok(())
    }

    fn stop_children(&mut self) {
        self.heartbeat.stop();
        self.acquisition.stop();
        self.logger.stop();
        self.connection.stop();
        debug!("Core terminated");
    }

    fn enter(&self, state: SessionState) {
        self.shared.state.store(state);
        debug!("Core state: {}", state);
        if let Some(hook) = &self.hooks.on_state_change {
            hook(state);
        }
    }

    /// Deferred commands first, then the mailbox.
    fn next_command(
        &mut self,
        mailbox: &Mailbox<SessionCommand>,
        timeout: Duration,
    ) -> Option<SessionCommand> {
        match self.deferred.pop_front() {
            Some(command) => Some(command),
            None => mailbox.receive_timeout(timeout),
        }
    }

    fn ignore(&self, command: SessionCommand, state: SessionState) {
        warn!("Core ignored command {:?} in state {}", command, state);
    }

    fn disconnected(&mut self, mailbox: &Mailbox<SessionCommand>) -> Option<SessionState> {
        match self.next_command(mailbox, self.settings.command_poll) {
            Some(SessionCommand::Connect) => {
                let shared = self.connection.shared();
                shared.connected().clear();
                shared.failed().clear();
                self.connection.connect();
                Some(SessionState::Connecting)
            }
            Some(SessionCommand::Terminate) => None,
            Some(command) => {
                self.ignore(command, SessionState::Disconnected);
                Some(SessionState::Disconnected)
            }
            None => Some(SessionState::Disconnected),
        }
    }

    fn connecting(&mut self, mailbox: &Mailbox<SessionCommand>) -> Option<SessionState> {
        let connection = Arc::clone(self.connection.shared());
        if connection.connected().take() {
            self.report_properties();
            self.shared.events.connect.set();
            return Some(SessionState::Idle);
        }
        if connection.failed().take() {
            warn!("Connection failed");
            return Some(SessionState::Disconnected);
        }
        match mailbox.receive_timeout(self.settings.command_poll) {
            Some(SessionCommand::Terminate) => None,
            Some(command) => {
                self.deferred.push_back(command);
                Some(SessionState::Connecting)
            }
            None => Some(SessionState::Connecting),
        }
    }

    fn idle(&mut self, mailbox: &Mailbox<SessionCommand>) -> Option<SessionState> {
        self.heartbeat_task();
        match self.next_command(mailbox, self.settings.command_poll) {
            Some(SessionCommand::Disconnect) => {
                let connection = Arc::clone(self.connection.shared());
                connection.disconnected().clear();
                self.connection.disconnect();
                if !connection
                    .disconnected()
                    .wait_timeout(self.settings.disconnect_timeout)
                {
                    warn!(
                        "Disconnect not acknowledged within {:?}",
                        self.settings.disconnect_timeout
                    );
                }
                self.shared.events.disconnect.set();
                Some(SessionState::Disconnected)
            }
            Some(SessionCommand::Start) => {
                let acq = self.acquisition.shared();
                acq.started().clear();
                acq.stopped().clear();
                acq.data_ready().clear();
                self.acquisition.send(AcquisitionCommand::Start);
                if self.settings.enable_data_logging {
                    self.logger.send(LoggerCommand::Start);
                }
                Some(SessionState::AcquisitionStarting)
            }
            Some(SessionCommand::Terminate) => None,
            Some(command) => {
                self.ignore(command, SessionState::Idle);
                Some(SessionState::Idle)
            }
            None => Some(SessionState::Idle),
        }
    }

    fn starting(&mut self, mailbox: &Mailbox<SessionCommand>) -> Option<SessionState> {
        let acq = Arc::clone(self.acquisition.shared());
        if acq.started().take() {
            debug!("Acquisition start event");
            self.shared.events.start.set();
            return Some(SessionState::Acquiring);
        }
        if acq.stopped().take() {
            warn!("Acquisition failed to start");
            self.finish_acquisition();
            return Some(SessionState::AcquisitionDone);
        }
        if let Some(command) = mailbox.receive_timeout(self.settings.command_poll) {
            self.deferred.push_back(command);
        }
        Some(SessionState::AcquisitionStarting)
    }

    fn acquiring(&mut self, mailbox: &Mailbox<SessionCommand>) -> Option<SessionState> {
        let acq = Arc::clone(self.acquisition.shared());
        if acq.data_ready().wait_timeout(self.settings.data_wait) && acq.data_ready().take() {
            self.on_data_ready(&acq);
        }
        self.heartbeat_task();

        match self.next_command(mailbox, Duration::ZERO) {
            Some(SessionCommand::Stop) => self.acquisition.send(AcquisitionCommand::Stop),
            Some(SessionCommand::Terminate) => {
                self.acquisition.send(AcquisitionCommand::Stop);
                self.terminating = true;
            }
            Some(command) => self.ignore(command, SessionState::Acquiring),
            None => {}
        }

        if acq.stopped().take() {
            debug!("Acquisition stop event");
            // The controller publishes before it raises `stopped`.
            if acq.data_ready().take() {
                self.on_data_ready(&acq);
            }
            self.finish_acquisition();
            if self.terminating {
                return None;
            }
            return Some(SessionState::AcquisitionDone);
        }
        if self.terminating && acq.state() == AcqState::Idle {
            return None;
        }
        Some(SessionState::Acquiring)
    }

    fn finish_acquisition(&self) {
        self.shared.events.stop.set();
        if self.settings.enable_data_logging {
            self.logger.send(LoggerCommand::Stop);
        }
    }

    fn on_data_ready(&self, acq: &AcquisitionShared) {
        if self.settings.enable_data_logging {
            let store_done = self.logger.shared().store_done();
            store_done.clear();
            self.logger.send(LoggerCommand::Store);
            if !store_done.wait_timeout(self.settings.store_timeout) {
                warn!(
                    "Store not acknowledged within {:?}",
                    self.settings.store_timeout
                );
            }
        }

        let events = &self.shared.events;
        if events.user_data_request.is_set() {
            match try_copy_latest(&self.shared.user_data, acq.buffer()) {
                Some(snapshot) => {
                    events.user_data_request.clear();
                    events.user_data_ready.set();
                    if let (Some(hook), Some(measurement)) =
                        (&self.hooks.on_user_data_ready, snapshot.as_ref())
                    {
                        hook(measurement);
                    }
                }
                None => debug!("User snapshot skipped, buffer busy"),
            }
        }

        acq.buffer().release();
    }

    fn heartbeat_task(&self) {
        if !self.heartbeat.shared().beat().take() {
            return;
        }
        let properties = self.device.lock().properties();
        match properties {
            Ok(properties) => {
                if let Some(hook) = &self.hooks.on_heartbeat {
                    hook(&properties);
                }
                *self
                    .shared
                    .properties
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(properties);
            }
            Err(e) => debug!("Property refresh failed: {e}"),
        }
    }

    fn report_properties(&self) {
        let properties = self.device.lock().properties();
        match properties {
            Ok(properties) => {
                info!("Instrument properties:\n{}", properties.report());
                *self
                    .shared
                    .properties
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(properties);
            }
            Err(e) => warn!("Could not read instrument properties: {e}"),
        }
    }
}

/// Handle to a running spectrometer session.
pub struct Session<D: Spectrometer> {
    actor: CommandActor<SessionWorker<D>>,
    shared: Arc<SessionShared>,
    device: DeviceHandle<D>,
    acquisition: Arc<AcquisitionShared>,
    logger: Arc<LoggerShared>,
    connection: Arc<ConnectionShared>,
}

impl<D: Spectrometer> Session<D> {
    pub fn new(
        device: D,
        sink: Box<dyn SpectrumSink>,
        settings: SessionSettings,
        hooks: SessionHooks,
    ) -> Self {
        let device = DeviceHandle::new(device);
        let connection = ConnectionManager::new(device.clone(), settings.command_poll);
        let acquisition = AcquisitionController::new(device.clone(), settings.acquisition);
        let logger = DataLogger::new(Arc::clone(acquisition.buffer()), sink, settings.logger);
        let heartbeat = Heartbeat::new(settings.heartbeat_interval);

        let shared = Arc::new(SessionShared {
            state: StateCell::new(SessionState::Disconnected),
            events: SessionEvents::default(),
            user_data: MeasurementBuffer::new(),
            properties: Mutex::new(None),
        });
        let acquisition_shared = Arc::clone(acquisition.shared());
        let logger_shared = Arc::clone(logger.shared());
        let connection_shared = Arc::clone(connection.shared());

        let worker = SessionWorker {
            device: device.clone(),
            connection,
            acquisition,
            logger,
            heartbeat,
            hooks,
            settings,
            shared: Arc::clone(&shared),
            deferred: VecDeque::new(),
            terminating: false,
        };
        Self {
            actor: CommandActor::new(worker),
            shared,
            device,
            acquisition: acquisition_shared,
            logger: logger_shared,
            connection: connection_shared,
        }
    }

    /// Starts the session thread, which in turn starts every worker.
    pub fn initialize(&mut self) -> std::io::Result<()> {
        self.actor.start("Core")
    }

    pub fn connect(&self, resource: &str) {
        self.device.lock().set_resource(resource);
        self.actor.send(SessionCommand::Connect);
    }

    pub fn disconnect(&self) {
        self.actor.send(SessionCommand::Disconnect);
    }

    pub fn start(&self) {
        self.actor.send(SessionCommand::Start);
    }

    pub fn stop(&self) {
        self.actor.send(SessionCommand::Stop);
    }

    pub fn send_str(&self, token: &str) -> Result<(), InvalidCommand> {
        self.actor.send_str(token)
    }

    /// Stops the session and every worker, waiting for all of them.
    pub fn terminate(&mut self) {
        self.actor.stop();
    }

    /// Asks for a copy of the next measurement in the user buffer.
    pub fn request_user_data(&self) {
        self.shared.events.user_data_ready.clear();
        self.shared.events.user_data_request.set();
    }

    /// Copy of the last user snapshot.
    pub fn user_data(&self) -> Option<Measurement> {
        self.shared.user_data.latest()
    }

    pub fn user_buffer(&self) -> &MeasurementBuffer {
        &self.shared.user_data
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.load()
    }

    pub fn events(&self) -> &SessionEvents {
        &self.shared.events
    }

    pub fn device(&self) -> &DeviceHandle<D> {
        &self.device
    }

    pub fn acquisition(&self) -> &AcquisitionShared {
        &self.acquisition
    }

    pub fn statistics(&self) -> AcquisitionStatistics {
        self.acquisition.statistics()
    }

    pub fn logger(&self) -> &LoggerShared {
        &self.logger
    }

    pub fn connection(&self) -> &ConnectionShared {
        &self.connection
    }

    /// Properties read on connect or at the last heartbeat.
    pub fn properties(&self) -> Option<DeviceProperties> {
        self.shared
            .properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalog::MemorySink;
    use crate::error::DeviceError;
    use crate::simulator::{FaultSite, SimulatedSpectrometer, SimulatorSettings};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(5);

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + WAIT;
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            command_poll: Duration::from_millis(5),
            data_wait: Duration::from_millis(5),
            heartbeat_interval: Duration::from_millis(20),
            acquisition: AcquisitionSettings {
                idle_poll: Duration::from_millis(5),
                min_poll_interval: Duration::from_millis(1),
                max_poll_interval: Duration::from_millis(2),
            },
            logger: DataLoggerSettings {
                max_measurements_per_acq: 100,
                poll: Duration::from_millis(5),
            },
            ..Default::default()
        }
    }

    fn session(hooks: SessionHooks) -> Session<SimulatedSpectrometer> {
        let device = SimulatedSpectrometer::new(SimulatorSettings {
            transform_length: 64,
            sample_rate: 0.064,
            num_averages: 1,
            ..Default::default()
        });
        let mut session = Session::new(device, Box::new(MemorySink::new()), settings(), hooks);
        session.initialize().unwrap();
        session
    }

    /// Connected session on a device producing a spectrum every 10 ms.
    fn fast_session(
        continuous: bool,
        logging: bool,
        hooks: SessionHooks,
    ) -> Session<SimulatedSpectrometer> {
        let device = SimulatedSpectrometer::new(SimulatorSettings {
            transform_length: 64,
            sample_rate: 6400.0,
            num_averages: 1,
            continuous,
            ..Default::default()
        });
        let settings = SessionSettings {
            enable_data_logging: logging,
            ..settings()
        };
        let mut session = Session::new(device, Box::new(MemorySink::new()), settings, hooks);
        session.initialize().unwrap();
        session.connect("SIM::0::INSTR");
        assert!(session.events().connect.wait_timeout(WAIT));
        assert!(wait_until(|| session.state() == SessionState::Idle));
        session
    }

    #[test]
    fn test_one_shot_measurement_is_stored_before_stop() {
        // A slow heartbeat hook lets publish and stop land in the same cycle.
        let mut session = fast_session(
            false,
            true,
            SessionHooks {
                on_heartbeat: Some(Box::new(|_: &DeviceProperties| {
                    std::thread::sleep(Duration::from_millis(15))
                })),
                ..Default::default()
            },
        );

        for _ in 0..3 {
            session.events().stop.clear();
            session.start();
            assert!(session.events().stop.wait_timeout(WAIT));
            assert_eq!(session.statistics().ok, 1);
            assert_eq!(session.logger().stored(), 1);
            assert!(wait_until(|| session.state() == SessionState::Idle));
        }
        session.terminate();
    }

    #[test]
    fn test_busy_user_buffer_skips_snapshot() {
        let snapshots = Arc::new(AtomicUsize::new(0));
        let hook_snapshots = Arc::clone(&snapshots);
        let mut session = fast_session(
            true,
            false,
            SessionHooks {
                on_user_data_ready: Some(Box::new(move |_: &Measurement| {
                    hook_snapshots.fetch_add(1, Ordering::Relaxed);
                })),
                ..Default::default()
            },
        );
        session.start();
        assert!(session.events().start.wait_timeout(WAIT));

        let released = session.acquisition().buffer().released();
        {
            let _held = session.user_buffer().try_guard().unwrap();
            session.request_user_data();
            released.clear();
            assert!(released.wait_timeout(WAIT));
            released.clear();
            assert!(released.wait_timeout(WAIT));

            assert!(session.events().user_data_request.is_set());
            assert!(!session.events().user_data_ready.is_set());
            assert_eq!(snapshots.load(Ordering::Relaxed), 0);
        }

        assert!(session.events().user_data_ready.wait_timeout(WAIT));
        assert!(!session.events().user_data_request.is_set());
        assert!(wait_until(|| snapshots.load(Ordering::Relaxed) == 1));
        assert!(session.user_data().is_some());

        session.stop();
        assert!(session.events().stop.wait_timeout(WAIT));
        session.terminate();
    }

    #[test]
    fn test_failed_connect_returns_to_disconnected() {
        let mut session = session(SessionHooks::default());
        session.device().lock().inject_fault(
            FaultSite::Connect,
            DeviceError::Communication("refused".into()),
        );
        session.connect("SIM::1::INSTR");
        assert!(wait_until(|| session.connection().last_error().is_some()));
        assert!(wait_until(|| session.state() == SessionState::Disconnected));
        assert!(!session.events().connect.is_set());

        session.connect("SIM::1::INSTR");
        assert!(session.events().connect.wait_timeout(WAIT));
        assert_eq!(session.device().lock().resource(), "SIM::1::INSTR");
        session.terminate();
    }

    #[test]
    fn test_state_hook_sees_transitions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);
        let mut session = session(SessionHooks {
            on_state_change: Some(Box::new(move |state: SessionState| {
                hook_seen.lock().unwrap().push(state)
            })),
            ..Default::default()
        });
        session.connect("SIM::0::INSTR");
        session.disconnect();
        assert!(session.events().disconnect.wait_timeout(WAIT));
        session.terminate();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SessionState::Disconnected,
                SessionState::Connecting,
                SessionState::Idle,
                SessionState::Disconnected,
            ]
        );
    }

    #[test]
    fn test_heartbeat_refreshes_properties() {
        let beats = Arc::new(AtomicUsize::new(0));
        let hook_beats = Arc::clone(&beats);
        let mut session = session(SessionHooks {
            on_heartbeat: Some(Box::new(move |props: &DeviceProperties| {
                if props.transform_length == 64 {
                    hook_beats.fetch_add(1, Ordering::Relaxed);
                }
            })),
            ..Default::default()
        });
        session.connect("SIM::0::INSTR");
        assert!(session.events().connect.wait_timeout(WAIT));
        assert!(session.properties().is_some());

        assert!(wait_until(|| beats.load(Ordering::Relaxed) >= 2));
        session.terminate();
    }

    #[test]
    fn test_commands_out_of_state_are_ignored() {
        let mut session = session(SessionHooks::default());
        session.start();
        session.stop();
        assert!(session.send_str("launch").is_err());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.events().start.is_set());
        session.terminate();
    }
}
