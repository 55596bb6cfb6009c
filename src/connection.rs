//! Background connect and disconnect, so callers never stall on a slow
//! instrument.

use crate::actor::{command_set, state_enum, Actor, CommandActor, Mailbox, StateCell};
use crate::device::{DeviceHandle, Spectrometer};
use crate::error::DeviceError;
use crate::signal::Signal;
use log::{error, info};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

state_enum! {
    pub enum ConnectionState {
        Disconnected => "disconnected",
        Connecting => "connecting",
        Connected => "connected",
        Failed => "failed",
    }
}

command_set! {
    pub enum ConnectionCommand for "ConnectionManager" {
        Connect => "connect",
        Disconnect => "disconnect",
        Terminate => "terminate",
    }
    terminate = Some(Self::Terminate);
}

#[derive(Debug)]
pub struct ConnectionShared {
    state: StateCell<ConnectionState>,
    connected: Signal,
    disconnected: Signal,
    failed: Signal,
    last_error: Mutex<Option<DeviceError>>,
}

impl ConnectionShared {
    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    pub fn connected(&self) -> &Signal {
        &self.connected
    }

    pub fn disconnected(&self) -> &Signal {
        &self.disconnected
    }

    pub fn failed(&self) -> &Signal {
        &self.failed
    }

    pub fn last_error(&self) -> Option<DeviceError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct ConnectionWorker<D> {
    device: DeviceHandle<D>,
    shared: Arc<ConnectionShared>,
    poll: Duration,
}

impl<D: Spectrometer> Actor for ConnectionWorker<D> {
    type Command = ConnectionCommand;

    fn run(self, mailbox: Mailbox<ConnectionCommand>) {
        let mut state = ConnectionState::Disconnected;
        loop {
            self.shared.state.store(state);
            if state == ConnectionState::Connecting {
                state = self.connect();
                continue;
            }
            if state == ConnectionState::Failed {
                state = ConnectionState::Disconnected;
                continue;
            }

            match (state, mailbox.receive_timeout(self.poll)) {
                (_, Some(ConnectionCommand::Terminate)) => break,
                (ConnectionState::Disconnected, Some(ConnectionCommand::Connect)) => {
                    state = ConnectionState::Connecting;
                }
                (ConnectionState::Disconnected, Some(ConnectionCommand::Disconnect)) => {
                    self.shared.disconnected.set();
                }
                (ConnectionState::Connected, Some(ConnectionCommand::Disconnect)) => {
                    state = self.disconnect();
                }
                _ => {}
            }
        }
    }
}

impl<D: Spectrometer> ConnectionWorker<D> {
    fn connect(&self) -> ConnectionState {
        let mut device = self.device.lock();
        info!("Connecting to {}", device.resource());
        match device.connect() {
            Ok(()) => {
                drop(device);
                self.shared.connected.set();
                ConnectionState::Connected
            }
            Err(e) => {
                drop(device);
                error!("{e}");
                *self
                    .shared
                    .last_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(e);
                self.shared.failed.set();
                ConnectionState::Failed
            }
        }
    }

    fn disconnect(&self) -> ConnectionState {
        if let Err(e) = self.device.lock().disconnect() {
            error!("Disconnect failed: {e}");
        }
        info!("Disconnected");
        self.shared.disconnected.set();
        ConnectionState::Disconnected
    }
}

/// Owner handle of the connection thread.
pub struct ConnectionManager<D: Spectrometer> {
    actor: CommandActor<ConnectionWorker<D>>,
    shared: Arc<ConnectionShared>,
}

impl<D: Spectrometer> ConnectionManager<D> {
    pub fn new(device: DeviceHandle<D>, poll: Duration) -> Self {
        let shared = Arc::new(ConnectionShared {
            state: StateCell::new(ConnectionState::Disconnected),
            connected: Signal::new(),
            disconnected: Signal::new(),
            failed: Signal::new(),
            last_error: Mutex::new(None),
        });
        let worker = ConnectionWorker {
            device,
            shared: Arc::clone(&shared),
            poll,
        };
        Self {
            actor: CommandActor::new(worker),
            shared,
        }
    }

    pub fn start(&mut self) -> std::io::Result<()> {
        self.actor.start("Connection")
    }

    pub fn connect(&self) {
        self.actor.send(ConnectionCommand::Connect);
    }

    pub fn disconnect(&self) {
        self.actor.send(ConnectionCommand::Disconnect);
    }

    pub fn stop(&mut self) {
        self.actor.stop();
    }

    pub fn shared(&self) -> &Arc<ConnectionShared> {
        &self.shared
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{FaultSite, SimulatedSpectrometer, SimulatorSettings};

    const POLL: Duration = Duration::from_millis(5);
    const WAIT: Duration = Duration::from_secs(5);

    fn manager() -> (
        ConnectionManager<SimulatedSpectrometer>,
        DeviceHandle<SimulatedSpectrometer>,
    ) {
        let device = DeviceHandle::new(SimulatedSpectrometer::new(SimulatorSettings::default()));
        let mut manager = ConnectionManager::new(device.clone(), POLL);
        manager.start().unwrap();
        (manager, device)
    }

    #[test]
    fn test_connect_and_disconnect() {
        let (mut manager, device) = manager();
        manager.connect();
        assert!(manager.shared().connected().wait_timeout(WAIT));
        assert!(device.lock().is_connected());

        manager.disconnect();
        assert!(manager.shared().disconnected().wait_timeout(WAIT));
        assert!(!device.lock().is_connected());
        manager.stop();
    }

    #[test]
    fn test_failed_connect_returns_to_disconnected() {
        let (mut manager, device) = manager();
        device
            .lock()
            .inject_fault(FaultSite::Connect, DeviceError::Communication("no route".into()));
        manager.connect();
        assert!(manager.shared().failed().wait_timeout(WAIT));
        assert!(!manager.shared().connected().is_set());
        assert!(matches!(
            manager.shared().last_error(),
            Some(DeviceError::ConnectionFailed { .. })
        ));

        manager.connect();
        assert!(manager.shared().connected().wait_timeout(WAIT));
        manager.stop();
    }

    #[test]
    fn test_disconnect_while_disconnected_acknowledges() {
        let (mut manager, _) = manager();
        manager.disconnect();
        assert!(manager.shared().disconnected().wait_timeout(WAIT));
        manager.stop();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
