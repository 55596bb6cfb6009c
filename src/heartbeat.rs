//! Fixed-rate tick used for slow housekeeping such as property refreshes.

use crate::actor::{command_set, Actor, CommandActor, Mailbox};
use crate::signal::Signal;
use crossbeam_channel::tick;
use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shortest accepted tick interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

command_set! {
    pub enum HeartbeatCommand for "Heartbeat" {
        Terminate => "terminate",
    }
    terminate = Some(Self::Terminate);
}

#[derive(Debug, Default)]
pub struct HeartbeatShared {
    beat: Signal,
    beats: AtomicU64,
}

impl HeartbeatShared {
    /// Raised on every tick.
    pub fn beat(&self) -> &Signal {
        &self.beat
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }
}

pub struct HeartbeatWorker {
    interval: Duration,
    shared: Arc<HeartbeatShared>,
}

impl Actor for HeartbeatWorker {
    type Command = HeartbeatCommand;

    fn run(self, mailbox: Mailbox<HeartbeatCommand>) {
        let ticker = tick(self.interval);
        let poll = self.interval.min(Duration::from_millis(100));
        loop {
            if let Some(HeartbeatCommand::Terminate) = mailbox.try_receive() {
                break;
            }
            if ticker.recv_timeout(poll).is_ok() {
                self.shared.beats.fetch_add(1, Ordering::Relaxed);
                self.shared.beat.set();
            }
        }
    }
}

pub struct Heartbeat {
    actor: CommandActor<HeartbeatWorker>,
    shared: Arc<HeartbeatShared>,
    interval: Duration,
}

impl Heartbeat {
    /// Intervals below [`MIN_INTERVAL`] are raised to it.
    pub fn new(interval: Duration) -> Self {
        if interval < MIN_INTERVAL {
            warn!("Heartbeat interval {interval:?} too short, using {MIN_INTERVAL:?}");
        }
        let interval = interval.max(MIN_INTERVAL);
        let shared = Arc::new(HeartbeatShared::default());
        let worker = HeartbeatWorker {
            interval,
            shared: Arc::clone(&shared),
        };
        Self {
            actor: CommandActor::new(worker),
            shared,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn start(&mut self) -> std::io::Result<()> {
        self.actor.start("Heartbeat")
    }

    pub fn stop(&mut self) {
        self.actor.stop();
    }

    pub fn shared(&self) -> &Arc<HeartbeatShared> {
        &self.shared
    }
}
