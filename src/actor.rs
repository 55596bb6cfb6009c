//! Command-driven worker threads.
//!
//! Every stateful stage of the pipeline is an [`Actor`]: a private state
//! machine that owns a [`Mailbox`] and runs on its own thread. The
//! [`CommandActor`] handle starts the thread, feeds it commands in FIFO order
//! and joins it on [`stop`](CommandActor::stop).
//!
//! Loops must never wait on their mailbox without a bound. Use
//! [`Mailbox::try_receive`] or [`Mailbox::receive_timeout`] so timer-driven
//! transitions keep running when no command arrives.

use crate::error::InvalidCommand;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, warn};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A closed set of commands understood by one actor.
pub trait ActorCommand: Debug + Send + Sized + 'static {
    /// Actor name used in diagnostics.
    const ACTOR: &'static str;
    /// Every token accepted by [`parse`](Self::parse).
    const VALID: &'static [&'static str];

    fn parse(token: &str) -> Option<Self>;

    /// The command that ends the actor's loop, if the set has one.
    fn terminate() -> Option<Self>;
}

/// Declares a command enum together with its [`ActorCommand`] and `FromStr`
/// implementations.
macro_rules! command_set {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident for $actor:literal {
            $($(#[$vmeta:meta])* $variant:ident => $token:literal),+ $(,)?
        }
        terminate = $terminate:expr;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $crate::actor::ActorCommand for $name {
            const ACTOR: &'static str = $actor;
            const VALID: &'static [&'static str] = &[$($token),+];

            fn parse(token: &str) -> Option<Self> {
                match token {
                    $($token => Some(Self::$variant),)+
                    _ => None,
                }
            }

            fn terminate() -> Option<Self> {
                $terminate
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::InvalidCommand;

            fn from_str(token: &str) -> Result<Self, Self::Err> {
                <Self as $crate::actor::ActorCommand>::parse(token).ok_or_else(|| {
                    $crate::error::InvalidCommand {
                        actor: $actor,
                        token: token.to_string(),
                        valid: <Self as $crate::actor::ActorCommand>::VALID,
                    }
                })
            }
        }
    };
}
pub(crate) use command_set;

/// Declares an actor state enum that can be published through a [`StateCell`].
macro_rules! state_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $label:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl $crate::actor::StateTag for $name {
            fn to_tag(self) -> u8 {
                self as u8
            }

            fn from_tag(tag: u8) -> Self {
                Self::ALL.get(tag as usize).copied().unwrap_or(Self::ALL[0])
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}
pub(crate) use state_enum;

/// Receiving end of an actor's command queue.
#[derive(Debug)]
pub struct Mailbox<C> {
    receiver: Receiver<C>,
}

impl<C: ActorCommand> Mailbox<C> {
    /// Next queued command, without blocking.
    ///
    /// Returns the terminate command when every sender is gone, since nobody
    /// can stop the actor any more.
    pub fn try_receive(&self) -> Option<C> {
        match self.receiver.try_recv() {
            Ok(command) => Some(Self::received(command)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => C::terminate(),
        }
    }

    /// Next queued command, waiting at most `timeout` for one to arrive.
    pub fn receive_timeout(&self, timeout: Duration) -> Option<C> {
        match self.receiver.recv_timeout(timeout) {
            Ok(command) => Some(Self::received(command)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => C::terminate(),
        }
    }

    fn received(command: C) -> C {
        debug!("{} received command: {:?}", C::ACTOR, command);
        command
    }
}

/// Cloneable sending end of an actor's command queue.
#[derive(Debug)]
pub struct CommandSender<C> {
    sender: Sender<C>,
}

impl<C> Clone for CommandSender<C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<C: ActorCommand> CommandSender<C> {
    pub fn send(&self, command: C) {
        if let Err(e) = self.sender.send(command) {
            warn!("{} is not running, dropped {:?}", C::ACTOR, e.into_inner());
        }
    }

    /// Parses `token` and enqueues it. Unknown tokens are logged and dropped.
    pub fn send_str(&self, token: &str) -> Result<(), InvalidCommand>
    where
        C: std::str::FromStr<Err = InvalidCommand>,
    {
        match token.parse::<C>() {
            Ok(command) => {
                self.send(command);
                Ok(())
            }
            Err(e) => {
                error!("{e}");
                Err(e)
            }
        }
    }
}

/// A state machine that runs on its own thread.
pub trait Actor: Send + 'static {
    type Command: ActorCommand;

    /// Runs until the actor observes its own termination condition.
    fn run(self, mailbox: Mailbox<Self::Command>);
}

/// Owner handle of an [`Actor`] thread.
pub struct CommandActor<A: Actor> {
    sender: CommandSender<A::Command>,
    pending: Option<(A, Mailbox<A::Command>)>,
    handle: Option<JoinHandle<()>>,
}

impl<A: Actor> CommandActor<A> {
    pub fn new(worker: A) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender: CommandSender { sender },
            pending: Some((worker, Mailbox { receiver })),
            handle: None,
        }
    }

    /// Spawns the worker thread. Starting twice is a caller error and is
    /// only logged.
    pub fn start(&mut self, thread_name: &str) -> std::io::Result<()> {
        let Some((worker, mailbox)) = self.pending.take() else {
            warn!("{} already started", A::Command::ACTOR);
            return Ok(());
        };
        debug!("Initializing {}", A::Command::ACTOR);
        let handle = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || worker.run(mailbox))?;
        self.handle = Some(handle);
        Ok(())
    }

    pub fn send(&self, command: A::Command) {
        self.sender.send(command);
    }

    pub fn send_str(&self, token: &str) -> Result<(), InvalidCommand>
    where
        A::Command: std::str::FromStr<Err = InvalidCommand>,
    {
        self.sender.send_str(token)
    }

    pub fn sender(&self) -> CommandSender<A::Command> {
        self.sender.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Sends the terminate command and joins the thread. Does nothing if the
    /// actor never started or was already stopped.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        debug!("Terminating {}", A::Command::ACTOR);
        if let Some(terminate) = A::Command::terminate() {
            self.sender.send(terminate);
        }
        if handle.join().is_err() {
            error!("{} thread panicked", A::Command::ACTOR);
        }
    }
}

impl<A: Actor> Drop for CommandActor<A> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Conversion between an actor state and its published tag.
pub trait StateTag: Copy + Debug + Send + Sync + 'static {
    fn to_tag(self) -> u8;
    fn from_tag(tag: u8) -> Self;
}

/// Last state published by an actor loop.
///
/// Written once per loop iteration and read with relaxed ordering; readers
/// may see a slightly stale value.
#[derive(Debug)]
pub struct StateCell<S> {
    tag: Arc<AtomicU8>,
    _state: PhantomData<fn() -> S>,
}

impl<S> Clone for StateCell<S> {
    fn clone(&self) -> Self {
        Self {
            tag: Arc::clone(&self.tag),
            _state: PhantomData,
        }
    }
}

impl<S: StateTag> StateCell<S> {
    pub fn new(initial: S) -> Self {
        Self {
            tag: Arc::new(AtomicU8::new(initial.to_tag())),
            _state: PhantomData,
        }
    }

    pub fn store(&self, state: S) {
        self.tag.store(state.to_tag(), Ordering::Relaxed);
    }

    pub fn load(&self) -> S {
        S::from_tag(self.tag.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    command_set! {
        enum EchoCommand for "Echo" {
            Ping => "ping",
            Pong => "pong",
            Terminate => "terminate",
        }
        terminate = Some(Self::Terminate);
    }

    state_enum! {
        enum EchoState {
            Waiting => "waiting",
            Done => "done",
        }
    }

    const POLL: Duration = Duration::from_millis(20);

    struct Echo {
        seen: Arc<Mutex<Vec<EchoCommand>>>,
        state: StateCell<EchoState>,
    }

    impl Actor for Echo {
        type Command = EchoCommand;

        fn run(self, mailbox: Mailbox<EchoCommand>) {
            loop {
                self.state.store(EchoState::Waiting);
                match mailbox.receive_timeout(POLL) {
                    Some(EchoCommand::Terminate) => break,
                    Some(command) => self.seen.lock().unwrap().push(command),
                    None => {}
                }
            }
            self.state.store(EchoState::Done);
        }
    }

    fn echo() -> (CommandActor<Echo>, Arc<Mutex<Vec<EchoCommand>>>, StateCell<EchoState>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let state = StateCell::new(EchoState::Waiting);
        let actor = CommandActor::new(Echo {
            seen: Arc::clone(&seen),
            state: state.clone(),
        });
        (actor, seen, state)
    }

    #[test]
    fn test_stop_without_start_returns_immediately() {
        let (mut actor, _, _) = echo();
        let start = Instant::now();
        actor.stop();
        actor.stop();
        assert!(start.elapsed() < POLL);
        assert!(!actor.is_running());
    }

    #[test]
    fn test_terminate_then_stop() {
        let (mut actor, _, state) = echo();
        actor.start("echo").unwrap();
        assert!(actor.is_running());

        let start = Instant::now();
        actor.send(EchoCommand::Terminate);
        actor.stop();
        assert!(start.elapsed() < POLL * 5);
        assert_eq!(state.load(), EchoState::Done);
    }

    #[test]
    fn test_commands_arrive_in_order() {
        use EchoCommand::{Ping, Pong};

        let (mut actor, seen, _) = echo();
        actor.send(Ping);
        actor.send_str("pong").unwrap();
        actor.send_str("ping").unwrap();
        actor.send(Pong);
        actor.start("echo").unwrap();
        let sender = actor.sender();
        for i in 0..50 {
            sender.send(if i % 3 == 0 { Pong } else { Ping });
        }
        actor.stop();

        let mut expected = vec![Ping, Pong, Ping, Pong];
        expected.extend((0..50).map(|i| if i % 3 == 0 { Pong } else { Ping }));
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[test]
    fn test_invalid_token_is_dropped() {
        let (mut actor, seen, _) = echo();
        actor.start("echo").unwrap();
        let err = actor.send_str("pang").unwrap_err();
        assert_eq!(err.actor, "Echo");
        assert_eq!(err.token, "pang");
        actor.send(EchoCommand::Ping);
        actor.stop();
        assert_eq!(*seen.lock().unwrap(), vec![EchoCommand::Ping]);
    }

    #[test]
    fn test_double_start_is_ignored() {
        let (mut actor, _, _) = echo();
        actor.start("echo").unwrap();
        actor.start("echo").unwrap();
        actor.stop();
        assert!(!actor.is_running());
    }

    #[test]
    fn test_state_tags_round_trip() {
        let cell = StateCell::new(EchoState::Waiting);
        cell.store(EchoState::Done);
        assert_eq!(cell.load(), EchoState::Done);
        assert_eq!(EchoState::from_tag(200), EchoState::Waiting);
        assert_eq!(EchoState::Done.to_string(), "done");
    }
}
