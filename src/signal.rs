use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// A latching flag threads can raise, clear and wait on.
///
/// Actors use it to announce events (acquisition started, data ready, store
/// done) to whoever is watching, without knowing who that is.
#[derive(Debug, Default)]
pub struct Signal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set(&self) {
        let mut flag = self.flag.lock().unwrap_or_else(PoisonError::into_inner);
        *flag = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.flag.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clears the flag and reports whether it was raised.
    pub fn take(&self) -> bool {
        let mut flag = self.flag.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *flag, false)
    }

    /// Blocks until the flag is raised.
    pub fn wait(&self) {
        let mut flag = self.flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*flag {
            flag = self.cond.wait(flag).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the flag is raised or `timeout` elapses. Returns the flag.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let flag = self.flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (flag, _) = self
            .cond
            .wait_timeout_while(flag, timeout, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
        *flag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_set_take_clear() {
        let signal = Signal::new();
        assert!(!signal.is_set());
        signal.set();
        assert!(signal.is_set());
        assert!(signal.take());
        assert!(!signal.take());
        signal.set();
        signal.clear();
        assert!(!signal.is_set());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let signal = Signal::new();
        let start = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_wakes_on_set() {
        let signal = Arc::new(Signal::new());
        let remote = Arc::clone(&signal);
        let handle = thread::spawn(move || remote.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        signal.set();
        assert!(handle.join().unwrap());
    }
}
