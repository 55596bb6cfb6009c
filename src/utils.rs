use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Measurement counter with an all-time total and a sliding 1 s window rate.
#[derive(Debug)]
pub struct Counter {
    /// All-time number of measurements
    pub n_measurements: u64,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    window: Duration,
    events: VecDeque<(Instant, u64)>,
    in_window: u64,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            n_measurements: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            events: VecDeque::new(),
            in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average since `t_begin`, in measurements per second.
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.n_measurements as f64 / secs
    }

    /// Rate over the last window, in measurements per second.
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        self.in_window as f64 / secs
    }

    /// Records `n` new measurements.
    pub fn increment(&mut self, n: u64) {
        self.record_at(Instant::now(), n);
    }

    fn record_at(&mut self, now: Instant, n: u64) {
        self.n_measurements += n;
        if n > 0 {
            self.events.push_back((now, n));
            self.in_window += n;
        }

        while let Some(&(ts, count)) = self.events.front() {
            if now.duration_since(ts) > self.window {
                self.events.pop_front();
                self.in_window -= count;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.n_measurements = 0;
        self.t_begin = Instant::now();
        self.events.clear();
        self.in_window = 0;
    }
}
