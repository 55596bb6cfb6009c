//! Single-slot handoff of the latest measurement.
//!
//! The producer never waits for readers: if a reader holds the guard when a
//! new measurement is ready, the new one is discarded and the producer counts
//! it as blocked. Readers in turn may finish consuming a measurement that has
//! already been superseded.
//!
//! Consumers that need two buffers at once must take the destination guard
//! before the source guard. [`try_copy_latest`] is the only place in the
//! crate that does so.

use crate::measurement::Measurement;
use crate::signal::Signal;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

#[derive(Debug, Default)]
pub struct MeasurementBuffer {
    slot: Mutex<Option<Measurement>>,
    available: Signal,
    released: Signal,
}

/// Exclusive access to a buffer's slot.
pub struct BufferGuard<'a> {
    slot: MutexGuard<'a, Option<Measurement>>,
}

impl Deref for BufferGuard<'_> {
    type Target = Option<Measurement>;

    fn deref(&self) -> &Self::Target {
        &self.slot
    }
}

impl DerefMut for BufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.slot
    }
}

impl MeasurementBuffer {
    pub fn new() -> Self {
        Default::default()
    }

    /// Replaces the payload if the guard is free. Returns `false` without
    /// waiting when a reader holds it; the measurement is then dropped.
    pub fn try_publish(&self, measurement: Measurement) -> bool {
        match self.try_guard() {
            Some(mut guard) => {
                *guard = Some(measurement);
                drop(guard);
                self.available.set();
                true
            }
            None => false,
        }
    }

    /// Runs `f` on the current measurement unless the guard is busy or the
    /// slot is empty.
    pub fn try_read<R>(&self, f: impl FnOnce(&Measurement) -> R) -> Option<R> {
        let guard = self.try_guard()?;
        guard.as_ref().map(f)
    }

    /// Waits for the guard and runs `f` on the current measurement. Only for
    /// consumers running on their own thread.
    pub fn read_blocking<R>(&self, f: impl FnOnce(&Measurement) -> R) -> Option<R> {
        let guard = self.guard();
        guard.as_ref().map(f)
    }

    /// Clone of the current measurement, waiting for the guard.
    pub fn latest(&self) -> Option<Measurement> {
        (*self.guard()).clone()
    }

    pub fn try_guard(&self) -> Option<BufferGuard<'_>> {
        match self.slot.try_lock() {
            Ok(slot) => Some(BufferGuard { slot }),
            Err(TryLockError::Poisoned(e)) => Some(BufferGuard {
                slot: e.into_inner(),
            }),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub fn guard(&self) -> BufferGuard<'_> {
        BufferGuard {
            slot: self.slot.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Raised after every successful publish.
    pub fn available(&self) -> &Signal {
        &self.available
    }

    /// Raised by the consumer once it is done with a published measurement.
    ///
    /// Publishing never waits on it.
    pub fn released(&self) -> &Signal {
        &self.released
    }

    pub fn release(&self) {
        self.released.set();
    }
}

/// Copies the latest measurement of `source` into `destination`.
///
/// Takes the destination guard first and the source guard second, neither of
/// them blocking. Gives up when either guard is busy or `source` is empty.
/// On success the destination guard is returned still held, with the source
/// guard already released.
pub fn try_copy_latest<'a>(
    destination: &'a MeasurementBuffer,
    source: &MeasurementBuffer,
) -> Option<BufferGuard<'a>> {
    let mut dest = destination.try_guard()?;
    let copy = {
        let src = source.try_guard()?;
        (*src).clone()?
    };
    *dest = Some(copy);
    Some(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::AcquisitionStatistics;
    use ndarray::Array1;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn measurement(value: f64) -> Measurement {
        Measurement {
            spectrum: Array1::from_elem(8, value),
            num_averages: 4,
            stats: AcquisitionStatistics::new(),
        }
    }

    #[test]
    fn test_publish_and_read() {
        let buffer = MeasurementBuffer::new();
        assert_eq!(buffer.try_read(|m| m.num_averages), None);
        assert!(buffer.try_publish(measurement(1.0)));
        assert!(buffer.available().is_set());
        assert_eq!(buffer.try_read(|m| m.spectrum[0]), Some(1.0));
        assert_eq!(buffer.read_blocking(|m| m.spectrum[0]), Some(1.0));

        assert!(buffer.try_publish(measurement(2.0)));
        assert_eq!(buffer.latest().unwrap().spectrum[0], 2.0);
    }

    #[test]
    fn test_publish_fails_while_reader_holds_guard() {
        let buffer = MeasurementBuffer::new();
        assert!(buffer.try_publish(measurement(1.0)));
        buffer.available().clear();

        let guard = buffer.try_guard().unwrap();
        assert!(!buffer.try_publish(measurement(2.0)));
        assert_eq!(buffer.try_read(|m| m.spectrum[0]), None);
        drop(guard);

        assert!(!buffer.available().is_set());
        assert_eq!(buffer.try_read(|m| m.spectrum[0]), Some(1.0));
    }

    #[test]
    fn test_copy_requires_both_guards() {
        let user = MeasurementBuffer::new();
        let acq = MeasurementBuffer::new();
        assert!(try_copy_latest(&user, &acq).is_none());

        acq.try_publish(measurement(3.0));
        {
            let _held = acq.try_guard().unwrap();
            assert!(try_copy_latest(&user, &acq).is_none());
        }
        {
            let _held = user.try_guard().unwrap();
            assert!(try_copy_latest(&user, &acq).is_none());
        }

        let copied = try_copy_latest(&user, &acq).unwrap();
        assert_eq!(copied.as_ref().unwrap().spectrum[0], 3.0);
        assert!(acq.try_publish(measurement(4.0)));
        drop(copied);
        assert_eq!(user.latest().unwrap().spectrum[0], 3.0);
    }

    #[test]
    fn test_racing_consumers_never_deadlock() {
        let source = Arc::new(MeasurementBuffer::new());
        let destination = Arc::new(MeasurementBuffer::new());
        let running = Arc::new(AtomicBool::new(true));
        let published = Arc::new(AtomicU64::new(0));
        let copies = Arc::new(AtomicU64::new(0));

        let producer = {
            let source = Arc::clone(&source);
            let running = Arc::clone(&running);
            let published = Arc::clone(&published);
            thread::spawn(move || {
                let mut i = 0.0;
                while running.load(Ordering::Relaxed) {
                    if source.try_publish(measurement(i)) {
                        published.fetch_add(1, Ordering::Relaxed);
                    }
                    i += 1.0;
                }
            })
        };

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let source = Arc::clone(&source);
                let destination = Arc::clone(&destination);
                let running = Arc::clone(&running);
                let copies = Arc::clone(&copies);
                thread::spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        if try_copy_latest(&destination, &source).is_some() {
                            copies.fetch_add(1, Ordering::Relaxed);
                        }
                        destination.try_read(|m| m.spectrum.sum());
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(200));
        running.store(false, Ordering::Relaxed);
        producer.join().unwrap();
        for c in consumers {
            c.join().unwrap();
        }

        assert!(published.load(Ordering::Relaxed) > 0);
        assert!(copies.load(Ordering::Relaxed) > 0);
    }
}
