use ndarray::Array1;

/// Counters for one acquisition session.
///
/// A fresh instance is created on every start. `total` tracks the device's
/// measurement counter, so it is also the reference point for detecting
/// skipped measurements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionStatistics {
    /// Measurements transferred from the device.
    pub ok: u64,
    /// Measurements completed by the device but never polled in time.
    pub dropped: u64,
    /// Latest value of the device's measurement counter.
    pub total: u64,
    /// Transfers discarded because a reader held the measurement buffer.
    pub blocked: u64,
    pub overflow: bool,
    pub memory_error: bool,
}

impl AcquisitionStatistics {
    pub fn new() -> Self {
        Default::default()
    }

    /// Accounts a new reading of the device's measurement counter and returns
    /// how far it advanced.
    ///
    /// Any advance counts one good measurement; every measurement skipped in
    /// between is counted as dropped.
    pub fn record_count(&mut self, count: u64) -> u64 {
        if count <= self.total {
            return 0;
        }
        let advance = count - self.total;
        self.ok += 1;
        self.dropped += advance - 1;
        self.total = count;
        advance
    }
}

/// One completed, averaged spectrum and the statistics at the time it was taken.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub spectrum: Array1<f64>,
    pub num_averages: u32,
    pub stats: AcquisitionStatistics,
}

impl Measurement {
    /// Bin index and value of the strongest bin.
    pub fn peak(&self) -> Option<(usize, f64)> {
        self.spectrum
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (i, v)| match best {
                Some((_, b)) if b >= v => best,
                _ => Some((i, v)),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_drop_accounting() {
        let mut stats = AcquisitionStatistics::new();
        let advances: Vec<u64> = [0, 1, 3, 3, 6]
            .into_iter()
            .map(|count| stats.record_count(count))
            .collect();
        assert_eq!(advances, vec![0, 1, 2, 0, 3]);
        assert_eq!(stats.ok, 3);
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.total, 6);
        assert_eq!(stats.blocked, 0);
    }

    #[test]
    fn test_counter_going_backwards_is_ignored() {
        let mut stats = AcquisitionStatistics::new();
        stats.record_count(4);
        assert_eq!(stats.record_count(2), 0);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.ok, 1);
    }

    #[test]
    fn test_peak() {
        let m = Measurement {
            spectrum: array![1.0, 5.0, 3.0, 5.0],
            num_averages: 1,
            stats: AcquisitionStatistics::new(),
        };
        assert_eq!(m.peak(), Some((1, 5.0)));

        let empty = Measurement {
            spectrum: Array1::zeros(0),
            ..m
        };
        assert_eq!(empty.peak(), None);
    }
}
