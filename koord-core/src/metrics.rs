//! Rolling aggregates shared by the distributor and topology metrics

use std::collections::VecDeque;

/// Default number of samples kept by a rolling window
pub const DEFAULT_WINDOW: usize = 20;

/// Mean over the most recent `window` samples
#[derive(Debug, Clone)]
pub struct RollingAverage {
    window: usize,
    samples: VecDeque<f64>,
}

impl Default for RollingAverage {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl RollingAverage {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }

    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// 0.0 when empty
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_drops_oldest() {
        let mut avg = RollingAverage::new(2);
        assert_eq!(avg.average(), 0.0);
        avg.push(1.0);
        avg.push(3.0);
        assert_eq!(avg.average(), 2.0);
        avg.push(5.0);
        assert_eq!(avg.len(), 2);
        assert_eq!(avg.average(), 4.0);
    }
}
