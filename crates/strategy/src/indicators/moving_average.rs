//! Streaming moving averages. Each reads the first component of a sample.

use std::collections::VecDeque;

use crate::Indicator;

/// Simple Moving Average over the last `period` samples.
#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "SMA period must be greater than 0");
        Self {
            period,
            window: VecDeque::with_capacity(period + 1),
            sum: 0.0,
        }
    }
}

impl Indicator for Sma {
    fn next_value(&mut self, sample: &[f64]) -> Option<f64> {
        let x = *sample.first()?;
        self.window.push_back(x);
        self.sum += x;
        if self.window.len() > self.period {
            self.sum -= self.window.pop_front()?;
        }
        (self.window.len() == self.period).then(|| self.sum / self.period as f64)
    }

    fn warmup(&self) -> usize {
        self.period
    }
}

/// Weighted Moving Average: linear weights, newest sample weighs `period`.
#[derive(Debug, Clone)]
pub struct Wma {
    period: usize,
    window: VecDeque<f64>,
}

impl Wma {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "WMA period must be greater than 0");
        Self {
            period,
            window: VecDeque::with_capacity(period + 1),
        }
    }
}

impl Indicator for Wma {
    fn next_value(&mut self, sample: &[f64]) -> Option<f64> {
        self.window.push_back(*sample.first()?);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        if self.window.len() < self.period {
            return None;
        }

        let weighted: f64 = self
            .window
            .iter()
            .enumerate()
            .map(|(i, x)| (i + 1) as f64 * x)
            .sum();
        let norm = (self.period * (self.period + 1)) as f64 / 2.0;
        Some(weighted / norm)
    }

    fn warmup(&self) -> usize {
        self.period
    }
}

/// Exponential Moving Average, seeded with the SMA of the first `period` samples.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    k: f64,
    seed: Vec<f64>,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        assert!(period > 0, "EMA period must be greater than 0");
        Self {
            period,
            k: 2.0 / (period as f64 + 1.0),
            seed: Vec::with_capacity(period),
            value: None,
        }
    }
}

impl Indicator for Ema {
    fn next_value(&mut self, sample: &[f64]) -> Option<f64> {
        let x = *sample.first()?;
        let next = match self.value {
            Some(prev) => x * self.k + prev * (1.0 - self.k),
            None => {
                self.seed.push(x);
                if self.seed.len() < self.period {
                    return None;
                }
                self.seed.iter().sum::<f64>() / self.period as f64
            }
        };
        self.value = Some(next);
        Some(next)
    }

    fn warmup(&self) -> usize {
        self.period
    }
}
