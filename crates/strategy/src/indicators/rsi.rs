use crate::Indicator;

/// RSI (Relative Strength Index), streaming form.
///
/// Uses Wilder's smoothed moving average (same as TradingView / standard RSI).
/// Returns `None` until `period + 1` samples have been seen.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    prev: Option<f64>,
    changes: usize,
    avg_gain: f64,
    avg_loss: f64,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        assert!(period >= 2, "RSI period must be >= 2");
        Self {
            period,
            prev: None,
            changes: 0,
            avg_gain: 0.0,
            avg_loss: 0.0,
        }
    }

    fn value(&self) -> f64 {
        if self.avg_loss == 0.0 {
            return 100.0;
        }
        let rs = self.avg_gain / self.avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

impl Indicator for Rsi {
    fn next_value(&mut self, sample: &[f64]) -> Option<f64> {
        let close = *sample.first()?;
        let prev = self.prev.replace(close)?;

        let change = close - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        let n = self.period as f64;
        self.changes += 1;

        if self.changes <= self.period {
            // Plain average over the first `period` changes
            self.avg_gain += gain / n;
            self.avg_loss += loss / n;
            if self.changes < self.period {
                return None;
            }
        } else {
            self.avg_gain = (self.avg_gain * (n - 1.0) + gain) / n;
            self.avg_loss = (self.avg_loss * (n - 1.0) + loss) / n;
        }

        Some(self.value())
    }

    fn warmup(&self) -> usize {
        self.period + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last(rsi: &mut Rsi, prices: &[f64]) -> Option<f64> {
        prices.iter().map(|p| rsi.next_value(&[*p])).last().flatten()
    }

    #[test]
    fn rsi_returns_none_when_insufficient_data() {
        let mut rsi = Rsi::new(14);
        let prices = vec![100.0; 14];
        assert!(last(&mut rsi, &prices).is_none());
    }

    #[test]
    fn rsi_returns_some_with_sufficient_data() {
        let mut rsi = Rsi::new(14);
        // 15 values: exactly period+1
        let prices: Vec<f64> = (0..15).map(|i| 100.0 + i as f64).collect();
        assert!(last(&mut rsi, &prices).is_some());
    }

    #[test]
    fn rsi_all_gains_returns_100() {
        let mut rsi = Rsi::new(3);
        let value = last(&mut rsi, &[10.0, 11.0, 12.0, 13.0, 14.0]).unwrap();
        assert!((value - 100.0).abs() < 1e-6, "Expected ~100, got {value}");
    }

    #[test]
    fn rsi_all_losses_returns_0() {
        let mut rsi = Rsi::new(3);
        let value = last(&mut rsi, &[14.0, 13.0, 12.0, 11.0, 10.0]).unwrap();
        assert!(value.abs() < 1e-6, "Expected ~0, got {value}");
    }

    #[test]
    fn rsi_known_value() {
        // StockCharts 14-period example; first value is 70.46 before rounding
        let mut rsi = Rsi::new(14);
        let prices = [
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            45.61, 46.28, 46.28,
        ];
        let v = last(&mut rsi, &prices).unwrap();
        assert!((v - 70.464).abs() < 0.01, "RSI = {v}");
    }
}
