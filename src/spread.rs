use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::config::SpreadConfig;

const STD_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpreadSample {
    pub timestamp: DateTime<Utc>,
    pub hedge_ratio: f64,
    pub spread_value: f64,
    pub rolling_mean: f64,
    pub rolling_std: f64,
    pub z_score: f64,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpreadError {
    InvalidPrice { leg: &'static str, value: String },
}

impl fmt::Display for SpreadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SpreadError::InvalidPrice { leg, value } => {
                write!(f, "invalid {} price: {}", leg, value)
            }
        }
    }
}

impl std::error::Error for SpreadError {}

/// Rolling spread statistics of one instrument pair.
///
/// The hedge ratio is the OLS slope of primary on secondary prices over the
/// hedge window. Each spread is stored with the ratio in force when it was
/// observed; mean and population std are taken over the latest `window`
/// spreads.
#[derive(Debug, Clone)]
pub struct SpreadCalculator {
    window: usize,
    hedge_window: usize,
    recompute_every: usize,
    prices_a: VecDeque<f64>,
    prices_b: VecDeque<f64>,
    spreads: VecDeque<f64>,
    hedge_ratio: Option<f64>,
    since_recompute: usize,
}

impl SpreadCalculator {
    pub fn new(cfg: &SpreadConfig) -> Self {
        Self {
            window: cfg.window.max(2),
            hedge_window: cfg.hedge_window.max(2),
            recompute_every: cfg.hedge_recompute_every.max(1),
            prices_a: VecDeque::with_capacity(cfg.hedge_window),
            prices_b: VecDeque::with_capacity(cfg.hedge_window),
            spreads: VecDeque::with_capacity(cfg.window),
            hedge_ratio: None,
            since_recompute: 0,
        }
    }

    pub fn update(
        &mut self,
        price_a: Decimal,
        price_b: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<SpreadSample, SpreadError> {
        let a = validate_price("primary", price_a)?;
        let b = validate_price("secondary", price_b)?;

        push_bounded(&mut self.prices_a, a, self.hedge_window);
        push_bounded(&mut self.prices_b, b, self.hedge_window);

        self.since_recompute += 1;
        let hedge_ratio = match self.hedge_ratio {
            Some(ratio) if self.since_recompute < self.recompute_every => ratio,
            _ => {
                self.since_recompute = 0;
                let ratio = ols_hedge_ratio(&self.prices_a, &self.prices_b).unwrap_or(a / b);
                self.hedge_ratio = Some(ratio);
                ratio
            }
        };

        let spread_value = a - hedge_ratio * b;
        push_bounded(&mut self.spreads, spread_value, self.window);

        let (rolling_mean, rolling_std) = mean_std(&self.spreads).unwrap_or((spread_value, 0.0));
        let stale = self.spreads.len() < 2 || rolling_std < STD_EPSILON;
        let z_score = if stale {
            0.0
        } else {
            (spread_value - rolling_mean) / rolling_std
        };

        Ok(SpreadSample {
            timestamp,
            hedge_ratio,
            spread_value,
            rolling_mean,
            rolling_std,
            z_score,
            stale,
        })
    }

    pub fn len(&self) -> usize {
        self.spreads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spreads.is_empty()
    }
}

fn validate_price(leg: &'static str, price: Decimal) -> Result<f64, SpreadError> {
    let invalid = || SpreadError::InvalidPrice {
        leg,
        value: price.to_string(),
    };
    if price <= Decimal::ZERO {
        return Err(invalid());
    }
    match price.to_f64() {
        Some(v) if v.is_finite() && v > 0.0 => Ok(v),
        _ => Err(invalid()),
    }
}

fn push_bounded(window: &mut VecDeque<f64>, value: f64, cap: usize) {
    window.push_back(value);
    while window.len() > cap {
        window.pop_front();
    }
}

/// OLS slope of `y` regressed on `x`. `None` when there are fewer than two
/// points, `x` has no variance, or the slope is not a usable ratio.
fn ols_hedge_ratio(y: &VecDeque<f64>, x: &VecDeque<f64>) -> Option<f64> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let mean_x = x.iter().take(n).sum::<f64>() / n as f64;
    let mean_y = y.iter().take(n).sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    for (xi, yi) in x.iter().zip(y.iter()).take(n) {
        let dx = xi - mean_x;
        cov += dx * (yi - mean_y);
        var_x += dx * dx;
    }
    if var_x.abs() < STD_EPSILON {
        return None;
    }
    let beta = cov / var_x;
    if beta.is_finite() && beta > 0.0 {
        Some(beta)
    } else {
        None
    }
}

fn mean_std(window: &VecDeque<f64>) -> Option<(f64, f64)> {
    if window.is_empty() {
        return None;
    }
    let mean = window.iter().copied().sum::<f64>() / window.len() as f64;
    let var = window
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / window.len() as f64;
    Some((mean, var.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn cfg(window: usize) -> SpreadConfig {
        SpreadConfig {
            window,
            hedge_window: window,
            hedge_recompute_every: 1,
        }
    }

    fn ts(i: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + i * 60, 0).unwrap()
    }

    #[test]
    fn single_sample_is_stale() {
        let mut calc = SpreadCalculator::new(&cfg(10));
        let sample = calc.update(dec!(100), dec!(50), ts(0)).unwrap();
        assert!(sample.stale);
        assert_eq!(sample.z_score, 0.0);
        assert_eq!(sample.hedge_ratio, 2.0);
    }

    #[test]
    fn constant_spread_is_stale() {
        let mut calc = SpreadCalculator::new(&cfg(10));
        let mut last = None;
        for i in 0..5 {
            last = Some(calc.update(dec!(100), dec!(50), ts(i)).unwrap());
        }
        let sample = last.unwrap();
        assert!(sample.stale);
        assert_eq!(sample.z_score, 0.0);
    }

    #[test]
    fn z_score_reflects_latest_deviation() {
        let mut calc = SpreadCalculator::new(&SpreadConfig {
            window: 10,
            hedge_window: 10,
            hedge_recompute_every: 1_000,
        });
        // First update fixes the ratio at 100/50 = 2.
        let prices = [
            (dec!(100), dec!(50)),
            (dec!(101), dec!(50)),
            (dec!(99), dec!(50)),
            (dec!(100), dec!(50)),
            (dec!(104), dec!(50)),
        ];
        let mut last = None;
        for (i, (a, b)) in prices.iter().enumerate() {
            last = Some(calc.update(*a, *b, ts(i as i64)).unwrap());
        }
        let sample = last.unwrap();
        assert_eq!(sample.hedge_ratio, 2.0);
        assert!(!sample.stale);
        // spreads: 0, 1, -1, 0, 4 -> mean 0.8, population std 1.7204650534...
        assert!((sample.rolling_mean - 0.8).abs() < 1e-12);
        let expected_std = (((0.8f64).powi(2)
            + (0.2f64).powi(2)
            + (1.8f64).powi(2)
            + (0.8f64).powi(2)
            + (3.2f64).powi(2))
            / 5.0)
            .sqrt();
        assert!((sample.rolling_std - expected_std).abs() < 1e-12);
        assert!((sample.z_score - 3.2 / expected_std).abs() < 1e-12);
    }

    #[test]
    fn window_evicts_oldest_spread() {
        let mut calc = SpreadCalculator::new(&cfg(3));
        for i in 0..6 {
            calc.update(dec!(100) + Decimal::from(i), dec!(50), ts(i)).unwrap();
        }
        assert_eq!(calc.len(), 3);
    }

    #[test]
    fn ols_ratio_recovers_linear_relation() {
        let mut calc = SpreadCalculator::new(&cfg(20));
        let mut last = None;
        for i in 0..10 {
            let b = dec!(20) + Decimal::from(i);
            let a = b * dec!(3) + dec!(5);
            last = Some(calc.update(a, b, ts(i)).unwrap());
        }
        assert!((last.unwrap().hedge_ratio - 3.0).abs() < 1e-9);
    }

    #[test]
    fn identical_inputs_give_identical_outputs() {
        let run = || {
            let mut calc = SpreadCalculator::new(&cfg(8));
            let mut out = Vec::new();
            for i in 0..12 {
                let a = dec!(100) + Decimal::from(i % 4);
                let b = dec!(50) + Decimal::from(i % 3);
                out.push(calc.update(a, b, ts(i)).unwrap());
            }
            out
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn non_positive_price_is_rejected_without_touching_windows() {
        let mut calc = SpreadCalculator::new(&cfg(10));
        calc.update(dec!(100), dec!(50), ts(0)).unwrap();
        let err = calc.update(dec!(0), dec!(50), ts(1)).unwrap_err();
        assert!(matches!(err, SpreadError::InvalidPrice { leg: "primary", .. }));
        assert_eq!(calc.len(), 1);
    }
}
