//! Technical indicators
//!
//! Moving average for the strategy baseline plus the ATR and volume figures
//! attached to trades for display.

use crate::Money;

/// Simple moving average over decimal closes, `None` during warm-up and for
/// any window that contains a gap.
///
/// Uses a running sum, which stays exact in decimal arithmetic.
pub fn sma_money(values: &[Option<Money>], period: usize) -> Vec<Option<Money>> {
    if period == 0 {
        return vec![None; values.len()];
    }
    let divisor = Money::from_i64(period as i64);
    let mut sum = Money::ZERO;
    let mut gaps = 0usize;
    let mut result = Vec::with_capacity(values.len());

    for (i, value) in values.iter().enumerate() {
        match value {
            Some(v) => sum += *v,
            None => gaps += 1,
        }
        if i >= period {
            match values[i - period] {
                Some(v) => sum -= v,
                None => gaps -= 1,
            }
        }
        result.push((i + 1 >= period && gaps == 0).then(|| sum / divisor));
    }

    result
}

/// Calculate Simple Moving Average
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if period == 0 {
        return vec![None; values.len()];
    }
    let mut result = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if i + 1 < period {
            result.push(None);
        } else {
            let sum: f64 = values[i + 1 - period..=i].iter().sum();
            result.push(Some(sum / period as f64));
        }
    }

    result
}

/// Calculate True Range. The first bar has no previous close, so it is `high - low`.
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    (0..high.len())
        .map(|i| {
            let hl = high[i] - low[i];
            if i == 0 {
                hl
            } else {
                let hc = (high[i] - close[i - 1]).abs();
                let lc = (low[i] - close[i - 1]).abs();
                hl.max(hc).max(lc)
            }
        })
        .collect()
}

/// Average True Range as a rolling mean of true range.
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    sma(&true_range(high, low, close), period)
}

/// ATR as a percentage of the close.
pub fn atr_pct(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    atr(high, low, close, period)
        .into_iter()
        .zip(close)
        .map(|(atr, &c)| {
            atr.filter(|a| a.is_finite() && c > 0.0)
                .map(|a| a / c * 100.0)
        })
        .collect()
}

/// Today's volume over the mean volume of the previous `window` days.
pub fn volume_ratio(volume: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(volume.len());
    for i in 0..volume.len() {
        if window == 0 || i < window {
            result.push(None);
            continue;
        }
        let avg = volume[i - window..i].iter().sum::<f64>() / window as f64;
        result.push((avg > 0.0).then(|| volume[i] / avg));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rust_decimal_macros::dec;

    #[test]
    fn test_sma() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = sma(&values, 3);

        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        assert_eq!(result[2], Some(2.0));
        assert_eq!(result[3], Some(3.0));
        assert_eq!(result[4], Some(4.0));
    }

    #[test]
    fn test_sma_money_matches_window_mean() {
        let values: Vec<Option<Money>> = [dec!(10.1), dec!(10.2), dec!(10.3), dec!(10.7)]
            .into_iter()
            .map(|v| Some(Money::from(v)))
            .collect();
        let result = sma_money(&values, 2);

        assert_eq!(result[0], None);
        assert_eq!(result[1], Some(Money::from(dec!(10.15))));
        assert_eq!(result[3], Some(Money::from(dec!(10.5))));
    }

    #[test]
    fn test_sma_money_skips_windows_with_gaps() {
        let values = vec![
            Some(Money::from_i64(2)),
            None,
            Some(Money::from_i64(4)),
            Some(Money::from_i64(6)),
        ];
        let result = sma_money(&values, 2);

        assert_eq!(result, vec![None, None, None, Some(Money::from_i64(5))]);
    }

    #[test]
    fn test_atr_pct_uses_rolling_mean() {
        let high = vec![11.0, 12.0, 13.0];
        let low = vec![9.0, 10.0, 11.0];
        let close = vec![10.0, 11.0, 12.0];
        // TR: 2, max(2, 2, 0) = 2, max(2, 2, 0) = 2
        let result = atr_pct(&high, &low, &close, 2);

        assert_eq!(result[0], None);
        assert_relative_eq!(result[1].unwrap(), 2.0 / 11.0 * 100.0);
        assert_relative_eq!(result[2].unwrap(), 2.0 / 12.0 * 100.0);
    }

    #[test]
    fn test_volume_ratio_excludes_today() {
        let volume = vec![100.0, 300.0, 400.0];
        let result = volume_ratio(&volume, 2);

        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        assert_relative_eq!(result[2].unwrap(), 2.0);
    }
}
