//! Technical indicators powered by the `ta` crate
//!
//! RSI, EMAs, and Bollinger Bands come from the battle-tested `ta` crate.
//! ATR and ADX are implemented by hand because the system requires Wilder's
//! smoothing, which differs from the `ta` definitions.
//!
//! The [`IndicatorBundle`] is the read-only snapshot handed to the strategy
//! engine each bar: the latest value of every indicator the planner reads.

use ta::indicators::{BollingerBands as TaBB, ExponentialMovingAverage, RelativeStrengthIndex};
use ta::Next;

use crate::Candle;

/// Type alias for band indicators (upper, middle, lower)
pub type BandOutput = (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>);

// =============================================================================
// Moving Averages
// =============================================================================

/// Calculate Exponential Moving Average
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match ExponentialMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    let mut result = Vec::with_capacity(values.len());

    for (i, &value) in values.iter().enumerate() {
        let ema_val = indicator.next(value);
        if i + 1 >= period {
            result.push(Some(ema_val));
        } else {
            result.push(None);
        }
    }

    result
}

// =============================================================================
// Volatility Indicators
// =============================================================================

/// Calculate True Range
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        let tr_value = if i == 0 {
            high[i] - low[i]
        } else {
            let hl = high[i] - low[i];
            let hc = (high[i] - close[i - 1]).abs();
            let lc = (low[i] - close[i - 1]).abs();
            hl.max(hc).max(lc)
        };
        tr.push(tr_value);
    }

    tr
}

/// Calculate Average True Range (ATR) using Wilder's smoothing
///
/// ATR = (prev_ATR * (period - 1) + current_TR) / period, seeded with the
/// SMA of the first `period` true-range values.
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    if high.is_empty() || period == 0 || high.len() != low.len() || high.len() != close.len() {
        return vec![];
    }

    let tr = true_range(high, low, close);
    let mut result = Vec::with_capacity(high.len());

    let mut atr_value: Option<f64> = None;

    for i in 0..tr.len() {
        if i + 1 < period {
            result.push(None);
        } else if i + 1 == period {
            let sum: f64 = tr[0..period].iter().sum();
            atr_value = Some(sum / period as f64);
            result.push(atr_value);
        } else if let Some(prev_atr) = atr_value {
            let new_atr = (prev_atr * (period - 1) as f64 + tr[i]) / period as f64;
            atr_value = Some(new_atr);
            result.push(atr_value);
        } else {
            result.push(None);
        }
    }

    result
}

/// Calculate Bollinger Bands using ta crate
pub fn bollinger_bands(values: &[f64], period: usize, num_std: f64) -> BandOutput {
    if values.is_empty() || period == 0 {
        return (vec![], vec![], vec![]);
    }

    let mut indicator = match TaBB::new(period, num_std) {
        Ok(i) => i,
        Err(_) => {
            return (
                vec![None; values.len()],
                vec![None; values.len()],
                vec![None; values.len()],
            )
        }
    };

    let mut upper = Vec::with_capacity(values.len());
    let mut middle = Vec::with_capacity(values.len());
    let mut lower = Vec::with_capacity(values.len());

    for (i, &value) in values.iter().enumerate() {
        let bb = indicator.next(value);
        if i + 1 >= period {
            upper.push(Some(bb.upper));
            middle.push(Some(bb.average));
            lower.push(Some(bb.lower));
        } else {
            upper.push(None);
            middle.push(None);
            lower.push(None);
        }
    }

    (upper, middle, lower)
}

// =============================================================================
// Momentum Indicators
// =============================================================================

/// Calculate RSI (Relative Strength Index) using ta crate
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match RelativeStrengthIndex::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    let mut result = Vec::with_capacity(values.len());

    for (i, &value) in values.iter().enumerate() {
        let rsi_val = indicator.next(value);
        if i + 1 >= period {
            result.push(Some(rsi_val));
        } else {
            result.push(None);
        }
    }

    result
}

// =============================================================================
// Trend Indicators
// =============================================================================

/// Apply Wilder's smoothing to a series
/// Wilder's smoothing: new_value = (prev_value * (period - 1) + current) / period
fn wilders_smooth(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut result = Vec::with_capacity(values.len());
    let mut smoothed: Option<f64> = None;

    for i in 0..values.len() {
        if i + 1 < period {
            result.push(None);
        } else if i + 1 == period {
            let sum: f64 = values[0..period].iter().sum();
            smoothed = Some(sum / period as f64);
            result.push(smoothed);
        } else if let Some(prev) = smoothed {
            let new_val = (prev * (period - 1) as f64 + values[i]) / period as f64;
            smoothed = Some(new_val);
            result.push(smoothed);
        } else {
            result.push(None);
        }
    }

    result
}

/// Calculate Directional Movement Index (DMI) components using Wilder's smoothing
/// Returns (+DI, -DI)
pub fn dmi(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    period: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    if high.is_empty() || period == 0 {
        return (vec![], vec![]);
    }

    let mut plus_dm = vec![0.0; high.len()];
    let mut minus_dm = vec![0.0; high.len()];

    for i in 1..high.len() {
        let up_move = high[i] - high[i - 1];
        let down_move = low[i - 1] - low[i];

        if up_move > down_move && up_move > 0.0 {
            plus_dm[i] = up_move;
        }
        if down_move > up_move && down_move > 0.0 {
            minus_dm[i] = down_move;
        }
    }

    let smoothed_plus_dm = wilders_smooth(&plus_dm, period);
    let smoothed_minus_dm = wilders_smooth(&minus_dm, period);
    let atr_values = atr(high, low, close, period);

    let mut plus_di = Vec::with_capacity(high.len());
    let mut minus_di = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        match (
            smoothed_plus_dm.get(i),
            smoothed_minus_dm.get(i),
            atr_values.get(i),
        ) {
            (Some(Some(pdm)), Some(Some(mdm)), Some(Some(atr_val))) if *atr_val > 0.0 => {
                plus_di.push(Some(pdm / atr_val * 100.0));
                minus_di.push(Some(mdm / atr_val * 100.0));
            }
            _ => {
                plus_di.push(None);
                minus_di.push(None);
            }
        }
    }

    (plus_di, minus_di)
}

/// Calculate Average Directional Index (ADX) using Wilder's smoothing
///
/// ADX requires 2*period - 1 warmup bars:
/// - First period for DI values to become valid
/// - Second period for ADX smoothing of DX values
pub fn adx(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    if high.is_empty() || period == 0 {
        return vec![];
    }

    let (plus_di, minus_di) = dmi(high, low, close, period);

    // DI values become valid at index (period - 1)
    let di_start = period - 1;

    let mut result = vec![None; high.len()];

    let mut dx_values: Vec<f64> = Vec::new();
    for i in di_start..high.len() {
        if let (Some(pdi), Some(mdi)) = (
            plus_di.get(i).and_then(|x| *x),
            minus_di.get(i).and_then(|x| *x),
        ) {
            let sum = pdi + mdi;
            if sum > 0.0 {
                dx_values.push((pdi - mdi).abs() / sum * 100.0);
            } else {
                dx_values.push(0.0);
            }
        } else {
            dx_values.push(0.0);
        }
    }

    if dx_values.len() >= period {
        let mut adx_value: Option<f64> = None;

        for (j, &dx) in dx_values.iter().enumerate() {
            let bar_idx = di_start + j;

            if j + 1 < period {
                // Not enough DX values yet
            } else if j + 1 == period {
                let sum: f64 = dx_values[0..period].iter().sum();
                adx_value = Some(sum / period as f64);
                result[bar_idx] = adx_value;
            } else if let Some(prev_adx) = adx_value {
                let new_adx = (prev_adx * (period - 1) as f64 + dx) / period as f64;
                adx_value = Some(new_adx);
                result[bar_idx] = adx_value;
            }
        }
    }

    result
}

// =============================================================================
// Indicator Bundle
// =============================================================================

/// Indicator periods used to build a bundle
#[derive(Debug, Clone)]
pub struct IndicatorConfig {
    pub rsi_period: usize,
    pub atr_period: usize,
    pub ema_fast_period: usize,
    pub ema_mid_period: usize,
    pub ema_slow_period: usize,
    pub bb_period: usize,
    pub bb_num_std: f64,
    /// Minimum candles required before a bundle is produced
    pub warmup_bars: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        IndicatorConfig {
            rsi_period: 14,
            atr_period: 14,
            ema_fast_period: 9,
            ema_mid_period: 21,
            ema_slow_period: 50,
            bb_period: 20,
            bb_num_std: 2.0,
            warmup_bars: 50,
        }
    }
}

/// Snapshot of the latest indicator values for one symbol
///
/// Produced once per bar and read-only after that. The strategy engine sees
/// only this struct, never the candle history.
#[derive(Debug, Clone)]
pub struct IndicatorBundle {
    pub close: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub rsi: f64,
    pub atr: f64,
    pub atr_pct: f64,
    pub ema_fast: f64,
    pub ema_mid: f64,
    pub ema_slow: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
}

impl IndicatorBundle {
    /// Build a bundle from a chronological candle window
    ///
    /// Returns `None` when the window is shorter than the warmup period or
    /// any required indicator has not converged yet.
    pub fn compute(candles: &[Candle], config: &IndicatorConfig) -> Option<IndicatorBundle> {
        if candles.len() < config.warmup_bars {
            return None;
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();

        let last = candles.last()?;

        let rsi_val = rsi(&closes, config.rsi_period).last().copied()??;
        let atr_val = atr(&highs, &lows, &closes, config.atr_period)
            .last()
            .copied()??;
        let ema_fast = ema(&closes, config.ema_fast_period).last().copied()??;
        let ema_mid = ema(&closes, config.ema_mid_period).last().copied()??;
        let ema_slow = ema(&closes, config.ema_slow_period).last().copied()??;

        let (bb_u, bb_m, bb_l) = bollinger_bands(&closes, config.bb_period, config.bb_num_std);
        let bb_upper = bb_u.last().copied()??;
        let bb_middle = bb_m.last().copied()??;
        let bb_lower = bb_l.last().copied()??;

        let atr_pct = if last.close > 0.0 {
            (atr_val / last.close) * 100.0
        } else {
            0.0
        };

        Some(IndicatorBundle {
            close: last.close,
            open: last.open,
            high: last.high,
            low: last.low,
            volume: last.volume,
            rsi: rsi_val,
            atr: atr_val,
            atr_pct,
            ema_fast,
            ema_mid,
            ema_slow,
            bb_upper,
            bb_middle,
            bb_lower,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
