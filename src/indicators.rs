use crate::models::Bar;

/// Mean high-low range over the `period` bars ending at `index`.
/// Returns `None` until a full window is available.
pub fn average_range(bars: &[Bar], index: usize, period: usize) -> Option<f64> {
    if period == 0 || index >= bars.len() || index + 1 < period {
        return None;
    }
    let start = index + 1 - period;
    let sum: f64 = bars[start..=index].iter().map(|bar| bar.high - bar.low).sum();
    let value = sum / period as f64;
    value.is_finite().then_some(value)
}

/// Close-to-close simple returns; a non-positive previous close yields 0.
pub fn simple_returns(bars: &[Bar]) -> Vec<f64> {
    bars.windows(2)
        .map(|window| {
            let prev = window[0].close;
            if prev > 0.0 {
                window[1].close / prev - 1.0
            } else {
                0.0
            }
        })
        .collect()
}

/// Percent change of the last close versus the previous one.
pub fn last_percent_change(bars: &[Bar]) -> Option<f64> {
    let n = bars.len();
    if n < 2 || bars[n - 2].close <= 0.0 {
        return None;
    }
    Some((bars[n - 1].close / bars[n - 2].close - 1.0) * 100.0)
}
