/*!
Data processing and IO functions
*/
use crate::*;
use itertools::Itertools;
use num::{Float, NumCast};
use serde::{Deserialize, Serialize};
use ta::indicators::SimpleMovingAverage;
use ta::{Close, High, Low, Next, Open};
use tch::Tensor;

pub mod fake;
pub mod history;
pub mod scale;

/// A daily price bar for a stock
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Bar<F = CpuFloat> {
    /// The opening price of this bar
    pub o: F,
    /// The high price of this bar
    pub h: F,
    /// The low price of this bar
    pub l: F,
    /// The closing price of this bar
    pub c: F,
}

impl Bar {
    /// The number of fields a bar feeds into a neural network
    pub const NN_FIELDS: usize = 4; // (o, h, l, c)
}

impl<F> Bar<F>
where
    F: Copy + NumCast,
{
    /// Push a bar's data points to an input vector. Guaranteed to write `NN_FIELDS` data points
    pub fn push_bar(&self, input: &mut Vec<f32>) {
        input.push(NumCast::from(self.o).unwrap_or(0.0));
        input.push(NumCast::from(self.h).unwrap_or(0.0));
        input.push(NumCast::from(self.l).unwrap_or(0.0));
        input.push(NumCast::from(self.c).unwrap_or(0.0));
    }
}

impl<F: Float> Bar<F> {
    /// Apply a function to every field of this bar
    #[inline]
    pub fn map(&self, mut f: impl FnMut(F) -> F) -> Bar<F> {
        Bar {
            o: f(self.o),
            h: f(self.h),
            l: f(self.l),
            c: f(self.c),
        }
    }
    /// Whether every field of this bar is finite
    #[inline]
    pub fn is_finite(&self) -> bool {
        self.o.is_finite() && self.h.is_finite() && self.l.is_finite() && self.c.is_finite()
    }
    /// Iterate over the fields of this bar
    #[inline]
    pub fn fields(&self) -> impl Iterator<Item = F> {
        [self.o, self.h, self.l, self.c].into_iter()
    }
}

impl<F> Open for Bar<F>
where
    F: Copy + Into<f64>,
{
    #[inline]
    fn open(&self) -> f64 {
        self.o.into()
    }
}

impl<F> High for Bar<F>
where
    F: Copy + Into<f64>,
{
    #[inline]
    fn high(&self) -> f64 {
        self.h.into()
    }
}

impl<F> Low for Bar<F>
where
    F: Copy + Into<f64>,
{
    #[inline]
    fn low(&self) -> f64 {
        self.l.into()
    }
}

impl<F> Close for Bar<F>
where
    F: Copy + Into<f64>,
{
    #[inline]
    fn close(&self) -> f64 {
        self.c.into()
    }
}

/// Smooth each column of a series of bars with a simple moving average over `window` bars.
///
/// The first `window - 1` bars, whose average would be over a partial window, are dropped.
pub fn moving_average(bars: &[Bar], window: usize) -> Result<Vec<Bar>> {
    if window == 0 {
        return Err(Error::Config("moving average window must be positive".into()));
    }
    let window_u32 = u32::try_from(window)
        .map_err(|_| Error::Config(format!("moving average window {} is too large", window)))?;
    let new_sma = || SimpleMovingAverage::new(window_u32).map_err(|err| Error::Config(err.to_string()));
    let (mut o, mut h, mut l, mut c) = (new_sma()?, new_sma()?, new_sma()?, new_sma()?);
    let smoothed = bars
        .iter()
        .map(|bar| Bar {
            o: o.next(bar.open()),
            h: h.next(bar.high()),
            l: l.next(bar.low()),
            c: c.next(bar.close()),
        })
        .skip(window - 1)
        .collect();
    Ok(smoothed)
}

/// Compute the arithmetic return of each column from one bar to the next.
///
/// The result is one bar shorter than the input. Bars with any non-finite return (e.g. after a zero price)
/// are dropped.
pub fn pct_change(bars: &[Bar]) -> Vec<Bar> {
    bars.iter()
        .tuple_windows()
        .map(|(prev, curr)| Bar {
            o: curr.o / prev.o - 1.0,
            h: curr.h / prev.h - 1.0,
            l: curr.l / prev.l - 1.0,
            c: curr.c / prev.c - 1.0,
        })
        .filter(Bar::is_finite)
        .collect()
}

/// The stateless transforms applied to raw prices before scaling
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Pipeline {
    /// The moving average window applied before taking returns
    pub moving_average: usize,
}

impl Default for Pipeline {
    fn default() -> Pipeline {
        Pipeline { moving_average: 10 }
    }
}

impl Pipeline {
    /// Smooth raw prices and convert them to returns
    pub fn prepare(&self, bars: &[Bar]) -> Result<Vec<Bar>> {
        let smoothed = moving_average(bars, self.moving_average)?;
        Ok(pct_change(&smoothed))
    }
}

/// A chronological train/validation/test split of a series
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Split {
    /// The training range
    pub train: std::ops::Range<usize>,
    /// The validation range
    pub val: std::ops::Range<usize>,
    /// The test range
    pub test: std::ops::Range<usize>,
}

impl Split {
    /// Split `len` samples in time order, holding out the trailing `val_fraction + test_fraction` of the series
    pub fn chronological(len: usize, val_fraction: f64, test_fraction: f64) -> Result<Split> {
        let valid = |f: f64| (0.0..1.0).contains(&f);
        if !valid(val_fraction) || !valid(test_fraction) || val_fraction + test_fraction >= 1.0 {
            return Err(Error::Config(format!(
                "invalid split fractions: validation {}, test {}",
                val_fraction, test_fraction
            )));
        }
        let test_len = (test_fraction * len as f64) as usize;
        let held_out = ((val_fraction + test_fraction) * len as f64) as usize;
        let val_start = len - held_out;
        let test_start = len - test_len;
        Ok(Split {
            train: 0..val_start,
            val: val_start..test_start,
            test: test_start..len,
        })
    }
}

/// A set of fixed-length windows of bars, each labelled with the closing value of the bar that follows it
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    /// The window length
    pub seq_len: usize,
    /// Flattened windows, `seq_len * Bar::NN_FIELDS` values per window
    pub inputs: Vec<f32>,
    /// The target for each window. Empty for inference-only datasets
    pub targets: Vec<f32>,
}

impl Dataset {
    /// Window a series of (normalized) bars: window `i` covers `bars[i..i + seq_len]` and is labelled with the
    /// close of `bars[i + seq_len]`
    pub fn from_bars(bars: &[Bar], seq_len: usize) -> Dataset {
        let windows = bars.len().saturating_sub(seq_len);
        let mut inputs = Vec::with_capacity(windows * seq_len * Bar::NN_FIELDS);
        let mut targets = Vec::with_capacity(windows);
        for end in seq_len..bars.len() {
            for bar in &bars[end - seq_len..end] {
                bar.push_bar(&mut inputs);
            }
            targets.push(bars[end].c as f32);
        }
        Dataset {
            seq_len,
            inputs,
            targets,
        }
    }
    /// Window a series of (normalized) bars for inference, including the most recent window, which has no
    /// label yet
    pub fn inputs_only(bars: &[Bar], seq_len: usize) -> Dataset {
        let mut inputs = Vec::new();
        if seq_len > 0 {
            for end in seq_len..=bars.len() {
                for bar in &bars[end - seq_len..end] {
                    bar.push_bar(&mut inputs);
                }
            }
        }
        Dataset {
            seq_len,
            inputs,
            targets: Vec::new(),
        }
    }
    /// The number of windows in this dataset
    pub fn len(&self) -> usize {
        let window = self.seq_len * Bar::NN_FIELDS;
        if window == 0 {
            0
        } else {
            self.inputs.len() / window
        }
    }
    /// Whether this dataset has no windows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Whether this dataset carries a target for every window
    pub fn is_labelled(&self) -> bool {
        self.targets.len() == self.len()
    }
    /// Package the given windows into an input tensor of shape `(batch, seq_len, 4)`
    pub fn batch_inputs(&self, indices: &[usize]) -> Tensor {
        let window = self.seq_len * Bar::NN_FIELDS;
        let mut input = Vec::with_capacity(indices.len() * window);
        for &i in indices {
            input.extend_from_slice(&self.inputs[i * window..(i + 1) * window]);
        }
        Tensor::from_slice(&input[..]).view([
            indices.len() as i64,
            self.seq_len as i64,
            Bar::NN_FIELDS as i64,
        ])
    }
    /// Package the given windows and their targets into tensors of shape `(batch, seq_len, 4)` and
    /// `(batch, 1)`
    pub fn batch(&self, indices: &[usize]) -> (Tensor, Tensor) {
        let targets: Vec<f32> = indices.iter().map(|&i| self.targets[i]).collect();
        let output = Tensor::from_slice(&targets[..]).view([indices.len() as i64, 1]);
        (self.batch_inputs(indices), output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(p: f64) -> Bar {
        Bar {
            o: p,
            h: p + 1.0,
            l: p - 1.0,
            c: p + 0.5,
        }
    }

    #[test]
    fn moving_average_drops_partial_windows() {
        let bars: Vec<Bar> = (1..=5).map(|p| bar(p as f64 * 10.0)).collect();
        let smoothed = moving_average(&bars, 3).unwrap();
        assert_eq!(smoothed.len(), 3);
        assert!((smoothed[0].o - 20.0).abs() < 1e-12);
        assert!((smoothed[2].c - 40.5).abs() < 1e-12);
        assert!(moving_average(&bars, 0).is_err());
    }

    #[test]
    fn pct_change_computes_returns_and_drops_non_finite() {
        let bars = [bar(10.0), bar(11.0), bar(0.0), bar(5.0)];
        let returns = pct_change(&bars[..2]);
        assert_eq!(returns.len(), 1);
        assert!((returns[0].o - 0.1).abs() < 1e-12);
        assert!((returns[0].h - 1.0 / 11.0).abs() < 1e-12);
        // 0 -> 5 divides by zero on the open and is dropped
        let returns = pct_change(&bars);
        assert_eq!(returns.len(), 2);
        assert!(returns.iter().all(Bar::is_finite));
    }

    #[test]
    fn pipeline_shortens_by_window() {
        let bars: Vec<Bar> = (1..=30).map(|p| bar(100.0 + p as f64)).collect();
        let prepared = Pipeline::default().prepare(&bars).unwrap();
        assert_eq!(prepared.len(), 30 - 9 - 1);
    }

    #[test]
    fn chronological_split_matches_trailing_fractions() {
        let split = Split::chronological(100, 0.1, 0.1).unwrap();
        assert_eq!(split.train, 0..80);
        assert_eq!(split.val, 80..90);
        assert_eq!(split.test, 90..100);
        assert!(Split::chronological(100, 0.6, 0.5).is_err());
        assert!(Split::chronological(100, -0.1, 0.1).is_err());
    }

    #[test]
    fn windows_never_look_ahead() {
        let bars: Vec<Bar> = (0..6).map(|p| bar(p as f64)).collect();
        let data = Dataset::from_bars(&bars, 4);
        assert_eq!(data.len(), 2);
        assert!(data.is_labelled());
        // The first window ends at bar 3 and is labelled with bar 4's close
        assert_eq!(data.targets[0], 4.5);
        assert_eq!(&data.inputs[12..16], &[3.0, 4.0, 2.0, 3.5]);
        let (x, y) = data.batch(&[1, 0]);
        assert_eq!(x.size3().unwrap(), (2, 4, 4));
        assert_eq!(y.size2().unwrap(), (2, 1));
        assert_eq!(y.double_value(&[0, 0]), 5.5);
    }

    #[test]
    fn inference_windows_include_the_latest() {
        let bars: Vec<Bar> = (0..6).map(|p| bar(p as f64)).collect();
        let data = Dataset::inputs_only(&bars, 4);
        assert_eq!(data.len(), 3);
        assert!(!data.is_labelled());
        assert!(Dataset::inputs_only(&bars[..3], 4).is_empty());
    }
}
