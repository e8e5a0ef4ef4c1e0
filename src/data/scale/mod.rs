/*!
Input data scaling
*/
use super::Bar;
use crate::{CpuFloat, Error, Result};
use num::{Float, NumCast};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A min-max scaler mapping `[min, max]` onto `[0, 1]`.
///
/// A scaler is fitted once, on the training slice of a series, and must then be reused unchanged for every
/// later slice and at inference time. Refitting on other data would normalize against statistics the model
/// never saw.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler<F = CpuFloat> {
    /// The smallest value seen while fitting
    pub min: F,
    /// The largest value seen while fitting
    pub max: F,
}

impl<F> MinMaxScaler<F>
where
    F: Copy + Float + Debug,
{
    /// Create a scaler from explicit bounds, rejecting empty or non-finite ranges
    pub fn new(min: F, max: F) -> Result<MinMaxScaler<F>> {
        if !min.is_finite() || !max.is_finite() {
            return Err(Error::NonFinite("normalization range"));
        }
        if max <= min {
            return Err(Error::DegenerateRange(NumCast::from(min).unwrap_or(f64::NAN)));
        }
        Ok(MinMaxScaler { min, max })
    }
    /// Fit a scaler to the smallest and largest of a set of values
    pub fn fit(values: impl IntoIterator<Item = F>) -> Result<MinMaxScaler<F>> {
        let mut bounds: Option<(F, F)> = None;
        for value in values {
            if !value.is_finite() {
                return Err(Error::NonFinite("normalization input"));
            }
            bounds = Some(match bounds {
                Some((min, max)) => (min.min(value), max.max(value)),
                None => (value, value),
            });
        }
        let (min, max) = bounds.ok_or_else(|| {
            Error::InsufficientData("cannot fit a normalization range to no values".into())
        })?;
        MinMaxScaler::new(min, max)
    }
    /// Fit a single range over every price field of a set of bars
    pub fn fit_bars<'a>(bars: impl IntoIterator<Item = &'a Bar<F>>) -> Result<MinMaxScaler<F>>
    where
        F: 'a,
    {
        MinMaxScaler::fit(bars.into_iter().flat_map(Bar::fields))
    }
    /// The width of the fitted range
    #[inline]
    pub fn range(&self) -> F {
        self.max - self.min
    }
    /// Scale a value into the fitted range
    #[inline]
    pub fn scale(&self, val: F) -> F {
        (val - self.min) / self.range()
    }
    /// Invert `scale`
    #[inline]
    pub fn unscale(&self, val: F) -> F {
        val * self.range() + self.min
    }
    /// Scale every field of a bar
    #[inline]
    pub fn scale_bar(&self, bar: &Bar<F>) -> Bar<F> {
        bar.map(|val| self.scale(val))
    }
    /// Scale every bar in a series
    pub fn scale_bars(&self, bars: &[Bar<F>]) -> Vec<Bar<F>> {
        bars.iter().map(|bar| self.scale_bar(bar)).collect()
    }
}
