/*!
Turning successive predictions into trade signals, and running a model over a price history
*/
use crate::bundle::LoadedModel;
use crate::data::scale::MinMaxScaler;
use crate::data::{Bar, Dataset, Pipeline};
use crate::model::StockTransformer;
use crate::{Error, Result};
use std::fmt::{self, Display, Formatter};
use std::io::Write;
use tracing::debug;

/// A trade action
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(i8)]
pub enum Signal {
    /// Open a long position
    Buy = 1,
    /// Close the long position
    Sell = -1,
    /// Do nothing
    Hold = 0,
}

impl Signal {
    /// The integer code of this signal: `1`, `-1` or `0`
    #[inline]
    pub fn code(self) -> i8 {
        self as i8
    }
}

impl Display for Signal {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The position held while trading a single stock
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Position {
    /// No shares held
    Flat,
    /// One unit held
    Long,
}

/// A state machine mapping a stream of predictions to signals.
///
/// A prediction above the previous one by more than `min_change` buys when flat, and one at least
/// `min_change` below it sells when long. The first prediction is compared against zero.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SignalGenerator {
    /// The smallest move between predictions that is acted on
    pub min_change: f32,
    /// The current position
    pub position: Position,
    /// The last prediction seen
    pub previous: f32,
}

impl Default for SignalGenerator {
    fn default() -> SignalGenerator {
        SignalGenerator::new(0.0)
    }
}

impl SignalGenerator {
    /// Create a flat signal generator
    pub fn new(min_change: f32) -> SignalGenerator {
        SignalGenerator {
            min_change,
            position: Position::Flat,
            previous: 0.0,
        }
    }

    /// Feed a prediction, getting the action to take
    pub fn next(&mut self, prediction: f32) -> Signal {
        let change = prediction - self.previous;
        self.previous = prediction;
        match self.position {
            Position::Flat if change > self.min_change => {
                self.position = Position::Long;
                Signal::Buy
            }
            Position::Long if change <= -self.min_change => {
                self.position = Position::Flat;
                Signal::Sell
            }
            _ => Signal::Hold,
        }
    }
}

/// The outcome of one window of a backtest
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Step {
    /// The position in the prepared series of the last step of the window
    pub index: usize,
    /// The model's (normalized) prediction for the following step
    pub prediction: f32,
    /// The action taken on the prediction
    pub signal: Signal,
}

/// Runs a model over price histories.
///
/// Every history is normalized with the same fixed scaler, the one fitted at training time, so a
/// prediction never depends on prices after its window.
#[derive(Debug, Copy, Clone)]
pub struct Backtest<'a> {
    /// The model making predictions
    pub model: &'a StockTransformer,
    /// The scaler fitted to the model's training data
    pub scaler: MinMaxScaler,
    /// The preprocessing applied to raw prices
    pub pipeline: Pipeline,
    /// The signal threshold
    pub min_change: f32,
    /// The number of windows predicted at once
    pub batch_size: usize,
}

impl<'a> Backtest<'a> {
    /// Create a backtest with no signal threshold
    pub fn new(model: &'a StockTransformer, scaler: MinMaxScaler, pipeline: Pipeline) -> Backtest<'a> {
        Backtest {
            model,
            scaler,
            pipeline,
            min_change: 0.0,
            batch_size: 256,
        }
    }

    /// Create a backtest from a loaded bundle, which must carry a scaler. The bundled pipeline is used
    pub fn from_bundle(loaded: &'a LoadedModel) -> Result<Backtest<'a>> {
        let scaler = loaded
            .header
            .scaler
            .ok_or_else(|| Error::Bundle("bundle has no input scaler".into()))?;
        Ok(Backtest::new(&loaded.model, scaler, loaded.header.pipeline))
    }

    /// Preprocess and normalize raw prices
    pub fn prepare(&self, bars: &[Bar]) -> Result<Vec<Bar>> {
        let prepared = self.pipeline.prepare(bars)?;
        Ok(self.scaler.scale_bars(&prepared))
    }

    fn predict_windows(&self, windows: &Dataset) -> Result<Vec<f32>> {
        let device = self.model.device();
        let indices: Vec<usize> = (0..windows.len()).collect();
        let mut predictions = Vec::with_capacity(windows.len());
        for batch in indices.chunks(self.batch_size.max(1)) {
            predictions.extend(self.model.predict(&windows.batch_inputs(batch).to_device(device))?);
        }
        Ok(predictions)
    }

    /// Predict and signal on every window of a price history, oldest first
    pub fn run(&self, bars: &[Bar]) -> Result<Vec<Step>> {
        let seq_len = self.model.desc.seq_len;
        let windows = Dataset::inputs_only(&self.prepare(bars)?, seq_len);
        if windows.is_empty() {
            return Err(Error::InsufficientData(format!(
                "{} bars do not fill a window of {} prepared steps",
                bars.len(),
                seq_len
            )));
        }
        let predictions = self.predict_windows(&windows)?;
        let mut generator = SignalGenerator::new(self.min_change);
        let steps = predictions
            .into_iter()
            .enumerate()
            .map(|(i, prediction)| Step {
                index: i + seq_len - 1,
                prediction,
                signal: generator.next(prediction),
            })
            .collect();
        Ok(steps)
    }

    /// Trade through `upcoming` one bar at a time, as if each bar arrived after the day's decision.
    ///
    /// Before each bar but the last, the model predicts from the window ending at the newest prepared row of
    /// `history` plus the upcoming bars seen so far. The final bar gives no action, since there is no later day to
    /// act on it.
    pub fn trade(&self, history: &[Bar], upcoming: &[Bar]) -> Result<Vec<Step>> {
        let seq_len = self.model.desc.seq_len;
        let days = upcoming.len().saturating_sub(1);
        let mut windows = Dataset::inputs_only(&[], seq_len);
        let mut ends = Vec::with_capacity(days);
        let mut seen = history.to_vec();
        for &bar in &upcoming[..days] {
            let prepared = self.prepare(&seen)?;
            if prepared.len() < seq_len {
                return Err(Error::InsufficientData(format!(
                    "{} bars of history do not fill a window of {} prepared steps",
                    seen.len(),
                    seq_len
                )));
            }
            let latest = Dataset::inputs_only(&prepared[prepared.len() - seq_len..], seq_len);
            windows.inputs.extend(latest.inputs);
            ends.push(prepared.len() - 1);
            seen.push(bar);
        }
        debug!("Trading {} days on {} bars of history", days, history.len());
        let predictions = self.predict_windows(&windows)?;
        let mut generator = SignalGenerator::new(self.min_change);
        let steps = ends
            .into_iter()
            .zip(predictions)
            .map(|(index, prediction)| Step {
                index,
                prediction,
                signal: generator.next(prediction),
            })
            .collect();
        Ok(steps)
    }
}

/// Write signals one per line, as `1`, `-1` or `0`
pub fn write_signals<W, I>(mut wtr: W, signals: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = Signal>,
{
    for signal in signals {
        writeln!(wtr, "{}", signal)?;
    }
    wtr.flush()?;
    Ok(())
}
