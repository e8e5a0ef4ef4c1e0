/*!
The training driver: minibatch Adam over shuffled windows, validation each epoch and best-model checkpointing
*/
use crate::bundle;
use crate::data::scale::MinMaxScaler;
use crate::data::{Dataset, Pipeline};
use crate::model::StockTransformer;
use crate::{Error, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::PathBuf;
use tch::nn::{self, OptimizerConfig, VarStore};
use tracing::{debug, info};

/// The smallest target magnitude used as a denominator in the mean absolute percentage error
pub const MAPE_EPSILON: f64 = 1e-7;

/// Hyperparameters of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// The number of windows in each minibatch
    pub batch_size: usize,
    /// The number of passes over the training set
    pub epochs: usize,
    /// The Adam learning rate
    pub learning_rate: f64,
    /// The seed for shuffling and for libtorch's RNG
    pub seed: u64,
    /// Where to save a bundle of the best model so far, if anywhere
    pub checkpoint_path: Option<PathBuf>,
    /// Whether to draw progress bars
    pub progress: bool,
}

impl Default for TrainingConfig {
    fn default() -> TrainingConfig {
        TrainingConfig {
            batch_size: 32,
            epochs: 50,
            learning_rate: 1e-3,
            seed: 42,
            checkpoint_path: None,
            progress: true,
        }
    }
}

impl TrainingConfig {
    /// Check that these hyperparameters describe a runnable training loop
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if self.epochs == 0 {
            return Err(Error::Config("epochs must be positive".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Regression metrics over a dataset
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Mean squared error
    pub loss: f64,
    /// Mean absolute error
    pub mae: f64,
    /// Mean absolute percentage error, in percent
    pub mape: f64,
}

impl Metrics {
    /// Compare predictions against targets. Returns `None` if there are no pairs
    pub fn from_predictions(predictions: &[f32], targets: &[f32]) -> Option<Metrics> {
        let n = predictions.len().min(targets.len());
        if n == 0 {
            return None;
        }
        let (mut se, mut ae, mut ape) = (0.0, 0.0, 0.0);
        for (&yhat, &y) in predictions.iter().zip(targets) {
            let (yhat, y) = (yhat as f64, y as f64);
            let err = (y - yhat).abs();
            se += err * err;
            ae += err;
            ape += err / y.abs().max(MAPE_EPSILON);
        }
        let n = n as f64;
        Some(Metrics {
            loss: se / n,
            mae: ae / n,
            mape: 100.0 * ape / n,
        })
    }
}

/// What happened during one training epoch
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// The epoch, counting from zero
    pub epoch: usize,
    /// The mean minibatch loss over the epoch, with dropout active
    pub train_loss: f64,
    /// Metrics on the validation set after the epoch, if there is one
    pub val: Option<Metrics>,
}

impl EpochMetrics {
    /// The loss used to pick the best epoch: validation loss if available, otherwise training loss
    pub fn score(&self) -> f64 {
        self.val.map_or(self.train_loss, |val| val.loss)
    }
}

/// An in-memory snapshot of a `VarStore`
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// The epoch the snapshot was taken after
    pub epoch: usize,
    /// The score of the model at that epoch
    pub score: f64,
    weights: Vec<u8>,
}

impl Checkpoint {
    /// Snapshot the variables of `vs`
    pub fn capture(vs: &VarStore, epoch: usize, score: f64) -> Result<Checkpoint> {
        let mut weights = Vec::new();
        vs.save_to_stream(&mut weights)?;
        Ok(Checkpoint {
            epoch,
            score,
            weights,
        })
    }
    /// Copy the snapshotted values back into the variables of `vs`
    pub fn restore(&self, vs: &mut VarStore) -> Result<()> {
        vs.load_from_stream(Cursor::new(&self.weights[..]))?;
        Ok(())
    }
}

/// Trains a `StockTransformer`
#[derive(Debug, Clone)]
pub struct Trainer {
    /// The hyperparameters of this trainer
    pub config: TrainingConfig,
    /// The scaler the training data was normalized with, recorded in checkpoint bundles
    pub scaler: Option<MinMaxScaler>,
    /// The preprocessing the training data went through, recorded in checkpoint bundles
    pub pipeline: Pipeline,
}

fn check_dataset(model: &StockTransformer, data: &Dataset, what: &str) -> Result<()> {
    if data.seq_len != model.desc.seq_len {
        return Err(Error::Config(format!(
            "{} windows have {} steps but the model takes {}",
            what, data.seq_len, model.desc.seq_len
        )));
    }
    if !data.is_labelled() {
        return Err(Error::Data(format!("{} set has no targets", what)));
    }
    Ok(())
}

impl Trainer {
    /// Create a trainer
    pub fn new(config: TrainingConfig, scaler: Option<MinMaxScaler>, pipeline: Pipeline) -> Trainer {
        Trainer {
            config,
            scaler,
            pipeline,
        }
    }

    fn progress_bar(&self, len: usize, template: &str) -> ProgressBar {
        if !self.config.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        bar.set_style(ProgressStyle::default_bar().template(template));
        bar
    }

    /// Train `model`, whose variables live in `vs`, and leave `vs` holding the best epoch's weights.
    ///
    /// Each epoch visits the training windows in a freshly shuffled order. After every epoch the model is
    /// scored on `val` (or, if `val` is empty, by its training loss), and the best scoring weights are kept,
    /// and saved as a bundle if a checkpoint path is configured.
    pub fn fit(
        &self,
        model: &StockTransformer,
        vs: &mut VarStore,
        train: &Dataset,
        val: &Dataset,
    ) -> Result<Vec<EpochMetrics>> {
        self.config.validate()?;
        check_dataset(model, train, "training")?;
        check_dataset(model, val, "validation")?;
        if train.is_empty() {
            return Err(Error::InsufficientData("no training windows".into()));
        }

        tch::manual_seed(self.config.seed as i64);
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut opt = nn::Adam::default().build(vs, self.config.learning_rate)?;
        let device = vs.device();

        info!(
            "Training on {} windows, validating on {}, for {} epochs",
            train.len(),
            val.len(),
            self.config.epochs
        );
        let epochs_progress = self.progress_bar(self.config.epochs, "Epochs: {wide_bar} {pos}/{len} {msg}");
        let mut indices: Vec<usize> = (0..train.len()).collect();
        let mut history = Vec::with_capacity(self.config.epochs);
        let mut best: Option<Checkpoint> = None;

        for epoch in 0..self.config.epochs {
            indices.shuffle(&mut rng);

            let batches = (indices.len() + self.config.batch_size - 1) / self.config.batch_size;
            let data_progress = self.progress_bar(batches, "[{msg:<15}] {wide_bar} {pos:>7}/{len:7}");
            data_progress.set_message("no loss");
            let mut sum_loss = 0.0;
            for batch in indices.chunks(self.config.batch_size) {
                let (xs, ys) = train.batch(batch);
                let loss = model.loss(&xs.to_device(device), &ys.to_device(device), true)?;
                let value = loss.double_value(&[]);
                if !value.is_finite() {
                    data_progress.finish_and_clear();
                    return Err(Error::NonFinite("training loss"));
                }
                opt.backward_step(&loss);
                sum_loss += value;
                data_progress.inc(1);
                data_progress.set_message(&format!("loss = {:.5}", value));
            }
            data_progress.finish_and_clear();

            let val_metrics = if val.is_empty() {
                None
            } else {
                Some(self.evaluate(model, val)?)
            };
            let metrics = EpochMetrics {
                epoch,
                train_loss: sum_loss / batches as f64,
                val: val_metrics,
            };
            match metrics.val {
                Some(val) => info!(
                    "Epoch {}: training loss = {:.6}, validation loss = {:.6}, mae = {:.6}, mape = {:.2}%",
                    epoch, metrics.train_loss, val.loss, val.mae, val.mape
                ),
                None => info!("Epoch {}: training loss = {:.6}", epoch, metrics.train_loss),
            }

            let score = metrics.score();
            if best.as_ref().map_or(true, |best| score < best.score) {
                debug!("New best model at epoch {} (score {:.6})", epoch, score);
                best = Some(Checkpoint::capture(vs, epoch, score)?);
                if let Some(path) = &self.config.checkpoint_path {
                    bundle::save(path, &model.desc, self.scaler.as_ref(), self.pipeline, vs)?;
                }
            }

            history.push(metrics);
            epochs_progress.inc(1);
            epochs_progress.set_message(&format!("best = {:.5}", best.as_ref().map_or(score, |b| b.score)));
        }
        epochs_progress.finish_and_clear();

        if let Some(best) = &best {
            best.restore(vs)?;
            info!("Restored best model from epoch {} (score {:.6})", best.epoch, best.score);
        }
        Ok(history)
    }

    /// Score `model` on every window of `data` in inference mode
    pub fn evaluate(&self, model: &StockTransformer, data: &Dataset) -> Result<Metrics> {
        check_dataset(model, data, "evaluation")?;
        let batch_size = self.config.batch_size.max(1);
        let indices: Vec<usize> = (0..data.len()).collect();
        let mut predictions = Vec::with_capacity(data.len());
        for batch in indices.chunks(batch_size) {
            let xs = data.batch_inputs(batch).to_device(model.device());
            predictions.extend(model.predict(&xs)?);
        }
        Metrics::from_predictions(&predictions, &data.targets)
            .ok_or_else(|| Error::InsufficientData("no windows to evaluate".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fake::BarRandomWalk;
    use crate::data::{Bar, Pipeline, Split};
    use crate::model::{EncoderDesc, StockTransformerDesc};
    use tch::Device;

    fn desc() -> StockTransformerDesc {
        StockTransformerDesc {
            seq_len: 8,
            encoders: vec![EncoderDesc {
                d_k: 8,
                d_v: 8,
                n_heads: 2,
                ff_dim: 8,
                dropout: 0.1,
            }],
            head_hidden: 4,
            ..Default::default()
        }
    }

    fn config(epochs: usize) -> TrainingConfig {
        TrainingConfig {
            batch_size: 16,
            epochs,
            progress: false,
            ..Default::default()
        }
    }

    const PIPELINE: Pipeline = Pipeline { moving_average: 5 };

    fn datasets(seq_len: usize) -> (MinMaxScaler, Dataset, Dataset) {
        let walk = BarRandomWalk::new(StdRng::seed_from_u64(17), 50.0, 0.0005, 0.02).unwrap();
        let bars: Vec<Bar> = walk.take(260).collect();
        let prepared = PIPELINE.prepare(&bars).unwrap();
        let split = Split::chronological(prepared.len(), 0.2, 0.0).unwrap();
        let train = &prepared[split.train];
        let scaler = MinMaxScaler::fit_bars(train).unwrap();
        let val = scaler.scale_bars(&prepared[split.val]);
        (
            scaler,
            Dataset::from_bars(&scaler.scale_bars(train), seq_len),
            Dataset::from_bars(&val, seq_len),
        )
    }

    #[test]
    fn metrics_match_hand_computation() {
        let metrics = Metrics::from_predictions(&[1.0, 2.0, 0.5], &[2.0, 2.0, 0.0]).unwrap();
        assert!((metrics.loss - 1.25 / 3.0).abs() < 1e-9);
        assert!((metrics.mae - 0.5).abs() < 1e-9);
        // The zero target is divided by the epsilon instead
        let expected_mape = 100.0 * (0.5 + 0.0 + 0.5 / MAPE_EPSILON) / 3.0;
        assert!((metrics.mape - expected_mape).abs() / expected_mape < 1e-9);
        assert!(Metrics::from_predictions(&[], &[]).is_none());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut zero_batch = config(1);
        zero_batch.batch_size = 0;
        let mut zero_epochs = config(1);
        zero_epochs.epochs = 0;
        let mut bad_rate = config(1);
        bad_rate.learning_rate = f64::NAN;
        for config in &[zero_batch, zero_epochs, bad_rate] {
            assert!(matches!(config.validate(), Err(Error::Config(_))));
        }
        assert!(config(1).validate().is_ok());
    }

    #[test]
    fn short_run_keeps_the_best_epoch() {
        let (scaler, train, val) = datasets(8);
        let mut vs = VarStore::new(Device::Cpu);
        let model = desc().build(&vs.root()).unwrap();
        let trainer = Trainer::new(config(4), Some(scaler), PIPELINE);
        let history = trainer.fit(&model, &mut vs, &train, &val).unwrap();

        assert_eq!(history.len(), 4);
        for (i, epoch) in history.iter().enumerate() {
            assert_eq!(epoch.epoch, i);
            assert!(epoch.train_loss.is_finite());
            assert!(epoch.val.unwrap().loss.is_finite());
        }
        let best = history.iter().map(EpochMetrics::score).fold(f64::INFINITY, f64::min);
        let restored = trainer.evaluate(&model, &val).unwrap();
        assert!(
            (restored.loss - best).abs() <= 1e-6 * best.max(1.0),
            "{} != {}",
            restored.loss,
            best
        );
    }

    #[test]
    fn training_is_reproducible() {
        let (_, train, val) = datasets(8);
        let run = || {
            tch::manual_seed(0);
            let mut vs = VarStore::new(Device::Cpu);
            let model = desc().build(&vs.root()).unwrap();
            Trainer::new(config(2), None, PIPELINE)
                .fit(&model, &mut vs, &train, &val)
                .unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn checkpoints_are_written_as_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best.stkfmr");
        let (scaler, train, val) = datasets(8);
        let mut vs = VarStore::new(Device::Cpu);
        let model = desc().build(&vs.root()).unwrap();
        let mut config = config(2);
        config.checkpoint_path = Some(path.clone());
        Trainer::new(config, Some(scaler), PIPELINE)
            .fit(&model, &mut vs, &train, &val)
            .unwrap();

        let loaded = bundle::load(&path, Device::Cpu).unwrap();
        assert_eq!(loaded.header.model, model.desc);
        assert_eq!(loaded.header.scaler, Some(scaler));
        assert_eq!(loaded.header.pipeline, PIPELINE);
        let xs = val.batch_inputs(&[0, 1, 2]);
        assert_eq!(model.predict(&xs).unwrap(), loaded.model.predict(&xs).unwrap());
    }

    #[test]
    fn bad_data_is_rejected() {
        let (_, train, val) = datasets(8);
        let mut vs = VarStore::new(Device::Cpu);
        let model = desc().build(&vs.root()).unwrap();
        let trainer = Trainer::new(config(1), None, PIPELINE);

        let empty = Dataset::from_bars(&[], 8);
        assert!(matches!(
            trainer.fit(&model, &mut vs, &empty, &val),
            Err(Error::InsufficientData(_))
        ));
        let (_, short_windows, _) = datasets(6);
        assert!(matches!(
            trainer.fit(&model, &mut vs, &short_windows, &val),
            Err(Error::Config(_))
        ));
        let mut poisoned = train.clone();
        poisoned.inputs[3] = f32::NAN;
        let mut config = config(1);
        config.batch_size = poisoned.len();
        assert!(matches!(
            Trainer::new(config, None, PIPELINE).fit(&model, &mut vs, &poisoned, &val),
            Err(Error::NonFinite(_))
        ));
    }
}
