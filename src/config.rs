/*!
Run configuration, stored as TOML
*/
use crate::data::{Pipeline, Split};
use crate::model::StockTransformerDesc;
use crate::train::TrainingConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// How raw price history is turned into datasets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// The moving average window applied before taking returns
    pub moving_average: usize,
    /// The fraction of the series held out for validation
    pub val_fraction: f64,
    /// The fraction of the series held out for testing
    pub test_fraction: f64,
}

impl Default for DataConfig {
    fn default() -> DataConfig {
        DataConfig {
            moving_average: Pipeline::default().moving_average,
            val_fraction: 0.1,
            test_fraction: 0.1,
        }
    }
}

impl DataConfig {
    /// The preprocessing pipeline this configuration describes
    pub fn pipeline(&self) -> Pipeline {
        Pipeline {
            moving_average: self.moving_average,
        }
    }
    /// Split a prepared series of `len` bars
    pub fn split(&self, len: usize) -> Result<Split> {
        Split::chronological(len, self.val_fraction, self.test_fraction)
    }
}

/// How predictions are traded on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// The smallest move between successive predictions that triggers a trade
    pub min_change: f32,
    /// The number of most recent history bars kept when trading through new data
    pub lookback: usize,
}

impl Default for TradingConfig {
    fn default() -> TradingConfig {
        TradingConfig {
            min_change: 0.0,
            lookback: 256,
        }
    }
}

/// Logging options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The default log filter, used unless `RUST_LOG` is set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> LoggingConfig {
        LoggingConfig {
            level: "info".into(),
        }
    }
}

/// The complete configuration of a training or trading run. Missing sections take their defaults
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// The model architecture
    pub model: StockTransformerDesc,
    /// Data preparation
    pub data: DataConfig,
    /// Training hyperparameters
    pub training: TrainingConfig,
    /// Trading options
    pub trading: TradingConfig,
    /// Logging options
    pub logging: LoggingConfig,
}

impl RunConfig {
    /// Parse a configuration from TOML
    pub fn from_toml(content: &str) -> Result<RunConfig> {
        let config: RunConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render this configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        // Going through a `Value` puts plain keys ahead of tables, which the serializer requires
        let value = toml::Value::try_from(self)?;
        Ok(toml::to_string_pretty(&value)?)
    }

    /// Load a configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<RunConfig> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = RunConfig::from_toml(&content)?;
        debug!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Load a configuration from a file if one is given, otherwise use the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<RunConfig> {
        match path {
            Some(path) => RunConfig::load(path),
            None => Ok(RunConfig::default()),
        }
    }

    /// Save this configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Check every section of this configuration
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.training.validate()?;
        if self.data.moving_average == 0 {
            return Err(Error::Config("moving_average must be positive".into()));
        }
        self.data.split(0)?;
        if !(self.trading.min_change.is_finite() && self.trading.min_change >= 0.0) {
            return Err(Error::Config(format!(
                "min_change must be non-negative, got {}",
                self.trading.min_change
            )));
        }
        Ok(())
    }
}
