/*!
Errors produced by `stockformer`
*/
use thiserror::Error;

/// An error building, loading, training or evaluating a model
#[derive(Debug, Error)]
pub enum Error {
    /// The model or run configuration is invalid
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A tensor did not have the shape a component expects
    #[error("shape mismatch: expected {expected}, got {actual:?}")]
    Shape {
        /// A description of the expected shape
        expected: String,
        /// The shape actually received
        actual: Vec<i64>,
    },
    /// A min-max normalization range is empty, which would divide by zero
    #[error("degenerate normalization range: min = max = {0}")]
    DegenerateRange(f64),
    /// A NaN or infinite value was found where finite data is required
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
    /// There is not enough data to perform an operation
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    /// A model bundle was built for a different window length than the one in use
    #[error("bundle expects windows of {bundle} steps, but {runtime} were requested")]
    SeqLenMismatch {
        /// The window length recorded in the bundle
        bundle: usize,
        /// The window length requested at runtime
        runtime: usize,
    },
    /// A model bundle is malformed
    #[error("invalid model bundle: {0}")]
    Bundle(String),
    /// Input price data is malformed
    #[error("invalid price data: {0}")]
    Data(String),
    /// An error from libtorch
    #[error(transparent)]
    Torch(#[from] tch::TchError),
    /// An IO error
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A CSV error
    #[error(transparent)]
    Csv(#[from] csv::Error),
    /// A JSON (de)serialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// A TOML parse error
    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),
    /// A TOML serialization error
    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

/// The result type used throughout `stockformer`
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Build a shape error from a tensor's actual dimensions
    pub fn shape(expected: impl Into<String>, actual: Vec<i64>) -> Error {
        Error::Shape {
            expected: expected.into(),
            actual,
        }
    }
}
