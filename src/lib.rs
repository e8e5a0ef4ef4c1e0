/*!
A transformer for predicting next-day stock price direction, written in Rust using PyTorch bindings.

Windows of normalized OHLC percentage changes are fed through a learned time embedding and a stack of
hand-assembled self-attention encoder blocks, giving a single regression output per window: the predicted
normalized closing price change. Successive predictions are turned into buy/sell/hold signals.

Designed to be run on daily price history in CSV form (`open,high,low,close`, no header), but also to be
modular, extensible and easily modifiable.
*/
#![forbid(missing_docs)]

pub mod bundle;
pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod signal;
pub mod train;
pub mod util;

pub use error::{Error, Result};

/// The floating point type to be used for CPU calculations
pub type CpuFloat = f64;

/// The floating point type to be used for GPU calculations
pub type GpuFloat = f32;
