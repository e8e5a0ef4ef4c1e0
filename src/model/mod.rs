/*!
The stock transformer: a time embedding, a stack of self-attention encoder blocks and a small regression head
*/

use crate::data::Bar;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tch::nn::{self, ConvConfig, Init, Linear, LinearConfig, ModuleT};
use tch::{Device, Kind, Reduction, Tensor};

pub mod attention;
pub mod encoder;
pub mod time2vec;

use attention::AttentionInputs;
use encoder::EncoderBlock;
use time2vec::{Time2Vector, EMBEDDED_CHANNELS, EMBEDDING_WIDTH};

/// Glorot (Xavier) uniform initialization for a `fan_in -> fan_out` map
pub(crate) fn glorot_uniform(fan_in: i64, fan_out: i64) -> Init {
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Init::Uniform {
        lo: -limit,
        up: limit,
    }
}

/// A dense layer with Glorot uniform weights and biases. A bias vector of length `n` counts as `n -> n`
pub(crate) fn glorot_linear(p: &nn::Path, inputs: i64, outputs: i64) -> Linear {
    nn::linear(
        p,
        inputs,
        outputs,
        LinearConfig {
            ws_init: glorot_uniform(inputs, outputs),
            bs_init: Some(glorot_uniform(outputs, outputs)),
            bias: true,
        },
    )
}

/// A dense layer with Glorot uniform weights and zero biases
pub(crate) fn glorot_dense(p: &nn::Path, inputs: i64, outputs: i64) -> Linear {
    nn::linear(
        p,
        inputs,
        outputs,
        LinearConfig {
            ws_init: glorot_uniform(inputs, outputs),
            bs_init: Some(Init::Const(0.)),
            bias: true,
        },
    )
}

/// A kernel size 1 convolution with Glorot uniform weights and zero biases
pub(crate) fn glorot_conv1d(p: &nn::Path, inputs: i64, outputs: i64) -> nn::Conv1D {
    nn::conv1d(
        p,
        inputs,
        outputs,
        1,
        ConvConfig {
            ws_init: glorot_uniform(inputs, outputs),
            bs_init: Init::Const(0.),
            ..Default::default()
        },
    )
}

/// A descriptor for a single encoder block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderDesc {
    /// The dimension of each head's queries and keys
    pub d_k: usize,
    /// The dimension of each head's values
    pub d_v: usize,
    /// The number of attention heads
    pub n_heads: usize,
    /// The hidden width of the feed-forward sublayer
    pub ff_dim: usize,
    /// The dropout rate applied after each sublayer while training
    pub dropout: f64,
}

impl Default for EncoderDesc {
    fn default() -> EncoderDesc {
        EncoderDesc {
            d_k: 256,
            d_v: 256,
            n_heads: 12,
            ff_dim: 256,
            dropout: 0.1,
        }
    }
}

fn check_rate(what: &str, rate: f64) -> Result<()> {
    if (0.0..1.0).contains(&rate) {
        Ok(())
    } else {
        Err(Error::Config(format!("{} must be in [0, 1), got {}", what, rate)))
    }
}

impl EncoderDesc {
    /// Check that this descriptor describes a buildable block
    pub fn validate(&self) -> Result<()> {
        for (name, value) in &[
            ("d_k", self.d_k),
            ("d_v", self.d_v),
            ("n_heads", self.n_heads),
            ("ff_dim", self.ff_dim),
        ] {
            if *value == 0 {
                return Err(Error::Config(format!("encoder {} must be positive", name)));
            }
        }
        check_rate("encoder dropout", self.dropout)
    }
}

/// A descriptor for an instance of the stock transformer. This is everything needed, besides the learned
/// weights, to rebuild a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StockTransformerDesc {
    /// The number of steps in an input window
    pub seq_len: usize,
    /// The number of raw input features per step
    pub features: usize,
    /// The encoder blocks, applied in order
    pub encoders: Vec<EncoderDesc>,
    /// The width of the hidden layer of the regression head
    pub head_hidden: usize,
    /// The dropout rate applied around the hidden layer of the regression head while training
    pub head_dropout: f64,
}

impl Default for StockTransformerDesc {
    fn default() -> StockTransformerDesc {
        StockTransformerDesc {
            seq_len: 128,
            features: Bar::NN_FIELDS,
            encoders: vec![EncoderDesc::default(); 3],
            head_hidden: 64,
            head_dropout: 0.1,
        }
    }
}

impl StockTransformerDesc {
    /// The feature width inside the encoder stack: raw features plus the time embedding
    pub fn model_width(&self) -> usize {
        self.features + EMBEDDING_WIDTH as usize
    }
    /// Check that this descriptor describes a buildable model
    pub fn validate(&self) -> Result<()> {
        if self.seq_len == 0 {
            return Err(Error::Config("seq_len must be positive".into()));
        }
        if (self.features as i64) < EMBEDDED_CHANNELS {
            return Err(Error::Config(format!(
                "the time embedding needs at least {} input features, got {}",
                EMBEDDED_CHANNELS, self.features
            )));
        }
        if self.encoders.is_empty() {
            return Err(Error::Config("at least one encoder block is required".into()));
        }
        for encoder in &self.encoders {
            encoder.validate()?;
        }
        if self.head_hidden == 0 {
            return Err(Error::Config("head_hidden must be positive".into()));
        }
        check_rate("head dropout", self.head_dropout)
    }
    /// Build a `StockTransformer` over a given `VarStore` path
    pub fn build(&self, p: &nn::Path) -> Result<StockTransformer> {
        self.validate()?;
        let width = self.model_width() as i64;
        let time_embedding = Time2Vector::new(&(p / "time2vec"), self.seq_len as i64);
        let encoders = self
            .encoders
            .iter()
            .enumerate()
            .map(|(i, desc)| EncoderBlock::new(&(p / format!("encoder_{}", i)), width, desc))
            .collect();
        let hidden = self.head_hidden as i64;
        Ok(StockTransformer {
            desc: self.clone(),
            time_embedding,
            encoders,
            hidden_layer: glorot_dense(&(p / "hidden"), width, hidden),
            output_layer: glorot_dense(&(p / "output"), hidden, 1),
        })
    }
}

/// The stock transformer model
#[derive(Debug)]
pub struct StockTransformer {
    /// The descriptor this model was built from
    pub desc: StockTransformerDesc,
    /// This model's time embedding
    pub time_embedding: Time2Vector,
    /// This model's encoder blocks
    pub encoders: Vec<EncoderBlock>,
    /// The hidden layer of the regression head
    pub hidden_layer: Linear,
    /// The output layer of the regression head
    pub output_layer: Linear,
}

impl StockTransformer {
    /// The device this model's variables live on
    pub fn device(&self) -> Device {
        self.output_layer.ws.device()
    }
    /// Check that `xs` is a `(batch, seq_len, features)` tensor
    pub fn check_input(&self, xs: &Tensor) -> Result<()> {
        let (seq_len, features) = (self.desc.seq_len as i64, self.desc.features as i64);
        match xs.size().as_slice() {
            &[_, steps, channels] if steps == seq_len && channels == features => Ok(()),
            _ => Err(Error::shape(
                format!("(batch, {}, {})", seq_len, features),
                xs.size(),
            )),
        }
    }
    /// Run the model after checking the input's shape
    pub fn try_forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.check_input(xs)?;
        Ok(self.forward_t(xs, train))
    }
    /// Predict one value per window of a `(batch, seq_len, features)` tensor, in inference mode.
    ///
    /// Non-finite predictions, which come from unnormalized or degenerate inputs, are an error.
    pub fn predict(&self, xs: &Tensor) -> Result<Vec<f32>> {
        self.check_input(xs)?;
        let yhat = tch::no_grad(|| self.forward_t(xs, false));
        let predictions = Vec::<f32>::try_from(&yhat.to_kind(Kind::Float).flatten(0, -1))?;
        if predictions.iter().all(|y| y.is_finite()) {
            Ok(predictions)
        } else {
            Err(Error::NonFinite("model output"))
        }
    }
    /// Compute the mean squared error of the model on a batch of inputs and `(batch, 1)` targets
    pub fn loss(&self, xs: &Tensor, ys: &Tensor, train: bool) -> Result<Tensor> {
        let yhat = self.try_forward_t(xs, train)?;
        Ok(yhat.mse_loss(ys, Reduction::Mean))
    }
}

impl ModuleT for StockTransformer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = xs.to_kind(Kind::Float);
        let time = self.time_embedding.forward(&xs);
        let mut x = Tensor::cat(&[xs, time], -1);
        for encoder in &self.encoders {
            x = encoder.forward_t(AttentionInputs::shared(&x), train);
        }
        // Global average pooling over the steps of each window
        let pooled = x.mean_dim(Some([1i64].as_slice()), false, Kind::Float);
        pooled
            .dropout(self.desc.head_dropout, train)
            .apply(&self.hidden_layer)
            .relu()
            .dropout(self.desc.head_dropout, train)
            .apply(&self.output_layer)
    }
}
