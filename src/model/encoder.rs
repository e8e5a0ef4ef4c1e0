/*!
The transformer encoder block: multi-head self-attention followed by a position-wise feed-forward sublayer,
each wrapped in dropout, a residual connection and layer normalization
*/
use super::attention::{AttentionInputs, MultiAttention};
use super::{glorot_conv1d, EncoderDesc};
use tch::nn::{self, Conv1D, LayerNorm, LayerNormConfig};
use tch::Tensor;

/// The layer normalization epsilon
pub const LAYER_NORM_EPS: f64 = 1e-6;

/// A transformer encoder block. The output has the same shape as the primary (query) input
#[derive(Debug)]
pub struct EncoderBlock {
    /// The dropout rate applied after each sublayer while training
    pub dropout: f64,
    /// The attention sublayer
    pub attn_multi: MultiAttention,
    /// Normalization after the attention residual
    pub attn_normalize: LayerNorm,
    /// The expanding feed-forward convolution, `features -> ff_dim`
    pub ff_conv1d_1: Conv1D,
    /// The contracting feed-forward convolution, `ff_dim -> features`
    pub ff_conv1d_2: Conv1D,
    /// Normalization after the feed-forward residual
    pub ff_normalize: LayerNorm,
}

impl EncoderBlock {
    /// Create an encoder block over `features`-wide inputs
    pub fn new(p: &nn::Path, features: i64, desc: &EncoderDesc) -> EncoderBlock {
        let norm_config = || LayerNormConfig {
            eps: LAYER_NORM_EPS,
            ..Default::default()
        };
        let ff_dim = desc.ff_dim as i64;
        EncoderBlock {
            dropout: desc.dropout,
            attn_multi: MultiAttention::new(
                &(p / "attn_multi"),
                features,
                desc.d_k as i64,
                desc.d_v as i64,
                desc.n_heads as i64,
            ),
            attn_normalize: nn::layer_norm(p / "attn_normalize", vec![features], norm_config()),
            ff_conv1d_1: glorot_conv1d(&(p / "ff_conv1d_1"), features, ff_dim),
            ff_conv1d_2: glorot_conv1d(&(p / "ff_conv1d_2"), ff_dim, features),
            ff_normalize: nn::layer_norm(p / "ff_normalize", vec![features], norm_config()),
        }
    }

    /// The position-wise feed-forward sublayer on a `(batch, seq_len, features)` tensor.
    ///
    /// Both convolutions have kernel size 1, so no information moves between steps.
    pub fn feed_forward(&self, xs: &Tensor) -> Tensor {
        // conv1d works on (batch, channels, steps)
        xs.transpose(1, 2)
            .apply(&self.ff_conv1d_1)
            .relu()
            .apply(&self.ff_conv1d_2)
            .transpose(1, 2)
    }

    /// Run the block. `train` enables dropout
    pub fn forward_t(&self, inputs: AttentionInputs, train: bool) -> Tensor {
        let attn = self
            .attn_multi
            .forward(inputs)
            .dropout(self.dropout, train);
        let attn = (inputs.query + attn).apply(&self.attn_normalize);
        let ff = self.feed_forward(&attn).dropout(self.dropout, train);
        (attn + ff).apply(&self.ff_normalize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::VarStore, Device, Kind};

    fn desc() -> EncoderDesc {
        EncoderDesc {
            d_k: 16,
            d_v: 8,
            n_heads: 3,
            ff_dim: 32,
            dropout: 0.1,
        }
    }

    #[test]
    fn output_shape_matches_input() {
        let vs = VarStore::new(Device::Cpu);
        for &features in &[4i64, 6, 11] {
            let block = EncoderBlock::new(&(&vs.root() / features), features, &desc());
            for &batch in &[1i64, 2, 7] {
                let xs = Tensor::randn([batch, 10, features], (Kind::Float, Device::Cpu));
                for &train in &[false, true] {
                    let out = block.forward_t(AttentionInputs::shared(&xs), train);
                    assert_eq!(out.size(), xs.size());
                }
            }
        }
    }

    #[test]
    fn inference_is_deterministic_and_normalized() {
        let vs = VarStore::new(Device::Cpu);
        let block = EncoderBlock::new(&vs.root(), 6, &desc());
        let xs = Tensor::randn([3, 12, 6], (Kind::Float, Device::Cpu));
        let a = block.forward_t(AttentionInputs::shared(&xs), false);
        let b = block.forward_t(AttentionInputs::shared(&xs), false);
        assert!(a.allclose(&b, 0.0, 0.0, false));
        // Freshly initialized layer norms have unit scale and zero shift
        let mean = a.mean_dim(Some([-1i64].as_slice()), false, Kind::Float);
        assert!(mean.abs().max().double_value(&[]) < 1e-4);
    }

    #[test]
    fn feed_forward_is_position_wise() {
        let vs = VarStore::new(Device::Cpu);
        let block = EncoderBlock::new(&vs.root(), 6, &desc());
        let xs = Tensor::randn([2, 8, 6], (Kind::Float, Device::Cpu));
        let perturbed = xs.copy();
        let _ = perturbed.narrow(1, 5, 1).fill_(3.0);
        let a = block.feed_forward(&xs);
        let b = block.feed_forward(&perturbed);
        assert_eq!(a.size(), vec![2, 8, 6]);
        assert!(a.narrow(1, 0, 5).allclose(&b.narrow(1, 0, 5), 1e-6, 1e-7, false));
        assert!(!a.narrow(1, 5, 1).allclose(&b.narrow(1, 5, 1), 1e-6, 1e-7, false));
    }
}
