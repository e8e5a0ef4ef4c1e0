/*!
Scaled dot-product self-attention, assembled from dense projections and matrix products
*/
use super::glorot_linear;
use tch::nn::{self, Linear, Module};
use tch::{Kind, Tensor};

/// The query, key and value sources of an attention layer, each of shape `(batch, seq_len, features)`
#[derive(Debug, Copy, Clone)]
pub struct AttentionInputs<'a> {
    /// The tensor projected into queries
    pub query: &'a Tensor,
    /// The tensor projected into keys
    pub key: &'a Tensor,
    /// The tensor projected into values
    pub value: &'a Tensor,
}

impl<'a> AttentionInputs<'a> {
    /// Use a single tensor as the query, key and value source
    pub fn shared(xs: &'a Tensor) -> AttentionInputs<'a> {
        AttentionInputs {
            query: xs,
            key: xs,
            value: xs,
        }
    }
}

/// A single attention head
#[derive(Debug)]
pub struct SingleAttention {
    /// The dimension of queries and keys
    pub d_k: i64,
    /// The dimension of values
    pub d_v: i64,
    /// The query projection
    pub query: Linear,
    /// The key projection
    pub key: Linear,
    /// The value projection
    pub value: Linear,
}

impl SingleAttention {
    /// Create an attention head over `features`-wide inputs
    pub fn new(p: &nn::Path, features: i64, d_k: i64, d_v: i64) -> SingleAttention {
        SingleAttention {
            d_k,
            d_v,
            query: glorot_linear(&(p / "query"), features, d_k),
            key: glorot_linear(&(p / "key"), features, d_k),
            value: glorot_linear(&(p / "value"), features, d_v),
        }
    }

    /// The `(batch, seq_len, seq_len)` attention distribution of each query position over key positions
    pub fn attention_weights(&self, query: &Tensor, key: &Tensor) -> Tensor {
        let q = self.query.forward(query);
        let k = self.key.forward(key);
        let scores = q.matmul(&k.transpose(-2, -1)) / (self.d_k as f64).sqrt();
        scores.softmax(-1, Kind::Float)
    }

    /// Attend over the inputs, giving a `(batch, seq_len, d_v)` tensor
    pub fn forward(&self, inputs: AttentionInputs) -> Tensor {
        let weights = self.attention_weights(inputs.query, inputs.key);
        let v = self.value.forward(inputs.value);
        weights.matmul(&v)
    }
}

/// Several attention heads run side by side, concatenated and projected back to the input width
#[derive(Debug)]
pub struct MultiAttention {
    /// The attention heads, fixed at construction
    pub heads: Vec<SingleAttention>,
    /// The projection from `n_heads * d_v` features back to the input width
    pub linear: Linear,
}

impl MultiAttention {
    /// Create `n_heads` independent heads over `features`-wide inputs
    pub fn new(p: &nn::Path, features: i64, d_k: i64, d_v: i64, n_heads: i64) -> MultiAttention {
        let heads = (0..n_heads)
            .map(|i| SingleAttention::new(&(p / format!("head_{}", i)), features, d_k, d_v))
            .collect();
        MultiAttention {
            heads,
            linear: glorot_linear(&(p / "linear"), n_heads * d_v, features),
        }
    }

    /// Attend over the inputs with every head, giving a tensor shaped like `inputs.query`
    pub fn forward(&self, inputs: AttentionInputs) -> Tensor {
        let heads: Vec<Tensor> = self.heads.iter().map(|head| head.forward(inputs)).collect();
        Tensor::cat(&heads, -1).apply(&self.linear)
    }
}
