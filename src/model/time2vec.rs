/*!
A learned, position-specific time embedding.

The first three channels of every step are averaged into a scalar `x[t]`, which is mapped to a linear feature
`w_l[t] * x[t] + b_l[t]` and a periodic feature `sin(w_p[t] * x[t] + b_p[t])`. Each weight is indexed by
position in the window, not shared across steps.
*/
use crate::{Error, Result};
use tch::nn::{self, Init};
use tch::{Kind, Tensor};

/// The number of input channels averaged into the embedded scalar
pub const EMBEDDED_CHANNELS: i64 = 3;

/// The number of features produced per step
pub const EMBEDDING_WIDTH: i64 = 2;

const UNIFORM: Init = Init::Uniform { lo: -0.05, up: 0.05 };

/// The time embedding layer
#[derive(Debug)]
pub struct Time2Vector {
    /// The window length
    pub seq_len: i64,
    /// Per-step weights of the linear feature
    pub weight_linear: Tensor,
    /// Per-step biases of the linear feature
    pub bias_linear: Tensor,
    /// Per-step weights of the periodic feature
    pub weight_periodic: Tensor,
    /// Per-step biases of the periodic feature
    pub bias_periodic: Tensor,
}

impl Time2Vector {
    /// Create the embedding's variables under `p`
    pub fn new(p: &nn::Path, seq_len: i64) -> Time2Vector {
        Time2Vector {
            seq_len,
            weight_linear: p.var("weight_linear", &[seq_len], UNIFORM),
            bias_linear: p.var("bias_linear", &[seq_len], UNIFORM),
            weight_periodic: p.var("weight_periodic", &[seq_len], UNIFORM),
            bias_periodic: p.var("bias_periodic", &[seq_len], UNIFORM),
        }
    }

    /// Check that `xs` is a `(batch, seq_len, >= 3)` tensor
    pub fn check_input(&self, xs: &Tensor) -> Result<()> {
        match xs.size().as_slice() {
            &[_, steps, channels] if steps == self.seq_len && channels >= EMBEDDED_CHANNELS => Ok(()),
            _ => Err(Error::shape(
                format!("(batch, {}, >= {})", self.seq_len, EMBEDDED_CHANNELS),
                xs.size(),
            )),
        }
    }

    /// Embed a `(batch, seq_len, >= 3)` tensor as `(batch, seq_len, 2)`
    pub fn forward(&self, xs: &Tensor) -> Tensor {
        let x = xs
            .narrow(2, 0, EMBEDDED_CHANNELS)
            .mean_dim(Some([-1i64].as_slice()), false, Kind::Float);
        let linear = &x * &self.weight_linear + &self.bias_linear;
        let periodic = (&x * &self.weight_periodic + &self.bias_periodic).sin();
        Tensor::stack(&[linear, periodic], -1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::VarStore, Device};

    #[test]
    fn zero_input_yields_biases() {
        let vs = VarStore::new(Device::Cpu);
        let t2v = Time2Vector::new(&vs.root(), 16);
        let out = t2v.forward(&Tensor::zeros([3, 16, 4], (Kind::Float, Device::Cpu)));
        assert_eq!(out.size(), vec![3, 16, 2]);
        for b in 0..3 {
            let linear = out.get(b).select(1, 0);
            let periodic = out.get(b).select(1, 1);
            assert!(linear.allclose(&t2v.bias_linear, 1e-6, 1e-7, false));
            assert!(periodic.allclose(&t2v.bias_periodic.sin(), 1e-6, 1e-7, false));
        }
    }

    #[test]
    fn only_first_three_channels_are_used() {
        let vs = VarStore::new(Device::Cpu);
        let t2v = Time2Vector::new(&vs.root(), 8);
        let xs = Tensor::rand([2, 8, 4], (Kind::Float, Device::Cpu));
        let perturbed = xs.copy();
        let _ = perturbed.narrow(2, 3, 1).fill_(100.0);
        let a = t2v.forward(&xs);
        let b = t2v.forward(&perturbed);
        assert!(a.allclose(&b, 1e-6, 1e-7, false));
        let mean = xs.narrow(2, 0, 3).mean_dim(Some([-1i64].as_slice()), false, Kind::Float);
        let expected = &mean * &t2v.weight_linear + &t2v.bias_linear;
        assert!(a.select(2, 0).allclose(&expected, 1e-5, 1e-6, false));
    }

    #[test]
    fn too_few_channels_are_rejected() {
        let vs = VarStore::new(Device::Cpu);
        let t2v = Time2Vector::new(&vs.root(), 8);
        let narrow = Tensor::zeros([1, 8, 2], (Kind::Float, Device::Cpu));
        assert!(matches!(t2v.check_input(&narrow), Err(Error::Shape { .. })));
        let short = Tensor::zeros([1, 7, 4], (Kind::Float, Device::Cpu));
        assert!(t2v.check_input(&short).is_err());
        let ok = Tensor::zeros([5, 8, 3], (Kind::Float, Device::Cpu));
        assert!(t2v.check_input(&ok).is_ok());
    }
}
