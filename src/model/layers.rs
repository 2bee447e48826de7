//! Shared building blocks: layer norm, feed-forward, multi-head self-attention.
//!
//! All blocks take an explicit `train` flag; dropout is the only source of
//! randomness, so evaluation-mode forwards are deterministic.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Dropout, Init, Linear, Module, VarBuilder};

/// Layer normalization built from primitive tensor ops so gradients reach
/// both the input and the affine parameters.
#[derive(Debug, Clone)]
pub struct Norm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl Norm {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get_with_hints(dim, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(dim, "bias", Init::Const(0.0))?,
            eps: 1e-5,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = variance.affine(1.0, self.eps)?.sqrt()?;
        let normed = centered.broadcast_div(&std)?;
        normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Two-layer perceptron with GELU and dropout on the hidden activation.
#[derive(Debug, Clone)]
pub struct FeedForward {
    up: Linear,
    down: Linear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(
        in_dim: usize,
        hidden_dim: usize,
        out_dim: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            up: candle_nn::linear(in_dim, hidden_dim, vb.pp("up"))?,
            down: candle_nn::linear(hidden_dim, out_dim, vb.pp("down"))?,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.up.forward(xs)?.gelu()?;
        let h = self.dropout.forward(&h, train)?;
        self.down.forward(&h)
    }
}

/// Multi-head self-attention over a `(seq_len, dim)` sequence.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    qkv: Linear,
    out: Linear,
    num_heads: usize,
    head_dim: usize,
    dropout: Dropout,
}

impl SelfAttention {
    pub fn new(dim: usize, num_heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || dim % num_heads != 0 {
            candle_core::bail!("dim {} not divisible by {} heads", dim, num_heads);
        }
        Ok(Self {
            qkv: candle_nn::linear(dim, 3 * dim, vb.pp("qkv"))?,
            out: candle_nn::linear(dim, dim, vb.pp("out"))?,
            num_heads,
            head_dim: dim / num_heads,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (seq_len, dim) = xs.dims2()?;
        // (S, 3D) → (3, H, S, hd)
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((seq_len, 3, self.num_heads, self.head_dim))?
            .permute((1, 2, 0, 3))?;
        let q = qkv.get(0)?.contiguous()?;
        let k = qkv.get(1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q.matmul(&k.t()?.contiguous()?)?.affine(scale, 0.0)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let weights = self.dropout.forward(&weights, train)?;

        // (H, S, hd) → (S, D)
        let context = weights
            .matmul(&v)?
            .transpose(0, 1)?
            .contiguous()?
            .reshape((seq_len, dim))?;
        self.out.forward(&context)
    }
}

/// Pre-norm residual block: `x + attn(norm(x))`, then `x + ff(norm(x))`.
#[derive(Debug, Clone)]
pub struct AttentionBlock {
    attn_norm: Norm,
    attn: SelfAttention,
    ff_norm: Norm,
    ff: FeedForward,
    dropout: Dropout,
}

impl AttentionBlock {
    pub fn new(
        dim: usize,
        num_heads: usize,
        ff_dim: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            attn_norm: Norm::new(dim, vb.pp("attn_norm"))?,
            attn: SelfAttention::new(dim, num_heads, dropout, vb.pp("attn"))?,
            ff_norm: Norm::new(dim, vb.pp("ff_norm"))?,
            ff: FeedForward::new(dim, ff_dim, dim, dropout, vb.pp("ff"))?,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let attended = self.attn.forward(&self.attn_norm.forward(xs)?, train)?;
        let xs = (xs + self.dropout.forward(&attended, train)?)?;
        let fed = self.ff.forward(&self.ff_norm.forward(&xs)?, train)?;
        xs + self.dropout.forward(&fed, train)?
    }
}

/// Logistic function from primitive ops; saturates to exactly 0 or 1 for
/// large magnitudes instead of producing NaN.
pub fn sigmoid(xs: &Tensor) -> Result<Tensor> {
    xs.neg()?.exp()?.affine(1.0, 1.0)?.recip()
}

/// Row-wise L2 normalization.
pub fn l2_normalize(xs: &Tensor) -> Result<Tensor> {
    let norm = xs
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .affine(1.0, 1e-12)?
        .sqrt()?;
    xs.broadcast_div(&norm)
}

/// Scalar L2 norm of a tensor, read back to the host.
pub fn l2_norm(xs: &Tensor) -> Result<f32> {
    xs.to_dtype(DType::F32)?
        .sqr()?
        .sum_all()?
        .sqrt()?
        .to_scalar::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_norm_zero_mean_unit_variance() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = Norm::new(4, vb).unwrap();
        let xs = Tensor::new(&[[1f32, 2., 3., 4.], [10., 10., 10., 14.]], &Device::Cpu).unwrap();
        let out = norm.forward(&xs).unwrap().to_vec2::<f32>().unwrap();
        for row in out {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_attention_preserves_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = AttentionBlock::new(8, 2, 16, 0.0, vb).unwrap();
        let xs = Tensor::randn(0f32, 1f32, (5, 8), &Device::Cpu).unwrap();
        let out = block.forward(&xs, false).unwrap();
        assert_eq!(out.dims(), &[5, 8]);
    }

    #[test]
    fn test_attention_rejects_bad_heads() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(SelfAttention::new(10, 3, 0.0, vb).is_err());
    }

    #[test]
    fn test_sigmoid_saturates_without_nan() {
        let xs = Tensor::new(&[-1000f32, -5., 0., 5., 1000.], &Device::Cpu).unwrap();
        let out = sigmoid(&xs).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(out[0], 0.0);
        assert!((out[2] - 0.5).abs() < 1e-6);
        assert_eq!(out[4], 1.0);
        assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_l2_normalize_handles_zero_rows() {
        let xs = Tensor::new(&[[3f32, 4.], [0., 0.]], &Device::Cpu).unwrap();
        let out = l2_normalize(&xs).unwrap().to_vec2::<f32>().unwrap();
        assert!((out[0][0] - 0.6).abs() < 1e-6);
        assert_eq!(out[1], vec![0.0, 0.0]);
    }
}
