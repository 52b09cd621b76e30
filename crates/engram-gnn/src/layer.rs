//! Dense projection layers: `y = act(W·x + b)`.
//!
//! Weights are dense row-major f32. The backward pass follows standard
//! matrix-calculus rules with the activation derivative dispatched by kind;
//! gradients are clipped by global L2 norm and any NaN/Inf aborts the step
//! with `GradientInvalid`.

use engram_error::{EngramError, Result};
use rand::Rng;
use rand::rngs::StdRng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Identity,
}

impl Activation {
    #[inline]
    fn apply(self, x: f32) -> f32 {
        match self {
            Self::Relu => x.max(0.0),
            Self::Identity => x,
        }
    }

    /// Derivative evaluated at the pre-activation value.
    #[inline]
    fn derivative(self, pre: f32) -> f32 {
        match self {
            Self::Relu => {
                if pre > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Identity => 1.0,
        }
    }
}

/// Activations captured during a forward pass for backprop.
#[derive(Debug, Clone)]
pub struct LayerActivation {
    pub input: Vec<f32>,
    pub pre_activation: Vec<f32>,
    pub post_activation: Vec<f32>,
}

/// Gradients produced by one layer's backward step.
#[derive(Debug, Clone)]
pub struct LayerGrads {
    /// Row-major `dim_out × dim_in`.
    pub d_weights: Vec<f32>,
    pub d_bias: Vec<f32>,
    pub d_input: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct DenseLayer {
    pub dim_in: usize,
    pub dim_out: usize,
    /// Row-major `dim_out × dim_in`.
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
    pub activation: Activation,
}

impl DenseLayer {
    /// Xavier-uniform initialization from a seeded generator.
    #[must_use]
    pub fn xavier(dim_in: usize, dim_out: usize, activation: Activation, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (dim_in + dim_out) as f32).sqrt();
        let weights = (0..dim_in * dim_out)
            .map(|_| rng.gen_range(-limit..=limit))
            .collect();
        Self {
            dim_in,
            dim_out,
            weights,
            bias: vec![0.0; dim_out],
            activation,
        }
    }

    pub fn forward(&self, input: &[f32]) -> Result<Vec<f32>> {
        Ok(self.forward_cached(input)?.post_activation)
    }

    /// Forward pass capturing `{input, pre_activation, post_activation}`.
    pub fn forward_cached(&self, input: &[f32]) -> Result<LayerActivation> {
        if input.len() != self.dim_in {
            return Err(EngramError::DimensionMismatch {
                expected: self.dim_in,
                actual: input.len(),
            });
        }
        let mut pre = Vec::with_capacity(self.dim_out);
        for row in 0..self.dim_out {
            let offset = row * self.dim_in;
            let mut acc = self.bias[row];
            for (i, &x) in input.iter().enumerate() {
                acc = self.weights[offset + i].mul_add(x, acc);
            }
            pre.push(acc);
        }
        let post = pre.iter().map(|&p| self.activation.apply(p)).collect();
        Ok(LayerActivation {
            input: input.to_vec(),
            pre_activation: pre,
            post_activation: post,
        })
    }

    /// `dL/dy → {dW, db, dx}` using the cached activations.
    pub fn backward(&self, d_output: &[f32], cache: &LayerActivation) -> Result<LayerGrads> {
        if d_output.len() != self.dim_out {
            return Err(EngramError::DimensionMismatch {
                expected: self.dim_out,
                actual: d_output.len(),
            });
        }
        let d_pre: Vec<f32> = d_output
            .iter()
            .zip(cache.pre_activation.iter())
            .map(|(&dy, &pre)| dy * self.activation.derivative(pre))
            .collect();

        let mut d_weights = vec![0.0f32; self.dim_in * self.dim_out];
        for (row, &dp) in d_pre.iter().enumerate() {
            let offset = row * self.dim_in;
            for (i, &x) in cache.input.iter().enumerate() {
                d_weights[offset + i] = dp * x;
            }
        }
        let mut d_input = vec![0.0f32; self.dim_in];
        for (row, &dp) in d_pre.iter().enumerate() {
            let offset = row * self.dim_in;
            for (i, slot) in d_input.iter_mut().enumerate() {
                *slot = self.weights[offset + i].mul_add(dp, *slot);
            }
        }
        Ok(LayerGrads {
            d_weights,
            d_bias: d_pre,
            d_input,
        })
    }

    /// SGD step: `W ← W − lr·dW`, `b ← b − lr·db`.
    pub fn apply_gradients(&mut self, grads: &LayerGrads, learning_rate: f32) -> Result<()> {
        if grads.d_weights.len() != self.weights.len() || grads.d_bias.len() != self.bias.len() {
            return Err(EngramError::DimensionMismatch {
                expected: self.weights.len(),
                actual: grads.d_weights.len(),
            });
        }
        for (w, dw) in self.weights.iter_mut().zip(grads.d_weights.iter()) {
            *w -= learning_rate * dw;
        }
        for (b, db) in self.bias.iter_mut().zip(grads.d_bias.iter()) {
            *b -= learning_rate * db;
        }
        Ok(())
    }
}

/// Clip all layer gradients jointly by global L2 norm.
///
/// Returns the pre-clip norm. NaN/Inf anywhere aborts with
/// `GradientInvalid`, identifying the offending layer.
pub fn clip_gradients(grads: &mut [LayerGrads], max_norm: f32) -> Result<f32> {
    let mut sum_squares = 0.0f64;
    for (layer, grad) in grads.iter().enumerate() {
        for &g in grad.d_weights.iter().chain(grad.d_bias.iter()) {
            if !g.is_finite() {
                return Err(EngramError::GradientInvalid { layer });
            }
            sum_squares += f64::from(g) * f64::from(g);
        }
    }
    let norm = sum_squares.sqrt() as f32;
    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        for grad in grads.iter_mut() {
            for g in grad.d_weights.iter_mut().chain(grad.d_bias.iter_mut()) {
                *g *= scale;
            }
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn tiny_layer() -> DenseLayer {
        // 2→2 with hand-picked weights for checkable arithmetic.
        DenseLayer {
            dim_in: 2,
            dim_out: 2,
            weights: vec![1.0, 2.0, -1.0, 0.5],
            bias: vec![0.1, -0.2],
            activation: Activation::Relu,
        }
    }

    #[test]
    fn forward_matches_hand_computation() {
        let layer = tiny_layer();
        let out = layer.forward(&[1.0, 1.0]).unwrap();
        // Row 0: 1 + 2 + 0.1 = 3.1 → relu 3.1
        // Row 1: -1 + 0.5 − 0.2 = −0.7 → relu 0.0
        assert!((out[0] - 3.1).abs() < 1e-6);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn backward_zeroes_gradient_through_dead_relu() {
        let layer = tiny_layer();
        let cache = layer.forward_cached(&[1.0, 1.0]).unwrap();
        let grads = layer.backward(&[1.0, 1.0], &cache).unwrap();
        // Row 1 was clamped, so its weight gradient is zero.
        assert_eq!(&grads.d_weights[2..4], &[0.0, 0.0]);
        assert_eq!(grads.d_bias[1], 0.0);
        // dx only flows through the live row: dx_i = W[0][i].
        assert!((grads.d_input[0] - 1.0).abs() < 1e-6);
        assert!((grads.d_input[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn backward_numerical_gradient_check() {
        let mut rng = StdRng::seed_from_u64(11);
        let layer = DenseLayer::xavier(4, 3, Activation::Relu, &mut rng);
        let input: Vec<f32> = vec![0.3, -0.7, 0.2, 0.9];
        let cache = layer.forward_cached(&input).unwrap();
        // Loss = sum(y); dL/dy = 1.
        let grads = layer.backward(&vec![1.0; 3], &cache).unwrap();

        let eps = 1e-3f32;
        for probe in [0usize, 5, 11] {
            let mut bumped = layer.clone();
            bumped.weights[probe] += eps;
            let up: f32 = bumped.forward(&input).unwrap().iter().sum();
            let mut dropped = layer.clone();
            dropped.weights[probe] -= eps;
            let down: f32 = dropped.forward(&input).unwrap().iter().sum();
            let numeric = (up - down) / (2.0 * eps);
            assert!(
                (numeric - grads.d_weights[probe]).abs() < 1e-2,
                "weight {probe}: numeric {numeric} vs analytic {}",
                grads.d_weights[probe]
            );
        }
    }

    #[test]
    fn xavier_respects_fan_limit() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = DenseLayer::xavier(100, 50, Activation::Relu, &mut rng);
        let limit = (6.0f32 / 150.0).sqrt();
        assert!(layer.weights.iter().all(|w| w.abs() <= limit + 1e-6));
        assert!(layer.bias.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn clip_scales_to_the_global_norm() {
        let mut grads = vec![LayerGrads {
            d_weights: vec![3.0, 4.0],
            d_bias: vec![0.0],
            d_input: vec![],
        }];
        let norm = clip_gradients(&mut grads, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        let clipped = (grads[0].d_weights[0].powi(2) + grads[0].d_weights[1].powi(2)).sqrt();
        assert!((clipped - 1.0).abs() < 1e-5);
    }

    #[test]
    fn nan_gradient_is_rejected_with_layer_index() {
        let mut grads = vec![
            LayerGrads {
                d_weights: vec![1.0],
                d_bias: vec![0.0],
                d_input: vec![],
            },
            LayerGrads {
                d_weights: vec![f32::NAN],
                d_bias: vec![0.0],
                d_input: vec![],
            },
        ];
        let err = clip_gradients(&mut grads, 5.0).unwrap_err();
        assert!(matches!(err, EngramError::GradientInvalid { layer: 1 }));
    }

    #[test]
    fn sgd_step_reduces_simple_loss() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = DenseLayer::xavier(3, 1, Activation::Identity, &mut rng);
        let input = vec![0.5, -0.5, 1.0];
        let target = 2.0f32;
        let mut last_loss = f32::INFINITY;
        for _ in 0..50 {
            let cache = layer.forward_cached(&input).unwrap();
            let y = cache.post_activation[0];
            let loss = (y - target) * (y - target);
            let grads = layer.backward(&[2.0 * (y - target)], &cache).unwrap();
            layer.apply_gradients(&grads, 0.05).unwrap();
            last_loss = loss;
        }
        assert!(last_loss < 1e-3, "loss failed to converge: {last_loss}");
    }
}
