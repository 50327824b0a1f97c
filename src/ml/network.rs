//! Recurrent forecasting network.
//!
//! Input `[batch, L, F]`, output `[batch, H, T]`. Dropout is an explicit
//! Bernoulli mask driven by the `stochastic` flag rather than by the backend,
//! so the same forward pass serves training and Monte-Carlo inference.

use burn::module::Module;
use burn::nn::attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig};
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::{
    BatchNorm, BatchNormConfig, BiLstm, BiLstmConfig, LayerNorm, LayerNormConfig, Linear,
    LinearConfig, Lstm, LstmConfig, PaddingConfig1d,
};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};

use super::ModelParams;

/// Inverted dropout with keep probability `1 - rate`.
fn dropout<B: Backend, const D: usize>(x: Tensor<B, D>, rate: f64, stochastic: bool) -> Tensor<B, D> {
    if !stochastic || rate <= 0.0 {
        return x;
    }
    let keep = 1.0 - rate;
    let mask = x.random_like(Distribution::Bernoulli(keep));
    (x * mask).div_scalar(keep)
}

/// BatchNorm over the feature axis of a `[batch, steps, features]` tensor.
fn norm_sequence<B: Backend>(norm: &BatchNorm<B, 1>, x: Tensor<B, 3>) -> Tensor<B, 3> {
    norm.forward(x.swap_dims(1, 2)).swap_dims(1, 2)
}

/// BatchNorm over a `[batch, features]` tensor.
fn norm_flat<B: Backend>(norm: &BatchNorm<B, 1>, x: Tensor<B, 2>) -> Tensor<B, 2> {
    let [batch, width] = x.dims();
    norm.forward(x.reshape([batch, width, 1])).reshape([batch, width])
}

/// Largest divisor of `width` that does not exceed `requested`.
pub fn attention_heads(width: usize, requested: usize) -> usize {
    let upper = requested.max(1).min(width.max(1));
    (1..=upper).rev().find(|h| width % h == 0).unwrap_or(1)
}

#[derive(Module, Debug)]
pub struct ConvBranch<B: Backend> {
    conv1: Conv1d<B>,
    norm1: BatchNorm<B, 1>,
    conv2: Conv1d<B>,
    norm2: BatchNorm<B, 1>,
    dropout: f64,
}

impl<B: Backend> ConvBranch<B> {
    fn new(features: usize, filters: usize, dropout: f64, device: &B::Device) -> Self {
        let half = (filters / 2).max(1);
        Self {
            conv1: Conv1dConfig::new(features, filters, 3)
                .with_padding(PaddingConfig1d::Same)
                .init(device),
            norm1: BatchNormConfig::new(filters).init(device),
            conv2: Conv1dConfig::new(filters, half, 5)
                .with_padding(PaddingConfig1d::Same)
                .init(device),
            norm2: BatchNormConfig::new(half).init(device),
            dropout,
        }
    }

    fn output_width(filters: usize) -> usize {
        (filters / 2).max(1)
    }

    fn forward(&self, x: Tensor<B, 3>, stochastic: bool) -> Tensor<B, 3> {
        // Conv1d expects [batch, channels, steps]
        let h = self.conv1.forward(x.swap_dims(1, 2));
        let h = dropout(relu(self.norm1.forward(h)), self.dropout, stochastic);
        let h = self.conv2.forward(h);
        let h = dropout(relu(self.norm2.forward(h)), self.dropout, stochastic);
        h.swap_dims(1, 2)
    }

    fn penalty(&self, l1: f64, l2: f64) -> Tensor<B, 1> {
        kernel_penalty(self.conv1.weight.val().flatten::<1>(0, 2), l1, l2)
            + kernel_penalty(self.conv2.weight.val().flatten::<1>(0, 2), l1, l2)
    }
}

/// One recurrent layer: LSTM (bi- or unidirectional), BatchNorm, dropout and
/// an optional residual connection.
#[derive(Module, Debug)]
pub struct RecurrentBlock<B: Backend> {
    bidirectional: Option<BiLstm<B>>,
    unidirectional: Option<Lstm<B>>,
    norm: BatchNorm<B, 1>,
    residual: bool,
    dropout: f64,
}

impl<B: Backend> RecurrentBlock<B> {
    fn new(input: usize, params: &ModelParams, device: &B::Device) -> Self {
        let output = recurrent_width(params);
        let (bidirectional, unidirectional) = if params.use_bidirectional {
            let hidden = (params.lstm_units / 2).max(1);
            (Some(BiLstmConfig::new(input, hidden, true).init(device)), None)
        } else {
            (None, Some(LstmConfig::new(input, params.lstm_units, true).init(device)))
        };
        Self {
            bidirectional,
            unidirectional,
            norm: BatchNormConfig::new(output).init(device),
            residual: params.use_residual && input == output,
            dropout: params.dropout_rate,
        }
    }

    fn forward(&self, x: Tensor<B, 3>, stochastic: bool) -> Tensor<B, 3> {
        let out = match (&self.bidirectional, &self.unidirectional) {
            (Some(lstm), _) => lstm.forward(x.clone(), None).0,
            (None, Some(lstm)) => lstm.forward(x.clone(), None).0,
            (None, None) => x.clone(),
        };
        let out = dropout(norm_sequence(&self.norm, out), self.dropout, stochastic);
        if self.residual { out + x } else { out }
    }
}

/// Width produced by every recurrent layer.
fn recurrent_width(params: &ModelParams) -> usize {
    if params.use_bidirectional {
        2 * (params.lstm_units / 2).max(1)
    } else {
        params.lstm_units
    }
}

#[derive(Module, Debug)]
pub struct AttentionBlock<B: Backend> {
    attention: MultiHeadAttention<B>,
    norm: LayerNorm<B>,
    residual: bool,
}

impl<B: Backend> AttentionBlock<B> {
    fn new(width: usize, params: &ModelParams, device: &B::Device) -> Self {
        let heads = attention_heads(width, params.attention_heads);
        if heads != params.attention_heads {
            tracing::debug!(width, requested = params.attention_heads, heads, "Adjusted attention heads");
        }
        Self {
            attention: MultiHeadAttentionConfig::new(width, heads)
                .with_dropout(params.dropout_rate)
                .init(device),
            norm: LayerNormConfig::new(width).init(device),
            residual: params.use_residual,
        }
    }

    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let context = self.attention.forward(MhaInput::self_attn(x.clone())).context;
        let out = if self.residual { x + context } else { context };
        self.norm.forward(out)
    }
}

#[derive(Module, Debug)]
pub struct ForecastNetwork<B: Backend> {
    conv: Option<ConvBranch<B>>,
    recurrent: Vec<RecurrentBlock<B>>,
    attention: Option<AttentionBlock<B>>,
    dense1: Linear<B>,
    norm1: BatchNorm<B, 1>,
    dense2: Linear<B>,
    norm2: BatchNorm<B, 1>,
    output: Linear<B>,
    dense_residual: bool,
    dropout: f64,
    horizon: usize,
    targets: usize,
}

impl<B: Backend> ForecastNetwork<B> {
    /// `input_shape` is `(L, F)`, `output_shape` is `(H, T)`.
    pub fn new(
        params: &ModelParams,
        input_shape: (usize, usize),
        output_shape: (usize, usize),
        device: &B::Device,
    ) -> Self {
        let (_, features) = input_shape;
        let (horizon, targets) = output_shape;

        let conv = params
            .use_cnn
            .then(|| ConvBranch::new(features, params.cnn_filters, params.dropout_rate, device));
        let mut width = if conv.is_some() {
            features + ConvBranch::<B>::output_width(params.cnn_filters)
        } else {
            features
        };

        let mut recurrent = Vec::with_capacity(params.num_layers);
        for _ in 0..params.num_layers {
            recurrent.push(RecurrentBlock::new(width, params, device));
            width = recurrent_width(params);
        }

        let attention = params
            .use_attention
            .then(|| AttentionBlock::new(width, params, device));

        let units = params.lstm_units;
        Self {
            conv,
            recurrent,
            attention,
            dense1: LinearConfig::new(width, units * 2).init(device),
            norm1: BatchNormConfig::new(units * 2).init(device),
            dense2: LinearConfig::new(units * 2, units).init(device),
            norm2: BatchNormConfig::new(units).init(device),
            output: LinearConfig::new(units, horizon * targets).init(device),
            dense_residual: params.use_residual && width == units,
            dropout: params.dropout_rate,
            horizon,
            targets,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, stochastic: bool) -> Tensor<B, 3> {
        let [batch, _, _] = x.dims();

        let mut h = match &self.conv {
            Some(conv) => {
                let extracted = conv.forward(x.clone(), stochastic);
                Tensor::cat(vec![x, extracted], 2)
            }
            None => x,
        };

        for block in &self.recurrent {
            h = block.forward(h, stochastic);
        }

        if let Some(attention) = &self.attention {
            h = attention.forward(h);
        }

        let [_, _, width] = h.dims();
        let pooled: Tensor<B, 2> = h.mean_dim(1).reshape([batch, width]);

        let d = relu(self.dense1.forward(pooled.clone()));
        let d = dropout(norm_flat(&self.norm1, d), self.dropout, stochastic);
        let d = relu(self.dense2.forward(d));
        let d = dropout(norm_flat(&self.norm2, d), self.dropout, stochastic);
        let d = if self.dense_residual { d + pooled } else { d };

        self.output
            .forward(d)
            .reshape([batch, self.horizon, self.targets])
    }

    /// `l1 * sum|W| + l2 * sum W^2` over dense and convolution kernels.
    pub fn weight_penalty(&self, l1: f64, l2: f64) -> Tensor<B, 1> {
        let dense = kernel_penalty(self.dense1.weight.val().flatten::<1>(0, 1), l1, l2)
            + kernel_penalty(self.dense2.weight.val().flatten::<1>(0, 1), l1, l2)
            + kernel_penalty(self.output.weight.val().flatten::<1>(0, 1), l1, l2);
        match &self.conv {
            Some(conv) => dense + conv.penalty(l1, l2),
            None => dense,
        }
    }
}

fn kernel_penalty<B: Backend>(weights: Tensor<B, 1>, l1: f64, l2: f64) -> Tensor<B, 1> {
    weights.clone().abs().sum().mul_scalar(l1) + weights.powf_scalar(2.0).sum().mul_scalar(l2)
}

/// Huber loss with threshold `delta`, averaged over all elements.
pub fn huber_loss<B: Backend>(pred: Tensor<B, 3>, target: Tensor<B, 3>, delta: f64) -> Tensor<B, 1> {
    let err = (pred - target).abs();
    let quadratic = err.clone().clamp_max(delta);
    let linear = err - quadratic.clone();
    (quadratic.powf_scalar(2.0).mul_scalar(0.5) + linear.mul_scalar(delta)).mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    fn small_params() -> ModelParams {
        ModelParams {
            lstm_units: 8,
            num_layers: 2,
            attention_heads: 3,
            cnn_filters: 4,
            dropout_rate: 0.2,
            ..ModelParams::default()
        }
    }

    fn input(batch: usize, steps: usize, features: usize) -> Tensor<B, 3> {
        let device = Default::default();
        let values: Vec<f32> = (0..batch * steps * features).map(|i| (i % 7) as f32 * 0.1).collect();
        Tensor::<B, 1>::from_floats(values.as_slice(), &device).reshape([batch, steps, features])
    }

    // ==================== Shapes ====================

    #[test]
    fn test_output_shape() {
        let device = Default::default();
        let net = ForecastNetwork::<B>::new(&small_params(), (6, 5), (3, 2), &device);
        let out = net.forward(input(4, 6, 5), false);
        assert_eq!(out.dims(), [4, 3, 2]);
    }

    #[test]
    fn test_output_shape_without_optional_branches() {
        let device = Default::default();
        let params = ModelParams {
            use_cnn: false,
            use_attention: false,
            use_bidirectional: false,
            use_residual: false,
            ..small_params()
        };
        let net = ForecastNetwork::<B>::new(&params, (6, 5), (2, 1), &device);
        let out = net.forward(input(3, 6, 5), true);
        assert_eq!(out.dims(), [3, 2, 1]);
    }

    #[test]
    fn test_attention_heads_divide_width() {
        assert_eq!(attention_heads(8, 3), 2);
        assert_eq!(attention_heads(256, 12), 8);
        assert_eq!(attention_heads(12, 12), 12);
        assert_eq!(attention_heads(7, 4), 1);
    }

    // ==================== Dropout ====================

    #[test]
    fn test_deterministic_forward_is_repeatable() {
        let device = Default::default();
        let net = ForecastNetwork::<B>::new(&small_params(), (6, 5), (1, 1), &device);
        let a = net.forward(input(2, 6, 5), false).into_data().to_vec::<f32>().unwrap();
        let b = net.forward(input(2, 6, 5), false).into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_dropout_disabled_is_identity() {
        let x = input(2, 3, 4);
        let expected = x.clone().into_data().to_vec::<f32>().unwrap();
        let out = dropout(x, 0.5, false).into_data().to_vec::<f32>().unwrap();
        assert_eq!(out, expected);
    }

    // ==================== Loss ====================

    #[test]
    fn test_huber_loss_regions() {
        let device = Default::default();
        let pred = Tensor::<B, 1>::from_floats([0.5f32, 3.0].as_slice(), &device).reshape([2, 1, 1]);
        let target = Tensor::<B, 3>::zeros([2, 1, 1], &device);
        let loss: f32 = huber_loss(pred, target, 1.0).into_scalar();
        assert!((loss - 1.3125).abs() < 1e-6);
    }

    #[test]
    fn test_weight_penalty_is_non_negative() {
        let device = Default::default();
        let net = ForecastNetwork::<B>::new(&small_params(), (6, 5), (1, 1), &device);
        let penalty: f32 = net.weight_penalty(1e-5, 1e-4).into_scalar();
        assert!(penalty >= 0.0);
    }
}
