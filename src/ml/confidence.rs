//! Monte-Carlo dropout summaries.

use ndarray::Array3;

/// Element-wise mean and spread over repeated stochastic predictions.
#[derive(Debug, Clone, PartialEq)]
pub struct McSummary {
    pub mean: Array3<f32>,
    /// Population standard deviation
    pub std: Array3<f32>,
    pub samples: usize,
}

impl McSummary {
    /// Summarize samples of identical shape. Returns `None` for no samples or
    /// mismatched shapes.
    pub fn from_samples(samples: &[Array3<f32>]) -> Option<Self> {
        let first = samples.first()?;
        if samples.iter().any(|s| s.shape() != first.shape()) {
            return None;
        }
        let n = samples.len() as f64;

        let mut sum = Array3::<f64>::zeros(first.raw_dim());
        for s in samples {
            sum.zip_mut_with(s, |acc, &v| *acc += f64::from(v));
        }
        let mean = sum.mapv(|v| v / n);

        let mut sq = Array3::<f64>::zeros(first.raw_dim());
        for s in samples {
            ndarray::Zip::from(&mut sq)
                .and(s)
                .and(&mean)
                .for_each(|acc, &v, &m| *acc += (f64::from(v) - m).powi(2));
        }
        let std = sq.mapv(|v| (v / n).sqrt() as f32);

        Some(Self {
            mean: mean.mapv(|v| v as f32),
            std,
            samples: samples.len(),
        })
    }

    /// Mean relative spread, a rough confidence indicator in `[0, inf)`.
    pub fn mean_relative_spread(&self) -> f64 {
        let total = self.mean.len();
        if total == 0 {
            return 0.0;
        }
        let sum: f64 = ndarray::Zip::from(&self.mean)
            .and(&self.std)
            .fold(0.0, |acc, &m, &s| {
                acc + f64::from(s) / f64::from(m).abs().max(1e-7)
            });
        sum / total as f64
    }
}
