//! Time-series augmentation: Gaussian noise and time warping.

use ndarray::{Array3, Axis, concatenate, s};
use rand::Rng;
use rand::seq::SliceRandom;
use rand_distr::{Distribution, Normal, Uniform};

/// Expand a batch to `originals ++ noisy[..n/2] ++ warped[..n/4]`, shuffled.
///
/// Noise has standard deviation `std(X) * factor`. Warping resamples each
/// sequence at `floor(L * f)` evenly spaced positions with `f ~ U(0.95, 1.05)`
/// and pads with the last row or truncates back to `L`. Non-finite input is
/// returned unchanged.
pub fn augment<R: Rng + ?Sized>(
    x: &Array3<f32>,
    y: &Array3<f32>,
    factor: f64,
    rng: &mut R,
) -> (Array3<f32>, Array3<f32>) {
    let n = x.shape()[0];
    if n == 0 {
        return (x.clone(), y.clone());
    }
    if x.iter().any(|v| !v.is_finite()) {
        tracing::warn!("Non-finite values in augmentation input, skipping augmentation");
        return (x.clone(), y.clone());
    }

    let noisy = add_noise(x, factor, rng);
    let warped = time_warp(x, rng);

    let half = n / 2;
    let quarter = n / 4;
    let (x_all, y_all) = match (
        concatenate(
            Axis(0),
            &[x.view(), noisy.slice(s![..half, .., ..]), warped.slice(s![..quarter, .., ..])],
        ),
        concatenate(
            Axis(0),
            &[y.view(), y.slice(s![..half, .., ..]), y.slice(s![..quarter, .., ..])],
        ),
    ) {
        (Ok(xa), Ok(ya)) => (xa, ya),
        _ => return (x.clone(), y.clone()),
    };

    let mut order: Vec<usize> = (0..x_all.shape()[0]).collect();
    order.shuffle(rng);
    let x_out = x_all.select(Axis(0), &order);
    let y_out = y_all.select(Axis(0), &order);
    tracing::info!(from = ?x.shape(), to = ?x_out.shape(), "Data augmentation");
    (x_out, y_out)
}

fn add_noise<R: Rng + ?Sized>(x: &Array3<f32>, factor: f64, rng: &mut R) -> Array3<f32> {
    let values: Vec<f64> = x.iter().map(|&v| f64::from(v)).collect();
    let std = crate::series::std_dev(&values, 0) * factor;
    match Normal::new(0.0, std) {
        Ok(normal) if std > 0.0 => x.mapv(|v| v + normal.sample(rng) as f32),
        _ => x.clone(),
    }
}

fn time_warp<R: Rng + ?Sized>(x: &Array3<f32>, rng: &mut R) -> Array3<f32> {
    let (n, len, _) = x.dim();
    let warp = Uniform::new(0.95, 1.05);
    let mut out = x.clone();
    for i in 0..n {
        let new_len = (len as f64 * warp.sample(rng)).floor() as usize;
        if new_len == 0 {
            continue;
        }
        let indices = warp_indices(len, new_len);
        let sample = x.index_axis(Axis(0), i);
        let mut target = out.index_axis_mut(Axis(0), i);
        for t in 0..len {
            // Pad with the last resampled row
            let src = indices[t.min(indices.len() - 1)];
            target.row_mut(t).assign(&sample.row(src));
        }
    }
    out
}

/// `linspace(0, len - 1, new_len)` truncated to integers.
fn warp_indices(len: usize, new_len: usize) -> Vec<usize> {
    if new_len == 1 {
        return vec![0];
    }
    let step = (len - 1) as f64 / (new_len - 1) as f64;
    (0..new_len).map(|k| (k as f64 * step) as usize).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn batch(n: usize) -> (Array3<f32>, Array3<f32>) {
        let x = Array3::from_shape_fn((n, 10, 2), |(i, t, f)| (i * 100 + t * 2 + f) as f32);
        let y = Array3::from_shape_fn((n, 3, 1), |(i, h, _)| (i * 10 + h) as f32);
        (x, y)
    }

    #[test]
    fn test_augmented_size() {
        let (x, y) = batch(8);
        let mut rng = StdRng::seed_from_u64(7);
        let (xa, ya) = augment(&x, &y, 0.1, &mut rng);
        assert_eq!(xa.shape(), &[8 + 4 + 2, 10, 2]);
        assert_eq!(ya.shape(), &[14, 3, 1]);
    }

    #[test]
    fn test_non_finite_input_returned_unchanged() {
        let (mut x, y) = batch(4);
        x[[0, 0, 0]] = f32::NAN;
        let mut rng = StdRng::seed_from_u64(7);
        let (xa, ya) = augment(&x, &y, 0.1, &mut rng);
        assert_eq!(xa.shape(), x.shape());
        assert_eq!(ya, y);
    }

    #[test]
    fn test_warp_indices() {
        assert_eq!(warp_indices(10, 10), (0..10).collect::<Vec<_>>());
        let short = warp_indices(10, 9);
        assert_eq!(short.len(), 9);
        assert_eq!(short[0], 0);
        assert_eq!(short[8], 9);
        assert!(short.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_time_warp_keeps_shape() {
        let (x, _) = batch(5);
        let mut rng = StdRng::seed_from_u64(1);
        let warped = time_warp(&x, &mut rng);
        assert_eq!(warped.shape(), x.shape());
        // The first step is always the original first step
        for i in 0..5 {
            assert_eq!(warped[[i, 0, 0]], x[[i, 0, 0]]);
        }
    }

    #[test]
    fn test_same_seed_same_output() {
        let (x, y) = batch(6);
        let a = augment(&x, &y, 0.1, &mut StdRng::seed_from_u64(3));
        let b = augment(&x, &y, 0.1, &mut StdRng::seed_from_u64(3));
        assert_eq!(a.0, b.0);
        assert_eq!(a.1, b.1);
    }
}
