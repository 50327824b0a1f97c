//! Sliding-window sequence assembly and chronological splitting.

use ndarray::{Array3, s};
use thiserror::Error;

use crate::frame::{Frame, FrameError};

const RATIO_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("sequence_length and forecast_horizon must be positive")]
    ZeroLength,
    #[error("need at least {required} rows for one sequence, got {available}")]
    NotEnoughRows { required: usize, available: usize },
    #[error(transparent)]
    MissingColumn(#[from] FrameError),
    #[error("split ratios must each lie in [0, 1] and sum to 1.0, got {0}")]
    InvalidRatios(f64),
}

/// Input windows `(n, L, F)` and target windows `(n, H, T)`.
#[derive(Debug, Clone)]
pub struct Sequences {
    pub x: Array3<f32>,
    pub y: Array3<f32>,
}

impl Sequences {
    pub fn len(&self) -> usize {
        self.x.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stack sequence sets built from independent segments.
    pub fn concat(parts: &[Sequences]) -> Option<Sequences> {
        let xs: Vec<_> = parts.iter().map(|p| p.x.view()).collect();
        let ys: Vec<_> = parts.iter().map(|p| p.y.view()).collect();
        Some(Sequences {
            x: ndarray::concatenate(ndarray::Axis(0), &xs).ok()?,
            y: ndarray::concatenate(ndarray::Axis(0), &ys).ok()?,
        })
    }
}

/// Build stride-1 windows: `N - L - H + 1` samples.
pub fn make_sequences<S: AsRef<str>>(
    frame: &Frame,
    feature_names: &[S],
    target_names: &[S],
    sequence_length: usize,
    horizon: usize,
) -> Result<Sequences, SequenceError> {
    if sequence_length == 0 || horizon == 0 {
        return Err(SequenceError::ZeroLength);
    }
    let required = sequence_length + horizon;
    if frame.len() < required {
        return Err(SequenceError::NotEnoughRows {
            required,
            available: frame.len(),
        });
    }

    let features = feature_names
        .iter()
        .map(|n| frame.require(n.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    let targets = target_names
        .iter()
        .map(|n| frame.require(n.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    let n = frame.len() - required + 1;
    let x = Array3::from_shape_fn((n, sequence_length, features.len()), |(i, t, f)| {
        features[f][i + t] as f32
    });
    let y = Array3::from_shape_fn((n, horizon, targets.len()), |(i, h, k)| {
        targets[k][i + sequence_length + h] as f32
    });
    tracing::debug!(x = ?x.shape(), y = ?y.shape(), "Created sequences");
    Ok(Sequences { x, y })
}

/// The last `sequence_length` rows as a single `(1, L, F)` input window.
pub fn last_window<S: AsRef<str>>(
    frame: &Frame,
    feature_names: &[S],
    sequence_length: usize,
) -> Result<Array3<f32>, SequenceError> {
    if sequence_length == 0 {
        return Err(SequenceError::ZeroLength);
    }
    if frame.len() < sequence_length {
        return Err(SequenceError::NotEnoughRows {
            required: sequence_length,
            available: frame.len(),
        });
    }
    let start = frame.len() - sequence_length;
    let features = feature_names
        .iter()
        .map(|n| frame.require(n.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Array3::from_shape_fn((1, sequence_length, features.len()), |(_, t, f)| {
        features[f][start + t] as f32
    }))
}

/// Chronological train/validation/test split; never shuffled.
pub fn chronological_split(
    frame: &Frame,
    train_ratio: f64,
    val_ratio: f64,
    test_ratio: f64,
) -> Result<(Frame, Frame, Frame), SequenceError> {
    if let Some(&bad) = [train_ratio, val_ratio, test_ratio]
        .iter()
        .find(|r| !(0.0..=1.0).contains(*r))
    {
        return Err(SequenceError::InvalidRatios(bad));
    }
    let sum = train_ratio + val_ratio + test_ratio;
    if (sum - 1.0).abs() > RATIO_TOLERANCE {
        return Err(SequenceError::InvalidRatios(sum));
    }
    let sorted = frame.sort_chronologically()?;
    let n = sorted.len();
    let train_end = (n as f64 * train_ratio).floor() as usize;
    let val_end = ((n as f64 * (train_ratio + val_ratio)).floor() as usize).clamp(train_end, n);

    Ok((
        sorted.slice(0..train_end),
        sorted.slice(train_end..val_end),
        sorted.slice(val_end..n),
    ))
}

/// Flatten `(n, H, T)` to `(n * H, T)`.
pub fn flatten_horizon(y: &Array3<f32>) -> ndarray::Array2<f32> {
    let (n, h, t) = y.dim();
    y.to_owned()
        .into_shape_with_order((n * h, t))
        .unwrap_or_else(|_| ndarray::Array2::zeros((n * h, t)))
}

/// First `horizon` steps of every prediction.
pub fn truncate_horizon(y: &Array3<f32>, horizon: usize) -> Array3<f32> {
    let h = horizon.min(y.shape()[1]);
    y.slice(s![.., ..h, ..]).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(rows: usize) -> Frame {
        Frame::from_columns([
            ("year", vec![2024.0; rows]),
            ("month", vec![1.0; rows]),
            ("day", (0..rows).map(|i| (1 + i / 24) as f64).collect()),
            ("hour", (0..rows).map(|i| (i % 24) as f64).collect()),
            ("a", (0..rows).map(|i| i as f64).collect()),
            ("target", (0..rows).map(|i| 1000.0 + i as f64).collect()),
        ])
        .unwrap()
    }

    // ==================== Sequences ====================

    #[test]
    fn test_hundred_rows_give_seventy_six_sequences() {
        let seq = make_sequences(&ramp(100), &["a"], &["target"], 24, 1).unwrap();
        assert_eq!(seq.x.shape(), &[76, 24, 1]);
        assert_eq!(seq.y.shape(), &[76, 1, 1]);
    }

    #[test]
    fn test_windows_are_aligned() {
        let seq = make_sequences(&ramp(30), &["a"], &["target"], 5, 3).unwrap();
        assert_eq!(seq.x[[2, 0, 0]], 2.0);
        assert_eq!(seq.x[[2, 4, 0]], 6.0);
        assert_eq!(seq.y[[2, 0, 0]], 1007.0);
        assert_eq!(seq.y[[2, 2, 0]], 1009.0);
    }

    #[test]
    fn test_sequence_errors() {
        let frame = ramp(10);
        assert!(matches!(
            make_sequences(&frame, &["a"], &["target"], 0, 1),
            Err(SequenceError::ZeroLength)
        ));
        assert!(matches!(
            make_sequences(&frame, &["a"], &["target"], 8, 3),
            Err(SequenceError::NotEnoughRows { required: 11, available: 10 })
        ));
        assert!(matches!(
            make_sequences(&frame, &["missing"], &["target"], 2, 1),
            Err(SequenceError::MissingColumn(_))
        ));
    }

    #[test]
    fn test_last_window() {
        let w = last_window(&ramp(30), &["a"], 4).unwrap();
        assert_eq!(w.shape(), &[1, 4, 1]);
        assert_eq!(w[[0, 3, 0]], 29.0);
    }

    #[test]
    fn test_concat_segments() {
        let a = make_sequences(&ramp(10), &["a"], &["target"], 3, 1).unwrap();
        let b = make_sequences(&ramp(8), &["a"], &["target"], 3, 1).unwrap();
        let both = Sequences::concat(&[a, b]).unwrap();
        assert_eq!(both.len(), 7 + 5);
    }

    #[test]
    fn test_truncate_and_flatten() {
        let seq = make_sequences(&ramp(30), &["a"], &["target"], 5, 4).unwrap();
        let short = truncate_horizon(&seq.y, 2);
        assert_eq!(short.shape(), &[seq.len(), 2, 1]);
        assert_eq!(flatten_horizon(&short).shape(), &[seq.len() * 2, 1]);
    }

    // ==================== Split ====================

    #[test]
    fn test_split_rejects_bad_ratios() {
        assert!(matches!(
            chronological_split(&ramp(10), 0.5, 0.3, 0.3),
            Err(SequenceError::InvalidRatios(_))
        ));
    }

    #[test]
    fn test_split_rejects_negative_ratios_that_sum_to_one() {
        let frame = ramp(10);
        assert!(matches!(
            chronological_split(&frame, 1.2, -0.1, -0.1),
            Err(SequenceError::InvalidRatios(r)) if r == 1.2
        ));
        assert!(matches!(
            chronological_split(&frame, 0.6, 0.5, -0.1),
            Err(SequenceError::InvalidRatios(r)) if r == -0.1
        ));
        assert!(matches!(
            chronological_split(&frame, f64::NAN, 0.5, 0.5),
            Err(SequenceError::InvalidRatios(_))
        ));
    }

    #[test]
    fn test_split_accepts_empty_partitions() {
        let (train, val, test) = chronological_split(&ramp(10), 1.0, 0.0, 0.0).unwrap();
        assert_eq!((train.len(), val.len(), test.len()), (10, 0, 0));
    }

    #[test]
    fn test_split_drops_rows_without_timestamp() {
        let mut frame = ramp(10);
        let mut months = frame.column("month").unwrap().to_vec();
        months[9] = f64::NAN;
        frame.insert("month", months).unwrap();
        let (train, val, test) = chronological_split(&frame, 0.5, 0.25, 0.25).unwrap();
        assert_eq!(train.len() + val.len() + test.len(), 9);
        assert_eq!(test.column("a").unwrap().last(), Some(&8.0));
    }

    #[test]
    fn test_split_sorts_before_cutting() {
        let frame = ramp(20);
        let reversed: Vec<usize> = (0..20).rev().collect();
        let shuffled = frame.take(&reversed).unwrap();
        let (train, val, test) = chronological_split(&shuffled, 0.5, 0.25, 0.25).unwrap();
        assert_eq!(train.len(), 10);
        assert_eq!(val.len(), 5);
        assert_eq!(test.len(), 5);
        assert_eq!(train.column("a").unwrap()[0], 0.0);
        assert_eq!(test.column("a").unwrap()[4], 19.0);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn split_is_ordered_and_complete(
                rows in 1usize..300,
                train in 0.1f64..0.8,
                val_share in 0.0f64..1.0,
            ) {
                let val = (1.0 - train) * val_share;
                let test = 1.0 - train - val;
                let (tr, va, te) = chronological_split(&ramp(rows), train, val, test).unwrap();
                prop_assert_eq!(tr.len() + va.len() + te.len(), rows);

                let last = |f: &Frame| f.column("a").and_then(|c| c.last().copied());
                let first = |f: &Frame| f.column("a").and_then(|c| c.first().copied());
                if let (Some(a), Some(b)) = (last(&tr), first(&va)) {
                    prop_assert!(a < b);
                }
                if let (Some(a), Some(b)) = (last(&va), first(&te)) {
                    prop_assert!(a < b);
                }
            }

            #[test]
            fn sequence_count_matches_formula(
                rows in 2usize..200,
                l in 1usize..30,
                h in 1usize..10,
            ) {
                let result = make_sequences(&ramp(rows), &["a"], &["target"], l, h);
                if rows >= l + h {
                    let seq = result.unwrap();
                    prop_assert_eq!(seq.len(), rows - l - h + 1);
                    prop_assert_eq!(seq.x.shape()[1], l);
                    prop_assert_eq!(seq.y.shape()[1], h);
                } else {
                    prop_assert!(result.is_err());
                }
            }
        }
    }
}
