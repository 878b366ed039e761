use crate::common::*;

/// Builder of [Matcher].
///
/// `thresholds` split the quality range into `thresholds.len() + 1` bands,
/// closed below and open above, and `labels` assigns one of `-1` (ignore),
/// `0` (negative) or `1` (positive) to each band.
#[derive(Debug, Clone)]
pub struct MatcherInit {
    pub thresholds: Vec<R64>,
    pub labels: Vec<i64>,
    /// Promote every prediction tied for the best quality of some ground truth to positive.
    pub allow_low_quality_matches: bool,
}

impl MatcherInit {
    pub fn build(self) -> Result<Matcher> {
        let Self {
            thresholds,
            labels,
            allow_low_quality_matches,
        } = self;

        ensure!(!thresholds.is_empty(), "at least one threshold is required");
        ensure!(thresholds[0] > 0.0, "thresholds must be positive");
        ensure!(
            thresholds.windows(2).all(|pair| pair[0] <= pair[1]),
            "thresholds must be sorted in ascending order"
        );
        ensure!(
            labels.iter().all(|label| [-1, 0, 1].contains(label)),
            "labels must be one of -1, 0 or 1"
        );
        ensure!(
            labels.len() == thresholds.len() + 1,
            "expect {} labels for {} thresholds, but get {}",
            thresholds.len() + 1,
            thresholds.len(),
            labels.len()
        );

        let bounds: Vec<f64> = itertools::chain!(
            [f64::NEG_INFINITY],
            thresholds.iter().map(|threshold| threshold.raw()),
            [f64::INFINITY]
        )
        .collect();

        Ok(Matcher {
            bounds,
            labels,
            allow_low_quality_matches,
        })
    }
}

/// Assigns each prediction to at most one ground truth element.
#[derive(Debug, Clone)]
pub struct Matcher {
    bounds: Vec<f64>,
    labels: Vec<i64>,
    allow_low_quality_matches: bool,
}

/// The outcome of [Matcher::forward].
#[derive(Debug, Getters)]
pub struct MatchResult {
    /// Index of the best ground truth for each prediction, in shape `[N]`.
    #[get = "pub"]
    matches: Tensor,
    /// Label in `{-1, 0, 1}` of each prediction, in shape `[N]`.
    #[get = "pub"]
    labels: Tensor,
}

impl Matcher {
    /// Matches the `[M, N]` quality matrix of M ground truth and N predictions.
    pub fn forward(&self, quality: &Tensor) -> Result<MatchResult> {
        let (num_gt, num_pred) = quality.size2()?;
        let device = quality.device();

        if num_gt == 0 || num_pred == 0 {
            let matches = Tensor::zeros([num_pred], (Kind::Int64, device));
            let labels = Tensor::full([num_pred], self.labels[0], (Kind::Int8, device));
            return Ok(MatchResult { matches, labels });
        }

        ensure!(
            quality.min().double_value(&[]) >= 0.0,
            "the match quality matrix must be non-negative"
        );

        let (matched_vals, matches) = quality.max_dim(0, false);

        let labels = izip!(&self.labels, self.bounds.iter().tuple_windows()).fold(
            Tensor::ones([num_pred], (Kind::Int8, device)),
            |labels, (&label, (&low, &high))| {
                let band = matched_vals.ge(low).logical_and(&matched_vals.lt(high));
                labels.masked_fill(&band, label)
            },
        );

        let labels = if self.allow_low_quality_matches {
            let (highest_quality, _) = quality.max_dim(1, true);
            let pred_indices = quality.eq_tensor(&highest_quality).nonzero().select(1, 1);
            labels.index_fill(0, &pred_indices, 1)
        } else {
            labels
        };

        Ok(MatchResult { matches, labels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(allow_low_quality_matches: bool) -> Result<Matcher> {
        MatcherInit {
            thresholds: vec![r64(0.3), r64(0.7)],
            labels: vec![0, -1, 1],
            allow_low_quality_matches,
        }
        .build()
    }

    #[test]
    fn matcher_bands() -> Result<()> {
        let quality = Tensor::from_slice(&[
            0.1f32, 0.5, 0.8, 0.0, //
            0.2, 0.6, 0.1, 0.05,
        ])
        .view([2, 4]);

        let result = matcher(false)?.forward(&quality)?;
        assert_eq!(result.matches().to_i64_vec()?, vec![1, 1, 0, 1]);
        assert_eq!(result.labels().to_i64_vec()?, vec![0, -1, 1, 0]);
        Ok(())
    }

    #[test]
    fn matcher_low_quality_rescue() -> Result<()> {
        let quality = Tensor::from_slice(&[
            0.1f32, 0.2, 0.2, 0.0, //
            0.0, 0.9, 0.3, 0.0,
        ])
        .view([2, 4]);

        let result = matcher(true)?.forward(&quality)?;
        let labels = result.labels().to_i64_vec()?;
        // both columns tied at 0.2 for the first row become positive
        assert_eq!(labels, vec![0, 1, 1, 0]);

        // every ground truth row has a positive prediction among its best columns
        let (best, _) = quality.max_dim(1, true);
        let best_mask = quality.eq_tensor(&best);
        let positive = result.labels().eq(1).unsqueeze(0);
        let covered = best_mask.logical_and(&positive).any_dim(1, false);
        ensure!(covered.all().int64_value(&[]) == 1);
        Ok(())
    }

    #[test]
    fn matcher_without_ground_truth() -> Result<()> {
        let quality = Tensor::zeros([0, 5], (Kind::Float, Device::Cpu));
        let result = matcher(true)?.forward(&quality)?;
        assert_eq!(result.matches().to_i64_vec()?, vec![0; 5]);
        assert_eq!(result.labels().to_i64_vec()?, vec![0; 5]);
        assert_eq!(result.labels().kind(), Kind::Int8);
        Ok(())
    }

    #[test]
    fn matcher_rejects_bad_input() -> Result<()> {
        let quality = Tensor::from_slice(&[0.5f32, -0.1]).view([1, 2]);
        assert!(matcher(false)?.forward(&quality).is_err());

        let unsorted = MatcherInit {
            thresholds: vec![r64(0.7), r64(0.3)],
            labels: vec![0, -1, 1],
            allow_low_quality_matches: false,
        };
        assert!(unsorted.build().is_err());

        let bad_labels = MatcherInit {
            thresholds: vec![r64(0.5)],
            labels: vec![0, 2],
            allow_low_quality_matches: false,
        };
        assert!(bad_labels.build().is_err());

        let bad_count = MatcherInit {
            thresholds: vec![r64(0.5)],
            labels: vec![0],
            allow_low_quality_matches: false,
        };
        assert!(bad_count.build().is_err());
        Ok(())
    }
}
