use crate::common::*;

/// Randomly picks a fixed quota of positive and negative examples.
///
/// Labels other than `-1` and `bg_label` are positive, `bg_label` is
/// negative and `-1` is ignored. At most `floor(num_samples *
/// positive_fraction)` positives are taken, and negatives fill the rest of
/// the quota as far as available. Sampling is uniform without replacement.
///
/// Returns the indices of the sampled positives and negatives.
pub fn subsample_labels(
    labels: &Tensor,
    num_samples: i64,
    positive_fraction: f64,
    bg_label: i64,
) -> Result<(Tensor, Tensor)> {
    ensure!(num_samples >= 0, "num_samples must be non-negative");
    ensure!(
        (0.0..=1.0).contains(&positive_fraction),
        "positive_fraction must be in range [0, 1], but get {}",
        positive_fraction
    );
    labels.size1()?;
    let device = labels.device();

    let positive = labels
        .ne(-1)
        .logical_and(&labels.ne(bg_label))
        .nonzero()
        .view([-1]);
    let negative = labels.eq(bg_label).nonzero().view([-1]);

    let num_pos = positive
        .numel()
        .min((num_samples as f64 * positive_fraction) as usize) as i64;
    let num_neg = negative.numel().min((num_samples - num_pos) as usize) as i64;

    let pick = |candidates: &Tensor, count: i64| {
        let perm = Tensor::randperm(candidates.size()[0], (Kind::Int64, device)).narrow(0, 0, count);
        candidates.index_select(0, &perm)
    };

    Ok((pick(&positive, num_pos), pick(&negative, num_neg)))
}
