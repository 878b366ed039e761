use crate::{common::*, instances::Detections};

/// Thresholds of the per-image detection filtering.
#[derive(Debug, Clone, Copy)]
pub struct InferenceParams {
    pub score_thresh: f64,
    pub nms_thresh: f64,
    /// Detections kept per image. A negative value keeps all of them.
    pub topk_per_image: i64,
}

/// Runs [fast_rcnn_inference_single_image] on every image.
pub fn fast_rcnn_inference(
    boxes: &[Tensor],
    scores: &[Tensor],
    image_sizes: &[HW<i64>],
    params: &InferenceParams,
) -> Result<Vec<Detections>> {
    ensure!(
        boxes.len() == scores.len() && boxes.len() == image_sizes.len(),
        "expect boxes, scores and image sizes of equal length, but get {}, {} and {}",
        boxes.len(),
        scores.len(),
        image_sizes.len()
    );
    izip!(boxes, scores, image_sizes)
        .map(|(boxes, scores, &image_size)| {
            fast_rcnn_inference_single_image(boxes, scores, image_size, params)
        })
        .try_collect()
}

/// Turns the predictions on the proposals of one image into final detections.
///
/// `boxes` are `[R, K * 4]` class-specific or `[R, 4]` class-agnostic
/// decoded boxes and `scores` are `[R, K + 1]` class probabilities with the
/// background last. Boxes are clipped into the image, (box, class) pairs
/// scoring above `score_thresh` are kept, suppressed per class and truncated
/// to `topk_per_image`.
pub fn fast_rcnn_inference_single_image(
    boxes: &Tensor,
    scores: &Tensor,
    image_size: HW<i64>,
    params: &InferenceParams,
) -> Result<Detections> {
    let InferenceParams {
        score_thresh,
        nms_thresh,
        topk_per_image,
    } = *params;
    boxes.ensure_same_device(scores)?;
    let (num_boxes, num_cols) = scores.size2()?;
    let (num_box_rows, box_cols) = boxes.size2()?;
    ensure!(num_cols >= 1, "scores need at least the background column");
    let num_classes = num_cols - 1;
    let num_reg_classes = box_cols / 4;
    ensure!(
        num_box_rows == num_boxes,
        "expect {} rows of boxes, but get {}",
        num_boxes,
        num_box_rows
    );
    ensure!(
        box_cols % 4 == 0 && (num_reg_classes == 1 || num_reg_classes == num_classes),
        "expect {} or 4 box columns, but get {}",
        num_classes * 4,
        box_cols
    );

    let scores = scores.narrow(1, 0, num_classes);
    let boxes = Boxes::from_tensor(boxes.reshape([-1, 4]))?.clip(&image_size)?;

    // row-major (row, class) pairs above the threshold
    let filter_inds = scores.gt(score_thresh).nonzero();
    let rows = filter_inds.select(1, 0);
    let classes = filter_inds.select(1, 1);

    let box_index = if num_reg_classes == 1 {
        rows.shallow_clone()
    } else {
        &rows * num_reg_classes + &classes
    };
    let boxes = boxes.index_select(&box_index);
    let scores = scores
        .reshape([-1])
        .index_select(0, &(&rows * num_classes + &classes));

    let keep = boxes.batched_nms(&scores, &classes, nms_thresh)?;
    let keep = if topk_per_image >= 0 {
        keep.narrow(0, 0, keep.size()[0].min(topk_per_image))
    } else {
        keep
    };
    debug!("{} detections after filtering", keep.size()[0]);

    Ok(Detections {
        boxes: boxes.index_select(&keep),
        scores: scores.index_select(0, &keep),
        classes: classes.index_select(0, &keep),
        proposal_indices: rows.index_select(0, &keep),
        attribute_scores: None,
        image_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(score_thresh: f64) -> InferenceParams {
        InferenceParams {
            score_thresh,
            nms_thresh: 0.5,
            topk_per_image: 100,
        }
    }

    fn two_boxes() -> (Tensor, Tensor) {
        let boxes = Tensor::from_slice(&[
            0f32, 0.0, 10.0, 10.0, 0.0, 0.0, 10.0, 10.0, 0.0, 0.0, 10.0, 10.0, //
            20.0, 20.0, 40.0, 40.0, 20.0, 20.0, 40.0, 40.0, 20.0, 20.0, 40.0, 40.0,
        ])
        .view([2, 12]);
        let scores = Tensor::from_slice(&[
            0.3f32, 0.0, 0.9, 0.0, //
            0.2, 0.1, 0.1, 0.6,
        ])
        .view([2, 4]);
        (boxes, scores)
    }

    #[test]
    fn inference_keeps_confident_class() -> Result<()> {
        let (boxes, scores) = two_boxes();
        let image_size = HW::try_from_hw([50, 50])?;

        let detections = fast_rcnn_inference_single_image(&boxes, &scores, image_size, &params(0.5))?;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections.classes().to_i64_vec()?, vec![2]);
        assert_eq!(detections.scores().to_f32_vec()?, vec![0.9]);
        assert_eq!(detections.proposal_indices().to_i64_vec()?, vec![0]);

        let detections = fast_rcnn_inference_single_image(&boxes, &scores, image_size, &params(0.95))?;
        ensure!(detections.is_empty());
        assert_eq!(detections.boxes().tensor().size(), vec![0, 4]);
        Ok(())
    }

    #[test]
    fn inference_suppresses_per_class() -> Result<()> {
        // three overlapping boxes; two share class 0
        let boxes = Tensor::from_slice(&[
            0f32, 0.0, 10.0, 10.0, //
            1.0, 0.0, 11.0, 10.0, //
            0.0, 1.0, 10.0, 11.0,
        ])
        .view([3, 4]);
        let scores = Tensor::from_slice(&[
            0.9f32, 0.0, 0.1, //
            0.8, 0.0, 0.2, //
            0.0, 0.7, 0.3,
        ])
        .view([3, 3]);
        let image_size = HW::try_from_hw([20, 20])?;

        let detections = fast_rcnn_inference_single_image(&boxes, &scores, image_size, &params(0.5))?;
        assert_eq!(detections.classes().to_i64_vec()?, vec![0, 1]);
        assert_eq!(detections.proposal_indices().to_i64_vec()?, vec![0, 2]);

        let top1 = InferenceParams {
            topk_per_image: 1,
            ..params(0.5)
        };
        let detections = fast_rcnn_inference_single_image(&boxes, &scores, image_size, &top1)?;
        assert_eq!(detections.len(), 1);

        let unbounded = InferenceParams {
            topk_per_image: -1,
            nms_thresh: 1.0,
            ..params(0.5)
        };
        let detections = fast_rcnn_inference_single_image(&boxes, &scores, image_size, &unbounded)?;
        assert_eq!(detections.len(), 3);
        Ok(())
    }

    #[test]
    fn inference_clips_boxes() -> Result<()> {
        let boxes = Tensor::from_slice(&[-5f32, -5.0, 30.0, 30.0]).view([1, 4]);
        let scores = Tensor::from_slice(&[0.9f32, 0.1]).view([1, 2]);
        let image_size = HW::try_from_hw([20, 25])?;

        let detections = fast_rcnn_inference(&[boxes], &[scores], &[image_size], &params(0.5))?;
        assert_eq!(
            detections[0].boxes().tensor().to_f32_vec()?,
            vec![0.0, 0.0, 25.0, 20.0]
        );
        Ok(())
    }
}
