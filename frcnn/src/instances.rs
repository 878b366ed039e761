//! Per-image collections flowing between the pipeline stages.

use crate::common::*;

/// Region proposals of one image.
#[derive(Debug, Getters)]
pub struct Proposals<B> {
    #[get = "pub"]
    pub(crate) boxes: B,
    /// Objectness logits in shape `[R]`.
    #[get = "pub"]
    pub(crate) objectness_logits: Tensor,
    #[get = "pub"]
    pub(crate) image_size: HW<i64>,
}

impl<B> Proposals<B>
where
    B: BoxSet,
{
    pub fn new(boxes: B, objectness_logits: Tensor, image_size: HW<i64>) -> Result<Self> {
        boxes.tensor().ensure_same_device(&objectness_logits)?;
        ensure!(
            objectness_logits.size() == [boxes.len()],
            "expect {} objectness logits, but get shape {:?}",
            boxes.len(),
            objectness_logits.size()
        );
        Ok(Self {
            boxes,
            objectness_logits,
            image_size,
        })
    }

    pub fn len(&self) -> i64 {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn index_select(&self, index: &Tensor) -> Self {
        Self {
            boxes: self.boxes.index_select(index),
            objectness_logits: self.objectness_logits.index_select(0, index),
            image_size: self.image_size,
        }
    }
}

/// Ground truth boxes and class ids of one image.
#[derive(Debug, Getters)]
pub struct Targets {
    #[get = "pub"]
    pub(crate) boxes: Boxes,
    /// Class ids in shape `[G]`.
    #[get = "pub"]
    pub(crate) classes: Tensor,
}

impl Targets {
    pub fn new(boxes: Boxes, classes: Tensor) -> Result<Self> {
        boxes.tensor().ensure_same_device(&classes)?;
        ensure!(
            classes.size() == [boxes.len()],
            "expect {} class ids, but get shape {:?}",
            boxes.len(),
            classes.size()
        );
        Ok(Self {
            boxes,
            classes: classes.to_kind(Kind::Int64),
        })
    }

    pub fn len(&self) -> i64 {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// Final detections of one image.
#[derive(Debug, Getters)]
pub struct Detections {
    #[get = "pub"]
    pub(crate) boxes: Boxes,
    #[get = "pub"]
    pub(crate) scores: Tensor,
    #[get = "pub"]
    pub(crate) classes: Tensor,
    /// The index of the proposal each detection was refined from.
    #[get = "pub"]
    pub(crate) proposal_indices: Tensor,
    /// Attribute probabilities `[D, num_attrs + 1]` when the predictor has an attribute branch.
    #[get = "pub"]
    pub(crate) attribute_scores: Option<Tensor>,
    #[get = "pub"]
    pub(crate) image_size: HW<i64>,
}

impl Detections {
    pub fn len(&self) -> i64 {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn index_select(&self, index: &Tensor) -> Self {
        Self {
            boxes: self.boxes.index_select(index),
            scores: self.scores.index_select(0, index),
            classes: self.classes.index_select(0, index),
            proposal_indices: self.proposal_indices.index_select(0, index),
            attribute_scores: self
                .attribute_scores
                .as_ref()
                .map(|scores| scores.index_select(0, index)),
            image_size: self.image_size,
        }
    }

    /// Copies the detections to host values owned by the caller.
    pub fn to_vec(&self) -> Result<Vec<Detection>> {
        let boxes = self.boxes.to_rects()?;
        let scores = self.scores.to_f32_vec()?;
        let classes = self.classes.to_i64_vec()?;

        let detections = izip!(boxes, scores, classes)
            .map(|(bbox, score, class)| Detection { bbox, class, score })
            .collect();
        Ok(detections)
    }
}

/// A single detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: XYXY<f32>,
    pub class: i64,
    pub score: f32,
}
